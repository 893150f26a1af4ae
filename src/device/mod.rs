pub mod command;
pub mod connector;
pub mod desktop;
#[cfg(test)]
pub mod mock;
pub mod network;
pub mod traits;
pub mod tunneld;
pub mod usb;
pub mod webdriver;

pub use connector::{ConnectorSettings, ConnectorStats, DeviceConnector};
pub use traits::DeviceBackend;
