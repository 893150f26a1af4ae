pub mod automation;
pub mod safety;

pub use automation::{AutomationService, AutomationStats};
pub use safety::{ActionApprover, FixedApprover, SafeMode, StdinApprover};
