pub mod assistant;
pub mod controller;

pub use assistant::{AssistantStats, GameAssistant};
pub use controller::{ControllerSettings, ControllerStats, GameController};
