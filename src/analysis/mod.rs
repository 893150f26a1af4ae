pub mod history;
pub mod manager;

pub use manager::{AnalysisManager, AnalysisRequest, AnalysisStats, ManagerSettings};
