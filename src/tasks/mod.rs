pub mod army;
pub mod land;
pub mod loop_control;
pub mod resource;
pub mod scheduler;
pub mod workflow;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::BotResult;
use crate::game::GameController;

pub use army::ArmyMovementTask;
pub use land::LandOccupationTask;
pub use loop_control::{LoopController, StopReason};
pub use resource::ResourceCollectionTask;
pub use scheduler::{CycleReport, TaskScheduler};
pub use workflow::{TaskCondition, TaskManager, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    LandOccupation,
    ArmyMovement,
    ResourceCollection,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::LandOccupation => "land_occupation",
            TaskKind::ArmyMovement => "army_movement",
            TaskKind::ResourceCollection => "resource_collection",
        }
    }
}

/// Which tasks `run --task` enables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TaskSelection {
    Land,
    Army,
    Resource,
    All,
}

impl TaskSelection {
    pub fn includes(&self, kind: TaskKind) -> bool {
        match self {
            TaskSelection::All => true,
            TaskSelection::Land => kind == TaskKind::LandOccupation,
            TaskSelection::Army => kind == TaskKind::ArmyMovement,
            TaskSelection::Resource => kind == TaskKind::ResourceCollection,
        }
    }
}

/// A periodic game chore run by the [`TaskScheduler`].
#[async_trait]
pub trait GameTask: Send {
    fn kind(&self) -> TaskKind;

    fn name(&self) -> &str {
        self.kind().as_str()
    }

    fn enabled(&self) -> bool;

    fn set_enabled(&mut self, enabled: bool);

    /// Minimum time between two executions.
    fn interval(&self) -> Duration;

    /// `Ok(false)` is an ordinary miss, `Err` a broken run.
    async fn execute(&mut self, controller: &GameController) -> BotResult<bool>;

    fn reset(&mut self);
}
