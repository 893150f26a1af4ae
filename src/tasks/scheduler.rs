use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::config::TasksConfig;
use crate::game::GameController;
use crate::tasks::{
    ArmyMovementTask, GameTask, LandOccupationTask, ResourceCollectionTask, TaskKind, TaskSelection,
};

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskRunStats {
    pub runs: u64,
    pub successes: u64,
    pub misses: u64,
    pub errors: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub executed: usize,
    pub succeeded: usize,
    pub missed: usize,
    pub errors: usize,
}

impl CycleReport {
    /// A cycle that ran tasks and none of them succeeded.
    pub fn is_failure(&self) -> bool {
        self.executed > 0 && self.succeeded == 0
    }
}

/// Runs each enabled task once its interval has elapsed.
pub struct TaskScheduler {
    controller: Arc<GameController>,
    tasks: Vec<Box<dyn GameTask>>,
    last_run: HashMap<TaskKind, Instant>,
    stats: HashMap<TaskKind, TaskRunStats>,
}

impl TaskScheduler {
    pub fn new(controller: Arc<GameController>, tasks: Vec<Box<dyn GameTask>>) -> Self {
        for task in &tasks {
            tracing::info!(task = task.name(), enabled = task.enabled(), "task registered");
        }
        Self {
            controller,
            tasks,
            last_run: HashMap::new(),
            stats: HashMap::new(),
        }
    }

    pub fn from_config(controller: Arc<GameController>, config: &TasksConfig) -> Self {
        let tasks: Vec<Box<dyn GameTask>> = vec![
            Box::new(LandOccupationTask::new(config.land_occupation.clone())),
            Box::new(ArmyMovementTask::new(config.army_movement.clone())),
            Box::new(ResourceCollectionTask::new(config.resource_collection.clone())),
        ];
        Self::new(controller, tasks)
    }

    pub fn controller(&self) -> &Arc<GameController> {
        &self.controller
    }

    pub fn enable_only(&mut self, selection: TaskSelection) {
        for task in &mut self.tasks {
            let enabled = selection.includes(task.kind());
            task.set_enabled(enabled);
            tracing::info!(task = task.name(), enabled, "task selection");
        }
    }

    pub fn enabled_tasks(&self) -> Vec<TaskKind> {
        self.tasks.iter().filter(|t| t.enabled()).map(|t| t.kind()).collect()
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        for task in &mut self.tasks {
            if !task.enabled() {
                continue;
            }
            let kind = task.kind();
            if let Some(last) = self.last_run.get(&kind) {
                if last.elapsed() < task.interval() {
                    continue;
                }
            }

            tracing::debug!(task = task.name(), "running task");
            let outcome = task.execute(&self.controller).await;
            self.last_run.insert(kind, Instant::now());
            let stats = self.stats.entry(kind).or_default();
            stats.runs += 1;
            report.executed += 1;
            match outcome {
                Ok(true) => {
                    stats.successes += 1;
                    report.succeeded += 1;
                    tracing::info!(task = task.name(), "task succeeded");
                }
                Ok(false) => {
                    stats.misses += 1;
                    report.missed += 1;
                    tracing::warn!(task = task.name(), "task did not complete");
                }
                Err(e) => {
                    stats.errors += 1;
                    stats.last_error = Some(e.to_string());
                    report.errors += 1;
                    tracing::error!(task = task.name(), error = %e, "task failed");
                }
            }
        }
        report
    }

    pub fn stats(&self) -> HashMap<TaskKind, TaskRunStats> {
        self.stats.clone()
    }

    pub fn reset(&mut self) {
        for task in &mut self.tasks {
            task.reset();
        }
        self.last_run.clear();
        self.stats.clear();
    }
}
