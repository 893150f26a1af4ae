use std::time::Duration;

use async_trait::async_trait;

use crate::config::ArmyMovementConfig;
use crate::errors::BotResult;
use crate::game::GameController;
use crate::tasks::{GameTask, TaskKind};

/// Sends idle armies out according to the configured strategy.
pub struct ArmyMovementTask {
    config: ArmyMovementConfig,
    enabled: bool,
    moved: u32,
}

impl ArmyMovementTask {
    pub fn new(config: ArmyMovementConfig) -> Self {
        Self {
            enabled: config.enabled,
            config,
            moved: 0,
        }
    }

    pub fn moved(&self) -> u32 {
        self.moved
    }
}

#[async_trait]
impl GameTask for ArmyMovementTask {
    fn kind(&self) -> TaskKind {
        TaskKind::ArmyMovement
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.idle_army_check_interval)
    }

    async fn execute(&mut self, controller: &GameController) -> BotResult<bool> {
        tracing::info!(strategy = ?self.config.movement_strategy, "checking idle armies");
        let success = controller.move_idle_army(self.config.movement_strategy).await?;
        if success {
            self.moved += 1;
            tracing::info!(moved = self.moved, "army moved");
        }
        Ok(success)
    }

    fn reset(&mut self) {
        self.moved = 0;
    }
}
