use std::time::Duration;

use async_trait::async_trait;

use crate::config::ResourceCollectionConfig;
use crate::errors::BotResult;
use crate::game::GameController;
use crate::tasks::{GameTask, TaskKind};

pub struct ResourceCollectionTask {
    config: ResourceCollectionConfig,
    enabled: bool,
    collected: u32,
}

impl ResourceCollectionTask {
    pub fn new(config: ResourceCollectionConfig) -> Self {
        Self {
            enabled: config.enabled,
            config,
            collected: 0,
        }
    }

    pub fn collected(&self) -> u32 {
        self.collected
    }
}

#[async_trait]
impl GameTask for ResourceCollectionTask {
    fn kind(&self) -> TaskKind {
        TaskKind::ResourceCollection
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.collection_interval)
    }

    async fn execute(&mut self, controller: &GameController) -> BotResult<bool> {
        let success = controller.collect_resources().await?;
        if success {
            self.collected += 1;
            tracing::info!(collected = self.collected, "resources collected");
        }
        Ok(success)
    }

    fn reset(&mut self) {
        self.collected = 0;
    }
}
