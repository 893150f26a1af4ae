use std::time::Duration;

use async_trait::async_trait;

use crate::config::LandOccupationConfig;
use crate::errors::BotResult;
use crate::game::GameController;
use crate::tasks::{GameTask, TaskKind};

const START_INTERVAL: u64 = 10;
const MIN_INTERVAL: u64 = 5;
const MAX_INTERVAL: u64 = 30;
const FAILURE_BACKOFF: u64 = 5;

/// Occupies land until `target_count` plots are taken. The interval
/// shrinks after a success and grows after a miss.
pub struct LandOccupationTask {
    config: LandOccupationConfig,
    enabled: bool,
    interval_secs: u64,
    occupied: u32,
}

impl LandOccupationTask {
    pub fn new(config: LandOccupationConfig) -> Self {
        Self {
            enabled: config.enabled,
            config,
            interval_secs: START_INTERVAL,
            occupied: 0,
        }
    }

    pub fn occupied(&self) -> u32 {
        self.occupied
    }

    pub fn is_complete(&self) -> bool {
        self.occupied >= self.config.target_count
    }

    fn record(&mut self, success: bool) {
        self.interval_secs = if success {
            self.interval_secs.saturating_sub(1).max(MIN_INTERVAL)
        } else {
            (self.interval_secs + FAILURE_BACKOFF).min(MAX_INTERVAL)
        };
    }
}

#[async_trait]
impl GameTask for LandOccupationTask {
    fn kind(&self) -> TaskKind {
        TaskKind::LandOccupation
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    async fn execute(&mut self, controller: &GameController) -> BotResult<bool> {
        if self.is_complete() {
            self.enabled = false;
            return Ok(false);
        }
        tracing::info!(attempt = self.occupied + 1, target = self.config.target_count, "occupying land");
        let success = match controller
            .find_and_occupy_land(self.config.prefer_resources, self.config.max_distance)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                self.record(false);
                return Err(e);
            }
        };
        if success {
            self.occupied += 1;
            tracing::info!(occupied = self.occupied, target = self.config.target_count, "land occupied");
            if self.is_complete() {
                tracing::info!(target_count = self.config.target_count, "land target reached");
                self.enabled = false;
            }
        }
        self.record(success);
        Ok(success)
    }

    fn reset(&mut self) {
        if self.is_complete() {
            self.enabled = self.config.enabled;
        }
        self.occupied = 0;
        self.interval_secs = START_INTERVAL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_adapts_within_bounds() {
        let mut task = LandOccupationTask::new(LandOccupationConfig::default());
        assert_eq!(task.interval(), Duration::from_secs(10));
        for _ in 0..10 {
            task.record(true);
        }
        assert_eq!(task.interval(), Duration::from_secs(5));
        task.record(false);
        assert_eq!(task.interval(), Duration::from_secs(10));
        for _ in 0..10 {
            task.record(false);
        }
        assert_eq!(task.interval(), Duration::from_secs(30));
        task.reset();
        assert_eq!(task.interval(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn stops_after_target_count() {
        use crate::game::controller::tests::{controller_for, Scene};

        let scene = Scene::new(
            50,
            &[
                ("world_map", (0, 0, 20, 12)),
                ("empty_land", (70, 50, 12, 12)),
                ("army_select", (120, 20, 16, 10)),
                ("army_occupy", (120, 60, 16, 10)),
                ("confirm_button", (120, 100, 18, 10)),
            ],
        );
        let (screen, matcher) = scene.matcher();
        let (controller, handles) = controller_for(matcher, false).await;
        handles.push_gray(screen);

        let mut task = LandOccupationTask::new(LandOccupationConfig {
            target_count: 1,
            ..LandOccupationConfig::default()
        });
        assert!(task.execute(&controller).await.unwrap());
        assert_eq!(task.occupied(), 1);
        assert_eq!(task.interval(), Duration::from_secs(9));
        assert!(task.is_complete());
        assert!(!task.enabled());
        let taps = handles.taps().len();

        assert!(!task.execute(&controller).await.unwrap());
        assert_eq!(handles.taps().len(), taps);

        task.reset();
        assert!(task.enabled());
        assert_eq!(task.occupied(), 0);
    }
}
