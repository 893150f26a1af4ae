use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::device::DeviceConnector;
use crate::errors::{BotError, BotResult};
use crate::executor::safety::ActionApprover;
use crate::perception::types::{action_secs, Action, ActionType, ExecutionMode, ExecutionResult, Point};

const HISTORY_LIMIT: usize = 1000;
const RETRY_PAUSE: Duration = Duration::from_millis(200);

const DEFAULT_SWIPE_SECS: f64 = 1.0;
const DEFAULT_LONG_PRESS_SECS: f64 = 2.0;
const DEFAULT_WAIT_SECS: f64 = 1.0;

#[derive(Debug, Clone, Default, Serialize)]
pub struct AutomationStats {
    pub total_actions: u64,
    pub successful_actions: u64,
    pub failed_actions: u64,
    /// Seconds, running mean over every executed action.
    pub average_execution_time: f64,
}

/// Runs [`Action`]s against the device according to the execution mode.
pub struct AutomationService {
    device: Arc<DeviceConnector>,
    mode: Mutex<ExecutionMode>,
    approver: Arc<dyn ActionApprover>,
    stats: Mutex<AutomationStats>,
    history: Mutex<Vec<ExecutionResult>>,
}

impl AutomationService {
    pub fn new(device: Arc<DeviceConnector>, mode: ExecutionMode, approver: Arc<dyn ActionApprover>) -> Self {
        Self {
            device,
            mode: Mutex::new(mode),
            approver,
            stats: Mutex::new(AutomationStats::default()),
            history: Mutex::new(Vec::new()),
        }
    }

    pub async fn mode(&self) -> ExecutionMode {
        *self.mode.lock().await
    }

    pub async fn set_mode(&self, mode: ExecutionMode) {
        *self.mode.lock().await = mode;
        tracing::info!(?mode, "execution mode changed");
    }

    pub async fn execute_action(&self, action: &Action) -> ExecutionResult {
        let started = Instant::now();
        let mode = self.mode().await;

        let outcome = match action.validate() {
            Err(e) => Err(e),
            Ok(()) => match mode {
                ExecutionMode::Suggest => {
                    tracing::info!(
                        action = ?action.action_type,
                        position = ?action.target_position(),
                        description = %action.description,
                        "suggested action"
                    );
                    Ok(())
                }
                ExecutionMode::Confirm => {
                    if self.approver.approve(action).await {
                        self.perform(action).await
                    } else {
                        Err(BotError::Action("action rejected by user".into()))
                    }
                }
                ExecutionMode::Auto => self.perform(action).await,
            },
        };

        let execution_time = started.elapsed().as_secs_f64();
        let result = ExecutionResult {
            success: outcome.is_ok(),
            action: action.clone(),
            execution_time,
            error: outcome.err().map(|e| e.to_string()),
            timestamp: Utc::now(),
        };

        {
            let mut stats = self.stats.lock().await;
            stats.total_actions += 1;
            if mode != ExecutionMode::Suggest {
                if result.success {
                    stats.successful_actions += 1;
                } else {
                    stats.failed_actions += 1;
                }
            }
            let n = stats.total_actions as f64;
            stats.average_execution_time = (stats.average_execution_time * (n - 1.0) + execution_time) / n;
        }
        {
            let mut history = self.history.lock().await;
            history.push(result.clone());
            if history.len() > HISTORY_LIMIT {
                let excess = history.len() - HISTORY_LIMIT;
                history.drain(..excess);
            }
        }

        if let Some(err) = &result.error {
            tracing::warn!(action = ?action.action_type, error = %err, "action failed");
        }
        result
    }

    /// Runs actions in order. A failed action with `stop_on_failure` ends
    /// the batch.
    pub async fn execute_actions(&self, actions: &[Action]) -> Vec<ExecutionResult> {
        let mut results = Vec::with_capacity(actions.len());
        for (i, action) in actions.iter().enumerate() {
            tracing::debug!(step = i + 1, total = actions.len(), action = ?action.action_type, "executing");
            let result = self.execute_action(action).await;
            let stop = !result.success && action.stop_on_failure;
            results.push(result);
            if stop {
                tracing::warn!(step = i + 1, "batch stopped after failure");
                break;
            }
            match action_secs(action.delay_after, "delay_after") {
                Ok(pause) if !pause.is_zero() => tokio::time::sleep(pause).await,
                Ok(_) => {}
                Err(e) => tracing::warn!(step = i + 1, error = %e, "delay skipped"),
            }
        }
        results
    }

    async fn perform(&self, action: &Action) -> BotResult<()> {
        let position = action.target_position();
        match action.action_type {
            ActionType::Tap => {
                let p = required(position, "tap")?;
                self.with_retries(action, move || self.device.tap(p.x, p.y)).await
            }
            ActionType::Swipe => {
                let from = required(position, "swipe")?;
                let to = action
                    .param_point("target_position")
                    .ok_or_else(|| BotError::Validation("swipe needs a target_position parameter".into()))?;
                let duration = seconds(action, DEFAULT_SWIPE_SECS)?;
                self.with_retries(action, move || self.device.swipe(from, to, duration)).await
            }
            ActionType::LongPress => {
                let p = required(position, "long_press")?;
                let duration = seconds(action, DEFAULT_LONG_PRESS_SECS)?;
                self.with_retries(action, move || self.device.long_press(p, duration)).await
            }
            ActionType::Home => self.with_retries(action, move || self.device.home()).await,
            ActionType::Back => {
                let p = position.ok_or_else(|| BotError::Action("back needs a back_button target".into()))?;
                self.with_retries(action, move || self.device.tap(p.x, p.y)).await
            }
            ActionType::Wait => {
                tokio::time::sleep(seconds(action, DEFAULT_WAIT_SECS)?).await;
                Ok(())
            }
            ActionType::TypeText => Err(BotError::Action("text input is not supported".into())),
        }
    }

    /// Bounds each attempt by the action timeout and tries `retry_count`
    /// times in total.
    async fn with_retries<F, Fut>(&self, action: &Action, mut call: F) -> BotResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BotResult<()>>,
    {
        let attempts = action.retry_count.max(1);
        let timeout = action_secs(action.timeout, "timeout")?;
        let mut last_err = None;
        for attempt in 1..=attempts {
            let err = match tokio::time::timeout(timeout, call()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => BotError::Timeout(format!("{:?} exceeded {}s", action.action_type, action.timeout)),
            };
            tracing::debug!(attempt, attempts, error = %err, "device call failed");
            last_err = Some(err);
            if attempt < attempts {
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }
        Err(last_err.unwrap_or_else(|| BotError::Action("no attempts made".into())))
    }

    pub async fn stats(&self) -> AutomationStats {
        self.stats.lock().await.clone()
    }

    /// Most recent results, oldest first.
    pub async fn history(&self, limit: Option<usize>) -> Vec<ExecutionResult> {
        let history = self.history.lock().await;
        let skip = limit.map_or(0, |n| history.len().saturating_sub(n));
        history[skip..].to_vec()
    }

    pub async fn clear_history(&self) {
        self.history.lock().await.clear();
    }
}

fn required(position: Option<Point>, what: &str) -> BotResult<Point> {
    position.ok_or_else(|| BotError::Validation(format!("{what} needs a position")))
}

fn seconds(action: &Action, default: f64) -> BotResult<Duration> {
    action_secs(action.param_f64("duration").unwrap_or(default), "duration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::connector::tests::connected_mock;
    use crate::device::mock::Gesture;
    use crate::executor::safety::FixedApprover;
    use crate::perception::types::{Element, ElementType, Rect};

    async fn service(mode: ExecutionMode, approve: bool) -> (AutomationService, crate::device::mock::MockHandles) {
        let (connector, handles) = connected_mock((1000, 800)).await;
        let svc = AutomationService::new(Arc::new(connector), mode, Arc::new(FixedApprover(approve)));
        (svc, handles)
    }

    #[tokio::test]
    async fn suggest_mode_never_touches_device() {
        let (svc, handles) = service(ExecutionMode::Suggest, true).await;
        let result = svc.execute_action(&Action::tap(10, 20).described("open map")).await;
        assert!(result.success);
        assert!(handles.gestures().is_empty());
        let stats = svc.stats().await;
        assert_eq!(stats.total_actions, 1);
        assert_eq!(stats.successful_actions, 0);
        assert_eq!(stats.failed_actions, 0);
    }

    #[tokio::test]
    async fn auto_mode_executes_gestures_with_defaults() {
        let (svc, handles) = service(ExecutionMode::Auto, true).await;
        let mut swipe = Action::new(ActionType::Swipe)
            .at(Point::new(0, 0))
            .with_param("target_position", serde_json::json!([50, 60]));
        swipe.retry_count = 1;
        let press = Action::new(ActionType::LongPress).at(Point::new(5, 5));
        for action in [Action::tap(1, 2), swipe, press, Action::home()] {
            assert!(svc.execute_action(&action).await.success);
        }
        assert_eq!(
            handles.gestures(),
            vec![
                Gesture::Tap(1, 2),
                Gesture::Swipe(Point::new(0, 0), Point::new(50, 60), Duration::from_secs(1)),
                Gesture::LongPress(Point::new(5, 5), Duration::from_secs(2)),
                Gesture::Home,
            ]
        );
        assert_eq!(svc.stats().await.successful_actions, 4);
    }

    #[tokio::test]
    async fn tap_is_retried() {
        let (svc, handles) = service(ExecutionMode::Auto, true).await;
        *handles.fail_taps.lock().unwrap() = 2;
        assert!(svc.execute_action(&Action::tap(3, 4)).await.success);
        assert_eq!(handles.taps(), vec![(3, 4)]);

        *handles.fail_taps.lock().unwrap() = 5;
        let mut once = Action::tap(3, 4);
        once.retry_count = 1;
        let result = svc.execute_action(&once).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("mock tap failure"));
    }

    #[tokio::test]
    async fn confirm_mode_rejection_fails() {
        let (svc, handles) = service(ExecutionMode::Confirm, false).await;
        let result = svc.execute_action(&Action::tap(1, 1)).await;
        assert!(!result.success);
        assert!(handles.gestures().is_empty());
        assert_eq!(svc.stats().await.failed_actions, 1);

        svc.set_mode(ExecutionMode::Auto).await;
        assert!(svc.execute_action(&Action::tap(1, 1)).await.success);
    }

    #[tokio::test]
    async fn back_and_type_text() {
        let (svc, handles) = service(ExecutionMode::Auto, true).await;
        assert!(!svc.execute_action(&Action::new(ActionType::Back)).await.success);
        let back = Element::new("back_button", Rect::new(10, 10, 20, 20), 0.9, ElementType::Button);
        assert!(svc.execute_action(&Action::new(ActionType::Back).on(back)).await.success);
        assert_eq!(handles.taps(), vec![(20, 20)]);
        let typed = Action::new(ActionType::TypeText).at(Point::new(1, 1));
        assert!(!svc.execute_action(&typed).await.success);
    }

    #[tokio::test]
    async fn invalid_action_fails_without_device_call() {
        let (svc, handles) = service(ExecutionMode::Auto, true).await;
        let result = svc.execute_action(&Action::new(ActionType::Tap)).await;
        assert!(!result.success);
        assert!(handles.gestures().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_durations_fail_instead_of_panicking() {
        let (svc, handles) = service(ExecutionMode::Auto, true).await;
        let press = Action::new(ActionType::LongPress)
            .at(Point::new(5, 5))
            .with_param("duration", serde_json::json!(1e20));
        let result = svc.execute_action(&press).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("duration"));

        let mut forever = Action::tap(1, 1);
        forever.timeout = f64::INFINITY;
        assert!(!svc.execute_action(&forever).await.success);

        let mut negative = Action::tap(1, 1);
        negative.delay_after = -1.0;
        assert!(!svc.execute_action(&negative).await.success);
        assert!(handles.gestures().is_empty());
    }

    #[tokio::test]
    async fn batch_stops_on_flagged_failure() {
        let (svc, handles) = service(ExecutionMode::Auto, true).await;
        let mut failing = Action::new(ActionType::TypeText).at(Point::new(1, 1));
        failing.stop_on_failure = true;
        let mut first = Action::tap(1, 1);
        first.delay_after = 0.01;
        let results = svc.execute_actions(&[first, failing, Action::tap(2, 2)]).await;
        assert_eq!(results.len(), 2);
        assert_eq!(handles.taps(), vec![(1, 1)]);

        let tolerant = Action::new(ActionType::TypeText).at(Point::new(1, 1));
        let results = svc.execute_actions(&[tolerant, Action::tap(2, 2)]).await;
        assert_eq!(results.len(), 2);
        assert!(results[1].success);
    }

    #[tokio::test]
    async fn history_limit_and_clear() {
        let (svc, _) = service(ExecutionMode::Suggest, true).await;
        for i in 0..5 {
            svc.execute_action(&Action::tap(i, i)).await;
        }
        let recent = svc.history(Some(2)).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].action.position, Some(Point::new(4, 4)));
        assert_eq!(svc.history(None).await.len(), 5);
        svc.clear_history().await;
        assert!(svc.history(None).await.is_empty());
        assert!(svc.stats().await.average_execution_time >= 0.0);
    }
}
