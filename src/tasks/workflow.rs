//! Named multi-step workflows: actions, waits and screen conditions run in
//! order with per-step retries and an overall time limit.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::errors::{BotError, BotResult};
use crate::executor::AutomationService;
use crate::game::GameController;
use crate::perception::types::{Action, ActionType, ScreenType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

pub type CustomCheck =
    Arc<dyn for<'a> Fn(&'a GameController) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> + Send + Sync>;

#[derive(Clone)]
pub enum ConditionType {
    ElementExists(String),
    ElementNotExists(String),
    ScreenType(ScreenType),
    Custom(CustomCheck),
}

impl std::fmt::Debug for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::ElementExists(n) => f.debug_tuple("ElementExists").field(n).finish(),
            ConditionType::ElementNotExists(n) => f.debug_tuple("ElementNotExists").field(n).finish(),
            ConditionType::ScreenType(s) => f.debug_tuple("ScreenType").field(s).finish(),
            ConditionType::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskCondition {
    pub condition: ConditionType,
    pub timeout: Duration,
    pub check_interval: Duration,
    pub description: String,
}

impl TaskCondition {
    pub fn new(condition: ConditionType, description: impl Into<String>) -> Self {
        Self {
            condition,
            timeout: Duration::from_secs(10),
            check_interval: Duration::from_secs(1),
            description: description.into(),
        }
    }

    pub fn element_exists(name: &str) -> Self {
        Self::new(ConditionType::ElementExists(name.into()), format!("wait for {name}"))
    }

    pub fn element_not_exists(name: &str) -> Self {
        Self::new(ConditionType::ElementNotExists(name.into()), format!("wait for {name} to go away"))
    }

    pub fn screen_type(screen: ScreenType) -> Self {
        Self::new(ConditionType::ScreenType(screen), format!("wait for the {screen} screen"))
    }

    pub fn custom(description: &str, check: CustomCheck) -> Self {
        Self::new(ConditionType::Custom(check), description)
    }

    pub fn with_timing(mut self, timeout: Duration, check_interval: Duration) -> Self {
        self.timeout = timeout;
        self.check_interval = check_interval;
        self
    }
}

#[derive(Debug, Clone)]
pub enum StepKind {
    Action(Action),
    Condition(TaskCondition),
    Wait(Duration),
    /// Waits for the element, then taps its center.
    TapElement(String),
}

#[derive(Debug, Clone)]
pub struct TaskStep {
    pub name: String,
    pub kind: StepKind,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub stop_on_failure: bool,
    pub description: String,
    pub status: TaskStatus,
    pub error: Option<String>,
}

impl TaskStep {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            stop_on_failure: true,
            description: String::new(),
            status: TaskStatus::Pending,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowTask {
    pub id: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<TaskStep>,
    pub status: TaskStatus,
    pub current_step: usize,
    pub max_execution_time: Duration,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub current_step: usize,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub percentage: f64,
    pub error: Option<String>,
    /// Seconds.
    pub execution_time: Option<f64>,
}

struct Entry {
    task: WorkflowTask,
    cancel: watch::Sender<bool>,
}

pub struct TaskManager {
    controller: Arc<GameController>,
    automation: Arc<AutomationService>,
    tasks: StdMutex<HashMap<String, Entry>>,
    order: StdMutex<Vec<String>>,
}

enum StepOutcome {
    Done,
    Failed(String),
    Cancelled,
}

/// Sleeps unless cancelled first. Returns `true` on cancellation.
async fn cancellable_sleep(duration: Duration, cancel: &watch::Receiver<bool>) -> bool {
    let mut rx = cancel.clone();
    let cancelled = async move {
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    };
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancelled => true,
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl TaskManager {
    pub fn new(controller: Arc<GameController>, automation: Arc<AutomationService>) -> Self {
        Self {
            controller,
            automation,
            tasks: StdMutex::new(HashMap::new()),
            order: StdMutex::new(Vec::new()),
        }
    }

    pub fn create_task(&self, id: &str, name: &str, description: &str) -> BotResult<()> {
        let mut tasks = lock(&self.tasks);
        if tasks.contains_key(id) {
            return Err(BotError::Task(format!("task {id} already exists")));
        }
        let (cancel, _) = watch::channel(false);
        tasks.insert(
            id.to_string(),
            Entry {
                task: WorkflowTask {
                    id: id.to_string(),
                    name: name.to_string(),
                    description: description.to_string(),
                    steps: Vec::new(),
                    status: TaskStatus::Pending,
                    current_step: 0,
                    max_execution_time: Duration::from_secs(300),
                    error: None,
                    started_at: None,
                    finished_at: None,
                },
                cancel,
            },
        );
        lock(&self.order).push(id.to_string());
        tracing::info!(task_id = id, name, "workflow created");
        Ok(())
    }

    fn with_task<R>(&self, id: &str, f: impl FnOnce(&mut WorkflowTask) -> R) -> BotResult<R> {
        let mut tasks = lock(&self.tasks);
        let entry = tasks
            .get_mut(id)
            .ok_or_else(|| BotError::Task(format!("task {id} does not exist")))?;
        Ok(f(&mut entry.task))
    }

    pub fn add_step(&self, id: &str, step: TaskStep) -> BotResult<()> {
        self.with_task(id, |task| {
            if task.status == TaskStatus::Running {
                return Err(BotError::Task(format!("task {id} is running")));
            }
            tracing::debug!(task_id = id, step = %step.name, "step added");
            task.steps.push(step);
            Ok(())
        })?
    }

    pub fn set_max_execution_time(&self, id: &str, limit: Duration) -> BotResult<()> {
        self.with_task(id, |task| task.max_execution_time = limit)
    }

    pub fn add_action_step(&self, id: &str, name: &str, action: Action, stop_on_failure: bool) -> BotResult<()> {
        let mut step = TaskStep::new(name, StepKind::Action(action));
        step.stop_on_failure = stop_on_failure;
        self.add_step(id, step)
    }

    pub fn add_condition_step(&self, id: &str, name: &str, condition: TaskCondition, stop_on_failure: bool) -> BotResult<()> {
        let mut step = TaskStep::new(name, StepKind::Condition(condition.clone()));
        step.timeout = condition.timeout;
        step.description = condition.description;
        step.stop_on_failure = stop_on_failure;
        self.add_step(id, step)
    }

    pub fn add_wait_step(&self, id: &str, name: &str, duration: Duration) -> BotResult<()> {
        let mut step = TaskStep::new(name, StepKind::Wait(duration));
        step.retry_count = 1;
        step.stop_on_failure = false;
        step.description = format!("wait {:.1}s", duration.as_secs_f64());
        self.add_step(id, step)
    }

    pub fn add_tap_element_step(&self, id: &str, name: &str, element: &str, timeout: Duration) -> BotResult<()> {
        let mut step = TaskStep::new(name, StepKind::TapElement(element.to_string()));
        step.timeout = timeout;
        step.description = format!("tap {element}");
        self.add_step(id, step)
    }

    pub async fn execute_task(&self, id: &str) -> BotResult<bool> {
        let (steps, limit, cancel) = {
            let mut tasks = lock(&self.tasks);
            let entry = tasks
                .get_mut(id)
                .ok_or_else(|| BotError::Task(format!("task {id} does not exist")))?;
            if entry.task.status == TaskStatus::Running {
                tracing::warn!(task_id = id, "workflow already running");
                return Ok(false);
            }
            entry.cancel.send_replace(false);
            let task = &mut entry.task;
            task.status = TaskStatus::Running;
            task.current_step = 0;
            task.error = None;
            task.started_at = Some(Utc::now());
            task.finished_at = None;
            for step in &mut task.steps {
                step.status = TaskStatus::Pending;
                step.error = None;
            }
            (task.steps.clone(), task.max_execution_time, entry.cancel.subscribe())
        };

        tracing::info!(task_id = id, steps = steps.len(), "workflow started");
        let started = Instant::now();
        let mut final_status = TaskStatus::Completed;
        let mut final_error = None;

        for (i, step) in steps.iter().enumerate() {
            if *cancel.borrow() {
                final_status = TaskStatus::Cancelled;
                break;
            }
            self.with_task(id, |t| {
                t.current_step = i;
                t.steps[i].status = TaskStatus::Running;
            })?;
            tracing::info!(task_id = id, step = i + 1, total = steps.len(), name = %step.name, "running step");

            let outcome = self.run_step(step, &cancel).await;
            let (status, error) = match &outcome {
                StepOutcome::Done => (TaskStatus::Completed, None),
                StepOutcome::Failed(e) => (TaskStatus::Failed, Some(e.clone())),
                StepOutcome::Cancelled => (TaskStatus::Cancelled, None),
            };
            self.with_task(id, |t| {
                t.steps[i].status = status;
                t.steps[i].error = error.clone();
            })?;

            match outcome {
                StepOutcome::Cancelled => {
                    final_status = TaskStatus::Cancelled;
                    break;
                }
                StepOutcome::Failed(e) if step.stop_on_failure => {
                    tracing::error!(task_id = id, step = %step.name, error = %e, "step failed; stopping workflow");
                    final_status = TaskStatus::Failed;
                    final_error = Some(e);
                    break;
                }
                StepOutcome::Failed(e) => {
                    tracing::warn!(task_id = id, step = %step.name, error = %e, "step failed; continuing");
                }
                StepOutcome::Done => {}
            }

            if started.elapsed() > limit {
                tracing::error!(task_id = id, limit_s = limit.as_secs(), "workflow timed out");
                final_status = TaskStatus::Failed;
                final_error = Some(format!("workflow exceeded {}s", limit.as_secs()));
                break;
            }
        }

        self.with_task(id, |t| {
            if t.status != TaskStatus::Cancelled {
                t.status = final_status;
            }
            t.error = final_error;
            t.finished_at = Some(Utc::now());
            final_status = t.status;
        })?;
        tracing::info!(task_id = id, status = ?final_status, elapsed_s = started.elapsed().as_secs_f32(), "workflow finished");
        Ok(final_status == TaskStatus::Completed)
    }

    async fn run_step(&self, step: &TaskStep, cancel: &watch::Receiver<bool>) -> StepOutcome {
        match &step.kind {
            StepKind::Action(action) => self.run_action(step, action, cancel).await,
            StepKind::Wait(duration) => {
                if cancellable_sleep(*duration, cancel).await {
                    StepOutcome::Cancelled
                } else {
                    StepOutcome::Done
                }
            }
            StepKind::Condition(condition) => {
                self.wait_condition(&condition.condition, step.timeout, condition.check_interval, cancel)
                    .await
            }
            StepKind::TapElement(name) => {
                let interval = Duration::from_secs(1).min(step.timeout);
                let found = self
                    .wait_condition(&ConditionType::ElementExists(name.clone()), step.timeout, interval, cancel)
                    .await;
                if !matches!(found, StepOutcome::Done) {
                    return found;
                }
                match self.controller.find(name).await {
                    Ok(Some(el)) => {
                        let tap = Action::new(ActionType::Tap)
                            .on(el)
                            .described(format!("tap {name}"));
                        self.run_action(step, &tap, cancel).await
                    }
                    Ok(None) => StepOutcome::Failed(format!("{name} disappeared before the tap")),
                    Err(e) => StepOutcome::Failed(e.to_string()),
                }
            }
        }
    }

    async fn run_action(&self, step: &TaskStep, action: &Action, cancel: &watch::Receiver<bool>) -> StepOutcome {
        let attempts = step.retry_count.max(1);
        let mut last_error = String::from("no attempts made");
        for attempt in 1..=attempts {
            if attempt > 1 {
                tracing::debug!(step = %step.name, attempt, attempts, "retrying step");
                if cancellable_sleep(step.retry_delay, cancel).await {
                    return StepOutcome::Cancelled;
                }
            }
            match tokio::time::timeout(step.timeout, self.automation.execute_action(action)).await {
                Ok(result) if result.success => return StepOutcome::Done,
                Ok(result) => last_error = result.error.unwrap_or_else(|| "action failed".into()),
                Err(_) => last_error = format!("step exceeded {}s", step.timeout.as_secs_f32()),
            }
        }
        StepOutcome::Failed(last_error)
    }

    async fn check(&self, condition: &ConditionType) -> BotResult<bool> {
        Ok(match condition {
            ConditionType::ElementExists(name) => self.controller.find(name).await?.is_some(),
            ConditionType::ElementNotExists(name) => self.controller.find(name).await?.is_none(),
            ConditionType::ScreenType(screen) => self.controller.analyze_screen(true).await?.screen_type == *screen,
            ConditionType::Custom(check) => check(&self.controller).await,
        })
    }

    async fn wait_condition(
        &self,
        condition: &ConditionType,
        timeout: Duration,
        interval: Duration,
        cancel: &watch::Receiver<bool>,
    ) -> StepOutcome {
        let started = Instant::now();
        loop {
            match self.check(condition).await {
                Ok(true) => return StepOutcome::Done,
                Ok(false) => {}
                Err(e) => tracing::warn!(?condition, error = %e, "condition check failed"),
            }
            if started.elapsed() + interval > timeout {
                return StepOutcome::Failed(format!(
                    "condition {condition:?} timed out after {:.1}s",
                    timeout.as_secs_f64()
                ));
            }
            if cancellable_sleep(interval, cancel).await {
                return StepOutcome::Cancelled;
            }
        }
    }

    /// Only a running task can be cancelled.
    pub fn cancel_task(&self, id: &str) -> bool {
        let mut tasks = lock(&self.tasks);
        let Some(entry) = tasks.get_mut(id) else {
            tracing::warn!(task_id = id, "cancel: no such task");
            return false;
        };
        if entry.task.status != TaskStatus::Running {
            tracing::warn!(task_id = id, status = ?entry.task.status, "cancel: task is not running");
            return false;
        }
        entry.task.status = TaskStatus::Cancelled;
        entry.cancel.send_replace(true);
        tracing::info!(task_id = id, "workflow cancelled");
        true
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        lock(&self.tasks).get(id).map(|e| e.task.status)
    }

    pub fn task(&self, id: &str) -> Option<WorkflowTask> {
        lock(&self.tasks).get(id).map(|e| e.task.clone())
    }

    pub fn progress(&self, id: &str) -> Option<TaskProgress> {
        let tasks = lock(&self.tasks);
        let task = &tasks.get(id)?.task;
        let total = task.steps.len();
        let completed = task
            .steps
            .iter()
            .filter(|s| s.status == TaskStatus::Completed)
            .count();
        let execution_time = task.started_at.map(|start| {
            let end = task.finished_at.unwrap_or_else(Utc::now);
            (end - start).num_milliseconds() as f64 / 1000.0
        });
        Some(TaskProgress {
            id: task.id.clone(),
            name: task.name.clone(),
            status: task.status,
            current_step: task.current_step,
            total_steps: total,
            completed_steps: completed,
            percentage: if total == 0 { 0.0 } else { completed as f64 * 100.0 / total as f64 },
            error: task.error.clone(),
            execution_time,
        })
    }

    /// Task ids in creation order.
    pub fn list_tasks(&self) -> Vec<String> {
        lock(&self.order).clone()
    }

    pub fn remove_task(&self, id: &str) -> BotResult<()> {
        let mut tasks = lock(&self.tasks);
        match tasks.get(id) {
            None => return Err(BotError::Task(format!("task {id} does not exist"))),
            Some(e) if e.task.status == TaskStatus::Running => {
                return Err(BotError::Task(format!("task {id} is running")));
            }
            Some(_) => {}
        }
        tasks.remove(id);
        lock(&self.order).retain(|t| t != id);
        tracing::info!(task_id = id, "workflow removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockHandles;
    use crate::executor::FixedApprover;
    use crate::game::controller::tests::{controller_for, Scene};
    use crate::perception::types::ExecutionMode;

    async fn manager() -> (Arc<TaskManager>, MockHandles) {
        let scene = Scene::new(60, &[("city", (0, 0, 20, 12)), ("confirm_button", (100, 90, 18, 10))]);
        let frame = scene.frame_with(61, &["city", "confirm_button"]);
        let (_, matcher) = scene.matcher();
        let (controller, handles) = controller_for(matcher, false).await;
        handles.push_gray(frame);
        let controller = Arc::new(controller);
        let automation = Arc::new(AutomationService::new(
            controller.device().clone(),
            ExecutionMode::Auto,
            Arc::new(FixedApprover(true)),
        ));
        (Arc::new(TaskManager::new(controller, automation)), handles)
    }

    fn fast(condition: TaskCondition) -> TaskCondition {
        condition.with_timing(Duration::from_millis(40), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn runs_steps_in_order_and_reports_progress() {
        let (m, handles) = manager().await;
        m.create_task("daily", "daily chores", "").unwrap();
        m.add_condition_step("daily", "in city", fast(TaskCondition::screen_type(ScreenType::City)), true)
            .unwrap();
        m.add_action_step("daily", "tap", Action::tap(5, 5), true).unwrap();
        m.add_wait_step("daily", "settle", Duration::from_millis(5)).unwrap();
        m.add_tap_element_step("daily", "confirm", "confirm_button", Duration::from_millis(100))
            .unwrap();

        assert_eq!(m.progress("daily").unwrap().percentage, 0.0);
        assert!(m.execute_task("daily").await.unwrap());
        assert_eq!(m.status("daily"), Some(TaskStatus::Completed));
        let progress = m.progress("daily").unwrap();
        assert_eq!(progress.completed_steps, 4);
        assert_eq!(progress.percentage, 100.0);
        assert!(progress.execution_time.is_some());
        assert_eq!(handles.taps(), vec![(5, 5), (109, 95)]);
    }

    #[tokio::test]
    async fn duplicate_ids_and_unknown_tasks_are_errors() {
        let (m, _) = manager().await;
        m.create_task("a", "a", "").unwrap();
        assert!(matches!(m.create_task("a", "again", ""), Err(BotError::Task(_))));
        assert!(m.add_wait_step("missing", "w", Duration::ZERO).is_err());
        assert!(m.execute_task("missing").await.is_err());
        m.create_task("b", "b", "").unwrap();
        assert_eq!(m.list_tasks(), vec!["a", "b"]);
        m.remove_task("a").unwrap();
        assert_eq!(m.list_tasks(), vec!["b"]);
        assert!(m.remove_task("a").is_err());
    }

    #[tokio::test]
    async fn condition_timeout_fails_the_task() {
        let (m, handles) = manager().await;
        m.create_task("t", "t", "").unwrap();
        m.add_condition_step("t", "wait", fast(TaskCondition::element_exists("army_idle")), true)
            .unwrap();
        m.add_action_step("t", "tap", Action::tap(1, 1), true).unwrap();

        assert!(!m.execute_task("t").await.unwrap());
        assert_eq!(m.status("t"), Some(TaskStatus::Failed));
        let task = m.task("t").unwrap();
        assert!(task.error.unwrap().contains("timed out"));
        assert_eq!(task.steps[1].status, TaskStatus::Pending);
        assert!(handles.taps().is_empty());
        assert_eq!(m.progress("t").unwrap().percentage, 0.0);
    }

    #[tokio::test]
    async fn failure_without_stop_continues() {
        let (m, handles) = manager().await;
        m.create_task("t", "t", "").unwrap();
        m.add_condition_step("t", "gone", fast(TaskCondition::element_not_exists("city")), false)
            .unwrap();
        m.add_action_step("t", "tap", Action::tap(2, 2), true).unwrap();
        assert!(m.execute_task("t").await.unwrap());
        assert_eq!(handles.taps(), vec![(2, 2)]);
        assert_eq!(m.progress("t").unwrap().completed_steps, 1);
    }

    #[tokio::test]
    async fn custom_condition_is_polled() {
        let (m, _) = manager().await;
        fn live(c: &GameController) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
            Box::pin(async move { !c.is_dry_run() })
        }
        let check: CustomCheck = Arc::new(live);
        m.create_task("t", "t", "").unwrap();
        m.add_condition_step("t", "live", fast(TaskCondition::custom("not a dry run", check)), true)
            .unwrap();
        assert!(m.execute_task("t").await.unwrap());
    }

    #[tokio::test]
    async fn running_task_can_be_cancelled_but_not_removed() {
        let (m, handles) = manager().await;
        m.create_task("long", "long", "").unwrap();
        m.add_wait_step("long", "nap", Duration::from_secs(30)).unwrap();
        m.add_action_step("long", "tap", Action::tap(1, 1), true).unwrap();

        assert!(!m.cancel_task("long"));
        let runner = {
            let m = m.clone();
            tokio::spawn(async move { m.execute_task("long").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(m.status("long"), Some(TaskStatus::Running));
        assert!(m.remove_task("long").is_err());
        assert!(!m.execute_task("long").await.unwrap());

        assert!(m.cancel_task("long"));
        let finished = tokio::time::timeout(Duration::from_secs(2), runner).await.unwrap().unwrap();
        assert!(!finished.unwrap());
        assert_eq!(m.status("long"), Some(TaskStatus::Cancelled));
        assert!(handles.taps().is_empty());
        m.remove_task("long").unwrap();
    }

    #[tokio::test]
    async fn overall_time_limit() {
        let (m, _) = manager().await;
        m.create_task("t", "t", "").unwrap();
        m.set_max_execution_time("t", Duration::from_millis(10)).unwrap();
        m.add_wait_step("t", "w1", Duration::from_millis(30)).unwrap();
        m.add_wait_step("t", "w2", Duration::from_millis(1)).unwrap();
        assert!(!m.execute_task("t").await.unwrap());
        let task = m.task("t").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("exceeded"));
        assert_eq!(task.steps[1].status, TaskStatus::Pending);
    }
}
