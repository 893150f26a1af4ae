//! Background screenshot analysis.
//!
//! Requests go into a priority queue drained by one processor task; a
//! semaphore caps how many model calls run at once. Finished results are
//! kept by id, appended to a bounded history and broadcast to subscribers.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;

use crate::analysis::history::{HistoryEntry, SessionHistory};
use crate::config::AppConfig;
use crate::errors::{BotError, BotResult};
use crate::perception::types::Screenshot;
use crate::vlm::prompts::{optimization_prompt, PromptBook, PromptCategory, PromptStats};
use crate::vlm::provider::VisionModel;
use crate::vlm::types::VlmResult;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const IDLE_WAIT: Duration = Duration::from_secs(1);
const MIN_OPTIMIZE_HISTORY: usize = 5;
/// Finished results kept for `result()` lookups even with a short history.
const MIN_RESULT_LIMIT: usize = 100;
const OPTIMIZE_WINDOW: usize = 20;

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub screenshot: Screenshot,
    pub category: PromptCategory,
    pub custom_prompt: Option<String>,
    pub priority: u32,
}

impl AnalysisRequest {
    pub fn new(screenshot: Screenshot) -> Self {
        Self {
            screenshot,
            category: PromptCategory::GameAnalysis,
            custom_prompt: None,
            priority: 1,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.custom_prompt = Some(prompt.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRecord {
    pub task_id: String,
    pub submitted_at: DateTime<Utc>,
    pub screenshot_path: Option<PathBuf>,
    pub result: Arc<VlmResult>,
    /// Seconds.
    pub duration: f64,
}

#[derive(Debug, Clone)]
pub struct AnalysisEvent {
    pub task_id: String,
    pub result: Arc<VlmResult>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub pending: usize,
    pub running: usize,
    pub history: usize,
    /// Running mean in seconds.
    pub average_duration: f64,
    pub prompt_optimizations: u64,
    pub auto_analysis: bool,
    pub model_available: bool,
    pub prompts: HashMap<PromptCategory, PromptStats>,
}

struct Queued {
    task_id: String,
    request: AnalysisRequest,
    prompt: String,
    seq: u64,
}

// Higher priority first, then submission order.
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.request
            .priority
            .cmp(&other.request.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Queued {}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub max_concurrent: usize,
    pub history_limit: usize,
    /// Finished results kept by id; the oldest are evicted first.
    pub result_limit: usize,
    pub auto_interval: Duration,
    pub capture_retry: Duration,
    /// Where analysed frames are saved when debugging.
    pub debug_dir: Option<PathBuf>,
    pub session_dir: Option<PathBuf>,
}

impl ManagerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_concurrent: config.analysis.max_concurrent.max(1),
            history_limit: config.analysis.history_limit,
            result_limit: config.analysis.history_limit.max(MIN_RESULT_LIMIT),
            auto_interval: Duration::from_secs_f64(config.analysis.auto_interval.max(0.1)),
            capture_retry: Duration::from_secs(5),
            debug_dir: config.debug_mode.then(|| config.data_dir.clone()),
            session_dir: Some(config.data_dir.clone()),
        }
    }
}

#[derive(Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    average_duration: f64,
    prompt_optimizations: u64,
}

struct Inner {
    model: Arc<dyn VisionModel>,
    settings: ManagerSettings,
    prompts: StdMutex<PromptBook>,
    queue: StdMutex<BinaryHeap<Queued>>,
    notify: Notify,
    semaphore: Arc<Semaphore>,
    results: RwLock<ResultStore>,
    history: RwLock<VecDeque<AnalysisRecord>>,
    counters: StdMutex<Counters>,
    events: broadcast::Sender<AnalysisEvent>,
    session: Option<Mutex<SessionHistory>>,
    running: AtomicBool,
    auto: AtomicBool,
    active: AtomicUsize,
    seq: AtomicU64,
    last_id: StdMutex<(i64, u32)>,
}

#[derive(Default)]
struct ResultStore {
    by_id: HashMap<String, Arc<VlmResult>>,
    order: VecDeque<String>,
}

impl ResultStore {
    fn insert(&mut self, task_id: String, result: Arc<VlmResult>, limit: usize) {
        if self.by_id.insert(task_id.clone(), result).is_none() {
            self.order.push_back(task_id);
        }
        while self.order.len() > limit.max(1) {
            if let Some(oldest) = self.order.pop_front() {
                self.by_id.remove(&oldest);
            }
        }
    }

    fn get(&self, task_id: &str) -> Option<&Arc<VlmResult>> {
        self.by_id.get(task_id)
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone)]
pub struct AnalysisManager {
    inner: Arc<Inner>,
}

impl AnalysisManager {
    pub fn new(model: Arc<dyn VisionModel>, settings: ManagerSettings) -> Self {
        let session = settings.session_dir.as_ref().and_then(|dir| match SessionHistory::new(dir) {
            Ok(s) => Some(Mutex::new(s)),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "session history disabled");
                None
            }
        });
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                model,
                semaphore: Arc::new(Semaphore::new(settings.max_concurrent.max(1))),
                settings,
                prompts: StdMutex::new(PromptBook::default()),
                queue: StdMutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                results: RwLock::new(ResultStore::default()),
                history: RwLock::new(VecDeque::new()),
                counters: StdMutex::new(Counters::default()),
                events,
                session,
                running: AtomicBool::new(false),
                auto: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                seq: AtomicU64::new(0),
                last_id: StdMutex::new((0, 0)),
            }),
        }
    }

    pub fn model(&self) -> &Arc<dyn VisionModel> {
        &self.inner.model
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Probes the model and spawns the queue processor.
    pub async fn start(&self) -> bool {
        let available = self.inner.model.initialize().await;
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return available;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move { process_queue(inner).await });
        tracing::info!(
            max_concurrent = self.inner.settings.max_concurrent,
            available,
            "analysis manager started"
        );
        available
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.auto.store(false, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        tracing::info!("analysis manager stopped");
    }

    fn next_id(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let mut last = lock(&self.inner.last_id);
        if last.0 == now {
            last.1 += 1;
            format!("analysis_{now}_{}", last.1)
        } else {
            *last = (now, 0);
            format!("analysis_{now}")
        }
    }

    pub fn prompt(&self, category: PromptCategory) -> String {
        lock(&self.inner.prompts).get(category).to_string()
    }

    pub fn submit(&self, request: AnalysisRequest) -> String {
        let task_id = self.next_id();
        let prompt = request
            .custom_prompt
            .clone()
            .unwrap_or_else(|| self.prompt(request.category));
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        tracing::info!(task_id = %task_id, priority = request.priority, "analysis submitted");
        lock(&self.inner.queue).push(Queued {
            task_id: task_id.clone(),
            request,
            prompt,
            seq,
        });
        self.inner.notify.notify_one();
        task_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AnalysisEvent> {
        self.inner.events.subscribe()
    }

    /// Waits for a finished result, polling every 100 ms.
    pub async fn result(&self, task_id: &str, timeout: Duration) -> BotResult<Arc<VlmResult>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(r) = self.inner.results.read().await.get(task_id) {
                return Ok(r.clone());
            }
            if Instant::now() >= deadline {
                tracing::warn!(task_id, "analysis result timed out");
                return Err(BotError::Timeout(format!("analysis {task_id} not finished")));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Submits and waits in one step.
    pub async fn analyze(&self, request: AnalysisRequest, timeout: Duration) -> BotResult<Arc<VlmResult>> {
        let id = self.submit(request);
        self.result(&id, timeout).await
    }

    pub async fn history(&self, limit: usize) -> Vec<AnalysisRecord> {
        let history = self.inner.history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub async fn stats(&self) -> AnalysisStats {
        let history = self.inner.history.read().await.len();
        let pending = lock(&self.inner.queue).len();
        let prompts = lock(&self.inner.prompts).all_stats();
        let c = lock(&self.inner.counters);
        AnalysisStats {
            total: c.total,
            successful: c.successful,
            failed: c.failed,
            pending,
            running: self.inner.active.load(Ordering::SeqCst),
            history,
            average_duration: c.average_duration,
            prompt_optimizations: c.prompt_optimizations,
            auto_analysis: self.inner.auto.load(Ordering::SeqCst),
            model_available: self.inner.model.is_available(),
            prompts,
        }
    }

    /// Captures and submits a frame every `auto_interval` until stopped.
    pub fn start_auto_analysis<F, Fut>(&self, capture: F) -> Option<JoinHandle<()>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BotResult<Screenshot>> + Send,
    {
        if self.inner.auto.swap(true, Ordering::SeqCst) {
            tracing::warn!("auto analysis already running");
            return None;
        }
        let manager = self.clone();
        let interval = self.inner.settings.auto_interval;
        let retry = self.inner.settings.capture_retry;
        tracing::info!(interval_s = interval.as_secs_f32(), "auto analysis started");
        Some(tokio::spawn(async move {
            while manager.inner.auto.load(Ordering::SeqCst) {
                match capture().await {
                    Ok(shot) => {
                        manager.submit(AnalysisRequest::new(shot).with_priority(0));
                        tokio::time::sleep(interval).await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "auto analysis capture failed");
                        tokio::time::sleep(retry).await;
                    }
                }
            }
            tracing::info!("auto analysis loop exited");
        }))
    }

    pub fn stop_auto_analysis(&self) {
        self.inner.auto.store(false, Ordering::SeqCst);
    }

    /// Asks the model for a better analysis prompt from recent history and
    /// makes it the active one.
    pub async fn optimize_prompt(&self, feedback: Option<&str>) -> BotResult<String> {
        let records = self.history(OPTIMIZE_WINDOW).await;
        if records.len() < MIN_OPTIMIZE_HISTORY {
            return Err(BotError::Validation(format!(
                "prompt optimisation needs at least {MIN_OPTIMIZE_HISTORY} analyses, have {}",
                records.len()
            )));
        }
        let summary: Vec<String> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "scene": r.result.screen_type,
                    "success": r.result.success,
                    "confidence": r.result.confidence,
                    "elements": r.result.elements.len(),
                    "suggestions": r.result.suggestions.len(),
                    "duration": (r.duration * 100.0).round() / 100.0,
                })
                .to_string()
            })
            .collect();
        let current = self.prompt(PromptCategory::GameAnalysis);
        let request = optimization_prompt(&current, &summary.join("\n"), feedback);

        let improved = self.inner.model.complete(&request).await?;
        let improved = improved.trim().to_string();
        if improved.is_empty() {
            return Err(BotError::Vlm("model returned an empty prompt".into()));
        }
        lock(&self.inner.prompts).set(PromptCategory::GameAnalysis, improved.clone());
        lock(&self.inner.counters).prompt_optimizations += 1;
        tracing::info!(chars = improved.len(), "analysis prompt optimised");
        Ok(improved)
    }
}

async fn process_queue(inner: Arc<Inner>) {
    tracing::debug!("analysis processor running");
    while inner.running.load(Ordering::SeqCst) {
        let notified = inner.notify.notified();
        let next = lock(&inner.queue).pop();
        let Some(task) = next else {
            let _ = tokio::time::timeout(IDLE_WAIT, notified).await;
            continue;
        };
        let permit = match inner.semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let worker = inner.clone();
        tokio::spawn(async move {
            run_analysis(&worker, task).await;
            drop(permit);
        });
    }
    tracing::debug!("analysis processor exited");
}

async fn save_debug_frame(dir: &std::path::Path, task_id: &str, shot: &Screenshot) -> Option<PathBuf> {
    let path = dir.join(format!(
        "analysis_{task_id}_{}.png",
        shot.captured_at.format("%Y%m%d_%H%M%S")
    ));
    let image = shot.image.clone();
    let target = path.clone();
    let saved = tokio::task::spawn_blocking(move || -> BotResult<()> {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        image.save(&target).map_err(BotError::from)
    })
    .await;
    match saved {
        Ok(Ok(())) => Some(path),
        Ok(Err(e)) => {
            tracing::warn!(path = %path.display(), error = %e, "debug frame not saved");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "debug frame task failed");
            None
        }
    }
}

async fn run_analysis(inner: &Inner, task: Queued) {
    inner.active.fetch_add(1, Ordering::SeqCst);
    let started = Instant::now();
    tracing::info!(task_id = %task.task_id, "analysis started");

    let screenshot_path = match &inner.settings.debug_dir {
        Some(dir) => save_debug_frame(dir, &task.task_id, &task.request.screenshot).await,
        None => None,
    };

    let result = Arc::new(
        inner
            .model
            .analyze(task.request.screenshot.image.clone(), &task.prompt)
            .await,
    );
    let duration = started.elapsed().as_secs_f64();

    if task.request.custom_prompt.is_none() {
        lock(&inner.prompts).record(task.request.category, result.success && result.confidence > 0.5, duration);
    }
    {
        let mut c = lock(&inner.counters);
        c.total += 1;
        if result.success {
            c.successful += 1;
        } else {
            c.failed += 1;
        }
        let n = c.total as f64;
        c.average_duration = (c.average_duration * (n - 1.0) + duration) / n;
    }
    {
        let mut history = inner.history.write().await;
        history.push_back(AnalysisRecord {
            task_id: task.task_id.clone(),
            submitted_at: task.request.screenshot.captured_at,
            screenshot_path,
            result: result.clone(),
            duration,
        });
        while history.len() > inner.settings.history_limit {
            history.pop_front();
        }
    }
    if let Some(session) = &inner.session {
        let entry = HistoryEntry::now(
            "analysis",
            Some(task.task_id.clone()),
            result.success,
            serde_json::json!({
                "scene": result.screen_type,
                "confidence": result.confidence,
                "elements": result.elements.len(),
                "suggestions": result.suggestions.len(),
                "duration": duration,
                "error": result.error,
            }),
        );
        if let Err(e) = session.lock().await.append(&entry) {
            tracing::warn!(error = %e, "session history write failed");
        }
    }

    // Published last so a caller woken by the result sees history and stats.
    inner
        .results
        .write()
        .await
        .insert(task.task_id.clone(), result.clone(), inner.settings.result_limit);

    tracing::info!(
        task_id = %task.task_id,
        success = result.success,
        elapsed_s = duration,
        "analysis finished"
    );
    let _ = inner.events.send(AnalysisEvent {
        task_id: task.task_id,
        result,
    });
    inner.active.fetch_sub(1, Ordering::SeqCst);
}
