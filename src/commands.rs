//! CLI command handlers. Each handler builds the component graph from the
//! config, connects the device, does its work and disconnects.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::analysis::{AnalysisManager, ManagerSettings};
use crate::cli::{Command, RunArgs, TunneldAction};
use crate::config::AppConfig;
use crate::device::tunneld::TunneldManager;
use crate::device::DeviceConnector;
use crate::errors::{BotError, BotResult};
use crate::executor::{AutomationService, StdinApprover};
use crate::game::{ControllerSettings, GameAssistant, GameController};
use crate::perception::annotator::{annotate_png, element_summary};
use crate::perception::keyword::KeywordMatcher;
use crate::perception::template::{TemplateLibrary, TemplateMatcher};
use crate::perception::types::ActionSuggestion;
use crate::tasks::{LoopController, StopReason, TaskManager, TaskScheduler};
use crate::vlm::OllamaClient;

const CYCLE_PAUSE: Duration = Duration::from_millis(100);
const CLI_WORKFLOW: &str = "cli";

/// Everything a command needs, wired from one config.
pub struct Session {
    pub config: AppConfig,
    pub device: Arc<DeviceConnector>,
    pub assistant: Arc<GameAssistant>,
}

impl Session {
    pub fn build(config: AppConfig, dry_run: bool, force_vlm: bool) -> BotResult<Self> {
        let device = Arc::new(DeviceConnector::from_config(&config)?);

        let library = TemplateLibrary::load(&config.template_dir())?;
        let matcher = TemplateMatcher::new(
            Arc::new(library),
            config.vision.threshold,
            config.vision.nms_threshold,
            config.vision.max_results,
        );
        let controller = Arc::new(GameController::new(
            device.clone(),
            matcher,
            ControllerSettings::from_config(&config.controller),
            dry_run,
        ));
        let automation = Arc::new(AutomationService::new(
            device.clone(),
            config.automation.execution_mode,
            Arc::new(StdinApprover),
        ));

        let manager = if config.vision.use_vlm || force_vlm {
            let client = OllamaClient::new(config.vlm.clone())?;
            Some(AnalysisManager::new(Arc::new(client), ManagerSettings::from_config(&config)))
        } else {
            None
        };

        let mut assistant = GameAssistant::new(
            controller,
            automation,
            manager,
            Duration::from_secs(config.analysis.result_timeout),
        );
        if let Some(path) = &config.vision.keyword_templates {
            match KeywordMatcher::load(path) {
                Ok(keywords) => assistant = assistant.with_keywords(Arc::new(keywords)),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "keyword templates not loaded"),
            }
        }

        Ok(Self {
            config,
            device,
            assistant: Arc::new(assistant),
        })
    }

    pub async fn open(&self) -> BotResult<()> {
        let info = self.device.connect().await?;
        tracing::info!(
            backend = self.device.backend_name(),
            device = %info.name,
            width = info.screen_size.0,
            height = info.screen_size.1,
            "device connected"
        );
        if self.assistant.start().await {
            tracing::info!("VLM analysis enabled");
        }
        Ok(())
    }

    pub fn task_manager(&self) -> TaskManager {
        TaskManager::new(
            self.assistant.controller().clone(),
            self.assistant.automation().clone(),
        )
    }

    pub async fn close(&self) {
        if let Err(e) = self.assistant.stop().await {
            tracing::warn!(error = %e, "disconnect failed");
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> BotResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_suggestions(suggestions: &[ActionSuggestion]) {
    if suggestions.is_empty() {
        println!("no suggestions");
        return;
    }
    for (i, s) in suggestions.iter().enumerate() {
        let target = s
            .target
            .as_ref()
            .map(|t| format!(" -> {}", t.name))
            .unwrap_or_default();
        println!(
            "{:>2}. [{:?}] {} (priority {}, confidence {:.2}){}",
            i + 1,
            s.action_type,
            s.description,
            s.priority,
            s.confidence,
            target
        );
    }
}

pub async fn dispatch(config: AppConfig, command: Command) -> BotResult<()> {
    match command {
        Command::Tunneld { action } => tunneld(&config, action).await,
        Command::Run(args) => {
            let session = Session::build(config, args.dry_run, false)?;
            run_session(&session, &args).await
        }
        command => {
            let force_vlm = matches!(command, Command::Analyze { vlm: true, .. });
            let session = Session::build(config, false, force_vlm)?;
            session.open().await?;
            let result = one_shot(&session, command).await;
            session.close().await;
            result
        }
    }
}

async fn one_shot(session: &Session, command: Command) -> BotResult<()> {
    let assistant = &session.assistant;
    match command {
        Command::Analyze { save, .. } => {
            let analysis = assistant.analyze_current_screen().await?;
            print_json(&analysis)?;
            if let Some(path) = save {
                let shot = assistant.controller().screenshot(false).await?;
                let png = annotate_png(&shot, &analysis.elements)?;
                tokio::fs::write(&path, png).await?;
                println!("annotated screenshot written to {}", path.display());
            }
        }
        Command::Suggest => print_suggestions(&assistant.game_suggestions().await?),
        Command::Find { name } => match assistant.find_game_element(&name).await? {
            Some(el) => print_json(&el)?,
            None => println!("{name} not found"),
        },
        Command::Screenshot { path } => {
            let shot = session.device.screenshot().await?;
            session.device.save_screenshot(&shot, &path).await?;
            println!("{}x{} screenshot written to {}", shot.width(), shot.height(), path.display());
        }
        Command::Stats => print_stats(session).await?,
        Command::Interactive => interactive(session).await?,
        Command::Workflow {
            elements,
            timeout,
            pause_ms,
        } => {
            let manager = session.task_manager();
            tap_workflow(
                &manager,
                CLI_WORKFLOW,
                &elements,
                Duration::from_secs(timeout),
                Duration::from_millis(pause_ms),
            )?;
            let completed = manager.execute_task(CLI_WORKFLOW).await?;
            if let Some(progress) = manager.progress(CLI_WORKFLOW) {
                print_json(&progress)?;
            }
            if !completed {
                return Err(BotError::Task(format!("workflow over {} did not complete", elements.join(", "))));
            }
        }
        Command::Run(_) | Command::Tunneld { .. } => {
            return Err(BotError::Validation("not a one-shot command".into()));
        }
    }
    Ok(())
}

/// One tap step per element with a pause step between neighbours.
fn tap_workflow(manager: &TaskManager, id: &str, elements: &[String], timeout: Duration, pause: Duration) -> BotResult<()> {
    manager.create_task(id, "tap sequence", &elements.join(" -> "))?;
    for (i, element) in elements.iter().enumerate() {
        if i > 0 && !pause.is_zero() {
            manager.add_wait_step(id, &format!("pause {i}"), pause)?;
        }
        manager.add_tap_element_step(id, &format!("tap {element}"), element, timeout)?;
    }
    Ok(())
}

async fn print_stats(session: &Session) -> BotResult<()> {
    print_json(&serde_json::json!({
        "device": session.device.statistics(),
        "assistant": session.assistant.statistics().await,
    }))
}

/// The main task loop.
pub async fn run_session(session: &Session, args: &RunArgs) -> BotResult<()> {
    session.open().await?;

    let mut scheduler = TaskScheduler::from_config(session.assistant.controller().clone(), &session.config.tasks);
    scheduler.enable_only(args.task);
    let mut lc = LoopController::new(args.duration, session.config.tasks.max_consecutive_failures);

    let stop = lc.stop_handle();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; stopping");
            stop.store(true, Ordering::SeqCst);
        }
    });

    tracing::info!(
        tasks = ?scheduler.enabled_tasks(),
        duration_min = args.duration,
        dry_run = args.dry_run,
        "task loop started"
    );
    let reason = loop {
        if let Some(reason) = lc.should_stop() {
            break reason;
        }
        let report = scheduler.run_cycle().await;
        if report.is_failure() {
            lc.record_failure();
            tracing::warn!(?report, total_failures = lc.total_failures(), "cycle failed");
        } else if report.executed > 0 {
            lc.record_success();
        }
        tokio::time::sleep(CYCLE_PAUSE).await;
    };
    signal.abort();

    match reason {
        StopReason::DurationElapsed => tracing::info!(elapsed_s = lc.elapsed().as_secs(), "run duration reached"),
        StopReason::TooManyFailures => tracing::error!(failures = lc.total_failures(), "too many consecutive failures"),
        StopReason::Requested => tracing::info!("stopped on request"),
    }
    tracing::info!(cycles = lc.cycles(), stats = ?scheduler.stats(), "task loop finished");

    session.close().await;
    Ok(())
}

const HELP: &str = "\
commands:
  analyze          analyze the current screen
  suggest          list suggestions for the current screen
  exec <n>         execute suggestion n from the last list
  find <element>   locate an element
  stats            show statistics
  optimize [text]  improve the VLM prompt, optionally with feedback
  auto on|off      toggle periodic VLM analysis
  help             show this help
  quit             leave";

async fn interactive(session: &Session) -> BotResult<()> {
    let assistant = &session.assistant;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut last: Vec<ActionSuggestion> = Vec::new();
    println!("{HELP}");

    loop {
        stdout.write_all(b"sgz> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let (cmd, arg) = match line.trim().split_once(' ') {
            Some((c, a)) => (c, a.trim()),
            None => (line.trim(), ""),
        };

        let outcome: BotResult<()> = async {
            match cmd {
                "" => {}
                "quit" | "exit" | "q" => return Err(BotError::Cancelled),
                "help" | "h" => println!("{HELP}"),
                "analyze" | "a" => {
                    let analysis = assistant.analyze_current_screen().await?;
                    println!(
                        "screen: {} ({:?}, confidence {:.2})",
                        analysis.screen_type, analysis.source, analysis.confidence
                    );
                    println!("{}", element_summary(&analysis.elements));
                    if !analysis.description.is_empty() {
                        println!("{}", analysis.description);
                    }
                }
                "suggest" | "s" => {
                    last = assistant.game_suggestions().await?;
                    print_suggestions(&last);
                }
                "exec" | "e" => {
                    let index: usize = arg
                        .parse()
                        .map_err(|_| BotError::Validation(format!("not a suggestion number: {arg:?}")))?;
                    let suggestion = index
                        .checked_sub(1)
                        .and_then(|i| last.get(i))
                        .ok_or_else(|| BotError::Validation(format!("no suggestion {index}; run suggest first")))?;
                    let ok = assistant.execute_suggestion(suggestion).await?;
                    println!("{}", if ok { "done" } else { "failed" });
                }
                "find" | "f" if !arg.is_empty() => match assistant.find_game_element(arg).await? {
                    Some(el) => println!("{} at {:?} (confidence {:.2})", el.name, el.center(), el.confidence),
                    None => println!("{arg} not found"),
                },
                "stats" => print_stats(session).await?,
                "optimize" => {
                    let feedback = (!arg.is_empty()).then_some(arg);
                    let prompt = assistant.optimize_prompts(feedback).await?;
                    println!("new prompt:\n{prompt}");
                }
                "auto" => toggle_auto(session, arg)?,
                other => println!("unknown command {other:?}; type help"),
            }
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {}
            Err(BotError::Cancelled) => break,
            Err(e) => println!("error: {e}"),
        }
    }
    if let Some(manager) = assistant.manager() {
        manager.stop_auto_analysis();
    }
    Ok(())
}

fn toggle_auto(session: &Session, arg: &str) -> BotResult<()> {
    let manager = session
        .assistant
        .manager()
        .ok_or_else(|| BotError::VlmUnavailable("VLM analysis is disabled".into()))?;
    match arg {
        "on" => {
            let controller = session.assistant.controller().clone();
            let started = manager
                .start_auto_analysis(move || {
                    let controller = controller.clone();
                    async move { controller.screenshot(true).await }
                })
                .is_some();
            println!("{}", if started { "auto analysis on" } else { "auto analysis already on" });
        }
        "off" => {
            manager.stop_auto_analysis();
            println!("auto analysis off");
        }
        other => println!("usage: auto on|off (got {other:?})"),
    }
    Ok(())
}

async fn tunneld(config: &AppConfig, action: TunneldAction) -> BotResult<()> {
    let mut manager = TunneldManager::default().with_log_file(config.data_dir.join("tunneld.log"));
    match action {
        TunneldAction::Start => {
            manager.start().await?;
            println!("tunneld running");
        }
        TunneldAction::Stop => {
            let killed = manager.force_stop().await?;
            println!("stopped {killed} tunneld process(es)");
        }
        TunneldAction::Status => {
            let running = manager.is_running().await;
            println!("tunneld is {}", if running { "running" } else { "not running" });
        }
    }
    Ok(())
}

/// Loads config and applies the global `--debug` flag.
pub fn load(path: Option<&Path>, debug: bool) -> BotResult<AppConfig> {
    let mut config = crate::config::load_config(path)?;
    if debug {
        config.debug_mode = true;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionType;

    #[test]
    fn session_builds_without_vlm_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.connection.connection_type = ConnectionType::Webdriver;
        config.data_dir = dir.path().to_path_buf();
        let session = Session::build(config, true, false).unwrap();
        assert!(session.assistant.manager().is_none());
        assert!(session.assistant.controller().is_dry_run());
        assert!(!session.device.is_connected());
    }

    #[test]
    fn tap_workflow_interleaves_pauses() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.connection.connection_type = ConnectionType::Webdriver;
        config.data_dir = dir.path().to_path_buf();
        let session = Session::build(config, true, false).unwrap();
        let manager = session.task_manager();
        let elements = vec!["world_map".to_string(), "confirm_button".to_string()];
        tap_workflow(&manager, "t", &elements, Duration::from_secs(2), Duration::from_millis(10)).unwrap();

        let task = manager.task("t").unwrap();
        let names: Vec<&str> = task.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["tap world_map", "pause 1", "tap confirm_button"]);
        assert_eq!(task.steps[0].timeout, Duration::from_secs(2));
        assert!(tap_workflow(&manager, "t", &elements, Duration::ZERO, Duration::ZERO).is_err());
    }

    #[test]
    fn forced_vlm_builds_a_manager() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.connection.connection_type = ConnectionType::Webdriver;
        config.data_dir = dir.path().to_path_buf();
        let session = Session::build(config, false, true).unwrap();
        assert!(session.assistant.manager().is_some());
    }
}
