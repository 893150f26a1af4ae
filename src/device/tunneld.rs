//! Lifecycle of the `pymobiledevice3 remote tunneld` daemon.
//!
//! iOS 17+ exposes developer services (including the DVT screenshot
//! service) only through a tunnel, which the daemon creates and which
//! needs root.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::{Child, Command};

use crate::device::command::{run_tool, run_tool_checked};
use crate::errors::{BotError, BotResult};

const TUNNELD_SIGNATURE: &str = "pymobiledevice3 remote tunneld";
const STARTUP_WAIT: Duration = Duration::from_secs(3);
const STOP_GRACE: Duration = Duration::from_secs(5);
const PS_TIMEOUT: Duration = Duration::from_secs(5);

fn pid_column() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\S+\s+(\d+)\s").ok()).as_ref()
}

/// PIDs of tunneld processes in `ps aux` output.
pub fn parse_tunneld_pids(ps_output: &str) -> Vec<u32> {
    let Some(re) = pid_column() else {
        return Vec::new();
    };
    ps_output
        .lines()
        .filter(|line| line.contains(TUNNELD_SIGNATURE) && !line.contains("grep"))
        .filter_map(|line| re.captures(line))
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .collect()
}

fn needs_root(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("root privileges") || lower.contains("permission denied")
}

#[derive(Debug)]
pub struct TunneldManager {
    python: String,
    /// Daemon stderr goes here for its whole lifetime.
    log_file: PathBuf,
    child: Option<Child>,
}

impl Default for TunneldManager {
    fn default() -> Self {
        Self::new("python3")
    }
}

impl TunneldManager {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            log_file: std::env::temp_dir().join("sgz-tunneld.log"),
            child: None,
        }
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = path.into();
        self
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    async fn pids(&self) -> BotResult<Vec<u32>> {
        let out = run_tool_checked("ps", &["aux"], PS_TIMEOUT).await?;
        Ok(parse_tunneld_pids(&out))
    }

    pub async fn is_running(&self) -> bool {
        match self.pids().await {
            Ok(pids) => !pids.is_empty(),
            Err(e) => {
                tracing::warn!(error = %e, "could not inspect process list");
                false
            }
        }
    }

    fn spawn(&self, with_sudo: bool) -> BotResult<Child> {
        let mut cmd = if with_sudo {
            let mut c = Command::new("sudo");
            c.arg("-n").arg(&self.python);
            c
        } else {
            Command::new(&self.python)
        };
        if let Some(parent) = self.log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let log = File::create(&self.log_file)?;
        cmd.args(["-m", "pymobiledevice3", "remote", "tunneld"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));
        tracing::debug!(log = %self.log_file.display(), "tunneld stderr redirected");
        cmd.spawn()
            .map_err(|e| BotError::Tunneld(format!("failed to spawn tunneld: {e}")))
    }

    /// The daemon's stderr log if the child already exited.
    async fn exited_stderr(&self, child: &mut Child) -> Option<String> {
        match child.try_wait() {
            Ok(Some(_)) => Some(
                tokio::fs::read_to_string(&self.log_file)
                    .await
                    .unwrap_or_default(),
            ),
            _ => None,
        }
    }

    /// Starts tunneld unless it is already running, escalating with
    /// `sudo -n` when the daemon reports it needs root.
    pub async fn start(&mut self) -> BotResult<()> {
        if self.is_running().await {
            tracing::info!("tunneld already running");
            return Ok(());
        }

        for with_sudo in [false, true] {
            tracing::info!(sudo = with_sudo, "starting tunneld");
            let mut child = self.spawn(with_sudo)?;
            tokio::time::sleep(STARTUP_WAIT).await;

            if self.is_running().await {
                tracing::info!("tunneld started");
                self.child = Some(child);
                return Ok(());
            }

            let stderr = self.exited_stderr(&mut child).await.unwrap_or_default();
            let _ = child.kill().await;
            if !with_sudo && needs_root(&stderr) {
                tracing::warn!("tunneld needs root; retrying with sudo");
                continue;
            }
            return Err(BotError::Tunneld(format!(
                "tunneld did not start: {}",
                stderr.trim()
            )));
        }
        Err(BotError::Tunneld(
            "tunneld needs root and passwordless sudo is not available".into(),
        ))
    }

    /// Stops the daemon this manager started: SIGTERM, then kill after 5s.
    pub async fn stop(&mut self) -> BotResult<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if let Some(pid) = child.id() {
            let _ = run_tool("kill", &["-TERM", &pid.to_string()], PS_TIMEOUT).await;
        }
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(status) => {
                tracing::info!(status = ?status.ok(), "tunneld stopped");
            }
            Err(_) => {
                tracing::warn!("tunneld ignored SIGTERM; killing");
                child.kill().await?;
            }
        }
        Ok(())
    }

    /// Kills every tunneld process, including ones started elsewhere.
    pub async fn force_stop(&mut self) -> BotResult<usize> {
        self.child = None;
        let pids = self.pids().await?;
        for pid in &pids {
            let pid = pid.to_string();
            if run_tool_checked("kill", &["-9", &pid], PS_TIMEOUT).await.is_err() {
                run_tool_checked("sudo", &["-n", "kill", "-9", &pid], PS_TIMEOUT).await?;
            }
        }
        tracing::info!(count = pids.len(), "tunneld processes killed");
        Ok(pids.len())
    }
}
