use std::io::ErrorKind;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;

use crate::errors::{BotError, BotResult};

/// Runs an external tool to completion, killing it after `timeout`.
pub async fn run_tool(program: &str, args: &[&str], timeout: Duration) -> BotResult<Output> {
    tracing::debug!(program, ?args, "running external tool");
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(timeout, child).await {
        Err(_) => Err(BotError::Timeout(format!(
            "{program} did not finish within {}s",
            timeout.as_secs_f32()
        ))),
        Ok(Err(e)) if e.kind() == ErrorKind::NotFound => Err(BotError::Connection(format!(
            "{program} is not installed or not on PATH"
        ))),
        Ok(result) => Ok(result?),
    }
}

/// Like [`run_tool`] but fails on a non-zero exit, returning trimmed stdout.
pub async fn run_tool_checked(program: &str, args: &[&str], timeout: Duration) -> BotResult<String> {
    let output = run_tool(program, args, timeout).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BotError::Connection(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_program_is_connection_error() {
        let err = run_tool("sgz-no-such-tool", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Connection(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn checked_returns_stdout() {
        let out = run_tool_checked("echo", &["tunneld"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, "tunneld");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_tool_times_out() {
        let err = run_tool("sleep", &["5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Timeout(_)));
    }
}
