use std::io::{BufRead, Write};
use std::time::Duration;

use async_trait::async_trait;

use crate::perception::types::Action;

/// Decides whether an action may run in `confirm` mode.
#[async_trait]
pub trait ActionApprover: Send + Sync {
    async fn approve(&self, action: &Action) -> bool;
}

/// Asks on the terminal. Anything but `y`/`yes` rejects.
pub struct StdinApprover;

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[async_trait]
impl ActionApprover for StdinApprover {
    async fn approve(&self, action: &Action) -> bool {
        let question = format!(
            "Execute {:?}{}? [y/N] ",
            action.action_type,
            if action.description.is_empty() {
                String::new()
            } else {
                format!(" ({})", action.description)
            }
        );
        let answer = tokio::task::spawn_blocking(move || {
            let mut out = std::io::stdout();
            let _ = write!(out, "{question}");
            let _ = out.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;
        match answer {
            Ok(Ok(line)) => is_yes(&line),
            _ => false,
        }
    }
}

/// Always gives the same answer.
pub struct FixedApprover(pub bool);

#[async_trait]
impl ActionApprover for FixedApprover {
    async fn approve(&self, _action: &Action) -> bool {
        self.0
    }
}

/// Forces a pause after a run of consecutive actions.
#[derive(Debug, Clone)]
pub struct SafeMode {
    enabled: bool,
    max_continuous: u32,
    pause: Duration,
    count: u32,
    pauses: u32,
}

impl SafeMode {
    pub fn new(enabled: bool, max_continuous: u32, pause: Duration) -> Self {
        Self {
            enabled,
            max_continuous: max_continuous.max(1),
            pause,
            count: 0,
            pauses: 0,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn pauses(&self) -> u32 {
        self.pauses
    }

    /// Counts one action. Returns the pause to take, if the limit was hit.
    pub fn record(&mut self) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        self.count += 1;
        if self.count >= self.max_continuous {
            self.count = 0;
            self.pauses += 1;
            tracing::info!(
                actions = self.max_continuous,
                pause_s = self.pause.as_secs(),
                "safe mode pause"
            );
            return Some(self.pause);
        }
        None
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yes_answers() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes(""));
        assert!(!is_yes("no"));
    }

    #[test]
    fn pauses_every_max_actions() {
        let mut safe = SafeMode::new(true, 3, Duration::from_secs(30));
        assert_eq!(safe.record(), None);
        assert_eq!(safe.record(), None);
        assert_eq!(safe.record(), Some(Duration::from_secs(30)));
        assert_eq!(safe.count(), 0);
        assert_eq!(safe.pauses(), 1);
    }

    #[test]
    fn disabled_never_pauses() {
        let mut safe = SafeMode::new(false, 1, Duration::from_secs(30));
        assert!((0..10).all(|_| safe.record().is_none()));
    }

    #[tokio::test]
    async fn fixed_approver_answers() {
        assert!(FixedApprover(true).approve(&Action::home()).await);
        assert!(!FixedApprover(false).approve(&Action::home()).await);
    }
}
