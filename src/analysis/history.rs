use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::BotResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub ts: i64,
    pub kind: String,
    pub task_id: Option<String>,
    pub success: bool,
    pub detail: serde_json::Value,
}

impl HistoryEntry {
    pub fn now(kind: &str, task_id: Option<String>, success: bool, detail: serde_json::Value) -> Self {
        Self {
            ts: chrono::Utc::now().timestamp_millis(),
            kind: kind.to_string(),
            task_id,
            success,
            detail,
        }
    }
}

/// Append-only JSONL log of one bot session under `<data_dir>/sessions`.
pub struct SessionHistory {
    pub session_id: String,
    file_path: PathBuf,
    written: usize,
}

impl SessionHistory {
    pub fn new(data_dir: &Path) -> BotResult<Self> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let dir = data_dir.join("sessions");
        std::fs::create_dir_all(&dir)?;
        let file_path = dir.join(format!("session_{session_id}.jsonl"));
        tracing::debug!(path = %file_path.display(), "session history opened");
        Ok(Self {
            session_id,
            file_path,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn len(&self) -> usize {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    pub fn append(&mut self, entry: &HistoryEntry) -> BotResult<()> {
        let line = serde_json::to_string(entry)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        writeln!(file, "{line}")?;
        self.written += 1;
        Ok(())
    }
}
