use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::errors::{BotError, BotResult};

/// Filter directive used when `RUST_LOG` is unset.
pub fn default_directive(level: &str, debug: bool) -> String {
    if debug {
        "debug".to_string()
    } else {
        level.to_string()
    }
}

/// Installs the global subscriber: stderr always, plus an append-only
/// plain-text file when `file` is set.
pub fn init_logging(level: &str, debug: bool, file: Option<&Path>) -> BotResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(level, debug)))
        .map_err(|e| BotError::Config(format!("invalid log filter: {e}")))?;

    let file_layer = match file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let handle = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Mutex::new(handle))
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(debug))
        .with(file_layer)
        .try_init()
        .map_err(|e| BotError::Config(format!("logging already initialised: {e}")))?;

    if let Some(path) = file {
        tracing::debug!(path = %path.display(), "logging to file");
    }
    Ok(())
}
