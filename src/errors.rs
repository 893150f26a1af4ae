use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("tunneld error: {0}")]
    Tunneld(String),

    #[error("Screenshot error: {0}")]
    Screenshot(String),

    #[error("Vision error: {0}")]
    Vision(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("VLM error: {0}")]
    Vlm(String),

    #[error("VLM provider not available: {0}")]
    VlmUnavailable(String),

    #[error("Action error: {0}")]
    Action(String),

    #[error("WebDriverAgent error: {0}")]
    WebDriver(String),

    #[error("Task error: {0}")]
    Task(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Task cancelled")]
    Cancelled,
}

impl BotError {
    /// Transient failures that a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BotError::Connection(_)
                | BotError::Timeout(_)
                | BotError::Screenshot(_)
                | BotError::Http(_)
                | BotError::Io(_)
        )
    }
}

impl serde::Serialize for BotError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type BotResult<T> = Result<T, BotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(BotError::Screenshot("empty".into()).is_retryable());
        assert!(BotError::Timeout("tap".into()).is_retryable());
        assert!(!BotError::Config("bad".into()).is_retryable());
        assert!(!BotError::Cancelled.is_retryable());
    }

    #[test]
    fn serializes_as_message() {
        let json = serde_json::to_string(&BotError::TemplateNotFound("army_idle".into())).unwrap();
        assert_eq!(json, "\"Template not found: army_idle\"");
    }
}
