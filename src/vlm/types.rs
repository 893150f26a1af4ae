use serde::{Deserialize, Serialize};

use crate::perception::types::{ActionSuggestion, Element};

/// Outcome of one vision-model call. A failed call still carries the
/// model name and elapsed time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlmResult {
    pub success: bool,
    pub description: String,
    pub elements: Vec<Element>,
    pub suggestions: Vec<ActionSuggestion>,
    pub confidence: f32,
    pub model_name: String,
    /// Seconds.
    pub processing_time: f64,
    pub screen_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub raw_response: String,
}

impl VlmResult {
    pub fn failure(model_name: &str, processing_time: f64, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            description: format!("analysis failed: {error}"),
            elements: Vec::new(),
            suggestions: Vec::new(),
            confidence: 0.0,
            model_name: model_name.to_string(),
            processing_time,
            screen_type: "unknown".to_string(),
            error: Some(error),
            raw_response: String::new(),
        }
    }
}
