use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::{BotError, BotResult};
use crate::perception::keyword::{KeywordMatcher, DEFAULT_KEYWORD_THRESHOLD};
use crate::perception::traits::ScreenParser;
use crate::perception::types::{AnalysisResult, AnalysisSource, ScreenType, Screenshot};
use crate::vlm::provider::VisionModel;
use crate::vlm::types::VlmResult;

/// Converts a successful model answer into an [`AnalysisResult`]. When the
/// model only produced prose, keyword templates (if any) fill in elements.
pub fn vlm_to_analysis(
    vlm: &VlmResult,
    keywords: Option<&KeywordMatcher>,
    screen_size: (u32, u32),
) -> AnalysisResult {
    if vlm.elements.is_empty() {
        if let Some(matcher) = keywords {
            let mut result = matcher.match_text(
                &vlm.description,
                &vlm.screen_type,
                screen_size,
                DEFAULT_KEYWORD_THRESHOLD,
            );
            result.raw["model"] = serde_json::json!(vlm.model_name);
            return result;
        }
    }
    AnalysisResult {
        screen_type: ScreenType::parse(&vlm.screen_type),
        elements: vlm.elements.clone(),
        suggestions: vlm.suggestions.clone(),
        confidence: vlm.confidence,
        source: AnalysisSource::Vlm,
        description: vlm.description.clone(),
        raw: serde_json::json!({
            "method": "vlm",
            "model": vlm.model_name,
            "processing_time": vlm.processing_time,
            "scene": vlm.screen_type,
        }),
        timestamp: chrono::Utc::now(),
    }
}

pub struct VlmScreenParser {
    model: Arc<dyn VisionModel>,
    prompt: String,
    keywords: Option<Arc<KeywordMatcher>>,
}

impl VlmScreenParser {
    pub fn new(model: Arc<dyn VisionModel>, prompt: impl Into<String>) -> Self {
        Self {
            model,
            prompt: prompt.into(),
            keywords: None,
        }
    }

    pub fn with_keywords(mut self, keywords: Arc<KeywordMatcher>) -> Self {
        self.keywords = Some(keywords);
        self
    }
}

#[async_trait]
impl ScreenParser for VlmScreenParser {
    fn name(&self) -> &str {
        "vlm"
    }

    async fn parse(&self, shot: &Screenshot) -> BotResult<AnalysisResult> {
        let vlm = self.model.analyze(shot.image.clone(), &self.prompt).await;
        if !vlm.success {
            return Err(BotError::Vlm(vlm.error.unwrap_or_else(|| "analysis failed".into())));
        }
        Ok(vlm_to_analysis(
            &vlm,
            self.keywords.as_deref(),
            (shot.width(), shot.height()),
        ))
    }
}
