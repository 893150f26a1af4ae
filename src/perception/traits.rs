use async_trait::async_trait;

use crate::errors::BotResult;
use crate::perception::types::{AnalysisResult, Screenshot};

/// Turns a screenshot into a structured description of the screen.
#[async_trait]
pub trait ScreenParser: Send + Sync {
    fn name(&self) -> &str;
    async fn parse(&self, shot: &Screenshot) -> BotResult<AnalysisResult>;
}
