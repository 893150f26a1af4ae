use std::sync::Arc;

use async_trait::async_trait;
use image::DynamicImage;

use crate::errors::BotResult;
use crate::vlm::types::VlmResult;

/// A vision-language model that can describe a screenshot.
#[async_trait]
pub trait VisionModel: Send + Sync {
    fn name(&self) -> &str;

    /// Probes the backend. Returns whether the model can be used.
    async fn initialize(&self) -> bool;

    fn is_available(&self) -> bool;

    /// Analyses an image. Transport failures come back as an unsuccessful
    /// [`VlmResult`], not as `Err`.
    async fn analyze(&self, image: Arc<DynamicImage>, prompt: &str) -> VlmResult;

    /// Text-only completion, used for prompt optimisation.
    async fn complete(&self, prompt: &str) -> BotResult<String>;
}
