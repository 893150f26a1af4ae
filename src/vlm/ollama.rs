use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use serde_json::Value;

use crate::config::VlmConfig;
use crate::errors::{BotError, BotResult};
use crate::vlm::parser::parse_response;
use crate::vlm::provider::VisionModel;
use crate::vlm::types::VlmResult;

const TAGS_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Ollama server accessed through `/api/tags` and `/api/generate`.
pub struct OllamaClient {
    config: VlmConfig,
    base_url: String,
    client: reqwest::Client,
    available: AtomicBool,
    retry_pause: Duration,
}

/// `llava` is listed by Ollama as `llava:latest`.
fn model_listed(names: &[String], model: &str) -> bool {
    names.iter().any(|n| {
        n == model
            || n.strip_suffix(":latest") == Some(model)
            || model.strip_suffix(":latest") == Some(n.as_str())
    })
}

fn model_names(tags: &Value) -> Vec<String> {
    tags.get("models")
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Downscales to fit `max` (never enlarges) and encodes as base64 JPEG.
pub fn encode_image(image: &DynamicImage, max: [u32; 2], quality: u8) -> BotResult<String> {
    let [mw, mh] = max;
    let fitted = if image.width() > mw || image.height() > mh {
        image.thumbnail(mw, mh)
    } else {
        image.clone()
    };
    let rgb = fitted.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut Cursor::new(&mut buf), quality.clamp(1, 100)).encode_image(&rgb)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(buf))
}

fn sanitized(body: &Value) -> String {
    let mut log_body = body.clone();
    if let Some(images) = log_body.get_mut("images").and_then(Value::as_array_mut) {
        for img in images {
            *img = Value::String("<omitted_base64_image>".to_string());
        }
    }
    serde_json::to_string(&log_body).unwrap_or_default()
}

impl OllamaClient {
    pub fn new(config: VlmConfig) -> BotResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout.max(1)))
            .build()?;
        Ok(Self {
            base_url: config.base_url(),
            config,
            client,
            available: AtomicBool::new(false),
            retry_pause: RETRY_PAUSE,
        })
    }

    pub fn config(&self) -> &VlmConfig {
        &self.config
    }

    pub fn generate_body(&self, prompt: &str, image_b64: Option<&str>) -> Value {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": self.config.temperature,
                "top_p": self.config.top_p,
                "num_predict": self.config.num_predict,
            },
        });
        if let Some(img) = image_b64 {
            body["images"] = serde_json::json!([img]);
        }
        body
    }

    pub async fn prepare_image(&self, image: Arc<DynamicImage>) -> BotResult<String> {
        let max = self.config.image_max_size;
        let quality = self.config.jpeg_quality;
        tokio::task::spawn_blocking(move || encode_image(&image, max, quality))
            .await
            .map_err(|e| BotError::Vlm(format!("image preparation task failed: {e}")))?
    }

    async fn generate_once(&self, body: &Value) -> BotResult<String> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BotError::Vlm(format!("{status}: {text}")));
        }
        let value: Value = response.json().await?;
        Ok(value
            .get("response")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    /// `POST /api/generate`, retried with a short pause between attempts.
    pub async fn generate(&self, prompt: &str, image_b64: Option<&str>) -> BotResult<String> {
        let body = self.generate_body(prompt, image_b64);
        tracing::debug!(model = %self.config.model, with_image = image_b64.is_some(), "sending VLM request");
        tracing::debug!(body = %sanitized(&body), "request body (sanitized, base64 omitted)");

        let attempts = self.config.max_retries.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.generate_once(&body).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "VLM request failed");
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.retry_pause).await;
                    }
                }
            }
        }
        Err(BotError::Vlm(format!(
            "generate failed after {attempts} attempts: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

#[async_trait]
impl VisionModel for OllamaClient {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn initialize(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        let listed = match self.client.get(&url).timeout(TAGS_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(tags) => {
                    let names = model_names(&tags);
                    let ok = model_listed(&names, &self.config.model);
                    if !ok {
                        tracing::error!(model = %self.config.model, available = ?names, "model not installed in Ollama");
                    }
                    ok
                }
                Err(e) => {
                    tracing::error!(error = %e, "unreadable /api/tags response");
                    false
                }
            },
            Ok(resp) => {
                tracing::error!(status = %resp.status(), "Ollama /api/tags failed");
                false
            }
            Err(e) => {
                tracing::error!(url = %url, error = %e, "Ollama is not reachable");
                false
            }
        };
        self.available.store(listed, Ordering::SeqCst);
        if listed {
            tracing::info!(model = %self.config.model, "Ollama VLM ready");
        }
        listed
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn analyze(&self, image: Arc<DynamicImage>, prompt: &str) -> VlmResult {
        let started = Instant::now();
        if !self.is_available() {
            return VlmResult::failure(
                &self.config.model,
                0.0,
                BotError::VlmUnavailable(self.config.model.clone()).to_string(),
            );
        }

        let outcome = async {
            let b64 = self.prepare_image(image).await?;
            self.generate(prompt, Some(&b64)).await
        }
        .await;
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(text) => {
                let parsed = parse_response(&text);
                tracing::info!(
                    elapsed_s = elapsed,
                    elements = parsed.elements.len(),
                    suggestions = parsed.suggestions.len(),
                    scene = %parsed.scene,
                    "VLM analysis complete"
                );
                VlmResult {
                    success: true,
                    description: parsed.description,
                    elements: parsed.elements,
                    suggestions: parsed.suggestions,
                    confidence: parsed.confidence,
                    model_name: self.config.model.clone(),
                    processing_time: elapsed,
                    screen_type: parsed.scene,
                    error: None,
                    raw_response: text,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "VLM analysis failed");
                VlmResult::failure(&self.config.model, elapsed, e.to_string())
            }
        }
    }

    async fn complete(&self, prompt: &str) -> BotResult<String> {
        if !self.is_available() {
            return Err(BotError::VlmUnavailable(self.config.model.clone()));
        }
        self.generate(prompt, None).await
    }
}
