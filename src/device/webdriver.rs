use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use image::DynamicImage;
use serde_json::Value;

use crate::config::ConnectionConfig;
use crate::device::traits::DeviceBackend;
use crate::errors::{BotError, BotResult};
use crate::perception::types::{DeviceInfo, Point};

/// WebDriverAgent over its HTTP API. Screenshots come back in device
/// pixels while gestures take points, so coordinates are divided by the
/// pixel/point scale measured at connect time.
pub struct WebDriverBackend {
    base: String,
    client: reqwest::Client,
    screen: (u32, u32),
    session: Option<String>,
    scale: f64,
    info: Option<DeviceInfo>,
}

fn session_id(body: &Value) -> Option<String> {
    body.get("sessionId")
        .or_else(|| body.pointer("/value/sessionId"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn window_size(body: &Value) -> Option<(f64, f64)> {
    let v = body.get("value")?;
    Some((v.get("width")?.as_f64()?, v.get("height")?.as_f64()?))
}

fn decode_screenshot(body: &Value) -> BotResult<Vec<u8>> {
    let b64 = body
        .get("value")
        .and_then(Value::as_str)
        .ok_or_else(|| BotError::WebDriver("screenshot response has no value".into()))?;
    let cleaned: String = b64.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(cleaned)
        .map_err(|e| BotError::WebDriver(format!("screenshot is not base64: {e}")))
}

/// WDA reports failures inside a 200 body as `value.error`.
fn check_wda_error(body: &Value) -> BotResult<()> {
    match body.pointer("/value/error").and_then(Value::as_str) {
        Some(err) => {
            let msg = body
                .pointer("/value/message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Err(BotError::WebDriver(format!("{err}: {msg}")))
        }
        None => Ok(()),
    }
}

impl WebDriverBackend {
    pub fn new(config: &ConnectionConfig) -> BotResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.screenshot_timeout.max(1)))
            .build()?;
        Ok(Self {
            base: config.webdriver_url.trim_end_matches('/').to_string(),
            client,
            screen: (config.screen_width, config.screen_height),
            session: None,
            scale: 1.0,
            info: None,
        })
    }

    fn session(&self) -> BotResult<&str> {
        self.session
            .as_deref()
            .ok_or_else(|| BotError::Connection("no WebDriverAgent session".into()))
    }

    async fn call(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> BotResult<Value> {
        let url = format!("{}{}", self.base, path);
        tracing::debug!(%method, %url, "WDA request");
        let mut req = self.client.request(method, &url);
        if let Some(b) = body {
            req = req.json(&b);
        }
        let response = req.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BotError::WebDriver(format!("{path}: {status}: {text}")));
        }
        let value: Value = response.json().await?;
        check_wda_error(&value)?;
        Ok(value)
    }

    fn to_points(&self, p: Point) -> (f64, f64) {
        (p.x as f64 / self.scale, p.y as f64 / self.scale)
    }

    async fn fetch_screenshot(&self) -> BotResult<DynamicImage> {
        let body = self.call(reqwest::Method::GET, "/screenshot", None).await?;
        let bytes = decode_screenshot(&body)?;
        tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
            .await
            .map_err(|e| BotError::Screenshot(format!("decode task failed: {e}")))?
            .map_err(BotError::from)
    }
}

#[async_trait]
impl DeviceBackend for WebDriverBackend {
    fn name(&self) -> &str {
        "webdriver"
    }

    async fn connect(&mut self) -> BotResult<DeviceInfo> {
        let status = self
            .call(reqwest::Method::GET, "/status", None)
            .await
            .map_err(|e| BotError::Connection(format!("WebDriverAgent unreachable at {}: {e}", self.base)))?;

        let created = self
            .call(
                reqwest::Method::POST,
                "/session",
                Some(serde_json::json!({ "capabilities": { "alwaysMatch": {} } })),
            )
            .await?;
        let sid = session_id(&created)
            .ok_or_else(|| BotError::WebDriver("session response has no sessionId".into()))?;
        self.session = Some(sid.clone());

        let size = self
            .call(reqwest::Method::GET, &format!("/session/{sid}/window/size"), None)
            .await
            .ok()
            .and_then(|b| window_size(&b));
        if let Some((w_pt, _)) = size {
            let shot = self.fetch_screenshot().await?;
            if w_pt > 0.0 {
                self.scale = shot.width() as f64 / w_pt;
            }
            self.screen = (shot.width(), shot.height());
        }

        let ios_version = status
            .pointer("/value/os/version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let name = status
            .pointer("/value/device")
            .and_then(Value::as_str)
            .unwrap_or("iPad")
            .to_string();
        let info = DeviceInfo {
            udid: sid,
            name,
            ios_version,
            model: "webdriveragent".into(),
            screen_size: self.screen,
            scale_factor: self.scale as f32,
            is_connected: true,
            connection_type: "webdriver".into(),
        };
        tracing::info!(session = %info.udid, scale = self.scale, "WebDriverAgent session created");
        self.info = Some(info.clone());
        Ok(info)
    }

    async fn disconnect(&mut self) -> BotResult<()> {
        self.info = None;
        if let Some(sid) = self.session.take() {
            if let Err(e) = self
                .call(reqwest::Method::DELETE, &format!("/session/{sid}"), None)
                .await
            {
                tracing::warn!(error = %e, "failed to close WDA session");
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn device_info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    async fn screenshot(&mut self) -> BotResult<DynamicImage> {
        self.session()?;
        self.fetch_screenshot().await
    }

    async fn tap(&mut self, x: i32, y: i32) -> BotResult<()> {
        let sid = self.session()?.to_string();
        let (px, py) = self.to_points(Point::new(x, y));
        self.call(
            reqwest::Method::POST,
            &format!("/session/{sid}/wda/tap/0"),
            Some(serde_json::json!({ "x": px, "y": py })),
        )
        .await
        .map(|_| ())
    }

    async fn swipe(&mut self, from: Point, to: Point, duration: Duration) -> BotResult<()> {
        let sid = self.session()?.to_string();
        let (fx, fy) = self.to_points(from);
        let (tx, ty) = self.to_points(to);
        self.call(
            reqwest::Method::POST,
            &format!("/session/{sid}/wda/dragfromtoforduration"),
            Some(serde_json::json!({
                "fromX": fx,
                "fromY": fy,
                "toX": tx,
                "toY": ty,
                "duration": duration.as_secs_f64(),
            })),
        )
        .await
        .map(|_| ())
    }

    async fn long_press(&mut self, at: Point, duration: Duration) -> BotResult<()> {
        let sid = self.session()?.to_string();
        let (x, y) = self.to_points(at);
        self.call(
            reqwest::Method::POST,
            &format!("/session/{sid}/wda/touchAndHold"),
            Some(serde_json::json!({ "x": x, "y": y, "duration": duration.as_secs_f64() })),
        )
        .await
        .map(|_| ())
    }

    async fn home(&mut self) -> BotResult<()> {
        self.call(reqwest::Method::POST, "/wda/homescreen", None)
            .await
            .map(|_| ())
    }

    fn screen_size(&self) -> (u32, u32) {
        self.screen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_id_from_either_location() {
        assert_eq!(session_id(&json!({"sessionId": "abc"})).as_deref(), Some("abc"));
        assert_eq!(
            session_id(&json!({"value": {"sessionId": "def", "capabilities": {}}})).as_deref(),
            Some("def")
        );
        assert_eq!(session_id(&json!({"value": {}})), None);
    }

    #[test]
    fn window_size_reads_points() {
        assert_eq!(
            window_size(&json!({"value": {"width": 1366, "height": 1024}})),
            Some((1366.0, 1024.0))
        );
        assert_eq!(window_size(&json!({"value": null})), None);
    }

    #[test]
    fn screenshot_value_is_decoded() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"\x89PNG-data");
        let wrapped = format!("{}\n{}", &encoded[..4], &encoded[4..]);
        assert_eq!(decode_screenshot(&json!({"value": wrapped})).unwrap(), b"\x89PNG-data");
        assert!(decode_screenshot(&json!({"value": 5})).is_err());
    }

    #[test]
    fn wda_error_in_body_is_reported() {
        let body = json!({"value": {"error": "invalid session id", "message": "Session does not exist"}});
        let err = check_wda_error(&body).unwrap_err();
        assert!(err.to_string().contains("invalid session id"));
        assert!(check_wda_error(&json!({"value": null})).is_ok());
    }

    #[tokio::test]
    async fn points_scale_with_retina_factor() {
        let mut backend = WebDriverBackend::new(&ConnectionConfig::default()).unwrap();
        backend.scale = 2.0;
        assert_eq!(backend.to_points(Point::new(2732, 1001)), (1366.0, 500.5));
        assert!(matches!(backend.tap(1, 1).await, Err(BotError::Connection(_))));
    }
}
