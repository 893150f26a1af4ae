use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::{AppConfig, ConnectionType};
use crate::device::desktop::{DesktopBackend, DesktopMode};
use crate::device::network::NetworkBackend;
use crate::device::traits::DeviceBackend;
use crate::device::usb::UsbBackend;
use crate::device::webdriver::WebDriverBackend;
use crate::errors::{BotError, BotResult};
use crate::perception::types::{ConnectionStatus, DeviceInfo, Point, Screenshot};

const BACKOFF_FACTOR: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub screenshot_timeout: Duration,
    pub auto_save: bool,
    pub screenshot_dir: PathBuf,
}

impl ConnectorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_retries: config.connection.max_retries,
            retry_interval: Duration::from_secs_f64(config.connection.retry_interval.max(0.0)),
            screenshot_timeout: Duration::from_secs(config.connection.screenshot_timeout),
            auto_save: config.auto_save_screenshots,
            screenshot_dir: config.screenshot_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorStats {
    pub backend: String,
    pub status: ConnectionStatus,
    pub device: Option<DeviceInfo>,
    pub screenshot_count: u64,
    pub failed_screenshots: u64,
    pub last_screenshot: Option<DateTime<Utc>>,
}

struct State {
    status: ConnectionStatus,
    info: Option<DeviceInfo>,
    screen: (u32, u32),
    screenshot_count: u64,
    failed_screenshots: u64,
    last_screenshot: Option<DateTime<Utc>>,
}

/// Owns the active backend and adds retries, status tracking and
/// screenshot bookkeeping on top of it.
pub struct DeviceConnector {
    backend: Mutex<Box<dyn DeviceBackend>>,
    backend_name: String,
    settings: ConnectorSettings,
    state: StdMutex<State>,
}

/// Builds the backend named by `connection.connection_type`.
pub fn backend_from_config(config: &AppConfig) -> BotResult<Box<dyn DeviceBackend>> {
    let conn = &config.connection;
    Ok(match conn.connection_type {
        ConnectionType::Usb => Box::new(UsbBackend::new(conn.clone())),
        ConnectionType::Network => Box::new(NetworkBackend::new(conn)),
        ConnectionType::Simulation => Box::new(DesktopBackend::new(DesktopMode::Simulation, conn)),
        ConnectionType::Airplay => Box::new(DesktopBackend::new(DesktopMode::Airplay, conn)),
        ConnectionType::Webdriver => Box::new(WebDriverBackend::new(conn)?),
    })
}

pub fn auto_screenshot_name(at: DateTime<Utc>) -> String {
    format!(
        "auto_screenshot_{}_{:03}.png",
        at.format("%Y%m%d_%H%M%S"),
        at.timestamp_subsec_millis()
    )
}

impl DeviceConnector {
    pub fn new(backend: Box<dyn DeviceBackend>, settings: ConnectorSettings) -> Self {
        let backend_name = backend.name().to_string();
        let screen = backend.screen_size();
        Self {
            backend: Mutex::new(backend),
            backend_name,
            settings,
            state: StdMutex::new(State {
                status: ConnectionStatus::Disconnected,
                info: None,
                screen,
                screenshot_count: 0,
                failed_screenshots: 0,
                last_screenshot: None,
            }),
        }
    }

    pub fn from_config(config: &AppConfig) -> BotResult<Self> {
        Ok(Self::new(
            backend_from_config(config)?,
            ConnectorSettings::from_config(config),
        ))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    pub fn status(&self) -> ConnectionStatus {
        self.with_state(|s| s.status)
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.with_state(|s| s.info.clone())
    }

    pub fn screen_size(&self) -> (u32, u32) {
        self.with_state(|s| s.screen)
    }

    fn attempts(&self) -> u32 {
        self.settings.max_retries.max(1)
    }

    pub async fn connect(&self) -> BotResult<DeviceInfo> {
        self.with_state(|s| s.status = ConnectionStatus::Connecting);
        let mut delay = self.settings.retry_interval;
        let attempts = self.attempts();
        let mut last_err = None;

        for attempt in 1..=attempts {
            let mut backend = self.backend.lock().await;
            match backend.connect().await {
                Ok(info) => {
                    let screen = backend.screen_size();
                    drop(backend);
                    self.with_state(|s| {
                        s.status = ConnectionStatus::Connected;
                        s.info = Some(info.clone());
                        s.screen = screen;
                    });
                    tracing::info!(backend = %self.backend_name, device = %info.name, attempt, "device connected");
                    return Ok(info);
                }
                Err(e) => {
                    drop(backend);
                    tracing::warn!(backend = %self.backend_name, attempt, attempts, error = %e, "connect failed");
                    let fatal = !e.is_retryable();
                    last_err = Some(e);
                    if fatal || attempt == attempts {
                        break;
                    }
                    tokio::time::sleep(delay).await;
                    delay = delay.mul_f64(BACKOFF_FACTOR);
                }
            }
        }

        self.with_state(|s| s.status = ConnectionStatus::Error);
        Err(last_err.unwrap_or_else(|| BotError::Connection("connect failed".into())))
    }

    pub async fn disconnect(&self) -> BotResult<()> {
        let result = self.backend.lock().await.disconnect().await;
        self.with_state(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.info = None;
        });
        tracing::info!(backend = %self.backend_name, "device disconnected");
        result
    }

    fn require_connected(&self) -> BotResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BotError::Connection(format!(
                "{} device is not connected",
                self.backend_name
            )))
        }
    }

    async fn capture_once(&self) -> BotResult<Screenshot> {
        let mut backend = self.backend.lock().await;
        let image = tokio::time::timeout(self.settings.screenshot_timeout, backend.screenshot())
            .await
            .map_err(|_| {
                BotError::Timeout(format!(
                    "screenshot took longer than {}s",
                    self.settings.screenshot_timeout.as_secs_f32()
                ))
            })??;
        if image.width() == 0 || image.height() == 0 {
            return Err(BotError::Screenshot("backend returned an empty image".into()));
        }
        Ok(Screenshot::new(image))
    }

    /// Captures a frame, retrying with 1.5x backoff between attempts.
    pub async fn screenshot(&self) -> BotResult<Screenshot> {
        self.require_connected()?;
        let attempts = self.attempts();
        let mut delay = self.settings.retry_interval;

        for attempt in 1..=attempts {
            match self.capture_once().await {
                Ok(shot) => {
                    self.with_state(|s| {
                        s.screenshot_count += 1;
                        s.last_screenshot = Some(shot.captured_at);
                    });
                    if self.settings.auto_save {
                        let path = self
                            .settings
                            .screenshot_dir
                            .join(auto_screenshot_name(shot.captured_at));
                        if let Err(e) = self.save_screenshot(&shot, &path).await {
                            tracing::warn!(path = %path.display(), error = %e, "auto-save failed");
                        }
                    }
                    return Ok(shot);
                }
                Err(e) => {
                    self.with_state(|s| s.failed_screenshots += 1);
                    if attempt == attempts {
                        tracing::error!(attempts, error = %e, "screenshot failed; giving up");
                        return Err(e);
                    }
                    tracing::warn!(attempt, attempts, delay_s = delay.as_secs_f32(), error = %e, "screenshot failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.mul_f64(BACKOFF_FACTOR);
                }
            }
        }
        Err(BotError::Screenshot("no screenshot attempts were made".into()))
    }

    pub async fn save_screenshot(&self, shot: &Screenshot, path: &Path) -> BotResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let image = shot.image.clone();
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || image.save(&target))
            .await
            .map_err(|e| BotError::Screenshot(format!("save task failed: {e}")))??;
        tracing::debug!(path = %path.display(), "screenshot saved");
        Ok(())
    }

    pub async fn tap(&self, x: i32, y: i32) -> BotResult<()> {
        self.require_connected()?;
        self.backend.lock().await.tap(x, y).await
    }

    pub async fn swipe(&self, from: Point, to: Point, duration: Duration) -> BotResult<()> {
        self.require_connected()?;
        self.backend.lock().await.swipe(from, to, duration).await
    }

    pub async fn long_press(&self, at: Point, duration: Duration) -> BotResult<()> {
        self.require_connected()?;
        self.backend.lock().await.long_press(at, duration).await
    }

    pub async fn home(&self) -> BotResult<()> {
        self.require_connected()?;
        self.backend.lock().await.home().await
    }

    pub fn statistics(&self) -> ConnectorStats {
        self.with_state(|s| ConnectorStats {
            backend: self.backend_name.clone(),
            status: s.status,
            device: s.info.clone(),
            screenshot_count: s.screenshot_count,
            failed_screenshots: s.failed_screenshots,
            last_screenshot: s.last_screenshot,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::mock::{Gesture, MockBackend, MockHandles};
    use chrono::TimeZone;

    pub(crate) fn settings(dir: &Path) -> ConnectorSettings {
        ConnectorSettings {
            max_retries: 3,
            retry_interval: Duration::from_millis(20),
            screenshot_timeout: Duration::from_secs(2),
            auto_save: false,
            screenshot_dir: dir.to_path_buf(),
        }
    }

    pub(crate) async fn connected_mock(screen: (u32, u32)) -> (DeviceConnector, MockHandles) {
        let (backend, handles) = MockBackend::new(screen);
        let connector = DeviceConnector::new(Box::new(backend), settings(Path::new("screens")));
        connector.connect().await.unwrap();
        (connector, handles)
    }

    #[test]
    fn auto_name_has_millis() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap() + chrono::Duration::milliseconds(42);
        assert_eq!(auto_screenshot_name(at), "auto_screenshot_20240309_140507_042.png");
    }

    #[tokio::test]
    async fn screenshot_requires_connection() {
        let (backend, _) = MockBackend::new((10, 10));
        let connector = DeviceConnector::new(Box::new(backend), settings(Path::new(".")));
        assert!(matches!(connector.screenshot().await, Err(BotError::Connection(_))));
        assert!(matches!(connector.tap(1, 1).await, Err(BotError::Connection(_))));
    }

    #[tokio::test]
    async fn screenshot_retries_then_succeeds() {
        let (connector, handles) = connected_mock((16, 9)).await;
        *handles.screenshot_failures.lock().unwrap() = 2;
        let shot = connector.screenshot().await.unwrap();
        assert_eq!((shot.width(), shot.height()), (16, 9));
        assert_eq!(*handles.screenshot_calls.lock().unwrap(), 3);
        let stats = connector.statistics();
        assert_eq!(stats.screenshot_count, 1);
        assert_eq!(stats.failed_screenshots, 2);
        assert!(stats.last_screenshot.is_some());
    }

    #[tokio::test]
    async fn screenshot_gives_up_after_max_retries_with_backoff() {
        let (connector, handles) = connected_mock((16, 9)).await;
        *handles.screenshot_failures.lock().unwrap() = 10;
        let started = std::time::Instant::now();
        assert!(connector.screenshot().await.is_err());
        assert_eq!(*handles.screenshot_calls.lock().unwrap(), 3);
        // 20ms + 30ms of backoff between three attempts
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn auto_save_writes_timestamped_png() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _) = MockBackend::new((8, 8));
        let mut s = settings(dir.path());
        s.auto_save = true;
        let connector = DeviceConnector::new(Box::new(backend), s);
        connector.connect().await.unwrap();
        connector.screenshot().await.unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("auto_screenshot_") && names[0].ends_with(".png"));
    }

    #[tokio::test]
    async fn gestures_pass_through() {
        let (connector, handles) = connected_mock((100, 100)).await;
        connector.tap(5, 6).await.unwrap();
        connector.home().await.unwrap();
        assert_eq!(handles.gestures(), vec![Gesture::Tap(5, 6), Gesture::Home]);
        connector.disconnect().await.unwrap();
        assert_eq!(connector.status(), ConnectionStatus::Disconnected);
    }
}
