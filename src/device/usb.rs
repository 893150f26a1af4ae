use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use image::DynamicImage;

use crate::config::ConnectionConfig;
use crate::device::command::{run_tool, run_tool_checked};
use crate::device::traits::DeviceBackend;
use crate::device::tunneld::TunneldManager;
use crate::errors::{BotError, BotResult};
use crate::perception::types::{DeviceInfo, Point};

const USB_TOUCH_UNSUPPORTED: &str =
    "touch input is not available over plain USB; use the webdriver or network connection";

/// USB transport over libimobiledevice and pymobiledevice3 command-line tools.
pub struct UsbBackend {
    config: ConnectionConfig,
    udid: Option<String>,
    info: Option<DeviceInfo>,
    tunneld: TunneldManager,
}

impl UsbBackend {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            udid: config.device_udid.clone(),
            config,
            info: None,
            tunneld: TunneldManager::default(),
        }
    }

    fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.config.external_timeout)
    }

    async fn discover_udid(&self) -> BotResult<String> {
        if let Some(udid) = &self.udid {
            return Ok(udid.clone());
        }
        let out = run_tool_checked(
            "idevice_id",
            &["-l"],
            Duration::from_secs(self.config.usb_timeout),
        )
        .await?;
        first_udid(&out).ok_or_else(|| BotError::DeviceNotFound("no USB device is attached".into()))
    }

    async fn query(&self, udid: &str, key: &str) -> Option<String> {
        match run_tool_checked("ideviceinfo", &["-u", udid, "-k", key], self.external_timeout()).await {
            Ok(v) if !v.is_empty() => Some(v),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(key, error = %e, "ideviceinfo query failed");
                None
            }
        }
    }

    /// First attempt: libimobiledevice. Fallback: the DVT screenshot
    /// service, which requires tunneld on iOS 17+.
    async fn capture_to(&self, udid: &str, path: &Path) -> BotResult<()> {
        let path_str = path.to_string_lossy();
        let primary = run_tool(
            "idevicescreenshot",
            &["-u", udid, path_str.as_ref()],
            self.external_timeout(),
        )
        .await;
        match primary {
            Ok(out) if out.status.success() => return Ok(()),
            Ok(out) => tracing::debug!(
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "idevicescreenshot failed; trying pymobiledevice3"
            ),
            Err(e) => tracing::debug!(error = %e, "idevicescreenshot unavailable; trying pymobiledevice3"),
        }

        run_tool_checked(
            "pymobiledevice3",
            &["developer", "dvt", "screenshot", "--udid", udid, path_str.as_ref()],
            self.external_timeout(),
        )
        .await
        .map(|_| ())
        .map_err(|e| BotError::Screenshot(format!("pymobiledevice3 screenshot failed: {e}")))
    }

    pub fn tunneld(&mut self) -> &mut TunneldManager {
        &mut self.tunneld
    }
}

fn first_udid(idevice_id_output: &str) -> Option<String> {
    idevice_id_output
        .lines()
        .map(|l| l.split_whitespace().next().unwrap_or(""))
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// Major iOS version from `ProductVersion`, e.g. `17` for `"17.4.1"`.
fn ios_major(version: &str) -> Option<u32> {
    version.split('.').next()?.trim().parse().ok()
}

/// Rejects screenshots too small to be a real frame.
pub fn check_file_quality(len: u64, min_size: u64) -> BotResult<()> {
    if len < min_size {
        return Err(BotError::Screenshot(format!(
            "screenshot file is {len} bytes, below the {min_size} byte minimum"
        )));
    }
    Ok(())
}

#[async_trait]
impl DeviceBackend for UsbBackend {
    fn name(&self) -> &str {
        "usb"
    }

    async fn connect(&mut self) -> BotResult<DeviceInfo> {
        let udid = self.discover_udid().await?;
        let name = self.query(&udid, "DeviceName").await.unwrap_or_else(|| "iPad".into());
        let ios_version = self.query(&udid, "ProductVersion").await.unwrap_or_default();
        let model = self.query(&udid, "ProductType").await.unwrap_or_default();

        if self.config.use_tunneld && ios_major(&ios_version).is_some_and(|v| v >= 17) {
            if let Err(e) = self.tunneld.start().await {
                tracing::warn!(error = %e, "tunneld unavailable; DVT screenshots may fail");
            }
        }

        let info = DeviceInfo {
            udid: udid.clone(),
            name,
            ios_version,
            model,
            screen_size: (self.config.screen_width, self.config.screen_height),
            scale_factor: 2.0,
            is_connected: true,
            connection_type: "usb".into(),
        };
        tracing::info!(udid = %info.udid, name = %info.name, ios = %info.ios_version, "USB device connected");
        self.udid = Some(udid);
        self.info = Some(info.clone());
        Ok(info)
    }

    async fn disconnect(&mut self) -> BotResult<()> {
        self.info = None;
        self.tunneld.stop().await
    }

    fn is_connected(&self) -> bool {
        self.info.is_some()
    }

    fn device_info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    async fn screenshot(&mut self) -> BotResult<DynamicImage> {
        let udid = self
            .udid
            .clone()
            .ok_or_else(|| BotError::Connection("USB device not connected".into()))?;
        let file = tempfile::Builder::new()
            .prefix("sgz_shot_")
            .suffix(".png")
            .tempfile()?;
        self.capture_to(&udid, file.path()).await?;

        let bytes = tokio::fs::read(file.path()).await?;
        if self.config.quality_check {
            check_file_quality(bytes.len() as u64, self.config.min_file_size)?;
        }
        let image = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
            .await
            .map_err(|e| BotError::Screenshot(format!("decode task failed: {e}")))??;
        Ok(image)
    }

    async fn tap(&mut self, x: i32, y: i32) -> BotResult<()> {
        tracing::warn!(x, y, "{USB_TOUCH_UNSUPPORTED}");
        Err(BotError::Action(USB_TOUCH_UNSUPPORTED.into()))
    }

    async fn swipe(&mut self, from: Point, to: Point, _duration: Duration) -> BotResult<()> {
        tracing::warn!(?from, ?to, "{USB_TOUCH_UNSUPPORTED}");
        Err(BotError::Action(USB_TOUCH_UNSUPPORTED.into()))
    }

    fn screen_size(&self) -> (u32, u32) {
        (self.config.screen_width, self.config.screen_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_udid_skips_blank_lines() {
        assert_eq!(
            first_udid("\n00008103-001A2B3C4D5E6F70 (USB)\n11111111\n").as_deref(),
            Some("00008103-001A2B3C4D5E6F70")
        );
        assert_eq!(first_udid("  \n"), None);
    }

    #[test]
    fn ios_major_parses_product_version() {
        assert_eq!(ios_major("17.4.1"), Some(17));
        assert_eq!(ios_major("16"), Some(16));
        assert_eq!(ios_major(""), None);
    }

    #[test]
    fn small_files_fail_quality_check() {
        assert!(check_file_quality(512, 1024).is_err());
        assert!(check_file_quality(4096, 1024).is_ok());
    }

    #[tokio::test]
    async fn touch_is_rejected() {
        let mut backend = UsbBackend::new(ConnectionConfig::default());
        assert!(matches!(backend.tap(1, 1).await, Err(BotError::Action(_))));
        assert!(!backend.is_connected());
        assert!(matches!(backend.screenshot().await, Err(BotError::Connection(_))));
    }
}
