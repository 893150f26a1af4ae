//! Host-screen transports: a simulation region centred on the primary
//! monitor, or the window of an AirPlay mirror. Both capture with `xcap`
//! and inject mouse input with `enigo`.

use std::time::Duration;

use async_trait::async_trait;
use enigo::{
    Button,
    Coordinate::Abs,
    Direction::{Click, Press, Release},
    Enigo, Mouse, Settings,
};
use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use xcap::Monitor;

use crate::config::ConnectionConfig;
use crate::device::traits::DeviceBackend;
use crate::errors::{BotError, BotResult};
use crate::perception::types::{DeviceInfo, Point, Rect};

const SWIPE_STEPS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesktopMode {
    Simulation,
    Airplay,
}

impl DesktopMode {
    fn as_str(&self) -> &'static str {
        match self {
            DesktopMode::Simulation => "simulation",
            DesktopMode::Airplay => "airplay",
        }
    }
}

/// Region on the host screen that stands in for the device: centred, and
/// shrunk to 90% of the largest fitting scale when the device does not fit.
pub fn simulation_region(host: (u32, u32), device: (u32, u32)) -> Rect {
    let (hw, hh) = host;
    let (dw, dh) = device;
    if dw > hw || dh > hh {
        let scale = (hw as f64 / dw as f64).min(hh as f64 / dh as f64) * 0.9;
        let w = (dw as f64 * scale) as u32;
        let h = (dh as f64 * scale) as u32;
        Rect::new(((hw - w) / 2) as i32, ((hh - h) / 2) as i32, w, h)
    } else {
        Rect::new(((hw - dw) / 2) as i32, ((hh - dh) / 2) as i32, dw, dh)
    }
}

/// Maps device pixels into a host region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionMapper {
    pub region: Rect,
    pub device: (u32, u32),
}

impl RegionMapper {
    pub fn map(&self, p: Point) -> Point {
        let sx = self.region.width as f64 / self.device.0 as f64;
        let sy = self.region.height as f64 / self.device.1 as f64;
        Point::new(
            self.region.x + (p.x as f64 * sx) as i32,
            self.region.y + (p.y as f64 * sy) as i32,
        )
    }
}

fn primary_monitor() -> BotResult<Monitor> {
    Monitor::all()
        .map_err(|e| BotError::Screenshot(format!("enumerate monitors: {e}")))?
        .into_iter()
        .next()
        .ok_or_else(|| BotError::DeviceNotFound("no monitor available for capture".into()))
}

fn capture_monitor() -> BotResult<RgbaImage> {
    let frame = primary_monitor()?
        .capture_image()
        .map_err(|e| BotError::Screenshot(format!("screen capture failed: {e}")))?;
    // xcap links an older `image`; rebuild the buffer in this crate's version.
    let (w, h) = (frame.width(), frame.height());
    RgbaImage::from_raw(w, h, frame.into_raw())
        .ok_or_else(|| BotError::Screenshot("screen capture buffer size mismatch".into()))
}

/// Crops the region out of a host capture and scales it to device pixels,
/// so frame coordinates are the ones [`RegionMapper`] maps back for input.
/// A region clipped by the capture edge keeps the same scale.
pub fn frame_from_capture(full: &RgbaImage, region: Rect, device: (u32, u32)) -> BotResult<DynamicImage> {
    let x = region.x.max(0) as u32;
    let y = region.y.max(0) as u32;
    if x >= full.width() || y >= full.height() || region.width == 0 || region.height == 0 {
        return Err(BotError::Screenshot(format!(
            "region {region:?} lies outside the {}x{} capture",
            full.width(),
            full.height()
        )));
    }
    let w = region.width.min(full.width() - x);
    let h = region.height.min(full.height() - y);
    let crop = image::imageops::crop_imm(full, x, y, w, h).to_image();

    let out_w = ((w as u64 * device.0 as u64) / region.width as u64).max(1) as u32;
    let out_h = ((h as u64 * device.1 as u64) / region.height as u64).max(1) as u32;
    if (out_w, out_h) == (w, h) {
        return Ok(DynamicImage::ImageRgba8(crop));
    }
    Ok(DynamicImage::ImageRgba8(image::imageops::resize(
        &crop,
        out_w,
        out_h,
        FilterType::Triangle,
    )))
}

fn input_error(e: impl std::fmt::Display) -> BotError {
    BotError::Action(e.to_string())
}

fn host_tap(p: Point) -> BotResult<()> {
    let mut enigo = Enigo::new(&Settings::default()).map_err(input_error)?;
    enigo.move_mouse(p.x, p.y, Abs).map_err(input_error)?;
    enigo.button(Button::Left, Click).map_err(input_error)
}

fn host_drag(from: Point, to: Point, duration: Duration) -> BotResult<()> {
    let mut enigo = Enigo::new(&Settings::default()).map_err(input_error)?;
    enigo.move_mouse(from.x, from.y, Abs).map_err(input_error)?;
    enigo.button(Button::Left, Press).map_err(input_error)?;

    let pause = duration / SWIPE_STEPS;
    let dx = (to.x - from.x) as f64 / SWIPE_STEPS as f64;
    let dy = (to.y - from.y) as f64 / SWIPE_STEPS as f64;
    for i in 1..=SWIPE_STEPS {
        let x = from.x + (dx * i as f64) as i32;
        let y = from.y + (dy * i as f64) as i32;
        if let Err(e) = enigo.move_mouse(x, y, Abs) {
            let _ = enigo.button(Button::Left, Release);
            return Err(input_error(e));
        }
        std::thread::sleep(pause);
    }
    enigo.button(Button::Left, Release).map_err(input_error)
}

pub struct DesktopBackend {
    mode: DesktopMode,
    device: (u32, u32),
    airplay_region: Option<[i32; 4]>,
    /// Region in capture pixels.
    region: Option<Rect>,
    /// Capture pixels per input coordinate unit (2.0 on HiDPI hosts).
    host_scale: f64,
    info: Option<DeviceInfo>,
}

impl DesktopBackend {
    pub fn new(mode: DesktopMode, config: &ConnectionConfig) -> Self {
        Self {
            mode,
            device: (config.screen_width, config.screen_height),
            airplay_region: config.airplay_region,
            region: None,
            host_scale: 1.0,
            info: None,
        }
    }

    fn region(&self) -> BotResult<Rect> {
        self.region
            .ok_or_else(|| BotError::Connection(format!("{} region not set up", self.mode.as_str())))
    }

    /// Device pixel to host input coordinate.
    fn to_host(&self, p: Point) -> BotResult<Point> {
        let mapped = RegionMapper {
            region: self.region()?,
            device: self.device,
        }
        .map(p);
        Ok(Point::new(
            (mapped.x as f64 / self.host_scale) as i32,
            (mapped.y as f64 / self.host_scale) as i32,
        ))
    }
}

#[async_trait]
impl DeviceBackend for DesktopBackend {
    fn name(&self) -> &str {
        self.mode.as_str()
    }

    async fn connect(&mut self) -> BotResult<DeviceInfo> {
        let (capture_w, capture_h, logical_w) = tokio::task::spawn_blocking(|| {
            let monitor = primary_monitor()?;
            let frame = monitor
                .capture_image()
                .map_err(|e| BotError::Screenshot(format!("screen capture failed: {e}")))?;
            Ok::<_, BotError>((frame.width(), frame.height(), monitor.width()))
        })
        .await
        .map_err(|e| BotError::Connection(format!("capture task failed: {e}")))??;

        self.host_scale = if logical_w > 0 {
            capture_w as f64 / logical_w as f64
        } else {
            1.0
        };

        let region = match self.mode {
            DesktopMode::Simulation => simulation_region((capture_w, capture_h), self.device),
            DesktopMode::Airplay => {
                let [x, y, w, h] = self.airplay_region.ok_or_else(|| {
                    BotError::Config("connection.airplay_region is required for airplay".into())
                })?;
                if w <= 0 || h <= 0 {
                    return Err(BotError::Config(format!("invalid airplay region {w}x{h}")));
                }
                Rect::new(x, y, w as u32, h as u32)
            }
        };
        tracing::info!(mode = self.mode.as_str(), ?region, host_scale = self.host_scale, "host region ready");
        self.region = Some(region);

        let info = DeviceInfo {
            udid: format!("{}-{}x{}", self.mode.as_str(), self.device.0, self.device.1),
            name: format!("iPad ({})", self.mode.as_str()),
            screen_size: self.device,
            scale_factor: 1.0,
            is_connected: true,
            connection_type: self.mode.as_str().to_string(),
            ..DeviceInfo::default()
        };
        self.info = Some(info.clone());
        Ok(info)
    }

    async fn disconnect(&mut self) -> BotResult<()> {
        self.region = None;
        self.info = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.region.is_some()
    }

    fn device_info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    async fn screenshot(&mut self) -> BotResult<DynamicImage> {
        let region = self.region()?;
        let device = self.device;
        tokio::task::spawn_blocking(move || frame_from_capture(&capture_monitor()?, region, device))
            .await
            .map_err(|e| BotError::Screenshot(format!("capture task failed: {e}")))?
    }

    async fn tap(&mut self, x: i32, y: i32) -> BotResult<()> {
        let host = self.to_host(Point::new(x, y))?;
        tracing::debug!(x, y, host_x = host.x, host_y = host.y, "host tap");
        tokio::task::spawn_blocking(move || host_tap(host))
            .await
            .map_err(|e| BotError::Action(format!("input task failed: {e}")))?
    }

    async fn swipe(&mut self, from: Point, to: Point, duration: Duration) -> BotResult<()> {
        let a = self.to_host(from)?;
        let b = self.to_host(to)?;
        tracing::debug!(?a, ?b, ms = duration.as_millis() as u64, "host drag");
        tokio::task::spawn_blocking(move || host_drag(a, b, duration))
            .await
            .map_err(|e| BotError::Action(format!("input task failed: {e}")))?
    }

    fn screen_size(&self) -> (u32, u32) {
        self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_centred_when_device_fits() {
        assert_eq!(
            simulation_region((3840, 2160), (2732, 2048)),
            Rect::new(554, 56, 2732, 2048)
        );
    }

    #[test]
    fn region_shrinks_when_device_is_larger() {
        let r = simulation_region((1920, 1080), (2732, 2048));
        // min(1920/2732, 1080/2048) * 0.9 = 0.474609375
        assert_eq!((r.width, r.height), (1296, 972));
        assert_eq!((r.x, r.y), (312, 54));
    }

    #[test]
    fn mapper_scales_and_offsets() {
        let mapper = RegionMapper {
            region: Rect::new(100, 50, 1366, 1024),
            device: (2732, 2048),
        };
        assert_eq!(mapper.map(Point::new(0, 0)), Point::new(100, 50));
        assert_eq!(mapper.map(Point::new(2732, 2048)), Point::new(1466, 1074));
        assert_eq!(mapper.map(Point::new(1000, 501)), Point::new(600, 300));
    }

    #[tokio::test]
    async fn airplay_without_region_fails_before_input() {
        let mut backend = DesktopBackend::new(DesktopMode::Airplay, &ConnectionConfig::default());
        assert!(!backend.is_connected());
        assert!(matches!(backend.tap(10, 10).await, Err(BotError::Connection(_))));
        assert!(matches!(backend.home().await, Err(BotError::Action(_))));
    }

    /// Capture whose red and green channels hold the pixel's own x and y.
    fn coordinate_capture(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| image::Rgba([x as u8, y as u8, 0, 255]))
    }

    #[test]
    fn frame_is_device_sized_and_taps_land_on_the_same_pixel() {
        let full = coordinate_capture(200, 160);
        let region = Rect::new(50, 40, 100, 75);
        let device = (200, 150);
        let frame = frame_from_capture(&full, region, device).unwrap().to_rgba8();
        assert_eq!(frame.dimensions(), device);

        let mapper = RegionMapper { region, device };
        for (fx, fy) in [(10, 10), (100, 75), (150, 20), (190, 140)] {
            let seen = frame.get_pixel(fx, fy);
            let host = mapper.map(Point::new(fx as i32, fy as i32));
            assert!((seen[0] as i32 - host.x).abs() <= 2, "x at {fx},{fy}: {seen:?} vs {host:?}");
            assert!((seen[1] as i32 - host.y).abs() <= 2, "y at {fx},{fy}: {seen:?} vs {host:?}");
        }
    }

    #[test]
    fn clipped_region_keeps_its_scale() {
        let full = coordinate_capture(120, 100);
        let frame = frame_from_capture(&full, Rect::new(60, 50, 100, 100), (200, 200)).unwrap();
        assert_eq!((frame.width(), frame.height()), (120, 100));
        assert!(frame_from_capture(&full, Rect::new(130, 0, 10, 10), (20, 20)).is_err());
    }
}
