use std::time::Duration;

use async_trait::async_trait;
use image::DynamicImage;

use crate::errors::{BotError, BotResult};
use crate::perception::types::{DeviceInfo, Point};

/// One transport to the iPad: capture plus touch input.
///
/// Coordinates are device pixels, matching the screenshots the backend
/// returns.
#[async_trait]
pub trait DeviceBackend: Send {
    fn name(&self) -> &str;

    async fn connect(&mut self) -> BotResult<DeviceInfo>;

    async fn disconnect(&mut self) -> BotResult<()>;

    fn is_connected(&self) -> bool;

    fn device_info(&self) -> Option<&DeviceInfo>;

    async fn screenshot(&mut self) -> BotResult<DynamicImage>;

    async fn tap(&mut self, x: i32, y: i32) -> BotResult<()>;

    async fn swipe(&mut self, from: Point, to: Point, duration: Duration) -> BotResult<()>;

    /// A long press is a zero-length swipe unless the transport has a
    /// native gesture.
    async fn long_press(&mut self, at: Point, duration: Duration) -> BotResult<()> {
        self.swipe(at, at, duration).await
    }

    async fn home(&mut self) -> BotResult<()> {
        Err(BotError::Action(format!(
            "{} connection cannot press the home button",
            self.name()
        )))
    }

    fn screen_size(&self) -> (u32, u32);
}
