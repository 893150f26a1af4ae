//! TCP companion protocol spoken by the on-device client.
//!
//! Commands are bare ASCII words without a terminator. Replies are `OK`
//! except for `SCREENSHOT`, which answers with an 8-byte big-endian length
//! followed by the encoded image.

use std::time::Duration;

use async_trait::async_trait;
use image::DynamicImage;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::ConnectionConfig;
use crate::device::traits::DeviceBackend;
use crate::errors::{BotError, BotResult};
use crate::perception::types::{DeviceInfo, Point};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_FRAME: u64 = 64 * 1024 * 1024;
const ERROR_REPLY: &[u8] = b"ERROR";

pub struct NetworkBackend {
    addr: String,
    screen: (u32, u32),
    frame_timeout: Duration,
    stream: Option<TcpStream>,
    info: Option<DeviceInfo>,
}

impl NetworkBackend {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            addr: format!("{}:{}", config.device_ip, config.device_port),
            screen: (config.screen_width, config.screen_height),
            frame_timeout: Duration::from_secs(config.screenshot_timeout),
            stream: None,
            info: None,
        }
    }

    /// The live stream, reopened when an earlier exchange was abandoned
    /// midway and the connection dropped to resynchronise.
    async fn ensure_stream(&mut self) -> BotResult<&mut TcpStream> {
        if self.stream.is_none() {
            if self.info.is_none() {
                return Err(BotError::Connection(format!("not connected to {}", self.addr)));
            }
            tracing::warn!(addr = %self.addr, "reopening companion connection");
            self.open().await?;
        }
        self.stream
            .as_mut()
            .ok_or_else(|| BotError::Connection(format!("not connected to {}", self.addr)))
    }

    /// Connects and performs the `HELLO` handshake.
    async fn open(&mut self) -> BotResult<()> {
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| BotError::Timeout(format!("connect to {} timed out", self.addr)))?
            .map_err(|e| BotError::Connection(format!("connect to {}: {e}", self.addr)))?;
        stream.set_nodelay(true)?;
        Self::exchange(&mut stream, "HELLO")
            .await
            .map_err(|e| BotError::Connection(format!("handshake failed: {e}")))?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn exchange(stream: &mut TcpStream, cmd: &str) -> BotResult<()> {
        stream.write_all(cmd.as_bytes()).await?;
        let mut buf = [0u8; 1024];
        let n = tokio::time::timeout(REPLY_TIMEOUT, stream.read(&mut buf))
            .await
            .map_err(|_| BotError::Timeout(format!("no reply to {cmd}")))??;
        if n == 0 {
            return Err(BotError::Connection("device closed the connection".into()));
        }
        let reply = String::from_utf8_lossy(&buf[..n]);
        if reply.trim() != "OK" {
            return Err(BotError::Action(format!(
                "{cmd} rejected by device: {}",
                reply.trim()
            )));
        }
        Ok(())
    }

    /// Sends one command and expects `OK`. A reply that never came leaves
    /// the stream in an unknown state, so it is dropped.
    async fn command(&mut self, cmd: &str) -> BotResult<()> {
        let stream = self.ensure_stream().await?;
        let result = Self::exchange(stream, cmd).await;
        if matches!(
            result,
            Err(BotError::Timeout(_) | BotError::Connection(_) | BotError::Io(_))
        ) {
            self.stream = None;
        }
        result
    }

    async fn read_frame(stream: &mut TcpStream) -> BotResult<Vec<u8>> {
        let mut header = [0u8; 8];
        let mut filled = 0;
        while filled < header.len() {
            let n = stream.read(&mut header[filled..]).await?;
            if n == 0 {
                return Err(BotError::Connection("device closed the connection mid-frame".into()));
            }
            filled += n;
            if filled >= ERROR_REPLY.len() && header.starts_with(ERROR_REPLY) {
                return Err(BotError::Screenshot("device could not capture the screen".into()));
            }
        }
        let len = u64::from_be_bytes(header);
        if len == 0 || len > MAX_FRAME {
            return Err(BotError::Screenshot(format!(
                "device announced an invalid frame of {len} bytes"
            )));
        }
        let mut data = vec![0u8; len as usize];
        stream.read_exact(&mut data).await?;
        Ok(data)
    }
}

#[async_trait]
impl DeviceBackend for NetworkBackend {
    fn name(&self) -> &str {
        "network"
    }

    async fn connect(&mut self) -> BotResult<DeviceInfo> {
        tracing::info!(addr = %self.addr, "connecting to companion client");
        self.open().await?;

        let info = DeviceInfo {
            udid: self.addr.clone(),
            name: "iPad (network)".into(),
            screen_size: self.screen,
            scale_factor: 2.0,
            is_connected: true,
            connection_type: "network".into(),
            ..DeviceInfo::default()
        };
        self.info = Some(info.clone());
        tracing::info!(addr = %self.addr, "companion client connected");
        Ok(info)
    }

    async fn disconnect(&mut self) -> BotResult<()> {
        self.info = None;
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.info.is_some()
    }

    fn device_info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    async fn screenshot(&mut self) -> BotResult<DynamicImage> {
        let frame_timeout = self.frame_timeout;
        let stream = self.ensure_stream().await?;
        let received = async {
            stream.write_all(b"SCREENSHOT").await?;
            tokio::time::timeout(frame_timeout, Self::read_frame(stream))
                .await
                .map_err(|_| BotError::Timeout("screenshot frame did not arrive".into()))?
        }
        .await;
        let data = match received {
            Ok(data) => data,
            Err(e) => {
                // unread frame bytes would be taken as the next reply
                self.stream = None;
                return Err(e);
            }
        };
        tracing::debug!(bytes = data.len(), "received screenshot frame");
        let image = tokio::task::spawn_blocking(move || image::load_from_memory(&data))
            .await
            .map_err(|e| BotError::Screenshot(format!("decode task failed: {e}")))??;
        Ok(image)
    }

    async fn tap(&mut self, x: i32, y: i32) -> BotResult<()> {
        self.command(&format!("TAP {x} {y}")).await
    }

    async fn swipe(&mut self, from: Point, to: Point, duration: Duration) -> BotResult<()> {
        self.command(&format!(
            "SWIPE {} {} {} {} {}",
            from.x,
            from.y,
            to.x,
            to.y,
            duration.as_millis()
        ))
        .await
    }

    async fn home(&mut self) -> BotResult<()> {
        self.command("HOME").await
    }

    fn screen_size(&self) -> (u32, u32) {
        self.screen
    }
}
