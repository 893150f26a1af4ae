//! In-memory backend for driving device-facing code in tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, GrayImage};

use crate::device::traits::DeviceBackend;
use crate::errors::{BotError, BotResult};
use crate::perception::types::{DeviceInfo, Point};

#[derive(Debug, Clone, PartialEq)]
pub enum Gesture {
    Tap(i32, i32),
    Swipe(Point, Point, Duration),
    LongPress(Point, Duration),
    Home,
}

/// Shared handles so a test keeps access after the backend is boxed.
#[derive(Clone, Default)]
pub struct MockHandles {
    pub frames: Arc<Mutex<VecDeque<DynamicImage>>>,
    pub gestures: Arc<Mutex<Vec<Gesture>>>,
    /// Number of upcoming screenshot calls that fail.
    pub screenshot_failures: Arc<Mutex<u32>>,
    pub screenshot_calls: Arc<Mutex<u32>>,
    pub fail_taps: Arc<Mutex<u32>>,
}

impl MockHandles {
    pub fn push_frame(&self, image: DynamicImage) {
        self.frames.lock().unwrap().push_back(image);
    }

    pub fn push_gray(&self, image: GrayImage) {
        self.push_frame(DynamicImage::ImageLuma8(image));
    }

    pub fn gestures(&self) -> Vec<Gesture> {
        self.gestures.lock().unwrap().clone()
    }

    pub fn taps(&self) -> Vec<(i32, i32)> {
        self.gestures()
            .into_iter()
            .filter_map(|g| match g {
                Gesture::Tap(x, y) => Some((x, y)),
                _ => None,
            })
            .collect()
    }
}

pub struct MockBackend {
    pub handles: MockHandles,
    screen: (u32, u32),
    /// Frame served once the queue runs dry.
    last: Option<DynamicImage>,
    info: Option<DeviceInfo>,
}

impl MockBackend {
    pub fn new(screen: (u32, u32)) -> (Self, MockHandles) {
        let handles = MockHandles::default();
        (
            Self {
                handles: handles.clone(),
                screen,
                last: None,
                info: None,
            },
            handles,
        )
    }
}

#[async_trait]
impl DeviceBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&mut self) -> BotResult<DeviceInfo> {
        let info = DeviceInfo {
            udid: "mock-udid".into(),
            name: "Mock iPad".into(),
            screen_size: self.screen,
            scale_factor: 1.0,
            is_connected: true,
            connection_type: "mock".into(),
            ..DeviceInfo::default()
        };
        self.info = Some(info.clone());
        Ok(info)
    }

    async fn disconnect(&mut self) -> BotResult<()> {
        self.info = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.info.is_some()
    }

    fn device_info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    async fn screenshot(&mut self) -> BotResult<DynamicImage> {
        *self.handles.screenshot_calls.lock().unwrap() += 1;
        {
            let mut failures = self.handles.screenshot_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(BotError::Screenshot("mock capture failure".into()));
            }
        }
        if let Some(next) = self.handles.frames.lock().unwrap().pop_front() {
            self.last = Some(next);
        }
        match &self.last {
            Some(img) => Ok(img.clone()),
            None => Ok(DynamicImage::ImageLuma8(GrayImage::new(self.screen.0, self.screen.1))),
        }
    }

    async fn tap(&mut self, x: i32, y: i32) -> BotResult<()> {
        {
            let mut fails = self.handles.fail_taps.lock().unwrap();
            if *fails > 0 {
                *fails -= 1;
                return Err(BotError::Action("mock tap failure".into()));
            }
        }
        self.handles.gestures.lock().unwrap().push(Gesture::Tap(x, y));
        Ok(())
    }

    async fn swipe(&mut self, from: Point, to: Point, duration: Duration) -> BotResult<()> {
        self.handles
            .gestures
            .lock()
            .unwrap()
            .push(Gesture::Swipe(from, to, duration));
        Ok(())
    }

    async fn long_press(&mut self, at: Point, duration: Duration) -> BotResult<()> {
        self.handles
            .gestures
            .lock()
            .unwrap()
            .push(Gesture::LongPress(at, duration));
        Ok(())
    }

    async fn home(&mut self) -> BotResult<()> {
        self.handles.gestures.lock().unwrap().push(Gesture::Home);
        Ok(())
    }

    fn screen_size(&self) -> (u32, u32) {
        self.screen
    }
}
