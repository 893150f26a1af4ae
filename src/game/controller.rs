use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::GrayImage;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::{ControllerConfig, MovementStrategy};
use crate::device::DeviceConnector;
use crate::errors::{BotError, BotResult};
use crate::executor::SafeMode;
use crate::perception::screen_analyzer::ScreenAnalyzer;
use crate::perception::template::TemplateMatcher;
use crate::perception::types::{AnalysisResult, Element, Point, ScreenType, Screenshot};

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub action_delay: (Duration, Duration),
    pub screenshot_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub safe_mode: bool,
    pub max_continuous_actions: u32,
    pub pause_duration: Duration,
    pub max_navigation_depth: u32,
    pub wait_timeout: Duration,
    pub wait_interval: Duration,
    /// Pause after a navigation tap or an exploring swipe.
    pub settle: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        let secs = |s: f64| Duration::from_secs_f64(s.max(0.0));
        Self {
            action_delay: (secs(config.action_delay_min), secs(config.action_delay_max)),
            screenshot_interval: secs(config.screenshot_interval),
            max_retries: config.max_retries,
            retry_delay: secs(config.retry_delay),
            safe_mode: config.safe_mode,
            max_continuous_actions: config.max_continuous_actions,
            pause_duration: Duration::from_secs(config.pause_duration),
            max_navigation_depth: config.max_navigation_depth.max(1),
            wait_timeout: Duration::from_secs(10),
            wait_interval: Duration::from_secs(1),
            settle: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStats {
    pub actions: u64,
    pub screenshots: u64,
    pub safe_mode_pauses: u32,
    pub dry_run: bool,
}

struct ControllerState {
    last_shot: Option<(Screenshot, Instant)>,
    last_analysis: Option<AnalysisResult>,
    safe: SafeMode,
    actions: u64,
    screenshots: u64,
}

/// Game-level operations on top of the device and template matching.
pub struct GameController {
    device: Arc<DeviceConnector>,
    analyzer: ScreenAnalyzer,
    settings: ControllerSettings,
    dry_run: bool,
    state: Mutex<ControllerState>,
}

fn random_between(min: Duration, max: Duration) -> Duration {
    if max > min {
        Duration::from_secs_f64(rand::random_range(min.as_secs_f64()..=max.as_secs_f64()))
    } else {
        min
    }
}

fn jitter(extent: u32) -> i32 {
    let j = (extent / 4) as i32;
    if j == 0 {
        0
    } else {
        rand::random_range(-j..=j)
    }
}

/// Swipe from 3/4 to 1/4 of the screen in a random direction.
fn exploring_swipe((w, h): (u32, u32)) -> (Point, Point) {
    let (w, h) = (w as i32, h as i32);
    let directions = [
        (Point::new(w / 2, h * 3 / 4), Point::new(w / 2, h / 4)),
        (Point::new(w / 2, h / 4), Point::new(w / 2, h * 3 / 4)),
        (Point::new(w * 3 / 4, h / 2), Point::new(w / 4, h / 2)),
        (Point::new(w / 4, h / 2), Point::new(w * 3 / 4, h / 2)),
    ];
    directions[rand::random_range(0..directions.len())]
}

fn strategy_target(strategy: MovementStrategy) -> &'static str {
    match strategy {
        MovementStrategy::Nearest => "empty_land",
        MovementStrategy::Resources => "resource_point",
        MovementStrategy::Enemy => "enemy_land",
    }
}

fn quiet<T: Default>(name: &str, found: BotResult<T>) -> BotResult<T> {
    match found {
        Err(BotError::TemplateNotFound(_)) => {
            tracing::debug!(template = name, "no template loaded");
            Ok(T::default())
        }
        other => other,
    }
}

impl GameController {
    pub fn new(device: Arc<DeviceConnector>, matcher: TemplateMatcher, settings: ControllerSettings, dry_run: bool) -> Self {
        let safe = SafeMode::new(settings.safe_mode, settings.max_continuous_actions, settings.pause_duration);
        Self {
            device,
            analyzer: ScreenAnalyzer::new(matcher),
            settings,
            dry_run,
            state: Mutex::new(ControllerState {
                last_shot: None,
                last_analysis: None,
                safe,
                actions: 0,
                screenshots: 0,
            }),
        }
    }

    pub fn device(&self) -> &Arc<DeviceConnector> {
        &self.device
    }

    pub fn analyzer(&self) -> &ScreenAnalyzer {
        &self.analyzer
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Returns the cached frame when it is younger than
    /// `screenshot_interval`, unless `force` is set.
    pub async fn screenshot(&self, force: bool) -> BotResult<Screenshot> {
        if !force {
            let state = self.state.lock().await;
            if let Some((shot, at)) = &state.last_shot {
                if at.elapsed() < self.settings.screenshot_interval {
                    return Ok(shot.clone());
                }
            }
        }
        let shot = self.device.screenshot().await?;
        let mut state = self.state.lock().await;
        state.last_shot = Some((shot.clone(), Instant::now()));
        state.screenshots += 1;
        Ok(shot)
    }

    /// Captures a fresh frame and runs `f` on it off the async runtime.
    async fn on_frame<R, F>(&self, f: F) -> BotResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&ScreenAnalyzer, &GrayImage) -> R + Send + 'static,
    {
        let shot = self.screenshot(true).await?;
        let analyzer = self.analyzer.clone();
        tokio::task::spawn_blocking(move || f(&analyzer, &shot.to_gray()))
            .await
            .map_err(|e| BotError::Vision(format!("matching task failed: {e}")))
    }

    pub async fn analyze_screen(&self, force: bool) -> BotResult<AnalysisResult> {
        let shot = self.screenshot(force).await?;
        let analyzer = self.analyzer.clone();
        let result = tokio::task::spawn_blocking(move || analyzer.analyze(&shot.to_gray()))
            .await
            .map_err(|e| BotError::Vision(format!("analysis task failed: {e}")))?;
        self.state.lock().await.last_analysis = Some(result.clone());
        Ok(result)
    }

    pub async fn last_analysis(&self) -> Option<AnalysisResult> {
        self.state.lock().await.last_analysis.clone()
    }

    pub async fn find(&self, name: &str) -> BotResult<Option<Element>> {
        let owned = name.to_string();
        self.on_frame(move |a, gray| a.matcher().find(gray, &owned)).await?
    }

    pub async fn find_all(&self, name: &str) -> BotResult<Vec<Element>> {
        let owned = name.to_string();
        self.on_frame(move |a, gray| a.matcher().find_all(gray, &owned)).await?
    }

    /// Polls for `name` until it appears or `timeout` passes.
    pub async fn wait_for_element(&self, name: &str, timeout: Duration, interval: Duration) -> BotResult<Option<Element>> {
        let started = Instant::now();
        loop {
            if let Some(el) = self.find(name).await? {
                tracing::debug!(element = name, waited_ms = started.elapsed().as_millis() as u64, "element appeared");
                return Ok(Some(el));
            }
            if started.elapsed() + interval > timeout {
                tracing::warn!(element = name, timeout_s = timeout.as_secs_f32(), "element did not appear");
                return Ok(None);
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn wait_default(&self, name: &str) -> BotResult<Option<Element>> {
        self.wait_for_element(name, self.settings.wait_timeout, self.settings.wait_interval)
            .await
    }

    /// Safe-mode bookkeeping plus the post-action human-like delay.
    async fn gesture<F, Fut>(&self, what: &str, call: F) -> BotResult<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = BotResult<()>>,
    {
        let pause = self.state.lock().await.safe.record();
        if let Some(pause) = pause {
            tokio::time::sleep(pause).await;
        }

        let result = if self.dry_run {
            tracing::info!(gesture = what, "dry run");
            Ok(())
        } else {
            self.retrying(what, call).await
        };

        self.state.lock().await.actions += 1;
        tokio::time::sleep(random_between(self.settings.action_delay.0, self.settings.action_delay.1)).await;
        result
    }

    async fn retrying<F, Fut>(&self, what: &str, call: F) -> BotResult<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = BotResult<()>>,
    {
        let mut result = call().await;
        for retry in 1..=self.settings.max_retries {
            match &result {
                Ok(()) => break,
                Err(e) => {
                    tracing::debug!(gesture = what, retry, max = self.settings.max_retries, error = %e, "retrying gesture");
                    tokio::time::sleep(self.settings.retry_delay).await;
                    result = call().await;
                }
            }
        }
        if let Err(e) = &result {
            tracing::warn!(gesture = what, error = %e, "gesture failed after retries");
        }
        result
    }

    pub async fn tap(&self, x: i32, y: i32) -> BotResult<()> {
        tracing::debug!(x, y, "tap");
        self.gesture("tap", || self.device.tap(x, y)).await
    }

    /// Taps near the element center, offset by up to a quarter of its size.
    pub async fn tap_element(&self, element: &Element) -> BotResult<()> {
        let c = element.center();
        let x = c.x + jitter(element.rect.width);
        let y = c.y + jitter(element.rect.height);
        tracing::debug!(element = %element.name, x, y, "tap element");
        self.gesture("tap", || self.device.tap(x, y)).await
    }

    /// Swipes with a random 0.3 to 0.8 second duration unless one is given.
    pub async fn swipe(&self, from: Point, to: Point, duration: Option<Duration>) -> BotResult<()> {
        let duration =
            duration.unwrap_or_else(|| random_between(Duration::from_millis(300), Duration::from_millis(800)));
        tracing::debug!(?from, ?to, duration_ms = duration.as_millis() as u64, "swipe");
        self.gesture("swipe", || self.device.swipe(from, to, duration)).await
    }

    /// Walks back towards `target` by tapping `back_button` or
    /// `close_button` until the screen is recognised.
    async fn navigate_to(&self, target: ScreenType, entry: Option<(ScreenType, &'static str)>) -> BotResult<bool> {
        for depth in 0..self.settings.max_navigation_depth {
            let step = self
                .on_frame(move |a, gray| {
                    let (screen, _) = a.detect_screen(gray);
                    let entry_button = entry
                        .filter(|(from, _)| *from == screen)
                        .and_then(|(_, button)| a.matcher().find_first(gray, &[button]));
                    let escape = a.matcher().find_first(gray, &["back_button", "close_button"]);
                    (screen, entry_button, escape)
                })
                .await?;

            let (screen, entry_button, escape) = step;
            if screen == target {
                tracing::debug!(screen = %target, depth, "navigation reached target");
                return Ok(true);
            }
            let Some(button) = entry_button.or(escape) else {
                break;
            };
            tracing::debug!(screen = %screen, via = %button.name, depth, "navigating");
            self.tap_element(&button).await?;
            tokio::time::sleep(self.settings.settle).await;
        }
        tracing::warn!(target = %target, "navigation failed");
        Ok(false)
    }

    pub async fn navigate_to_world_map(&self) -> BotResult<bool> {
        self.navigate_to(ScreenType::WorldMap, Some((ScreenType::MainMenu, "world_map")))
            .await
    }

    pub async fn navigate_to_main_menu(&self) -> BotResult<bool> {
        self.navigate_to(ScreenType::MainMenu, None).await
    }

    /// Taps each named element in turn once it appears.
    async fn follow(&self, steps: &[&str]) -> BotResult<bool> {
        for name in steps {
            let Some(el) = quiet(name, self.wait_default(name).await)? else {
                tracing::warn!(element = name, "expected element missing");
                return Ok(false);
            };
            self.tap_element(&el).await?;
        }
        Ok(true)
    }

    async fn land_targets(&self, prefer_resources: bool, max_distance: u32) -> BotResult<Vec<Element>> {
        let (w, h) = self.device.screen_size();
        let center = Point::new(w as i32 / 2, h as i32 / 2);
        self.on_frame(move |a, gray| -> BotResult<Vec<Element>> {
            let mut groups = Vec::new();
            if prefer_resources {
                groups.push(quiet("resource_point", a.matcher().find_all(gray, "resource_point"))?);
            }
            groups.push(quiet("empty_land", a.matcher().find_all(gray, "empty_land"))?);
            let mut targets = Vec::new();
            for mut group in groups {
                group.retain(|e| e.center().distance(center) <= max_distance as f64);
                TemplateMatcher::sort_by_distance(&mut group, center);
                targets.extend(group);
            }
            Ok(targets)
        })
        .await?
    }

    pub async fn find_and_occupy_land(&self, prefer_resources: bool, max_distance: u32) -> BotResult<bool> {
        if !self.navigate_to_world_map().await? {
            return Ok(false);
        }
        let mut targets = self.land_targets(prefer_resources, max_distance).await?;
        if targets.is_empty() {
            tracing::info!("no land in view; exploring");
            let (from, to) = exploring_swipe(self.device.screen_size());
            self.swipe(from, to, None).await?;
            tokio::time::sleep(self.settings.settle).await;
            targets = self.land_targets(prefer_resources, max_distance).await?;
        }
        let Some(target) = targets.into_iter().next() else {
            tracing::info!("no land to occupy");
            return Ok(false);
        };

        tracing::info!(target = %target.name, "occupying");
        self.tap_element(&target).await?;
        let done = self.follow(&["army_select", "army_occupy", "confirm_button"]).await?;
        if done {
            tracing::info!(target = %target.name, "land occupied");
        }
        Ok(done)
    }

    pub async fn move_idle_army(&self, strategy: MovementStrategy) -> BotResult<bool> {
        if !self.navigate_to_world_map().await? {
            return Ok(false);
        }
        let Some(army) = quiet("army_idle", self.find_all("army_idle").await)?.into_iter().next() else {
            tracing::info!("no idle army");
            return Ok(false);
        };
        self.tap_element(&army).await?;

        let target_name = strategy_target(strategy);
        let Some(target) = quiet(target_name, self.find_all(target_name).await)?.into_iter().next() else {
            tracing::info!(target = target_name, "no march target; cancelling");
            if let Some(cancel) = quiet("cancel_button", self.find("cancel_button").await)? {
                self.tap_element(&cancel).await?;
            }
            return Ok(false);
        };
        self.tap_element(&target).await?;
        let done = self.follow(&["army_march", "confirm_button"]).await?;
        if done {
            tracing::info!(?strategy, target = target_name, "army dispatched");
        }
        Ok(done)
    }

    pub async fn collect_resources(&self) -> BotResult<bool> {
        if !self.navigate_to_main_menu().await? {
            return Ok(false);
        }
        let Some(button) = quiet("collect_resources_button", self.find("collect_resources_button").await)? else {
            tracing::info!("nothing to collect");
            return Ok(false);
        };
        self.tap_element(&button).await?;
        let done = self.follow(&["confirm_button"]).await?;
        if done {
            tracing::info!("resources collected");
        }
        Ok(done)
    }

    pub async fn statistics(&self) -> ControllerStats {
        let state = self.state.lock().await;
        ControllerStats {
            actions: state.actions,
            screenshots: state.screenshots,
            safe_mode_pauses: state.safe.pauses(),
            dry_run: self.dry_run,
        }
    }
}
