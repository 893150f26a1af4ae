use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::errors::{BotError, BotResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: Point) -> f64 {
        let dx = (self.x - other.x) as f64;
        let dy = (self.y - other.y) as f64;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Axis-aligned rectangle in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> Point {
        Point::new(
            self.x + (self.width / 2) as i32,
            self.y + (self.height / 2) as i32,
        )
    }

    pub fn right(&self) -> i32 {
        self.x + self.width as i32
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x && p.x < self.right() && p.y >= self.y && p.y < self.bottom()
    }

    pub fn intersection_area(&self, other: &Rect) -> u64 {
        let w = self.right().min(other.right()) - self.x.max(other.x);
        let h = self.bottom().min(other.bottom()) - self.y.max(other.y);
        if w <= 0 || h <= 0 {
            0
        } else {
            w as u64 * h as u64
        }
    }

    /// Intersection over union, 0.0 for disjoint or empty rectangles.
    pub fn iou(&self, other: &Rect) -> f32 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union == 0 {
            0.0
        } else {
            inter as f32 / union as f32
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Button,
    Text,
    Icon,
    Image,
    Input,
    Menu,
    Dialog,
    Unknown,
}

impl ElementType {
    /// Lenient parsing of model output such as `"btn"` or `"icon/button"`.
    pub fn parse(raw: &str) -> Self {
        raw.split('/')
            .map(|part| Self::parse_single(part.trim()))
            .find(|t| *t != ElementType::Unknown)
            .unwrap_or(ElementType::Unknown)
    }

    fn parse_single(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "button" | "btn" | "interactive" => ElementType::Button,
            "text" | "txt" | "label" => ElementType::Text,
            "icon" => ElementType::Icon,
            "image" | "img" => ElementType::Image,
            "input" => ElementType::Input,
            "menu" => ElementType::Menu,
            "dialog" => ElementType::Dialog,
            _ => ElementType::Unknown,
        }
    }
}

/// A detected UI element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub name: String,
    pub rect: Rect,
    pub confidence: f32,
    pub element_type: ElementType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_path: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Element {
    pub fn new(name: impl Into<String>, rect: Rect, confidence: f32, element_type: ElementType) -> Self {
        Self {
            name: name.into(),
            rect,
            confidence,
            element_type,
            template_path: None,
            metadata: HashMap::new(),
        }
    }

    pub fn center(&self) -> Point {
        self.rect.center()
    }

    /// `(x1, y1, x2, y2)`
    pub fn bounds(&self) -> (i32, i32, i32, i32) {
        (self.rect.x, self.rect.y, self.rect.right(), self.rect.bottom())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Tap,
    Swipe,
    LongPress,
    TypeText,
    Wait,
    Home,
    Back,
}

impl ActionType {
    /// Accepts the vocabulary models tend to produce (`click` for tap).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tap" | "click" | "press" => Some(ActionType::Tap),
            "swipe" | "drag" | "scroll" => Some(ActionType::Swipe),
            "long_press" | "longpress" | "hold" => Some(ActionType::LongPress),
            "type_text" | "type" | "input" => Some(ActionType::TypeText),
            "wait" => Some(ActionType::Wait),
            "home" => Some(ActionType::Home),
            "back" => Some(ActionType::Back),
            _ => None,
        }
    }

    /// Actions that need neither a target nor a position.
    pub fn is_positionless(&self) -> bool {
        matches!(self, ActionType::Wait | ActionType::Home | ActionType::Back)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSuggestion {
    pub action_type: ActionType,
    pub target: Option<Element>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub priority: u32,
    pub description: String,
    pub confidence: f32,
}

impl ActionSuggestion {
    pub fn score(&self) -> f32 {
        self.priority as f32 * self.confidence
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub action_type: ActionType,
    pub target: Option<Element>,
    pub position: Option<Point>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// Seconds allowed for a single device call.
    pub timeout: f64,
    pub retry_count: u32,
    pub description: String,
    pub stop_on_failure: bool,
    /// Seconds to sleep after this action in a batch.
    pub delay_after: f64,
}

/// Longest timeout, delay or gesture an action may ask for.
pub const MAX_ACTION_SECS: f64 = 3600.0;

/// Seconds from an action field as a [`Duration`], rejecting values that
/// are negative, non-finite or above [`MAX_ACTION_SECS`].
pub fn action_secs(value: f64, what: &str) -> BotResult<Duration> {
    if !value.is_finite() || !(0.0..=MAX_ACTION_SECS).contains(&value) {
        return Err(BotError::Validation(format!(
            "{what} of {value}s is outside 0..={MAX_ACTION_SECS}s"
        )));
    }
    Duration::try_from_secs_f64(value).map_err(|e| BotError::Validation(format!("{what}: {e}")))
}

impl Action {
    pub fn new(action_type: ActionType) -> Self {
        Self {
            action_type,
            target: None,
            position: None,
            parameters: HashMap::new(),
            timeout: 5.0,
            retry_count: 3,
            description: String::new(),
            stop_on_failure: false,
            delay_after: 0.0,
        }
    }

    pub fn tap(x: i32, y: i32) -> Self {
        Self::new(ActionType::Tap).at(Point::new(x, y))
    }

    pub fn swipe(from: Point, to: Point, duration: f64) -> Self {
        Self::new(ActionType::Swipe)
            .at(from)
            .with_param("target_position", serde_json::json!([to.x, to.y]))
            .with_param("duration", serde_json::json!(duration))
    }

    pub fn long_press(x: i32, y: i32, duration: f64) -> Self {
        Self::new(ActionType::LongPress)
            .at(Point::new(x, y))
            .with_param("duration", serde_json::json!(duration))
    }

    pub fn wait(duration: f64) -> Self {
        Self::new(ActionType::Wait).with_param("duration", serde_json::json!(duration))
    }

    pub fn home() -> Self {
        Self::new(ActionType::Home)
    }

    pub fn at(mut self, position: Point) -> Self {
        self.position = Some(position);
        self
    }

    pub fn on(mut self, target: Element) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn validate(&self) -> BotResult<()> {
        if self.target.is_none() && self.position.is_none() && !self.action_type.is_positionless() {
            return Err(BotError::Validation(format!(
                "{:?} action needs a target or a position",
                self.action_type
            )));
        }
        if self.timeout <= 0.0 {
            return Err(BotError::Validation("action timeout must be positive".into()));
        }
        action_secs(self.timeout, "timeout")?;
        action_secs(self.delay_after, "delay_after")?;
        if let Some(duration) = self.param_f64("duration") {
            action_secs(duration, "duration")?;
        }
        Ok(())
    }

    pub fn target_position(&self) -> Option<Point> {
        self.target.as_ref().map(Element::center).or(self.position)
    }

    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).and_then(|v| v.as_f64())
    }

    pub fn param_point(&self, key: &str) -> Option<Point> {
        let arr = self.parameters.get(key)?.as_array()?;
        match arr.as_slice() {
            [x, y] => Some(Point::new(x.as_i64()? as i32, y.as_i64()? as i32)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub found: bool,
    pub template_name: String,
    pub confidence: f32,
    pub location: Option<Point>,
    pub element: Option<Element>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenType {
    MainMenu,
    WorldMap,
    #[serde(rename = "battle_ui")]
    Battle,
    #[serde(rename = "city_view")]
    City,
    Unknown,
}

impl ScreenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScreenType::MainMenu => "main_menu",
            ScreenType::WorldMap => "world_map",
            ScreenType::Battle => "battle_ui",
            ScreenType::City => "city_view",
            ScreenType::Unknown => "unknown",
        }
    }

    /// Maps free text from a model (`"world map"`, `"battle"`) to a screen.
    pub fn parse(raw: &str) -> Self {
        let s = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        if s.contains("main") || s.contains("menu") || s.contains("home") {
            ScreenType::MainMenu
        } else if s.contains("world") || s.contains("map") {
            ScreenType::WorldMap
        } else if s.contains("battle") || s.contains("combat") {
            ScreenType::Battle
        } else if s.contains("city") || s.contains("town") {
            ScreenType::City
        } else {
            ScreenType::Unknown
        }
    }
}

impl std::fmt::Display for ScreenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    Template,
    Vlm,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub screen_type: ScreenType,
    pub elements: Vec<Element>,
    pub suggestions: Vec<ActionSuggestion>,
    pub confidence: f32,
    pub source: AnalysisSource,
    pub description: String,
    #[serde(default)]
    pub raw: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn empty(source: AnalysisSource) -> Self {
        Self {
            screen_type: ScreenType::Unknown,
            elements: Vec::new(),
            suggestions: Vec::new(),
            confidence: 0.0,
            source,
            description: String::new(),
            raw: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn element_by_name(&self, name: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.name == name)
    }

    pub fn elements_by_type(&self, element_type: ElementType) -> Vec<&Element> {
        self.elements
            .iter()
            .filter(|e| e.element_type == element_type)
            .collect()
    }

    pub fn best_suggestion(&self) -> Option<&ActionSuggestion> {
        self.suggestions
            .iter()
            .max_by(|a, b| a.score().total_cmp(&b.score()))
    }

    /// Suggestions sorted by descending score.
    pub fn ranked_suggestions(&self) -> Vec<&ActionSuggestion> {
        let mut ranked: Vec<&ActionSuggestion> = self.suggestions.iter().collect();
        ranked.sort_by(|a, b| b.score().total_cmp(&a.score()));
        ranked
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub action: Action,
    /// Seconds.
    pub execution_time: f64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub udid: String,
    pub name: String,
    pub ios_version: String,
    pub model: String,
    pub screen_size: (u32, u32),
    pub scale_factor: f32,
    pub is_connected: bool,
    pub connection_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Auto,
    Confirm,
    Suggest,
}

impl std::str::FromStr for ExecutionMode {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "execute" => Ok(ExecutionMode::Auto),
            "confirm" => Ok(ExecutionMode::Confirm),
            "suggest" => Ok(ExecutionMode::Suggest),
            other => Err(BotError::Config(format!("unknown execution mode: {other}"))),
        }
    }
}

/// A captured frame. Cloning shares the pixel buffer.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub image: Arc<DynamicImage>,
    pub captured_at: DateTime<Utc>,
}

impl Screenshot {
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image: Arc::new(image),
            captured_at: Utc::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn to_gray(&self) -> image::GrayImage {
        self.image.to_luma8()
    }

    pub fn png_bytes(&self) -> BotResult<Vec<u8>> {
        let mut out = Vec::new();
        self.image
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_center_and_bounds() {
        let el = Element::new("confirm_button", Rect::new(100, 200, 50, 30), 0.9, ElementType::Button);
        assert_eq!(el.center(), Point::new(125, 215));
        assert_eq!(el.bounds(), (100, 200, 150, 230));
    }

    #[test]
    fn iou_of_overlapping_rects() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 0, 10, 10);
        assert_eq!(a.intersection_area(&b), 50);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&Rect::new(20, 20, 5, 5)), 0.0);
    }

    #[test]
    fn element_type_aliases() {
        assert_eq!(ElementType::parse("btn"), ElementType::Button);
        assert_eq!(ElementType::parse("IMG"), ElementType::Image);
        assert_eq!(ElementType::parse("txt"), ElementType::Text);
        assert_eq!(ElementType::parse("interactive"), ElementType::Button);
        assert_eq!(ElementType::parse("widget/icon"), ElementType::Icon);
        assert_eq!(ElementType::parse("banner"), ElementType::Unknown);
    }

    #[test]
    fn positionless_actions_validate_without_target() {
        assert!(Action::home().validate().is_ok());
        assert!(Action::wait(1.0).validate().is_ok());
        assert!(Action::new(ActionType::Tap).validate().is_err());
        assert!(Action::tap(1, 2).validate().is_ok());
    }

    #[test]
    fn target_position_prefers_target_center() {
        let el = Element::new("army_idle", Rect::new(0, 0, 20, 20), 0.9, ElementType::Icon);
        let action = Action::tap(500, 500).on(el);
        assert_eq!(action.target_position(), Some(Point::new(10, 10)));
    }

    #[test]
    fn swipe_params_round_trip_through_accessors() {
        let action = Action::swipe(Point::new(10, 20), Point::new(300, 400), 0.6);
        assert_eq!(action.param_point("target_position"), Some(Point::new(300, 400)));
        assert_eq!(action.param_f64("duration"), Some(0.6));
    }

    #[test]
    fn best_suggestion_uses_priority_times_confidence() {
        let mut result = AnalysisResult::empty(AnalysisSource::Template);
        let make = |priority, confidence, description: &str| ActionSuggestion {
            action_type: ActionType::Tap,
            target: None,
            parameters: HashMap::new(),
            priority,
            description: description.into(),
            confidence,
        };
        result.suggestions = vec![make(5, 0.5, "a"), make(3, 0.9, "b"), make(1, 1.0, "c")];
        assert_eq!(result.best_suggestion().unwrap().description, "b");
        let ranked: Vec<_> = result.ranked_suggestions().iter().map(|s| s.description.as_str()).collect();
        assert_eq!(ranked, vec!["b", "a", "c"]);
    }

    #[test]
    fn screen_type_names() {
        assert_eq!(ScreenType::Battle.as_str(), "battle_ui");
        assert_eq!(serde_json::to_string(&ScreenType::City).unwrap(), "\"city_view\"");
        assert_eq!(ScreenType::parse("World Map"), ScreenType::WorldMap);
        assert_eq!(ScreenType::parse("loading"), ScreenType::Unknown);
    }
}
