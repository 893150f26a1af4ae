use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{BotError, BotResult};
use crate::perception::types::ExecutionMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub vlm: VlmConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub debug_mode: bool,
    #[serde(default)]
    pub auto_save_screenshots: bool,
    #[serde(default = "default_screenshot_dir")]
    pub screenshot_dir: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            vision: VisionConfig::default(),
            vlm: VlmConfig::default(),
            analysis: AnalysisConfig::default(),
            automation: AutomationConfig::default(),
            controller: ControllerConfig::default(),
            tasks: TasksConfig::default(),
            logging: LoggingConfig::default(),
            debug_mode: false,
            auto_save_screenshots: false,
            screenshot_dir: default_screenshot_dir(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_screenshot_dir() -> PathBuf {
    PathBuf::from("screenshots")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Usb,
    Network,
    Simulation,
    Airplay,
    Webdriver,
}

impl std::str::FromStr for ConnectionType {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "usb" => Ok(ConnectionType::Usb),
            "network" => Ok(ConnectionType::Network),
            "simulation" => Ok(ConnectionType::Simulation),
            "airplay" => Ok(ConnectionType::Airplay),
            "webdriver" | "wda" => Ok(ConnectionType::Webdriver),
            other => Err(BotError::Config(format!("unknown connection type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_connection_type")]
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub device_udid: Option<String>,
    #[serde(default)]
    pub device_ip: String,
    #[serde(default = "default_device_port")]
    pub device_port: u16,
    #[serde(default = "default_screen_width")]
    pub screen_width: u32,
    #[serde(default = "default_screen_height")]
    pub screen_height: u32,
    /// Seconds allowed for device discovery and pairing checks.
    #[serde(default = "default_usb_timeout")]
    pub usb_timeout: u64,
    #[serde(default = "default_screenshot_timeout")]
    pub screenshot_timeout: u64,
    /// Seconds allowed for each external screenshot tool invocation.
    #[serde(default = "default_external_timeout")]
    pub external_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial delay between screenshot attempts; grows 1.5x per failure.
    #[serde(default = "default_retry_interval")]
    pub retry_interval: f64,
    #[serde(default = "default_true")]
    pub quality_check: bool,
    #[serde(default = "default_min_file_size")]
    pub min_file_size: u64,
    /// Host screen region `[x, y, width, height]` showing the AirPlay mirror.
    #[serde(default)]
    pub airplay_region: Option<[i32; 4]>,
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,
    #[serde(default = "default_true")]
    pub use_tunneld: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_type: default_connection_type(),
            device_udid: None,
            device_ip: String::new(),
            device_port: default_device_port(),
            screen_width: default_screen_width(),
            screen_height: default_screen_height(),
            usb_timeout: default_usb_timeout(),
            screenshot_timeout: default_screenshot_timeout(),
            external_timeout: default_external_timeout(),
            max_retries: default_max_retries(),
            retry_interval: default_retry_interval(),
            quality_check: true,
            min_file_size: default_min_file_size(),
            airplay_region: None,
            webdriver_url: default_webdriver_url(),
            use_tunneld: true,
        }
    }
}

fn default_connection_type() -> ConnectionType {
    ConnectionType::Usb
}

fn default_device_port() -> u16 {
    5555
}

fn default_screen_width() -> u32 {
    2732
}

fn default_screen_height() -> u32 {
    2048
}

fn default_usb_timeout() -> u64 {
    30
}

fn default_screenshot_timeout() -> u64 {
    15
}

fn default_external_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval() -> f64 {
    2.0
}

fn default_min_file_size() -> u64 {
    1024
}

fn default_webdriver_url() -> String {
    "http://localhost:8100".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_nms_threshold")]
    pub nms_threshold: f32,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub use_vlm: bool,
    /// JSON file of keyword templates scored against VLM descriptions.
    #[serde(default)]
    pub keyword_templates: Option<PathBuf>,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            template_dir: default_template_dir(),
            threshold: default_threshold(),
            nms_threshold: default_nms_threshold(),
            max_results: default_max_results(),
            use_vlm: false,
            keyword_templates: None,
        }
    }
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("templates")
}

fn default_threshold() -> f32 {
    0.8
}

fn default_nms_threshold() -> f32 {
    0.3
}

fn default_max_results() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlmConfig {
    #[serde(default = "default_vlm_host")]
    pub host: String,
    #[serde(default = "default_vlm_port")]
    pub port: u16,
    #[serde(default = "default_vlm_model")]
    pub model: String,
    #[serde(default = "default_vlm_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_image_max_size")]
    pub image_max_size: [u32; 2],
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_num_predict")]
    pub num_predict: u32,
}

impl Default for VlmConfig {
    fn default() -> Self {
        Self {
            host: default_vlm_host(),
            port: default_vlm_port(),
            model: default_vlm_model(),
            timeout: default_vlm_timeout(),
            max_retries: default_max_retries(),
            image_max_size: default_image_max_size(),
            jpeg_quality: default_jpeg_quality(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            num_predict: default_num_predict(),
        }
    }
}

impl VlmConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

fn default_vlm_host() -> String {
    "localhost".to_string()
}

fn default_vlm_port() -> u16 {
    11434
}

fn default_vlm_model() -> String {
    "llava:latest".to_string()
}

fn default_vlm_timeout() -> u64 {
    60
}

fn default_image_max_size() -> [u32; 2] {
    [1024, 1024]
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_temperature() -> f64 {
    0.1
}

fn default_top_p() -> f64 {
    0.9
}

fn default_num_predict() -> u32 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Seconds between automatic analyses.
    #[serde(default = "default_auto_interval")]
    pub auto_interval: f64,
    /// Seconds to wait for a submitted analysis.
    #[serde(default = "default_result_timeout")]
    pub result_timeout: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            history_limit: default_history_limit(),
            auto_interval: default_auto_interval(),
            result_timeout: default_result_timeout(),
        }
    }
}

fn default_max_concurrent() -> usize {
    3
}

fn default_history_limit() -> usize {
    100
}

fn default_auto_interval() -> f64 {
    5.0
}

fn default_result_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default = "default_execution_mode")]
    pub execution_mode: ExecutionMode,
    #[serde(default = "default_action_delay")]
    pub action_delay: f64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            execution_mode: default_execution_mode(),
            action_delay: default_action_delay(),
        }
    }
}

fn default_execution_mode() -> ExecutionMode {
    ExecutionMode::Suggest
}

fn default_action_delay() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_action_delay_min")]
    pub action_delay_min: f64,
    #[serde(default = "default_action_delay_max")]
    pub action_delay_max: f64,
    #[serde(default = "default_screenshot_interval")]
    pub screenshot_interval: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_interval")]
    pub retry_delay: f64,
    #[serde(default = "default_true")]
    pub safe_mode: bool,
    #[serde(default = "default_max_continuous_actions")]
    pub max_continuous_actions: u32,
    /// Seconds to pause once `max_continuous_actions` is reached.
    #[serde(default = "default_pause_duration")]
    pub pause_duration: u64,
    #[serde(default = "default_max_navigation_depth")]
    pub max_navigation_depth: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            action_delay_min: default_action_delay_min(),
            action_delay_max: default_action_delay_max(),
            screenshot_interval: default_screenshot_interval(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_interval(),
            safe_mode: true,
            max_continuous_actions: default_max_continuous_actions(),
            pause_duration: default_pause_duration(),
            max_navigation_depth: default_max_navigation_depth(),
        }
    }
}

fn default_action_delay_min() -> f64 {
    0.5
}

fn default_action_delay_max() -> f64 {
    1.5
}

fn default_screenshot_interval() -> f64 {
    1.0
}

fn default_max_continuous_actions() -> u32 {
    50
}

fn default_pause_duration() -> u64 {
    30
}

fn default_max_navigation_depth() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default)]
    pub land_occupation: LandOccupationConfig,
    #[serde(default)]
    pub army_movement: ArmyMovementConfig,
    #[serde(default)]
    pub resource_collection: ResourceCollectionConfig,
    /// Failed cycles in a row that end the main loop.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            land_occupation: LandOccupationConfig::default(),
            army_movement: ArmyMovementConfig::default(),
            resource_collection: ResourceCollectionConfig::default(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

fn default_max_consecutive_failures() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandOccupationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_target_count")]
    pub target_count: u32,
    #[serde(default = "default_true")]
    pub prefer_resources: bool,
    /// Furthest distance in pixels from the screen center a target may be.
    #[serde(default = "default_max_distance")]
    pub max_distance: u32,
}

impl Default for LandOccupationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_count: default_target_count(),
            prefer_resources: true,
            max_distance: default_max_distance(),
        }
    }
}

fn default_target_count() -> u32 {
    10
}

fn default_max_distance() -> u32 {
    500
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementStrategy {
    Nearest,
    Resources,
    Enemy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmyMovementConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_idle_army_check_interval")]
    pub idle_army_check_interval: u64,
    #[serde(default = "default_movement_strategy")]
    pub movement_strategy: MovementStrategy,
}

impl Default for ArmyMovementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_army_check_interval: default_idle_army_check_interval(),
            movement_strategy: default_movement_strategy(),
        }
    }
}

fn default_idle_army_check_interval() -> u64 {
    300
}

fn default_movement_strategy() -> MovementStrategy {
    MovementStrategy::Nearest
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceCollectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_collection_interval")]
    pub collection_interval: u64,
}

impl Default for ResourceCollectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collection_interval: default_collection_interval(),
        }
    }
}

fn default_collection_interval() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> BotResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| BotError::Config(format!("{key}: invalid value {value:?}")))
}

impl AppConfig {
    /// Applies `IPAD_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> BotResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> BotResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("IPAD_CONNECTION_TYPE") {
            self.connection.connection_type = v.parse()?;
        }
        if let Some(v) = lookup("IPAD_DEVICE_UDID") {
            self.connection.device_udid = Some(v);
        }
        if let Some(v) = lookup("IPAD_DEVICE_IP") {
            self.connection.device_ip = v;
        }
        if let Some(v) = lookup("IPAD_DEVICE_PORT") {
            self.connection.device_port = parse_env("IPAD_DEVICE_PORT", &v)?;
        }
        if let Some(v) = lookup("IPAD_WEBDRIVER_URL") {
            self.connection.webdriver_url = v;
        }
        if let Some(v) = lookup("IPAD_TEMPLATE_DIR") {
            self.vision.template_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("IPAD_TEMPLATE_THRESHOLD") {
            self.vision.threshold = parse_env("IPAD_TEMPLATE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("IPAD_VLM_ENABLED") {
            self.vision.use_vlm = parse_bool(&v);
        }
        if let Some(v) = lookup("IPAD_VLM_HOST") {
            self.vlm.host = v;
        }
        if let Some(v) = lookup("IPAD_VLM_PORT") {
            self.vlm.port = parse_env("IPAD_VLM_PORT", &v)?;
        }
        if let Some(v) = lookup("IPAD_VLM_MODEL") {
            self.vlm.model = v;
        }
        if let Some(v) = lookup("IPAD_EXECUTION_MODE") {
            self.automation.execution_mode = v.parse()?;
        }
        if let Some(v) = lookup("IPAD_LOG_LEVEL") {
            self.logging.level = v.trim().to_ascii_lowercase();
        }
        if let Some(v) = lookup("IPAD_DEBUG") {
            self.debug_mode = parse_bool(&v);
        }
        if let Some(v) = lookup("IPAD_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> BotResult<()> {
        let c = &self.connection;
        if c.usb_timeout == 0 || c.screenshot_timeout == 0 || c.external_timeout == 0 {
            return Err(BotError::Config("connection timeouts must be positive".into()));
        }
        check_seconds("connection.retry_interval", c.retry_interval)?;
        if c.connection_type == ConnectionType::Network && c.device_ip.is_empty() {
            return Err(BotError::Config(
                "network connection requires connection.device_ip".into(),
            ));
        }
        if !(self.vision.threshold > 0.0 && self.vision.threshold <= 1.0) {
            return Err(BotError::Config(format!(
                "vision.threshold must be in (0, 1], got {}",
                self.vision.threshold
            )));
        }
        if !(self.vision.nms_threshold > 0.0 && self.vision.nms_threshold <= 1.0) {
            return Err(BotError::Config(format!(
                "vision.nms_threshold must be in (0, 1], got {}",
                self.vision.nms_threshold
            )));
        }
        if !self.vlm.temperature.is_finite() || !self.vlm.top_p.is_finite() {
            return Err(BotError::Config("vlm.temperature and vlm.top_p must be finite".into()));
        }
        if self.vlm.timeout == 0 {
            return Err(BotError::Config("vlm.timeout must be positive".into()));
        }
        if self.analysis.max_concurrent == 0 {
            return Err(BotError::Config("analysis.max_concurrent must be at least 1".into()));
        }
        check_seconds("analysis.auto_interval", self.analysis.auto_interval)?;
        check_seconds("automation.action_delay", self.automation.action_delay)?;
        let ctl = &self.controller;
        check_seconds("controller.action_delay_min", ctl.action_delay_min)?;
        check_seconds("controller.action_delay_max", ctl.action_delay_max)?;
        check_seconds("controller.screenshot_interval", ctl.screenshot_interval)?;
        check_seconds("controller.retry_delay", ctl.retry_delay)?;
        if ctl.action_delay_min > ctl.action_delay_max {
            return Err(BotError::Config(format!(
                "controller action delay range [{}, {}] is invalid",
                ctl.action_delay_min, ctl.action_delay_max
            )));
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(BotError::Config(format!(
                "unknown log level: {}",
                self.logging.level
            )));
        }
        Ok(())
    }

    pub fn template_dir(&self) -> PathBuf {
        self.relative_to_data(&self.vision.template_dir)
    }

    pub fn screenshot_dir(&self) -> PathBuf {
        self.relative_to_data(&self.screenshot_dir)
    }

    fn relative_to_data(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }
}

/// Longest interval or delay a config file may set.
const MAX_CONFIG_SECS: f64 = 86_400.0;

fn check_seconds(field: &str, value: f64) -> BotResult<()> {
    if value.is_finite() && (0.0..=MAX_CONFIG_SECS).contains(&value) {
        Ok(())
    } else {
        Err(BotError::Config(format!(
            "{field} must be between 0 and {MAX_CONFIG_SECS} seconds, got {value}"
        )))
    }
}

fn resolve_config_path(explicit: Option<&Path>) -> BotResult<Option<PathBuf>> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(Some(path.to_path_buf()));
        }
        return Err(BotError::Config(format!(
            "config file {} does not exist",
            path.display()
        )));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(Some(candidate));
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(Some(candidate));
    }

    if let Some(dir) = dirs::config_dir() {
        let candidate = dir.join("sgz-assistant").join("config.toml");
        if candidate.exists() {
            tracing::debug!(path = %candidate.display(), "config found in user config directory");
            return Ok(Some(candidate));
        }
    }

    Ok(None)
}

/// Loads the configuration, applies environment overrides and validates it.
///
/// Missing config files are not an error: defaults are used.
pub fn load_config(explicit: Option<&Path>) -> BotResult<AppConfig> {
    let mut config = match resolve_config_path(explicit)? {
        Some(path) => {
            let content = std::fs::read_to_string(&path)?;
            let config: AppConfig = toml::from_str(&content)?;
            tracing::info!(path = %path.display(), "config loaded");
            config
        }
        None => {
            tracing::debug!("no config.toml found; using defaults");
            AppConfig::default()
        }
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

pub fn save_config(config: &AppConfig, path: &Path) -> BotResult<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}
