use crate::domain::models::PayloadType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "xsens_dot_streamer".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Device Selection
    #[serde(default = "default_target_device_name")]
    pub target_device_name: String,
    #[serde(default = "default_scan_duration_secs")]
    pub scan_duration_secs: u64,
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,
    #[serde(default)]
    pub known_devices: Vec<String>,

    // Streaming
    #[serde(default = "default_payload_type")]
    pub payload_type: PayloadType,
    /// Seconds after streaming starts before the heading reset; none disables it
    #[serde(default)]
    pub reset_heading_after_secs: Option<u64>,

    // Session Tuning
    #[serde(default = "default_discovery_max_retries")]
    pub discovery_max_retries: u32,
    #[serde(default = "default_discovery_backoff_ms")]
    pub discovery_backoff_ms: u64,
    #[serde(default = "default_heading_reset_max_iterations")]
    pub heading_reset_max_iterations: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            target_device_name: default_target_device_name(),
            scan_duration_secs: default_scan_duration_secs(),
            max_devices: default_max_devices(),
            known_devices: Vec::new(),
            payload_type: default_payload_type(),
            reset_heading_after_secs: None,
            discovery_max_retries: default_discovery_max_retries(),
            discovery_backoff_ms: default_discovery_backoff_ms(),
            heading_reset_max_iterations: default_heading_reset_max_iterations(),
        }
    }
}

fn default_target_device_name() -> String {
    "Xsens DOT".to_string()
}
fn default_scan_duration_secs() -> u64 {
    10
}
fn default_max_devices() -> usize {
    2
}
fn default_payload_type() -> PayloadType {
    PayloadType::CompleteQuaternion
}
fn default_discovery_max_retries() -> u32 {
    5
}
fn default_discovery_backoff_ms() -> u64 {
    100
}
fn default_heading_reset_max_iterations() -> u32 {
    5
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Settings backed by `settings_path`; defaults when it is missing or unreadable.
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("XsensDotStreamer");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn add_known_device(&mut self, transport_id: &str) -> anyhow::Result<()> {
        if !self.settings.known_devices.iter().any(|d| d == transport_id) {
            self.settings.known_devices.push(transport_id.to_string());
            self.save()?;
        }
        Ok(())
    }
}
