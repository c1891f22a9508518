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
    "kickr_shifter".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Gearing
    #[serde(default = "default_circumference")]
    pub default_circumference: f64,
    #[serde(default = "default_gear_ratio")]
    pub gear_ratio: f64, // 16 gears mean 4.6 total ratio
    #[serde(default = "default_min_circumference")]
    pub min_circumference: f64,
    #[serde(default = "default_max_circumference")]
    pub max_circumference: f64,

    // Advanced BLE Settings
    #[serde(default = "default_name_token")]
    pub device_name_token: String,
    #[serde(default = "default_config_char_uuid")]
    pub config_char_uuid: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    // Timers
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    /// Zero scans forever
    #[serde(default = "default_max_scan_attempts")]
    pub max_scan_attempts: u32,

    // Reconnection
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            default_circumference: default_circumference(),
            gear_ratio: default_gear_ratio(),
            min_circumference: default_min_circumference(),
            max_circumference: default_max_circumference(),
            device_name_token: default_name_token(),
            config_char_uuid: default_config_char_uuid(),
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            scan_timeout_secs: default_scan_timeout_secs(),
            max_scan_attempts: default_max_scan_attempts(),
            auto_reconnect: true,
        }
    }
}

fn default_circumference() -> f64 {
    2.096
}
fn default_gear_ratio() -> f64 {
    1.1
}
fn default_min_circumference() -> f64 {
    0.5
}
fn default_max_circumference() -> f64 {
    6.5534
}
fn default_name_token() -> String {
    "KICKR".to_string()
}
fn default_config_char_uuid() -> String {
    "a026e005-0a7d-4ab3-97fa-f1500f9feb8b".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_write_timeout_ms() -> u64 {
    3_000
}
fn default_scan_timeout_secs() -> u64 {
    30
}
fn default_max_scan_attempts() -> u32 {
    10
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("KickrShifter");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
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

    pub fn update_gear_ratio(&mut self, ratio: f64) -> anyhow::Result<()> {
        crate::domain::gears::validate_ratio(ratio)?;
        self.settings.gear_ratio = ratio;
        self.save()
    }
}
