use crate::domain::models::DeviceAddress;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

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
    #[serde(default = "default_true")]
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
            show_file_line: default_true(),
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
    "vitals_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,

    // Reconnection
    #[serde(default)]
    pub last_connected_address: Option<DeviceAddress>,
    #[serde(default)]
    pub known_addresses: Vec<DeviceAddress>,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_true")]
    pub auto_start_stream: bool,

    // BLE identifiers
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_notify_uuid")]
    pub notify_char_uuid: String,
    #[serde(default = "default_write_uuid")]
    pub write_char_uuid: String,

    // Timing
    #[serde(default = "default_link_poll_interval_ms")]
    pub link_poll_interval_ms: u64,
    #[serde(default = "default_waveform_flush_interval_ms")]
    pub waveform_flush_interval_ms: u64,
    #[serde(default = "default_waveform_max_batch")]
    pub waveform_max_batch: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            last_connected_address: None,
            known_addresses: Vec::new(),
            auto_reconnect: true,
            auto_start_stream: true,
            service_uuid: default_service_uuid(),
            notify_char_uuid: default_notify_uuid(),
            write_char_uuid: default_write_uuid(),
            link_poll_interval_ms: default_link_poll_interval_ms(),
            waveform_flush_interval_ms: default_waveform_flush_interval_ms(),
            waveform_max_batch: default_waveform_max_batch(),
        }
    }
}

impl Settings {
    pub fn link_poll_interval(&self) -> Duration {
        Duration::from_millis(self.link_poll_interval_ms.max(100))
    }

    pub fn waveform_flush_interval(&self) -> Duration {
        Duration::from_millis(self.waveform_flush_interval_ms.max(10))
    }
}

fn default_service_uuid() -> String {
    "14839ac4-7d7e-415c-9a42-167340cf2339".to_string()
}
fn default_notify_uuid() -> String {
    "0734594a-a8e7-4b1a-a6b1-cd5243059a57".to_string()
}
fn default_write_uuid() -> String {
    "8b00ace7-eb0b-49b0-bbe9-9aee0a26e1a3".to_string()
}
fn default_link_poll_interval_ms() -> u64 {
    1500
}
fn default_waveform_flush_interval_ms() -> u64 {
    200
}
fn default_waveform_max_batch() -> usize {
    128
}

pub struct SettingsService {
    settings: Settings,
    /// `None` keeps settings in memory only
    settings_path: Option<PathBuf>,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path: Some(settings_path),
        }
    }

    pub fn in_memory(settings: Settings) -> Self {
        Self {
            settings,
            settings_path: None,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("VitalsBridge");
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
        if let Some(path) = &self.settings_path {
            let json = serde_json::to_string_pretty(&self.settings)?;
            fs::write(path, json)?;
        }
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Records a successful connection for reconnect at next startup.
    pub fn remember_connection(&mut self, address: DeviceAddress) -> anyhow::Result<()> {
        self.settings.last_connected_address = Some(address);
        if !self.settings.known_addresses.contains(&address) {
            self.settings.known_addresses.push(address);
        }
        self.save()
    }
}
