use crate::domain::pulse::DEFAULT_PULSE_DURATION_MS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Rolling period of the log file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
    Minutely,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive, e.g. `info` or `heart_osc=debug`
    pub level: String,
    pub console: bool,
    pub ansi_colors: bool,
    /// Source file and line on every record
    pub source_location: bool,
    /// File output; none means console only
    pub file: Option<FileLogSettings>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            ansi_colors: true,
            source_location: false,
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLogSettings {
    pub dir: PathBuf,
    pub prefix: String,
    pub rotation: LogRotation,
}

impl Default for FileLogSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            prefix: "heart_osc".to_string(),
            rotation: LogRotation::Daily,
        }
    }
}

fn default_false() -> bool {
    false
}

/// OSC destination and parameter addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OscSettings {
    #[serde(default = "default_osc_host")]
    pub host: String,
    #[serde(default = "default_osc_port")]
    pub port: u16,
    #[serde(default = "default_hr_param")]
    pub hr_param: String,
    #[serde(default = "default_hr_connected_param")]
    pub hr_connected_param: String,
    #[serde(default = "default_heartbeat_toggle_param")]
    pub heartbeat_toggle_param: String,
    #[serde(default = "default_heartbeat_pulse_param")]
    pub heartbeat_pulse_param: String,
    #[serde(default = "default_pulse_duration_ms")]
    pub pulse_duration_ms: u64,
}

impl Default for OscSettings {
    fn default() -> Self {
        Self {
            host: default_osc_host(),
            port: default_osc_port(),
            hr_param: default_hr_param(),
            hr_connected_param: default_hr_connected_param(),
            heartbeat_toggle_param: default_heartbeat_toggle_param(),
            heartbeat_pulse_param: default_heartbeat_pulse_param(),
            pulse_duration_ms: default_pulse_duration_ms(),
        }
    }
}

impl OscSettings {
    /// Reject values the transmitter cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("OSC host must not be blank");
        }
        if self.port == 0 {
            anyhow::bail!("OSC port must be between 1 and 65535");
        }
        let params = [
            ("hr_param", &self.hr_param),
            ("hr_connected_param", &self.hr_connected_param),
            ("heartbeat_toggle_param", &self.heartbeat_toggle_param),
            ("heartbeat_pulse_param", &self.heartbeat_pulse_param),
        ];
        for (name, value) in params {
            if value.trim().is_empty() {
                anyhow::bail!("OSC parameter {} must not be blank", name);
            }
            if !value.is_ascii() {
                anyhow::bail!("OSC parameter {} must be ASCII", name);
            }
        }
        Ok(())
    }
}

fn default_osc_host() -> String {
    "192.168.1.10".to_string()
}
fn default_osc_port() -> u16 {
    9000
}
fn default_hr_param() -> String {
    "/avatar/parameters/HR".to_string()
}
fn default_hr_connected_param() -> String {
    "/avatar/parameters/isHRConnected".to_string()
}
fn default_heartbeat_toggle_param() -> String {
    "/avatar/parameters/HeartBeatToggle".to_string()
}
fn default_heartbeat_pulse_param() -> String {
    "/avatar/parameters/isHRBeat".to_string()
}
fn default_pulse_duration_ms() -> u64 {
    DEFAULT_PULSE_DURATION_MS
}

/// Automatic reconnection after an unexpected link loss
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the 1-based `attempt`, or `None` once attempts are exhausted.
    ///
    /// Doubles from `initial_delay_ms` and saturates at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let delay = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Some(Duration::from_millis(delay))
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    16_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BluetoothSettings {
    /// Connect to the first sensor whose name or address contains this
    #[serde(default)]
    pub preferred_device: Option<String>,
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    /// Link is considered lost after this long without a notification
    #[serde(default = "default_notification_timeout_secs")]
    pub notification_timeout_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default = "default_false")]
    pub debug_raw_data_logging: bool,
}

impl Default for BluetoothSettings {
    fn default() -> Self {
        Self {
            preferred_device: None,
            scan_timeout_secs: default_scan_timeout_secs(),
            notification_timeout_secs: default_notification_timeout_secs(),
            reconnect: ReconnectPolicy::default(),
            debug_raw_data_logging: false,
        }
    }
}

fn default_scan_timeout_secs() -> u64 {
    30
}
fn default_notification_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub osc: OscSettings,

    #[serde(default)]
    pub bluetooth: BluetoothSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the per-user config directory, falling back to defaults.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load(settings_path))
    }

    /// Load from an explicit path, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("HeartOsc");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn update_osc(&mut self, osc: OscSettings) -> anyhow::Result<()> {
        osc.validate()?;
        self.settings.osc = osc;
        self.save()
    }
}
