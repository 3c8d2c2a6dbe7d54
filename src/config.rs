use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Json(serde_json::Error),
    /// No devices configured — nothing to drive.
    NoDevices,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config io: {e}"),
            ConfigError::Json(e) => write!(f, "config json: {e}"),
            ConfigError::NoDevices => write!(f, "config has no devices"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Json(e)
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// One playback device to drive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub name: String,
    pub screen_id: String,
    /// Manual skip-timing calibration in milliseconds. May be negative for
    /// devices that apply seeks early.
    #[serde(default)]
    pub offset_ms: i64,
}

impl DeviceConfig {
    /// Calibration offset in seconds, the unit the scheduler works in.
    pub fn offset_secs(&self) -> f64 {
        self.offset_ms as f64 / 1000.0
    }
}

/// A whitelisted channel. Videos from these channels are never skipped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Engine configuration, passed explicitly into the supervisor and session
/// at construction. Not a process-wide singleton: multiple simulated
/// devices with different configs can coexist in tests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_skip_categories")]
    pub skip_categories: Vec<String>,
    #[serde(default)]
    pub channel_whitelist: Vec<ChannelEntry>,
    /// Report skipped segments back to the provider (view credit).
    #[serde(default = "default_true")]
    pub skip_count_tracking: bool,
    #[serde(default)]
    pub mute_ads: bool,
    #[serde(default)]
    pub skip_ads: bool,
    #[serde(default)]
    pub autoplay: bool,
    /// Re-attach playback after a shorts-initiated screen disconnect.
    #[serde(default = "default_true")]
    pub handle_shorts: bool,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Segments no longer than this (seconds) are not skipped.
    #[serde(default)]
    pub minimum_skip_length: f64,
}

fn default_true() -> bool {
    true
}

fn default_skip_categories() -> Vec<String> {
    vec!["sponsor".into()]
}

fn default_device_name() -> String {
    "loungeskip".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            api_key: String::new(),
            skip_categories: default_skip_categories(),
            channel_whitelist: Vec::new(),
            skip_count_tracking: true,
            mute_ads: false,
            skip_ads: false,
            autoplay: false,
            handle_shorts: true,
            device_name: default_device_name(),
            minimum_skip_length: 0.0,
        }
    }
}

impl Config {
    /// Load config from the given path. Fails if no devices are configured
    /// — the engine has nothing to do without one.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&data)?;

        if config.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }

        tracing::info!(
            "loaded config with {} device(s) from {}",
            config.devices.len(),
            path.as_ref().display()
        );
        Ok(config)
    }

    /// Save config atomically: write to temp file, then rename. Prevents
    /// corruption on power loss (these run unattended on small boxes).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let json = r#"{
            "devices": [{"name": "Living Room TV", "screen_id": "abc123"}]
        }"#;
        let config: Config = serde_json::from_str(json).expect("parse should succeed");

        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].offset_ms, 0);
        assert_eq!(config.skip_categories, vec!["sponsor".to_string()]);
        assert!(config.skip_count_tracking);
        assert!(config.handle_shorts);
        assert!(!config.mute_ads);
        assert_eq!(config.minimum_skip_length, 0.0);
    }

    #[test]
    fn test_offset_conversion() {
        let device = DeviceConfig {
            name: "tv".into(),
            screen_id: "x".into(),
            offset_ms: -250,
        };
        assert_eq!(device.offset_secs(), -0.25);
    }

    #[test]
    fn test_roundtrip() {
        let config = Config {
            devices: vec![DeviceConfig {
                name: "tv".into(),
                screen_id: "scr".into(),
                offset_ms: 100,
            }],
            mute_ads: true,
            minimum_skip_length: 1.5,
            ..Config::default()
        };

        let json = serde_json::to_string(&config).expect("serialize");
        let back: Config = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(config, back);
    }
}
