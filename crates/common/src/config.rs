//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Allowed chunk durations, in minutes (one minute up to one day).
pub const CHUNK_MINUTES_RANGE: std::ops::RangeInclusive<u32> = 1..=1440;

/// Global application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Default recording settings offered to the settings form.
    pub recording: RecordingDefaults,

    /// Engine timing knobs.
    pub tuning: EngineTuning,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Default recording parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingDefaults {
    /// Requested FPS (0 = device default).
    pub fps: u32,

    /// Requested frame width (0 = device default).
    pub width: u32,

    /// Requested frame height (0 = device default).
    pub height: u32,

    /// Segment length in minutes.
    pub chunk_minutes: u32,

    /// Where segment files are written.
    pub output_dir: PathBuf,
}

/// Timing and bounds used by the capture engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineTuning {
    /// Longest a single frame read may block.
    pub read_timeout_ms: u64,

    /// Consecutive read timeouts tolerated before a device counts as disconnected.
    pub max_consecutive_read_failures: u32,

    /// How long `stop` waits for a worker before force-terminating it.
    pub stop_grace_ms: u64,

    /// How long `start` waits for workers to leave `Opening`.
    pub open_timeout_ms: u64,

    /// Interval at which worker processes forward previews to the coordinator.
    pub preview_interval_ms: u64,

    /// JPEG quality for previews crossing the process boundary.
    pub preview_jpeg_quality: u8,

    /// Number of device indices probed during camera discovery.
    pub probe_count: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "camrec=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            recording: RecordingDefaults::default(),
            tuning: EngineTuning::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RecordingDefaults {
    fn default() -> Self {
        Self {
            fps: 5,
            width: 640,
            height: 480,
            chunk_minutes: 10,
            output_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            read_timeout_ms: 2_000,
            max_consecutive_read_failures: 5,
            stop_grace_ms: 10_000,
            open_timeout_ms: 15_000,
            preview_interval_ms: 100,
            preview_jpeg_quality: 80,
            probe_count: 10,
        }
    }
}

impl EngineTuning {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn preview_interval(&self) -> Duration {
        Duration::from_millis(self.preview_interval_ms.max(1))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        let config_path = config_file_path();
        if config_path.exists() {
            match std::fs::read_to_string(&config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let config_path = config_file_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(config_path, json)
    }
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("camrec").join("config.json")
}
