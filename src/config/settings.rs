//! Capture settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.
//! Missing keys fall back to their defaults, so a partial `settings.toml` is
//! valid.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;
use crate::audio::StartOptions;

// ---------------------------------------------------------------------------
// DeviceConfig
// ---------------------------------------------------------------------------

/// Which input device to open and in what format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Input device name; `None` means the system default.
    pub device_name: Option<String>,
    /// Requested sample rate in Hz.
    pub sample_rate: u32,
    /// Requested channel count (1 = mono, 2 = stereo).
    pub channels: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            sample_rate: 16_000,
            channels: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// CaptureConfig
// ---------------------------------------------------------------------------

/// Buffering, fade-in and statistics settings for a capture session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Maximum bytes per buffer; also the largest silence block emitted for
    /// a single loss event.
    pub buffer_capacity: usize,
    /// Buffers in the pull-mode pool, i.e. how many the consumer may hold at
    /// once.
    pub pool_buffers: usize,
    /// Push-mode buffers queued for the consumer before the oldest is dropped.
    pub max_queued_buffers: usize,
    /// Leading window, in microseconds, during which captured samples are
    /// muted.
    pub auto_ramp_start_us: i64,
    /// Length of the linear fade-in that follows the mute window.
    pub auto_ramp_duration_us: i64,
    /// Count lost frames and log a summary when the session stops.
    pub collect_stats: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 2048,
            pool_buffers: 1,
            max_queued_buffers: 64,
            auto_ramp_start_us: 0,
            auto_ramp_duration_us: 300_000,
            collect_stats: false,
        }
    }
}

impl CaptureConfig {
    /// Session options derived from this config (no start-time override).
    pub fn start_options(&self) -> StartOptions {
        StartOptions {
            start_time_us: None,
            collect_stats: self.collect_stats,
        }
    }
}

// ---------------------------------------------------------------------------
// MeterConfig
// ---------------------------------------------------------------------------

/// Settings for the `capture-meter` binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// Log a timing/level line every this many buffers.
    pub report_every: u64,
    /// Capture length in seconds when `--seconds` is not given.
    pub default_seconds: u64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            report_every: 25,
            default_seconds: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level configuration, serialised as `settings.toml`.
///
/// ```rust,no_run
/// use pcm_capture::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
/// println!("{} Hz", config.device.sample_rate);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub capture: CaptureConfig,
    pub meter: MeterConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
