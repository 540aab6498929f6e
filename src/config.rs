//! Capture controller configuration
//!
//! TOML configuration file with environment variable overrides and atomic
//! writes. The session receives a fully-resolved `Config` value; callers
//! that want persistence use `load_config`/`save_config`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Resolved controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Pixels one logical scroll step is expected to move the content
    #[serde(default = "default_scroll_step_pixels")]
    pub scroll_step_pixels: u32,
    /// Cadence of the periodic capture/compare tick in milliseconds
    #[serde(default = "default_capture_tick_ms")]
    pub capture_tick_ms: u64,
    /// How long to wait for the first frame before giving up
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Settle window after a scroll step
    #[serde(default = "default_settle_timeout_ms")]
    pub settle_timeout_ms: u64,
    /// Consecutive near-identical tick comparisons required to settle
    #[serde(default = "default_settle_stable_frames")]
    pub settle_stable_frames: u32,
    /// Delay between automated scroll steps
    #[serde(default = "default_auto_step_delay_ms")]
    pub auto_step_delay_ms: u64,
    /// Similarity at or above which a transition is Good
    #[serde(default = "default_good_threshold")]
    pub good_threshold: f64,
    /// Similarity at or above which a transition is at least Partial
    #[serde(default = "default_partial_threshold")]
    pub partial_threshold: f64,
    /// Similarity at or above which a transition counts as no pixel motion
    #[serde(default = "default_no_change_epsilon")]
    pub no_change_epsilon: f64,
    /// Hard cap on accepted frames
    #[serde(default = "default_max_frames")]
    pub max_frames: u32,
    /// Hard cap on scroll step attempts
    #[serde(default = "default_max_scroll_attempts")]
    pub max_scroll_attempts: u32,
    /// Consecutive no-motion observations that mean end of content
    #[serde(default = "default_end_detection_threshold")]
    pub end_detection_threshold: u32,
    /// N for the NxN capability probe grid
    #[serde(default = "default_probe_grid_density")]
    pub probe_grid_density: u32,
    /// Keep probe points out of the bottom quarter of the region
    /// (floating toolbars tend to live there)
    #[serde(default)]
    pub ignore_bottom_edge: bool,
    /// Capture-tick stall bound before the watchdog restarts the timer
    #[serde(default = "default_watchdog_timeout_ms")]
    pub watchdog_timeout_ms: u64,
}

fn default_scroll_step_pixels() -> u32 {
    120
}
fn default_capture_tick_ms() -> u64 {
    100
}
fn default_startup_timeout_ms() -> u64 {
    3000
}
fn default_settle_timeout_ms() -> u64 {
    1200
}
fn default_settle_stable_frames() -> u32 {
    2
}
fn default_auto_step_delay_ms() -> u64 {
    350
}
fn default_good_threshold() -> f64 {
    0.92
}
fn default_partial_threshold() -> f64 {
    0.55
}
fn default_no_change_epsilon() -> f64 {
    0.995
}
fn default_max_frames() -> u32 {
    200
}
fn default_max_scroll_attempts() -> u32 {
    400
}
fn default_end_detection_threshold() -> u32 {
    3
}
fn default_probe_grid_density() -> u32 {
    3
}
fn default_watchdog_timeout_ms() -> u64 {
    2000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scroll_step_pixels: default_scroll_step_pixels(),
            capture_tick_ms: default_capture_tick_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            settle_timeout_ms: default_settle_timeout_ms(),
            settle_stable_frames: default_settle_stable_frames(),
            auto_step_delay_ms: default_auto_step_delay_ms(),
            good_threshold: default_good_threshold(),
            partial_threshold: default_partial_threshold(),
            no_change_epsilon: default_no_change_epsilon(),
            max_frames: default_max_frames(),
            max_scroll_attempts: default_max_scroll_attempts(),
            end_detection_threshold: default_end_detection_threshold(),
            probe_grid_density: default_probe_grid_density(),
            ignore_bottom_edge: false,
            watchdog_timeout_ms: default_watchdog_timeout_ms(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Check internal consistency. Called by the session before spawn.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, v) in [
            ("good_threshold", self.good_threshold),
            ("partial_threshold", self.partial_threshold),
            ("no_change_epsilon", self.no_change_epsilon),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be in [0, 1], got {}",
                    name, v
                )));
            }
        }
        if self.good_threshold <= self.partial_threshold {
            return Err(ConfigError::Invalid(format!(
                "good_threshold ({}) must be above partial_threshold ({})",
                self.good_threshold, self.partial_threshold
            )));
        }
        for (name, v) in [
            ("capture_tick_ms", self.capture_tick_ms),
            ("startup_timeout_ms", self.startup_timeout_ms),
            ("settle_timeout_ms", self.settle_timeout_ms),
            ("auto_step_delay_ms", self.auto_step_delay_ms),
            ("watchdog_timeout_ms", self.watchdog_timeout_ms),
        ] {
            if v == 0 {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }
        for (name, v) in [
            ("settle_stable_frames", self.settle_stable_frames),
            ("max_frames", self.max_frames),
            ("max_scroll_attempts", self.max_scroll_attempts),
            ("end_detection_threshold", self.end_detection_threshold),
            ("probe_grid_density", self.probe_grid_density),
        ] {
            if v == 0 {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

fn config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("scrollshot");
    path.push("config.toml");
    path
}

/// Load the configuration from the default location, applying environment
/// variable overrides. Missing or unreadable files yield defaults.
pub fn load_config() -> Config {
    let path = config_path();
    let config = if path.exists() {
        match load_config_from(&path) {
            Ok(config) => {
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("Failed to load config from {:?}: {}", path, e);
                Config::default()
            }
        }
    } else {
        Config::default()
    };
    apply_env_overrides(config)
}

/// Load and validate a configuration file
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

/// Save the configuration to the default location (atomic write with
/// backup of the previous file)
pub fn save_config(config: &Config) -> Result<(), ConfigError> {
    save_config_to(config, &config_path())
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<(), ConfigError> {
    config.validate()?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Keep a backup of whatever was there before
    if path.exists() {
        let backup_path = path.with_extension("toml.bak");
        let _ = fs::copy(path, &backup_path);
    }

    // Write to temp file, then atomic rename
    let contents = toml::to_string_pretty(config)?;
    let temp_path = path.with_extension("toml.tmp");
    fs::write(&temp_path, &contents)?;
    fs::rename(&temp_path, path)?;

    tracing::info!("Saved config to {:?}", path);
    Ok(())
}

fn apply_env_overrides(mut config: Config) -> Config {
    if let Ok(v) = std::env::var("SCROLLSHOT_STEP_DELAY_MS") {
        if let Ok(ms) = v.parse::<u64>() {
            config.auto_step_delay_ms = ms;
        }
    }
    if let Ok(v) = std::env::var("SCROLLSHOT_SETTLE_TIMEOUT_MS") {
        if let Ok(ms) = v.parse::<u64>() {
            config.settle_timeout_ms = ms;
        }
    }
    if let Ok(v) = std::env::var("SCROLLSHOT_GOOD_THRESHOLD") {
        if let Ok(t) = v.parse::<f64>() {
            config.good_threshold = t;
        }
    }
    if let Ok(v) = std::env::var("SCROLLSHOT_PARTIAL_THRESHOLD") {
        if let Ok(t) = v.parse::<f64>() {
            config.partial_threshold = t;
        }
    }
    if let Ok(v) = std::env::var("SCROLLSHOT_MAX_FRAMES") {
        if let Ok(n) = v.parse::<u32>() {
            config.max_frames = n;
        }
    }
    if let Ok(v) = std::env::var("SCROLLSHOT_PROBE_GRID_DENSITY") {
        if let Ok(n) = v.parse::<u32>() {
            config.probe_grid_density = n;
        }
    }
    if let Ok(v) = std::env::var("SCROLLSHOT_IGNORE_BOTTOM_EDGE") {
        config.ignore_bottom_edge = v == "true";
    }
    config
}
