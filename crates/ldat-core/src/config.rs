//! Measurement settings
//!
//! Loaded from a JSON file. Every field has a default, so a partial file (or
//! `{}`) is valid and only overrides what it names. Settings are read-only:
//! nothing is ever written back.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading settings
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

fn default_input_lag_duration_ms() -> u64 {
    20_000
}

fn default_stutter_duration_ms() -> u64 {
    7_000
}

fn default_response_step() -> u8 {
    51
}

fn default_overdrive_step() -> u8 {
    32
}

fn default_low_threshold() -> f64 {
    0.1
}

fn default_high_threshold() -> f64 {
    0.9
}

fn default_pwm_min_hz() -> f64 {
    40.0
}

fn default_pwm_max_hz() -> f64 {
    2500.0
}

fn default_settle_ms() -> u64 {
    500
}

fn default_pre_trigger_ms() -> u64 {
    50
}

fn default_post_capture_ms() -> u64 {
    300
}

fn default_live_threshold() -> u32 {
    100
}

fn default_live_sensitivity() -> u8 {
    2
}

/// Click-to-photon test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputLagConfig {
    /// Length of the button-mode capture
    #[serde(default = "default_input_lag_duration_ms")]
    pub duration_ms: u64,
    /// Artificial CPU time per frame requested from the test screen
    #[serde(default)]
    pub fake_cpu_load_ms: u64,
    /// Artificial GPU time per frame requested from the test screen
    #[serde(default)]
    pub fake_gpu_load_ms: u64,
}

impl Default for InputLagConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_input_lag_duration_ms(),
            fake_cpu_load_ms: 0,
            fake_gpu_load_ms: 0,
        }
    }
}

/// Frame pacing test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StutterConfig {
    #[serde(default = "default_stutter_duration_ms")]
    pub duration_ms: u64,
}

impl Default for StutterConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_stutter_duration_ms(),
        }
    }
}

/// Pixel response time test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseConfig {
    /// Distance between grey levels of the step grid
    #[serde(default = "default_response_step")]
    pub step: u8,
    /// End-of-transition threshold as a fraction of the transition range
    #[serde(default = "default_low_threshold")]
    pub low_threshold: f64,
    /// Start-of-transition threshold as a fraction of the transition range
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            step: default_response_step(),
            low_threshold: default_low_threshold(),
            high_threshold: default_high_threshold(),
        }
    }
}

/// How overshoot is expressed as a percentage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverdriveMethod {
    /// Relative to the distance between the two grey levels
    #[default]
    Relative,
    /// Relative to the full black-to-white range
    Absolute,
}

/// Overshoot / undershoot test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverdriveConfig {
    #[serde(default = "default_overdrive_step")]
    pub step: u8,
    #[serde(default)]
    pub method: OverdriveMethod,
    /// Skip transitions that end at full black or full white
    #[serde(default)]
    pub skip_extremes: bool,
}

impl Default for OverdriveConfig {
    fn default() -> Self {
        Self {
            step: default_overdrive_step(),
            method: OverdriveMethod::default(),
            skip_extremes: false,
        }
    }
}

/// Backlight PWM test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PwmConfig {
    #[serde(default = "default_pwm_min_hz")]
    pub min_frequency_hz: f64,
    #[serde(default = "default_pwm_max_hz")]
    pub max_frequency_hz: f64,
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self {
            min_frequency_hz: default_pwm_min_hz(),
            max_frequency_hz: default_pwm_max_hz(),
        }
    }
}

/// Live click-to-photon monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveLagConfig {
    /// Light level that counts as "lit", 0..=1023
    #[serde(default = "default_live_threshold")]
    pub threshold: u32,
    #[serde(default = "default_live_sensitivity")]
    pub sensitivity: u8,
    #[serde(default)]
    pub auto_fire: bool,
}

impl Default for LiveLagConfig {
    fn default() -> Self {
        Self {
            threshold: default_live_threshold(),
            sensitivity: default_live_sensitivity(),
            auto_fire: false,
        }
    }
}

/// Delays the measurements wait for the display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    /// Wait after a colour change before sampling a steady level
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Capture time before the transition is triggered
    #[serde(default = "default_pre_trigger_ms")]
    pub pre_trigger_ms: u64,
    /// Extra capture time after the stutter buffer fills
    #[serde(default = "default_post_capture_ms")]
    pub post_capture_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            pre_trigger_ms: default_pre_trigger_ms(),
            post_capture_ms: default_post_capture_ms(),
        }
    }
}

impl Timing {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn pre_trigger(&self) -> Duration {
        Duration::from_millis(self.pre_trigger_ms)
    }

    pub fn post_capture(&self) -> Duration {
        Duration::from_millis(self.post_capture_ms)
    }
}

/// All measurement settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LdatConfig {
    #[serde(default)]
    pub input_lag: InputLagConfig,
    #[serde(default)]
    pub stutter: StutterConfig,
    #[serde(default)]
    pub response: ResponseConfig,
    #[serde(default)]
    pub overdrive: OverdriveConfig,
    #[serde(default)]
    pub pwm: PwmConfig,
    #[serde(default)]
    pub live_lag: LiveLagConfig,
    #[serde(default)]
    pub timing: Timing,
}

impl LdatConfig {
    /// Load and validate settings from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        tracing::info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Load settings, falling back to defaults on any error
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Using default config");
                Self::default()
            }
        }
    }

    /// Reject settings no measurement can run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(msg: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.to_string()))
        }
        if self.input_lag.duration_ms == 0 || self.stutter.duration_ms == 0 {
            return invalid("capture durations must be positive");
        }
        if self.response.step == 0 || self.overdrive.step == 0 {
            return invalid("step must be at least 1");
        }
        let (lo, hi) = (self.response.low_threshold, self.response.high_threshold);
        if !(0.0..1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) || lo >= hi {
            return invalid("thresholds must satisfy 0 <= low < high <= 1");
        }
        if self.pwm.min_frequency_hz > self.pwm.max_frequency_hz {
            return invalid("PWM frequency range is empty");
        }
        if self.live_lag.threshold > crate::ADC_MAX
            || self.live_lag.sensitivity > crate::MAX_SENSITIVITY
        {
            return invalid("live monitor threshold or sensitivity out of range");
        }
        Ok(())
    }
}
