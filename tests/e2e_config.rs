//! E2E tests for measurement settings files
//!
//! Loads settings the way the `ldat --config` option does and checks that
//! partial files keep defaults and bad files are reported.

use approx::assert_relative_eq;
use ldat::config::{ConfigError, OverdriveMethod};
use ldat::LdatConfig;
use std::io::Write;

fn write_config(dir: &tempfile::TempDir, name: &str, json: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(json.as_bytes()).unwrap();
    path
}

#[test]
fn test_full_settings_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "ldat.json",
        r#"{
            "input_lag": { "duration_ms": 5000, "fake_cpu_load_ms": 4 },
            "stutter": { "duration_ms": 3000 },
            "response": { "step": 64, "low_threshold": 0.2, "high_threshold": 0.8 },
            "overdrive": { "step": 85, "method": "absolute", "skip_extremes": true },
            "pwm": { "min_frequency_hz": 60.0, "max_frequency_hz": 1000.0 },
            "live_lag": { "threshold": 250, "sensitivity": 3, "auto_fire": true },
            "timing": { "settle_ms": 200, "pre_trigger_ms": 20, "post_capture_ms": 100 }
        }"#,
    );
    let config = LdatConfig::load(&path).unwrap();
    assert_eq!(config.input_lag.duration_ms, 5000);
    assert_eq!(config.input_lag.fake_cpu_load_ms, 4);
    assert_eq!(config.input_lag.fake_gpu_load_ms, 0);
    assert_eq!(config.response.step, 64);
    assert_relative_eq!(config.response.low_threshold, 0.2);
    assert_eq!(config.overdrive.method, OverdriveMethod::Absolute);
    assert!(config.overdrive.skip_extremes);
    assert_relative_eq!(config.pwm.max_frequency_hz, 1000.0);
    assert_eq!(config.live_lag.threshold, 250);
    assert!(config.live_lag.auto_fire);
    assert_eq!(config.timing.settle().as_millis(), 200);
}

#[test]
fn test_partial_file_keeps_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "partial.json", r#"{ "pwm": { "max_frequency_hz": 800.0 } }"#);
    let config = LdatConfig::load(&path).unwrap();
    let defaults = LdatConfig::default();
    assert_relative_eq!(config.pwm.max_frequency_hz, 800.0);
    assert_relative_eq!(config.pwm.min_frequency_hz, defaults.pwm.min_frequency_hz);
    assert_eq!(config.response, defaults.response);
    assert_eq!(config.timing, defaults.timing);
}

#[test]
fn test_bad_files_are_reported() {
    let dir = tempfile::tempdir().unwrap();

    let missing = dir.path().join("nope.json");
    assert!(matches!(LdatConfig::load(&missing), Err(ConfigError::Io(_))));

    let garbage = write_config(&dir, "garbage.json", "{ not json");
    assert!(matches!(LdatConfig::load(&garbage), Err(ConfigError::Parse(_))));

    let invalid = write_config(&dir, "invalid.json", r#"{ "overdrive": { "step": 0 } }"#);
    assert!(matches!(LdatConfig::load(&invalid), Err(ConfigError::Invalid(_))));

    let band = write_config(
        &dir,
        "band.json",
        r#"{ "pwm": { "min_frequency_hz": 900.0, "max_frequency_hz": 100.0 } }"#,
    );
    assert!(matches!(LdatConfig::load(&band), Err(ConfigError::Invalid(_))));
}

#[test]
fn test_load_or_default_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "live.json", r#"{ "live_lag": { "sensitivity": 9 } }"#);
    assert_eq!(LdatConfig::load_or_default(&path), LdatConfig::default());
    assert_eq!(
        LdatConfig::load_or_default(&dir.path().join("absent.json")),
        LdatConfig::default()
    );
}
