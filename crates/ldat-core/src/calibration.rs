//! Sensor gain selection and flicker detection
//!
//! A calibration shot is a short unbuffered monitor-mode capture of whatever
//! the screen is currently showing. Auto-sensitivity takes shots from a
//! starting gain level downward until the bright end of the shot no longer
//! exceeds a clipping threshold. The spread of the final shot tells whether
//! the backlight flickers.

use crate::buffer::ring::FixedRing;
use crate::buffer::SampleBuffer;
use crate::device::MonitorOptions;
use crate::measurement::{Feed, MeasurementError, RunResult, Session, CHECK_INTERVAL};
use crate::MAX_SENSITIVITY;
use serde::Serialize;
use std::sync::Arc;

/// Shot length used by input lag and stutter calibration
pub const SHORT_SHOT_SECONDS: f64 = 0.2;

/// Shot length used by the pixel and PWM calibrations
pub const LONG_SHOT_SECONDS: f64 = 0.5;

/// Relative gain of each sensitivity level, as measured on a typical unit
pub const DEFAULT_GAINS: [f64; 4] = [1.0, 1.258, 2.101, 13.883];

/// How the `[low, high]` pair of a shot is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PercentileMode {
    /// Minimum and maximum
    Absolute,
    /// 5th and 95th percentile
    Trimmed,
}

/// Summary of one calibration shot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShotStats {
    pub low: u32,
    pub high: u32,
    pub mean: f64,
}

impl ShotStats {
    /// Summarise raw samples; an empty slice yields all zeros
    ///
    /// # Example
    /// ```
    /// use ldat_core::calibration::{PercentileMode, ShotStats};
    ///
    /// let stats = ShotStats::from_samples(&[4, 1, 3, 2], PercentileMode::Absolute);
    /// assert_eq!((stats.low, stats.high), (1, 4));
    /// assert_eq!(stats.mean, 2.5);
    /// ```
    pub fn from_samples(samples: &[u32], mode: PercentileMode) -> Self {
        if samples.is_empty() {
            return Self {
                low: 0,
                high: 0,
                mean: 0.0,
            };
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let last = sorted.len() - 1;
        let (low, high) = match mode {
            PercentileMode::Absolute => (sorted[0], sorted[last]),
            PercentileMode::Trimmed => {
                let at = |p: f64| sorted[((sorted.len() as f64 * p) as usize).min(last)];
                (at(0.05), at(0.95))
            }
        };
        let mean = sorted.iter().map(|&v| f64::from(v)).sum::<f64>() / sorted.len() as f64;
        Self { low, high, mean }
    }

    /// Spread between the two ends of the shot
    pub fn noise(&self) -> u32 {
        self.high.saturating_sub(self.low)
    }
}

/// A calibration shot with its raw samples
#[derive(Debug, Clone)]
pub struct Shot {
    pub sensitivity: u8,
    pub stats: ShotStats,
    pub raw: Vec<u32>,
}

/// Free-running light capture, possibly stopped before the ring filled
#[derive(Debug, Clone, Serialize)]
pub struct MonitorCapture {
    pub sample_rate: f64,
    pub samples: Vec<u32>,
    pub stats: ShotStats,
}

impl MonitorCapture {
    /// Summarise only the samples that were actually written
    pub fn from_ring(sample_rate: f64, ring: &FixedRing) -> Self {
        let samples = ring.recent();
        let stats = ShotStats::from_samples(&samples, PercentileMode::Absolute);
        Self {
            sample_rate,
            samples,
            stats,
        }
    }
}

/// Capture `duration_s` seconds at a fixed sensitivity
///
/// Streaming is stopped again before this returns.
pub fn shot(
    session: &Session<'_>,
    sensitivity: u8,
    duration_s: f64,
    mode: PercentileMode,
) -> RunResult<Shot> {
    let rate = session.sensor().monitor_sample_rate(true, false)?;
    let ring = Arc::new(FixedRing::new((rate * duration_s) as usize));
    let options = MonitorOptions {
        unbuffered: true,
        sensitivity,
        fast_adc: false,
    };
    let (_, activity) = session.start_monitor(options, ring.clone(), Feed::Continuous)?;
    session.wait_filled(ring.as_ref(), CHECK_INTERVAL)?;
    activity.end();
    session.checkpoint()?;

    let raw = ring.snapshot();
    let stats = ShotStats::from_samples(&raw, mode);
    tracing::debug!(
        sensitivity,
        low = stats.low,
        high = stats.high,
        mean = stats.mean,
        "Calibration shot"
    );
    Ok(Shot {
        sensitivity,
        stats,
        raw,
    })
}

/// Result of the auto-sensitivity loop
#[derive(Debug, Clone)]
pub struct Calibration {
    pub sensitivity: u8,
    /// The last shot, taken at `sensitivity`
    pub shot: Shot,
}

impl Calibration {
    pub fn noise(&self) -> u32 {
        self.shot.stats.noise()
    }
}

/// Lower the gain from `start` until a shot's high end is at most `clip`
///
/// Stops at sensitivity 0 even if that level still clips.
pub fn auto_sensitivity(
    session: &Session<'_>,
    start: u8,
    clip: u32,
    duration_s: f64,
    mode: PercentileMode,
) -> RunResult<Calibration> {
    let mut sensitivity = start.min(MAX_SENSITIVITY);
    loop {
        session.checkpoint()?;
        let shot = shot(session, sensitivity, duration_s, mode)?;
        if shot.stats.high > clip && sensitivity > 0 {
            sensitivity -= 1;
            continue;
        }
        tracing::info!(
            sensitivity,
            low = shot.stats.low,
            high = shot.stats.high,
            "Sensitivity selected"
        );
        return Ok(Calibration { sensitivity, shot });
    }
}

/// Gain of each sensitivity level relative to level 0
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GainTable(pub [f64; 4]);

impl Default for GainTable {
    fn default() -> Self {
        Self(DEFAULT_GAINS)
    }
}

impl GainTable {
    pub fn gain(&self, sensitivity: u8) -> f64 {
        self.0[usize::from(sensitivity.min(MAX_SENSITIVITY))]
    }

    /// Reading converted to the scale of sensitivity 0
    pub fn normalise(&self, reading: f64, sensitivity: u8) -> f64 {
        reading / self.gain(sensitivity)
    }

    /// Replace levels `1..levels.len()` with `levels[i] / levels[0]`
    ///
    /// # Errors
    /// [`MeasurementError::InsufficientContrast`] when the reference level is zero
    pub fn update_from_levels(&mut self, levels: &[f64]) -> Result<(), MeasurementError> {
        let Some(&base) = levels.first() else {
            return Ok(());
        };
        if base <= 0.0 {
            return Err(MeasurementError::InsufficientContrast { range: 0 });
        }
        for (slot, level) in self.0.iter_mut().zip(levels).skip(1) {
            *slot = level / base;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_partial_monitor_capture() {
        let ring = FixedRing::new(100);
        ring.push_slice(&[500; 30]);
        let capture = MonitorCapture::from_ring(2000.0, &ring);
        assert_eq!(capture.samples.len(), 30);
        assert_eq!(capture.stats.low, 500);
        assert_eq!(capture.stats.high, 500);
        assert_relative_eq!(capture.stats.mean, 500.0);
    }

    #[test]
    fn test_absolute_stats() {
        let stats = ShotStats::from_samples(&[10, 30, 20], PercentileMode::Absolute);
        assert_eq!(stats.low, 10);
        assert_eq!(stats.high, 30);
        assert_eq!(stats.noise(), 20);
        assert_relative_eq!(stats.mean, 20.0);
    }

    #[test]
    fn test_trimmed_stats_ignore_outliers() {
        let mut samples: Vec<u32> = vec![500; 100];
        samples[0] = 0;
        samples[1] = 1023;
        let stats = ShotStats::from_samples(&samples, PercentileMode::Trimmed);
        assert_eq!((stats.low, stats.high), (500, 500));
        assert_eq!(stats.noise(), 0);
    }

    #[test]
    fn test_empty_shot() {
        let stats = ShotStats::from_samples(&[], PercentileMode::Trimmed);
        assert_eq!(stats.noise(), 0);
        assert_eq!(stats.mean, 0.0);
    }

    #[test]
    fn test_default_gains() {
        let table = GainTable::default();
        assert_eq!(table.gain(0), 1.0);
        assert_eq!(table.gain(3), 13.883);
        assert_relative_eq!(table.normalise(2.101 * 10.0, 2), 10.0);
    }

    #[test]
    fn test_gain_update_from_levels() {
        let mut table = GainTable::default();
        table.update_from_levels(&[100.0, 200.0]).unwrap();
        assert_eq!(table.0, [1.0, 2.0, 2.101, 13.883]);

        assert!(matches!(
            table.update_from_levels(&[0.0, 10.0]),
            Err(MeasurementError::InsufficientContrast { .. })
        ));
    }
}
