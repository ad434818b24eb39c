//! Frame pacing from a flickering screen
//!
//! The screen alternates black and white every frame, so two frames pass
//! between consecutive dark-to-light edges. The distribution of those gaps
//! shows how evenly frames are presented.

use super::{
    percentile, Feed, Measurement, MeasurementError, RunResult, Session, FILL_POLL_INTERVAL,
};
use crate::buffer::ring::FixedRing;
use crate::buffer::SampleBuffer;
use crate::calibration::{auto_sensitivity, PercentileMode, SHORT_SHOT_SECONDS};
use crate::config::StutterConfig;
use crate::device::MonitorOptions;
use crate::filter::smoothing::RunningAverageSmoothingFilter;
use crate::{ADC_MAX, MAX_SENSITIVITY};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Highest white reading accepted before the gain is lowered
pub const WHITE_CLIP: u32 = 750;

/// Calibration spread above which the backlight is treated as flickering
pub const FLICKER_NOISE: u32 = 16;

const MIN_CONTRAST: u32 = 32;

/// Smoothing factors applied when the backlight flickers
const SMOOTHING_FAST_ADC: f64 = 0.996;
const SMOOTHING: f64 = 0.99;

const UNBUFFERED: bool = true;
const FAST_ADC: bool = false;

#[derive(Debug, Clone, Serialize)]
pub struct StutterResult {
    pub captured_at: DateTime<Utc>,
    pub flickering_detected: bool,
    pub sensitivity: u8,
    pub sample_rate: f64,
    /// Two-frame periods in ms, in capture order
    pub frame_times: Vec<f64>,
    pub percentile_1: f64,
    pub percentile_50: f64,
    pub percentile_99: f64,
    /// Periods above this many ms count as stutters
    pub stutter_threshold: f64,
    pub stutters: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameAnalysis {
    pub frame_times: Vec<f64>,
    pub percentile_1: f64,
    pub percentile_50: f64,
    pub percentile_99: f64,
    pub stutter_threshold: f64,
    pub stutters: usize,
}

/// Stretch `samples` to span `0..=ADC_MAX`
///
/// # Errors
/// [`MeasurementError::InsufficientContrast`] if max and min are less than 32 apart
pub fn normalise(samples: &[u32]) -> Result<Vec<u32>, MeasurementError> {
    let min = samples.iter().copied().min().unwrap_or(0);
    let max = samples.iter().copied().max().unwrap_or(0);
    let range = max - min;
    if range < MIN_CONTRAST {
        return Err(MeasurementError::InsufficientContrast { range });
    }
    Ok(samples
        .iter()
        .map(|&v| (f64::from(ADC_MAX) * f64::from(v - min) / f64::from(range)) as u32)
        .collect())
}

/// Indices where the signal rises through the white threshold
///
/// The white threshold is the 40th percentile of the signal and the black
/// threshold the 60th, so the detector adapts to the duty cycle.
pub fn rising_edges(samples: &[u32]) -> Vec<usize> {
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let (Some(white), Some(black)) = (percentile(&sorted, 0.4), percentile(&sorted, 0.6)) else {
        return Vec::new();
    };

    let mut edges = Vec::new();
    let mut lit = false;
    for (i, pair) in samples.windows(2).enumerate() {
        let (prev, cur) = (pair[0], pair[1]);
        if !lit && prev < white && cur >= white {
            edges.push(i + 1);
            lit = true;
        } else if lit && prev > black && cur <= black {
            lit = false;
        }
    }
    edges
}

/// Frame pacing statistics of a flicker capture
///
/// # Arguments
/// * `samples` - Raw or smoothed light samples
/// * `sample_rate` - Samples per second
/// * `refresh_rate` - Display refresh rate in Hz
pub fn analyse(
    samples: &[u32],
    sample_rate: f64,
    refresh_rate: u32,
) -> Result<FrameAnalysis, MeasurementError> {
    let normalised = normalise(samples)?;
    let edges = rising_edges(&normalised);
    let frame_times: Vec<f64> = edges
        .windows(2)
        .map(|e| 1000.0 * (e[1] - e[0]) as f64 / sample_rate)
        .collect();

    let mut sorted = frame_times.clone();
    sorted.sort_by(f64::total_cmp);
    let (Some(percentile_1), Some(percentile_50), Some(percentile_99)) = (
        percentile(&sorted, 0.01),
        percentile(&sorted, 0.5),
        percentile(&sorted, 0.99),
    ) else {
        return Err(MeasurementError::AnalysisFailed);
    };

    let stutter_threshold = (1000.0 / f64::from(refresh_rate.max(1))) * 2.0 * 1.1;
    let stutters = frame_times
        .iter()
        .filter(|&&t| t > stutter_threshold)
        .count();
    Ok(FrameAnalysis {
        frame_times,
        percentile_1,
        percentile_50,
        percentile_99,
        stutter_threshold,
        stutters,
    })
}

/// Detects uneven frame presentation
pub struct StutterTest {
    config: StutterConfig,
}

impl StutterTest {
    pub fn new(config: StutterConfig) -> Self {
        Self { config }
    }
}

impl Measurement for StutterTest {
    type Output = StutterResult;

    fn name(&self) -> &'static str {
        "stutter"
    }

    fn run(&mut self, session: &Session<'_>) -> RunResult<StutterResult> {
        let screen = session.screen();
        session.prompt(1.0, true)?;
        screen.set_color(1.0, 1.0, 1.0);
        session.sleep(session.timing().settle())?;

        let calibration = auto_sensitivity(
            session,
            MAX_SENSITIVITY,
            WHITE_CLIP,
            SHORT_SHOT_SECONDS,
            PercentileMode::Absolute,
        )?;
        let flickering_detected = calibration.noise() > FLICKER_NOISE;
        if flickering_detected {
            tracing::info!(
                noise = calibration.noise(),
                "Backlight flicker detected, smoothing capture"
            );
        }

        let rate = session.sensor().monitor_sample_rate(UNBUFFERED, FAST_ADC)?;
        let size = (rate * self.config.duration_ms as f64 / 1000.0) as usize;
        let capture: Arc<dyn SampleBuffer> = if flickering_detected {
            let factor = if FAST_ADC { SMOOTHING_FAST_ADC } else { SMOOTHING };
            Arc::new(RunningAverageSmoothingFilter::new(size, factor))
        } else {
            Arc::new(FixedRing::new(size))
        };

        screen.set_flicker(true);
        let options = MonitorOptions {
            unbuffered: UNBUFFERED,
            sensitivity: calibration.sensitivity,
            fast_adc: FAST_ADC,
        };
        let (sample_rate, activity) =
            session.start_monitor(options, Arc::clone(&capture), Feed::Continuous)?;
        session.wait_filled(capture.as_ref(), FILL_POLL_INTERVAL)?;
        // Push out anything captured before the flicker started
        session.sleep(session.timing().post_capture())?;
        activity.end();
        screen.set_flicker(false);
        screen.set_color(0.0, 0.0, 0.0);
        session.checkpoint()?;

        let analysis = analyse(&capture.snapshot(), sample_rate, screen.refresh_rate())?;
        tracing::info!(
            periods = analysis.frame_times.len(),
            stutters = analysis.stutters,
            "Frame pacing measured"
        );
        Ok(StutterResult {
            captured_at: Utc::now(),
            flickering_detected,
            sensitivity: calibration.sensitivity,
            sample_rate,
            frame_times: analysis.frame_times,
            percentile_1: analysis.percentile_1,
            percentile_50: analysis.percentile_50,
            percentile_99: analysis.percentile_99,
            stutter_threshold: analysis.stutter_threshold,
            stutters: analysis.stutters,
        })
    }
}
