//! Grey-to-grey pixel response time
//!
//! Every grey level of the step grid is calibrated first, then every ordered
//! pair of distinct levels is captured as a transition and timed between the
//! high and low thresholds (10% and 90% by default). Rising transitions are
//! reversed before timing so a single falling-edge detector serves both.
//!
//! The step sweep and the transition capture are shared with
//! [`super::overdrive`].

use super::screen::set_grey;
use super::{
    step_grid, Feed, Measurement, MeasurementError, RunResult, Session, FILL_POLL_INTERVAL,
};
use crate::buffer::ring::FixedRing;
use crate::buffer::SampleBuffer;
use crate::calibration::{auto_sensitivity, shot, PercentileMode, Shot, LONG_SHOT_SECONDS};
use crate::config::ResponseConfig;
use crate::device::MonitorOptions;
use crate::filter::peak_hold::PeakHoldFilter;
use crate::MAX_SENSITIVITY;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Highest reading accepted on any step before the gain is lowered
pub const STEP_CLIP: u32 = 650;

/// Calibration spread at or above which a step counts as flickering
pub const FLICKER_NOISE: u32 = 16;

/// Length of one transition capture
pub const CAPTURE_SECONDS: f64 = 0.6;

pub(crate) const UNBUFFERED: bool = true;
pub(crate) const FAST_ADC: bool = true;

/// Calibration of one grey level
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepCalibration {
    pub level: u8,
    pub sensitivity: u8,
    pub noise: u32,
    /// Mean reading at `sensitivity`
    pub mean: f64,
    /// Highest reading at `sensitivity`
    pub high: u32,
}

impl StepCalibration {
    /// Steady reading of this step: the peak when flickering, else the mean
    pub fn reading(&self, flickering: bool) -> u32 {
        if flickering {
            self.high
        } else {
            self.mean as u32
        }
    }
}

/// Outcome of calibrating the whole step grid
#[derive(Debug, Clone)]
pub struct StepSweep {
    pub steps: Vec<StepCalibration>,
    pub flickering_detected: bool,
    /// Raw samples of the noisiest flickering shot
    pub noisiest: Option<Vec<u32>>,
}

/// Calibrate every grey level of `grid`, darkest first
///
/// The sensitivity carries over from one step to the next, so it only ever
/// decreases along the grid.
pub fn sweep_steps(session: &Session<'_>, grid: &[u8]) -> RunResult<StepSweep> {
    let mut sensitivity = MAX_SENSITIVITY;
    let mut steps = Vec::with_capacity(grid.len());
    let mut flickering_detected = false;
    let mut noisiest = None;
    let mut max_noise = 0;

    for &level in grid {
        set_grey(session.screen(), level);
        session.sleep(session.timing().settle())?;
        let calibration = auto_sensitivity(
            session,
            sensitivity,
            STEP_CLIP,
            LONG_SHOT_SECONDS,
            PercentileMode::Absolute,
        )?;
        sensitivity = calibration.sensitivity;
        let noise = calibration.noise();
        if noise >= FLICKER_NOISE {
            flickering_detected = true;
            if noise >= max_noise {
                max_noise = noise;
                noisiest = Some(calibration.shot.raw.clone());
            }
        }
        steps.push(StepCalibration {
            level,
            sensitivity,
            noise,
            mean: calibration.shot.stats.mean,
            high: calibration.shot.stats.high,
        });
    }

    tracing::info!(
        steps = steps.len(),
        flickering = flickering_detected,
        "Step grid calibrated"
    );
    Ok(StepSweep {
        steps,
        flickering_detected,
        noisiest,
    })
}

/// Peak-hold window for flickering captures
///
/// Searches 1 ms to 20 ms of samples in 0.11 ms steps for the smallest
/// window that flattens the noisiest calibration shot; falls back to 8.5 ms.
pub fn peak_hold_window(noisiest: Option<&[u32]>, sample_rate: f64) -> usize {
    let found = noisiest.and_then(|samples| {
        PeakHoldFilter::find_best_window_size(
            samples,
            (sample_rate * 0.001) as usize,
            (sample_rate * 0.02) as usize,
            (sample_rate * 0.00011) as usize,
            FLICKER_NOISE,
        )
    });
    match found {
        Some(window) => {
            tracing::info!(window, "Peak-hold window selected");
            window
        }
        None => {
            let window = (sample_rate * 0.0085) as usize;
            tracing::warn!(window, "No peak-hold window tames the flicker, using default");
            window
        }
    }
}

/// Capture the screen switching to `to`
///
/// Streaming starts on the current colour; after the pre-trigger delay the
/// screen switches and capture continues until the buffer is full.
pub fn capture_transition(
    session: &Session<'_>,
    to: u8,
    sensitivity: u8,
    sample_rate: f64,
    peak_hold: Option<usize>,
) -> RunResult<Vec<u32>> {
    let size = (sample_rate * CAPTURE_SECONDS) as usize;
    let buffer: Arc<dyn SampleBuffer> = match peak_hold {
        Some(window) => Arc::new(PeakHoldFilter::new(size, window)),
        None => Arc::new(FixedRing::new(size)),
    };
    let options = MonitorOptions {
        unbuffered: UNBUFFERED,
        sensitivity,
        fast_adc: FAST_ADC,
    };
    let (_, activity) = session.start_monitor(options, Arc::clone(&buffer), Feed::UntilFilled)?;
    session.sleep(session.timing().pre_trigger())?;
    set_grey(session.screen(), to);
    session.wait_filled(buffer.as_ref(), FILL_POLL_INTERVAL)?;
    activity.end();
    Ok(buffer.snapshot())
}

/// One entry of a grey-to-grey table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairResult {
    pub from: u8,
    pub to: u8,
    pub key: String,
    pub value: f64,
}

/// Time in ms between the high and low threshold crossings of a transition
///
/// Thresholds are fractions of `start_level - end_level` above `end_level`.
/// A dip back above the high threshold restarts the search. Returns
/// infinity when the transition never completes.
///
/// # Arguments
/// * `samples` - Captured transition
/// * `start_level` - Steady reading before the transition
/// * `end_level` - Steady reading after the transition
/// * `low` - End threshold, e.g. 0.1
/// * `high` - Start threshold, e.g. 0.9
/// * `sample_rate` - Samples per second
pub fn transition_time(
    samples: &[u32],
    start_level: u32,
    end_level: u32,
    low: f64,
    high: f64,
    sample_rate: f64,
) -> f64 {
    let mut series = samples.to_vec();
    let (mut start_level, mut end_level) = (f64::from(start_level), f64::from(end_level));
    if start_level < end_level {
        series.reverse();
        std::mem::swap(&mut start_level, &mut end_level);
    }
    let range = start_level - end_level;

    let mut start = None;
    let mut end = None;
    for (i, &s) in series.iter().enumerate() {
        let above_end = f64::from(s) - end_level;
        if start.is_none() {
            if above_end <= range * high {
                start = Some(i);
            }
        } else if above_end > range * high {
            // False trigger
            start = None;
            end = None;
        } else if above_end <= range * low && end.is_none() {
            end = Some(i);
        }
    }

    match (start, end) {
        (Some(s), Some(e)) => 1000.0 * (e - s) as f64 / sample_rate,
        _ => f64::INFINITY,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PixelResponseResult {
    pub captured_at: DateTime<Utc>,
    pub flickering_detected: bool,
    pub peak_hold_window: Option<usize>,
    pub sample_rate: f64,
    pub steps: Vec<u8>,
    pub calibration: Vec<StepCalibration>,
    /// Response times in ms keyed `t{from}>{to}`, in measurement order
    pub transitions: Vec<PairResult>,
}

impl PixelResponseResult {
    pub fn time(&self, from: u8, to: u8) -> Option<f64> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
            .map(|t| t.value)
    }
}

/// Measures grey-to-grey response times
pub struct PixelResponseTest {
    config: ResponseConfig,
}

impl PixelResponseTest {
    pub fn new(config: ResponseConfig) -> Self {
        Self { config }
    }
}

impl Measurement for PixelResponseTest {
    type Output = PixelResponseResult;

    fn name(&self) -> &'static str {
        "response"
    }

    fn run(&mut self, session: &Session<'_>) -> RunResult<PixelResponseResult> {
        let (low, high) = (self.config.low_threshold, self.config.high_threshold);
        if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low >= high {
            return Err(MeasurementError::InvalidSettings(format!(
                "thresholds must satisfy 0 <= low < high <= 1 (got {low}, {high})"
            ))
            .into());
        }
        let grid = step_grid(self.config.step)?;

        session.prompt(0.0, false)?;
        let sweep = sweep_steps(session, &grid)?;
        let flickering = sweep.flickering_detected;
        let sample_rate = session.sensor().monitor_sample_rate(UNBUFFERED, FAST_ADC)?;
        let peak_hold =
            flickering.then(|| peak_hold_window(sweep.noisiest.as_deref(), sample_rate));
        let mode = if flickering {
            PercentileMode::Absolute
        } else {
            PercentileMode::Trimmed
        };
        let steady = |s: &Shot| {
            if flickering {
                s.stats.high
            } else {
                s.stats.mean as u32
            }
        };

        let mut transitions = Vec::new();
        for from in &sweep.steps {
            for to in &sweep.steps {
                if from.level == to.level {
                    continue;
                }
                set_grey(session.screen(), from.level);
                session.sleep(session.timing().settle())?;
                let sensitivity = from.sensitivity.min(to.sensitivity);

                let start_level = steady(&shot(session, sensitivity, LONG_SHOT_SECONDS, mode)?);
                let samples =
                    capture_transition(session, to.level, sensitivity, sample_rate, peak_hold)?;
                let end_level = steady(&shot(session, sensitivity, LONG_SHOT_SECONDS, mode)?);

                let ms = transition_time(&samples, start_level, end_level, low, high, sample_rate);
                tracing::debug!(from = from.level, to = to.level, ms, "Transition timed");
                transitions.push(PairResult {
                    from: from.level,
                    to: to.level,
                    key: format!("t{}>{}", from.level, to.level),
                    value: ms,
                });
            }
        }

        tracing::info!(transitions = transitions.len(), "Pixel response measured");
        Ok(PixelResponseResult {
            captured_at: Utc::now(),
            flickering_detected: flickering,
            peak_hold_window: peak_hold,
            sample_rate,
            steps: grid,
            calibration: sweep.steps,
            transitions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// `hold` samples at `a`, a linear ramp of `ramp` samples, then `hold` at `b`
    fn edge(a: u32, b: u32, ramp: usize, hold: usize) -> Vec<u32> {
        let mut out = vec![a; hold];
        for i in 0..ramp {
            let t = i as f64 / ramp as f64;
            out.push((f64::from(a) + (f64::from(b) - f64::from(a)) * t).round() as u32);
        }
        out.extend(vec![b; hold]);
        out
    }

    #[test]
    fn test_falling_transition() {
        // 1000 -> 0 over 100 samples: 90% at 10, 10% at 90
        let samples = edge(1000, 0, 100, 50);
        let ms = transition_time(&samples, 1000, 0, 0.1, 0.9, 1000.0);
        assert_relative_eq!(ms, 80.0);
    }

    #[test]
    fn test_rising_transition_is_mirrored() {
        let samples = edge(0, 1000, 50, 50);
        let ms = transition_time(&samples, 0, 1000, 0.1, 0.9, 1000.0);
        assert_relative_eq!(ms, 40.0);
    }

    #[test]
    fn test_custom_thresholds() {
        let samples = edge(1000, 0, 100, 50);
        let ms = transition_time(&samples, 1000, 0, 0.2, 0.8, 2000.0);
        assert_relative_eq!(ms, 30.0);
    }

    #[test]
    fn test_unfinished_transition_is_infinite() {
        // Stops halfway
        let samples = edge(1000, 500, 50, 50);
        let ms = transition_time(&samples, 1000, 0, 0.1, 0.9, 1000.0);
        assert!(ms.is_infinite());
    }

    #[test]
    fn test_false_trigger_restarts() {
        let mut samples = vec![1000u32; 20];
        samples.extend([850, 1000, 1000]);
        samples.extend(edge(1000, 0, 100, 20));
        let ms = transition_time(&samples, 1000, 0, 0.1, 0.9, 1000.0);
        assert_relative_eq!(ms, 80.0);
    }

    #[test]
    fn test_unfinished_rising_transition_is_infinite() {
        let samples = edge(0, 500, 50, 50);
        let ms = transition_time(&samples, 0, 1000, 0.1, 0.9, 1000.0);
        assert!(ms.is_infinite());
    }

    #[test]
    fn test_flat_trace_never_starts() {
        let samples = vec![1000u32; 200];
        let ms = transition_time(&samples, 1000, 0, 0.1, 0.9, 1000.0);
        assert!(ms.is_infinite());
    }

    #[test]
    fn test_false_trigger_after_end_restarts() {
        // Completes once, bounces back up, then completes again
        let mut samples = edge(1000, 0, 100, 20);
        samples.extend(edge(0, 1000, 10, 5));
        samples.extend(edge(1000, 0, 50, 20));
        let ms = transition_time(&samples, 1000, 0, 0.1, 0.9, 1000.0);
        assert_relative_eq!(ms, 40.0);
    }

    /// Hold `from`, settle through the midpoint for `mid` samples, hold `to`
    ///
    /// The only samples between the two thresholds are the midpoint ones, so
    /// the transition takes exactly `mid` samples whatever the thresholds.
    fn stepped(from: u32, to: u32, mid: usize) -> Vec<u32> {
        let near_from = if to > from {
            from + (to - from) / 20
        } else {
            from - (from - to) / 20
        };
        let mut out = vec![from; 40];
        out.extend(vec![near_from; 3]);
        out.extend(vec![(from + to) / 2; mid]);
        out.extend(vec![to; 40]);
        out
    }

    #[test]
    fn test_known_grey_to_grey_table() {
        let readings = [(0u8, 40u32), (128, 380), (255, 980)];
        // (from, to, midpoint samples, expected ms at 2 kHz)
        let table = [
            (0u8, 128u8, 30usize, 15.0),
            (0, 255, 22, 11.0),
            (128, 0, 64, 32.0),
            (128, 255, 18, 9.0),
            (255, 0, 80, 40.0),
            (255, 128, 47, 23.5),
        ];
        let reading = |level: u8| {
            readings
                .iter()
                .find(|(l, _)| *l == level)
                .map(|(_, r)| *r)
                .unwrap()
        };
        for (from, to, mid, expected) in table {
            let (a, b) = (reading(from), reading(to));
            let samples = stepped(a, b, mid);
            let ms = transition_time(&samples, a, b, 0.1, 0.9, 2000.0);
            assert_relative_eq!(ms, expected);
            // Thresholds only move the crossings within the flat parts
            let ms = transition_time(&samples, a, b, 0.2, 0.8, 2000.0);
            assert_relative_eq!(ms, expected);
        }
    }

    #[test]
    fn test_peak_hold_window_fallback() {
        assert_eq!(peak_hold_window(None, 1000.0), 8);
        // One-sample dips vanish under the smallest candidate window
        let noisy: Vec<u32> = (0..2000).map(|i| if i % 2 == 0 { 0 } else { 100 }).collect();
        assert_eq!(peak_hold_window(Some(&noisy), 20000.0), 20);
    }

    #[test]
    fn test_steady_reading() {
        let step = StepCalibration {
            level: 128,
            sensitivity: 3,
            noise: 40,
            mean: 300.7,
            high: 320,
        };
        assert_eq!(step.reading(false), 300);
        assert_eq!(step.reading(true), 320);
    }
}
