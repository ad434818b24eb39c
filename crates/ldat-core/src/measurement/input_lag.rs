//! Click-to-photon latency
//!
//! The screen flashes white whenever a click reaches the host. The device
//! fires clicks on its own and streams light and click samples side by side;
//! the latency of each flash is the distance from its click to the sample
//! where the light first crosses the white threshold.

use super::{percentile, MeasurementError, Measurement, RunResult, Session, FILL_POLL_INTERVAL};
use crate::buffer::ring::FixedRing;
use crate::buffer::SampleBuffer;
use crate::calibration::{auto_sensitivity, PercentileMode, SHORT_SHOT_SECONDS};
use crate::config::InputLagConfig;
use crate::device::ButtonOptions;
use crate::MAX_SENSITIVITY;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Highest black reading accepted before the gain is lowered
pub const BLACK_CLIP: u32 = 100;

/// Smallest black-to-white range that can be analysed
pub const MIN_CONTRAST: u32 = 32;

/// Fraction of the range above which a sample counts as lit
const WHITE_FRACTION: f64 = 0.3;

/// Fraction of the range below which a sample counts as dark again
const BLACK_FRACTION: f64 = 0.7;

#[derive(Debug, Clone, Serialize)]
pub struct InputLagResult {
    pub captured_at: DateTime<Utc>,
    pub sensitivity: u8,
    pub sample_rate: f64,
    pub black_level: u32,
    /// Latencies in ms, in the order they were captured
    pub times: Vec<f64>,
    /// Latencies in ms, ascending
    pub distribution: Vec<f64>,
    pub percentile_low: f64,
    pub percentile_50: f64,
    pub percentile_high: f64,
}

/// Latency statistics of one capture
#[derive(Debug, Clone, PartialEq)]
pub struct LagAnalysis {
    pub times: Vec<f64>,
    pub distribution: Vec<f64>,
    pub percentile_low: f64,
    pub percentile_50: f64,
    pub percentile_high: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingClick,
    Dark,
    Lit,
}

/// Indices of clicks and of dark-to-lit transitions
///
/// Nothing is recorded before the first click seen on a dark sample.
pub fn find_events(
    light: &[u32],
    clicks: &[u32],
    white_threshold: f64,
    black_threshold: f64,
) -> (Vec<usize>, Vec<usize>) {
    let mut click_at = Vec::new();
    let mut lit_at = Vec::new();
    let mut phase = Phase::AwaitingClick;

    for (i, (&l, &c)) in light.iter().zip(clicks).enumerate() {
        let clicked = c == 1;
        let level = f64::from(l);
        match phase {
            Phase::AwaitingClick => {
                if clicked && level <= black_threshold {
                    click_at.push(i);
                    phase = Phase::Dark;
                }
            }
            Phase::Dark => {
                if clicked {
                    click_at.push(i);
                }
                if f64::from(light[i - 1]) < white_threshold && level >= white_threshold {
                    lit_at.push(i);
                    phase = Phase::Lit;
                }
            }
            Phase::Lit => {
                if clicked {
                    click_at.push(i);
                }
                if f64::from(light[i - 1]) > black_threshold && level <= black_threshold {
                    phase = Phase::Dark;
                }
            }
        }
    }
    (click_at, lit_at)
}

/// Pair each transition with the click that caused it
///
/// Both inputs are ascending. A transition pairs with the latest click before
/// it, so when flashes were skipped the earlier clicks are dropped.
pub fn pair_clicks(clicks: &[usize], transitions: &[usize]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    let mut next = transitions.iter().copied();
    let mut i = 0;
    while i < clicks.len() {
        for t in next.by_ref() {
            if t > clicks[i] {
                while i + 1 < clicks.len() && clicks[i + 1] < t {
                    i += 1;
                }
                pairs.push((clicks[i], t));
                break;
            }
        }
        i += 1;
    }
    pairs
}

/// Latency statistics from parallel light and click captures
///
/// # Arguments
/// * `light` - Light samples
/// * `clicks` - Click samples, 1 where a click happened
/// * `black` - Dark reading from calibration
/// * `sample_rate` - Samples per second
///
/// # Errors
/// * [`MeasurementError::InsufficientContrast`] if the capture peaks less than 32 above `black`
/// * [`MeasurementError::AnalysisFailed`] if no click could be paired
pub fn analyse(
    light: &[u32],
    clicks: &[u32],
    black: u32,
    sample_rate: f64,
) -> Result<LagAnalysis, MeasurementError> {
    let max = light.iter().copied().max().unwrap_or(0);
    let range = max.saturating_sub(black);
    if range < MIN_CONTRAST {
        return Err(MeasurementError::InsufficientContrast { range });
    }
    let white_threshold = f64::from(black) + f64::from(range) * WHITE_FRACTION;
    let black_threshold = f64::from(black) + f64::from(range) * BLACK_FRACTION;

    let (click_at, lit_at) = find_events(light, clicks, white_threshold, black_threshold);
    let times: Vec<f64> = pair_clicks(&click_at, &lit_at)
        .into_iter()
        .map(|(c, t)| 1000.0 * (t - c) as f64 / sample_rate)
        .collect();
    tracing::debug!(
        clicks = click_at.len(),
        flashes = lit_at.len(),
        pairs = times.len(),
        "Input lag events"
    );

    let mut distribution = times.clone();
    distribution.sort_by(f64::total_cmp);
    match (
        percentile(&distribution, 0.33),
        percentile(&distribution, 0.5),
        percentile(&distribution, 0.66),
    ) {
        (Some(percentile_low), Some(percentile_50), Some(percentile_high)) => Ok(LagAnalysis {
            times,
            distribution,
            percentile_low,
            percentile_50,
            percentile_high,
        }),
        _ => Err(MeasurementError::AnalysisFailed),
    }
}

/// Measures the delay between a click and the resulting flash
pub struct InputLagTest {
    config: InputLagConfig,
}

impl InputLagTest {
    pub fn new(config: InputLagConfig) -> Self {
        Self { config }
    }
}

impl Measurement for InputLagTest {
    type Output = InputLagResult;

    fn name(&self) -> &'static str {
        "input-lag"
    }

    fn run(&mut self, session: &Session<'_>) -> RunResult<InputLagResult> {
        let screen = session.screen();
        screen.set_fake_load(self.config.fake_cpu_load_ms, self.config.fake_gpu_load_ms);
        session.prompt(0.0, false)?;
        screen.set_color(0.0, 0.0, 0.0);
        session.sleep(session.timing().settle())?;

        let calibration = auto_sensitivity(
            session,
            MAX_SENSITIVITY,
            BLACK_CLIP,
            SHORT_SHOT_SECONDS,
            PercentileMode::Absolute,
        )?;
        let black = calibration.shot.stats.high;

        screen.set_flash_on_click(true);
        let rate = session.sensor().button_sample_rate(false, true)?;
        let size = (rate * self.config.duration_ms as f64 / 1000.0) as usize;
        let light = Arc::new(FixedRing::new(size));
        let click = Arc::new(FixedRing::new(size));
        let options = ButtonOptions {
            unbuffered: false,
            sensitivity: calibration.sensitivity,
            fast_adc: true,
            no_click: false,
            auto_fire: true,
        };
        let (sample_rate, activity) =
            session.start_button(options, light.clone(), click.clone())?;
        session.wait_filled(light.as_ref(), FILL_POLL_INTERVAL)?;
        activity.end();
        screen.set_flash_on_click(false);
        session.checkpoint()?;

        let analysis = analyse(&light.snapshot(), &click.snapshot(), black, sample_rate)?;
        tracing::info!(
            samples = analysis.times.len(),
            median_ms = analysis.percentile_50,
            "Input lag measured"
        );
        Ok(InputLagResult {
            captured_at: Utc::now(),
            sensitivity: calibration.sensitivity,
            sample_rate,
            black_level: black,
            times: analysis.times,
            distribution: analysis.distribution,
            percentile_low: analysis.percentile_low,
            percentile_50: analysis.percentile_50,
            percentile_high: analysis.percentile_high,
        })
    }
}
