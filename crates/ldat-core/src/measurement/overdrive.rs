//! Grey-to-grey overshoot and undershoot
//!
//! Rising transitions driven too hard overshoot the destination level before
//! settling; falling ones undershoot it. The excursion is read off the sorted
//! capture and expressed as a percentage of either the transition range or the
//! full black-to-white range.

use super::response::{
    capture_transition, peak_hold_window, sweep_steps, PairResult, StepCalibration, FAST_ADC,
    UNBUFFERED,
};
use super::screen::set_grey;
use super::{step_grid, Measurement, MeasurementError, RunResult, Session};
use crate::calibration::{shot, GainTable, PercentileMode, LONG_SHOT_SECONDS};
use crate::config::{OverdriveConfig, OverdriveMethod};
use crate::MAX_SENSITIVITY;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Gain re-measurement needs a grid at least this fine
const MIN_STEPS_FOR_GAINS: usize = 8;

/// Fraction of the sorted samples skipped at the extreme end
const TAIL_FRACTION: f64 = 0.001;

#[derive(Debug, Clone, Serialize)]
pub struct OverdriveResult {
    pub captured_at: DateTime<Utc>,
    pub flickering_detected: bool,
    pub method: OverdriveMethod,
    pub gains: GainTable,
    pub sample_rate: f64,
    pub steps: Vec<u8>,
    pub calibration: Vec<StepCalibration>,
    /// Excursion percentages keyed `e{from}>{to}`, in measurement order
    pub transitions: Vec<PairResult>,
}

impl OverdriveResult {
    pub fn excursion(&self, from: u8, to: u8) -> Option<f64> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
            .map(|t| t.value)
    }
}

/// Overshoot (rising) or undershoot (falling) of a transition, in percent
///
/// `from_level` and `to_level` are in the scale of sensitivity 0, while the
/// samples and `end_level` were captured at `sensitivity`. Returns 0 when the
/// capture never crosses `end_level` or the range is empty.
pub fn excursion_percent(
    samples: &[u32],
    end_level: u32,
    falling: bool,
    sensitivity: u8,
    from_level: f64,
    to_level: f64,
    gains: &GainTable,
) -> f64 {
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let crossing =
        (1..sorted.len()).find(|&i| sorted[i] >= end_level && sorted[i - 1] < end_level);
    let Some(crossing) = crossing else {
        return 0.0;
    };

    let (beyond, range) = if falling {
        let below = &sorted[..crossing];
        let at = ((below.len() as f64 * TAIL_FRACTION) as usize).min(below.len() - 1);
        (f64::from(end_level) - f64::from(below[at]), from_level - to_level)
    } else {
        let above = &sorted[crossing..];
        let at = ((above.len() as f64 * (1.0 - TAIL_FRACTION)) as usize).min(above.len() - 1);
        (f64::from(above[at]) - f64::from(end_level), to_level - from_level)
    };
    if range <= 0.0 {
        return 0.0;
    }
    100.0 * gains.normalise(beyond, sensitivity) / range
}

/// Measures overdrive artefacts on every grey-to-grey transition
pub struct OverdriveTest {
    config: OverdriveConfig,
}

impl OverdriveTest {
    pub fn new(config: OverdriveConfig) -> Self {
        Self { config }
    }

    /// Re-measure the brightest step each sensitivity can see
    fn measure_gains(
        &self,
        session: &Session<'_>,
        steps: &[StepCalibration],
        gains: &mut GainTable,
    ) -> RunResult<()> {
        for top in (1..=MAX_SENSITIVITY).rev() {
            let Some(brightest) = steps
                .iter()
                .filter(|s| s.sensitivity >= top)
                .max_by_key(|s| s.level)
            else {
                continue;
            };
            if set_grey(session.screen(), brightest.level) {
                session.sleep(session.timing().settle())?;
            }
            let mut levels = Vec::with_capacity(usize::from(top) + 1);
            for sensitivity in 0..=top {
                let s = shot(session, sensitivity, LONG_SHOT_SECONDS, PercentileMode::Absolute)?;
                levels.push(s.stats.mean.trunc());
            }
            if let Err(e) = gains.update_from_levels(&levels) {
                tracing::warn!(level = brightest.level, error = %e, "Gain re-measurement skipped");
            }
        }
        tracing::info!(gains = ?gains.0, "Gain table measured");
        Ok(())
    }
}

impl Measurement for OverdriveTest {
    type Output = OverdriveResult;

    fn name(&self) -> &'static str {
        "overdrive"
    }

    fn run(&mut self, session: &Session<'_>) -> RunResult<OverdriveResult> {
        let grid = step_grid(self.config.step)?;

        session.prompt(0.0, false)?;
        let sweep = sweep_steps(session, &grid)?;
        let flickering = sweep.flickering_detected;
        let sample_rate = session.sensor().monitor_sample_rate(UNBUFFERED, FAST_ADC)?;
        let peak_hold =
            flickering.then(|| peak_hold_window(sweep.noisiest.as_deref(), sample_rate));

        let mut gains = GainTable::default();
        if sweep.steps.len() >= MIN_STEPS_FOR_GAINS && !flickering {
            self.measure_gains(session, &sweep.steps, &mut gains)?;
        }

        let (Some(black), Some(white)) = (sweep.steps.first(), sweep.steps.last()) else {
            return Err(MeasurementError::AnalysisFailed.into());
        };
        let absolute = |step: &StepCalibration| {
            gains.normalise(f64::from(step.reading(flickering)), step.sensitivity)
        };

        let mut transitions = Vec::new();
        for from in &sweep.steps {
            for to in &sweep.steps {
                if from.level == to.level {
                    continue;
                }
                if self.config.skip_extremes && (to.level == 0 || to.level == 255) {
                    continue;
                }
                set_grey(session.screen(), from.level);
                session.sleep(session.timing().settle())?;

                let samples =
                    capture_transition(session, to.level, to.sensitivity, sample_rate, peak_hold)?;
                let falling = to.level < from.level;
                let (from_level, to_level) = match self.config.method {
                    OverdriveMethod::Relative => (absolute(from), absolute(to)),
                    OverdriveMethod::Absolute if falling => (absolute(white), absolute(black)),
                    OverdriveMethod::Absolute => (absolute(black), absolute(white)),
                };
                let percent = excursion_percent(
                    &samples,
                    to.reading(flickering),
                    falling,
                    to.sensitivity,
                    from_level,
                    to_level,
                    &gains,
                );
                tracing::debug!(from = from.level, to = to.level, percent, "Excursion measured");
                transitions.push(PairResult {
                    from: from.level,
                    to: to.level,
                    key: format!("e{}>{}", from.level, to.level),
                    value: percent,
                });
            }
        }

        tracing::info!(transitions = transitions.len(), "Overdrive measured");
        Ok(OverdriveResult {
            captured_at: Utc::now(),
            flickering_detected: flickering,
            method: self.config.method,
            gains,
            sample_rate,
            steps: grid,
            calibration: sweep.steps,
            transitions,
        })
    }
}
