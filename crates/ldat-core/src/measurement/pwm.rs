//! Backlight PWM frequency
//!
//! About a second of light samples from a light grey screen is captured
//! through a [`SpectrumFilter`]; the strongest slot inside the search band is
//! the PWM frequency, provided it stands out enough.

use super::{Feed, Measurement, MeasurementError, RunResult, Session, FILL_POLL_INTERVAL};
use crate::buffer::SampleBuffer;
use crate::calibration::{auto_sensitivity, PercentileMode, LONG_SHOT_SECONDS};
use crate::config::PwmConfig;
use crate::device::MonitorOptions;
use crate::filter::spectrum::{strongest_frequency, SpectrumFilter};
use crate::MAX_SENSITIVITY;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Highest reading accepted before the gain is lowered
pub const WHITE_CLIP: u32 = 750;

/// Calibration spread above which the signal is reported as noisy
pub const NOISE_THRESHOLD: u32 = 8;

/// Grey shown while measuring
const SCREEN_GREY: f32 = 0.8;

const UNBUFFERED: bool = true;
const FAST_ADC: bool = true;

#[derive(Debug, Clone, Serialize)]
pub struct PwmResult {
    pub captured_at: DateTime<Utc>,
    /// Dominant frequency in Hz, 0 when none was found
    pub frequency: f64,
    pub noisy: bool,
    pub sensitivity: u8,
    pub sample_rate: f64,
    /// Un-windowed capture
    pub raw: Vec<u32>,
}

impl PwmResult {
    pub fn pwm_detected(&self) -> bool {
        self.frequency > 0.0
    }
}

/// Dominant frequency of a packed magnitude spectrum
///
/// Slot `i` is taken to sit at `i / len · rate / 2` Hz. Only slots inside
/// `[min_hz, max_hz]` are considered, and the winner must be at least 15% of
/// the slot count, otherwise 0 is returned. An empty DC slot means nothing was
/// captured and also yields 0.
///
/// # Example
/// ```
/// use ldat_core::measurement::pwm::detect_pwm_frequency;
///
/// let mut spectrum = vec![1; 1024];
/// spectrum[0] = 5000;
/// spectrum[240] = 400;
/// assert_eq!(detect_pwm_frequency(&spectrum, 2048.0, 40.0, 2500.0), 240.0);
/// ```
pub fn detect_pwm_frequency(spectrum: &[u32], sample_rate: f64, min_hz: f64, max_hz: f64) -> f64 {
    if spectrum.first().copied().unwrap_or(0) == 0 {
        return 0.0;
    }
    strongest_frequency(spectrum, sample_rate, min_hz, max_hz).unwrap_or(0.0)
}

/// Looks for PWM dimming of the backlight
pub struct PwmTest {
    config: PwmConfig,
}

impl PwmTest {
    pub fn new(config: PwmConfig) -> Self {
        Self { config }
    }
}

impl Measurement for PwmTest {
    type Output = PwmResult;

    fn name(&self) -> &'static str {
        "pwm"
    }

    fn run(&mut self, session: &Session<'_>) -> RunResult<PwmResult> {
        let (min_hz, max_hz) = (self.config.min_frequency_hz, self.config.max_frequency_hz);
        if min_hz > max_hz {
            return Err(MeasurementError::InvalidSettings(format!(
                "empty PWM search band {min_hz}..{max_hz} Hz"
            ))
            .into());
        }

        session.prompt(SCREEN_GREY, true)?;
        session.sleep(session.timing().settle())?;
        let calibration = auto_sensitivity(
            session,
            MAX_SENSITIVITY,
            WHITE_CLIP,
            LONG_SHOT_SECONDS,
            PercentileMode::Absolute,
        )?;
        let noisy = calibration.noise() > NOISE_THRESHOLD;

        let rate = session.sensor().monitor_sample_rate(UNBUFFERED, FAST_ADC)?;
        let size = (rate as usize).next_power_of_two();
        let filter = Arc::new(SpectrumFilter::new(size));
        let options = MonitorOptions {
            unbuffered: UNBUFFERED,
            sensitivity: calibration.sensitivity,
            fast_adc: FAST_ADC,
        };
        let (sample_rate, activity) =
            session.start_monitor(options, filter.clone(), Feed::UntilFilled)?;
        session.wait_filled(filter.as_ref(), FILL_POLL_INTERVAL)?;
        activity.end();
        session.checkpoint()?;

        let frequency = detect_pwm_frequency(&filter.snapshot(), sample_rate, min_hz, max_hz);
        tracing::info!(frequency, noisy, size, "PWM analysed");
        Ok(PwmResult {
            captured_at: Utc::now(),
            frequency,
            noisy,
            sensitivity: calibration.sensitivity,
            sample_rate,
            raw: filter.raw_snapshot(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_peak() {
        let mut spectrum = vec![0u32; 2048];
        spectrum[0] = 100_000;
        // 120 Hz at 4096 Hz: 120 / 2048 * 2048 slots
        spectrum[120] = 2000;
        assert_eq!(detect_pwm_frequency(&spectrum, 4096.0, 40.0, 2500.0), 120.0);
    }

    #[test]
    fn test_flat_spectrum_reports_none() {
        let mut spectrum = vec![10u32; 2048];
        spectrum[0] = 100_000;
        assert_eq!(detect_pwm_frequency(&spectrum, 4096.0, 40.0, 2500.0), 0.0);
    }

    #[test]
    fn test_weak_peak_rejected() {
        let mut spectrum = vec![0u32; 2048];
        spectrum[0] = 100_000;
        // 15% of 2048 is 307.2
        spectrum[120] = 307;
        assert_eq!(detect_pwm_frequency(&spectrum, 4096.0, 40.0, 2500.0), 0.0);
        spectrum[120] = 308;
        assert_eq!(detect_pwm_frequency(&spectrum, 4096.0, 40.0, 2500.0), 120.0);
    }

    #[test]
    fn test_peak_outside_band_ignored() {
        let mut spectrum = vec![0u32; 2048];
        spectrum[0] = 100_000;
        spectrum[20] = 5000;
        assert_eq!(detect_pwm_frequency(&spectrum, 4096.0, 40.0, 2500.0), 0.0);
    }

    #[test]
    fn test_empty_capture() {
        assert_eq!(detect_pwm_frequency(&[0; 64], 4096.0, 40.0, 2500.0), 0.0);
        assert_eq!(detect_pwm_frequency(&[], 4096.0, 40.0, 2500.0), 0.0);
    }

    #[test]
    fn test_square_wave_through_spectrum_filter() {
        let rate = 8192.0;
        let n = 8192;
        // 60% deep 250 Hz PWM on a 500 count level
        let samples: Vec<u32> = (0..n)
            .map(|i| {
                let phase = (i as f64 * 250.0 / rate).fract();
                if phase < 0.5 { 500 } else { 200 }
            })
            .collect();
        let filter = SpectrumFilter::new(n);
        filter.add_slice(&samples).unwrap();
        let freq = detect_pwm_frequency(&filter.snapshot(), rate, 40.0, 2500.0);
        assert!((freq - 250.0).abs() < 1.0, "detected {freq}");

        let steady = SpectrumFilter::new(n);
        steady.add_slice(&vec![500; n]).unwrap();
        assert_eq!(detect_pwm_frequency(&steady.snapshot(), rate, 40.0, 2500.0), 0.0);
    }
}
