//! Light to sound
//!
//! Streams the light sensor at its fastest rate straight to an audio output,
//! so backlight flicker can be heard. The last half second is also kept as a
//! chart window and as a spectrum, from which the strongest frequency in a
//! band can be read at any time.

use crate::buffer::ring::FixedRing;
use crate::buffer::SampleBuffer;
use crate::device::{DeviceError, LightSensor, MonitorOptions, MonitorSink, StreamError};
use crate::filter::spectrum::{strongest_frequency, SpectrumFilter};
use crate::MAX_SENSITIVITY;
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Gain applied to each reading before it is played
pub const DEFAULT_VOLUME: i32 = 32;

pub const DEFAULT_SENSITIVITY: u8 = 2;

/// Length of the chart and spectrum windows
const WINDOW_SECONDS: f64 = 0.5;

const UNBUFFERED: bool = false;
const FAST_ADC: bool = true;

/// Plays signed 16-bit mono samples at the sensor's sample rate
pub trait AudioOutput: Send + Sync {
    fn play(&self, samples: &[i16]);

    /// Drop anything queued and stay silent until [`resume`](Self::resume)
    fn pause(&self);

    fn resume(&self);
}

/// Scale a reading to a PCM sample, saturating at full scale
///
/// # Example
/// ```
/// use ldat_core::measurement::light_to_sound::to_pcm;
///
/// assert_eq!(to_pcm(1023, 32), 32736);
/// assert_eq!(to_pcm(1023, 64), i16::MAX);
/// ```
pub fn to_pcm(reading: u32, volume: i32) -> i16 {
    let scaled = i64::from(reading) * i64::from(volume);
    scaled.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16
}

#[derive(Debug, Clone, PartialEq)]
pub enum LightToSoundEvent {
    Error(StreamError),
    Stopped,
}

struct SoundSink {
    chart: Arc<FixedRing>,
    spectrum: Arc<SpectrumFilter>,
    volume: Arc<AtomicI32>,
    output: Arc<dyn AudioOutput>,
    events: Sender<LightToSoundEvent>,
}

impl MonitorSink for SoundSink {
    fn on_samples(&self, samples: &[u32]) {
        self.chart.push_slice(samples);
        if let Err(e) = self.spectrum.add_slice(samples) {
            tracing::warn!(error = %e, "Spectrum rejected samples");
        }
        let volume = self.volume.load(Ordering::Relaxed);
        let pcm: Vec<i16> = samples.iter().map(|&s| to_pcm(s, volume)).collect();
        self.output.play(&pcm);
    }

    fn on_error(&self, error: StreamError) {
        tracing::error!(error = %error, "Light to sound streaming failed");
        self.output.pause();
        if let Err(e) = self.events.send(LightToSoundEvent::Error(error)) {
            tracing::debug!(event = ?e.into_inner(), "No listener for light to sound error");
        }
    }
}

/// Plays the light sensor through an [`AudioOutput`]
///
/// Streaming stops on [`cancel`](Self::cancel) or when dropped.
pub struct LightToSound {
    sensor: Arc<dyn LightSensor>,
    output: Arc<dyn AudioOutput>,
    sample_rate: f64,
    sensitivity: u8,
    volume: Arc<AtomicI32>,
    chart: Arc<FixedRing>,
    spectrum: Arc<SpectrumFilter>,
    events: Sender<LightToSoundEvent>,
    running: bool,
}

impl LightToSound {
    /// Create an idle player and the channel its events arrive on
    pub fn new(
        sensor: Arc<dyn LightSensor>,
        output: Arc<dyn AudioOutput>,
    ) -> Result<(Self, Receiver<LightToSoundEvent>), DeviceError> {
        let sample_rate = sensor.monitor_sample_rate(UNBUFFERED, FAST_ADC)?;
        let window = (sample_rate * WINDOW_SECONDS) as usize;
        let (tx, rx) = crossbeam_channel::unbounded();
        let player = Self {
            sensor,
            output,
            sample_rate,
            sensitivity: DEFAULT_SENSITIVITY,
            volume: Arc::new(AtomicI32::new(DEFAULT_VOLUME)),
            chart: Arc::new(FixedRing::new(window)),
            spectrum: Arc::new(SpectrumFilter::new(window.next_power_of_two())),
            events: tx,
            running: false,
        };
        Ok((player, rx))
    }

    /// Start (or restart) streaming at the current sensitivity
    pub fn begin(&mut self) -> Result<(), DeviceError> {
        self.output.pause();
        if self.running {
            self.sensor.end_current_activity();
            self.running = false;
        }
        let sink = Arc::new(SoundSink {
            chart: Arc::clone(&self.chart),
            spectrum: Arc::clone(&self.spectrum),
            volume: Arc::clone(&self.volume),
            output: Arc::clone(&self.output),
            events: self.events.clone(),
        });
        let options = MonitorOptions {
            unbuffered: UNBUFFERED,
            sensitivity: self.sensitivity,
            fast_adc: FAST_ADC,
        };
        self.sample_rate = self.sensor.start_monitor(options, sink)?;
        self.output.resume();
        self.running = true;
        tracing::info!(
            sensitivity = self.sensitivity,
            sample_rate = self.sample_rate,
            "Light to sound started"
        );
        Ok(())
    }

    /// Stop streaming and silence the output
    pub fn cancel(&mut self) {
        if std::mem::take(&mut self.running) {
            self.sensor.end_current_activity();
            self.output.pause();
            if self.events.send(LightToSoundEvent::Stopped).is_err() {
                tracing::debug!("No listener for light to sound stop");
            }
            tracing::info!("Light to sound stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Change the gain level, restarting the stream if it is running
    pub fn set_sensitivity(&mut self, sensitivity: u8) -> Result<(), DeviceError> {
        let sensitivity = sensitivity.min(MAX_SENSITIVITY);
        if sensitivity == self.sensitivity {
            return Ok(());
        }
        self.sensitivity = sensitivity;
        if self.running {
            self.begin()?;
        }
        Ok(())
    }

    pub fn sensitivity(&self) -> u8 {
        self.sensitivity
    }

    /// Takes effect from the next batch of samples
    pub fn set_volume(&self, volume: i32) {
        self.volume.store(volume.max(0), Ordering::Relaxed);
    }

    pub fn volume(&self) -> i32 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// The last half second of readings, oldest first
    pub fn chart(&self) -> Vec<u32> {
        self.chart.snapshot()
    }

    /// Strongest frequency of the last half second inside `[min_hz, max_hz]`
    pub fn strongest_frequency(&self, min_hz: f64, max_hz: f64) -> Option<f64> {
        strongest_frequency(&self.spectrum.snapshot(), self.sample_rate, min_hz, max_hz)
    }

    /// True once a full window has been captured since creation
    pub fn window_filled(&self) -> bool {
        self.spectrum.is_filled()
    }
}

impl Drop for LightToSound {
    fn drop(&mut self) {
        self.cancel();
    }
}
