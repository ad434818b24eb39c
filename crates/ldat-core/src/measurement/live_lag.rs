//! Continuous click-to-photon monitor
//!
//! Unlike [`super::input_lag`], nothing is buffered for later analysis: every
//! button-mode sample goes through a small state machine that emits a delay
//! as soon as the light crosses the threshold after a click. The threshold
//! can be moved while streaming; sensitivity and auto-fire changes restart
//! the stream.

use crate::buffer::SampleBuffer;
use crate::config::LiveLagConfig;
use crate::device::{ButtonOptions, ButtonSink, DeviceError, LightSensor, StreamError};
use crate::{ADC_MAX, MAX_SENSITIVITY};
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

const UNBUFFERED: bool = false;
const FAST_ADC: bool = true;

/// Seconds after a click before an unanswered click is given up
const ARM_TIMEOUT: f64 = 0.9;

/// Seconds after a click before the detector re-arms
const REARM_DELAY: f64 = 0.2;

/// Where the detector is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LivePhase {
    WaitingForClick,
    WaitingForLight,
    WaitingForDark,
}

/// Per-sample click-to-photon detector
#[derive(Debug, Clone)]
pub struct LagDetector {
    sample_rate: f64,
    phase: LivePhase,
    samples: u64,
    click_at: f64,
}

impl LagDetector {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            phase: LivePhase::WaitingForClick,
            samples: 0,
            click_at: 0.0,
        }
    }

    pub fn phase(&self) -> LivePhase {
        self.phase
    }

    /// Advance by one sample; returns a delay in ms when a flash completes
    pub fn feed(&mut self, light: u32, click: u32, threshold: u32) -> Option<f64> {
        let t = self.samples as f64 / self.sample_rate;
        self.samples += 1;
        let clicked = click == 1;
        let lit = light >= threshold;

        match self.phase {
            LivePhase::WaitingForClick => {
                if clicked {
                    self.click_at = t;
                    if !lit {
                        self.phase = LivePhase::WaitingForLight;
                    }
                }
                None
            }
            LivePhase::WaitingForLight => {
                if clicked {
                    self.click_at = t;
                }
                if lit {
                    self.phase = LivePhase::WaitingForDark;
                    Some(1000.0 * (t - self.click_at))
                } else {
                    if t - self.click_at > ARM_TIMEOUT {
                        self.phase = LivePhase::WaitingForClick;
                    }
                    None
                }
            }
            LivePhase::WaitingForDark => {
                if !lit && t - self.click_at > REARM_DELAY {
                    self.phase = LivePhase::WaitingForClick;
                }
                None
            }
        }
    }
}

/// What the monitor reports
#[derive(Debug, Clone, PartialEq)]
pub enum LiveLagEvent {
    /// A click-to-photon delay in ms
    DataPoint(f64),
    /// Streaming failed; the monitor has stopped
    Error(StreamError),
    /// [`LiveLagMonitor::cancel`] was called
    Stopped,
}

struct LiveSink {
    detector: Arc<Mutex<LagDetector>>,
    threshold: Arc<AtomicU32>,
    light_window: Option<Arc<dyn SampleBuffer>>,
    click_window: Option<Arc<dyn SampleBuffer>>,
    events: Sender<LiveLagEvent>,
}

impl ButtonSink for LiveSink {
    fn on_samples(&self, light: &[u32], click: &[u32]) {
        for (window, data) in [(&self.click_window, click), (&self.light_window, light)] {
            if let Some(window) = window {
                if let Err(e) = window.add_slice(data) {
                    tracing::warn!(error = %e, "Live window rejected samples");
                }
            }
        }
        let threshold = self.threshold.load(Ordering::Relaxed);
        let mut detector = self.detector.lock().unwrap_or_else(PoisonError::into_inner);
        for (&l, &c) in light.iter().zip(click) {
            if let Some(delay) = detector.feed(l, c, threshold) {
                tracing::debug!(delay_ms = delay, "Live lag data point");
                if self.events.send(LiveLagEvent::DataPoint(delay)).is_err() {
                    tracing::debug!(delay_ms = delay, "No listener for live lag data point");
                }
            }
        }
    }

    fn on_error(&self, error: StreamError) {
        tracing::error!(error = %error, "Live lag streaming failed");
        if let Err(e) = self.events.send(LiveLagEvent::Error(error)) {
            tracing::debug!(event = ?e.into_inner(), "No listener for live lag error");
        }
    }
}

/// Streams button-mode samples and reports each click-to-photon delay
///
/// Streaming stops on [`cancel`](Self::cancel) or when the monitor is dropped.
pub struct LiveLagMonitor {
    sensor: Arc<dyn LightSensor>,
    sample_rate: f64,
    threshold: Arc<AtomicU32>,
    sensitivity: u8,
    auto_fire: bool,
    detector: Arc<Mutex<LagDetector>>,
    light_window: Option<Arc<dyn SampleBuffer>>,
    click_window: Option<Arc<dyn SampleBuffer>>,
    events: Sender<LiveLagEvent>,
    running: bool,
}

impl LiveLagMonitor {
    /// Create an idle monitor and the channel its events arrive on
    pub fn new(
        sensor: Arc<dyn LightSensor>,
        config: &LiveLagConfig,
    ) -> Result<(Self, Receiver<LiveLagEvent>), DeviceError> {
        let sample_rate = sensor.button_sample_rate(UNBUFFERED, FAST_ADC)?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let monitor = Self {
            sensor,
            sample_rate,
            threshold: Arc::new(AtomicU32::new(config.threshold.min(ADC_MAX))),
            sensitivity: config.sensitivity.min(MAX_SENSITIVITY),
            auto_fire: config.auto_fire,
            detector: Arc::new(Mutex::new(LagDetector::new(sample_rate))),
            light_window: None,
            click_window: None,
            events: tx,
            running: false,
        };
        Ok((monitor, rx))
    }

    /// Also copy every light and click sample into these buffers
    pub fn with_windows(
        mut self,
        light: Arc<dyn SampleBuffer>,
        click: Arc<dyn SampleBuffer>,
    ) -> Self {
        self.light_window = Some(light);
        self.click_window = Some(click);
        self
    }

    /// Start (or restart) streaming with the current settings
    pub fn begin(&mut self) -> Result<(), DeviceError> {
        if self.running {
            self.sensor.end_current_activity();
            self.running = false;
        }
        let detector = Arc::new(Mutex::new(LagDetector::new(self.sample_rate)));
        self.detector = Arc::clone(&detector);
        let sink = Arc::new(LiveSink {
            detector,
            threshold: Arc::clone(&self.threshold),
            light_window: self.light_window.clone(),
            click_window: self.click_window.clone(),
            events: self.events.clone(),
        });
        let options = ButtonOptions {
            unbuffered: UNBUFFERED,
            sensitivity: self.sensitivity,
            fast_adc: FAST_ADC,
            no_click: !self.auto_fire,
            auto_fire: self.auto_fire,
        };
        self.sample_rate = self.sensor.start_button(options, sink)?;
        self.running = true;
        tracing::info!(
            sensitivity = self.sensitivity,
            auto_fire = self.auto_fire,
            "Live lag monitor started"
        );
        Ok(())
    }

    /// Stop streaming
    pub fn cancel(&mut self) {
        if std::mem::take(&mut self.running) {
            self.sensor.end_current_activity();
            if self.events.send(LiveLagEvent::Stopped).is_err() {
                tracing::debug!("No listener for live lag stop");
            }
            tracing::info!("Live lag monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn phase(&self) -> LivePhase {
        self.detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .phase()
    }

    pub fn threshold(&self) -> u32 {
        self.threshold.load(Ordering::Relaxed)
    }

    /// Takes effect on the next batch; streaming continues
    pub fn set_threshold(&self, threshold: i32) {
        let clamped = threshold.clamp(0, ADC_MAX as i32) as u32;
        self.threshold.store(clamped, Ordering::Relaxed);
    }

    pub fn sensitivity(&self) -> u8 {
        self.sensitivity
    }

    /// Restarts a running stream when the clamped value differs
    pub fn set_sensitivity(&mut self, sensitivity: i32) -> Result<(), DeviceError> {
        let clamped = sensitivity.clamp(0, i32::from(MAX_SENSITIVITY)) as u8;
        if clamped == self.sensitivity {
            return Ok(());
        }
        self.sensitivity = clamped;
        self.restart()
    }

    pub fn auto_fire(&self) -> bool {
        self.auto_fire
    }

    /// Restarts a running stream when the value changes
    pub fn set_auto_fire(&mut self, auto_fire: bool) -> Result<(), DeviceError> {
        if auto_fire == self.auto_fire {
            return Ok(());
        }
        self.auto_fire = auto_fire;
        self.restart()
    }

    fn restart(&mut self) -> Result<(), DeviceError> {
        if self.running {
            self.begin()
        } else {
            Ok(())
        }
    }
}

impl Drop for LiveLagMonitor {
    fn drop(&mut self) {
        self.cancel();
    }
}
