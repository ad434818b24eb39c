//! Measurement framework and algorithms
//!
//! A measurement runs on its own thread and talks to the instrument through a
//! [`Session`]. Every blocking wait inside a session polls the shared
//! [`RunControl`], so a cancel request, a user abort from the test screen or a
//! streaming failure ends the run within a few milliseconds. Early exits travel
//! as an [`Interrupt`] through `?`; the runner turns them into an [`Outcome`]
//! and always leaves the instrument idle.
//!
//! Algorithms:
//! - [`input_lag`]: click-to-photon latency
//! - [`stutter`]: frame pacing from a flickering screen
//! - [`response`]: grey-to-grey pixel response time
//! - [`overdrive`]: grey-to-grey overshoot and undershoot
//! - [`pwm`]: backlight PWM frequency
//! - [`live_lag`]: continuous click-to-photon monitor
//! - [`light_to_sound`]: the light sensor played as audio

pub mod input_lag;
pub mod light_to_sound;
pub mod live_lag;
pub mod overdrive;
pub mod pwm;
pub mod response;
pub mod screen;
pub mod stutter;

use crate::buffer::SampleBuffer;
use crate::config::Timing;
use crate::device::{
    ButtonOptions, ButtonSink, DeviceError, LightSensor, MonitorOptions, MonitorSink, StreamError,
};
use crossbeam_channel::{Receiver, Sender};
use screen::{ScreenEvent, TestScreen};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Longest a blocking wait goes without checking for cancellation
pub const CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Poll interval while waiting for a capture buffer to fill
pub const FILL_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Reasons a measurement can fail
#[derive(Error, Debug)]
pub enum MeasurementError {
    #[error("Analysis failed: no usable events in the capture")]
    AnalysisFailed,

    #[error("Insufficient contrast: signal range {range} is below 32")]
    InsufficientContrast { range: u32 },

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Incompatible device: {0}")]
    IncompatibleDevice(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("Test screen error: {0}")]
    Screen(String),

    #[error("Measurement thread panicked: {0}")]
    Panicked(String),
}

/// Why a run ended without a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Cancelled from the test screen
    UserAborted,
    /// [`MeasurementHandle::cancel`] was called
    Requested,
}

/// How a run ended
#[derive(Debug)]
pub enum Outcome<T> {
    Completed(T),
    Cancelled(CancelReason),
    Failed(MeasurementError),
}

impl<T> Outcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    /// The result, if the run completed
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(r) => Some(r),
            _ => None,
        }
    }
}

impl<T> From<RunResult<T>> for Outcome<T> {
    fn from(result: RunResult<T>) -> Self {
        match result {
            Ok(r) => Outcome::Completed(r),
            Err(Interrupt::Cancelled(reason)) => Outcome::Cancelled(reason),
            Err(Interrupt::Failed(e)) => Outcome::Failed(e),
        }
    }
}

/// Early exit from inside a run
#[derive(Debug)]
pub enum Interrupt {
    Cancelled(CancelReason),
    Failed(MeasurementError),
}

impl From<MeasurementError> for Interrupt {
    fn from(e: MeasurementError) -> Self {
        Interrupt::Failed(e)
    }
}

impl From<DeviceError> for Interrupt {
    fn from(e: DeviceError) -> Self {
        Interrupt::Failed(e.into())
    }
}

impl From<StreamError> for Interrupt {
    fn from(e: StreamError) -> Self {
        Interrupt::Failed(e.into())
    }
}

pub type RunResult<T> = Result<T, Interrupt>;

/// Shared stop/abort/error state of one run
pub struct RunControl {
    cancel_requested: AtomicBool,
    enter_pressed: AtomicBool,
    user_aborted: AtomicBool,
    /// Set once the first asynchronous failure has been recorded
    failed: AtomicBool,
    failure: Mutex<Option<MeasurementError>>,
    events: Receiver<ScreenEvent>,
}

impl RunControl {
    pub fn new(events: Receiver<ScreenEvent>) -> Self {
        Self {
            cancel_requested: AtomicBool::new(false),
            enter_pressed: AtomicBool::new(false),
            user_aborted: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            failure: Mutex::new(None),
            events,
        }
    }

    /// Ask the run to stop at its next check
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Record an asynchronous failure; only the first one is kept
    pub fn report(&self, error: MeasurementError) {
        if self.failed.swap(true, Ordering::AcqRel) {
            tracing::debug!(error = %error, "Further failure ignored");
            return;
        }
        tracing::warn!(error = %error, "Measurement failure reported");
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    fn pump_events(&self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                ScreenEvent::EnterPressed => self.enter_pressed.store(true, Ordering::Release),
                ScreenEvent::Cancel => self.user_aborted.store(true, Ordering::Release),
                ScreenEvent::Error(msg) => self.report(MeasurementError::Screen(msg)),
            }
        }
    }

    /// Return early if the run should stop
    ///
    /// Cancellation and failures are checked before a user abort.
    pub fn checkpoint(&self) -> RunResult<()> {
        self.pump_events();
        if self.is_cancelled() {
            return Err(Interrupt::Cancelled(CancelReason::Requested));
        }
        if self.failed.load(Ordering::Acquire) {
            let failure = self
                .failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            return Err(match failure {
                Some(e) => Interrupt::Failed(e),
                // Already handed out once; the run is unwinding
                None => Interrupt::Cancelled(CancelReason::Requested),
            });
        }
        if self.user_aborted.load(Ordering::Acquire) {
            return Err(Interrupt::Cancelled(CancelReason::UserAborted));
        }
        Ok(())
    }

    fn take_enter(&self) -> bool {
        self.enter_pressed.swap(false, Ordering::AcqRel)
    }
}

/// What a capture sink does once its buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// Keep writing, so the buffer holds the newest samples
    Continuous,
    /// Stop writing, so the buffer holds the first samples
    UntilFilled,
}

struct MonitorCapture {
    buffer: Arc<dyn SampleBuffer>,
    feed: Feed,
    control: Arc<RunControl>,
}

impl MonitorSink for MonitorCapture {
    fn on_samples(&self, samples: &[u32]) {
        if self.feed == Feed::UntilFilled && self.buffer.is_filled() {
            return;
        }
        if let Err(e) = self.buffer.add_slice(samples) {
            tracing::warn!(error = %e, "Capture buffer rejected samples");
        }
    }

    fn on_error(&self, error: StreamError) {
        self.control.report(error.into());
    }
}

struct ButtonCapture {
    light: Arc<dyn SampleBuffer>,
    click: Arc<dyn SampleBuffer>,
    control: Arc<RunControl>,
}

impl ButtonSink for ButtonCapture {
    fn on_samples(&self, light: &[u32], click: &[u32]) {
        if let Err(e) = self
            .light
            .add_slice(light)
            .and_then(|()| self.click.add_slice(click))
        {
            tracing::warn!(error = %e, "Capture buffer rejected samples");
        }
    }

    fn on_error(&self, error: StreamError) {
        self.control.report(error.into());
    }
}

/// Ends the streaming session when dropped
#[must_use = "dropping the guard stops streaming immediately"]
pub struct ActivityGuard<'a> {
    sensor: &'a dyn LightSensor,
    active: bool,
}

impl<'a> ActivityGuard<'a> {
    pub fn new(sensor: &'a dyn LightSensor) -> Self {
        Self {
            sensor,
            active: true,
        }
    }

    /// Stop streaming now
    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if std::mem::take(&mut self.active) {
            self.sensor.end_current_activity();
        }
    }
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Everything a running measurement may touch
pub struct Session<'a> {
    sensor: &'a dyn LightSensor,
    screen: &'a dyn TestScreen,
    control: &'a Arc<RunControl>,
    timing: &'a Timing,
}

impl<'a> Session<'a> {
    pub fn new(
        sensor: &'a dyn LightSensor,
        screen: &'a dyn TestScreen,
        control: &'a Arc<RunControl>,
        timing: &'a Timing,
    ) -> Self {
        Self {
            sensor,
            screen,
            control,
            timing,
        }
    }

    pub fn sensor(&self) -> &'a dyn LightSensor {
        self.sensor
    }

    pub fn screen(&self) -> &'a dyn TestScreen {
        self.screen
    }

    pub fn timing(&self) -> &'a Timing {
        self.timing
    }

    pub fn checkpoint(&self) -> RunResult<()> {
        self.control.checkpoint()
    }

    /// Sleep while still honouring cancellation
    pub fn sleep(&self, duration: Duration) -> RunResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.checkpoint()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(CHECK_INTERVAL));
        }
    }

    /// Block until `buffer` reports filled
    pub fn wait_filled(&self, buffer: &dyn SampleBuffer, poll: Duration) -> RunResult<()> {
        loop {
            self.checkpoint()?;
            if buffer.is_filled() {
                return Ok(());
            }
            thread::sleep(poll);
        }
    }

    /// Show a colour with the placement target and wait for the user
    pub fn prompt(&self, grey: f32, black_target: bool) -> RunResult<()> {
        self.screen.set_color(grey, grey, grey);
        self.screen.set_target(0.5, 0.5, 0.2, black_target);
        self.control.take_enter();
        loop {
            self.checkpoint()?;
            if self.control.take_enter() {
                break;
            }
            thread::sleep(CHECK_INTERVAL);
        }
        self.screen.hide_target();
        Ok(())
    }

    /// Start monitor-mode streaming into `buffer`
    ///
    /// Returns the sample rate and a guard that stops streaming when dropped.
    pub fn start_monitor(
        &self,
        options: MonitorOptions,
        buffer: Arc<dyn SampleBuffer>,
        feed: Feed,
    ) -> RunResult<(f64, ActivityGuard<'a>)> {
        let sink = Arc::new(MonitorCapture {
            buffer,
            feed,
            control: Arc::clone(self.control),
        });
        let guard = ActivityGuard::new(self.sensor);
        let rate = self.sensor.start_monitor(options, sink)?;
        Ok((rate, guard))
    }

    /// Start button-mode streaming into parallel light and click buffers
    pub fn start_button(
        &self,
        options: ButtonOptions,
        light: Arc<dyn SampleBuffer>,
        click: Arc<dyn SampleBuffer>,
    ) -> RunResult<(f64, ActivityGuard<'a>)> {
        let sink = Arc::new(ButtonCapture {
            light,
            click,
            control: Arc::clone(self.control),
        });
        let guard = ActivityGuard::new(self.sensor);
        let rate = self.sensor.start_button(options, sink)?;
        Ok((rate, guard))
    }
}

/// A measurement algorithm
pub trait Measurement: Send + 'static {
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    fn run(&mut self, session: &Session<'_>) -> RunResult<Self::Output>;
}

/// Receives the end of a run; exactly one method is called
pub trait MeasurementObserver<T>: Send {
    fn on_done(&self, result: T);
    fn on_error(&self, error: MeasurementError);
    fn on_cancelled(&self, reason: CancelReason);
}

/// Observer that forwards the [`Outcome`] over a channel
pub struct OutcomeChannel<T> {
    tx: Sender<Outcome<T>>,
}

impl<T> OutcomeChannel<T> {
    pub fn new(tx: Sender<Outcome<T>>) -> Self {
        Self { tx }
    }

    fn send(&self, outcome: Outcome<T>) {
        if self.tx.send(outcome).is_err() {
            tracing::debug!("Outcome receiver dropped");
        }
    }
}

impl<T: Send> MeasurementObserver<T> for OutcomeChannel<T> {
    fn on_done(&self, result: T) {
        self.send(Outcome::Completed(result));
    }

    fn on_error(&self, error: MeasurementError) {
        self.send(Outcome::Failed(error));
    }

    fn on_cancelled(&self, reason: CancelReason) {
        self.send(Outcome::Cancelled(reason));
    }
}

/// Handle to a measurement running on its own thread
pub struct MeasurementHandle {
    control: Arc<RunControl>,
    thread: Option<JoinHandle<()>>,
}

impl MeasurementHandle {
    /// Ask the run to stop; the observer then sees `on_cancelled`
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }

    /// Wait for the run to end
    pub fn join(mut self) {
        if let Some(h) = self.thread.take() {
            if h.join().is_err() {
                tracing::error!("Measurement thread panicked outside the run");
            }
        }
    }
}

impl Drop for MeasurementHandle {
    fn drop(&mut self) {
        if let Some(h) = self.thread.take() {
            self.control.cancel();
            if h.join().is_err() {
                tracing::error!("Measurement thread panicked outside the run");
            }
        }
    }
}

/// Start a measurement on its own thread
///
/// The screen's events are connected to the run before the thread starts.
pub fn begin<M: Measurement>(
    mut measurement: M,
    sensor: Arc<dyn LightSensor>,
    screen: Arc<dyn TestScreen>,
    timing: Timing,
    observer: Box<dyn MeasurementObserver<M::Output>>,
) -> Result<MeasurementHandle, MeasurementError> {
    let (tx, rx) = crossbeam_channel::unbounded();
    screen.connect_events(tx);
    let control = Arc::new(RunControl::new(rx));
    let run_control = Arc::clone(&control);

    let thread = thread::Builder::new()
        .name(format!("ldat-{}", measurement.name()))
        .spawn(move || {
            let outcome = execute(
                &mut measurement,
                sensor.as_ref(),
                screen.as_ref(),
                &run_control,
                &timing,
            );
            match outcome {
                Outcome::Completed(r) => observer.on_done(r),
                Outcome::Cancelled(reason) => observer.on_cancelled(reason),
                Outcome::Failed(e) => observer.on_error(e),
            }
        })
        .map_err(|e| MeasurementError::Device(DeviceError::Io(e)))?;

    Ok(MeasurementHandle {
        control,
        thread: Some(thread),
    })
}

/// Run a measurement on the calling thread
///
/// Whatever happens inside the run, streaming is stopped and the screen is
/// closed before this returns.
pub fn execute<M: Measurement>(
    measurement: &mut M,
    sensor: &dyn LightSensor,
    screen: &dyn TestScreen,
    control: &Arc<RunControl>,
    timing: &Timing,
) -> Outcome<M::Output> {
    let name = measurement.name();
    tracing::info!(measurement = name, "Measurement started");

    let result = if sensor.identity().light_sensor {
        let session = Session::new(sensor, screen, control, timing);
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| measurement.run(&session)))
            .unwrap_or_else(|panic| {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Err(Interrupt::Failed(MeasurementError::Panicked(msg)))
            })
    } else {
        Err(Interrupt::Failed(MeasurementError::IncompatibleDevice(
            "no light sensor".to_string(),
        )))
    };

    sensor.end_current_activity();
    screen.close();

    let outcome = Outcome::from(result);
    match &outcome {
        Outcome::Completed(_) => tracing::info!(measurement = name, "Measurement completed"),
        Outcome::Cancelled(reason) => {
            tracing::info!(measurement = name, ?reason, "Measurement cancelled")
        }
        Outcome::Failed(e) => tracing::error!(measurement = name, error = %e, "Measurement failed"),
    }
    outcome
}

/// Start a measurement and wait for its outcome
pub fn run_to_completion<M: Measurement>(
    measurement: M,
    sensor: Arc<dyn LightSensor>,
    screen: Arc<dyn TestScreen>,
    timing: Timing,
) -> Outcome<M::Output> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let handle = match begin(
        measurement,
        sensor,
        screen,
        timing,
        Box::new(OutcomeChannel::new(tx)),
    ) {
        Ok(h) => h,
        Err(e) => return Outcome::Failed(e),
    };
    handle.join();
    rx.recv().unwrap_or_else(|_| {
        Outcome::Failed(MeasurementError::Panicked(
            "measurement ended without an outcome".to_string(),
        ))
    })
}

/// Element at fraction `p` of a sorted slice
///
/// Indexes at `floor(len · p)`, clamped to the last element.
pub fn percentile<T: Copy>(sorted: &[T], p: f64) -> Option<T> {
    let last = sorted.len().checked_sub(1)?;
    let index = ((sorted.len() as f64 * p) as usize).min(last);
    Some(sorted[index])
}

/// Grey levels `0, step, 2·step, ...` ending at exactly 255
pub fn step_grid(step: u8) -> Result<Vec<u8>, MeasurementError> {
    if step == 0 {
        return Err(MeasurementError::InvalidSettings(
            "step must be at least 1".to_string(),
        ));
    }
    let mut grid: Vec<u8> = (0..=255u16)
        .step_by(usize::from(step))
        .map(|l| l as u8)
        .collect();
    if grid.last() != Some(&255) {
        grid.push(255);
    }
    Ok(grid)
}
