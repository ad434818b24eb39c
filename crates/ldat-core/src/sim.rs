//! Simulated instrument, test screen and serial line
//!
//! [`SimulatedSensor`] and [`SimulatedScreen`] share one [`SimPanel`], a model
//! of a display seen through the light sensor. Time is counted in samples: a
//! background thread advances the panel clock by [`SAMPLES_PER_TICK`] every
//! millisecond and streams the readings to whichever sink is active. Since
//! the reported sample rate is [`SIM_SAMPLE_RATE`], the simulation runs
//! faster than real time while every timing the measurements derive from
//! sample indices stays exact.
//!
//! [`ScriptedTransport`] is a byte-level stand-in for a serial port. It
//! answers the identify command with a fixed text and the light sensor
//! command with a fixed byte stream.

use crate::device::protocol::{COMMAND_ID, COMMAND_LIGHT_SENSOR, DRIVER_VERSION};
use crate::device::transport::Transport;
use crate::device::{
    ButtonOptions, ButtonSink, DeviceError, DeviceIdentity, LightSensor, MonitorOptions,
    MonitorSink, StreamError,
};
use crate::measurement::screen::{ScreenEvent, TestScreen};
use crate::ADC_MAX;
use crossbeam_channel::Sender;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Sample rate the simulated sensor reports for every mode
pub const SIM_SAMPLE_RATE: f64 = 2000.0;

/// Samples produced per millisecond of wall time
pub const SAMPLES_PER_TICK: u64 = 8;

const TICK: Duration = Duration::from_millis(1);

/// Relative gain of each sensitivity level
pub const SIM_GAINS: [f64; 4] = [0.25, 0.5, 0.75, 1.0];

/// Optical and electrical behaviour of the simulated display
#[derive(Debug, Clone, PartialEq)]
pub struct PanelModel {
    /// Reading for full white at the highest gain
    pub full_scale: f64,
    /// Light leaking through at black, as a fraction of full white
    pub ambient: f64,
    /// Samples for a dark-to-light change
    pub rise_samples: u64,
    /// Samples for a light-to-dark change
    pub fall_samples: u64,
    /// Fraction of the step the panel overshoots before settling
    pub overshoot: f64,
    pub refresh_rate: u32,
    /// Samples for a black/white edge while flickering
    pub flicker_edge_samples: u64,
    /// While flickering, every Nth frame repeats the previous one
    pub repeat_every: Option<u64>,
    /// Backlight PWM frequency
    pub pwm_hz: Option<f64>,
    /// Brightness lost during the PWM off phase
    pub pwm_depth: f64,
    /// Samples between auto-fire clicks
    pub click_interval: u64,
    /// Samples from a click to the flash it triggers
    pub click_lag: u64,
    /// Length of a click flash in samples
    pub flash_samples: u64,
}

impl Default for PanelModel {
    fn default() -> Self {
        Self {
            full_scale: 600.0,
            ambient: 0.05,
            rise_samples: 50,
            fall_samples: 100,
            overshoot: 0.0,
            refresh_rate: 60,
            flicker_edge_samples: 10,
            repeat_every: None,
            pwm_hz: None,
            pwm_depth: 0.6,
            click_interval: 400,
            click_lag: 60,
            flash_samples: 100,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Ramp {
    start: u64,
    from: f64,
    to: f64,
}

impl Ramp {
    fn steady(level: f64) -> Self {
        Self {
            start: 0,
            from: level,
            to: level,
        }
    }

    fn level(&self, clock: u64, model: &PanelModel) -> f64 {
        let t = clock.saturating_sub(self.start) as f64;
        let step = self.to - self.from;
        let duration = if step >= 0.0 {
            model.rise_samples
        } else {
            model.fall_samples
        }
        .max(1) as f64;
        let peak = self.to + model.overshoot * step;
        let settle = (duration / 2.0).max(1.0);
        if t < duration {
            self.from + (peak - self.from) * t / duration
        } else if t < duration + settle {
            peak + (self.to - peak) * (t - duration) / settle
        } else {
            self.to
        }
    }
}

enum Stream {
    Monitor {
        sink: Arc<dyn MonitorSink>,
        unbuffered: bool,
        gain: f64,
    },
    Button {
        sink: Arc<dyn ButtonSink>,
        unbuffered: bool,
        auto_fire: bool,
        gain: f64,
    },
}

struct PanelState {
    model: PanelModel,
    clock: u64,
    color: f64,
    ramp: Ramp,
    flicker: bool,
    flash_on_click: bool,
    /// Start, end and level of the current flash
    flash: Option<(u64, u64, f64)>,
    stream: Option<Stream>,
    unplugged: bool,
}

impl PanelState {
    fn frame_is_white(&self, frame: u64) -> bool {
        let effective = match self.model.repeat_every {
            Some(n) if n > 0 => frame - frame / n,
            _ => frame,
        };
        effective % 2 == 0
    }

    fn flicker_level(&self, clock: u64) -> f64 {
        let frame_len = SIM_SAMPLE_RATE / f64::from(self.model.refresh_rate.max(1));
        let position = clock as f64 / frame_len;
        let frame = position.floor() as u64;
        let into = (position - frame as f64) * frame_len;
        let level = |white: bool| if white { 1.0 } else { 0.0 };
        let current = level(self.frame_is_white(frame));
        let previous = if frame == 0 {
            current
        } else {
            level(self.frame_is_white(frame - 1))
        };
        let edge = self.model.flicker_edge_samples as f64;
        if into < edge {
            previous + (current - previous) * into / edge
        } else {
            current
        }
    }

    fn luminance(&self, clock: u64) -> f64 {
        if let Some((start, end, level)) = self.flash {
            if clock >= start && clock < end {
                return level;
            }
        }
        if self.flicker {
            self.flicker_level(clock)
        } else {
            self.ramp.level(clock, &self.model)
        }
    }

    fn reading(&self, clock: u64, gain: f64) -> u32 {
        let pwm = match self.model.pwm_hz {
            Some(hz) => {
                let phase = (clock as f64 * hz / SIM_SAMPLE_RATE).fract();
                if phase < 0.5 {
                    1.0
                } else {
                    1.0 - self.model.pwm_depth
                }
            }
            None => 1.0,
        };
        let light = (self.model.ambient + self.luminance(clock)).max(0.0);
        (light * pwm * self.model.full_scale * gain)
            .round()
            .clamp(0.0, f64::from(ADC_MAX)) as u32
    }

    /// Start moving toward `level` from wherever the panel is now
    fn retarget(&mut self, level: f64) {
        let from = self.luminance(self.clock);
        self.ramp = Ramp {
            start: self.clock,
            from,
            to: level,
        };
    }

    fn tick(&mut self) {
        let mut light = Vec::with_capacity(SAMPLES_PER_TICK as usize);
        let mut clicks = Vec::with_capacity(SAMPLES_PER_TICK as usize);
        let (gain, auto_fire) = match &self.stream {
            Some(Stream::Monitor { gain, .. }) => (*gain, false),
            Some(Stream::Button {
                gain, auto_fire, ..
            }) => (*gain, *auto_fire),
            None => (1.0, false),
        };

        for _ in 0..SAMPLES_PER_TICK {
            self.clock += 1;
            let click = auto_fire && self.clock % self.model.click_interval.max(1) == 0;
            if click && self.flash_on_click {
                let start = self.clock + self.model.click_lag;
                self.flash = Some((start, start + self.model.flash_samples, 1.0));
            }
            light.push(self.reading(self.clock, gain));
            clicks.push(u32::from(click));
        }

        if self.unplugged {
            if let Some(stream) = self.stream.take() {
                match stream {
                    Stream::Monitor { sink, .. } => sink.on_error(StreamError::DeviceClosed),
                    Stream::Button { sink, .. } => sink.on_error(StreamError::DeviceClosed),
                }
            }
            return;
        }

        match &self.stream {
            Some(Stream::Monitor {
                sink, unbuffered, ..
            }) => {
                if *unbuffered {
                    for v in &light {
                        sink.on_samples(std::slice::from_ref(v));
                    }
                } else {
                    sink.on_samples(&light);
                }
            }
            Some(Stream::Button {
                sink, unbuffered, ..
            }) => {
                if *unbuffered {
                    for (l, c) in light.iter().zip(&clicks) {
                        sink.on_samples(std::slice::from_ref(l), std::slice::from_ref(c));
                    }
                } else {
                    sink.on_samples(&light, &clicks);
                }
            }
            None => {}
        }
    }
}

/// Display model shared by the simulated sensor and screen
pub struct SimPanel {
    state: Mutex<PanelState>,
}

impl SimPanel {
    /// A black panel
    pub fn new(model: PanelModel) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PanelState {
                model,
                clock: 0,
                color: 0.0,
                ramp: Ramp::steady(0.0),
                flicker: false,
                flash_on_click: false,
                flash: None,
                stream: None,
                unplugged: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PanelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Samples elapsed since creation
    pub fn clock(&self) -> u64 {
        self.lock().clock
    }

    /// Current luminance in `[0, 1]`, before the sensor's gain
    pub fn luminance(&self) -> f64 {
        let state = self.lock();
        state.luminance(state.clock)
    }

    pub fn model(&self) -> PanelModel {
        self.lock().model.clone()
    }
}

/// Identity reported by [`SimulatedSensor`]
pub fn simulated_identity() -> DeviceIdentity {
    DeviceIdentity {
        model: 1,
        model_description: "OpenLDAT Simulator".to_string(),
        firmware_version: "sim".to_string(),
        serial_number: "SIM".to_string(),
        prototype: false,
        oscilloscope_debug: false,
        light_sensor: true,
        large_buffer: Some(SAMPLES_PER_TICK as usize),
        small_buffer: Some(SAMPLES_PER_TICK as usize),
        min_driver_version: DRIVER_VERSION,
    }
}

/// A [`LightSensor`] looking at a [`SimPanel`]
pub struct SimulatedSensor {
    panel: Arc<SimPanel>,
    identity: DeviceIdentity,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedSensor {
    /// Start the panel clock and return a sensor attached to it
    pub fn new(panel: Arc<SimPanel>) -> Result<Self, DeviceError> {
        Self::with_identity(panel, simulated_identity())
    }

    pub fn with_identity(
        panel: Arc<SimPanel>,
        identity: DeviceIdentity,
    ) -> Result<Self, DeviceError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = {
            let panel = Arc::clone(&panel);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("ldat-sim".into())
                .spawn(move || {
                    while !shutdown.load(Ordering::Acquire) {
                        thread::sleep(TICK);
                        panel.lock().tick();
                    }
                })?
        };
        Ok(Self {
            panel,
            identity,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn panel(&self) -> &Arc<SimPanel> {
        &self.panel
    }

    /// Simulate pulling the cable
    pub fn unplug(&self) {
        self.panel.lock().unplugged = true;
    }

    pub fn is_streaming(&self) -> bool {
        self.panel.lock().stream.is_some()
    }

    fn rate(&self) -> Result<f64, DeviceError> {
        if !self.identity.light_sensor {
            return Err(DeviceError::MissingLightSensor);
        }
        Ok(SIM_SAMPLE_RATE)
    }

    fn start(&self, stream: Stream) -> Result<f64, DeviceError> {
        let rate = self.rate()?;
        let mut state = self.panel.lock();
        if state.unplugged {
            return Err(DeviceError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "Device closed",
            )));
        }
        state.stream = Some(stream);
        Ok(rate)
    }
}

impl LightSensor for SimulatedSensor {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn monitor_sample_rate(&self, _unbuffered: bool, _fast_adc: bool) -> Result<f64, DeviceError> {
        self.rate()
    }

    fn button_sample_rate(&self, _unbuffered: bool, _fast_adc: bool) -> Result<f64, DeviceError> {
        self.rate()
    }

    fn start_monitor(
        &self,
        options: MonitorOptions,
        sink: Arc<dyn MonitorSink>,
    ) -> Result<f64, DeviceError> {
        self.start(Stream::Monitor {
            sink,
            unbuffered: options.unbuffered,
            gain: SIM_GAINS[usize::from(options.sensitivity.min(3))],
        })
    }

    fn start_button(
        &self,
        options: ButtonOptions,
        sink: Arc<dyn ButtonSink>,
    ) -> Result<f64, DeviceError> {
        self.start(Stream::Button {
            sink,
            unbuffered: options.unbuffered,
            auto_fire: options.auto_fire,
            gain: SIM_GAINS[usize::from(options.sensitivity.min(3))],
        })
    }

    fn end_current_activity(&self) {
        self.panel.lock().stream = None;
    }
}

impl Drop for SimulatedSensor {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Simulated sensor clock thread panicked");
            }
        }
    }
}

/// What the simulated user does when the placement target appears
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAction {
    Confirm,
    Cancel,
    Fail(String),
    Ignore,
}

/// A [`TestScreen`] that paints onto a [`SimPanel`]
pub struct SimulatedScreen {
    panel: Arc<SimPanel>,
    events: Mutex<Option<Sender<ScreenEvent>>>,
    on_target: UserAction,
    closed: AtomicBool,
}

impl SimulatedScreen {
    pub fn new(panel: Arc<SimPanel>) -> Self {
        Self {
            panel,
            events: Mutex::new(None),
            on_target: UserAction::Confirm,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_action(mut self, action: UserAction) -> Self {
        self.on_target = action;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Deliver an event as if the renderer had raised it
    pub fn send(&self, event: ScreenEvent) {
        if let Some(tx) = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            if let Err(e) = tx.send(event) {
                tracing::debug!(event = ?e.into_inner(), "No measurement listening to screen");
            }
        }
    }
}

impl TestScreen for SimulatedScreen {
    fn set_color(&self, r: f32, g: f32, b: f32) -> bool {
        let level = f64::from(r + g + b) / 3.0;
        let mut state = self.panel.lock();
        if state.color == level {
            return false;
        }
        state.color = level;
        if !state.flicker {
            state.retarget(level);
        }
        true
    }

    fn set_target(&self, _x: f32, _y: f32, _size: f32, _black: bool) {
        match &self.on_target {
            UserAction::Confirm => self.send(ScreenEvent::EnterPressed),
            UserAction::Cancel => self.send(ScreenEvent::Cancel),
            UserAction::Fail(msg) => self.send(ScreenEvent::Error(msg.clone())),
            UserAction::Ignore => {}
        }
    }

    fn hide_target(&self) {}

    fn flash_color(&self, r: f32, g: f32, b: f32, duration: Duration) {
        let level = f64::from(r + g + b) / 3.0;
        let mut state = self.panel.lock();
        let start = state.clock;
        let samples = (duration.as_secs_f64() * SIM_SAMPLE_RATE) as u64;
        state.flash = Some((start, start + samples, level));
    }

    fn set_flicker(&self, enabled: bool) {
        let mut state = self.panel.lock();
        if state.flicker == enabled {
            return;
        }
        let from = state.luminance(state.clock);
        state.flicker = enabled;
        if !enabled {
            let clock = state.clock;
            let to = state.color;
            state.ramp = Ramp {
                start: clock,
                from,
                to,
            };
        }
    }

    fn set_flash_on_click(&self, enabled: bool) {
        self.panel.lock().flash_on_click = enabled;
    }

    fn set_fake_load(&self, cpu_ms: u64, gpu_ms: u64) {
        tracing::debug!(cpu_ms, gpu_ms, "Simulated screen ignores fake load");
    }

    fn refresh_rate(&self) -> u32 {
        self.panel.lock().model.refresh_rate
    }

    fn connect_events(&self, events: Sender<ScreenEvent>) {
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(events);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut state = self.panel.lock();
        state.flicker = false;
        state.flash_on_click = false;
    }
}

struct Script {
    identify: Vec<u8>,
    stream: Vec<u8>,
    inbox: VecDeque<u8>,
    written: Vec<u8>,
    pending: Vec<u8>,
    unplugged: bool,
}

/// A [`Transport`] that answers commands from fixed scripts
///
/// Clones share the same line, so a test can keep one to inspect what the
/// host wrote or to unplug it.
#[derive(Clone)]
pub struct ScriptedTransport {
    description: String,
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    /// `identify` is queued every time the identify command arrives
    pub fn new(description: &str, identify: &str) -> Self {
        Self {
            description: description.to_string(),
            script: Arc::new(Mutex::new(Script {
                identify: identify.as_bytes().to_vec(),
                stream: Vec::new(),
                inbox: VecDeque::new(),
                written: Vec::new(),
                pending: Vec::new(),
                unplugged: false,
            })),
        }
    }

    /// Bytes queued every time the light sensor command arrives
    pub fn with_stream(self, bytes: &[u8]) -> Self {
        self.lock().stream = bytes.to_vec();
        self
    }

    /// Bytes already waiting on the line when the port is opened
    pub fn with_leftover(self, bytes: &[u8]) -> Self {
        self.lock().inbox.extend(bytes.iter().copied());
        self
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Everything the host has written so far
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    pub fn unplug(&self) {
        self.lock().unplugged = true;
    }
}

fn disconnected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "Device unplugged")
}

impl Read for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut script = self.lock();
        if script.unplugged {
            return Err(disconnected());
        }
        if script.inbox.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "No data"));
        }
        let n = buf.len().min(script.inbox.len());
        for (slot, byte) in buf.iter_mut().zip(script.inbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for ScriptedTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut script = self.lock();
        if script.unplugged {
            return Err(disconnected());
        }
        script.written.extend_from_slice(buf);
        script.pending.extend_from_slice(buf);
        while script.pending.len() >= 2 {
            let command = script.pending[0];
            script.pending.drain(..2);
            let reply = match command {
                COMMAND_ID => script.identify.clone(),
                COMMAND_LIGHT_SENSOR => script.stream.clone(),
                _ => Vec::new(),
            };
            script.inbox.extend(reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let script = self.lock();
        if script.unplugged {
            return Err(disconnected());
        }
        Ok(script.inbox.len())
    }

    fn is_open(&self) -> bool {
        !self.lock().unplugged
    }
}
