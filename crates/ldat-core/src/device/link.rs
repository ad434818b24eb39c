//! Connection to one instrument and its sampling worker
//!
//! [`DeviceLink`] owns the transport behind a mutex shared with at most one
//! sampling worker thread. The worker polls for a complete payload, decodes
//! it and hands the samples to a sink; the owning side stops it through an
//! atomic flag and waits for the thread to finish.

use super::identity::{model_from_description, DeviceIdentity};
use super::protocol::{
    command_frame, decode_button, decode_light, frame_bytes, samples_per_frame,
    COMMAND_ID, COMMAND_IDLE, COMMAND_LIGHT_SENSOR, INACTIVITY_WINDOW, NO_FLAGS,
};
use super::transport::{SerialTransport, Transport};
use super::{
    ButtonOptions, ButtonSink, DeviceError, LightSensor, MonitorOptions, MonitorSink,
    StreamError, StreamMode,
};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Worker sleep when no complete payload is available
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Upper bound on identify lines, in case a device never sends the blank line
const MAX_IDENTIFY_LINES: usize = 256;

type SharedTransport = Arc<Mutex<Option<Box<dyn Transport>>>>;

fn lock_transport(transport: &SharedTransport) -> MutexGuard<'_, Option<Box<dyn Transport>>> {
    transport.lock().unwrap_or_else(PoisonError::into_inner)
}

fn device_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "Device closed")
}

/// Where decoded samples go
enum Delivery {
    Monitor(Arc<dyn MonitorSink>),
    Button(Arc<dyn ButtonSink>),
}

impl Delivery {
    fn mode(&self) -> StreamMode {
        match self {
            Delivery::Monitor(_) => StreamMode::Monitor,
            Delivery::Button(_) => StreamMode::Button,
        }
    }

    fn deliver(&self, payload: &[u8], samples: usize) {
        match self {
            Delivery::Monitor(sink) => sink.on_samples(&decode_light(payload)),
            Delivery::Button(sink) => {
                let (light, click) = decode_button(payload, samples);
                sink.on_samples(&light, &click);
            }
        }
    }

    fn fail(&self, error: StreamError) {
        match self {
            Delivery::Monitor(sink) => sink.on_error(error),
            Delivery::Button(sink) => sink.on_error(error),
        }
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// An identified instrument
///
/// # Example
/// ```no_run
/// use ldat_core::device::link::DeviceLink;
///
/// let link = DeviceLink::open("/dev/ttyACM0", "OpenLDAT Model 1")?;
/// println!("firmware {}", link.identity().firmware_version);
/// # Ok::<(), ldat_core::DeviceError>(())
/// ```
pub struct DeviceLink {
    port_name: String,
    identity: DeviceIdentity,
    transport: SharedTransport,
    worker: Mutex<Option<Worker>>,
}

impl DeviceLink {
    /// Open a serial port and run the handshake
    ///
    /// The description is checked before the port is touched, so ports that
    /// belong to other devices are never opened.
    pub fn open(port_name: &str, description: &str) -> Result<Self, DeviceError> {
        let model = model_from_description(description)?;
        let transport = SerialTransport::open(port_name, description)?;
        Self::handshake(model, Box::new(transport))
    }

    /// Run the handshake over an already open transport
    pub fn connect(transport: Box<dyn Transport>) -> Result<Self, DeviceError> {
        let model = model_from_description(transport.description())?;
        Self::handshake(model, transport)
    }

    fn handshake(model: u8, mut transport: Box<dyn Transport>) -> Result<Self, DeviceError> {
        send_command(transport.as_mut(), COMMAND_IDLE, NO_FLAGS)?;
        wait_for_inactivity(transport.as_mut());
        send_command(transport.as_mut(), COMMAND_ID, NO_FLAGS)?;

        let mut lines = Vec::new();
        while lines.len() < MAX_IDENTIFY_LINES {
            let line = read_line(transport.as_mut());
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }
        tracing::debug!(lines = lines.len(), "Identify response received");

        let identity = DeviceIdentity::parse(model, transport.description(), &lines)?;
        tracing::info!(
            port = transport.name(),
            firmware = %identity.firmware_version,
            serial = %identity.serial_number,
            light_sensor = identity.light_sensor,
            "Device identified"
        );

        Ok(Self {
            port_name: transport.name().to_string(),
            identity,
            transport: Arc::new(Mutex::new(Some(transport))),
            worker: Mutex::new(None),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Model as advertised by the port
    pub fn model_description(&self) -> &str {
        &self.identity.model_description
    }

    pub fn is_open(&self) -> bool {
        lock_transport(&self.transport)
            .as_ref()
            .map(|t| t.is_open())
            .unwrap_or(false)
    }

    /// True while a sampling worker is running
    pub fn is_busy(&self) -> bool {
        self.lock_worker()
            .as_ref()
            .map(|w| !w.thread.is_finished())
            .unwrap_or(false)
    }

    /// End any activity and release the port
    pub fn close(&self) {
        if lock_transport(&self.transport).is_none() {
            return;
        }
        self.end_current_activity();
        lock_transport(&self.transport).take();
        tracing::info!(port = %self.port_name, "Device closed");
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, command: u8, flags: u8) -> Result<(), DeviceError> {
        let mut guard = lock_transport(&self.transport);
        let transport = guard.as_mut().ok_or_else(device_closed)?;
        send_command(transport.as_mut(), command, flags)
    }

    fn start_stream(
        &self,
        delivery: Delivery,
        flags: u8,
        unbuffered: bool,
    ) -> Result<(), DeviceError> {
        if !self.is_open() {
            return Err(device_closed().into());
        }
        self.end_current_activity();
        if !self.identity.light_sensor {
            return Err(DeviceError::MissingLightSensor);
        }

        let samples = samples_per_frame(
            delivery.mode(),
            unbuffered,
            self.identity.large_buffer.unwrap_or(1),
            self.identity.small_buffer.unwrap_or(1),
        );
        self.send(COMMAND_LIGHT_SENSOR, flags)?;

        let stop = Arc::new(AtomicBool::new(false));
        let transport = Arc::clone(&self.transport);
        let stop_clone = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("ldat-sampler".into())
            .spawn(move || sampling_loop(transport, stop_clone, delivery, samples))?;

        tracing::debug!(flags, samples, "Sampling worker started");
        *self.lock_worker() = Some(Worker { stop, thread });
        Ok(())
    }
}

impl LightSensor for DeviceLink {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn monitor_sample_rate(&self, unbuffered: bool, fast_adc: bool) -> Result<f64, DeviceError> {
        self.identity.sample_rate(StreamMode::Monitor, unbuffered, fast_adc)
    }

    fn button_sample_rate(&self, unbuffered: bool, fast_adc: bool) -> Result<f64, DeviceError> {
        self.identity.sample_rate(StreamMode::Button, unbuffered, fast_adc)
    }

    fn start_monitor(
        &self,
        options: MonitorOptions,
        sink: Arc<dyn MonitorSink>,
    ) -> Result<f64, DeviceError> {
        self.start_stream(Delivery::Monitor(sink), options.flags(), options.unbuffered)?;
        self.monitor_sample_rate(options.unbuffered, options.fast_adc)
    }

    fn start_button(
        &self,
        options: ButtonOptions,
        sink: Arc<dyn ButtonSink>,
    ) -> Result<f64, DeviceError> {
        self.start_stream(Delivery::Button(sink), options.flags(), options.unbuffered)?;
        self.button_sample_rate(options.unbuffered, options.fast_adc)
    }

    fn end_current_activity(&self) {
        if let Err(e) = self.send(COMMAND_IDLE, NO_FLAGS) {
            tracing::debug!(error = %e, "Idle command not sent");
        }

        let worker = self.lock_worker().take();
        if let Some(worker) = worker {
            worker.stop.store(true, Ordering::Release);
            while !worker.thread.is_finished() {
                thread::sleep(POLL_INTERVAL);
            }
            if worker.thread.join().is_err() {
                tracing::error!("Sampling worker panicked");
            } else {
                tracing::debug!("Sampling worker stopped");
            }
        }

        if let Some(transport) = lock_transport(&self.transport).as_mut() {
            wait_for_inactivity(transport.as_mut());
        }
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn send_command(transport: &mut dyn Transport, command: u8, flags: u8) -> Result<(), DeviceError> {
    transport.write_all(&command_frame(command, flags))?;
    transport.flush()?;
    Ok(())
}

/// Discard incoming bytes until the line has been silent for [`INACTIVITY_WINDOW`]
fn wait_for_inactivity(transport: &mut dyn Transport) {
    let mut scratch = [0u8; 256];
    let mut last_byte = Instant::now();
    while last_byte.elapsed() < INACTIVITY_WINDOW {
        match transport.bytes_available() {
            Ok(0) => thread::sleep(POLL_INTERVAL),
            Ok(n) => {
                let len = n.min(scratch.len());
                match transport.read(&mut scratch[..len]) {
                    Ok(_) => last_byte = Instant::now(),
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                    Err(_) => return,
                }
            }
            Err(_) => return,
        }
    }
}

/// Read one `\n`-terminated line; a timeout or error also ends the line
fn read_line(transport: &mut dyn Transport) -> String {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match transport.read(&mut byte) {
            Ok(1) if byte[0] != b'\n' => bytes.push(byte[0]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&bytes).trim().to_string()
}

fn sampling_loop(
    transport: SharedTransport,
    stop: Arc<AtomicBool>,
    delivery: Delivery,
    samples: usize,
) {
    let mut payload = vec![0u8; frame_bytes(delivery.mode(), samples)];
    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }

        let ready = {
            let mut guard = lock_transport(&transport);
            match guard.as_mut() {
                Some(t) if t.is_open() => match t.bytes_available() {
                    Ok(n) if n >= payload.len() => t
                        .read_exact(&mut payload)
                        .map(|()| true)
                        .map_err(|e| StreamError::Io(e.to_string())),
                    Ok(_) => Ok(false),
                    Err(e) => Err(StreamError::Io(e.to_string())),
                },
                _ => Err(StreamError::DeviceClosed),
            }
        };

        match ready {
            Ok(true) => delivery.deliver(&payload, samples),
            Ok(false) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                tracing::warn!(error = %e, "Sampling worker stopped by stream error");
                delivery.fail(e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::protocol::flags;
    use crate::sim::ScriptedTransport;

    const IDENTIFY: &str = "FW: 1.0\nLightSensor: 1\nLBuffer: 4\nSBuffer: 2\nMinAppVer: 1\n\n";

    #[derive(Default)]
    struct Collect {
        samples: Mutex<Vec<u32>>,
        clicks: Mutex<Vec<u32>>,
        errors: Mutex<Vec<StreamError>>,
    }

    impl MonitorSink for Collect {
        fn on_samples(&self, samples: &[u32]) {
            self.samples.lock().unwrap().extend_from_slice(samples);
        }
        fn on_error(&self, error: StreamError) {
            self.errors.lock().unwrap().push(error);
        }
    }

    impl ButtonSink for Collect {
        fn on_samples(&self, light: &[u32], click: &[u32]) {
            self.samples.lock().unwrap().extend_from_slice(light);
            self.clicks.lock().unwrap().extend_from_slice(click);
        }
        fn on_error(&self, error: StreamError) {
            self.errors.lock().unwrap().push(error);
        }
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_handshake_sends_idle_then_identify() {
        let port = ScriptedTransport::new("OpenLDAT Model 1", IDENTIFY);
        let link = DeviceLink::connect(Box::new(port.clone())).unwrap();
        assert_eq!(link.identity().large_buffer, Some(4));
        assert_eq!(&port.written()[..4], &[COMMAND_IDLE, 0, COMMAND_ID, 0]);
    }

    #[test]
    fn test_stale_stream_is_drained_before_identify() {
        // More than one read's worth of samples from an earlier session
        let port =
            ScriptedTransport::new("OpenLDAT Model 1", IDENTIFY).with_leftover(&[0x55; 1000]);
        let link = DeviceLink::connect(Box::new(port)).unwrap();
        assert_eq!(link.identity().firmware_version, "1.0");
        assert_eq!(link.identity().large_buffer, Some(4));
    }

    #[test]
    fn test_silent_device_fails_identification() {
        let port = ScriptedTransport::new("OpenLDAT Model 1", "");
        assert!(matches!(
            DeviceLink::connect(Box::new(port)),
            Err(DeviceError::IdentificationFailed)
        ));
    }

    #[test]
    fn test_foreign_port_is_rejected() {
        let port = ScriptedTransport::new("Arduino Uno", IDENTIFY);
        assert!(matches!(
            DeviceLink::connect(Box::new(port.clone())),
            Err(DeviceError::NotThisDevice(_))
        ));
        assert!(port.written().is_empty());
    }

    #[test]
    fn test_buffered_monitor_stream() {
        let port = ScriptedTransport::new("OpenLDAT Model 1", IDENTIFY)
            .with_stream(&[1, 0, 2, 0, 3, 0, 4, 0, 5, 0, 6, 0, 7, 0, 8, 0, 9, 0]);
        let link = DeviceLink::connect(Box::new(port.clone())).unwrap();
        let sink = Arc::new(Collect::default());
        let rate = link
            .start_monitor(
                MonitorOptions {
                    unbuffered: false,
                    sensitivity: 1,
                    fast_adc: false,
                },
                sink.clone(),
            )
            .unwrap();
        assert_eq!(rate, 8780.8);
        wait_for(|| sink.samples.lock().unwrap().len() >= 8);
        assert!(link.is_busy());
        link.end_current_activity();
        assert!(!link.is_busy());

        // Two full batches of four; the trailing partial batch is drained
        assert_eq!(*sink.samples.lock().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(sink.errors.lock().unwrap().is_empty());

        let written = port.written();
        let start = written
            .chunks(2)
            .find(|c| c[0] == COMMAND_LIGHT_SENSOR)
            .unwrap();
        assert_eq!(start[1], flags::MONITOR | flags::SENSITIVITY_LSB);
    }

    #[test]
    fn test_unbuffered_button_stream() {
        let port = ScriptedTransport::new("OpenLDAT Model 1", IDENTIFY)
            .with_stream(&[10, 0, 0, 20, 0, 1, 30, 0, 0]);
        let link = DeviceLink::connect(Box::new(port)).unwrap();
        let sink = Arc::new(Collect::default());
        let rate = link
            .start_button(
                ButtonOptions {
                    unbuffered: true,
                    ..ButtonOptions::default()
                },
                sink.clone(),
            )
            .unwrap();
        assert_eq!(rate, 7796.0);
        wait_for(|| sink.samples.lock().unwrap().len() >= 3);
        link.end_current_activity();
        assert_eq!(*sink.samples.lock().unwrap(), vec![10, 20, 30]);
        assert_eq!(*sink.clicks.lock().unwrap(), vec![0, 1, 0]);
    }

    #[test]
    fn test_unplug_reports_exactly_one_error() {
        let port = ScriptedTransport::new("OpenLDAT Model 1", IDENTIFY);
        let link = DeviceLink::connect(Box::new(port.clone())).unwrap();
        let sink = Arc::new(Collect::default());
        link.start_monitor(MonitorOptions::default(), sink.clone())
            .unwrap();
        port.unplug();
        wait_for(|| !link.is_busy());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(*sink.errors.lock().unwrap(), vec![StreamError::DeviceClosed]);
        assert!(!link.is_open());
    }

    #[test]
    fn test_start_after_close_fails() {
        let port = ScriptedTransport::new("OpenLDAT Model 1", IDENTIFY);
        let link = DeviceLink::connect(Box::new(port)).unwrap();
        link.close();
        let sink = Arc::new(Collect::default());
        assert!(matches!(
            link.start_monitor(MonitorOptions::default(), sink),
            Err(DeviceError::Io(_))
        ));
    }

    #[test]
    fn test_missing_light_sensor() {
        let port = ScriptedTransport::new("OpenLDAT Model 1", "FW: 1.0\nMinAppVer: 1\n\n");
        let link = DeviceLink::connect(Box::new(port)).unwrap();
        let sink = Arc::new(Collect::default());
        assert!(matches!(
            link.start_monitor(MonitorOptions::default(), sink),
            Err(DeviceError::MissingLightSensor)
        ));
        assert!(matches!(
            link.monitor_sample_rate(true, false),
            Err(DeviceError::MissingLightSensor)
        ));
    }
}
