//! Instrument connection, identification and streaming
//!
//! - [`protocol`]: command bytes, flags, sample rates, payload framing
//! - [`identity`]: model detection and identify-response parsing
//! - [`transport`]: the byte-link seam and its serial port implementation
//! - [`link`]: [`link::DeviceLink`], handshake plus the sampling worker
//! - [`discovery`]: finding instruments among the system's serial ports

pub mod discovery;
pub mod identity;
pub mod link;
pub mod protocol;
pub mod transport;

pub use identity::DeviceIdentity;
pub use protocol::{ButtonOptions, MonitorOptions, StreamMode};

use std::sync::Arc;
use thiserror::Error;

/// Errors raised while connecting to or driving the instrument
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Failed to connect to device: {0}")]
    ConnectFailed(String),

    #[error("Unsupported device model: {0}")]
    UnsupportedModel(String),

    #[error("Not an OpenLDAT device: {0}")]
    NotThisDevice(String),

    #[error("Device identification failed")]
    IdentificationFailed,

    #[error("Firmware was built with serial debugging enabled and cannot be driven")]
    FirmwareDebugBuildConflict,

    #[error("Firmware needs a newer driver (requires {required:?}, supported {supported})")]
    FirmwareTooOld {
        required: Option<usize>,
        supported: u32,
    },

    #[error("Firmware version unknown")]
    FirmwareVersionUnknown,

    #[error("Firmware declares a light sensor but no buffer sizes")]
    MissingBufferSizes,

    #[error("Device has no light sensor")]
    MissingLightSensor,

    #[error("Device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that end a streaming session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Device closed")]
    DeviceClosed,

    #[error("Serial read failed: {0}")]
    Io(String),
}

/// Receives monitor-mode samples from the sampling worker
pub trait MonitorSink: Send + Sync {
    /// One sample (unbuffered) or one device batch (buffered)
    fn on_samples(&self, samples: &[u32]);

    /// Called at most once, after which the worker exits
    fn on_error(&self, error: StreamError);
}

/// Receives button-mode samples from the sampling worker
pub trait ButtonSink: Send + Sync {
    /// Parallel light and click runs of equal length
    fn on_samples(&self, light: &[u32], click: &[u32]);

    /// Called at most once, after which the worker exits
    fn on_error(&self, error: StreamError);
}

/// A light-sensing instrument that measurements can drive
///
/// At most one streaming session is active at a time; starting a new one ends
/// the previous one first.
pub trait LightSensor: Send + Sync {
    fn identity(&self) -> &DeviceIdentity;

    /// Sample rate in Hz of monitor-mode streaming
    fn monitor_sample_rate(&self, unbuffered: bool, fast_adc: bool) -> Result<f64, DeviceError>;

    /// Sample rate in Hz of button-mode streaming
    fn button_sample_rate(&self, unbuffered: bool, fast_adc: bool) -> Result<f64, DeviceError>;

    /// Start monitor-mode streaming into `sink`, returning the sample rate
    fn start_monitor(
        &self,
        options: MonitorOptions,
        sink: Arc<dyn MonitorSink>,
    ) -> Result<f64, DeviceError>;

    /// Start button-mode streaming into `sink`, returning the sample rate
    fn start_button(
        &self,
        options: ButtonOptions,
        sink: Arc<dyn ButtonSink>,
    ) -> Result<f64, DeviceError>;

    /// Stop streaming and wait until the worker has exited and the line is quiet
    fn end_current_activity(&self);
}
