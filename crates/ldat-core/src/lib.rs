//! LDAT Core - Instrument protocol, signal filters, and display timing measurements
//!
//! This library talks to an optical latency instrument over a serial link and
//! turns its light-intensity stream into display timing statistics: input lag,
//! pixel response time, overdrive overshoot, microstuttering and PWM flicker.
//!
//! With the `audio` feature the light stream can also be played through the
//! default sound output.

pub mod buffer;
pub mod calibration;
pub mod config;
pub mod device;
pub mod filter;
pub mod measurement;
pub mod sim;
#[cfg(feature = "audio")]
pub mod speaker;

pub use buffer::{constant::ConstantBuffer, ring::FixedRing, BufferError, SampleBuffer};
pub use config::LdatConfig;
pub use device::{link::DeviceLink, DeviceError, DeviceIdentity, LightSensor};
pub use filter::{
    peak_hold::PeakHoldFilter, smoothing::RunningAverageSmoothingFilter,
    spectrum::SpectrumFilter,
};
pub use measurement::{MeasurementError, Outcome};

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Highest value the instrument's 10-bit ADC can report
pub const ADC_MAX: u32 = 1023;

/// Number of discrete sensor gain levels (0..=3)
pub const SENSITIVITY_LEVELS: u8 = 4;

/// Most sensitive gain level; auto-sensitivity starts here and steps down
pub const MAX_SENSITIVITY: u8 = SENSITIVITY_LEVELS - 1;
