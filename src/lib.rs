//! LDAT - Display latency and timing analysis
//!
//! This library re-exports the instrument protocol, signal filters and
//! measurements from `ldat-core` and adds the terminal test screen used by
//! the `ldat` binary.

pub mod console;

pub use ldat_core::{buffer, calibration, config, device, filter, measurement, sim};

#[cfg(feature = "audio")]
pub use ldat_core::speaker;

pub use ldat_core::{DeviceLink, LdatConfig, LightSensor, MeasurementError, Outcome};
pub use ldat_core::{ADC_MAX, BUILD_DATE, MAX_SENSITIVITY, VERSION};
