//! Device identification
//!
//! The port description decides whether a port is an instrument at all and
//! which model it is. The identify response then fills in the rest.

use super::protocol::{self, StreamMode, DRIVER_VERSION};
use super::DeviceError;
use serde::Serialize;

/// Serial number reported for hand-built units that do not carry one
pub const DEFAULT_SERIAL: &str = "DIY";

const DESCRIPTION_PREFIX: &str = "openldat ";
const MODEL_1_DESCRIPTIONS: [&str; 2] = ["openldat model 1", "openldat prototype"];

/// True if a port description belongs to an instrument of any model
pub fn is_instrument_description(description: &str) -> bool {
    description.trim().to_lowercase().starts_with(DESCRIPTION_PREFIX)
}

/// Resolve a port description to a supported model code
pub fn model_from_description(description: &str) -> Result<u8, DeviceError> {
    let name = description.trim().to_lowercase();
    if !name.starts_with(DESCRIPTION_PREFIX) {
        return Err(DeviceError::NotThisDevice(description.to_string()));
    }
    if MODEL_1_DESCRIPTIONS.contains(&name.as_str()) {
        Ok(1)
    } else {
        Err(DeviceError::UnsupportedModel(description.to_string()))
    }
}

/// Everything the instrument reports about itself
///
/// Immutable once the handshake completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub model: u8,
    /// Port description as advertised by the USB stack
    pub model_description: String,
    pub firmware_version: String,
    pub serial_number: String,
    pub prototype: bool,
    pub oscilloscope_debug: bool,
    pub light_sensor: bool,
    /// Samples per monitor-mode batch
    pub large_buffer: Option<usize>,
    /// Samples per button-mode batch
    pub small_buffer: Option<usize>,
    pub min_driver_version: u32,
}

impl DeviceIdentity {
    /// Build an identity from the lines of an identify response
    ///
    /// Parsing stops at the first empty line. Lines without a `:` are
    /// skipped, unknown keys are logged and ignored. Only recognised keys
    /// count toward the "at least one property" requirement.
    ///
    /// # Errors
    /// * [`DeviceError::FirmwareDebugBuildConflict`] as soon as `SerialDebug: 1` is seen
    /// * [`DeviceError::IdentificationFailed`] if no property was recognised or a number is
    ///   malformed
    /// * [`DeviceError::FirmwareTooOld`] if `MinAppVer` is missing or above [`DRIVER_VERSION`]
    /// * [`DeviceError::FirmwareVersionUnknown`] if `FW` is missing
    /// * [`DeviceError::MissingBufferSizes`] if a light sensor is present without both buffer sizes
    pub fn parse<I, S>(model: u8, model_description: &str, lines: I) -> Result<Self, DeviceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut recognised = 0usize;
        let mut firmware_version = None;
        let mut serial_number = None;
        let mut min_driver_version = None;
        let mut large_buffer = None;
        let mut small_buffer = None;
        let mut prototype = false;
        let mut oscilloscope_debug = false;
        let mut light_sensor = false;

        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() {
                break;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "FW" => firmware_version = Some(value.to_string()),
                "LightSensor" => light_sensor = value == "1",
                "LBuffer" => large_buffer = Some(parse_number(key, value)?),
                "SBuffer" => small_buffer = Some(parse_number(key, value)?),
                "OscilloscopeDebug" => oscilloscope_debug = value == "1",
                "Prototype" => prototype = value == "1",
                "MinAppVer" => min_driver_version = Some(parse_number(key, value)?),
                "SerialNo" => serial_number = Some(value.to_string()),
                "SerialDebug" => {
                    if value == "1" {
                        return Err(DeviceError::FirmwareDebugBuildConflict);
                    }
                    continue;
                }
                _ => {
                    tracing::warn!(property = key, value, "Unknown device property ignored");
                    continue;
                }
            }
            recognised += 1;
        }

        if recognised == 0 {
            return Err(DeviceError::IdentificationFailed);
        }
        let min_driver_version = match min_driver_version {
            Some(v) if v <= DRIVER_VERSION as usize => v as u32,
            other => {
                return Err(DeviceError::FirmwareTooOld {
                    required: other,
                    supported: DRIVER_VERSION,
                })
            }
        };
        let firmware_version = firmware_version.ok_or(DeviceError::FirmwareVersionUnknown)?;
        let large_buffer = large_buffer.filter(|&n| n > 0);
        let small_buffer = small_buffer.filter(|&n| n > 0);
        if light_sensor && (large_buffer.is_none() || small_buffer.is_none()) {
            return Err(DeviceError::MissingBufferSizes);
        }

        Ok(Self {
            model,
            model_description: model_description.to_string(),
            firmware_version,
            serial_number: serial_number.unwrap_or_else(|| DEFAULT_SERIAL.to_string()),
            prototype,
            oscilloscope_debug,
            light_sensor,
            large_buffer,
            small_buffer,
            min_driver_version,
        })
    }

    /// Sample rate in Hz of a streaming configuration on this unit
    pub fn sample_rate(
        &self,
        mode: StreamMode,
        unbuffered: bool,
        fast_adc: bool,
    ) -> Result<f64, DeviceError> {
        if !self.light_sensor {
            return Err(DeviceError::MissingLightSensor);
        }
        Ok(protocol::sample_rate(mode, unbuffered, fast_adc))
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize, DeviceError> {
    value.parse().map_err(|_| {
        tracing::warn!(property = key, value, "Malformed numeric device property");
        DeviceError::IdentificationFailed
    })
}
