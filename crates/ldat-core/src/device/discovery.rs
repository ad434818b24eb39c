//! Finding instruments among the system's serial ports

use super::identity::is_instrument_description;
use super::link::DeviceLink;
use super::DeviceError;
use serde::Serialize;
use serialport::SerialPortType;

/// A serial port that looks like an instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortCandidate {
    pub name: String,
    /// USB product string
    pub description: String,
}

/// True for instrument ports, excluding the macOS `dial-in` duplicates
pub fn is_candidate(description: &str) -> bool {
    is_instrument_description(description) && !description.to_lowercase().contains("dial-in")
}

/// List serial ports whose description identifies an instrument
pub fn list_ports() -> Result<Vec<PortCandidate>, DeviceError> {
    let ports = serialport::available_ports()
        .map_err(|e| DeviceError::ConnectFailed(format!("port enumeration failed: {}", e)))?;

    let candidates: Vec<PortCandidate> = ports
        .into_iter()
        .filter_map(|info| {
            let description = match info.port_type {
                SerialPortType::UsbPort(usb) => usb.product?,
                _ => return None,
            };
            is_candidate(&description).then_some(PortCandidate {
                name: info.port_name,
                description,
            })
        })
        .collect();

    tracing::debug!(count = candidates.len(), "Instrument ports found");
    Ok(candidates)
}

/// USB product string of a named port among the listed instruments
///
/// A port that is not listed is refused, since its model cannot be checked.
pub fn description_for(port: &str, candidates: &[PortCandidate]) -> Result<String, DeviceError> {
    candidates
        .iter()
        .find(|c| c.name == port)
        .map(|c| c.description.clone())
        .ok_or_else(|| DeviceError::NotThisDevice(port.to_string()))
}

/// Connect to a named port, checking its description first
pub fn open_port(port: &str) -> Result<DeviceLink, DeviceError> {
    let description = description_for(port, &list_ports()?)?;
    DeviceLink::open(port, &description)
}

/// Connect to the first port that completes the handshake
///
/// Ports that fail are logged and skipped. Returns `None` when no instrument
/// could be opened.
pub fn open_first() -> Result<Option<DeviceLink>, DeviceError> {
    for candidate in list_ports()? {
        match DeviceLink::open(&candidate.name, &candidate.description) {
            Ok(link) => return Ok(Some(link)),
            Err(e) => {
                tracing::warn!(port = %candidate.name, error = %e, "Skipping port");
            }
        }
    }
    Ok(None)
}
