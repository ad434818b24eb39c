//! E2E tests for instrument identification
//!
//! Drives the full connect handshake over a scripted serial line and checks
//! how identify responses are accepted or rejected.

use ldat::device::protocol::{
    sample_rate, ButtonOptions, MonitorOptions, StreamMode, COMMAND_ID, COMMAND_IDLE,
};
use ldat::device::{DeviceError, DeviceIdentity};
use ldat::measurement::pwm::PwmTest;
use ldat::measurement::run_to_completion;
use ldat::sim::{PanelModel, ScriptedTransport, SimPanel, SimulatedScreen};
use ldat::{DeviceLink, LightSensor, MeasurementError, Outcome};
use std::sync::Arc;

const MODEL_1: &str = "OpenLDAT Model 1";

fn connect(identify: &str) -> Result<DeviceLink, DeviceError> {
    DeviceLink::connect(Box::new(ScriptedTransport::new(MODEL_1, identify)))
}

// ============================================================================
// Accepted identities
// ============================================================================

#[test]
fn test_full_identity() {
    let link = connect(
        "FW: 2.1\nSerialNo: 0042\nLightSensor: 1\nLBuffer: 64\nSBuffer: 32\n\
         OscilloscopeDebug: 1\nMinAppVer: 1\n\n",
    )
    .unwrap();
    let id = link.identity();
    assert_eq!(id.model, 1);
    assert_eq!(id.model_description, MODEL_1);
    assert_eq!(id.firmware_version, "2.1");
    assert_eq!(id.serial_number, "0042");
    assert!(id.light_sensor);
    assert!(id.oscilloscope_debug);
    assert!(!id.prototype);
    assert_eq!(id.large_buffer, Some(64));
    assert_eq!(id.small_buffer, Some(32));
    assert!(link.is_open());
    assert!(!link.is_busy());
}

#[test]
fn test_unknown_keys_and_junk_lines_are_ignored() {
    let link = connect(
        "FW: 1.0\nColour: teal\nnot a property\nLightSensor: 1\nLBuffer: 4\nSBuffer: 2\n\
         MinAppVer: 1\n\nPrototype: 1\n",
    )
    .unwrap();
    // Anything after the blank line is not part of the response
    assert!(!link.identity().prototype);
    assert_eq!(link.identity().serial_number, "DIY");
}

#[test]
fn test_prototype_description_is_model_1() {
    let port = ScriptedTransport::new(
        "OpenLDAT Prototype",
        "FW: 0.9\nPrototype: 1\nMinAppVer: 1\n\n",
    );
    let link = DeviceLink::connect(Box::new(port)).unwrap();
    assert_eq!(link.identity().model, 1);
    assert!(link.identity().prototype);
    assert!(!link.identity().light_sensor);
}

#[test]
fn test_handshake_idles_line_first() {
    let port = ScriptedTransport::new(MODEL_1, "FW: 1.0\nMinAppVer: 1\n\n");
    let _link = DeviceLink::connect(Box::new(port.clone())).unwrap();
    let written = port.written();
    assert_eq!(&written[..4], &[COMMAND_IDLE, 0x00, COMMAND_ID, 0x00]);
}

// ============================================================================
// Rejected identities
// ============================================================================

#[test]
fn test_serial_debug_build_is_refused() {
    assert!(matches!(
        connect(
            "FW: 1.0\nSerialDebug: 1\nLightSensor: 1\nLBuffer: 4\nSBuffer: 2\nMinAppVer: 1\n\n"
        ),
        Err(DeviceError::FirmwareDebugBuildConflict)
    ));
    // A cleared debug flag is fine
    assert!(connect("FW: 1.0\nSerialDebug: 0\nMinAppVer: 1\n\n").is_ok());
}

#[test]
fn test_no_recognised_property() {
    assert!(matches!(
        connect("SerialDebug: 0\nColour: teal\n\n"),
        Err(DeviceError::IdentificationFailed)
    ));
    assert!(matches!(connect(""), Err(DeviceError::IdentificationFailed)));
}

#[test]
fn test_malformed_number() {
    assert!(matches!(
        connect("FW: 1.0\nLBuffer: lots\nMinAppVer: 1\n\n"),
        Err(DeviceError::IdentificationFailed)
    ));
}

#[test]
fn test_driver_too_old_for_firmware() {
    assert!(matches!(
        connect("FW: 3.0\nMinAppVer: 7\n\n"),
        Err(DeviceError::FirmwareTooOld { required: Some(7), .. })
    ));
    assert!(matches!(
        connect("FW: 3.0\n\n"),
        Err(DeviceError::FirmwareTooOld { required: None, .. })
    ));
}

#[test]
fn test_missing_firmware_version() {
    assert!(matches!(
        connect("MinAppVer: 1\n\n"),
        Err(DeviceError::FirmwareVersionUnknown)
    ));
}

#[test]
fn test_light_sensor_needs_buffer_sizes() {
    assert!(matches!(
        connect("FW: 1.0\nLightSensor: 1\nLBuffer: 4\nMinAppVer: 1\n\n"),
        Err(DeviceError::MissingBufferSizes)
    ));
    assert!(matches!(
        connect("FW: 1.0\nLightSensor: 1\nLBuffer: 4\nSBuffer: 0\nMinAppVer: 1\n\n"),
        Err(DeviceError::MissingBufferSizes)
    ));
}

#[test]
fn test_port_descriptions() {
    let unsupported = ScriptedTransport::new("OpenLDAT Model 2", "FW: 1.0\nMinAppVer: 1\n\n");
    assert!(matches!(
        DeviceLink::connect(Box::new(unsupported.clone())),
        Err(DeviceError::UnsupportedModel(_))
    ));
    assert!(unsupported.written().is_empty());

    let foreign = ScriptedTransport::new("USB Serial Device", "FW: 1.0\nMinAppVer: 1\n\n");
    assert!(matches!(
        DeviceLink::connect(Box::new(foreign)),
        Err(DeviceError::NotThisDevice(_))
    ));
}

#[test]
fn test_identity_parse_directly() {
    let id = DeviceIdentity::parse(1, MODEL_1, ["FW: 1.0", "MinAppVer: 1"]).unwrap();
    assert_eq!(id.min_driver_version, 1);
    assert!(!id.light_sensor);
}

// ============================================================================
// Devices without a light sensor
// ============================================================================

#[test]
fn test_streaming_needs_light_sensor() {
    let link = connect("FW: 1.0\nMinAppVer: 1\n\n").unwrap();
    assert!(matches!(
        link.monitor_sample_rate(true, true),
        Err(DeviceError::MissingLightSensor)
    ));
    assert!(matches!(
        link.button_sample_rate(false, false),
        Err(DeviceError::MissingLightSensor)
    ));
}

#[test]
fn test_measurement_refuses_device_without_light_sensor() {
    let link: Arc<dyn LightSensor> = Arc::new(connect("FW: 1.0\nMinAppVer: 1\n\n").unwrap());
    let screen = Arc::new(SimulatedScreen::new(SimPanel::new(PanelModel::default())));
    let outcome = run_to_completion(
        PwmTest::new(Default::default()),
        link,
        screen.clone(),
        Default::default(),
    );
    assert!(matches!(
        outcome,
        Outcome::Failed(MeasurementError::IncompatibleDevice(_))
    ));
    assert!(screen.is_closed());
}

// ============================================================================
// Rate table
// ============================================================================

#[test]
fn test_sample_rates_with_light_sensor() {
    let link =
        connect("FW: 1.0\nLightSensor: 1\nLBuffer: 4\nSBuffer: 2\nMinAppVer: 1\n\n").unwrap();
    assert_eq!(link.monitor_sample_rate(true, false).unwrap(), 7798.0);
    assert_eq!(link.monitor_sample_rate(false, true).unwrap(), 29574.4);
    assert_eq!(link.button_sample_rate(true, true).unwrap(), 20710.0);
    assert_eq!(
        link.button_sample_rate(false, false).unwrap(),
        sample_rate(StreamMode::Button, false, false)
    );

    // Flags carry the two sensitivity bits
    let monitor = MonitorOptions {
        unbuffered: false,
        sensitivity: 2,
        fast_adc: false,
    };
    assert_eq!(monitor.flags(), 0x08 | 0x40);
    let button = ButtonOptions {
        no_click: true,
        auto_fire: true,
        ..ButtonOptions::default()
    };
    assert_eq!(button.flags(), 0x10 | 0x01);
}
