//! Wire protocol: command frames, stream flags, sample rates and payload framing
//!
//! Every command is two bytes, `[command, flags]`. The identify response is a
//! block of `key: value` lines closed by an empty line. Stream payloads are
//! little-endian 16-bit light samples, followed in button mode by one click
//! byte per sample.

use serde::Serialize;
use std::time::Duration;

/// Highest identify-protocol revision this driver understands
pub const DRIVER_VERSION: u32 = 1;

/// Ask the device to describe itself
pub const COMMAND_ID: u8 = 0x44;
/// Stop whatever the device is doing
pub const COMMAND_IDLE: u8 = 0x49;
/// Start light sensor streaming; the flags byte selects the mode
pub const COMMAND_LIGHT_SENSOR: u8 = 0x4C;

pub const NO_FLAGS: u8 = 0x00;

/// Feature bits carried in the flags byte of [`COMMAND_LIGHT_SENSOR`]
pub mod flags {
    pub const AUTOFIRE: u8 = 0b0000_0001;
    pub const NO_BUFFER: u8 = 0b0000_0010;
    pub const SENSITIVITY_LSB: u8 = 0b0000_0100;
    pub const MONITOR: u8 = 0b0000_1000;
    pub const NO_CLICK: u8 = 0b0001_0000;
    pub const FAST_ADC: u8 = 0b0010_0000;
    pub const SENSITIVITY_MSB: u8 = 0b0100_0000;
}

/// USB CDC ignores the line rate; any value opens the port
pub const BAUD_RATE: u32 = 115_200;

/// Read timeout used for every port read
pub const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Silence required before the line is considered drained
pub const INACTIVITY_WINDOW: Duration = Duration::from_millis(100);

/// Build a two-byte command frame
pub fn command_frame(command: u8, flags: u8) -> [u8; 2] {
    [command, flags]
}

/// Map a sensitivity level (0..=3) to its two flag bits
pub fn sensitivity_bits(sensitivity: u8) -> u8 {
    let mut bits = 0;
    if sensitivity & 0b01 != 0 {
        bits |= flags::SENSITIVITY_LSB;
    }
    if sensitivity & 0b10 != 0 {
        bits |= flags::SENSITIVITY_MSB;
    }
    bits
}

/// Streaming mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Light samples only
    Monitor,
    /// Light samples plus a click bit per sample
    Button,
}

/// Options for monitor-mode streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonitorOptions {
    /// Deliver every sample as it arrives instead of in device-sized batches
    pub unbuffered: bool,
    /// Sensor gain level, 0..=3
    pub sensitivity: u8,
    pub fast_adc: bool,
}

impl MonitorOptions {
    pub fn flags(&self) -> u8 {
        let mut f = flags::MONITOR | sensitivity_bits(self.sensitivity);
        if self.unbuffered {
            f |= flags::NO_BUFFER;
        }
        if self.fast_adc {
            f |= flags::FAST_ADC;
        }
        f
    }
}

/// Options for button-mode streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ButtonOptions {
    pub unbuffered: bool,
    pub sensitivity: u8,
    pub fast_adc: bool,
    /// Sample the button without forwarding the click to the host
    pub no_click: bool,
    /// Let the device generate clicks on its own
    pub auto_fire: bool,
}

impl ButtonOptions {
    pub fn flags(&self) -> u8 {
        let mut f = sensitivity_bits(self.sensitivity);
        if self.unbuffered {
            f |= flags::NO_BUFFER;
        }
        if self.fast_adc {
            f |= flags::FAST_ADC;
        }
        if self.no_click {
            f |= flags::NO_CLICK;
        }
        if self.auto_fire {
            f |= flags::AUTOFIRE;
        }
        f
    }
}

/// Measured sample rate in Hz for a streaming configuration
pub fn sample_rate(mode: StreamMode, unbuffered: bool, fast_adc: bool) -> f64 {
    match (mode, unbuffered, fast_adc) {
        (StreamMode::Monitor, true, false) => 7798.0,
        (StreamMode::Monitor, true, true) => 21000.0,
        (StreamMode::Monitor, false, false) => 8780.8,
        (StreamMode::Monitor, false, true) => 29574.4,
        (StreamMode::Button, true, false) => 7796.0,
        (StreamMode::Button, true, true) => 20710.0,
        (StreamMode::Button, false, false) => 8738.1,
        (StreamMode::Button, false, true) => 28896.0,
    }
}

/// Number of samples carried by one payload read
///
/// Unbuffered reads carry one sample. Buffered reads carry the device-declared
/// large (monitor) or small (button) buffer size.
pub fn samples_per_frame(
    mode: StreamMode,
    unbuffered: bool,
    large_buffer: usize,
    small_buffer: usize,
) -> usize {
    match (unbuffered, mode) {
        (true, _) => 1,
        (false, StreamMode::Monitor) => large_buffer,
        (false, StreamMode::Button) => small_buffer,
    }
}

/// Bytes per payload read for `samples` samples
pub fn frame_bytes(mode: StreamMode, samples: usize) -> usize {
    match mode {
        StreamMode::Monitor => samples * 2,
        StreamMode::Button => samples * 3,
    }
}

/// Decode little-endian 16-bit light samples
pub fn decode_light(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(2)
        .map(|b| u32::from(u16::from_le_bytes([b[0], b[1]])))
        .collect()
}

/// Decode a button-mode payload of `samples` ticks
///
/// Unbuffered ticks are interleaved (`light_lo, light_hi, click`); buffered
/// payloads carry all light samples first and then all click bytes. Both are
/// handled by this function since a single unbuffered tick is laid out the
/// same way as a buffered payload of one sample.
pub fn decode_button(bytes: &[u8], samples: usize) -> (Vec<u32>, Vec<u32>) {
    let split = (samples * 2).min(bytes.len());
    let (light, click) = bytes.split_at(split);
    let light = decode_light(light);
    let click = click.iter().take(samples).map(|&c| u32::from(c)).collect();
    (light, click)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_flags() {
        let opts = MonitorOptions {
            unbuffered: true,
            sensitivity: 3,
            fast_adc: true,
        };
        assert_eq!(opts.flags(), 0x08 | 0x02 | 0x04 | 0x40 | 0x20);

        let opts = MonitorOptions {
            unbuffered: false,
            sensitivity: 1,
            fast_adc: false,
        };
        assert_eq!(opts.flags(), 0x08 | 0x04);
    }

    #[test]
    fn test_button_flags() {
        let opts = ButtonOptions {
            unbuffered: false,
            sensitivity: 2,
            fast_adc: true,
            no_click: false,
            auto_fire: true,
        };
        assert_eq!(opts.flags(), 0x40 | 0x20 | 0x01);
        assert_eq!(opts.flags() & flags::MONITOR, 0);

        let opts = ButtonOptions {
            no_click: true,
            ..ButtonOptions::default()
        };
        assert_eq!(opts.flags(), 0x10);
    }

    #[test]
    fn test_sample_rate_table() {
        assert_eq!(sample_rate(StreamMode::Monitor, true, false), 7798.0);
        assert_eq!(sample_rate(StreamMode::Monitor, false, true), 29574.4);
        assert_eq!(sample_rate(StreamMode::Button, true, true), 20710.0);
        assert_eq!(sample_rate(StreamMode::Button, false, false), 8738.1);
    }

    #[test]
    fn test_framing_sizes() {
        assert_eq!(samples_per_frame(StreamMode::Monitor, true, 64, 16), 1);
        assert_eq!(samples_per_frame(StreamMode::Monitor, false, 64, 16), 64);
        assert_eq!(samples_per_frame(StreamMode::Button, false, 64, 16), 16);
        assert_eq!(frame_bytes(StreamMode::Monitor, 64), 128);
        assert_eq!(frame_bytes(StreamMode::Button, 16), 48);
        assert_eq!(frame_bytes(StreamMode::Button, 1), 3);
    }

    #[test]
    fn test_decode_light_little_endian() {
        assert_eq!(decode_light(&[0xFF, 0x03, 0x01, 0x00]), vec![1023, 1]);
    }

    #[test]
    fn test_decode_button_unbuffered_tick() {
        let (light, click) = decode_button(&[0x10, 0x02, 0x01], 1);
        assert_eq!(light, vec![0x210]);
        assert_eq!(click, vec![1]);
    }

    #[test]
    fn test_decode_button_buffered_block() {
        let bytes = [0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0, 1, 0];
        let (light, click) = decode_button(&bytes, 3);
        assert_eq!(light, vec![1, 2, 3]);
        assert_eq!(click, vec![0, 1, 0]);
    }
}
