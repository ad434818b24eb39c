//! Seam to the test pattern renderer

use crossbeam_channel::Sender;
use std::time::Duration;

/// Inbound notifications from the test screen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenEvent {
    /// User confirmed the sensor is in place
    EnterPressed,
    /// User asked to abort
    Cancel,
    /// Renderer failed
    Error(String),
}

/// Full-screen pattern renderer driven by the measurements
///
/// Colours are linear fractions in `[0, 1]`. Implementations use interior
/// mutability; the measurement thread calls in while the renderer runs on its
/// own thread.
pub trait TestScreen: Send + Sync {
    /// Fill the screen; returns false if the colour was already shown
    fn set_color(&self, r: f32, g: f32, b: f32) -> bool;

    /// Show the sensor placement target at a relative position
    fn set_target(&self, x: f32, y: f32, size: f32, black: bool);

    fn hide_target(&self);

    /// Show a colour for a limited time, then return to the previous one
    fn flash_color(&self, r: f32, g: f32, b: f32, duration: Duration);

    /// Alternate black and white every frame
    fn set_flicker(&self, enabled: bool);

    /// Flash white whenever a click reaches the host
    fn set_flash_on_click(&self, enabled: bool);

    /// Artificial per-frame load, to emulate a busy game
    fn set_fake_load(&self, cpu_ms: u64, gpu_ms: u64);

    fn refresh_rate(&self) -> u32;

    /// Register the channel on which [`ScreenEvent`]s are delivered
    fn connect_events(&self, events: Sender<ScreenEvent>);

    fn close(&self);
}

/// Fill the screen with an 8-bit grey level
pub fn set_grey(screen: &dyn TestScreen, level: u8) -> bool {
    let l = f32::from(level) / 255.0;
    screen.set_color(l, l, l)
}
