//! Terminal stand-in for the test screen
//!
//! Without a renderer the operator shows the requested colours by hand (or
//! runs against the simulator); this screen prints every request and turns
//! lines typed on stdin into screen events: an empty line confirms, `q`
//! aborts.

use crossbeam_channel::Sender;
use ldat_core::measurement::screen::{ScreenEvent, TestScreen};
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Prints test screen requests to a writer
pub struct ConsoleScreen {
    out: Mutex<Box<dyn Write + Send>>,
    color: Mutex<(f32, f32, f32)>,
    events: Mutex<Option<Sender<ScreenEvent>>>,
    refresh_rate: u32,
    closed: AtomicBool,
}

impl ConsoleScreen {
    /// Screen that prints to stdout
    pub fn stdout(refresh_rate: u32) -> Self {
        Self::with_writer(refresh_rate, Box::new(io::stdout()))
    }

    pub fn with_writer(refresh_rate: u32, out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            color: Mutex::new((0.0, 0.0, 0.0)),
            events: Mutex::new(None),
            refresh_rate,
            closed: AtomicBool::new(false),
        }
    }

    fn say(&self, msg: &str) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{}", msg).and_then(|_| out.flush()) {
            tracing::warn!(error = %e, "Console output failed");
        }
    }

    /// Forward an event to the running measurement
    pub fn send(&self, event: ScreenEvent) {
        if let Some(tx) = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            if let Err(e) = tx.send(event) {
                tracing::debug!(event = ?e.into_inner(), "No measurement listening to console");
            }
        }
    }

    /// Translate one typed line; returns false once input should stop
    pub fn handle_line(&self, line: &str) -> bool {
        match line.trim() {
            "" => self.send(ScreenEvent::EnterPressed),
            "q" | "quit" => {
                self.send(ScreenEvent::Cancel);
                return false;
            }
            other => self.say(&format!(
                "Unrecognised input '{}' (Enter continues, q aborts)",
                other
            )),
        }
        true
    }

    /// Feed stdin lines to the screen from a background thread
    ///
    /// The thread ends at end of input or after `q`.
    pub fn spawn_stdin_reader(self: &std::sync::Arc<Self>) -> io::Result<()> {
        let screen = std::sync::Arc::clone(self);
        std::thread::Builder::new()
            .name("ldat-console".into())
            .spawn(move || {
                for line in io::stdin().lock().lines() {
                    match line {
                        Ok(line) if screen.handle_line(&line) => {}
                        Ok(_) => break,
                        Err(e) => {
                            screen.send(ScreenEvent::Error(e.to_string()));
                            break;
                        }
                    }
                }
            })?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn describe(r: f32, g: f32, b: f32) -> String {
    if r == g && g == b {
        format!("grey {:.0}/255", r * 255.0)
    } else {
        format!("rgb({:.2}, {:.2}, {:.2})", r, g, b)
    }
}

impl TestScreen for ConsoleScreen {
    fn set_color(&self, r: f32, g: f32, b: f32) -> bool {
        let mut color = self.color.lock().unwrap_or_else(PoisonError::into_inner);
        if *color == (r, g, b) {
            return false;
        }
        *color = (r, g, b);
        drop(color);
        self.say(&format!("Screen: {}", describe(r, g, b)));
        true
    }

    fn set_target(&self, _x: f32, _y: f32, _size: f32, black: bool) {
        let target = if black { "black" } else { "white" };
        self.say(&format!(
            "Place the sensor on the {} target and press Enter (q to abort)",
            target
        ));
    }

    fn hide_target(&self) {}

    fn flash_color(&self, r: f32, g: f32, b: f32, duration: Duration) {
        self.say(&format!(
            "Screen: flash {} for {} ms",
            describe(r, g, b),
            duration.as_millis()
        ));
    }

    fn set_flicker(&self, enabled: bool) {
        self.say(&format!(
            "Screen: flicker {}",
            if enabled { "on" } else { "off" }
        ));
    }

    fn set_flash_on_click(&self, enabled: bool) {
        self.say(&format!(
            "Screen: flash on click {}",
            if enabled { "on" } else { "off" }
        ));
    }

    fn set_fake_load(&self, cpu_ms: u64, gpu_ms: u64) {
        if cpu_ms > 0 || gpu_ms > 0 {
            self.say(&format!("Screen: fake load cpu {} ms, gpu {} ms", cpu_ms, gpu_ms));
        }
    }

    fn refresh_rate(&self) -> u32 {
        self.refresh_rate
    }

    fn connect_events(&self, events: Sender<ScreenEvent>) {
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(events);
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.say("Screen: closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_color_changes_are_reported_once() {
        let out = Captured::default();
        let screen = ConsoleScreen::with_writer(60, Box::new(out.clone()));
        assert!(screen.set_color(1.0, 1.0, 1.0));
        assert!(!screen.set_color(1.0, 1.0, 1.0));
        assert_eq!(out.text().matches("grey 255/255").count(), 1);
    }

    #[test]
    fn test_lines_become_events() {
        let screen = ConsoleScreen::with_writer(60, Box::new(Captured::default()));
        let (tx, rx) = crossbeam_channel::unbounded();
        screen.connect_events(tx);

        assert!(screen.handle_line(""));
        assert!(screen.handle_line("what"));
        assert!(!screen.handle_line("q"));
        let events: Vec<ScreenEvent> = rx.try_iter().collect();
        assert_eq!(events, vec![ScreenEvent::EnterPressed, ScreenEvent::Cancel]);
    }

    #[test]
    fn test_events_after_measurement_ended() {
        let screen = ConsoleScreen::with_writer(60, Box::new(Captured::default()));
        // Before any measurement connects
        assert!(screen.handle_line(""));
        let (tx, rx) = crossbeam_channel::unbounded();
        screen.connect_events(tx);
        drop(rx);
        assert!(screen.handle_line(""));
        assert!(!screen.handle_line("q"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let out = Captured::default();
        let screen = ConsoleScreen::with_writer(144, Box::new(out.clone()));
        screen.close();
        screen.close();
        assert!(screen.is_closed());
        assert_eq!(screen.refresh_rate(), 144);
        assert_eq!(out.text().matches("closed").count(), 1);
    }
}
