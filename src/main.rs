//! LDAT - Display latency and timing analysis
//!
//! Command line front end: finds the instrument, runs one measurement and
//! prints the result as JSON.

use anyhow::{anyhow, bail, Context, Result};
use ldat::buffer::{ring::FixedRing, SampleBuffer};
use ldat::calibration::MonitorCapture;
use ldat::config::{LdatConfig, Timing};
use ldat::console::ConsoleScreen;
use ldat::device::{discovery, LightSensor, MonitorOptions, MonitorSink, StreamError};
use ldat::measurement::input_lag::InputLagTest;
use ldat::measurement::light_to_sound::DEFAULT_VOLUME;
use ldat::measurement::live_lag::{LiveLagEvent, LiveLagMonitor};
use ldat::measurement::overdrive::OverdriveTest;
use ldat::measurement::pwm::PwmTest;
use ldat::measurement::response::PixelResponseTest;
use ldat::measurement::screen::TestScreen;
use ldat::measurement::stutter::StutterTest;
use ldat::measurement::{begin, Measurement, Outcome, OutcomeChannel};
use ldat::sim::{PanelModel, SimPanel, SimulatedScreen, SimulatedSensor, UserAction};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info};

const MEASUREMENTS: [&str; 5] = ["input-lag", "stutter", "response", "overdrive", "pwm"];

#[derive(Debug, Default)]
struct Options {
    port: Option<String>,
    config: Option<PathBuf>,
    simulate: bool,
    refresh_rate: u32,
    volume: i32,
    command: Option<Command>,
}

#[derive(Debug)]
enum Command {
    List,
    Info,
    Monitor(f64),
    Live,
    Sound,
    Run(String),
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ldat=info,ldat_core=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(options) = parse_args(&args)? else {
        return Ok(());
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install Ctrl+C handler")?;

    match options.command {
        None => {
            print_help();
            Ok(())
        }
        Some(Command::List) => list_ports(),
        Some(Command::Info) => {
            let (sensor, _) = connect(&options, false)?;
            print_json(sensor.identity())
        }
        Some(Command::Monitor(secs)) => {
            let (sensor, _) = connect(&options, false)?;
            monitor(sensor.as_ref(), secs, &interrupted)
        }
        Some(Command::Live) => {
            let config = load_config(&options)?;
            let (sensor, screen) = connect(&options, false)?;
            live(sensor, screen, &config, &interrupted)
        }
        Some(Command::Sound) => {
            let (sensor, _) = connect(&options, false)?;
            light_to_sound(sensor, options.volume, &interrupted)
        }
        Some(Command::Run(ref name)) => {
            if !MEASUREMENTS.contains(&name.as_str()) {
                bail!("unknown measurement '{}' (expected one of {:?})", name, MEASUREMENTS);
            }
            let config = load_config(&options)?;
            let (sensor, screen) = connect(&options, true)?;
            let timing = config.timing.clone();
            match name.as_str() {
                "input-lag" => {
                    let test = InputLagTest::new(config.input_lag);
                    run(test, sensor, screen, timing, &interrupted)
                }
                "stutter" => {
                    let test = StutterTest::new(config.stutter);
                    run(test, sensor, screen, timing, &interrupted)
                }
                "response" => {
                    let test = PixelResponseTest::new(config.response);
                    run(test, sensor, screen, timing, &interrupted)
                }
                "overdrive" => {
                    let test = OverdriveTest::new(config.overdrive);
                    run(test, sensor, screen, timing, &interrupted)
                }
                _ => run(PwmTest::new(config.pwm), sensor, screen, timing, &interrupted),
            }
        }
    }
}

fn parse_args(args: &[String]) -> Result<Option<Options>> {
    let mut options = Options {
        refresh_rate: 60,
        volume: DEFAULT_VOLUME,
        ..Options::default()
    };
    let mut i = 1;

    let value = |i: usize, flag: &str| -> Result<String> {
        args.get(i + 1)
            .cloned()
            .ok_or_else(|| anyhow!("{} requires a value", flag))
    };

    while i < args.len() {
        match args[i].as_str() {
            "--list" | "-l" => options.command = Some(Command::List),
            "--info" | "-i" => options.command = Some(Command::Info),
            "--live" => options.command = Some(Command::Live),
            "--sound" => options.command = Some(Command::Sound),
            "--volume" => {
                options.volume = value(i, "--volume")?
                    .parse()
                    .context("--volume expects a whole number")?;
                i += 1;
            }
            "--monitor" | "-m" => {
                let secs: f64 = value(i, "--monitor")?
                    .parse()
                    .context("--monitor expects a number of seconds")?;
                if secs.is_nan() || secs <= 0.0 {
                    bail!("--monitor expects a positive duration");
                }
                options.command = Some(Command::Monitor(secs));
                i += 1;
            }
            "--run" | "-r" => {
                options.command = Some(Command::Run(value(i, "--run")?));
                i += 1;
            }
            "--config" | "-c" => {
                options.config = Some(PathBuf::from(value(i, "--config")?));
                i += 1;
            }
            "--port" | "-p" => {
                options.port = Some(value(i, "--port")?);
                i += 1;
            }
            "--refresh" => {
                options.refresh_rate = value(i, "--refresh")?
                    .parse()
                    .context("--refresh expects a rate in Hz")?;
                i += 1;
            }
            "--simulate" | "-s" => options.simulate = true,
            "--version" | "-v" => {
                println!("ldat {} (built {})", ldat::VERSION, ldat::BUILD_DATE);
                return Ok(None);
            }
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                return Ok(None);
            }
        }
        i += 1;
    }
    Ok(Some(options))
}

fn print_help() {
    println!("Usage: ldat [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -l, --list              List instrument ports");
    println!("  -i, --info              Print the instrument's identity");
    println!("  -m, --monitor SECS      Capture light levels for SECS seconds");
    println!("      --live              Print click-to-photon delays until Ctrl+C");
    println!("      --sound             Play the light sensor as audio until Ctrl+C");
    println!("      --volume N          Gain for --sound (default: {})", DEFAULT_VOLUME);
    println!("  -r, --run NAME          Run a measurement: {}", MEASUREMENTS.join(", "));
    println!("  -c, --config FILE       Load measurement settings from a JSON file");
    println!("  -p, --port NAME         Use this serial port instead of searching");
    println!("      --refresh HZ        Display refresh rate (default: 60)");
    println!("  -s, --simulate          Use the built-in simulated display and sensor");
    println!("  -v, --version           Show version");
    println!("  -h, --help              Show this help");
    println!();
    println!("Examples:");
    println!("  ldat --run response --config settings.json");
    println!("  ldat --simulate --run pwm");
}

fn load_config(options: &Options) -> Result<LdatConfig> {
    match &options.config {
        Some(path) => LdatConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(LdatConfig::default()),
    }
}

fn list_ports() -> Result<()> {
    let ports = discovery::list_ports()?;
    if ports.is_empty() {
        println!("No instruments found.");
        return Ok(());
    }
    println!("Found {} instrument(s):", ports.len());
    for (i, port) in ports.iter().enumerate() {
        println!("  {}. {} ({})", i + 1, port.name, port.description);
    }
    Ok(())
}

/// Open the instrument (or the simulator) and a matching test screen
///
/// With `interactive`, typed lines reach the console screen as events.
fn connect(
    options: &Options,
    interactive: bool,
) -> Result<(Arc<dyn LightSensor>, Arc<dyn TestScreen>)> {
    if options.simulate {
        let panel = SimPanel::new(PanelModel {
            refresh_rate: options.refresh_rate,
            overshoot: 0.05,
            ..PanelModel::default()
        });
        let sensor = SimulatedSensor::new(Arc::clone(&panel))?;
        let screen = SimulatedScreen::new(panel).with_action(UserAction::Confirm);
        info!("Using simulated instrument");
        return Ok((Arc::new(sensor), Arc::new(screen)));
    }

    let link = match &options.port {
        Some(port) => discovery::open_port(port)?,
        None => discovery::open_first()?.ok_or_else(|| anyhow!("no instrument found"))?,
    };
    info!(
        port = link.port_name(),
        firmware = %link.identity().firmware_version,
        "Connected"
    );
    let screen = Arc::new(ConsoleScreen::stdout(options.refresh_rate));
    if interactive {
        screen.spawn_stdin_reader()?;
    }
    Ok((Arc::new(link), screen))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run<M>(
    measurement: M,
    sensor: Arc<dyn LightSensor>,
    screen: Arc<dyn TestScreen>,
    timing: Timing,
    interrupted: &AtomicBool,
) -> Result<()>
where
    M: Measurement,
    M::Output: Serialize,
{
    let name = measurement.name();
    let (tx, rx) = crossbeam_channel::bounded(1);
    let handle = begin(
        measurement,
        sensor,
        screen,
        timing,
        Box::new(OutcomeChannel::new(tx)),
    )?;

    let outcome = loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(outcome) => break outcome,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if interrupted.swap(false, Ordering::SeqCst) {
                    info!("Interrupted, cancelling");
                    handle.cancel();
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                bail!("{} ended without reporting", name)
            }
        }
    };
    handle.join();

    match outcome {
        Outcome::Completed(result) => print_json(&result),
        Outcome::Cancelled(reason) => {
            println!("{} cancelled ({:?})", name, reason);
            Ok(())
        }
        Outcome::Failed(e) => {
            error!(measurement = name, error = %e, "Measurement failed");
            Err(e.into())
        }
    }
}

struct MonitorRing {
    ring: FixedRing,
    failure: Mutex<Option<StreamError>>,
}

impl MonitorSink for MonitorRing {
    fn on_samples(&self, samples: &[u32]) {
        self.ring.push_slice(samples);
    }

    fn on_error(&self, error: StreamError) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }
}

fn monitor(sensor: &dyn LightSensor, secs: f64, interrupted: &AtomicBool) -> Result<()> {
    let rate = sensor.monitor_sample_rate(false, false)?;
    let sink = Arc::new(MonitorRing {
        ring: FixedRing::new((rate * secs) as usize),
        failure: Mutex::new(None),
    });
    let options = MonitorOptions {
        unbuffered: false,
        sensitivity: ldat::MAX_SENSITIVITY,
        fast_adc: false,
    };
    let sample_rate = sensor.start_monitor(options, sink.clone())?;
    println!("Capturing {} s of light samples. Press Ctrl+C to stop early.", secs);

    while !sink.ring.is_filled() && !interrupted.load(Ordering::SeqCst) {
        if sink.failure.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    sensor.end_current_activity();
    if let Some(e) = sink.failure.lock().unwrap_or_else(PoisonError::into_inner).take() {
        return Err(e.into());
    }

    print_json(&MonitorCapture::from_ring(sample_rate, &sink.ring))
}

fn live(
    sensor: Arc<dyn LightSensor>,
    screen: Arc<dyn TestScreen>,
    config: &LdatConfig,
    interrupted: &AtomicBool,
) -> Result<()> {
    screen.set_color(0.0, 0.0, 0.0);
    screen.set_flash_on_click(true);
    let (mut monitor, events) = LiveLagMonitor::new(sensor, &config.live_lag)?;
    monitor.begin()?;
    println!("Click to measure. Press Ctrl+C to stop.");

    let result = loop {
        if interrupted.load(Ordering::SeqCst) {
            break Ok(());
        }
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(LiveLagEvent::DataPoint(ms)) => println!("{:>8.2} ms", ms),
            Ok(LiveLagEvent::Error(e)) => break Err(anyhow!(e)),
            Ok(LiveLagEvent::Stopped) => break Ok(()),
            Err(_) => {}
        }
    };
    monitor.cancel();
    screen.close();
    result
}

#[cfg(feature = "audio")]
fn light_to_sound(
    sensor: Arc<dyn LightSensor>,
    volume: i32,
    interrupted: &AtomicBool,
) -> Result<()> {
    use ldat::measurement::light_to_sound::{LightToSound, LightToSoundEvent};
    use ldat::speaker::Speaker;

    let speaker = Speaker::open(sensor.monitor_sample_rate(false, true)?)?;
    let (mut player, events) = LightToSound::new(sensor, speaker.feed())?;
    player.set_volume(volume);
    player.begin()?;
    println!("Playing light as sound. Press Ctrl+C to stop.");

    let result = loop {
        if interrupted.load(Ordering::SeqCst) {
            break Ok(());
        }
        match events.recv_timeout(Duration::from_millis(500)) {
            Ok(LightToSoundEvent::Error(e)) => break Err(anyhow!(e)),
            Ok(LightToSoundEvent::Stopped) => break Ok(()),
            Err(_) => match player.strongest_frequency(20.0, 10_000.0) {
                Some(hz) => println!("{:>9.2} Hz", hz),
                None => println!("      --- Hz"),
            },
        }
    };
    player.cancel();
    result
}

#[cfg(not(feature = "audio"))]
fn light_to_sound(
    _sensor: Arc<dyn LightSensor>,
    _volume: i32,
    _interrupted: &AtomicBool,
) -> Result<()> {
    bail!("ldat was built without audio support (rebuild with --features audio)")
}
