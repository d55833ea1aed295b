//! Track command - run a tracking session against the simulator.

use std::io::BufRead;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use clap::Args;
use facetrack::config::SessionConfig;
use facetrack::session::{SessionReport, StopOutcome, TrackingSession};
use facetrack::sim::{FrameMode, SimFactory, SimWorld, WorldConfig, DEFAULT_CAMERA_FPS};
use facetrack::supervisor::FlightState;
use facetrack::telemetry::{ChannelSink, RateLimitedSink, TelemetrySnapshot, DEFAULT_CHANNEL_CAPACITY};

use crate::error::CliError;

/// How often the command loop checks for input and session end.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Telemetry lines per second in `--json` mode.
const JSON_RATE_HZ: u32 = 10;

/// Status lines per second otherwise.
const STATUS_RATE_HZ: u32 = 1;

/// Arguments for the track command.
#[derive(Debug, Args)]
pub struct TrackArgs {
    /// Frame source implementation: polled or threaded
    #[arg(long, default_value_t = FrameMode::Polled, value_name = "MODE")]
    pub frames: FrameMode,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECS")]
    pub duration: Option<u64>,

    /// Take off as soon as tracking begins
    #[arg(long)]
    pub takeoff: bool,

    /// Print telemetry as JSON lines on stdout
    #[arg(long)]
    pub json: bool,

    /// Simulated camera frame rate
    #[arg(long, default_value_t = DEFAULT_CAMERA_FPS)]
    pub fps: u32,

    /// Horizontal wander of the simulated face, in pixels
    #[arg(long, default_value_t = 0.0, value_name = "PX")]
    pub wander: f64,
}

/// A keyboard command read from stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key {
    Takeoff,
    Land,
    Emergency,
    Quit,
}

impl Key {
    fn parse(line: &str) -> Option<Self> {
        match line.trim().chars().next()?.to_ascii_lowercase() {
            't' => Some(Key::Takeoff),
            'l' => Some(Key::Land),
            'e' => Some(Key::Emergency),
            'q' => Some(Key::Quit),
            _ => None,
        }
    }
}

/// Run the track command.
pub fn run(args: TrackArgs, config_path: &Path) -> Result<(), CliError> {
    let config = SessionConfig::load_or_default(config_path)?;

    let world = SimWorld::new(WorldConfig {
        wander_amplitude: args.wander,
        ..WorldConfig::default()
    });
    let factory = SimFactory::new(world)
        .with_frame_mode(args.frames)
        .with_camera_fps(args.fps);

    let rate = if args.json { JSON_RATE_HZ } else { STATUS_RATE_HZ };
    let (channel, receiver) = ChannelSink::new(DEFAULT_CHANNEL_CAPACITY);
    let sink = Arc::new(RateLimitedSink::per_second(channel, rate));
    let json = args.json;
    let printer = thread::Builder::new()
        .name("facetrack-telemetry".to_string())
        .spawn(move || {
            let mut receiver = receiver;
            while let Some(snapshot) = receiver.blocking_recv() {
                print_snapshot(&snapshot, json);
            }
        })?;

    eprintln!("Facetrack v{}", facetrack::VERSION);
    eprintln!("================");
    eprintln!();
    eprintln!("Config:  {}", display_path(config_path));
    eprintln!("Frames:  {} at {} fps (simulated)", args.frames, args.fps);
    eprintln!();
    eprintln!("Keys: t = take off, l = land, e = emergency stop, q = quit (then Enter)");
    eprintln!("Press Ctrl+C to land and exit");
    eprintln!();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        eprintln!();
        eprintln!("Received shutdown signal, landing...");
        shutdown_clone.store(true, Ordering::SeqCst);
    })
    .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    let keys = spawn_key_reader()?;
    let handle = TrackingSession::start(config, Arc::new(factory), sink)?;

    let deadline = args.duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut takeoff_pending = args.takeoff;

    loop {
        if shutdown.load(Ordering::SeqCst) || handle.is_finished() {
            break;
        }
        if deadline.is_some_and(|limit| Instant::now() >= limit) {
            tracing::info!("Duration elapsed, stopping");
            break;
        }
        if takeoff_pending && handle.state() == FlightState::Tracking {
            handle.request_takeoff();
            takeoff_pending = false;
        }

        match keys.try_recv() {
            Ok(Key::Takeoff) => {
                handle.request_takeoff();
            }
            Ok(Key::Land) => {
                handle.request_land();
            }
            Ok(Key::Emergency) => handle.emergency_stop(),
            Ok(Key::Quit) => break,
            Err(_) => {}
        }

        thread::sleep(POLL_INTERVAL);
    }

    let outcome = handle.stop_default();

    match outcome {
        StopOutcome::TimedOut => Err(CliError::StopTimeout),
        StopOutcome::Completed(result) => {
            join_printer(printer);
            match result {
                Ok(report) => {
                    print_summary(&report);
                    Ok(())
                }
                Err(e) if e.is_cancelled() => {
                    eprintln!("Cancelled before tracking began.");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}

/// Read keyboard commands from stdin on a detached thread.
fn spawn_key_reader() -> Result<mpsc::Receiver<Key>, CliError> {
    let (sender, receiver) = mpsc::channel();
    thread::Builder::new()
        .name("facetrack-keys".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if let Some(key) = Key::parse(&line) {
                    if sender.send(key).is_err() {
                        break;
                    }
                }
            }
        })?;
    Ok(receiver)
}

fn join_printer(printer: JoinHandle<()>) {
    if printer.join().is_err() {
        tracing::warn!("Telemetry printer panicked");
    }
}

fn display_path(path: &Path) -> String {
    if path.exists() {
        path.display().to_string()
    } else {
        format!("{} (not found, using defaults)", path.display())
    }
}

fn print_snapshot(snapshot: &TelemetrySnapshot, json: bool) {
    if json {
        match serde_json::to_string(snapshot) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!(error = %e, "Failed to encode telemetry"),
        }
    } else {
        eprintln!("{}", format_status(snapshot));
    }
}

fn format_status(s: &TelemetrySnapshot) -> String {
    let target = match &s.detection {
        Some(d) => format!("({}, {}) size {}", d.center_x, d.center_y, d.size()),
        None => format!("none ({} frames)", s.frames_without_detection),
    };
    let battery = s
        .battery_percent
        .map_or_else(|| "?".to_string(), |b| format!("{}%", b));
    format!(
        "[{:>5}] {:<10} {} | {:>5.1} fps | target {} | cmd {} | battery {}",
        s.cycle,
        s.flight_state.as_str(),
        if s.airborne { "airborne" } else { "grounded" },
        s.fps,
        target,
        s.command,
        battery
    )
}

fn print_summary(report: &SessionReport) {
    println!();
    println!("Session Summary");
    println!("───────────────");
    println!("  Ended:       {}", report.end);
    println!("  Duration:    {:.1}s", report.duration.as_secs_f64());
    println!("  Frames:      {} ({} with a face)", report.cycles, report.detections);
    println!("  Frame rate:  {:.1} fps", report.fps);
    println!(
        "  Commands:    {} sent, {} throttled",
        report.commands_forwarded, report.commands_dropped
    );
    println!("  Takeoffs:    {}", report.takeoffs);
    if let Some(battery) = report.battery_percent {
        println!("  Battery:     {}%", battery);
    }
}
