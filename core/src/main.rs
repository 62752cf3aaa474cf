//! UASNAV: run the autopilot navigation core against simulated flights.
//!
//! The `run` command drives the 50 Hz scheduler with a synthetic sensor stream (static, straight
//! and level, GPS outages, wind gusts), optionally paced to wall-clock time, while a datalogger
//! thread and a telemetry thread consume the published cycle snapshots. Results are written as a
//! CSV of navigation records. The `config` command writes a template configuration file.
use clap::{Args, Parser, Subcommand};
use log::{debug, error, info, warn};
use std::error::Error;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::Receiver;
use uasnav::config::NavConfig;
use uasnav::messages::ControlMode;
use uasnav::scheduler::NullAutopilot;
use uasnav::sim::{NavigationRecord, RunSummary, ScenarioConfig, ScenarioKind, SensorNoise, Simulation};
use uasnav::snapshot::CycleSnapshot;

const LONG_ABOUT: &str = "UASNAV: state estimation and fixed-rate execution core for a small-aircraft autopilot.

The run command simulates a flight and feeds the synthetic IMU, GPS and air data through the
AHRS, dead-reckoning, GPS-aided INS and blending filters at the scheduler base rate. GPS outage
and wind gust scenarios exercise the fallback from the INS to the dead-reckoning solution.

Configuration files may be TOML, JSON or YAML; use the config command to write a template.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Autopilot navigation core simulator", long_about = LONG_ABOUT)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(name = "run", about = "Run a simulated flight through the navigation core")]
    Run(RunArgs),
    #[command(name = "config", about = "Generate a template configuration file")]
    CreateConfig(ConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Navigation configuration (TOML/JSON/YAML); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output CSV file for the navigation records
    #[arg(short, long)]
    output: PathBuf,

    /// Flight scenario
    #[arg(short, long, value_enum, default_value_t = ScenarioKind::StraightAndLevel)]
    scenario: ScenarioKind,

    /// Simulated duration in seconds
    #[arg(short, long, default_value_t = 120.0)]
    duration: f64,

    /// Add sensor noise and gyro biases
    #[arg(long)]
    noise: bool,

    /// Random seed for the sensor noise
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Pace cycles to wall-clock time instead of running as fast as possible
    #[arg(long)]
    realtime: bool,

    /// Engage the autopilot at this simulation time [s]
    #[arg(long)]
    engage_at: Option<f64>,

    /// Write every cycle snapshot as JSON lines to this file
    #[arg(long)]
    datalog: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
struct ConfigArgs {
    /// Output path; the format follows the extension (.toml/.json/.yaml)
    #[arg(short, long, default_value = "uasnav.toml")]
    output: PathBuf,
}

/// Initialize the logger with the specified level and optional file output
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }
    builder.init();
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    match cli.command {
        Command::Run(args) => run(&args),
        Command::CreateConfig(args) => {
            NavConfig::default().to_file(&args.output)?;
            info!("Template configuration written to {}", args.output.display());
            Ok(())
        }
    }
}

fn run(args: &RunArgs) -> Result<(), Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            NavConfig::from_file(path)?
        }
        None => NavConfig::default(),
    };
    let period = config.scheduler.period;
    let mut scenario = ScenarioConfig::new(args.scenario).with_seed(args.seed);
    if args.noise {
        scenario = scenario.with_noise(SensorNoise::default());
    }
    let cycles = (args.duration / period).round().max(1.0) as u64;

    let mut simulation = Simulation::new(config, scenario)?;
    let datalog = spawn_datalogger(simulation.scheduler_mut().subscribe_datalog(), args.datalog.clone());
    let telemetry = spawn_telemetry(simulation.scheduler_mut().subscribe_telemetry());

    let mut autopilot = NullAutopilot;
    let mut records = Vec::with_capacity(cycles as usize + 1);
    let start = Instant::now();
    let mut late = 0u64;
    for cycle in 0..cycles {
        if args.realtime {
            let deadline = start + Duration::from_secs_f64(cycle as f64 * period);
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            } else if now - deadline > Duration::from_secs_f64(period) {
                late += 1;
            }
        }
        if let Some(t) = args.engage_at
            && cycle as f64 * period >= t
            && simulation.control().control_mode() == ControlMode::Manual
        {
            simulation.control_mut().mode = ControlMode::Autopilot.as_raw();
        }
        records.push(simulation.step(&mut autopilot));
    }
    simulation.control_mut().mode = ControlMode::Shutdown.as_raw();
    records.push(simulation.step(&mut autopilot));
    if late > 0 {
        warn!("{} cycles started more than one period late", late);
    }

    for stats in simulation.scheduler().delivery_stats() {
        info!("Reader '{}': {} snapshots sent, {} dropped", stats.name, stats.sent, stats.dropped);
    }
    simulation.scheduler_mut().disconnect_readers();
    let logged = datalog.join().map_err(|_| "datalogger thread panicked")??;
    let transmitted = telemetry.join().map_err(|_| "telemetry thread panicked")?;
    info!("Datalogger stored {} snapshots, telemetry sent {}", logged, transmitted);

    info!("Timing: {}", simulation.scheduler().timings());
    info!("Result: {}", RunSummary::from_records(&records));
    NavigationRecord::to_csv(&records, &args.output)?;
    info!("Navigation records written to {}", args.output.display());
    Ok(())
}

/// Consume every snapshot, optionally writing them as JSON lines
fn spawn_datalogger(
    snapshots: Receiver<CycleSnapshot>,
    path: Option<PathBuf>,
) -> thread::JoinHandle<Result<u64, std::io::Error>> {
    thread::spawn(move || {
        let mut writer = match path {
            Some(path) => Some(BufWriter::new(File::create(path)?)),
            None => None,
        };
        let mut count = 0u64;
        for snapshot in snapshots.iter() {
            if let Some(w) = writer.as_mut() {
                serde_json::to_writer(&mut *w, &snapshot).map_err(std::io::Error::other)?;
                w.write_all(b"\n")?;
            }
            count += 1;
        }
        if let Some(mut w) = writer {
            w.flush()?;
        }
        Ok(count)
    })
}

/// Stand-in for the telemetry link: reports the decimated snapshots to the log
fn spawn_telemetry(snapshots: Receiver<CycleSnapshot>) -> thread::JoinHandle<u64> {
    thread::spawn(move || {
        let mut count = 0u64;
        for snapshot in snapshots.iter() {
            let nav = &snapshot.nav;
            debug!(
                "TLM t={:.2} {} lat={:.7} lon={:.7} alt={:.1} psi={:.3} status={}",
                snapshot.time,
                snapshot.state,
                nav.lat.to_degrees(),
                nav.lon.to_degrees(),
                nav.alt,
                nav.psi,
                nav.status
            );
            if nav.status.is_sentinel() && snapshot.cycle > 0 {
                error!("Telemetry: no navigation solution at t = {:.2} s", snapshot.time);
            }
            count += 1;
        }
        count
    })
}
