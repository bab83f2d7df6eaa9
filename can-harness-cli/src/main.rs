//! CAN Harness CLI Application
//!
//! Command-line bench tool built on the can-harness library:
//! - Send signals (one-shot or periodic with E2E protection)
//! - Send raw message payloads
//! - Monitor and decode live traffic
//! - Record a whole bench of channels with supervised recovery
//!
//! Hardware interfaces are out of scope here; the "sim" interface runs the
//! full pipeline against an in-memory loopback bus.

use anyhow::{bail, Context, Result};
use can_harness::config::{ChannelConfig, RecordingConfig};
use can_harness::controller::{BusConnector, CanController};
use can_harness::db::{self, Database};
use can_harness::orchestrator::{self, Orchestrator};
use can_harness::sim::SimulatedBus;
use can_harness::transport::CanBus;
use can_harness::types::{HarnessError, SignalSet, SignalValue};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod config;

use config::BenchConfig;

/// CAN Harness - bench tool for CAN/CAN-FD test automation
#[derive(Parser, Debug)]
#[command(name = "can-harness-cli")]
#[command(about = "Send, monitor and record CAN bus traffic", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the bench configuration file (bench.toml)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send signals by name (periodic unless --once)
    SendSignals {
        /// Bus name from the config file
        #[arg(long)]
        bus: String,
        /// Signal assignments, e.g. VehSpd=120 GearPos=Drive
        #[arg(value_name = "NAME=VALUE", required = true)]
        signals: Vec<String>,
        /// Send a single frame per message instead of periodically
        #[arg(long)]
        once: bool,
        /// How long to keep periodic sending alive, in seconds
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },

    /// Send raw message payloads (periodic unless --once)
    SendMessages {
        /// Bus name from the config file
        #[arg(long)]
        bus: String,
        /// Payload assignments, e.g. 0x1A0=11:22:33:44
        #[arg(value_name = "ID=BYTES", required = true)]
        messages: Vec<String>,
        /// Send each payload once instead of periodically
        #[arg(long)]
        once: bool,
        /// Override the cycle time, in milliseconds
        #[arg(long)]
        cycle_ms: Option<u64>,
        /// Send as CAN-FD frames
        #[arg(long)]
        fd: bool,
        /// Send with 29-bit extended ids
        #[arg(long)]
        extended: bool,
        /// How long to keep periodic sending alive, in seconds
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },

    /// Monitor and decode live traffic on one bus
    Monitor {
        /// Bus name from the config file
        #[arg(long)]
        bus: String,
        /// Only capture these CAN ids (hex or decimal); empty = everything
        #[arg(long, value_name = "ID")]
        id: Vec<String>,
        /// How long to monitor, in seconds
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },

    /// Record every configured channel with supervised recovery
    Record {
        /// Output directory for recordings
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        /// Channels per worker
        #[arg(long, default_value_t = orchestrator::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        /// How long to record, in seconds
        #[arg(long, default_value_t = 60)]
        duration: u64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Harness CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using harness library v{}", can_harness::VERSION);

    let bench = BenchConfig::load(&args.config)?;

    match args.command {
        Command::SendSignals {
            bus,
            signals,
            once,
            duration,
        } => cmd_send_signals(&bench, &bus, &signals, once, duration),
        Command::SendMessages {
            bus,
            messages,
            once,
            cycle_ms,
            fd,
            extended,
            duration,
        } => cmd_send_messages(&bench, &bus, &messages, once, cycle_ms, fd, extended, duration),
        Command::Monitor { bus, id, duration } => cmd_monitor(&bench, &bus, &id, duration),
        Command::Record {
            output,
            chunk_size,
            duration,
        } => cmd_record(&bench, output, chunk_size, duration),
    }
}

/// Initialize logging based on verbosity flags
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        log::LevelFilter::Error
    } else {
        match verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

/// Connector for the interfaces this binary ships. Real hardware backends
/// plug in here; anything unknown is refused at connect time.
fn bench_connector() -> BusConnector {
    Arc::new(|cfg: &ChannelConfig| match cfg.interface.as_str() {
        "sim" => Ok(SimulatedBus::new_loopback(&cfg.name) as Arc<dyn CanBus>),
        other => Err(HarnessError::Transport(format!(
            "Vendor product id '{}' is not supported",
            other
        ))),
    })
}

/// Build a connected controller for one configured bus, applying the
/// config's E2E and cycle-time overlays to the loaded database
fn make_controller(bench: &BenchConfig, bus_name: &str) -> Result<CanController> {
    let channel = bench.channel(bus_name)?;

    let mut database = match &channel.db_path {
        Some(path) => db::load_dbc_file(path)
            .with_context(|| format!("Failed to load database for bus '{}'", bus_name))?,
        None if channel.is_fd.is_some() => Database::new(),
        None => bail!("Bus '{}': either 'db_path' or 'is_fd' must be set", bus_name),
    };
    for (signal, data_id) in &bench.e2e {
        if let Err(e) = database.set_data_id(signal, *data_id) {
            log::warn!("E2E overlay: {}", e);
        }
    }
    for (message, cycle_ms) in &bench.cycle_times {
        if let Err(e) = database.set_cycle_time(message, *cycle_ms) {
            log::warn!("Cycle-time overlay: {}", e);
        }
    }

    let mut controller =
        CanController::with_database(channel, Arc::new(database), bench_connector());
    controller.connect()?;
    Ok(controller)
}

fn cmd_send_signals(
    bench: &BenchConfig,
    bus: &str,
    assignments: &[String],
    once: bool,
    duration: u64,
) -> Result<()> {
    let mut request = SignalSet::new();
    for assignment in assignments {
        let (name, value) = parse_assignment(assignment)?;
        request.insert(name, value);
    }

    let controller = make_controller(bench, bus)?;
    if once {
        controller.send_signals_once(&request)?;
        println!("Sent {} signal(s) once on '{}'", request.len(), bus);
    } else {
        controller.send_signals(&request)?;
        println!(
            "Sending {} signal(s) periodically on '{}' for {}s ...",
            request.len(),
            bus,
            duration
        );
        std::thread::sleep(Duration::from_secs(duration));
        controller.stop_sending();
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_send_messages(
    bench: &BenchConfig,
    bus: &str,
    assignments: &[String],
    once: bool,
    cycle_ms: Option<u64>,
    fd: bool,
    extended: bool,
    duration: u64,
) -> Result<()> {
    let mut payloads = Vec::new();
    for assignment in assignments {
        payloads.push(parse_payload(assignment)?);
    }

    let controller = make_controller(bench, bus)?;
    if once {
        controller.send_messages_once(&payloads, fd, extended, false)?;
        println!("Sent {} message(s) once on '{}'", payloads.len(), bus);
    } else {
        let cycle = cycle_ms.map(Duration::from_millis);
        controller.send_messages(&payloads, fd, extended, false, cycle)?;
        println!(
            "Sending {} message(s) periodically on '{}' for {}s ...",
            payloads.len(),
            bus,
            duration
        );
        std::thread::sleep(Duration::from_secs(duration));
        controller.stop_sending();
    }
    Ok(())
}

fn cmd_monitor(bench: &BenchConfig, bus: &str, ids: &[String], duration: u64) -> Result<()> {
    let can_ids: Vec<u32> = ids
        .iter()
        .map(|id| parse_can_id(id))
        .collect::<Result<_>>()?;

    let mut controller = make_controller(bench, bus)?;
    controller.listen(&can_ids, &[])?;
    println!("Monitoring '{}' for {}s ...", bus, duration);

    let deadline = std::time::Instant::now() + Duration::from_secs(duration);
    while std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(200));
        for record in controller.drain_signals(0) {
            println!("{}", serde_json::to_string(&record_to_json(&record))?);
        }
    }
    Ok(())
}

fn cmd_record(
    bench: &BenchConfig,
    output: PathBuf,
    chunk_size: usize,
    duration: u64,
) -> Result<()> {
    let configs = bench.all_channels();
    if configs.is_empty() {
        bail!("No buses declared in the config file");
    }

    let orchestrator = Orchestrator::start(
        configs,
        chunk_size,
        bench_connector(),
        RecordingConfig::new(output),
    )?;
    println!(
        "Recording on {} worker(s), {} channel(s) connected; running for {}s ...",
        orchestrator.worker_count(),
        orchestrator.connected_channels(),
        duration
    );
    std::thread::sleep(Duration::from_secs(duration));
    orchestrator.stop();
    println!("Recording stopped");
    Ok(())
}

/// Parse "Name=Value" into a signal assignment; non-numeric values are
/// treated as symbolic choice labels
fn parse_assignment(text: &str) -> Result<(String, SignalValue)> {
    let (name, value) = text
        .split_once('=')
        .with_context(|| format!("Invalid signal assignment '{}', expected NAME=VALUE", text))?;
    let value = match value.parse::<f64>() {
        Ok(number) => SignalValue::Num(number),
        Err(_) => SignalValue::Sym(value.to_string()),
    };
    Ok((name.to_string(), value))
}

/// Parse "0x1A0=11:22:33" into a raw payload assignment
fn parse_payload(text: &str) -> Result<(u32, Vec<u8>)> {
    let (id, data) = text
        .split_once('=')
        .with_context(|| format!("Invalid payload '{}', expected ID=AA:BB:CC", text))?;
    let can_id = parse_can_id(id)?;
    let bytes = data
        .split(':')
        .map(|b| u8::from_str_radix(b, 16).with_context(|| format!("Invalid data byte '{}'", b)))
        .collect::<Result<Vec<u8>>>()?;
    Ok((can_id, bytes))
}

/// Parse a CAN id in hex ("0x1A0") or decimal ("416") form
fn parse_can_id(text: &str) -> Result<u32> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).with_context(|| format!("Invalid CAN id '{}'", text))
    } else {
        text.parse::<u32>()
            .with_context(|| format!("Invalid CAN id '{}'", text))
    }
}

/// Render a drained record as a JSON object for line-oriented output
fn record_to_json(record: &can_harness::controller::ReceivedRecord) -> serde_json::Value {
    let mut object = serde_json::Map::new();
    object.insert(
        "timestamp".to_string(),
        serde_json::Value::String(record.frame.timestamp().to_rfc3339()),
    );
    object.insert(
        "channel".to_string(),
        serde_json::Value::String(record.frame.channel.clone()),
    );
    object.insert(
        "id".to_string(),
        serde_json::Value::String(format!("0x{:X}", record.frame.can_id)),
    );
    object.insert(
        "data".to_string(),
        serde_json::Value::String(
            record
                .frame
                .data
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(":"),
        ),
    );
    if let Some(message) = &record.message {
        object.insert(
            "message".to_string(),
            serde_json::Value::String(message.clone()),
        );
    }
    if let Some(signals) = &record.signals {
        let mut decoded = serde_json::Map::new();
        for (name, value) in signals {
            let json_value = match value {
                SignalValue::Num(v) => serde_json::json!(v),
                SignalValue::Sym(s) => serde_json::Value::String(s.clone()),
            };
            decoded.insert(name.clone(), json_value);
        }
        object.insert("signals".to_string(), serde_json::Value::Object(decoded));
    }
    serde_json::Value::Object(object)
}
