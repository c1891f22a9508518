//! Headless virtual gear shifter
//!
//! Connects to the first trainer advertising the configured name token (or a
//! simulated one with `--mock`) and reads shift commands from stdin.

use anyhow::{bail, Context};
use clap::Parser;
use kickr_shifter::domain::gears::validate_ratio;
use kickr_shifter::domain::models::{AppEvent, ConnectionStatus, MessageSeverity, ShiftCommand};
use kickr_shifter::domain::settings::SettingsService;
use kickr_shifter::infrastructure::bluetooth::btleplug_backend::{BtleplugConfig, BtleplugTransport};
use kickr_shifter::infrastructure::bluetooth::mock::MockTransport;
use kickr_shifter::infrastructure::bluetooth::protocol;
use kickr_shifter::infrastructure::bluetooth::service::ServiceConfig;
use kickr_shifter::infrastructure::bluetooth::TrainerService;
use kickr_shifter::infrastructure::logging;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const HELP: &str = "commands: up [n] | down [n] | set <meters> | ratio <r> | status | quit";

#[derive(Parser)]
#[command(name = "kickr_shifter")]
#[command(about = "Virtual gear shifting for smart trainers over BLE")]
struct Cli {
    /// Use a simulated trainer instead of the Bluetooth adapter
    #[arg(long)]
    mock: bool,

    /// Simulated trainer response latency in milliseconds
    #[arg(long, default_value = "50")]
    latency_ms: u64,

    /// Gear ratio between adjacent gears (saved as the new default)
    #[arg(short, long)]
    ratio: Option<f64>,

    /// Starting wheel circumference in meters
    #[arg(short, long)]
    circumference: Option<f64>,

    /// Settings file to use instead of the per-user one
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log at debug level regardless of settings
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings_service = match cli.settings {
        Some(path) => SettingsService::with_path(path),
        None => SettingsService::new()?,
    };

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings, cli.verbose)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting KickrShifter");

    if let Some(ratio) = cli.ratio {
        validate_ratio(ratio).context("invalid --ratio")?;
        if let Err(e) = settings_service.update_gear_ratio(ratio) {
            warn!("Could not save gear ratio: {}", e);
        }
    }
    if let Some(circumference) = cli.circumference {
        protocol::validate_circumference(circumference).context("invalid --circumference")?;
        settings_service.get_mut().default_circumference = circumference;
    }

    let settings = settings_service.get().clone();
    let config = ServiceConfig::from_settings(&settings).context("invalid settings")?;

    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (app_tx, app_rx) = mpsc::unbounded_channel();

    tokio::spawn(print_events(app_rx));
    tokio::spawn(read_commands(command_tx.clone()));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = command_tx.send(ShiftCommand::Shutdown);
        }
    });

    println!("{}", HELP);

    if cli.mock {
        let transport =
            MockTransport::simulated(transport_tx, Duration::from_millis(cli.latency_ms));
        TrainerService::new(transport, config, app_tx)
            .run(transport_rx, command_rx)
            .await;
    } else {
        let backend = BtleplugConfig {
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
        };
        let (transport, worker) = BtleplugTransport::spawn(transport_tx, backend);
        TrainerService::new(transport, config, app_tx)
            .run(transport_rx, command_rx)
            .await;

        // Let the worker deliver the final disconnect
        if tokio::time::timeout(Duration::from_secs(2), worker).await.is_err() {
            warn!("Bluetooth worker did not stop in time");
        }
    }

    info!("KickrShifter stopped");
    Ok(())
}

async fn read_commands(commands: mpsc::UnboundedSender<ShiftCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        };
        match parse_command(&line) {
            Ok(Some(command)) => {
                if commands.send(command).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => println!("{} ({})", e, HELP),
        }
    }
    let _ = commands.send(ShiftCommand::Shutdown);
}

async fn print_events(mut events: mpsc::UnboundedReceiver<AppEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::ConnectionStatus(ConnectionStatus::Connected(name)) => {
                println!("connected to {}", name)
            }
            AppEvent::ConnectionStatus(status) => println!("{:?}", status),
            AppEvent::GearChanged(gear) => println!(
                "circumference {:.4}m{}",
                gear.current,
                if gear.editable { "" } else { " (pending)" }
            ),
            AppEvent::LogMessage(msg) => match msg.severity {
                MessageSeverity::Error | MessageSeverity::Warning => {
                    println!("! {}", msg.message)
                }
                MessageSeverity::Info | MessageSeverity::Success => println!("{}", msg.message),
            },
        }
    }
}

fn parse_command(line: &str) -> anyhow::Result<Option<ShiftCommand>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();
    if words.next().is_some() {
        bail!("too many arguments");
    }

    let command = match (verb.to_lowercase().as_str(), arg) {
        ("up" | "u", n) => ShiftCommand::ShiftUp(parse_steps(n)?),
        ("down" | "d", n) => ShiftCommand::ShiftDown(parse_steps(n)?),
        ("set", Some(value)) => ShiftCommand::SetCircumference(
            value.parse().with_context(|| format!("invalid circumference '{}'", value))?,
        ),
        ("ratio", Some(value)) => ShiftCommand::SetRatio(
            value.parse().with_context(|| format!("invalid ratio '{}'", value))?,
        ),
        ("status", None) => ShiftCommand::Status,
        ("quit" | "exit" | "q", None) => ShiftCommand::Shutdown,
        ("set" | "ratio", None) => bail!("'{}' needs a value", verb),
        _ => bail!("unknown command '{}'", line.trim()),
    };
    Ok(Some(command))
}

fn parse_steps(arg: Option<&str>) -> anyhow::Result<u32> {
    let steps = match arg {
        Some(n) => n
            .parse()
            .with_context(|| format!("invalid gear count '{}'", n))?,
        None => 1,
    };
    if steps == 0 {
        bail!("gear count must be at least 1");
    }
    Ok(steps)
}
