use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use hondagen_core::{
    model, transport, BleSession, CommandKind, CycleOutcome, DeviceSnapshot, DiscoveryCache,
    Driver, GeneratorDriver, MaintenanceHistory, ServiceDueState, ServiceKind, Supervisor,
    SupervisorConfig,
};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod exporter;
mod state;
#[cfg(test)]
mod exporter_tests;

use state::PersistedState;

#[derive(Debug, Parser)]
#[command(name = "hondagend")]
#[command(about = "Honda portable generator BLE monitor and maintenance scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// BLE address or advertised name of the generator.
    #[arg(long)]
    device: Option<String>,

    /// Device pairing password.
    #[arg(long, default_value = "")]
    password: String,

    #[arg(long, default_value_t = 10)]
    interval_secs: u64,

    #[arg(long, default_value_t = 3)]
    reconnect_after: u32,

    #[arg(long, default_value_t = 60)]
    startup_grace_secs: u64,

    #[arg(long, default_value_t = 30)]
    reconnect_grace_secs: u64,

    /// Give up after this many reconnect cycles (default: never).
    #[arg(long)]
    max_reconnect_cycles: Option<u32>,

    /// Stop-command write attempts before giving up.
    #[arg(long, default_value_t = 3)]
    stop_attempts: u32,

    #[arg(long, default_value_t = 2)]
    read_timeout_secs: u64,

    #[arg(long, default_value_t = 1)]
    write_timeout_secs: u64,

    #[arg(long, default_value = "./data/hondagen-state.json")]
    state_file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan for nearby generators.
    Scan {
        #[arg(long, default_value_t = 10)]
        window_secs: u64,
        /// Drop previously discovered devices before scanning.
        #[arg(long)]
        clear: bool,
    },
    /// Connect, take one snapshot, print it and exit.
    Once {
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
    },
    /// Monitor continuously until interrupted.
    Run {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    /// Monitor and append snapshots to daily JSONL files.
    Export {
        #[arg(long, default_value = "./data/metrics")]
        output_dir: String,
        #[arg(long, default_value_t = 90)]
        retention_days: u64,
    },
    /// Start the engine (models with remote start only).
    Start,
    /// Stop the engine.
    Stop,
    /// Switch ECO throttle mode.
    Eco {
        #[arg(value_enum)]
        mode: Toggle,
    },
    /// Maintenance schedule operations.
    #[command(subcommand)]
    Service(ServiceCommand),
}

#[derive(Debug, Subcommand)]
enum ServiceCommand {
    /// Show the due state of every service item.
    Due {
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    /// Record a service as completed now (or at the given meter/date).
    Complete {
        #[arg(value_parser = parse_service_kind)]
        item: ServiceKind,
        #[arg(long)]
        hours: Option<f64>,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Import a historical record, bypassing the hour-meter check.
    Import {
        #[arg(value_parser = parse_service_kind)]
        item: ServiceKind,
        #[arg(long)]
        hours: f64,
        #[arg(long)]
        date: NaiveDate,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Ndjson,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

fn parse_service_kind(s: &str) -> Result<ServiceKind, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown service item: {s}"))
}

type BleSupervisor = Supervisor<Driver<BleSession>>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = supervisor_config(&cli);
    let mut discoveries = DiscoveryCache::default();

    match &cli.command {
        Command::Scan { window_secs, clear } => {
            if *clear {
                discoveries.clear();
            }
            let adapter = transport::default_adapter().await?;
            discoveries
                .update(transport::scan(&adapter, Duration::from_secs(*window_secs)).await?);
            println!("{}", serde_json::to_string_pretty(discoveries.devices())?);
        }
        Command::Once { format } => {
            let mut sup = connect_supervisor(&cli, &config, &mut discoveries).await?;
            loop {
                match sup.run_cycle().await {
                    CycleOutcome::Snapshot(snapshot) => {
                        persist(&cli.state_file, &sup, &snapshot)?;
                        print_snapshot(&snapshot, *format)?;
                        break;
                    }
                    CycleOutcome::Degraded => {
                        let delay = sup.next_delay();
                        warn!(delay_ms = delay.as_millis() as u64, "retrying");
                        sleep(delay).await;
                    }
                    CycleOutcome::Failed => anyhow::bail!("connection failed permanently"),
                }
            }
            sup.shutdown().await;
        }
        Command::Run { format } => {
            let mut sup = connect_supervisor(&cli, &config, &mut discoveries).await?;
            run_loop(&mut sup, &cli.state_file, *format).await?;
        }
        Command::Export {
            output_dir,
            retention_days,
        } => {
            let mut sup = connect_supervisor(&cli, &config, &mut discoveries).await?;
            exporter::run_exporter(&mut sup, output_dir, *retention_days).await?;
        }
        Command::Start => {
            send_command(&cli, &config, &mut discoveries, CommandKind::EngineStart).await?
        }
        Command::Stop => {
            send_command(&cli, &config, &mut discoveries, CommandKind::EngineStop).await?
        }
        Command::Eco { mode } => {
            let command = match mode {
                Toggle::On => CommandKind::EcoOn,
                Toggle::Off => CommandKind::EcoOff,
            };
            send_command(&cli, &config, &mut discoveries, command).await?;
        }
        Command::Service(service) => run_service_command(&cli, service)?,
    }

    Ok(())
}

fn supervisor_config(cli: &Cli) -> SupervisorConfig {
    SupervisorConfig {
        scan_interval: Duration::from_secs(cli.interval_secs),
        reconnect_after_failures: cli.reconnect_after,
        startup_grace: Duration::from_secs(cli.startup_grace_secs),
        reconnect_grace: Duration::from_secs(cli.reconnect_grace_secs),
        max_reconnect_cycles: cli.max_reconnect_cycles,
        stop_command_attempts: cli.stop_attempts,
        read_timeout: Duration::from_secs(cli.read_timeout_secs),
        write_timeout: Duration::from_secs(cli.write_timeout_secs),
        device_password: cli.password.clone(),
        ..SupervisorConfig::default()
    }
}

async fn connect_supervisor(
    cli: &Cli,
    config: &SupervisorConfig,
    discoveries: &mut DiscoveryCache,
) -> Result<BleSupervisor> {
    let device = cli
        .device
        .as_deref()
        .context("--device is required for this command")?;
    let session = BleSession::discover(device, config, discoveries).await?;
    let driver = Driver::new(session, config);
    let mut sup = Supervisor::new(driver, config.clone());

    let saved = PersistedState::load(&cli.state_file)?;
    sup.preload_history(MaintenanceHistory {
        records: saved.records,
        observed_hours: saved.observed_hours,
        first_seen: saved.first_seen,
        last_snapshot: saved.last_snapshot,
    });
    Ok(sup)
}

async fn send_command(
    cli: &Cli,
    config: &SupervisorConfig,
    discoveries: &mut DiscoveryCache,
    command: CommandKind,
) -> Result<()> {
    let device = cli
        .device
        .as_deref()
        .context("--device is required for this command")?;
    let session = BleSession::discover(device, config, discoveries).await?;
    let mut driver = Driver::new(session, config);
    driver.connect().await?;
    driver.authenticate().await?;
    driver.send_command(command).await?;
    info!(?command, "command sent");
    driver.close().await;
    Ok(())
}

async fn run_loop(
    sup: &mut BleSupervisor,
    state_file: &Path,
    format: OutputFormat,
) -> Result<()> {
    let mut delay = Duration::from_millis(50);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("received ctrl-c, stopping");
                break;
            }
            _ = sleep(delay) => {
                match sup.run_cycle().await {
                    CycleOutcome::Snapshot(snapshot) => {
                        persist(state_file, sup, &snapshot)?;
                        print_snapshot(&snapshot, format)?;
                    }
                    CycleOutcome::Degraded => {
                        info!(state = ?sup.visible_state(), "cycle without data");
                    }
                    CycleOutcome::Failed => {
                        error!("connection failed permanently, stopping");
                        break;
                    }
                }
                delay = sup.next_delay();
            }
        }
    }

    sup.shutdown().await;
    Ok(())
}

fn persist<D: GeneratorDriver>(
    state_file: &Path,
    sup: &Supervisor<D>,
    snapshot: &DeviceSnapshot,
) -> Result<()> {
    if let Some(tracker) = sup.maintenance() {
        PersistedState::capture(
            tracker,
            &snapshot.serial,
            Utc::now().date_naive(),
            Some(snapshot.clone()),
        )
        .save(state_file)?;
    }
    Ok(())
}

fn run_service_command(cli: &Cli, command: &ServiceCommand) -> Result<()> {
    let today = Utc::now().date_naive();
    let saved = PersistedState::load(&cli.state_file)?;
    let serial = saved.serial.clone();
    let last_snapshot = saved.last_snapshot.clone();

    match command {
        ServiceCommand::Due { format } => {
            anyhow::ensure!(
                saved.observed_hours.is_some(),
                "no runtime history yet; run `hondagend run` against the generator first"
            );
            let tracker = saved.into_tracker(today);
            let states = tracker.evaluate_all(today);
            print_due_states(&states, *format)?;
        }
        ServiceCommand::Complete { item, hours, date } => {
            let mut tracker = saved.into_tracker(today);
            let at_hours = (*hours)
                .or(tracker.observed_hours())
                .context("no hour meter on record; pass --hours")?;
            tracker.mark_complete(*item, at_hours, (*date).unwrap_or(today))?;
            PersistedState::capture(
                &tracker,
                serial.as_deref().unwrap_or(""),
                today,
                last_snapshot,
            )
            .save(&cli.state_file)?;
            println!(
                "recorded {} at {at_hours:.1} h",
                item.label()
            );
        }
        ServiceCommand::Import { item, hours, date } => {
            let mut tracker = saved.into_tracker(today);
            tracker.import_record(*item, *hours, *date)?;
            PersistedState::capture(
                &tracker,
                serial.as_deref().unwrap_or(""),
                today,
                last_snapshot,
            )
            .save(&cli.state_file)?;
            println!("imported {} at {hours:.1} h on {date}", item.label());
        }
    }
    Ok(())
}

fn print_snapshot(snapshot: &DeviceSnapshot, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(snapshot)?),
        OutputFormat::Ndjson => println!("{}", serde_json::to_string(snapshot)?),
        OutputFormat::Human => {
            println!("=== Generator Snapshot ===");
            println!("Time:       {}", snapshot.ts.to_rfc3339());
            println!("Device:     {} ({})", snapshot.serial, snapshot.model);
            if let Some(fw) = &snapshot.firmware_version {
                println!("Firmware:   {fw}");
            }
            println!(
                "Engine:     running={} eco={} event={} error={}",
                snapshot.engine_running,
                snapshot.eco_mode,
                model::engine_event_label(snapshot.engine_event),
                model::engine_error_label(snapshot.engine_error),
            );
            println!(
                "Output:     {:.1} V  {:.1} A  {:.0} W",
                snapshot.output_voltage, snapshot.output_current, snapshot.output_power
            );
            println!("Runtime:    {:.1} h", snapshot.runtime_hours);
            if let Some(fuel) = &snapshot.fuel {
                let level = fuel
                    .level_percent
                    .map(|p| format!("{p}%"))
                    .unwrap_or_else(|| "n/a".into());
                let remaining = fuel
                    .remaining_minutes
                    .map(|m| format!("{m} min"))
                    .unwrap_or_else(|| "n/a".into());
                println!("Fuel:       {level} remaining={remaining}");
            }
        }
    }
    Ok(())
}

fn print_due_states(states: &[ServiceDueState], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(states)?),
        OutputFormat::Ndjson => {
            for state in states {
                println!("{}", serde_json::to_string(state)?);
            }
        }
        OutputFormat::Human => {
            for state in states {
                let marker = if state.due { "DUE" } else { "ok " };
                let hours = state
                    .hours_remaining
                    .map(|h| format!("{h:.1} h"))
                    .unwrap_or_else(|| "-".into());
                let days = state
                    .days_remaining
                    .map(|d| format!("{d} d"))
                    .unwrap_or_else(|| "-".into());
                let estimate = state
                    .estimated_due_date
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".into());
                let dealer = if state.dealer_service { " [dealer]" } else { "" };
                println!(
                    "{marker}  {:<26} remaining: {hours:>9} / {days:>7}  est. {estimate}{dealer}",
                    state.label
                );
            }
        }
    }
    Ok(())
}
