//! CLI entry point for thermocal_daq
//!
//! Runs the acquisition core headless against the instruments named in the
//! configuration (the simulated rig by default), logging chart values once
//! per render tick and optionally recording a log file.
//!
//! # Usage
//!
//! ```bash
//! thermocal_daq run --duration 60 --record
//! thermocal_daq run --config config/default.toml --window 00:30
//! thermocal_daq check-config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thermocal_daq::acquisition::EngineEvent;
use thermocal_daq::config::{AppConfig, DEFAULT_CONFIG_PATH};
use thermocal_daq::instrument::InstrumentRegistry;
use thermocal_daq::logging::{self, LoggingConfig, OutputFormat};
use thermocal_daq::render::{HistoryWindow, TracingRenderer};
use thermocal_daq::AcquisitionContext;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "thermocal_daq")]
#[command(about = "Multi-instrument polling acquisition for thermistor calibration", long_about = None)]
struct Cli {
    /// Configuration file (TOML); `config/default.toml` or built-in defaults when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire until Ctrl-C (or for a fixed duration)
    Run {
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Record a log file from the start
        #[arg(long)]
        record: bool,

        /// Directory for log files (overrides the configuration)
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Visible chart span: 00:30, 01:00, 03:00, 05:00, 10:00 or 30:00
        #[arg(long)]
        window: Option<String>,
    },

    /// Validate the configuration and list the devices
    CheckConfig {
        /// Print the effective configuration as TOML
        #[arg(long)]
        dump: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    let format: OutputFormat = cli.log_format.parse()?;
    logging::init(LoggingConfig::from_app_config(&config)?.with_format(format))?;

    match cli.command {
        Commands::Run {
            duration,
            record,
            output_dir,
            window,
        } => run(config, duration, record, output_dir, window).await,
        Commands::CheckConfig { dump } => check_config(&config, dump),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => AppConfig::load()
            .with_context(|| format!("loading configuration from {DEFAULT_CONFIG_PATH}"))?,
        None => AppConfig::from_env().context("loading built-in configuration")?,
    };
    Ok(config)
}

fn check_config(config: &AppConfig, dump: bool) -> Result<()> {
    if dump {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }
    let registry = InstrumentRegistry::with_simulated();
    println!("{}", config.application.name);
    for device in config.devices() {
        let known = if registry.create(device).is_some() {
            "ok"
        } else {
            "unknown kind"
        };
        println!(
            "  {:<10} {:<24} every {:>5} ms  [{}]",
            device.id, device.kind, device.poll_interval_ms, known
        );
    }
    let columns: Vec<String> = config
        .auxiliary_columns()
        .into_iter()
        .map(|c| c.label)
        .collect();
    println!("  auxiliary columns: {}", columns.join(", "));
    Ok(())
}

async fn run(
    mut config: AppConfig,
    duration: Option<u64>,
    record: bool,
    output_dir: Option<PathBuf>,
    window: Option<String>,
) -> Result<()> {
    if let Some(dir) = output_dir {
        config.recording.output_dir = dir;
    }
    let output_dir = config.recording.output_dir.clone();

    let registry = InstrumentRegistry::with_simulated();
    let ctx = Arc::new(
        AcquisitionContext::from_config(config, &registry)
            .context("building acquisition context")?,
    );
    if let Some(window) = window {
        ctx.set_history_window(window.parse::<HistoryWindow>()?);
    }

    let events = tokio::spawn(log_events(ctx.subscribe()));

    ctx.start()?;
    ctx.start_render(Arc::new(TracingRenderer))?;
    info!(channels = ?ctx.manifest().labels(), "Acquisition running");

    if record {
        let path = ctx.start_recording_in(&output_dir)?;
        info!(path = %path.display(), "Recording");
    }

    match duration {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Interrupted");
        }
    }

    let shutdown_ctx = Arc::clone(&ctx);
    let result = tokio::task::spawn_blocking(move || shutdown_ctx.shutdown()).await?;
    events.abort();
    if let Err(e) = result {
        error!(error = %e, "Shutdown finished with errors");
        return Err(e.into());
    }
    Ok(())
}

async fn log_events(mut rx: tokio::sync::broadcast::Receiver<EngineEvent>) {
    loop {
        match rx.recv().await {
            Ok(EngineEvent::DeviceStatusChanged { device, status }) => {
                info!(%device, %status, "Device status");
            }
            Ok(EngineEvent::PollFailed {
                device,
                message,
                consecutive,
            }) => warn!(%device, consecutive, "{message}"),
            Ok(EngineEvent::RecordingStarted { path }) => {
                info!(path = %path.display(), "Recording started")
            }
            Ok(EngineEvent::RecordingStopped { path, rows }) => {
                info!(path = %path.display(), rows, "Recording stopped")
            }
            Ok(EngineEvent::RecordingFailed { path, message }) => {
                error!(path = %path.display(), "Recording failed: {message}")
            }
            Err(RecvError::Lagged(missed)) => warn!(missed, "Event listener lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
