//! Structured logging setup.
//!
//! Built on `tracing` and `tracing-subscriber`: one formatting layer (pretty,
//! compact or JSON) filtered by `RUST_LOG` when set, otherwise by the
//! configured level. Every scheduler thread runs inside a `scheduler` span
//! carrying its device id, so thread names plus span fields identify the
//! source of every event.
//!
//! # Example
//! ```no_run
//! use thermocal_daq::{config::AppConfig, logging};
//!
//! let config = AppConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("Rig ready");
//! # Ok::<(), thermocal_daq::error::DaqError>(())
//! ```

use crate::config::AppConfig;
use crate::error::{AppResult, DaqError};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored (for development)
    Pretty,
    /// One line per event
    Compact,
    /// Newline-delimited JSON
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(DaqError::Configuration(format!(
                "Invalid log format '{other}'. Must be one of: pretty, compact, json"
            ))),
        }
    }
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is not set.
    pub level: Level,
    /// Output format.
    pub format: OutputFormat,
    /// Log span creation and close (thread start/stop of each scheduler)
    pub with_span_events: bool,
    /// Include thread names (one per device).
    pub with_thread_names: bool,
    /// Only honored by the pretty format
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Defaults at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Level taken from `application.log_level`.
    pub fn from_app_config(config: &AppConfig) -> AppResult<Self> {
        Ok(Self::new(parse_log_level(&config.application.log_level)?))
    }

    /// Use `format`.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span open/close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Colored output (pretty format only).
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Install the subscriber at the configured `application.log_level`.
pub fn init_from_config(config: &AppConfig) -> AppResult<()> {
    init(LoggingConfig::from_app_config(config)?)
}

/// Install the global subscriber.
///
/// Idempotent: a second call (or a subscriber installed by someone else)
/// is not an error, which keeps tests and embedding simple.
pub fn init(config: LoggingConfig) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));
    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .with_filter(filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .with_filter(filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_thread_names(config.with_thread_names)
            .with_filter(filter)
            .boxed(),
    };

    // Only fails when a global logger or dispatcher is already installed.
    if let Err(e) = tracing_subscriber::registry().with(layer).try_init() {
        tracing::debug!(error = %e, "Logging already initialized");
    }
    Ok(())
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(DaqError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}

fn level_to_filter_string(level: Level) -> String {
    level.as_str().to_lowercase()
}
