//! Configuration system using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/default.toml` unless another path is given)
//! 2. environment variables prefixed with `THERMOCAL_`, nested keys separated
//!    by a double underscore
//!
//! # Example
//! ```no_run
//! use thermocal_daq::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), thermocal_daq::error::DaqError>(())
//! ```
//!
//! Everything here is fixed once the engine is built: the channel manifest,
//! the buffer capacity and every device's poll interval.

use crate::core::DEFAULT_OVERFLOW_THRESHOLD;
use crate::data::recording::AuxColumn;
use crate::error::DaqError;
use crate::instrument::SetupParameters;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Buffering, refresh and shutdown settings
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// The multi-channel instrument whose ticks drive row merging
    pub primary: DeviceConfig,
    /// Slower instruments merged by sample-and-hold
    #[serde(default)]
    pub auxiliary: Vec<DeviceConfig>,
    /// Log file settings
    #[serde(default)]
    pub recording: RecordingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Engine-wide acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Samples kept per chart history
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Render refresh period in milliseconds
    #[serde(default = "default_render_interval")]
    pub render_interval_ms: u64,
    /// Bound on each shutdown wait in milliseconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    /// Capacity of the engine event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// One instrument and how to poll it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier
    pub id: String,
    /// Instrument kind, resolved through the instrument registry
    pub kind: String,
    /// Nominal poll period in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Consecutive failed polls before the device is marked unavailable
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    /// Readings with a larger magnitude are treated as invalid
    #[serde(default)]
    pub overflow_threshold: Option<f64>,
    /// Commands sent once by `begin`
    #[serde(default)]
    pub setup: Vec<String>,
    /// Channel labels (used by instruments that cannot report their own)
    #[serde(default)]
    pub channels: Vec<String>,
    /// Log columns fed by this device, one per channel (auxiliary devices only)
    #[serde(default)]
    pub columns: Vec<AuxColumn>,
    /// Simulated multiplexer only: report an overload on the last channel
    /// every n-th scan (0 = never)
    #[serde(default)]
    pub overload_every: u64,
}

/// Log file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Directory for log files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// File name prefix; a `yyMMdd_HHmmss.txt` timestamp is appended
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_buffer_capacity() -> usize {
    1800
}

fn default_render_interval() -> u64 {
    1000
}

fn default_shutdown_timeout() -> u64 {
    2000
}

fn default_event_capacity() -> usize {
    256
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_max_failures() -> u32 {
    5
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_file_prefix() -> String {
    "calib_thermistors_".to_string()
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            render_interval_ms: default_render_interval(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            file_prefix: default_file_prefix(),
        }
    }
}

impl DeviceConfig {
    /// A device with default polling settings.
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            poll_interval_ms: default_poll_interval(),
            max_consecutive_failures: default_max_failures(),
            overflow_threshold: None,
            setup: Vec::new(),
            channels: Vec::new(),
            columns: Vec::new(),
            overload_every: 0,
        }
    }

    /// Nominal poll period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Configured overflow threshold, or the 3497xA default.
    pub fn overflow_threshold(&self) -> f64 {
        self.overflow_threshold.unwrap_or(DEFAULT_OVERFLOW_THRESHOLD)
    }

    /// Setup commands handed to `Instrument::begin`.
    pub fn setup_parameters(&self) -> SetupParameters {
        SetupParameters::new(self.setup.iter().cloned())
    }
}

/// The thermistor calibration rig: a Keysight 3497xA multiplexer scanning
/// one resistance channel, a PolyScience bath and a PT-104 logger.
impl Default for AppConfig {
    fn default() -> Self {
        let scan_list = "(@101)";
        let mut mux = DeviceConfig::new("mux", "simulated_multiplexer");
        mux.setup = vec![
            format!("rout:open {scan_list}"),
            format!("conf:res 1e5,{scan_list}"),
            format!("sens:res:nplc 1,{scan_list}"),
            format!("rout:scan {scan_list}"),
        ];
        mux.channels = vec!["101".to_string()];
        mux.overload_every = 60;

        let mut bath = DeviceConfig::new("bath", "simulated_bath");
        bath.columns = vec![
            AuxColumn::new("P1_temp[degC]", 2),
            AuxColumn::new("P2_temp[degC]", 2),
        ];

        let mut pt104 = DeviceConfig::new("pt104", "simulated_pt104");
        pt104.columns = vec![AuxColumn::new("PT104_Ch1[degC]", 3)];

        Self {
            application: ApplicationConfig {
                name: "Calibration thermistors".to_string(),
                log_level: default_log_level(),
            },
            acquisition: AcquisitionConfig::default(),
            primary: mux,
            auxiliary: vec![bath, pt104],
            recording: RecordingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default file and environment variables
    ///
    /// Environment variables override the file with prefix THERMOCAL_
    /// Example: THERMOCAL_APPLICATION__LOG_LEVEL=debug
    pub fn load() -> Result<Self, DaqError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, DaqError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("THERMOCAL_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults overlaid with environment variables only.
    pub fn from_env() -> Result<Self, DaqError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed("THERMOCAL_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), DaqError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.acquisition.buffer_capacity == 0 {
            return Err(DaqError::Configuration(
                "buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.acquisition.render_interval_ms == 0 {
            return Err(DaqError::Configuration(
                "render_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.acquisition.event_capacity == 0 {
            return Err(DaqError::Configuration(
                "event_capacity must be at least 1".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for device in self.devices() {
            if !ids.insert(device.id.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate device ID: {}",
                    device.id
                )));
            }
            if device.poll_interval_ms == 0 {
                return Err(DaqError::Configuration(format!(
                    "Device '{}': poll_interval_ms must be non-zero",
                    device.id
                )));
            }
            if device.max_consecutive_failures == 0 {
                return Err(DaqError::Configuration(format!(
                    "Device '{}': max_consecutive_failures must be at least 1",
                    device.id
                )));
            }
            if let Some(threshold) = device.overflow_threshold {
                if threshold.is_nan() || threshold <= 0.0 {
                    return Err(DaqError::Configuration(format!(
                        "Device '{}': overflow_threshold must be positive",
                        device.id
                    )));
                }
            }
        }

        for device in &self.auxiliary {
            if device.columns.is_empty() {
                return Err(DaqError::Configuration(format!(
                    "Auxiliary device '{}' must declare at least one column",
                    device.id
                )));
            }
        }

        Ok(())
    }

    /// Primary device first, then auxiliaries in configuration order.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceConfig> {
        std::iter::once(&self.primary).chain(self.auxiliary.iter())
    }

    /// Every auxiliary log column, in device then channel order.
    pub fn auxiliary_columns(&self) -> Vec<AuxColumn> {
        self.auxiliary
            .iter()
            .flat_map(|device| device.columns.iter().cloned())
            .collect()
    }

    /// The effective configuration as TOML, in the layout `load_from` reads.
    pub fn to_toml_string(&self) -> Result<String, DaqError> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("Cannot serialize configuration: {e}")))
    }

    /// Render refresh period.
    pub fn render_interval(&self) -> Duration {
        Duration::from_millis(self.acquisition.render_interval_ms)
    }

    /// Bound on each shutdown wait.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.acquisition.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.acquisition.buffer_capacity, 1800);
        assert_eq!(config.devices().count(), 3);
        let labels: Vec<String> = config
            .auxiliary_columns()
            .into_iter()
            .map(|c| c.label)
            .collect();
        assert_eq!(
            labels,
            vec!["P1_temp[degC]", "P2_temp[degC]", "PT104_Ch1[degC]"]
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.application.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.auxiliary[0].id = "mux".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.auxiliary[1].poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.auxiliary[1].columns.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.primary.overflow_threshold = Some(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_toml_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rig.toml");
        std::fs::write(
            &path,
            r#"
            [application]
            name = "Test rig"

            [primary]
            id = "mux"
            kind = "simulated_multiplexer"
            poll_interval_ms = 500
            channels = ["101", "102"]

            [[auxiliary]]
            id = "pt104"
            kind = "simulated_pt104"
            poll_interval_ms = 720
            columns = [{ label = "PT104_Ch1[degC]", decimals = 3 }]
            "#,
        )
        .expect("write config");

        let config = AppConfig::load_from(&path).expect("config should load");
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.primary.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.primary.max_consecutive_failures, 5);
        assert_eq!(config.auxiliary[0].columns[0].decimals, 3);
        assert_eq!(config.recording.file_prefix, "calib_thermistors_");
    }

    #[test]
    fn serialized_defaults_load_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("defaults.toml");
        let text = AppConfig::default().to_toml_string().expect("serialize");
        std::fs::write(&path, text).expect("write config");

        let config = AppConfig::load_from(&path).expect("config should load");
        assert_eq!(config.primary.setup.len(), 4);
        assert_eq!(config.primary.overflow_threshold, None);
        assert_eq!(config.auxiliary_columns().len(), 3);
        assert_eq!(config.auxiliary[1].columns[0].decimals, 3);
        assert_eq!(config.primary.overload_every, 60);
        assert_eq!(config.auxiliary[0].overload_every, 0);
    }
}
