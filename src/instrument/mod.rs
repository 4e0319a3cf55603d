//! Instrument capability, registry, and implementations.
//!
//! Drivers are opaque to the engine: it only needs `connect`, `begin`, `poll`
//! and `close`. Wire protocols (SCPI over VISA, UDP, RS232) live behind this
//! trait and are out of scope for this crate; the simulated instruments stand
//! in for them.
use crate::config::DeviceConfig;
use crate::error::InstrumentError;
use std::collections::HashMap;

pub mod mock;
pub mod simulated;

/// Commands sent to an instrument once after connecting (e.g. a SCPI scan setup).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupParameters {
    /// Commands in send order.
    pub commands: Vec<String>,
}

impl SetupParameters {
    /// Setup from a list of commands.
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
        }
    }
}

/// A polled measurement instrument.
///
/// Every method may block for up to the instrument's own I/O timeout. The
/// engine calls them from one dedicated thread per device, never concurrently.
pub trait Instrument: Send {
    /// Short identifier used in logs and events.
    fn name(&self) -> &str;

    /// Channel labels in the order `poll` reports values.
    ///
    /// Only meaningful after `begin`; the primary instrument's list becomes
    /// the channel manifest.
    fn channels(&self) -> Vec<String>;

    /// Open the connection. Returns `false` if the device did not answer.
    fn connect(&mut self) -> bool;

    /// Configure the device for polling.
    fn begin(&mut self, setup: &SetupParameters) -> Result<(), InstrumentError>;

    /// Take one reading per channel, in `channels()` order.
    fn poll(&mut self) -> Result<Vec<f64>, InstrumentError>;

    /// Release the connection. Called once, after the last poll.
    fn close(&mut self) -> Result<(), InstrumentError>;
}

type InstrumentFactory = Box<dyn Fn(&DeviceConfig) -> Box<dyn Instrument> + Send + Sync>;

/// A registry of instrument kinds that can be built from configuration.
pub struct InstrumentRegistry {
    factories: HashMap<String, InstrumentFactory>,
}

impl Default for InstrumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry preloaded with the simulated instruments.
    pub fn with_simulated() -> Self {
        let mut registry = Self::new();
        registry.register("simulated_multiplexer", |cfg| {
            Box::new(simulated::SimulatedMultiplexer::from_config(cfg))
        });
        registry.register("simulated_bath", |cfg| {
            Box::new(simulated::SimulatedBath::from_config(cfg))
        });
        registry.register("simulated_pt104", |cfg| {
            Box::new(simulated::SimulatedPt104::from_config(cfg))
        });
        registry
    }

    /// Registers a new instrument kind.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&DeviceConfig) -> Box<dyn Instrument> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    /// Creates an instrument for `config.kind`, if that kind is registered.
    pub fn create(&self, config: &DeviceConfig) -> Option<Box<dyn Instrument>> {
        self.factories.get(&config.kind).map(|f| f(config))
    }

    /// Registered kinds, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}
