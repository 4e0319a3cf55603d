//! Simulated instruments that stand in for the calibration rig's hardware.
//!
//! - `SimulatedMultiplexer` - Keysight 3497xA style scanner reading thermistor
//!   resistances, with an occasional overload sentinel
//! - `SimulatedBath` - PolyScience bath reporting two probe temperatures
//! - `SimulatedPt104` - Picotech PT-104 platinum probe logger, one channel
//!
//! All of them drift slowly around a set point with a little noise so charts
//! and logs look like the real thing.
use crate::config::DeviceConfig;
use crate::error::InstrumentError;
use crate::instrument::{Instrument, SetupParameters};
use rand::Rng;
use tracing::{debug, info};

/// Value a Keysight 3497xA reports for an overloaded / open channel.
pub const OVERLOAD_READING: f64 = 9.9e37;

/// Slow first-order drift toward a set point.
#[derive(Debug, Clone)]
struct Drift {
    value: f64,
    setpoint: f64,
    noise: f64,
}

impl Drift {
    fn new(setpoint: f64, noise: f64) -> Self {
        Self {
            value: setpoint,
            setpoint,
            noise,
        }
    }

    fn step(&mut self, rng: &mut impl Rng) -> f64 {
        self.value += 0.05 * (self.setpoint - self.value) + rng.gen_range(-1.0..=1.0) * self.noise;
        self.value
    }
}

/// Thermistor resistance (Ohm) at `temp_c` for a 10 kOhm NTC with B = 3950 K.
fn ntc_resistance(temp_c: f64) -> f64 {
    const R25: f64 = 10_000.0;
    const BETA: f64 = 3950.0;
    let kelvin = temp_c + 273.15;
    R25 * (BETA * (1.0 / kelvin - 1.0 / 298.15)).exp()
}

/// Multi-channel resistance scanner.
pub struct SimulatedMultiplexer {
    name: String,
    channels: Vec<String>,
    temperature: Drift,
    connected: bool,
    scanning: bool,
    /// Every n-th scan reports an overload on the last channel (0 = never).
    overload_every: u64,
    scans: u64,
}

impl SimulatedMultiplexer {
    /// A scanner reporting `channels` around 25 degC.
    pub fn new(name: impl Into<String>, channels: Vec<String>) -> Self {
        Self {
            name: name.into(),
            channels,
            temperature: Drift::new(25.0, 0.02),
            connected: false,
            scanning: false,
            overload_every: 0,
            scans: 0,
        }
    }

    /// Scanner built from a device configuration.
    pub fn from_config(config: &DeviceConfig) -> Self {
        let channels = if config.channels.is_empty() {
            vec!["101".to_string()]
        } else {
            config.channels.clone()
        };
        Self::new(config.id.clone(), channels).with_overload_every(config.overload_every)
    }

    /// Report an overload sentinel on the last channel every `n` scans.
    pub fn with_overload_every(mut self, n: u64) -> Self {
        self.overload_every = n;
        self
    }
}

impl Instrument for SimulatedMultiplexer {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> Vec<String> {
        self.channels.clone()
    }

    fn connect(&mut self) -> bool {
        info!(device = %self.name, "Connecting to simulated multiplexer");
        self.connected = true;
        true
    }

    fn begin(&mut self, setup: &SetupParameters) -> Result<(), InstrumentError> {
        if !self.connected {
            return Err(InstrumentError::NotConnected);
        }
        for command in &setup.commands {
            debug!(device = %self.name, command = %command, "Setup command");
        }
        self.scanning = true;
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<f64>, InstrumentError> {
        if !self.connected || !self.scanning {
            return Err(InstrumentError::NotConnected);
        }
        self.scans += 1;
        let mut rng = rand::thread_rng();
        let temp = self.temperature.step(&mut rng);
        let n = self.channels.len();
        let overload = self.overload_every > 0 && self.scans % self.overload_every == 0;
        Ok((0..n)
            .map(|i| {
                if overload && i + 1 == n {
                    OVERLOAD_READING
                } else {
                    ntc_resistance(temp + 0.1 * i as f64) * (1.0 + rng.gen_range(-1e-4..=1e-4))
                }
            })
            .collect())
    }

    fn close(&mut self) -> Result<(), InstrumentError> {
        info!(device = %self.name, "Closing simulated multiplexer");
        self.scanning = false;
        self.connected = false;
        Ok(())
    }
}

/// Temperature bath with an internal (P1) and external (P2) probe.
pub struct SimulatedBath {
    name: String,
    internal: Drift,
    external: Drift,
    connected: bool,
}

impl SimulatedBath {
    /// A bath settling at `setpoint_c`.
    pub fn new(name: impl Into<String>, setpoint_c: f64) -> Self {
        Self {
            name: name.into(),
            internal: Drift::new(setpoint_c, 0.01),
            external: Drift::new(setpoint_c - 0.2, 0.02),
            connected: false,
        }
    }

    /// Bath at 25 degC.
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(config.id.clone(), 25.0)
    }
}

impl Instrument for SimulatedBath {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> Vec<String> {
        vec!["P1".to_string(), "P2".to_string()]
    }

    fn connect(&mut self) -> bool {
        info!(device = %self.name, "Connecting to simulated bath");
        self.connected = true;
        true
    }

    fn begin(&mut self, _setup: &SetupParameters) -> Result<(), InstrumentError> {
        if self.connected {
            Ok(())
        } else {
            Err(InstrumentError::NotConnected)
        }
    }

    fn poll(&mut self) -> Result<Vec<f64>, InstrumentError> {
        if !self.connected {
            return Err(InstrumentError::NotConnected);
        }
        let mut rng = rand::thread_rng();
        Ok(vec![
            self.internal.step(&mut rng),
            self.external.step(&mut rng),
        ])
    }

    fn close(&mut self) -> Result<(), InstrumentError> {
        self.connected = false;
        Ok(())
    }
}

/// Single-channel platinum resistance thermometer logger.
pub struct SimulatedPt104 {
    name: String,
    probe: Drift,
    connected: bool,
    converting: bool,
}

impl SimulatedPt104 {
    /// A logger reading `temperature_c`.
    pub fn new(name: impl Into<String>, temperature_c: f64) -> Self {
        Self {
            name: name.into(),
            probe: Drift::new(temperature_c, 0.002),
            connected: false,
            converting: false,
        }
    }

    /// Logger at 24.9 degC.
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(config.id.clone(), 24.9)
    }
}

impl Instrument for SimulatedPt104 {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> Vec<String> {
        vec!["ch1".to_string()]
    }

    fn connect(&mut self) -> bool {
        info!(device = %self.name, "Connecting to simulated PT-104");
        self.connected = true;
        true
    }

    fn begin(&mut self, _setup: &SetupParameters) -> Result<(), InstrumentError> {
        if !self.connected {
            return Err(InstrumentError::NotConnected);
        }
        self.converting = true;
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<f64>, InstrumentError> {
        if !self.converting {
            return Err(InstrumentError::NotConnected);
        }
        let mut rng = rand::thread_rng();
        Ok(vec![self.probe.step(&mut rng)])
    }

    fn close(&mut self) -> Result<(), InstrumentError> {
        self.converting = false;
        self.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ntc_resistance_is_nominal_at_25c() {
        assert!((ntc_resistance(25.0) - 10_000.0).abs() < 1e-6);
        assert!(ntc_resistance(30.0) < ntc_resistance(20.0));
    }

    #[test]
    fn multiplexer_requires_begin() {
        let mut mux = SimulatedMultiplexer::new("mux", vec!["101".into()]);
        assert!(matches!(mux.poll(), Err(InstrumentError::NotConnected)));
        assert!(mux.connect());
        assert!(mux.begin(&SetupParameters::default()).is_ok());
        let values = mux.poll().expect("poll after begin");
        assert_eq!(values.len(), 1);
        assert!(values[0] > 5_000.0 && values[0] < 20_000.0);
    }

    #[test]
    fn multiplexer_injects_overload_on_last_channel() {
        let mut mux = SimulatedMultiplexer::new("mux", vec!["101".into(), "102".into()])
            .with_overload_every(2);
        mux.connect();
        mux.begin(&SetupParameters::default()).expect("begin");
        let first = mux.poll().expect("poll");
        let second = mux.poll().expect("poll");
        assert!(first[1] < OVERLOAD_READING);
        assert_eq!(second[1], OVERLOAD_READING);
        assert!(second[0] < OVERLOAD_READING);
    }

    #[test]
    fn bath_and_pt104_report_their_channels() {
        let mut bath = SimulatedBath::new("bath", 30.0);
        bath.connect();
        let temps = bath.poll().expect("poll");
        assert_eq!(temps.len(), bath.channels().len());
        assert!((temps[0] - 30.0).abs() < 1.0);

        let mut pt104 = SimulatedPt104::new("pt104", 24.9);
        pt104.connect();
        assert!(pt104.poll().is_err());
        pt104.begin(&SetupParameters::default()).expect("begin");
        assert_eq!(pt104.poll().expect("poll").len(), 1);
        pt104.close().expect("close");
        assert!(pt104.poll().is_err());
    }

    #[test]
    fn configured_multiplexer_reports_overloads() {
        let mut config = DeviceConfig::new("mux", "simulated_multiplexer");
        config.overload_every = 3;
        let mut mux = SimulatedMultiplexer::from_config(&config);
        assert_eq!(mux.channels(), vec!["101".to_string()]);
        mux.connect();
        mux.begin(&SetupParameters::default()).expect("begin");
        let readings: Vec<f64> = (0..6).map(|_| mux.poll().expect("poll")[0]).collect();
        let overloads: Vec<usize> = readings
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v == OVERLOAD_READING)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(overloads, vec![2, 5]);
    }
}
