//! A scripted instrument for tests and dry runs.
//!
//! `ScriptedInstrument` replays a queue of poll outcomes, optionally blocking
//! for a fixed delay on each poll, and records what the engine did to it in a
//! shared [`ScriptCounters`] so tests can inspect it after the instrument has
//! been moved into a scheduler.
use crate::error::InstrumentError;
use crate::instrument::{Instrument, SetupParameters};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One scripted poll result.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Poll returns these values.
    Values(Vec<f64>),
    /// Poll fails with a timeout.
    Fail,
}

/// Counters shared between a [`ScriptedInstrument`] and the test that built it.
#[derive(Debug, Default)]
pub struct ScriptCounters {
    polls: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    began: AtomicBool,
    closed: AtomicBool,
    setup: Mutex<Vec<String>>,
}

impl ScriptCounters {
    /// Completed polls.
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }

    /// Highest number of polls observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// True once `begin` succeeded.
    pub fn began(&self) -> bool {
        self.began.load(Ordering::SeqCst)
    }

    /// True once `close` was called.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Setup commands received by `begin`.
    pub fn setup_commands(&self) -> Vec<String> {
        self.setup.lock().clone()
    }
}

/// An [`Instrument`] replaying scripted poll outcomes.
pub struct ScriptedInstrument {
    name: String,
    channels: Vec<String>,
    script: VecDeque<PollOutcome>,
    /// Returned once the script runs out.
    fallback: PollOutcome,
    delay: Duration,
    connects: bool,
    counters: Arc<ScriptCounters>,
}

impl ScriptedInstrument {
    /// An instrument answering every poll with `channels.len()` zeros.
    pub fn new<I, S>(name: impl Into<String>, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels: Vec<String> = channels.into_iter().map(Into::into).collect();
        let fallback = PollOutcome::Values(vec![0.0; channels.len()]);
        Self {
            name: name.into(),
            channels,
            script: VecDeque::new(),
            fallback,
            delay: Duration::ZERO,
            connects: true,
            counters: Arc::new(ScriptCounters::default()),
        }
    }

    /// Queue outcomes returned by successive polls.
    pub fn with_script(mut self, script: impl IntoIterator<Item = PollOutcome>) -> Self {
        self.script.extend(script);
        self
    }

    /// Outcome returned after the script is exhausted.
    pub fn with_fallback(mut self, outcome: PollOutcome) -> Self {
        self.fallback = outcome;
        self
    }

    /// Block every poll for `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make `connect` report that the device did not answer.
    pub fn unreachable(mut self) -> Self {
        self.connects = false;
        self
    }

    /// Shared counters, readable after the instrument was moved.
    pub fn counters(&self) -> Arc<ScriptCounters> {
        Arc::clone(&self.counters)
    }
}

impl Instrument for ScriptedInstrument {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> Vec<String> {
        self.channels.clone()
    }

    fn connect(&mut self) -> bool {
        self.connects
    }

    fn begin(&mut self, setup: &SetupParameters) -> Result<(), InstrumentError> {
        if !self.connects {
            return Err(InstrumentError::NotConnected);
        }
        *self.counters.setup.lock() = setup.commands.clone();
        self.counters.began.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<f64>, InstrumentError> {
        let counters = &self.counters;
        let running = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        counters.polls.fetch_add(1, Ordering::SeqCst);
        counters.in_flight.fetch_sub(1, Ordering::SeqCst);

        let outcome = self
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match outcome {
            PollOutcome::Values(values) => Ok(values),
            PollOutcome::Fail => Err(InstrumentError::Timeout {
                timeout_ms: self.delay.as_millis() as u64,
            }),
        }
    }

    fn close(&mut self) -> Result<(), InstrumentError> {
        self.counters.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
