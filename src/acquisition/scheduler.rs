//! One polling thread per device.
//!
//! The scheduler owns a dedicated OS thread that polls its instrument on a
//! fixed nominal interval and hands every result to a [`TickHandler`]. The
//! thread is the only poller, so exactly one poll is in flight per device.
//!
//! # Overrun policy
//!
//! Deadlines are `start + k * interval`. If a poll returns after the next
//! deadline, every deadline already in the past is skipped and counted in
//! [`SchedulerStats::skipped_ticks`]; ticks are never queued.
//!
//! # Shutdown
//!
//! `stop()` is `halt()` + `join(timeout)` + `close_device(timeout)`. The
//! engine calls the three steps separately so that every scheduler is halted
//! before any of them is waited on.

use super::{publish, DeviceStatus, EngineEvent, EventSender};
use crate::core::{Latch, Reading, Tick, TickClock, TickHandler, DEFAULT_OVERFLOW_THRESHOLD};
use crate::error::{AppResult, DaqError, JoinFailure};
use crate::instrument::Instrument;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

/// Failure budget and timeouts of one scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Consecutive failed polls before the device is marked unavailable.
    pub max_consecutive_failures: u32,
    /// Readings with a larger magnitude become NaN.
    pub overflow_threshold: f64,
    /// Bound used by [`AcquisitionScheduler::stop`] for each wait.
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            overflow_threshold: DEFAULT_OVERFLOW_THRESHOLD,
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

/// Counters of one scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Ticks delivered to the handler, failed ones included.
    pub ticks: u64,
    /// Failed polls in total.
    pub failures: u64,
    /// Failed polls since the last success.
    pub consecutive_failures: u64,
    /// Deadlines dropped because a poll overran them.
    pub skipped_ticks: u64,
}

/// State shared with the polling thread.
struct Shared {
    device_id: Arc<str>,
    stop: Latch,
    finished: Latch,
    status: Mutex<DeviceStatus>,
    ticks: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU64,
    skipped_ticks: AtomicU64,
    events: EventSender,
}

impl Shared {
    fn set_status(&self, status: DeviceStatus) {
        {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            *current = status;
        }
        info!(device = %self.device_id, %status, "Device status changed");
        publish(
            &self.events,
            EngineEvent::DeviceStatusChanged {
                device: self.device_id.to_string(),
                status,
            },
        );
    }
}

/// Periodic poller of one instrument.
pub struct AcquisitionScheduler {
    config: SchedulerConfig,
    channel_count: usize,
    clock: TickClock,
    instrument: Arc<Mutex<Box<dyn Instrument>>>,
    handler: Arc<dyn TickHandler>,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl AcquisitionScheduler {
    /// Wrap a connected and configured instrument.
    ///
    /// `channel_count` fixes how many readings every tick carries; a poll
    /// reporting fewer values is padded with NaN.
    pub fn new(
        instrument: Box<dyn Instrument>,
        channel_count: usize,
        handler: Arc<dyn TickHandler>,
        clock: TickClock,
        config: SchedulerConfig,
        events: EventSender,
    ) -> Self {
        let device_id: Arc<str> = Arc::from(instrument.name());
        Self {
            config,
            channel_count,
            clock,
            instrument: Arc::new(Mutex::new(instrument)),
            handler,
            shared: Arc::new(Shared {
                device_id,
                stop: Latch::default(),
                finished: Latch::default(),
                status: Mutex::new(DeviceStatus::Idle),
                ticks: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                consecutive_failures: AtomicU64::new(0),
                skipped_ticks: AtomicU64::new(0),
                events,
            }),
            thread: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Instrument name, used as the device id.
    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    /// Current lifecycle status.
    pub fn status(&self) -> DeviceStatus {
        *self.shared.status.lock()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> SchedulerStats {
        let s = &self.shared;
        SchedulerStats {
            ticks: s.ticks.load(Ordering::SeqCst),
            failures: s.failures.load(Ordering::SeqCst),
            consecutive_failures: s.consecutive_failures.load(Ordering::SeqCst),
            skipped_ticks: s.skipped_ticks.load(Ordering::SeqCst),
        }
    }

    /// Take the device out of service before it was ever started.
    pub fn mark_unavailable(&self) {
        self.shared.set_status(DeviceStatus::Unavailable);
    }

    /// Start polling every `interval`, first poll immediately.
    pub fn start(&self, interval: Duration) -> AppResult<()> {
        if interval.is_zero() {
            return Err(DaqError::Configuration(format!(
                "Device '{}': poll interval must be non-zero",
                self.device_id()
            )));
        }
        if self.status() == DeviceStatus::Unavailable {
            return Err(DaqError::DeviceUnavailable(self.device_id().to_string()));
        }
        let mut thread_slot = self.thread.lock();
        if thread_slot.is_some() || self.shared.stop.is_set() {
            return Err(DaqError::Configuration(format!(
                "Device '{}': scheduler already started",
                self.device_id()
            )));
        }

        let worker = PollWorker {
            shared: Arc::clone(&self.shared),
            instrument: Arc::clone(&self.instrument),
            handler: Arc::clone(&self.handler),
            clock: self.clock,
            interval,
            channel_count: self.channel_count,
            max_consecutive_failures: u64::from(self.config.max_consecutive_failures.max(1)),
            overflow_threshold: self.config.overflow_threshold,
        };

        self.shared.set_status(DeviceStatus::Running);
        let handle = thread::Builder::new()
            .name(format!("poll-{}", self.device_id()))
            .spawn(move || worker.run())
            .map_err(|e| {
                self.shared.set_status(DeviceStatus::Stopped);
                DaqError::Io(e)
            })?;
        *thread_slot = Some(handle);

        info!(device = %self.device_id(), interval_ms = interval.as_millis() as u64, "Started polling");
        Ok(())
    }

    /// Cancel all future ticks. Does not wait for an in-flight poll.
    pub fn halt(&self) {
        self.shared.stop.set();
    }

    /// Wait up to `timeout` for the polling thread to finish.
    ///
    /// A poll still blocked on I/O after the timeout is abandoned: the thread
    /// is detached and an error is returned.
    pub fn join(&self, timeout: Duration) -> AppResult<()> {
        let Some(handle) = self.thread.lock().take() else {
            return Ok(());
        };
        if !self.shared.finished.wait_until(Instant::now() + timeout) {
            warn!(device = %self.device_id(), ?timeout, "Poll still in flight, detaching thread");
            return Err(self.join_error(JoinFailure::TimedOut(timeout)));
        }
        if handle.join().is_err() {
            error!(device = %self.device_id(), "Polling thread panicked");
            return Err(self.join_error(JoinFailure::Panicked));
        }
        debug!(device = %self.device_id(), "Polling thread joined");
        Ok(())
    }

    fn join_error(&self, failure: JoinFailure) -> DaqError {
        DaqError::ThreadJoin {
            thread: format!("poll-{}", self.device_id()),
            failure,
        }
    }

    /// Close the instrument once. Waits up to `timeout` for the poll lock.
    pub fn close_device(&self, timeout: Duration) -> AppResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(mut instrument) = self.instrument.try_lock_for(timeout) else {
            return Err(DaqError::Instrument(format!(
                "Device '{}': busy, could not close within {:?}",
                self.device_id(),
                timeout
            )));
        };
        self.closed.store(true, Ordering::SeqCst);
        if self.status() != DeviceStatus::Unavailable {
            self.shared.set_status(DeviceStatus::Stopped);
        }
        instrument.close().map_err(|e| {
            DaqError::Instrument(format!("Device '{}': close failed: {e}", self.device_id()))
        })?;
        info!(device = %self.device_id(), "Device closed");
        Ok(())
    }

    /// Halt, wait for the in-flight poll, then close the device.
    pub fn stop(&self) -> AppResult<()> {
        let timeout = self.config.shutdown_timeout;
        self.halt();
        let joined = self.join(timeout);
        let closed = self.close_device(timeout);
        joined.and(closed)
    }

    /// True while the polling thread is alive.
    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some() && !self.shared.finished.is_set()
    }
}

impl Drop for AcquisitionScheduler {
    fn drop(&mut self) {
        if self.thread.lock().is_some() || !self.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.stop() {
                error!(device = %self.device_id(), error = %e, "Error stopping scheduler on drop");
            }
        }
    }
}

/// Everything the polling thread owns.
struct PollWorker {
    shared: Arc<Shared>,
    instrument: Arc<Mutex<Box<dyn Instrument>>>,
    handler: Arc<dyn TickHandler>,
    clock: TickClock,
    interval: Duration,
    channel_count: usize,
    max_consecutive_failures: u64,
    overflow_threshold: f64,
}

impl PollWorker {
    fn run(self) {
        let span = info_span!("scheduler", device = %self.shared.device_id);
        let _enter = span.enter();

        let mut deadline = Instant::now();
        let mut sequence = 0u64;
        while !self.shared.stop.wait_until(deadline) {
            let tick = self.poll_once(sequence);
            sequence += 1;
            self.handler.on_tick(&tick);
            self.shared.ticks.fetch_add(1, Ordering::SeqCst);

            if tick.failed
                && self.shared.consecutive_failures.load(Ordering::SeqCst)
                    >= self.max_consecutive_failures
            {
                error!(
                    failures = self.max_consecutive_failures,
                    "Too many consecutive poll failures, halting device"
                );
                self.shared.set_status(DeviceStatus::Unavailable);
                break;
            }

            deadline += self.interval;
            let now = Instant::now();
            let mut skipped = 0u64;
            while deadline < now {
                deadline += self.interval;
                skipped += 1;
            }
            if skipped > 0 {
                self.shared.skipped_ticks.fetch_add(skipped, Ordering::SeqCst);
                debug!(skipped, "Poll overran its interval, skipping ticks");
            }
        }

        self.shared.finished.set();
        debug!("Polling thread exiting");
    }

    fn poll_once(&self, sequence: u64) -> Tick {
        let device_id = &self.shared.device_id;
        let timestamp = self.clock.now();
        let result = self.instrument.lock().poll();

        match result {
            Ok(values) => {
                self.shared.consecutive_failures.store(0, Ordering::SeqCst);
                if values.len() != self.channel_count {
                    debug!(
                        expected = self.channel_count,
                        got = values.len(),
                        "Poll returned an unexpected number of values"
                    );
                }
                let readings = (0..self.channel_count)
                    .map(|channel| {
                        let raw = values.get(channel).copied().unwrap_or(f64::NAN);
                        Reading::new(
                            Arc::clone(device_id),
                            channel,
                            timestamp,
                            raw,
                            self.overflow_threshold,
                        )
                    })
                    .collect();
                Tick {
                    device_id: Arc::clone(device_id),
                    sequence,
                    timestamp,
                    readings,
                    failed: false,
                }
            }
            Err(source) => {
                let err = DaqError::transient(device_id.to_string(), source);
                self.shared.failures.fetch_add(1, Ordering::SeqCst);
                let consecutive = self.shared.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(error = %err, consecutive, "Poll failed");
                publish(
                    &self.shared.events,
                    EngineEvent::PollFailed {
                        device: device_id.to_string(),
                        message: err.to_string(),
                        consecutive: u32::try_from(consecutive).unwrap_or(u32::MAX),
                    },
                );
                let readings = (0..self.channel_count)
                    .map(|channel| Reading::invalid(Arc::clone(device_id), channel, timestamp))
                    .collect();
                Tick {
                    device_id: Arc::clone(device_id),
                    sequence,
                    timestamp,
                    readings,
                    failed: true,
                }
            }
        }
    }
}
