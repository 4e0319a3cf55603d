//! Core traits and data types shared by the schedulers, the router and the sinks.
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Magnitude above which a Keysight 3497xA reading means "overload / open circuit".
pub const DEFAULT_OVERFLOW_THRESHOLD: f64 = 9.8e37;

/// Monotonic tick-time source shared by every component of one engine.
///
/// Timestamps are `Duration` offsets from the clock's epoch, so they are
/// cheap to copy, totally ordered, and easy to fabricate in tests.
#[derive(Debug, Clone, Copy)]
pub struct TickClock {
    epoch: Instant,
}

impl TickClock {
    /// A clock whose epoch is now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Current tick-time.
    pub fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// The instant tick-time zero corresponds to.
    pub fn epoch(&self) -> Instant {
        self.epoch
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot signal: set once, waited on by many threads.
#[derive(Debug, Default)]
pub struct Latch {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    /// Set the latch and wake every waiter.
    pub fn set(&self) {
        *self.set.lock() = true;
        self.cond.notify_all();
    }

    /// True once `set` was called.
    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Wait until set or `deadline`. Returns whether the latch is set.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut set = self.set.lock();
        while !*set {
            if self.cond.wait_until(&mut set, deadline).timed_out() {
                break;
            }
        }
        *set
    }
}

/// Replace invalid or overflow sentinel values with NaN.
///
/// Non-finite values and anything whose magnitude exceeds `threshold` are
/// treated as "no reading".
pub fn normalize_sentinel(value: f64, threshold: f64) -> f64 {
    if !value.is_finite() || value.abs() > threshold {
        f64::NAN
    } else {
        value
    }
}

/// A single reading of one channel of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Device that produced the reading.
    pub device_id: Arc<str>,
    /// Zero-based channel index.
    pub channel: usize,
    /// Tick-time of the poll.
    pub timestamp: Duration,
    /// Reading, NaN when invalid.
    pub value: f64,
    /// False for sentinels and failed polls.
    pub valid: bool,
}

impl Reading {
    /// A successful reading, with sentinel values already folded to NaN.
    pub fn new(
        device_id: Arc<str>,
        channel: usize,
        timestamp: Duration,
        raw: f64,
        threshold: f64,
    ) -> Self {
        let value = normalize_sentinel(raw, threshold);
        Self {
            device_id,
            channel,
            timestamp,
            valid: !value.is_nan(),
            value,
        }
    }

    /// Placeholder emitted when a poll failed.
    pub fn invalid(device_id: Arc<str>, channel: usize, timestamp: Duration) -> Self {
        Self {
            device_id,
            channel,
            timestamp,
            value: f64::NAN,
            valid: false,
        }
    }
}

/// Output of one poll cycle of one device.
#[derive(Debug, Clone)]
pub struct Tick {
    /// Device that was polled.
    pub device_id: Arc<str>,
    /// Zero-based index of the poll within the scheduler's lifetime.
    pub sequence: u64,
    /// Tick-time at which the poll started.
    pub timestamp: Duration,
    /// One reading per channel, in channel order.
    pub readings: Vec<Reading>,
    /// Set when the poll failed and `readings` are placeholders.
    pub failed: bool,
}

impl Tick {
    /// Value of `channel`, NaN if the device did not report it.
    pub fn value(&self, channel: usize) -> f64 {
        self.readings
            .iter()
            .find(|r| r.channel == channel)
            .map_or(f64::NAN, |r| r.value)
    }
}

/// Per-tick postprocessing capability invoked by a scheduler after each poll.
///
/// Called on the scheduler's own thread, strictly sequentially for one device.
pub trait TickHandler: Send + Sync {
    /// Handle one completed poll.
    fn on_tick(&self, tick: &Tick);
}

/// The immutable, ordered list of primary channel labels.
///
/// Its order defines buffer indices, legend order and log column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelManifest {
    labels: Arc<[String]>,
}

impl ChannelManifest {
    /// Manifest with `labels` in scan order.
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True if there are no channels.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Labels in manifest order.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Label of channel `index`.
    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }
}

/// One time-aligned row produced by the router for a primary tick.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRow {
    /// Tick-time of the primary tick.
    pub timestamp: Duration,
    /// Primary channel values in manifest order.
    pub channels: Vec<f64>,
    /// Held auxiliary values in column order.
    pub auxiliary: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_values_become_nan() {
        assert!(normalize_sentinel(9.9e37, DEFAULT_OVERFLOW_THRESHOLD).is_nan());
        assert!(normalize_sentinel(-9.9e37, DEFAULT_OVERFLOW_THRESHOLD).is_nan());
        assert!(normalize_sentinel(f64::INFINITY, DEFAULT_OVERFLOW_THRESHOLD).is_nan());
        assert_eq!(normalize_sentinel(1.2e4, DEFAULT_OVERFLOW_THRESHOLD), 1.2e4);
    }

    #[test]
    fn reading_marks_sentinel_invalid() {
        let id: Arc<str> = Arc::from("mux");
        let good = Reading::new(id.clone(), 0, Duration::ZERO, 10.0, 100.0);
        let bad = Reading::new(id, 1, Duration::ZERO, 1000.0, 100.0);
        assert!(good.valid);
        assert!(!bad.valid);
        assert!(bad.value.is_nan());
    }

    #[test]
    fn tick_value_defaults_to_nan() {
        let id: Arc<str> = Arc::from("mux");
        let tick = Tick {
            device_id: id.clone(),
            sequence: 0,
            timestamp: Duration::from_millis(5),
            readings: vec![Reading::new(id, 0, Duration::from_millis(5), 1.5, 10.0)],
            failed: false,
        };
        assert_eq!(tick.value(0), 1.5);
        assert!(tick.value(3).is_nan());
    }

    #[test]
    fn latch_wakes_waiters() {
        let latch = Arc::new(Latch::default());
        assert!(!latch.wait_until(Instant::now() + Duration::from_millis(5)));
        let setter = Arc::clone(&latch);
        let handle = std::thread::spawn(move || setter.set());
        assert!(latch.wait_until(Instant::now() + Duration::from_secs(5)));
        handle.join().expect("setter thread");
        assert!(latch.is_set());
    }

    #[test]
    fn manifest_preserves_order() {
        let manifest = ChannelManifest::new(["101", "102", "103"]);
        assert_eq!(manifest.len(), 3);
        assert_eq!(manifest.label(1), Some("102"));
        assert_eq!(manifest.label(3), None);
    }
}
