//! Fixed-capacity chart histories shared between acquisition and rendering.
//!
//! A [`HistoryBuffer`] holds the most recent `capacity` samples of one signal.
//! The acquisition thread appends, the render thread takes snapshots; both go
//! through one short `parking_lot` critical section, so a snapshot can never
//! observe a half-written sample.
//!
//! ```text
//!   acquisition thread            render thread
//!          │                            │
//!    append(t, v) ──► [ Mutex<VecDeque<Sample>> ] ◄── snapshot()
//!                       oldest … newest (≤ N)
//! ```

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// One stored point of a history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Tick-time of the sample.
    pub timestamp: Duration,
    /// Sample value, NaN for no reading.
    pub value: f64,
}

/// Thread-safe ring buffer of timestamped samples.
#[derive(Debug)]
pub struct HistoryBuffer {
    label: String,
    capacity: usize,
    samples: Mutex<VecDeque<Sample>>,
    /// Display-only divisor for the time axis, stored as `f64` bits.
    axis_divisor: AtomicU64,
}

impl HistoryBuffer {
    /// Create an empty history holding at most `capacity` samples.
    ///
    /// A zero capacity is bumped to one so that `append` is always meaningful.
    pub fn new(label: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            label: label.into(),
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            axis_divisor: AtomicU64::new(1.0f64.to_bits()),
        }
    }

    /// Chart legend label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Maximum number of samples kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a sample, evicting the oldest one when full.
    ///
    /// Returns `false` (and stores nothing) if `timestamp` is older than the
    /// newest stored sample.
    pub fn append(&self, timestamp: Duration, value: f64) -> bool {
        let mut samples = self.samples.lock();
        if let Some(last) = samples.back() {
            if timestamp < last.timestamp {
                trace!(
                    buffer = %self.label,
                    ?timestamp,
                    newest = ?last.timestamp,
                    "Rejected out-of-order sample"
                );
                return false;
            }
        }
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(Sample { timestamp, value });
        true
    }

    /// Independent copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<Sample> {
        let samples = self.samples.lock();
        samples.iter().copied().collect()
    }

    /// Drop every sample.
    pub fn clear(&self) {
        self.samples.lock().clear();
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Newest sample, if any.
    pub fn latest(&self) -> Option<Sample> {
        self.samples.lock().back().copied()
    }

    /// Current time-axis divisor.
    pub fn axis_divisor(&self) -> f64 {
        f64::from_bits(self.axis_divisor.load(Ordering::Relaxed))
    }

    /// Set the time-axis divisor used by [`chart_points`](Self::chart_points).
    ///
    /// Non-positive or non-finite divisors are ignored.
    pub fn set_axis_divisor(&self, divisor: f64) {
        if divisor.is_finite() && divisor > 0.0 {
            self.axis_divisor.store(divisor.to_bits(), Ordering::Relaxed);
        }
    }

    /// Snapshot as `[x, y]` chart points.
    ///
    /// `x` is the sample's age relative to the newest sample, in milliseconds
    /// divided by the axis divisor, so the newest point sits at `x = 0` and
    /// older points are negative.
    pub fn chart_points(&self) -> Vec<[f64; 2]> {
        let snapshot = self.snapshot();
        let divisor = self.axis_divisor();
        let Some(newest) = snapshot.last().map(|s| s.timestamp) else {
            return Vec::new();
        };
        snapshot
            .iter()
            .map(|s| {
                let age_ms = (newest - s.timestamp).as_secs_f64() * 1e3;
                [-age_ms / divisor, s.value]
            })
            .collect()
    }
}

/// Identifies one buffer inside a [`HistorySet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferId {
    /// Primary channel, by manifest index.
    Channel(usize),
    /// Auxiliary field, by column index.
    Auxiliary(usize),
}

/// All histories of one engine: one per primary channel, one per auxiliary field.
#[derive(Debug, Clone)]
pub struct HistorySet {
    channels: Vec<Arc<HistoryBuffer>>,
    auxiliary: Vec<Arc<HistoryBuffer>>,
}

impl HistorySet {
    /// One buffer per channel label and per auxiliary label, each holding `capacity` samples.
    pub fn new<C, A>(channel_labels: C, auxiliary_labels: A, capacity: usize) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        Self {
            channels: channel_labels
                .into_iter()
                .map(|label| Arc::new(HistoryBuffer::new(label, capacity)))
                .collect(),
            auxiliary: auxiliary_labels
                .into_iter()
                .map(|label| Arc::new(HistoryBuffer::new(label, capacity)))
                .collect(),
        }
    }

    /// Buffer `id`, if it exists.
    pub fn get(&self, id: BufferId) -> Option<&Arc<HistoryBuffer>> {
        match id {
            BufferId::Channel(i) => self.channels.get(i),
            BufferId::Auxiliary(i) => self.auxiliary.get(i),
        }
    }

    /// Snapshot of one buffer; empty if `id` is unknown.
    pub fn snapshot(&self, id: BufferId) -> Vec<Sample> {
        self.get(id).map(|b| b.snapshot()).unwrap_or_default()
    }

    /// Primary channel buffers, manifest order.
    pub fn channels(&self) -> &[Arc<HistoryBuffer>] {
        &self.channels
    }

    /// Auxiliary buffers, log column order.
    pub fn auxiliary(&self) -> &[Arc<HistoryBuffer>] {
        &self.auxiliary
    }

    /// Every buffer with its id, channels first.
    pub fn iter(&self) -> impl Iterator<Item = (BufferId, &Arc<HistoryBuffer>)> {
        let channels = self
            .channels
            .iter()
            .enumerate()
            .map(|(i, b)| (BufferId::Channel(i), b));
        let auxiliary = self
            .auxiliary
            .iter()
            .enumerate()
            .map(|(i, b)| (BufferId::Auxiliary(i), b));
        channels.chain(auxiliary)
    }

    /// Clear every buffer.
    pub fn clear_all(&self) {
        for (_, buffer) in self.iter() {
            buffer.clear();
        }
    }

    /// Set the time-axis divisor of every buffer.
    pub fn set_axis_divisor(&self, divisor: f64) {
        for (_, buffer) in self.iter() {
            buffer.set_axis_divisor(divisor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn keeps_most_recent_samples() {
        let buffer = HistoryBuffer::new("CH101", 3);
        for i in 0..5u64 {
            assert!(buffer.append(ms(i), i as f64));
        }
        let values: Vec<f64> = buffer.snapshot().iter().map(|s| s.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
        assert_eq!(buffer.latest().map(|s| s.value), Some(4.0));
    }

    #[test]
    fn rejects_out_of_order_samples() {
        let buffer = HistoryBuffer::new("CH101", 4);
        assert!(buffer.append(ms(10), 1.0));
        assert!(!buffer.append(ms(5), 2.0));
        assert!(buffer.append(ms(10), 3.0));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn zero_capacity_is_bumped() {
        let buffer = HistoryBuffer::new("x", 0);
        assert_eq!(buffer.capacity(), 1);
        assert!(buffer.append(ms(1), 1.0));
        assert!(buffer.append(ms(2), 2.0));
        assert_eq!(buffer.snapshot(), vec![Sample { timestamp: ms(2), value: 2.0 }]);
    }

    #[test]
    fn chart_points_are_relative_to_newest() {
        let buffer = HistoryBuffer::new("x", 10);
        buffer.set_axis_divisor(1e3);
        buffer.append(ms(1000), 1.0);
        buffer.append(ms(3000), 2.0);
        assert_eq!(buffer.chart_points(), vec![[-2.0, 1.0], [0.0, 2.0]]);

        buffer.set_axis_divisor(-5.0);
        assert_eq!(buffer.axis_divisor(), 1e3);
    }

    #[test]
    fn history_set_lookup_and_clear() {
        let set = HistorySet::new(["101", "102"], ["P1_temp"], 8);
        assert!(set.channels()[1].append(ms(1), 5.0));
        assert!(set.auxiliary()[0].append(ms(1), 20.0));
        assert_eq!(set.snapshot(BufferId::Channel(1)).len(), 1);
        assert!(set.snapshot(BufferId::Channel(7)).is_empty());
        assert_eq!(set.iter().count(), 3);

        set.clear_all();
        assert!(set.iter().all(|(_, b)| b.is_empty()));
    }
}
