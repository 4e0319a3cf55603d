//! Tick handlers: the primary `DataRouter` and the auxiliary `AuxiliaryFeed`.
//!
//! Auxiliary devices run at their own cadence and only store what they read.
//! The router, driven by the primary device, samples every auxiliary field
//! with sample-and-hold semantics: the latest value whose timestamp is at or
//! before the primary tick. Every buffer therefore advances in lock-step, one
//! sample per primary tick, and every log row carries aligned values.

use super::{publish, EngineEvent, EventSender};
use crate::core::{normalize_sentinel, ChannelManifest, MergedRow, Tick, TickHandler};
use crate::data::history::HistorySet;
use crate::data::recording::RecordingSession;
use crate::error::DaqError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, trace};

/// Timestamped values kept per held field.
///
/// An auxiliary thread can store a reading stamped slightly after a primary
/// tick before the router samples it; the short history lets the router still
/// find the value that was current at the tick.
const HELD_DEPTH: usize = 16;

/// Recent values of one auxiliary field.
#[derive(Debug)]
pub struct HeldValue {
    history: Mutex<VecDeque<(Duration, f64)>>,
}

impl Default for HeldValue {
    fn default() -> Self {
        Self::new()
    }
}

impl HeldValue {
    /// An empty store; samples as NaN until the first value arrives.
    pub fn new() -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(HELD_DEPTH)),
        }
    }

    /// Store `value` read at `timestamp`. Older-than-newest values are dropped.
    pub fn store(&self, timestamp: Duration, value: f64) {
        let mut history = self.history.lock();
        if history.back().is_some_and(|&(t, _)| timestamp < t) {
            return;
        }
        if history.len() == HELD_DEPTH {
            history.pop_front();
        }
        history.push_back((timestamp, value));
    }

    /// Latest value stamped at or before `timestamp`, NaN if there is none.
    pub fn value_at(&self, timestamp: Duration) -> f64 {
        self.history
            .lock()
            .iter()
            .rev()
            .find(|&&(t, _)| t <= timestamp)
            .map_or(f64::NAN, |&(_, v)| v)
    }

    /// Newest stored value and its timestamp.
    pub fn latest(&self) -> Option<(Duration, f64)> {
        self.history.lock().back().copied()
    }
}

/// Tick handler of an auxiliary device: one held field per channel.
pub struct AuxiliaryFeed {
    fields: Vec<Arc<HeldValue>>,
    overflow_threshold: f64,
}

impl AuxiliaryFeed {
    /// One held field per channel of the device, in channel order.
    pub fn new(fields: Vec<Arc<HeldValue>>, overflow_threshold: f64) -> Self {
        Self {
            fields,
            overflow_threshold,
        }
    }

    /// The held fields this feed writes.
    pub fn fields(&self) -> &[Arc<HeldValue>] {
        &self.fields
    }
}

impl TickHandler for AuxiliaryFeed {
    fn on_tick(&self, tick: &Tick) {
        for (channel, field) in self.fields.iter().enumerate() {
            let value = normalize_sentinel(tick.value(channel), self.overflow_threshold);
            field.store(tick.timestamp, value);
        }
    }
}

/// Tick handler of the primary device.
///
/// Lock order per tick is fixed: every history buffer (one at a time), then
/// the recording session.
pub struct DataRouter {
    manifest: ChannelManifest,
    overflow_threshold: f64,
    histories: HistorySet,
    held: Vec<Arc<HeldValue>>,
    session: Arc<RecordingSession>,
    events: EventSender,
    routed: AtomicU64,
}

impl DataRouter {
    /// `held` must list auxiliary fields in log column order, matching
    /// `histories.auxiliary()`.
    pub fn new(
        manifest: ChannelManifest,
        overflow_threshold: f64,
        histories: HistorySet,
        held: Vec<Arc<HeldValue>>,
        session: Arc<RecordingSession>,
        events: EventSender,
    ) -> Self {
        Self {
            manifest,
            overflow_threshold,
            histories,
            held,
            session,
            events,
            routed: AtomicU64::new(0),
        }
    }

    /// Fan one primary tick out to the buffers and the session.
    pub fn route(&self, tick: &Tick) -> MergedRow {
        let timestamp = tick.timestamp;

        let channels: Vec<f64> = (0..self.manifest.len())
            .map(|i| normalize_sentinel(tick.value(i), self.overflow_threshold))
            .collect();
        for (buffer, &value) in self.histories.channels().iter().zip(&channels) {
            if !buffer.append(timestamp, value) {
                trace!(buffer = buffer.label(), "Dropped out-of-order sample");
            }
        }

        let auxiliary: Vec<f64> = self.held.iter().map(|h| h.value_at(timestamp)).collect();
        for (buffer, &value) in self.histories.auxiliary().iter().zip(&auxiliary) {
            if !buffer.append(timestamp, value) {
                trace!(buffer = buffer.label(), "Dropped out-of-order sample");
            }
        }

        let row = MergedRow {
            timestamp,
            channels,
            auxiliary,
        };

        match self.session.on_tick(&row) {
            Ok(_) => {}
            Err(DaqError::RecordingWrite { path, source }) => {
                publish(
                    &self.events,
                    EngineEvent::RecordingFailed {
                        path,
                        message: source.to_string(),
                    },
                );
            }
            Err(e) => error!(error = %e, "Recording failed"),
        }

        self.routed.fetch_add(1, Ordering::Relaxed);
        row
    }

    /// Primary ticks routed so far.
    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    /// The buffers this router appends to.
    pub fn histories(&self) -> &HistorySet {
        &self.histories
    }
}

impl TickHandler for DataRouter {
    fn on_tick(&self, tick: &Tick) {
        self.route(tick);
    }
}
