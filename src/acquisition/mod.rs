//! Periodic acquisition: per-device schedulers and the tick handlers they drive.
//!
//! ```text
//!   mux thread ──poll──► Tick ──► DataRouter ──► HistorySet + RecordingSession
//!   bath thread ─poll──► Tick ──► AuxiliaryFeed ──► HeldValue ─┘ (sampled)
//!   pt104 thread poll──► Tick ──► AuxiliaryFeed ──► HeldValue ─┘
//! ```
//!
//! Status changes, poll failures and recording failures are published on a
//! `tokio::sync::broadcast` channel of [`EngineEvent`]s.

use std::fmt;
use std::path::PathBuf;
use tokio::sync::broadcast;

pub mod router;
pub mod scheduler;

pub use router::{AuxiliaryFeed, DataRouter, HeldValue};
pub use scheduler::{AcquisitionScheduler, SchedulerConfig, SchedulerStats};

/// Lifecycle of one device's scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Built, not polling yet.
    Idle,
    /// Polling on its own thread.
    Running,
    /// Exceeded its failure budget or never connected; no longer polled.
    Unavailable,
    /// Halted by the engine.
    Stopped,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DeviceStatus::Idle => "idle",
            DeviceStatus::Running => "running",
            DeviceStatus::Unavailable => "unavailable",
            DeviceStatus::Stopped => "stopped",
        };
        f.write_str(text)
    }
}

/// Notifications published by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A device moved to a new lifecycle state.
    DeviceStatusChanged {
        /// Device id.
        device: String,
        /// New status.
        status: DeviceStatus,
    },
    /// One poll failed; the device keeps polling until its failure budget runs out.
    PollFailed {
        /// Device id.
        device: String,
        /// Driver error text.
        message: String,
        /// Consecutive failures so far, this one included.
        consecutive: u32,
    },
    /// A recording was opened.
    RecordingStarted {
        /// The log file.
        path: PathBuf,
    },
    /// A recording was closed normally.
    RecordingStopped {
        /// The log file.
        path: PathBuf,
        /// Data rows written.
        rows: u64,
    },
    /// The log was force-closed after a write error.
    RecordingFailed {
        /// The log file, truncated to its last complete row.
        path: PathBuf,
        /// The write error.
        message: String,
    },
}

/// Sending half of the engine event channel.
pub type EventSender = broadcast::Sender<EngineEvent>;

/// Publish without caring whether anyone listens.
pub(crate) fn publish(events: &EventSender, event: EngineEvent) {
    let _ = events.send(event);
}
