//! Custom error types for the acquisition engine.
//!
//! `DaqError` is the crate-wide error. It follows the failure taxonomy of the
//! engine:
//!
//! - **`TransientIo`**: a single poll failed. The scheduler records a NaN
//!   reading and keeps going, so this variant is mostly seen in events and logs.
//! - **`DeviceUnavailable`**: a device exceeded its consecutive failure budget
//!   (or never connected). Only that device's scheduler halts.
//! - **`RecordingStart`**: `start` was rejected synchronously; nothing changed.
//! - **`RecordingWrite`**: a row could not be written. The session has been
//!   force-closed and the file keeps every row written before the failure.
//!
//! The remaining variants cover configuration loading and plain I/O.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Figment could not load or extract the configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration loaded but is invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Plain I/O failure outside the recording path.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A single poll failed.
    #[error("Transient I/O error on device '{device}': {source}")]
    TransientIo {
        /// Device id.
        device: String,
        /// Driver error.
        #[source]
        source: InstrumentError,
    },

    /// Device exceeded its failure budget or never connected.
    #[error("Device '{0}' is unavailable")]
    DeviceUnavailable(String),

    /// A recording could not be started.
    #[error(transparent)]
    RecordingStart(#[from] RecordingStartError),

    /// A recording write failed and the session was force-closed.
    #[error("Failed to write recording '{}': {source}", .path.display())]
    RecordingWrite {
        /// The log file.
        path: PathBuf,
        /// Underlying write error.
        #[source]
        source: std::io::Error,
    },

    /// Instrument-level failure (busy, close failed).
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// A worker thread (poller or render) could not be joined.
    #[error("Thread '{thread}' {failure}")]
    ThreadJoin {
        /// Thread name.
        thread: String,
        /// What went wrong.
        failure: JoinFailure,
    },

    /// One or more shutdown steps failed.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

/// Why a worker thread could not be joined.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinFailure {
    /// Still busy after the timeout; the thread was detached.
    #[error("did not finish within {0:?}")]
    TimedOut(std::time::Duration),
    /// The thread panicked.
    #[error("panicked")]
    Panicked,
}

/// Reasons a recording session refuses to start.
#[derive(Error, Debug)]
pub enum RecordingStartError {
    /// A recording is already open.
    #[error("A recording to '{}' is already active", .path.display())]
    AlreadyActive {
        /// The open log file.
        path: PathBuf,
    },

    /// `path` could not be created.
    #[error("Cannot open '{}' for recording: {source}", .path.display())]
    CannotOpen {
        /// Requested path.
        path: PathBuf,
        /// Open error.
        #[source]
        source: std::io::Error,
    },
}

/// Driver-level failures reported by an instrument's `poll`, `begin` or `close`.
#[derive(Error, Debug)]
pub enum InstrumentError {
    /// Operation needs a connected instrument.
    #[error("Instrument is not connected")]
    NotConnected,

    /// No reply within the driver timeout.
    #[error("Timed out after {timeout_ms} ms waiting for a reply")]
    Timeout {
        /// Timeout that expired.
        timeout_ms: u64,
    },

    /// Transport I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unexpected reply.
    #[error("Protocol error: {message}")]
    Protocol {
        /// What was wrong with the reply.
        message: String,
    },
}

impl DaqError {
    /// Wrap a driver error raised while polling `device`.
    pub fn transient(device: impl Into<String>, source: InstrumentError) -> Self {
        DaqError::TransientIo {
            device: device.into(),
            source,
        }
    }

    /// True for errors the acquisition path recovers from on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DaqError::TransientIo { .. })
    }
}
