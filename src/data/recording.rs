//! Start/stop-able recording of merged rows to a tab-delimited log file.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle --start(path)--> PendingHeader --first on_tick--> Active --stop()--> Idle
//! PendingHeader --stop()--> Idle
//! any state --write error--> Idle (force-closed, error returned)
//! ```
//!
//! `start` and `stop` come from the control surface, `on_tick` from the
//! acquisition thread. All three take the same session mutex, so a row is
//! never written to a handle that is being closed.
//!
//! ## File format
//!
//! One header line, then one line per primary tick:
//!
//! ```text
//! time[s]  P1_temp[degC]  P2_temp[degC]  PT104_Ch1[degC]  CH101 ...
//! 12.0     24.51          nan            24.497           1.0021e+04 ...
//! ```
//!
//! Elapsed seconds use one decimal, auxiliary columns their configured number
//! of decimals, channel values C-style exponent notation with five
//! significant digits. NaN is written as `nan` in every column.

use crate::core::{ChannelManifest, MergedRow, TickClock};
use crate::error::{DaqError, RecordingStartError};
use chrono::{DateTime, TimeZone};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Column separator of the log file.
pub const SEPARATOR: char = '\t';

/// Significant digits of per-channel values.
const CHANNEL_SIGNIFICANT_DIGITS: usize = 5;

/// One auxiliary column of the log: its header label and fixed decimals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxColumn {
    /// Header text.
    pub label: String,
    /// Digits after the decimal point.
    #[serde(default = "default_decimals")]
    pub decimals: usize,
}

fn default_decimals() -> usize {
    2
}

impl AuxColumn {
    /// A column with `decimals` fixed digits.
    pub fn new(label: impl Into<String>, decimals: usize) -> Self {
        Self {
            label: label.into(),
            decimals,
        }
    }
}

/// Column layout of a log file, fixed for the lifetime of an engine.
#[derive(Debug, Clone)]
pub struct LogLayout {
    /// Auxiliary columns, written after `time[s]`.
    pub auxiliary: Vec<AuxColumn>,
    /// Primary channels, written last as `CH<label>`.
    pub manifest: ChannelManifest,
}

impl LogLayout {
    /// Layout with auxiliary columns first, then every manifest channel.
    pub fn new(auxiliary: Vec<AuxColumn>, manifest: ChannelManifest) -> Self {
        Self {
            auxiliary,
            manifest,
        }
    }

    /// Header line, newline included.
    pub fn header(&self) -> String {
        let mut line = String::from("time[s]");
        for column in &self.auxiliary {
            line.push(SEPARATOR);
            line.push_str(&column.label);
        }
        for label in self.manifest.labels() {
            line.push(SEPARATOR);
            line.push_str("CH");
            line.push_str(label);
        }
        line.push('\n');
        line
    }

    /// Data line for `row`, newline included.
    ///
    /// Values missing from `row` are written as `nan`.
    pub fn format_row(&self, elapsed: Duration, row: &MergedRow) -> String {
        let mut line = format_fixed(elapsed.as_secs_f64(), 1);
        for (i, column) in self.auxiliary.iter().enumerate() {
            let value = row.auxiliary.get(i).copied().unwrap_or(f64::NAN);
            line.push(SEPARATOR);
            line.push_str(&format_fixed(value, column.decimals));
        }
        for i in 0..self.manifest.len() {
            let value = row.channels.get(i).copied().unwrap_or(f64::NAN);
            line.push(SEPARATOR);
            line.push_str(&format_exponent(value, CHANNEL_SIGNIFICANT_DIGITS));
        }
        line.push('\n');
        line
    }
}

fn format_non_finite(value: f64) -> Option<String> {
    if value.is_nan() {
        Some("nan".to_string())
    } else if value.is_infinite() {
        Some(if value > 0.0 { "inf" } else { "-inf" }.to_string())
    } else {
        None
    }
}

/// `%.Nf` formatting with C spelling of non-finite values.
pub fn format_fixed(value: f64, decimals: usize) -> String {
    format_non_finite(value).unwrap_or_else(|| format!("{:.*}", decimals, value))
}

/// C-style `%.Ne` formatting with `significant` digits (`1.2346e+02`).
pub fn format_exponent(value: f64, significant: usize) -> String {
    if let Some(text) = format_non_finite(value) {
        return text;
    }
    let rust = format!("{:.*e}", significant.saturating_sub(1), value);
    match rust.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let mut out = String::with_capacity(rust.len() + 2);
            let sign = if exponent < 0 { '-' } else { '+' };
            let _ = write!(out, "{mantissa}e{sign}{:02}", exponent.abs());
            out
        }
        None => rust,
    }
}

/// Log file name with a reverse-order (year first) timestamp.
pub fn log_file_name<Tz: TimeZone>(prefix: &str, now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{prefix}{}.txt", now.format("%y%m%d_%H%M%S"))
}

/// Lifecycle state of a [`RecordingSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    /// No file open.
    Idle,
    /// File is open, header not yet written.
    PendingHeader,
    /// Header written, one row per tick.
    Active,
    /// Being flushed and closed by `stop`.
    Closing,
}

/// What a finished recording left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    /// The closed log file.
    pub path: PathBuf,
    /// Data rows written, header excluded.
    pub rows: u64,
}

struct OpenLog {
    path: PathBuf,
    /// Kept for truncation; all writes go through `writer`.
    file: File,
    writer: BufWriter<Box<dyn Write + Send>>,
    started: Duration,
    rows: u64,
    /// Bytes known to be fully written; the truncation point after a failure.
    committed: u64,
}

impl OpenLog {
    fn new(path: PathBuf, file: File, started: Duration) -> std::io::Result<Self> {
        let sink: Box<dyn Write + Send> = Box::new(file.try_clone()?);
        Ok(Self {
            path,
            file,
            writer: BufWriter::new(sink),
            started,
            rows: 0,
            committed: 0,
        })
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;
        self.committed += line.len() as u64;
        Ok(())
    }

    /// Drop the handle, cutting the file back to the last complete line.
    fn abandon(self) -> PathBuf {
        // Discard whatever is still buffered instead of flushing it.
        let (_sink, _unwritten) = self.writer.into_parts();
        if let Err(e) = self.file.set_len(self.committed) {
            warn!(path = %self.path.display(), error = %e, "Could not truncate recording");
        }
        self.path
    }
}

struct SessionInner {
    state: RecordingState,
    log: Option<OpenLog>,
}

/// The recording state machine. Exclusively owns the log file handle.
pub struct RecordingSession {
    layout: LogLayout,
    clock: TickClock,
    inner: Mutex<SessionInner>,
}

impl RecordingSession {
    /// An idle session writing rows in `layout`, timed by `clock`.
    pub fn new(layout: LogLayout, clock: TickClock) -> Self {
        Self {
            layout,
            clock,
            inner: Mutex::new(SessionInner {
                state: RecordingState::Idle,
                log: None,
            }),
        }
    }

    /// Column layout of every log this session writes.
    pub fn layout(&self) -> &LogLayout {
        &self.layout
    }

    /// Open `path` and wait for the first tick, timing from now.
    ///
    /// An existing file at `path` is truncated.
    pub fn start(&self, path: impl AsRef<Path>) -> Result<(), RecordingStartError> {
        self.start_at(path, self.clock.now())
    }

    /// Like [`start`](Self::start), but never touches an existing file: if
    /// `path` exists the result is `CannotOpen` with `ErrorKind::AlreadyExists`.
    pub fn start_new(&self, path: impl AsRef<Path>) -> Result<(), RecordingStartError> {
        self.open(path.as_ref(), self.clock.now(), true)
    }

    /// Open `path` with elapsed time measured from tick-time `started`.
    pub fn start_at(
        &self,
        path: impl AsRef<Path>,
        started: Duration,
    ) -> Result<(), RecordingStartError> {
        self.open(path.as_ref(), started, false)
    }

    fn open(
        &self,
        path: &Path,
        started: Duration,
        exclusive: bool,
    ) -> Result<(), RecordingStartError> {
        let mut inner = self.inner.lock();
        if inner.state != RecordingState::Idle {
            let active = inner
                .log
                .as_ref()
                .map_or_else(|| path.to_path_buf(), |log| log.path.clone());
            return Err(RecordingStartError::AlreadyActive { path: active });
        }

        let mut options = OpenOptions::new();
        options.write(true);
        if exclusive {
            options.create_new(true);
        } else {
            options.create(true).truncate(true);
        }
        let log = options
            .open(path)
            .and_then(|file| OpenLog::new(path.to_path_buf(), file, started))
            .map_err(|source| RecordingStartError::CannotOpen {
                path: path.to_path_buf(),
                source,
            })?;

        inner.log = Some(log);
        inner.state = RecordingState::PendingHeader;
        info!(path = %path.display(), "Recording started");
        Ok(())
    }

    /// Write `row` if recording. Returns whether a data row was written.
    ///
    /// On a write failure the session is force-closed and the file keeps
    /// every complete row written before the failure.
    pub fn on_tick(&self, row: &MergedRow) -> Result<bool, DaqError> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        if !matches!(
            state,
            RecordingState::PendingHeader | RecordingState::Active
        ) {
            return Ok(false);
        }
        let Some(log) = inner.log.as_mut() else {
            inner.state = RecordingState::Idle;
            return Ok(false);
        };

        let mut result = Ok(());
        if state == RecordingState::PendingHeader {
            result = log.write_line(&self.layout.header());
        }
        if result.is_ok() {
            let elapsed = row.timestamp.saturating_sub(log.started);
            result = log.write_line(&self.layout.format_row(elapsed, row));
        }

        match result {
            Ok(()) => {
                log.rows += 1;
                inner.state = RecordingState::Active;
                Ok(true)
            }
            Err(source) => {
                inner.state = RecordingState::Idle;
                let path = match inner.log.take() {
                    Some(log) => log.abandon(),
                    None => PathBuf::new(),
                };
                error!(path = %path.display(), error = %source, "Recording write failed, session closed");
                Err(DaqError::RecordingWrite { path, source })
            }
        }
    }

    /// Flush and close the log. A no-op returning `None` when already idle.
    pub fn stop(&self) -> Result<Option<RecordingSummary>, DaqError> {
        let mut inner = self.inner.lock();
        let Some(mut log) = inner.log.take() else {
            inner.state = RecordingState::Idle;
            return Ok(None);
        };
        inner.state = RecordingState::Closing;

        let flushed = log.writer.flush();
        inner.state = RecordingState::Idle;
        match flushed {
            Ok(()) => {
                info!(path = %log.path.display(), rows = log.rows, "Recording stopped");
                Ok(Some(RecordingSummary {
                    path: log.path,
                    rows: log.rows,
                }))
            }
            Err(source) => {
                let path = log.abandon();
                error!(path = %path.display(), error = %source, "Recording flush failed on stop");
                Err(DaqError::RecordingWrite { path, source })
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RecordingState {
        self.inner.lock().state
    }

    /// True while a file is open (header pending or written).
    pub fn is_recording(&self) -> bool {
        matches!(
            self.state(),
            RecordingState::PendingHeader | RecordingState::Active
        )
    }

    /// Time since `start`; zero when idle.
    pub fn elapsed(&self) -> Duration {
        let now = self.clock.now();
        self.inner
            .lock()
            .log
            .as_ref()
            .map_or(Duration::ZERO, |log| now.saturating_sub(log.started))
    }

    /// Path of the open log, if any.
    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().log.as_ref().map(|log| log.path.clone())
    }

    /// Data rows written by the current recording (0 when idle).
    pub fn rows_written(&self) -> u64 {
        self.inner.lock().log.as_ref().map_or(0, |log| log.rows)
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            debug!(error = %e, "Recording could not be closed cleanly on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> LogLayout {
        LogLayout::new(
            vec![
                AuxColumn::new("P1_temp[degC]", 2),
                AuxColumn::new("P2_temp[degC]", 2),
                AuxColumn::new("PT104_Ch1[degC]", 3),
            ],
            ChannelManifest::new(["101", "102"]),
        )
    }

    #[test]
    fn exponent_format_matches_c() {
        assert_eq!(format_exponent(123.456, 5), "1.2346e+02");
        assert_eq!(format_exponent(0.000123456, 5), "1.2346e-04");
        assert_eq!(format_exponent(0.0, 5), "0.0000e+00");
        assert_eq!(format_exponent(-1.5e120, 5), "-1.5000e+120");
        assert_eq!(format_exponent(f64::NAN, 5), "nan");
    }

    #[test]
    fn fixed_format_spells_nan_like_c() {
        assert_eq!(format_fixed(24.456, 2), "24.46");
        assert_eq!(format_fixed(f64::NAN, 3), "nan");
        assert_eq!(format_fixed(f64::NEG_INFINITY, 1), "-inf");
    }

    #[test]
    fn header_orders_columns() {
        assert_eq!(
            layout().header(),
            "time[s]\tP1_temp[degC]\tP2_temp[degC]\tPT104_Ch1[degC]\tCH101\tCH102\n"
        );
    }

    #[test]
    fn row_fills_missing_values_with_nan() {
        let row = MergedRow {
            timestamp: Duration::from_millis(12_340),
            channels: vec![10021.3],
            auxiliary: vec![24.5, f64::NAN, 24.4971],
        };
        assert_eq!(
            layout().format_row(Duration::from_millis(12_340), &row),
            "12.3\t24.50\tnan\t24.497\t1.0021e+04\tnan\n"
        );
    }

    #[test]
    fn file_name_is_year_first() {
        let now = chrono::Utc
            .with_ymd_and_hms(2024, 1, 31, 9, 5, 7)
            .single()
            .map(|dt| log_file_name("calib_thermistors_", &dt));
        assert_eq!(now.as_deref(), Some("calib_thermistors_240131_090507.txt"));
    }

    #[test]
    fn stop_when_idle_is_a_no_op() {
        let session = RecordingSession::new(layout(), TickClock::new());
        assert!(matches!(session.stop(), Ok(None)));
        assert_eq!(session.state(), RecordingState::Idle);
        assert_eq!(session.elapsed(), Duration::ZERO);
    }

    #[test]
    fn idle_session_ignores_ticks() {
        let session = RecordingSession::new(layout(), TickClock::new());
        let row = MergedRow {
            timestamp: Duration::ZERO,
            channels: vec![],
            auxiliary: vec![],
        };
        assert!(matches!(session.on_tick(&row), Ok(false)));
    }

    /// Passes through `budget` bytes, then fails every write.
    struct FailAfter {
        file: File,
        budget: usize,
    }

    impl Write for FailAfter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.budget == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
            }
            let n = buf.len().min(self.budget);
            let written = self.file.write(&buf[..n])?;
            self.budget -= written;
            Ok(written)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.file.flush()
        }
    }

    fn row_at(ms: u64) -> MergedRow {
        MergedRow {
            timestamp: Duration::from_millis(ms),
            channels: vec![1.0e4, 1.1e4],
            auxiliary: vec![24.5, 24.6, 24.7],
        }
    }

    #[test]
    fn failed_write_keeps_every_complete_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("partial.txt");
        let session = RecordingSession::new(layout(), TickClock::new());
        session.start_at(&path, Duration::ZERO).expect("start");
        for i in 0..3 {
            assert!(matches!(session.on_tick(&row_at(i * 1000)), Ok(true)));
        }
        let before = std::fs::read_to_string(&path).expect("read log");

        {
            let mut inner = session.inner.lock();
            let log = inner.log.as_mut().expect("open log");
            let file = log.file.try_clone().expect("clone handle");
            log.writer = BufWriter::new(Box::new(FailAfter { file, budget: 10 }));
        }
        let err = session.on_tick(&row_at(3000)).expect_err("write must fail");
        assert!(matches!(err, DaqError::RecordingWrite { ref path, .. } if path.ends_with("partial.txt")));
        assert_eq!(session.state(), RecordingState::Idle);

        let after = std::fs::read_to_string(&path).expect("read log");
        assert_eq!(after, before);
        assert_eq!(after.lines().count(), 4);
        assert!(after.ends_with('\n'));
        assert!(after.lines().all(|l| l.split(SEPARATOR).count() == 6));
    }

    #[test]
    fn start_new_leaves_existing_file_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("taken.txt");
        std::fs::write(&path, "keep me\n").expect("write");
        let session = RecordingSession::new(layout(), TickClock::new());

        match session.start_new(&path) {
            Err(RecordingStartError::CannotOpen { source, .. }) => {
                assert_eq!(source.kind(), std::io::ErrorKind::AlreadyExists);
            }
            other => panic!("expected CannotOpen, got {other:?}"),
        }
        assert_eq!(session.state(), RecordingState::Idle);
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "keep me\n");

        session.start_new(dir.path().join("fresh.txt")).expect("fresh path");
        assert!(session.is_recording());
    }
}
