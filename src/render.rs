//! Periodic read-only consumer of the chart histories.
//!
//! `RenderTick` wakes on its own interval (skip policy, like the pollers),
//! snapshots every buffer plus the recording status into a [`RenderFrame`]
//! and hands it to a [`Renderer`]. It never writes to a buffer or the session.

use crate::core::Latch;
use crate::data::history::{BufferId, HistorySet};
use crate::data::recording::{format_exponent, format_fixed, RecordingSession};
use crate::error::{AppResult, DaqError, JoinFailure};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Name of the render thread.
const RENDER_THREAD: &str = "render";

/// Visible chart span, as offered by the history selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryWindow {
    /// 30 seconds.
    Sec30,
    /// 1 minute.
    Min1,
    /// 3 minutes.
    #[default]
    Min3,
    /// 5 minutes.
    Min5,
    /// 10 minutes.
    Min10,
    /// 30 minutes.
    Min30,
}

impl HistoryWindow {
    /// Every preset, shortest first.
    pub const ALL: [HistoryWindow; 6] = [
        HistoryWindow::Sec30,
        HistoryWindow::Min1,
        HistoryWindow::Min3,
        HistoryWindow::Min5,
        HistoryWindow::Min10,
        HistoryWindow::Min30,
    ];

    /// `mm:ss` label.
    pub fn label(self) -> &'static str {
        match self {
            HistoryWindow::Sec30 => "00:30",
            HistoryWindow::Min1 => "01:00",
            HistoryWindow::Min3 => "03:00",
            HistoryWindow::Min5 => "05:00",
            HistoryWindow::Min10 => "10:00",
            HistoryWindow::Min30 => "30:00",
        }
    }

    /// Visible span.
    pub fn span(self) -> Duration {
        let secs = match self {
            HistoryWindow::Sec30 => 30,
            HistoryWindow::Min1 => 60,
            HistoryWindow::Min3 => 180,
            HistoryWindow::Min5 => 300,
            HistoryWindow::Min10 => 600,
            HistoryWindow::Min30 => 1800,
        };
        Duration::from_secs(secs)
    }

    /// Time-axis divisor: milliseconds to seconds up to one minute, to
    /// minutes beyond.
    pub fn axis_divisor(self) -> f64 {
        if self.span() <= Duration::from_secs(60) {
            1e3
        } else {
            60e3
        }
    }

    /// Unit of the time axis.
    pub fn axis_unit(self) -> &'static str {
        if self.axis_divisor() == 1e3 {
            "s"
        } else {
            "min"
        }
    }

    /// Visible x range in axis units, `[-span, 0]`.
    pub fn axis_range(self) -> (f64, f64) {
        (-(self.span().as_secs_f64() * 1e3) / self.axis_divisor(), 0.0)
    }
}

impl fmt::Display for HistoryWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for HistoryWindow {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|w| w.label() == s)
            .ok_or_else(|| {
                DaqError::Configuration(format!(
                    "Unknown history window '{s}'. Must be one of: 00:30, 01:00, 03:00, 05:00, 10:00, 30:00"
                ))
            })
    }
}

/// One chart curve.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartSeries {
    /// Buffer the curve comes from.
    pub id: BufferId,
    /// Legend label.
    pub label: String,
    /// `[x, y]` points inside the visible window, oldest first.
    pub points: Vec<[f64; 2]>,
    /// Newest visible value.
    pub latest: Option<f64>,
}

/// Everything a renderer needs for one refresh.
#[derive(Debug, Clone)]
pub struct RenderFrame {
    /// Local time of the frame.
    pub wall_clock: DateTime<Local>,
    /// Visible span.
    pub window: HistoryWindow,
    /// True while recording.
    pub recording: bool,
    /// Time since the recording started.
    pub elapsed: Duration,
    /// Open log file, if any.
    pub path: Option<PathBuf>,
    /// One curve per buffer.
    pub series: Vec<ChartSeries>,
}

/// Consumer of render frames (a chart widget, a terminal, a test double).
pub trait Renderer: Send + Sync {
    /// Draw one frame.
    fn render(&self, frame: &RenderFrame);
}

/// What a frame is built from.
#[derive(Clone)]
pub struct FrameSource {
    /// Buffers to snapshot.
    pub histories: HistorySet,
    /// Session to report on.
    pub session: Arc<RecordingSession>,
    /// Visible span, shared with the control surface.
    pub window: Arc<Mutex<HistoryWindow>>,
}

impl FrameSource {
    /// Snapshot every buffer and the recording status.
    pub fn capture(&self) -> RenderFrame {
        let window = *self.window.lock();
        let (min_x, _) = window.axis_range();
        let series = self
            .histories
            .iter()
            .map(|(id, buffer)| {
                let points: Vec<[f64; 2]> = buffer
                    .chart_points()
                    .into_iter()
                    .filter(|p| p[0] >= min_x)
                    .collect();
                ChartSeries {
                    id,
                    label: buffer.label().to_string(),
                    latest: points.last().map(|p| p[1]),
                    points,
                }
            })
            .collect();
        RenderFrame {
            wall_clock: Local::now(),
            window,
            recording: self.session.is_recording(),
            elapsed: self.session.elapsed(),
            path: self.session.path(),
            series,
        }
    }
}

/// The periodic render task.
pub struct RenderTick {
    stop: Arc<Latch>,
    finished: Arc<Latch>,
    frames: Arc<AtomicU64>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RenderTick {
    /// Spawn the render thread; the first frame is rendered immediately.
    pub fn start(
        interval: Duration,
        source: FrameSource,
        renderer: Arc<dyn Renderer>,
    ) -> AppResult<Self> {
        if interval.is_zero() {
            return Err(DaqError::Configuration(
                "render interval must be non-zero".to_string(),
            ));
        }
        let stop = Arc::new(Latch::default());
        let finished = Arc::new(Latch::default());
        let frames = Arc::new(AtomicU64::new(0));

        let handle = {
            let stop = Arc::clone(&stop);
            let finished = Arc::clone(&finished);
            let frames = Arc::clone(&frames);
            thread::Builder::new()
                .name(RENDER_THREAD.to_string())
                .spawn(move || {
                    let mut deadline = Instant::now();
                    while !stop.wait_until(deadline) {
                        renderer.render(&source.capture());
                        frames.fetch_add(1, Ordering::Relaxed);

                        deadline += interval;
                        let now = Instant::now();
                        while deadline < now {
                            deadline += interval;
                        }
                    }
                    finished.set();
                    debug!("Render thread exiting");
                })?
        };

        info!(interval_ms = interval.as_millis() as u64, "Started render tick");
        Ok(Self {
            stop,
            finished,
            frames,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Cancel future frames without waiting.
    pub fn halt(&self) {
        self.stop.set();
    }

    /// Wait up to `timeout` for a frame in progress; detach otherwise.
    pub fn join(&self, timeout: Duration) -> AppResult<()> {
        let Some(handle) = self.thread.lock().take() else {
            return Ok(());
        };
        if !self.finished.wait_until(Instant::now() + timeout) {
            return Err(render_join_error(JoinFailure::TimedOut(timeout)));
        }
        handle
            .join()
            .map_err(|_| render_join_error(JoinFailure::Panicked))
    }

    /// Halt, then join.
    pub fn stop(&self, timeout: Duration) -> AppResult<()> {
        self.halt();
        self.join(timeout)
    }

    /// Frames rendered so far.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

fn render_join_error(failure: JoinFailure) -> DaqError {
    DaqError::ThreadJoin {
        thread: RENDER_THREAD.to_string(),
        failure,
    }
}

impl Drop for RenderTick {
    fn drop(&mut self) {
        if let Err(e) = self.stop(Duration::from_secs(1)) {
            error!(error = %e, "Error stopping render tick on drop");
        }
    }
}

/// Logs the newest value of every series once per frame.
#[derive(Debug, Default)]
pub struct TracingRenderer;

impl TracingRenderer {
    fn summary(frame: &RenderFrame) -> String {
        frame
            .series
            .iter()
            .map(|s| {
                let value = s.latest.unwrap_or(f64::NAN);
                let text = match s.id {
                    BufferId::Channel(_) => format_exponent(value, 5),
                    BufferId::Auxiliary(_) => format_fixed(value, 3),
                };
                format!("{}={}", s.label, text)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Renderer for TracingRenderer {
    fn render(&self, frame: &RenderFrame) {
        let time = frame.wall_clock.format("%H:%M:%S").to_string();
        if frame.recording {
            info!(
                %time,
                elapsed_s = frame.elapsed.as_secs(),
                "{}",
                Self::summary(frame)
            );
        } else {
            info!(%time, "{}", Self::summary(frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChannelManifest, TickClock};
    use crate::data::recording::{AuxColumn, LogLayout};

    fn source() -> FrameSource {
        let manifest = ChannelManifest::new(["101"]);
        FrameSource {
            histories: HistorySet::new(["CH101"], ["P1"], 100),
            session: Arc::new(RecordingSession::new(
                LogLayout::new(vec![AuxColumn::new("P1", 2)], manifest),
                TickClock::new(),
            )),
            window: Arc::new(Mutex::new(HistoryWindow::Sec30)),
        }
    }

    #[test]
    fn window_presets_pick_axis_units() {
        assert_eq!(HistoryWindow::Sec30.axis_divisor(), 1e3);
        assert_eq!(HistoryWindow::Min1.axis_unit(), "s");
        assert_eq!(HistoryWindow::Min5.axis_divisor(), 60e3);
        assert_eq!(HistoryWindow::Min30.axis_range(), (-30.0, 0.0));
        assert_eq!("10:00".parse::<HistoryWindow>().ok(), Some(HistoryWindow::Min10));
        assert!("02:00".parse::<HistoryWindow>().is_err());
    }

    #[test]
    fn frame_clips_points_to_window() {
        let source = source();
        let buffer = &source.histories.channels()[0];
        buffer.set_axis_divisor(HistoryWindow::Sec30.axis_divisor());
        for s in [0u64, 20, 40, 45] {
            buffer.append(Duration::from_secs(s), s as f64);
        }

        let frame = source.capture();
        assert!(!frame.recording);
        assert_eq!(frame.series.len(), 2);
        let ch = &frame.series[0];
        assert_eq!(ch.points, vec![[-25.0, 20.0], [-5.0, 40.0], [0.0, 45.0]]);
        assert_eq!(ch.latest, Some(45.0));
        assert_eq!(frame.series[1].latest, None);
    }

    #[derive(Default)]
    struct Count(AtomicU64);

    impl Renderer for Count {
        fn render(&self, _frame: &RenderFrame) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn render_tick_runs_until_stopped() {
        let count = Arc::new(Count::default());
        let tick = RenderTick::start(Duration::from_millis(10), source(), count.clone())
            .expect("start render tick");
        let deadline = Instant::now() + Duration::from_secs(5);
        while count.0.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        tick.stop(Duration::from_secs(1)).expect("stop");
        let rendered = count.0.load(Ordering::SeqCst);
        assert!(rendered >= 3);
        assert_eq!(tick.frames(), rendered);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.0.load(Ordering::SeqCst), rendered);
    }

    struct Slow;

    impl Renderer for Slow {
        fn render(&self, _frame: &RenderFrame) {
            thread::sleep(Duration::from_millis(300));
        }
    }

    #[test]
    fn stuck_frame_is_reported_as_render_join_failure() {
        let tick = RenderTick::start(Duration::from_millis(10), source(), Arc::new(Slow))
            .expect("start render tick");
        thread::sleep(Duration::from_millis(20));
        match tick.stop(Duration::from_millis(20)) {
            Err(DaqError::ThreadJoin { thread, failure }) => {
                assert_eq!(thread, "render");
                assert_eq!(failure, JoinFailure::TimedOut(Duration::from_millis(20)));
            }
            other => panic!("expected ThreadJoin, got {other:?}"),
        }
        assert!(tick.stop(Duration::from_millis(20)).is_ok());
    }
}
