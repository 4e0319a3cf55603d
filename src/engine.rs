//! The acquisition context: devices, schedulers, buffers and the session.
//!
//! `AcquisitionContext` is built once from configuration and owns everything
//! that runs. Its fields are fixed at construction: the channel manifest
//! (taken from the primary instrument after `begin`), the buffer capacity and
//! every device's poll interval.
//!
//! ## Shutdown order
//!
//! 1. halt every scheduler and the render tick
//! 2. wait (bounded) for in-flight polls and the current frame
//! 3. stop the recording session
//! 4. close every device
//!
//! Each step is best-effort. Failures are collected and reported together as
//! [`DaqError::ShutdownFailed`].

use crate::acquisition::{
    publish, AcquisitionScheduler, AuxiliaryFeed, DataRouter, DeviceStatus, EngineEvent,
    EventSender, HeldValue, SchedulerConfig, SchedulerStats,
};
use crate::config::{AppConfig, DeviceConfig};
use crate::core::{ChannelManifest, TickClock};
use crate::data::history::{BufferId, HistorySet, Sample};
use crate::data::recording::{
    log_file_name, LogLayout, RecordingSession, RecordingState, RecordingSummary,
};
use crate::error::{AppResult, DaqError, RecordingStartError};
use crate::instrument::{Instrument, InstrumentRegistry};
use crate::render::{FrameSource, HistoryWindow, RenderTick, Renderer};
use chrono::Local;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Suffixed names tried by `start_recording_in` before giving up.
const MAX_NAME_ATTEMPTS: u32 = 100;

struct ScheduledDevice {
    scheduler: AcquisitionScheduler,
    interval: Duration,
}

/// Explicit owner of one running acquisition.
pub struct AcquisitionContext {
    config: AppConfig,
    clock: TickClock,
    manifest: ChannelManifest,
    histories: HistorySet,
    session: Arc<RecordingSession>,
    router: Arc<DataRouter>,
    /// Primary first, then auxiliaries in configuration order.
    devices: Vec<ScheduledDevice>,
    window: Arc<Mutex<HistoryWindow>>,
    render: Mutex<Option<RenderTick>>,
    events: EventSender,
    shut_down: AtomicBool,
}

impl AcquisitionContext {
    /// Build the context from configuration and already-constructed instruments.
    ///
    /// `auxiliaries` must match `config.auxiliary` in order. The primary
    /// instrument must connect; an auxiliary that does not is marked
    /// unavailable and its columns stay NaN.
    pub fn new(
        config: AppConfig,
        mut primary: Box<dyn Instrument>,
        auxiliaries: Vec<Box<dyn Instrument>>,
    ) -> AppResult<Self> {
        config.validate()?;
        if auxiliaries.len() != config.auxiliary.len() {
            return Err(DaqError::Configuration(format!(
                "{} auxiliary instruments given, {} configured",
                auxiliaries.len(),
                config.auxiliary.len()
            )));
        }

        let clock = TickClock::new();
        let (events, _) = broadcast::channel(config.acquisition.event_capacity);

        if !bring_up(primary.as_mut(), &config.primary) {
            return Err(DaqError::DeviceUnavailable(config.primary.id.clone()));
        }
        let manifest = ChannelManifest::new(primary.channels());
        if manifest.is_empty() {
            return Err(DaqError::Configuration(format!(
                "Primary device '{}' reports no channels",
                config.primary.id
            )));
        }
        info!(channels = ?manifest.labels(), "Channel manifest fixed");

        let columns = config.auxiliary_columns();
        let histories = HistorySet::new(
            manifest.labels().iter().map(|label| format!("CH{label}")),
            columns.iter().map(|c| c.label.clone()),
            config.acquisition.buffer_capacity,
        );
        let window = HistoryWindow::default();
        histories.set_axis_divisor(window.axis_divisor());

        let session = Arc::new(RecordingSession::new(
            LogLayout::new(columns, manifest.clone()),
            clock,
        ));

        let mut held = Vec::new();
        let mut auxiliary_devices = Vec::with_capacity(auxiliaries.len());
        for (device, mut instrument) in config.auxiliary.iter().zip(auxiliaries) {
            let fields: Vec<Arc<HeldValue>> = device
                .columns
                .iter()
                .map(|_| Arc::new(HeldValue::new()))
                .collect();
            held.extend(fields.iter().cloned());
            let connected = bring_up(instrument.as_mut(), device);
            let feed = Arc::new(AuxiliaryFeed::new(fields, device.overflow_threshold()));
            let scheduler = AcquisitionScheduler::new(
                instrument,
                device.columns.len(),
                feed,
                clock,
                scheduler_config(&config, device),
                events.clone(),
            );
            if !connected {
                scheduler.mark_unavailable();
            }
            auxiliary_devices.push(ScheduledDevice {
                scheduler,
                interval: device.poll_interval(),
            });
        }

        let router = Arc::new(DataRouter::new(
            manifest.clone(),
            config.primary.overflow_threshold(),
            histories.clone(),
            held,
            Arc::clone(&session),
            events.clone(),
        ));
        let primary_scheduler = AcquisitionScheduler::new(
            primary,
            manifest.len(),
            router.clone(),
            clock,
            scheduler_config(&config, &config.primary),
            events.clone(),
        );

        let mut devices = Vec::with_capacity(auxiliary_devices.len() + 1);
        devices.push(ScheduledDevice {
            scheduler: primary_scheduler,
            interval: config.primary.poll_interval(),
        });
        devices.extend(auxiliary_devices);

        Ok(Self {
            config,
            clock,
            manifest,
            histories,
            session,
            router,
            devices,
            window: Arc::new(Mutex::new(window)),
            render: Mutex::new(None),
            events,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Build every instrument through `registry`.
    pub fn from_config(config: AppConfig, registry: &InstrumentRegistry) -> AppResult<Self> {
        let create = |device: &DeviceConfig| {
            registry.create(device).ok_or_else(|| {
                DaqError::Configuration(format!(
                    "Device '{}': unknown instrument kind '{}'",
                    device.id, device.kind
                ))
            })
        };
        let primary = create(&config.primary)?;
        let auxiliaries = config
            .auxiliary
            .iter()
            .map(create)
            .collect::<AppResult<Vec<_>>>()?;
        Self::new(config, primary, auxiliaries)
    }

    /// Start polling every available device.
    pub fn start(&self) -> AppResult<()> {
        for device in &self.devices {
            let scheduler = &device.scheduler;
            if scheduler.status() == DeviceStatus::Unavailable {
                warn!(device = scheduler.device_id(), "Skipping unavailable device");
                continue;
            }
            scheduler.start(device.interval)?;
        }
        Ok(())
    }

    /// Start the periodic render task feeding `renderer`.
    pub fn start_render(&self, renderer: Arc<dyn Renderer>) -> AppResult<()> {
        let mut render = self.render.lock();
        if render.is_some() {
            return Err(DaqError::Configuration(
                "render tick already running".to_string(),
            ));
        }
        let source = FrameSource {
            histories: self.histories.clone(),
            session: Arc::clone(&self.session),
            window: Arc::clone(&self.window),
        };
        *render = Some(RenderTick::start(
            self.config.render_interval(),
            source,
            renderer,
        )?);
        Ok(())
    }

    /// Start recording to `path`; the header is written on the next primary tick.
    ///
    /// An existing file at `path` is overwritten.
    pub fn start_recording(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let path = path.as_ref();
        self.session.start(path)?;
        self.announce_recording(path);
        Ok(())
    }

    /// Start recording into `dir` under a timestamped file name.
    ///
    /// Never overwrites: if the name is taken (a restart within the same
    /// second), `_1`, `_2`, ... is appended to it.
    pub fn start_recording_in(&self, dir: impl AsRef<Path>) -> AppResult<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let name = log_file_name(&self.config.recording.file_prefix, &Local::now());
        let stem = name.strip_suffix(".txt").unwrap_or(&name);

        for attempt in 0..MAX_NAME_ATTEMPTS {
            let path = if attempt == 0 {
                dir.join(&name)
            } else {
                dir.join(format!("{stem}_{attempt}.txt"))
            };
            match self.session.start_new(&path) {
                Ok(()) => {
                    self.announce_recording(&path);
                    return Ok(path);
                }
                Err(RecordingStartError::CannotOpen { source, .. })
                    if source.kind() == ErrorKind::AlreadyExists =>
                {
                    debug!(path = %path.display(), "Log file name taken, trying next");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(DaqError::Configuration(format!(
            "No free log file name for '{name}' in {}",
            dir.display()
        )))
    }

    fn announce_recording(&self, path: &Path) {
        publish(
            &self.events,
            EngineEvent::RecordingStarted {
                path: path.to_path_buf(),
            },
        );
    }

    /// Stop recording. `None` if no recording was active.
    pub fn stop_recording(&self) -> AppResult<Option<RecordingSummary>> {
        let summary = self.session.stop()?;
        if let Some(summary) = &summary {
            publish(
                &self.events,
                EngineEvent::RecordingStopped {
                    path: summary.path.clone(),
                    rows: summary.rows,
                },
            );
        }
        Ok(summary)
    }

    /// True while a recording is open.
    pub fn is_recording(&self) -> bool {
        self.session.is_recording()
    }

    /// Time since the current recording started; zero when idle.
    pub fn elapsed(&self) -> Duration {
        self.session.elapsed()
    }

    /// Lifecycle state of the recording session.
    pub fn recording_state(&self) -> RecordingState {
        self.session.state()
    }

    /// Path of the open recording, if any.
    pub fn recording_path(&self) -> Option<PathBuf> {
        self.session.path()
    }

    /// The channel manifest fixed at construction.
    pub fn manifest(&self) -> &ChannelManifest {
        &self.manifest
    }

    /// Every chart history.
    pub fn histories(&self) -> &HistorySet {
        &self.histories
    }

    /// Snapshot of one history.
    pub fn snapshot(&self, id: BufferId) -> Vec<Sample> {
        self.histories.snapshot(id)
    }

    /// Empty every chart history.
    pub fn clear_histories(&self) {
        self.histories.clear_all();
        info!("Chart histories cleared");
    }

    /// Current visible chart span.
    pub fn history_window(&self) -> HistoryWindow {
        *self.window.lock()
    }

    /// Change the visible chart span and the time-axis divisor of every buffer.
    pub fn set_history_window(&self, window: HistoryWindow) {
        *self.window.lock() = window;
        self.histories.set_axis_divisor(window.axis_divisor());
    }

    /// Status of every device, primary first.
    pub fn device_statuses(&self) -> Vec<(String, DeviceStatus)> {
        self.devices
            .iter()
            .map(|d| (d.scheduler.device_id().to_string(), d.scheduler.status()))
            .collect()
    }

    /// Counters of `device_id`'s scheduler.
    pub fn device_stats(&self, device_id: &str) -> Option<SchedulerStats> {
        self.devices
            .iter()
            .find(|d| d.scheduler.device_id() == device_id)
            .map(|d| d.scheduler.stats())
    }

    /// Primary ticks routed into the buffers so far.
    pub fn rows_routed(&self) -> u64 {
        self.router.routed()
    }

    /// New receiver of engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// The shared tick clock.
    pub fn clock(&self) -> TickClock {
        self.clock
    }

    /// The configuration the context was built from.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Ordered, bounded shutdown. Only the first call does anything.
    pub fn shutdown(&self) -> AppResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down acquisition");
        let timeout = self.config.shutdown_timeout();
        let mut errors = Vec::new();
        let render = self.render.lock().take();

        for device in &self.devices {
            device.scheduler.halt();
        }
        if let Some(render) = &render {
            render.halt();
        }

        for device in &self.devices {
            if let Err(e) = device.scheduler.join(timeout) {
                errors.push(e);
            }
        }
        if let Some(render) = &render {
            if let Err(e) = render.join(timeout) {
                errors.push(e);
            }
        }

        if let Err(e) = self.stop_recording() {
            errors.push(e);
        }

        for device in &self.devices {
            if let Err(e) = device.scheduler.close_device(timeout) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            info!("Shutdown complete");
            Ok(())
        } else {
            for e in &errors {
                error!(error = %e, "Shutdown step failed");
            }
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

impl Drop for AcquisitionContext {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "Error shutting down on drop");
        }
    }
}

/// Connect and configure one instrument. Returns whether it is usable.
fn bring_up(instrument: &mut dyn Instrument, device: &DeviceConfig) -> bool {
    if !instrument.connect() {
        warn!(device = %device.id, "Device did not answer");
        return false;
    }
    match instrument.begin(&device.setup_parameters()) {
        Ok(()) => {
            info!(device = %device.id, "Device ready");
            true
        }
        Err(e) => {
            warn!(device = %device.id, error = %e, "Device setup failed");
            false
        }
    }
}

fn scheduler_config(config: &AppConfig, device: &DeviceConfig) -> SchedulerConfig {
    SchedulerConfig {
        max_consecutive_failures: device.max_consecutive_failures,
        overflow_threshold: device.overflow_threshold(),
        shutdown_timeout: config.shutdown_timeout(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::ScriptedInstrument;

    fn boxed(instrument: ScriptedInstrument) -> Box<dyn Instrument> {
        Box::new(instrument)
    }

    fn scripted_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.primary.kind = "scripted".to_string();
        for device in &mut config.auxiliary {
            device.kind = "scripted".to_string();
        }
        config
    }

    #[test]
    fn manifest_comes_from_primary() {
        let config = scripted_config();
        let ctx = AcquisitionContext::new(
            config,
            boxed(ScriptedInstrument::new("mux", ["101", "102"])),
            vec![
                boxed(ScriptedInstrument::new("bath", ["P1", "P2"])),
                boxed(ScriptedInstrument::new("pt104", ["ch1"])),
            ],
        )
        .expect("context");
        assert_eq!(ctx.manifest().labels(), ["101", "102"]);
        assert_eq!(ctx.histories().channels()[0].label(), "CH101");
        assert_eq!(ctx.histories().auxiliary().len(), 3);
        assert_eq!(ctx.history_window(), HistoryWindow::Min3);
        assert_eq!(ctx.histories().channels()[1].axis_divisor(), 60e3);
    }

    #[test]
    fn unreachable_primary_is_fatal() {
        let result = AcquisitionContext::new(
            scripted_config(),
            boxed(ScriptedInstrument::new("mux", ["101"]).unreachable()),
            vec![
                boxed(ScriptedInstrument::new("bath", ["P1", "P2"])),
                boxed(ScriptedInstrument::new("pt104", ["ch1"])),
            ],
        );
        assert!(matches!(result, Err(DaqError::DeviceUnavailable(id)) if id == "mux"));
    }

    #[test]
    fn unreachable_auxiliary_is_marked_unavailable() {
        let ctx = AcquisitionContext::new(
            scripted_config(),
            boxed(ScriptedInstrument::new("mux", ["101"])),
            vec![
                boxed(ScriptedInstrument::new("bath", ["P1", "P2"]).unreachable()),
                boxed(ScriptedInstrument::new("pt104", ["ch1"])),
            ],
        )
        .expect("context");
        let statuses = ctx.device_statuses();
        assert_eq!(statuses[1], ("bath".to_string(), DeviceStatus::Unavailable));
        assert_eq!(statuses[2].1, DeviceStatus::Idle);
    }

    #[test]
    fn instrument_count_must_match_config() {
        let result = AcquisitionContext::new(
            scripted_config(),
            boxed(ScriptedInstrument::new("mux", ["101"])),
            vec![],
        );
        assert!(matches!(result, Err(DaqError::Configuration(_))));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let result = AcquisitionContext::from_config(scripted_config(), &InstrumentRegistry::new());
        assert!(matches!(result, Err(DaqError::Configuration(msg)) if msg.contains("scripted")));
    }
}
