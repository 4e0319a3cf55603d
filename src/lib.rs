//! # Thermistor calibration DAQ core
//!
//! Continuously polls several independent instruments at their own fixed
//! cadences, keeps fixed-capacity histories of every signal for live charts,
//! and optionally records a merged, time-aligned log file.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: one polling thread per device (`AcquisitionScheduler`),
//!   the primary tick handler (`DataRouter`) and the auxiliary one
//!   (`AuxiliaryFeed`), plus the `EngineEvent` channel.
//! - **`config`**: figment-based configuration (`AppConfig`).
//! - **`core`**: readings, ticks, the tick clock and the `TickHandler` capability.
//! - **`data`**: `HistoryBuffer`/`HistorySet` and the `RecordingSession` log writer.
//! - **`engine`**: `AcquisitionContext`, the explicit owner of a running
//!   acquisition and its ordered shutdown.
//! - **`error`**: `DaqError` and the driver-level `InstrumentError`.
//! - **`instrument`**: the `Instrument` capability, a registry, simulated and
//!   scripted instruments.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`render`**: the periodic `RenderTick`, history windows and renderers.

pub mod acquisition;
pub mod config;
pub mod core;
pub mod data;
pub mod engine;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod render;

pub use engine::AcquisitionContext;
pub use error::{AppResult, DaqError};
