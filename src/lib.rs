// src/lib.rs
//! Fleet Tracker Library
//!
//! Location tracking and trip history for a single vehicle: continuous
//! position sampling, distance integration, durable offline buffering of
//! history points, geofence checks and variable-speed trip playback.

pub mod config;
pub mod display;
pub mod error;
pub mod geo;
pub mod geofence;
pub mod logging;
pub mod model;
pub mod offline;
pub mod playback;
pub mod position;
pub mod recorder;
pub mod sink;
pub mod snapshot;
pub mod tracker;

// Re-export main types for convenience
pub use config::TrackerConfig;
pub use error::{PositionErrorKind, Result, SinkError, TrackerError};
pub use geofence::{Geofence, GeofenceMonitor, GeofenceViolation};
pub use model::{HistoryPoint, SessionKey, SessionSummary, TrackSession};
pub use offline::{JsonFileQueueStore, MemoryQueueStore, OfflineBuffer, OfflineEntry, QueueStore};
pub use playback::{Frame, PlaybackEngine, PlaybackEvent, RunningStats};
pub use position::{
    GpsdSource, Position, PositionEvent, PositionOptions, PositionSource, ScriptedSource,
};
pub use recorder::{RecorderEvent, RecorderState, TrackRecorder};
pub use sink::{DataSink, DateRange, JsonDirSink, LiveStatus, MemorySink};
pub use tracker::{FenceSetup, Tracker, TrackerStatus};
