// src/recorder.rs
//! Tracking session state machine
//!
//! A `TrackRecorder` owns one `TrackSession` at a time. Every accepted sample
//! extends the live trail and the cumulative distance before any write is
//! attempted, so sink outages never affect the distance figures. History points
//! that cannot be written are redirected to the `OfflineBuffer`.

use crate::{
    config::PositionConfig,
    error::{PositionErrorKind, Result, TrackerError},
    geo,
    model::{HistoryPoint, SessionKey, SessionSummary, TrackSession},
    offline::{OfflineBuffer, OfflineEntry, RouteContext},
    position::{Position, PositionEvent, PositionSource, Watch},
    sink::{DataSink, LiveStatus},
    snapshot::{SessionSnapshot, SnapshotStore},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Persist a history point at least this often (capture time)
    pub history_interval_secs: u64,
    /// ...or whenever the vehicle moved this far since the last one
    pub history_distance_meters: f64,
    pub live_point_capacity: usize,
    pub snapshot_max_age_secs: u64,
    pub snapshot_points: usize,
    /// Retry draining the offline queue this often while it is non-empty
    pub offline_retry_secs: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            history_interval_secs: 30,
            history_distance_meters: 100.0,
            live_point_capacity: 1000,
            snapshot_max_age_secs: 3600,
            snapshot_points: 100,
            offline_retry_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Active,
    Stopped,
}

/// What happened to the history point candidate of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    /// Below both thresholds
    Skipped,
    Persisted,
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleOutcome {
    pub leg_meters: f64,
    pub cumulative_distance_meters: f64,
    pub live_written: bool,
    pub history: HistoryOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEvent {
    Started { session_id: String, route_name: String },
    Sample { position: Position, cumulative_distance_meters: f64 },
    HistoryPersisted(HistoryPoint),
    HistoryQueued { point: HistoryPoint, queued: usize },
    /// First failed history write of an offline period
    WentOffline,
    Synced { flushed: usize, remaining: usize },
    PositionError(PositionErrorKind),
    Stopped(SessionSummary),
}

pub struct TrackRecorder {
    key: SessionKey,
    config: RecorderConfig,
    position_options: PositionConfig,
    sink: Arc<dyn DataSink>,
    buffer: OfflineBuffer,
    state: RecorderState,
    session: Option<TrackSession>,
    last_persisted: Option<Position>,
    watch: Option<Watch>,
    offline: bool,
    events: Option<mpsc::UnboundedSender<RecorderEvent>>,
    snapshots: Option<SnapshotStore>,
}

impl TrackRecorder {
    pub fn new(
        key: SessionKey,
        sink: Arc<dyn DataSink>,
        buffer: OfflineBuffer,
        config: RecorderConfig,
    ) -> Self {
        Self {
            key,
            config,
            position_options: PositionConfig::default(),
            sink,
            buffer,
            state: RecorderState::Idle,
            session: None,
            last_persisted: None,
            watch: None,
            offline: false,
            events: None,
            snapshots: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<RecorderEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_position_options(mut self, options: PositionConfig) -> Self {
        self.position_options = options;
        self
    }

    pub fn with_snapshot_store(mut self, store: SnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == RecorderState::Active
    }

    /// Current session, also available after `stop` until `reset`
    pub fn session(&self) -> Option<&TrackSession> {
        self.session.as_ref()
    }

    pub fn last_position(&self) -> Option<Position> {
        self.session.as_ref().and_then(|s| s.last_position)
    }

    pub fn cumulative_distance_meters(&self) -> f64 {
        self.session.as_ref().map_or(0.0, |s| s.cumulative_distance_meters)
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn offline_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn offline_buffer(&self) -> &OfflineBuffer {
        &self.buffer
    }

    /// Begin a session from one fresh fix, then follow the continuous stream.
    pub async fn start(
        &mut self,
        source: &dyn PositionSource,
        route_id: impl Into<String>,
        route_name: impl Into<String>,
    ) -> Result<()> {
        if self.state != RecorderState::Idle {
            return Err(TrackerError::AlreadyActive);
        }

        let initial = source.get_once(&self.position_options.one_shot).await?;

        let now = Utc::now();
        let session_id = format!("{}-{}", self.key.file_stem(), now.timestamp_millis());
        let session = TrackSession::new(
            session_id.clone(),
            route_id.into(),
            route_name.into(),
            now,
            self.config.live_point_capacity,
        );
        info!(session = %session_id, route = %session.route_name, "Tracking started");
        self.emit(RecorderEvent::Started {
            session_id,
            route_name: session.route_name.clone(),
        });

        self.session = Some(session);
        self.state = RecorderState::Active;
        self.last_persisted = None;
        self.offline = false;

        self.process_sample(initial).await;
        self.watch = Some(source.watch(&self.position_options.watch));
        Ok(())
    }

    /// Rebuild an active session from a snapshot and re-attach to `source`.
    ///
    /// Returns `false` (and discards the snapshot) when it is older than the
    /// configured maximum age.
    pub async fn resume(
        &mut self,
        source: &dyn PositionSource,
        snapshot: SessionSnapshot,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if self.state != RecorderState::Idle {
            return Err(TrackerError::AlreadyActive);
        }

        let max_age = Duration::from_secs(self.config.snapshot_max_age_secs);
        if !snapshot.is_fresh(now, max_age) {
            info!(session = %snapshot.session_id, "Discarding stale session snapshot");
            self.clear_snapshot();
            return Ok(false);
        }

        let mut session = TrackSession::new(
            snapshot.session_id.clone(),
            snapshot.route_id,
            snapshot.route_name,
            snapshot.started_at,
            self.config.live_point_capacity,
        );
        for point in snapshot.recent_points {
            session.push_live(point);
        }
        session.restore_sample_count(snapshot.sample_count);
        session.cumulative_distance_meters = snapshot.cumulative_distance_meters;
        session.last_position = snapshot.last_position;

        info!(
            session = %session.session_id,
            distance_m = session.cumulative_distance_meters,
            "Resumed tracking session"
        );
        self.emit(RecorderEvent::Started {
            session_id: session.session_id.clone(),
            route_name: session.route_name.clone(),
        });

        self.session = Some(session);
        self.state = RecorderState::Active;
        self.last_persisted = snapshot.last_persisted;
        self.offline = false;
        self.watch = Some(source.watch(&self.position_options.watch));
        Ok(true)
    }

    /// Resume from the attached snapshot store, if it holds a fresh snapshot
    pub async fn resume_from_store(&mut self, source: &dyn PositionSource) -> Result<bool> {
        let snapshot = match &self.snapshots {
            Some(store) => store.load()?,
            None => None,
        };
        match snapshot {
            Some(snapshot) if snapshot.session_key == self.key => {
                self.resume(source, snapshot, Utc::now()).await
            }
            _ => Ok(false),
        }
    }

    /// Wait for the next event of the running watch; `None` once it has ended
    pub async fn next_event(&mut self) -> Option<PositionEvent> {
        match self.watch.as_mut() {
            Some(watch) => watch.next_event().await,
            None => None,
        }
    }

    pub async fn handle_event(&mut self, event: PositionEvent) {
        match event {
            PositionEvent::Sample(position) => {
                self.process_sample(position).await;
            }
            PositionEvent::Error(kind) => {
                warn!(error = %kind, "Position error");
                self.emit(RecorderEvent::PositionError(kind));
                if kind.is_terminal() && self.is_active() {
                    if let Err(e) = self.stop().await {
                        warn!("Failed to stop after {}: {}", kind, e);
                    }
                }
            }
        }
    }

    /// Drive the watch until it ends or the session stops
    pub async fn run_until_stopped(&mut self) {
        while self.is_active() {
            match self.next_event().await {
                Some(event) => self.handle_event(event).await,
                None => break,
            }
        }
    }

    /// Apply one sample to the session. Returns `None` unless active.
    pub async fn process_sample(&mut self, position: Position) -> Option<SampleOutcome> {
        if self.state != RecorderState::Active {
            return None;
        }

        let now = Utc::now();
        let (leg_meters, total, status, persist) = {
            let session = self.session.as_mut()?;
            session.push_live(position);
            let leg = session.add_leg_to(&position);
            let status = LiveStatus::from_session(session, &position, true, now);
            let persist = match &self.last_persisted {
                None => true,
                Some(last) => {
                    // Out-of-order capture times count as no time elapsed
                    let elapsed = position
                        .captured_at
                        .signed_duration_since(last.captured_at)
                        .to_std()
                        .unwrap_or_default();
                    let moved = geo::distance_meters(last, &position);
                    elapsed >= Duration::from_secs(self.config.history_interval_secs)
                        || moved >= self.config.history_distance_meters
                }
            };
            session.last_position = Some(position);
            (leg, session.cumulative_distance_meters, status, persist)
        };

        let live_written = match self.sink.write_live_status(&self.key, &status).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Live status dropped: {}", e);
                false
            }
        };

        let history = if persist {
            self.persist_history(HistoryPoint::new(position, total)).await
        } else {
            HistoryOutcome::Skipped
        };

        self.save_snapshot();
        self.emit(RecorderEvent::Sample {
            position,
            cumulative_distance_meters: total,
        });

        Some(SampleOutcome {
            leg_meters,
            cumulative_distance_meters: total,
            live_written,
            history,
        })
    }

    async fn persist_history(&mut self, point: HistoryPoint) -> HistoryOutcome {
        self.last_persisted = Some(point.position);

        if !self.buffer.is_empty() {
            self.enqueue(point);
            HistoryOutcome::Queued
        } else {
            match self.sink.append_history_point(&self.key, &point).await {
                Ok(()) => {
                    self.emit(RecorderEvent::HistoryPersisted(point));
                    HistoryOutcome::Persisted
                }
                Err(e) => {
                    warn!("History write failed, saving locally: {}", e);
                    self.enqueue(point);
                    HistoryOutcome::Queued
                }
            }
        }
    }

    fn enqueue(&mut self, point: HistoryPoint) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let context = RouteContext {
            session_key: self.key.clone(),
            session_id: session.session_id.clone(),
            route_id: session.route_id.clone(),
            route_name: session.route_name.clone(),
            cumulative_distance_meters: point.cumulative_distance_meters,
        };
        self.buffer.enqueue(OfflineEntry::new(&point, context, Utc::now()));

        if !self.offline {
            self.offline = true;
            warn!("Offline, saving locally");
            self.emit(RecorderEvent::WentOffline);
        }
        self.emit(RecorderEvent::HistoryQueued {
            point,
            queued: self.buffer.len(),
        });
    }

    /// Replay queued history points into the sink. Call on reconnect.
    pub async fn flush_offline(&mut self) -> usize {
        if self.buffer.is_empty() {
            return 0;
        }
        let flushed = self.buffer.flush(self.sink.as_ref()).await;
        let remaining = self.buffer.len();
        if remaining == 0 {
            self.offline = false;
        }
        if flushed > 0 {
            info!(flushed, remaining, "Synced offline history");
            self.emit(RecorderEvent::Synced { flushed, remaining });
        }
        flushed
    }

    /// End the session. A second call after a successful stop is a no-op.
    pub async fn stop(&mut self) -> Result<Option<SessionSummary>> {
        match self.state {
            RecorderState::Idle => return Err(TrackerError::NotActive),
            RecorderState::Stopped => return Ok(None),
            RecorderState::Active => {}
        }

        self.state = RecorderState::Stopped;
        if let Some(mut watch) = self.watch.take() {
            watch.stop();
        }

        let now = Utc::now();
        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };
        session.ended_at = Some(now);

        if let Some(last) = session.last_position {
            let status = LiveStatus::from_session(session, &last, false, now);
            if let Err(e) = self.sink.write_live_status(&self.key, &status).await {
                warn!("Final status write failed: {}", e);
            }
        }

        let summary = session.summary(now);
        info!(
            session = %summary.session_id,
            points = summary.points,
            distance_km = summary.distance_km,
            duration = %summary.format_duration(),
            "Tracking stopped"
        );
        self.clear_snapshot();
        self.emit(RecorderEvent::Stopped(summary.clone()));
        Ok(Some(summary))
    }

    /// Drop a stopped session and return to `Idle`
    pub fn reset(&mut self) -> Result<()> {
        if self.state == RecorderState::Active {
            return Err(TrackerError::AlreadyActive);
        }
        self.state = RecorderState::Idle;
        self.session = None;
        self.last_persisted = None;
        Ok(())
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> Option<SessionSnapshot> {
        if self.state != RecorderState::Active {
            return None;
        }
        let session = self.session.as_ref()?;
        let skip = session.live_points.len().saturating_sub(self.config.snapshot_points);
        Some(SessionSnapshot {
            session_key: self.key.clone(),
            session_id: session.session_id.clone(),
            route_id: session.route_id.clone(),
            route_name: session.route_name.clone(),
            started_at: session.started_at,
            saved_at: now,
            cumulative_distance_meters: session.cumulative_distance_meters,
            sample_count: session.sample_count(),
            last_position: session.last_position,
            last_persisted: self.last_persisted,
            recent_points: session.live_points.iter().skip(skip).copied().collect(),
        })
    }

    fn save_snapshot(&self) {
        let (Some(store), Some(snapshot)) = (&self.snapshots, self.snapshot(Utc::now())) else {
            return;
        };
        if let Err(e) = store.save(&snapshot) {
            warn!("Failed to save session snapshot: {}", e);
        }
    }

    fn clear_snapshot(&self) {
        if let Some(store) = &self.snapshots {
            if let Err(e) = store.clear() {
                warn!("Failed to clear session snapshot: {}", e);
            }
        }
    }

    fn emit(&self, event: RecorderEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

impl std::fmt::Debug for TrackRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackRecorder")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("offline", &self.offline)
            .field("queued", &self.buffer.len())
            .finish()
    }
}
