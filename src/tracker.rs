// src/tracker.rs
//! Tracking coordinator
//!
//! `Tracker` is the application context of a tracking run. It owns the
//! recorder and the geofence monitor and multiplexes position events, fence
//! ticks, connectivity changes and shutdown in one select loop, so every
//! component sees one handler at a time.

use crate::{
    error::{PositionErrorKind, Result, TrackerError},
    geofence::{GeofenceMonitor, GeofenceViolation},
    model::SessionSummary,
    position::{Position, PositionEvent, PositionSource},
    recorder::TrackRecorder,
};
use chrono::{DateTime, Utc};
use std::{
    future::Future,
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, info, warn};

/// Snapshot of the running tracker for display.
#[derive(Debug, Clone, Default)]
pub struct TrackerStatus {
    pub session_id: Option<String>,
    pub route_name: Option<String>,
    pub active: bool,
    pub online: bool,
    pub last_position: Option<Position>,
    pub distance_meters: f64,
    pub samples: usize,
    pub queued: usize,
    pub violations: usize,
    pub last_violation: Option<GeofenceViolation>,
    pub last_error: Option<PositionErrorKind>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TrackerStatus {
    pub fn speed_kmh(&self) -> f64 {
        self.last_position.map_or(0.0, |p| p.speed_kmh())
    }

    pub fn distance_km(&self) -> f64 {
        self.distance_meters / 1000.0
    }
}

/// Where to put the geofence when a session starts.
#[derive(Debug, Clone, Copy, Default)]
pub struct FenceSetup {
    /// Defaults to the session's first fix
    pub center: Option<Position>,
    pub radius_meters: Option<f64>,
}

pub struct Tracker {
    recorder: TrackRecorder,
    geofence: GeofenceMonitor,
    connectivity: watch::Receiver<bool>,
    status: Arc<RwLock<TrackerStatus>>,
    exit_on_stream_end: bool,
}

impl Tracker {
    pub fn new(
        recorder: TrackRecorder,
        geofence: GeofenceMonitor,
        connectivity: watch::Receiver<bool>,
    ) -> Self {
        Self {
            recorder,
            geofence,
            connectivity,
            status: Arc::new(RwLock::new(TrackerStatus::default())),
            exit_on_stream_end: false,
        }
    }

    /// End `run` when the position stream finishes instead of idling
    pub fn exit_on_stream_end(mut self, exit: bool) -> Self {
        self.exit_on_stream_end = exit;
        self
    }

    /// Shared status, refreshed after every handled event
    pub fn status(&self) -> Arc<RwLock<TrackerStatus>> {
        Arc::clone(&self.status)
    }

    pub fn recorder(&self) -> &TrackRecorder {
        &self.recorder
    }

    pub fn geofence(&self) -> &GeofenceMonitor {
        &self.geofence
    }

    /// Start a session, or resume a fresh snapshot when `resume` is set.
    pub async fn start(
        &mut self,
        source: &dyn PositionSource,
        route_id: &str,
        route_name: &str,
        fence: Option<FenceSetup>,
        resume: bool,
    ) -> Result<()> {
        let resumed = resume && self.recorder.resume_from_store(source).await?;
        if !resumed {
            self.recorder.start(source, route_id, route_name).await?;
        }

        if let Some(setup) = fence {
            let center = setup
                .center
                .or_else(|| self.recorder.last_position())
                .ok_or(TrackerError::Position(PositionErrorKind::PositionUnavailable))?;
            let route = self
                .recorder
                .session()
                .map_or_else(|| route_id.to_string(), |s| s.route_id.clone());
            self.geofence.start(route, center, setup.radius_meters);
        }

        self.refresh_status();
        Ok(())
    }

    /// Drive the session until `shutdown` resolves or the session ends.
    ///
    /// Stops the session on the way out and returns its summary.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<Option<SessionSummary>>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut online = *self.connectivity.borrow_and_update();
        let mut connectivity_open = true;
        let mut stream_open = true;

        let retry_period = Duration::from_secs(self.recorder.config().offline_retry_secs.max(1));
        let first_retry = tokio::time::Instant::now() + retry_period;
        let mut retry = tokio::time::interval_at(first_retry, retry_period);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if online && self.recorder.offline_len() > 0 {
            self.recorder.flush_offline().await;
        }
        self.set_online(online);
        self.refresh_status();

        while self.recorder.is_active() {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                event = self.recorder.next_event(), if stream_open => {
                    match event {
                        Some(event) => self.handle_position(event).await,
                        None => {
                            info!("Position stream ended");
                            stream_open = false;
                            if self.exit_on_stream_end {
                                break;
                            }
                        }
                    }
                }
                _ = self.geofence.next_tick() => {
                    let last = self.recorder.last_position();
                    if let Some(violation) = self.geofence.check(last.as_ref(), Utc::now()) {
                        self.record_violation(violation);
                    }
                }
                changed = self.connectivity.changed(), if connectivity_open => {
                    match changed {
                        Ok(()) => {
                            let now_online = *self.connectivity.borrow_and_update();
                            if now_online && !online {
                                info!("Connectivity restored");
                                self.recorder.flush_offline().await;
                            } else if !now_online && online {
                                warn!("Connectivity lost");
                            }
                            online = now_online;
                        }
                        Err(_) => {
                            debug!("Connectivity feed closed");
                            connectivity_open = false;
                        }
                    }
                }
                _ = retry.tick() => {
                    if online && self.recorder.offline_len() > 0 {
                        self.recorder.flush_offline().await;
                    }
                }
            }
            self.set_online(online);
            self.refresh_status();
        }

        self.finish(online).await
    }

    async fn handle_position(&mut self, event: PositionEvent) {
        if let PositionEvent::Error(kind) = event {
            self.with_status(|s| s.last_error = Some(kind));
        }
        self.recorder.handle_event(event).await;
    }

    fn record_violation(&mut self, violation: GeofenceViolation) {
        self.with_status(|s| s.last_violation = Some(violation));
    }

    async fn finish(&mut self, online: bool) -> Result<Option<SessionSummary>> {
        self.geofence.stop();

        if online && self.recorder.offline_len() > 0 {
            self.recorder.flush_offline().await;
        }

        let summary = match self.recorder.stop().await {
            Ok(Some(summary)) => Some(summary),
            Ok(None) => self.recorder.session().map(|s| s.summary(Utc::now())),
            Err(TrackerError::NotActive) => None,
            Err(e) => return Err(e),
        };

        let queued = self.recorder.offline_len();
        if queued > 0 {
            warn!(queued, "History points still queued locally");
        }
        self.refresh_status();
        Ok(summary)
    }

    fn set_online(&self, online: bool) {
        self.with_status(|s| s.online = online);
    }

    fn refresh_status(&self) {
        let session = self.recorder.session();
        let violations = self.geofence.geofence().map_or(0, |f| f.violations.len());
        let active = self.recorder.is_active();
        let queued = self.recorder.offline_len();

        self.with_status(|s| {
            s.session_id = session.map(|x| x.session_id.clone());
            s.route_name = session.map(|x| x.route_name.clone());
            s.active = active;
            s.last_position = session.and_then(|x| x.last_position);
            s.distance_meters = session.map_or(0.0, |x| x.cumulative_distance_meters);
            s.samples = session.map_or(0, |x| x.sample_count());
            s.queued = queued;
            s.violations = violations;
            s.updated_at = Some(Utc::now());
        });
    }

    fn with_status(&self, update: impl FnOnce(&mut TrackerStatus)) {
        let mut guard = self.status.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut guard);
    }
}

/// Report whether `dir` is present and writable, checked every `period`.
///
/// For a store on removable or network-mounted storage this stands in for
/// connectivity.
pub fn spawn_dir_probe(dir: PathBuf, period: Duration) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(dir_reachable(&dir));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tx.closed() => break,
            }
            let reachable = dir_reachable(&dir);
            tx.send_if_modified(|current| {
                let changed = *current != reachable;
                *current = reachable;
                changed
            });
        }
    });
    rx
}

fn dir_reachable(dir: &std::path::Path) -> bool {
    match std::fs::metadata(dir) {
        Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
        Err(_) => std::fs::create_dir_all(dir).is_ok(),
    }
}
