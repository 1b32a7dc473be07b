// src/sink.rs
//! Persistence sink: live status, append-only history and history queries

use crate::{
    error::SinkError,
    model::{HistoryPoint, SessionKey, TrackSession},
    position::Position,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
};
use tokio::io::AsyncWriteExt;

/// Overwrite-in-place record used for real-time display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveStatus {
    pub session_id: String,
    pub route_id: String,
    pub route_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: f64,
    pub accuracy_meters: f64,
    pub distance_meters: f64,
    pub active: bool,
    pub online: bool,
    pub updated_at: DateTime<Utc>,
}

impl LiveStatus {
    pub fn from_session(
        session: &TrackSession,
        position: &Position,
        active: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session.session_id.clone(),
            route_id: session.route_id.clone(),
            route_name: session.route_name.clone(),
            latitude: position.latitude,
            longitude: position.longitude,
            speed_kmh: position.speed_kmh(),
            accuracy_meters: position.accuracy_meters,
            distance_meters: session.cumulative_distance_meters,
            active,
            online: active,
            updated_at: now,
        }
    }
}

/// Inclusive time window for history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Whole UTC calendar day
    pub fn day(date: NaiveDate) -> Self {
        let start = Utc.from_utc_datetime(&date.and_time(NaiveTime::default()));
        let end = start + chrono::Duration::days(1) - chrono::Duration::milliseconds(1);
        Self { start, end }
    }

    pub fn all() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// External document store the tracker writes to.
#[async_trait]
pub trait DataSink: Send + Sync {
    /// Best-effort, overwrite-by-key.
    async fn write_live_status(
        &self,
        key: &SessionKey,
        status: &LiveStatus,
    ) -> Result<(), SinkError>;

    /// Append-only; a point is never rewritten.
    async fn append_history_point(
        &self,
        key: &SessionKey,
        point: &HistoryPoint,
    ) -> Result<(), SinkError>;

    /// History for `key` inside `range`, ordered by capture time.
    async fn read_history(
        &self,
        key: &SessionKey,
        range: &DateRange,
    ) -> Result<Vec<HistoryPoint>, SinkError>;
}

fn in_capture_order(mut points: Vec<HistoryPoint>, range: &DateRange) -> Vec<HistoryPoint> {
    points.retain(|p| range.contains(p.captured_at()));
    points.sort_by_key(|p| p.captured_at());
    points
}

#[derive(Debug, Default)]
struct MemoryInner {
    live: HashMap<SessionKey, LiveStatus>,
    history: HashMap<SessionKey, Vec<HistoryPoint>>,
}

/// In-process sink with a switchable availability.
#[derive(Debug)]
pub struct MemorySink {
    inner: Mutex<MemoryInner>,
    available: AtomicBool,
    fail_next: AtomicUsize,
    live_writes: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            available: AtomicBool::new(true),
            fail_next: AtomicUsize::new(0),
            live_writes: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Reject the next `count` writes of any kind
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn live_status(&self, key: &SessionKey) -> Option<LiveStatus> {
        self.lock().live.get(key).cloned()
    }

    /// Stored history in insertion order
    pub fn history(&self, key: &SessionKey) -> Vec<HistoryPoint> {
        self.lock().history.get(key).cloned().unwrap_or_default()
    }

    pub fn live_write_count(&self) -> usize {
        self.live_writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_write(&self) -> Result<(), SinkError> {
        if !self.is_available() {
            return Err(SinkError::Unavailable("memory sink offline".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SinkError::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSink for MemorySink {
    async fn write_live_status(
        &self,
        key: &SessionKey,
        status: &LiveStatus,
    ) -> Result<(), SinkError> {
        self.check_write()?;
        self.live_writes.fetch_add(1, Ordering::SeqCst);
        self.lock().live.insert(key.clone(), status.clone());
        Ok(())
    }

    async fn append_history_point(
        &self,
        key: &SessionKey,
        point: &HistoryPoint,
    ) -> Result<(), SinkError> {
        self.check_write()?;
        self.lock().history.entry(key.clone()).or_default().push(*point);
        Ok(())
    }

    async fn read_history(
        &self,
        key: &SessionKey,
        range: &DateRange,
    ) -> Result<Vec<HistoryPoint>, SinkError> {
        if !self.is_available() {
            return Err(SinkError::Unavailable("memory sink offline".to_string()));
        }
        Ok(in_capture_order(self.history(key), range))
    }
}

/// Directory-backed document store.
///
/// Layout: `live/<key>.json` holds the latest status, `history/<key>.jsonl`
/// holds one history point per line.
#[derive(Debug, Clone)]
pub struct JsonDirSink {
    root: PathBuf,
}

impl JsonDirSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn live_path(&self, key: &SessionKey) -> PathBuf {
        self.root.join("live").join(format!("{}.json", key.file_stem()))
    }

    fn history_path(&self, key: &SessionKey) -> PathBuf {
        self.root.join("history").join(format!("{}.jsonl", key.file_stem()))
    }

    pub async fn read_live_status(
        &self,
        key: &SessionKey,
    ) -> Result<Option<LiveStatus>, SinkError> {
        match tokio::fs::read_to_string(self.live_path(key)).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(|e| SinkError::Rejected(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(e)),
        }
    }
}

fn unavailable(e: std::io::Error) -> SinkError {
    SinkError::Unavailable(e.to_string())
}

async fn ensure_parent(path: &Path) -> Result<(), SinkError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(unavailable)?;
    }
    Ok(())
}

#[async_trait]
impl DataSink for JsonDirSink {
    async fn write_live_status(
        &self,
        key: &SessionKey,
        status: &LiveStatus,
    ) -> Result<(), SinkError> {
        let path = self.live_path(key);
        ensure_parent(&path).await?;

        let contents = serde_json::to_string_pretty(status)
            .map_err(|e| SinkError::Rejected(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await.map_err(unavailable)?;
        tokio::fs::rename(&tmp, &path).await.map_err(unavailable)?;
        Ok(())
    }

    async fn append_history_point(
        &self,
        key: &SessionKey,
        point: &HistoryPoint,
    ) -> Result<(), SinkError> {
        let path = self.history_path(key);
        ensure_parent(&path).await?;

        let mut line = serde_json::to_string(point)
            .map_err(|e| SinkError::Rejected(e.to_string()))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(unavailable)?;
        file.write_all(line.as_bytes()).await.map_err(unavailable)?;
        file.flush().await.map_err(unavailable)?;
        Ok(())
    }

    async fn read_history(
        &self,
        key: &SessionKey,
        range: &DateRange,
    ) -> Result<Vec<HistoryPoint>, SinkError> {
        let contents = match tokio::fs::read_to_string(self.history_path(key)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(unavailable(e)),
        };

        let mut points = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<HistoryPoint>(line) {
                Ok(point) => points.push(point),
                // A torn final line from an interrupted append is skipped.
                Err(e) => {
                    tracing::warn!(error = %e, key = %key, "Skipping unreadable history line")
                }
            }
        }

        Ok(in_capture_order(points, range))
    }
}
