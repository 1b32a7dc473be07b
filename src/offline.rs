// src/offline.rs
//! Durable queue of history points that could not be written to the sink

use crate::{
    error::{Result, TrackerError},
    model::{HistoryPoint, SessionKey},
    position::Position,
    sink::DataSink,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashSet, VecDeque},
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// Coordinates as laid out in a stored queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoredCoords {
    pub lat: f64,
    pub lng: f64,
    pub accuracy: f64,
    pub speed: Option<f64>,
}

/// Which session and route a queued point belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteContext {
    pub session_key: SessionKey,
    pub session_id: String,
    pub route_id: String,
    pub route_name: String,
    pub cumulative_distance_meters: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineEntry {
    /// Assigned by the buffer on enqueue
    pub id: u64,
    pub position: StoredCoords,
    pub captured_at_iso: DateTime<Utc>,
    pub route_context: RouteContext,
    pub enqueued_at: DateTime<Utc>,
}

impl OfflineEntry {
    pub fn new(
        point: &HistoryPoint,
        route_context: RouteContext,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        let p = &point.position;
        Self {
            id: 0,
            position: StoredCoords {
                lat: p.latitude,
                lng: p.longitude,
                accuracy: p.accuracy_meters,
                speed: p.speed_mps,
            },
            captured_at_iso: p.captured_at,
            route_context,
            enqueued_at,
        }
    }

    pub fn to_position(&self) -> Position {
        Position {
            latitude: self.position.lat,
            longitude: self.position.lng,
            accuracy_meters: self.position.accuracy,
            speed_mps: self.position.speed,
            captured_at: self.captured_at_iso,
        }
    }

    /// The point to write, stamped with its original capture time
    pub fn to_history_point(&self) -> HistoryPoint {
        HistoryPoint::new(self.to_position(), self.route_context.cumulative_distance_meters)
    }
}

/// Backing storage for the offline queue. Must survive a process restart.
pub trait QueueStore: Send + Sync {
    fn append(&mut self, entry: &OfflineEntry) -> Result<()>;
    /// Entries in the order they were appended
    fn list(&self) -> Result<Vec<OfflineEntry>>;
    /// Deleting an unknown id is not an error
    fn delete(&mut self, id: u64) -> Result<()>;
}

/// Volatile store, optionally bounded to model a full disk.
#[derive(Debug, Default, Clone)]
pub struct MemoryQueueStore {
    entries: Vec<OfflineEntry>,
    capacity: Option<usize>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity: Some(capacity),
        }
    }
}

impl QueueStore for MemoryQueueStore {
    fn append(&mut self, entry: &OfflineEntry) -> Result<()> {
        if self.capacity.is_some_and(|cap| self.entries.len() >= cap) {
            return Err(TrackerError::Storage("queue store is full".to_string()));
        }
        self.entries.push(entry.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<OfflineEntry>> {
        Ok(self.entries.clone())
    }

    fn delete(&mut self, id: u64) -> Result<()> {
        self.entries.retain(|e| e.id != id);
        Ok(())
    }
}

/// Queue persisted as a JSON array, rewritten atomically on every change.
#[derive(Debug)]
pub struct JsonFileQueueStore {
    path: PathBuf,
    entries: Vec<OfflineEntry>,
    max_entries: Option<usize>,
}

impl JsonFileQueueStore {
    /// Open the queue file, creating nothing until the first append
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&contents)?
            }
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            entries,
            max_entries: None,
        })
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string(&self.entries)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl QueueStore for JsonFileQueueStore {
    fn append(&mut self, entry: &OfflineEntry) -> Result<()> {
        if self.max_entries.is_some_and(|max| self.entries.len() >= max) {
            return Err(TrackerError::Storage(format!(
                "queue file {} is full",
                self.path.display()
            )));
        }
        self.entries.push(entry.clone());
        if let Err(e) = self.write_file() {
            self.entries.pop();
            return Err(e);
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<OfflineEntry>> {
        Ok(self.entries.clone())
    }

    fn delete(&mut self, id: u64) -> Result<()> {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        if self.entries.len() != before {
            self.write_file()?;
        }
        Ok(())
    }
}

/// FIFO of unsent history points.
///
/// An entry leaves the queue exactly when its write to the sink is
/// acknowledged. Entries the store refused (for example because it is full)
/// are still kept in memory for the lifetime of the process.
pub struct OfflineBuffer {
    store: Box<dyn QueueStore>,
    entries: VecDeque<OfflineEntry>,
    unpersisted: HashSet<u64>,
    next_id: u64,
}

impl OfflineBuffer {
    /// Rebuild the queue from whatever the store holds
    pub fn open(store: Box<dyn QueueStore>) -> Result<Self> {
        let mut stored = store.list()?;
        stored.sort_by_key(|e| e.id);
        let next_id = stored.last().map_or(1, |e| e.id + 1);

        if !stored.is_empty() {
            info!(entries = stored.len(), "Restored offline queue");
        }

        Ok(Self {
            store,
            entries: stored.into(),
            unpersisted: HashSet::new(),
            next_id,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            store: Box::new(MemoryQueueStore::new()),
            entries: VecDeque::new(),
            unpersisted: HashSet::new(),
            next_id: 1,
        }
    }

    /// Append an entry. Never fails; a storage failure is logged and the entry
    /// is kept in memory. Returns the assigned id.
    pub fn enqueue(&mut self, mut entry: OfflineEntry) -> u64 {
        entry.id = self.next_id;
        self.next_id += 1;

        if let Err(e) = self.store.append(&entry) {
            warn!(id = entry.id, error = %e, "Offline store rejected entry; keeping it in memory");
            self.unpersisted.insert(entry.id);
        }

        debug!(id = entry.id, captured_at = %entry.captured_at_iso, "Queued history point");
        let id = entry.id;
        self.entries.push_back(entry);
        id
    }

    /// Write queued entries to `sink` one at a time, oldest first, removing
    /// each as soon as it is acknowledged. Stops at the first failure and
    /// returns how many entries were flushed.
    pub async fn flush(&mut self, sink: &dyn DataSink) -> usize {
        let mut flushed = 0;

        while let Some(entry) = self.entries.front() {
            let key = entry.route_context.session_key.clone();
            let point = entry.to_history_point();
            let id = entry.id;

            if let Err(e) = sink.append_history_point(&key, &point).await {
                warn!(id, error = %e, remaining = self.entries.len(), "Offline flush stopped");
                break;
            }

            self.entries.pop_front();
            self.unpersisted.remove(&id);
            flushed += 1;
            if let Err(e) = self.store.delete(id) {
                warn!(id, error = %e, "Flushed entry could not be removed from the offline store");
            }
        }

        if flushed > 0 {
            info!(flushed, remaining = self.entries.len(), "Flushed offline queue");
        }
        flushed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries the backing store currently holds
    pub fn persisted_len(&self) -> usize {
        self.store.list().map(|l| l.len()).unwrap_or(0)
    }

    /// Entries held only in memory because the store refused them
    pub fn unpersisted_len(&self) -> usize {
        self.unpersisted.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &OfflineEntry> {
        self.entries.iter()
    }
}

impl std::fmt::Debug for OfflineBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineBuffer")
            .field("entries", &self.entries.len())
            .field("unpersisted", &self.unpersisted.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{DateRange, MemorySink};
    use chrono::TimeZone;

    fn entry(secs: i64) -> OfflineEntry {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let at = start + chrono::Duration::seconds(secs);
        let point = HistoryPoint::new(
            Position::new(-5.0892 + secs as f64 * 1e-4, -42.8019, at)
                .with_accuracy(4.2)
                .with_speed(8.3),
            secs as f64 * 10.0,
        );
        let context = RouteContext {
            session_key: SessionKey::new("1234"),
            session_id: "1234-s".to_string(),
            route_id: "r-1".to_string(),
            route_name: "Centro".to_string(),
            cumulative_distance_meters: point.cumulative_distance_meters,
        };
        OfflineEntry::new(&point, context, at + chrono::Duration::seconds(1))
    }

    #[test]
    fn test_entry_layout() {
        let json = serde_json::to_value(entry(0)).unwrap();
        assert!(json.get("capturedAtIso").is_some());
        assert!(json.get("routeContext").is_some());
        assert_eq!(json["position"]["lat"], serde_json::json!(-5.0892));
        assert_eq!(json["position"]["speed"], serde_json::json!(8.3));
    }

    #[test]
    fn test_entry_round_trips_losslessly() {
        let original = entry(17);
        let json = serde_json::to_string(&original).unwrap();
        let back: OfflineEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }

    /// Acknowledges the first `accept` appends, then reports the sink offline.
    struct FlakySink {
        inner: MemorySink,
        accept: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DataSink for FlakySink {
        async fn write_live_status(
            &self,
            key: &SessionKey,
            status: &crate::sink::LiveStatus,
        ) -> std::result::Result<(), crate::error::SinkError> {
            self.inner.write_live_status(key, status).await
        }

        async fn append_history_point(
            &self,
            key: &SessionKey,
            point: &HistoryPoint,
        ) -> std::result::Result<(), crate::error::SinkError> {
            use std::sync::atomic::Ordering;
            if self
                .accept
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
            {
                return Err(crate::error::SinkError::Unavailable("flaky".to_string()));
            }
            self.inner.append_history_point(key, point).await
        }

        async fn read_history(
            &self,
            key: &SessionKey,
            range: &DateRange,
        ) -> std::result::Result<Vec<HistoryPoint>, crate::error::SinkError> {
            self.inner.read_history(key, range).await
        }
    }

    #[tokio::test]
    async fn test_flush_stops_at_first_failure() {
        let sink = FlakySink {
            inner: MemorySink::new(),
            accept: std::sync::atomic::AtomicUsize::new(1),
        };
        let mut buffer = OfflineBuffer::in_memory();
        for i in 0..3 {
            buffer.enqueue(entry(i));
        }

        assert_eq!(buffer.flush(&sink).await, 1);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.entries().next().unwrap().id, 2);
        assert_eq!(sink.inner.history(&SessionKey::new("1234")).len(), 1);

        sink.inner.set_available(false);
        assert_eq!(buffer.flush(&sink).await, 0);
        assert_eq!(buffer.len(), 2);
    }

    #[tokio::test]
    async fn test_flush_preserves_order_and_capture_time() {
        let sink = MemorySink::new();
        let mut buffer = OfflineBuffer::in_memory();
        let originals: Vec<OfflineEntry> = (0..4).map(entry).collect();
        for e in &originals {
            buffer.enqueue(e.clone());
        }

        assert_eq!(buffer.flush(&sink).await, 4);
        assert!(buffer.is_empty());

        let stored = sink
            .read_history(&SessionKey::new("1234"), &DateRange::all())
            .await
            .unwrap();
        let expected: Vec<HistoryPoint> = originals.iter().map(|e| e.to_history_point()).collect();
        assert_eq!(stored, expected);
    }

    #[test]
    fn test_full_store_keeps_entry_in_memory() {
        let mut buffer = OfflineBuffer::open(Box::new(MemoryQueueStore::with_capacity(1))).unwrap();
        buffer.enqueue(entry(0));
        buffer.enqueue(entry(1));

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.persisted_len(), 1);
        assert_eq!(buffer.unpersisted_len(), 1);
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        {
            let store = JsonFileQueueStore::open(&path).unwrap();
            let mut buffer = OfflineBuffer::open(Box::new(store)).unwrap();
            buffer.enqueue(entry(0));
            buffer.enqueue(entry(1));
        }

        let store = JsonFileQueueStore::open(&path).unwrap();
        let mut buffer = OfflineBuffer::open(Box::new(store)).unwrap();
        let restored: Vec<u64> = buffer.entries().map(|e| e.id).collect();
        assert_eq!(restored, vec![1, 2]);

        // Ids keep increasing after a restart.
        assert_eq!(buffer.enqueue(entry(2)), 3);
    }
}
