//! End-to-end tracking flows: recorder, offline queue, coordinator, geofence
//! and playback wired together the way the CLI wires them.
//!
//! Run with: `cargo test --test tracking_integration`

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tokio::sync::{oneshot, watch};

use fleet_tracker::{
    geo,
    geofence::{GeofenceConfig, GeofenceMonitor},
    offline::{JsonFileQueueStore, OfflineBuffer},
    playback::{PlaybackConfig, PlaybackEngine},
    position::{Position, PositionEvent, ScriptedSource},
    recorder::{RecorderConfig, RecorderState, TrackRecorder},
    sink::{DataSink, DateRange, JsonDirSink, MemorySink},
    tracker::{FenceSetup, Tracker},
    PositionErrorKind, SessionKey,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 5, 8, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

/// Position `meters` from the depot along `bearing`, captured at `t(secs)`
fn along(bearing: f64, meters: f64, secs: i64) -> Position {
    let (lat, lon) = geo::destination(-5.0892, -42.8019, bearing, meters);
    Position::new(lat, lon, t(secs)).with_accuracy(8.0).with_speed(3.0)
}

fn north(meters: f64, secs: i64) -> Position {
    along(0.0, meters, secs)
}

fn key() -> SessionKey {
    SessionKey::new("bus-7")
}

fn recorder_with(sink: Arc<dyn DataSink>, buffer: OfflineBuffer) -> TrackRecorder {
    TrackRecorder::new(key(), sink, buffer, RecorderConfig::default())
}

fn capture_times(sink: &MemorySink) -> Vec<DateTime<Utc>> {
    sink.history(&key()).iter().map(|p| p.captured_at()).collect()
}

// ============================================================================
// Coordinator
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_outage_is_queued_and_flushed_on_reconnect() {
    let sink = Arc::new(MemorySink::new());
    let (conn_tx, conn_rx) = watch::channel(true);

    let recorder = recorder_with(sink.clone(), OfflineBuffer::in_memory());
    let geofence = GeofenceMonitor::new(GeofenceConfig::default());
    let mut tracker = Tracker::new(recorder, geofence, conn_rx).exit_on_stream_end(true);

    // One sample per wall second, each 150 m and 40 s of capture time apart
    let script: Vec<Position> = (1..=6).map(|i| north(150.0 * i as f64, 40 * i)).collect();
    let source = ScriptedSource::from_positions(script)
        .with_initial(north(0.0, 0))
        .with_interval(Duration::from_secs(1));
    tracker.start(&source, "r-1", "Centro", None, false).await.unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let summary = tracker
            .run(async {
                let _ = stop_rx.await;
            })
            .await;
        (tracker, summary)
    });

    tokio::time::sleep(Duration::from_millis(1500)).await;
    sink.set_available(false);
    conn_tx.send(false).unwrap();

    tokio::time::sleep(Duration::from_millis(2000)).await;
    sink.set_available(true);
    conn_tx.send(true).unwrap();

    let (tracker, summary) = handle.await.unwrap();
    drop(stop_tx);
    let summary = summary.unwrap().unwrap();

    assert_eq!(summary.points, 7);
    assert_eq!(tracker.recorder().offline_len(), 0);
    assert_eq!(
        capture_times(&sink),
        (0..=6).map(|i| t(40 * i)).collect::<Vec<_>>()
    );
    assert!(!sink.live_status(&key()).unwrap().active);
}

#[tokio::test(start_paused = true)]
async fn test_geofence_violation_recorded_once() {
    let sink = Arc::new(MemorySink::new());
    let (_conn_tx, conn_rx) = watch::channel(true);

    let recorder = recorder_with(sink, OfflineBuffer::in_memory());
    let geofence = GeofenceMonitor::new(GeofenceConfig::default());
    let mut tracker = Tracker::new(recorder, geofence, conn_rx);

    let source = ScriptedSource::from_positions(vec![along(90.0, 600.0, 30)])
        .with_initial(north(0.0, 0))
        .with_interval(Duration::from_secs(1));
    let fence = FenceSetup {
        center: None,
        radius_meters: Some(500.0),
    };
    tracker.start(&source, "r-1", "Centro", Some(fence), false).await.unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let summary = tracker
            .run(async {
                let _ = stop_rx.await;
            })
            .await;
        (tracker, summary)
    });

    // One check at 60 s
    tokio::time::sleep(Duration::from_secs(90)).await;
    stop_tx.send(()).unwrap();
    let (tracker, summary) = handle.await.unwrap();
    assert!(summary.unwrap().is_some());

    let fence = tracker.geofence().geofence().unwrap();
    assert_eq!(fence.violations.len(), 1);
    assert!((fence.violations[0].distance_meters - 600.0).abs() < 1.0);
    assert!(fence.last_checked_at.is_some());
    assert!(!fence.active);

    let status = tracker.status();
    let status = status.read().unwrap();
    assert_eq!(status.violations, 1);
    assert!(!status.active);
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_ends_run() {
    let sink = Arc::new(MemorySink::new());
    let (_conn_tx, conn_rx) = watch::channel(true);

    let recorder = recorder_with(sink.clone(), OfflineBuffer::in_memory());
    let geofence = GeofenceMonitor::new(GeofenceConfig::default());
    let mut tracker = Tracker::new(recorder, geofence, conn_rx);

    let source = ScriptedSource::new(vec![
        PositionEvent::Sample(north(200.0, 60)),
        PositionEvent::Error(PositionErrorKind::PermissionDenied),
        PositionEvent::Sample(north(400.0, 120)),
    ])
    .with_initial(north(0.0, 0));
    tracker.start(&source, "r-1", "Centro", None, false).await.unwrap();

    let summary = tracker.run(std::future::pending::<()>()).await.unwrap().unwrap();
    assert_eq!(summary.points, 2);
    assert!((summary.distance_km - 0.2).abs() < 1e-6);
    assert_eq!(tracker.recorder().state(), RecorderState::Stopped);

    let status = tracker.status();
    let status = status.read().unwrap();
    assert_eq!(status.last_error, Some(PositionErrorKind::PermissionDenied));
    assert_eq!(capture_times(&sink), vec![t(0), t(60)]);
}

// ============================================================================
// Durability
// ============================================================================

#[tokio::test]
async fn test_offline_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let queue_path = dir.path().join("offline").join("bus-7.json");

    let down = Arc::new(MemorySink::new());
    down.set_available(false);
    {
        let store = JsonFileQueueStore::open(&queue_path).unwrap();
        let buffer = OfflineBuffer::open(Box::new(store)).unwrap();
        let mut recorder = recorder_with(down.clone(), buffer);
        let source = ScriptedSource::new(Vec::new()).with_initial(north(0.0, 0));
        recorder.start(&source, "r-1", "Centro").await.unwrap();
        recorder.process_sample(north(120.0, 45)).await;
        assert_eq!(recorder.offline_len(), 2);
        // Process ends without stopping the session
    }

    let store = JsonFileQueueStore::open(&queue_path).unwrap();
    let buffer = OfflineBuffer::open(Box::new(store)).unwrap();
    assert_eq!(buffer.len(), 2);

    let up = Arc::new(MemorySink::new());
    let mut recorder = recorder_with(up.clone(), buffer);
    assert_eq!(recorder.flush_offline().await, 2);
    assert_eq!(recorder.offline_len(), 0);

    let history = up.history(&key());
    assert_eq!(capture_times(&up), vec![t(0), t(45)]);
    assert!((history[1].cumulative_distance_meters - 120.0).abs() < 0.01);

    let store = JsonFileQueueStore::open(&queue_path).unwrap();
    let reopened = OfflineBuffer::open(Box::new(store)).unwrap();
    assert!(reopened.is_empty());
}

// ============================================================================
// Record, then replay
// ============================================================================

#[tokio::test]
async fn test_recorded_trip_replays_with_stats() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(JsonDirSink::new(dir.path().join("store")));

    let mut recorder = recorder_with(sink.clone(), OfflineBuffer::in_memory());
    let source = ScriptedSource::new(Vec::new()).with_initial(north(0.0, 0));
    recorder.start(&source, "r-1", "Centro").await.unwrap();
    for i in 1..=3 {
        recorder.process_sample(north(30.0 * i as f64, 30 * i)).await;
    }
    recorder.stop().await.unwrap();

    let mut engine = PlaybackEngine::new(PlaybackConfig { base_interval_ms: 10 });
    let day = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
    engine
        .load_from_sink(sink.as_ref(), &key(), &DateRange::day(day))
        .await
        .unwrap();
    assert_eq!(engine.len(), 4);
    assert_eq!(engine.duration(), chrono::Duration::seconds(90));

    let other_day = NaiveDate::from_ymd_opt(2024, 3, 6).unwrap();
    let mut empty = PlaybackEngine::new(PlaybackConfig::default());
    assert!(empty
        .load_from_sink(sink.as_ref(), &key(), &DateRange::day(other_day))
        .await
        .is_err());

    engine.play(1.0).unwrap();
    let mut last = None;
    while engine.is_playing() {
        last = Some(engine.advance().await);
    }
    let last = last.unwrap();
    assert_eq!(last.index, 3);
    assert!((last.stats.total_distance_meters - 90.0).abs() < 0.01);
    assert!((last.stats.average_speed_kmh - 3.6).abs() < 0.001);

    let again = engine.seek(2).unwrap();
    assert_eq!(engine.seek(2).unwrap(), again);
}
