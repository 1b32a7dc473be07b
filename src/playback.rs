// src/playback.rs
//! Replay of a recorded trip at variable speed
//!
//! Frame statistics are recomputed from the loaded points rather than taken
//! from the recorded cumulative distance, which may include points that were
//! evicted from the live trail.

use crate::{
    error::{Result, TrackerError},
    geo,
    model::{HistoryPoint, SessionKey},
    sink::{DataSink, DateRange},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::{
    sync::mpsc,
    time::{Interval, MissedTickBehavior},
};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Delay between frames at 1x
    pub base_interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self { base_interval_ms: 1000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct RunningStats {
    pub total_distance_meters: f64,
    pub elapsed_seconds: f64,
    pub average_speed_kmh: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Frame {
    pub point: HistoryPoint,
    pub index: usize,
    pub stats: RunningStats,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Frame(Frame),
    Complete,
}

pub struct PlaybackEngine {
    config: PlaybackConfig,
    points: Vec<HistoryPoint>,
    /// Distance from the first point to each index
    prefix_meters: Vec<f64>,
    current_index: usize,
    playing: bool,
    speed: f64,
    ticker: Option<Interval>,
    events: Option<mpsc::UnboundedSender<PlaybackEvent>>,
}

impl PlaybackEngine {
    pub fn new(config: PlaybackConfig) -> Self {
        Self {
            config,
            points: Vec::new(),
            prefix_meters: Vec::new(),
            current_index: 0,
            playing: false,
            speed: 1.0,
            ticker: None,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the loaded track and rewind
    pub fn load(&mut self, points: Vec<HistoryPoint>) -> Result<()> {
        if points.is_empty() {
            return Err(TrackerError::EmptySequence);
        }

        let mut prefix = Vec::with_capacity(points.len());
        let mut total = 0.0;
        prefix.push(0.0);
        for pair in points.windows(2) {
            total += geo::distance_meters(&pair[0].position, &pair[1].position);
            prefix.push(total);
        }

        debug!(points = points.len(), distance_m = total, "Loaded track for playback");
        self.points = points;
        self.prefix_meters = prefix;
        self.current_index = 0;
        self.halt();
        Ok(())
    }

    /// Load the stored history of `key` within `range`
    pub async fn load_from_sink(
        &mut self,
        sink: &dyn DataSink,
        key: &SessionKey,
        range: &DateRange,
    ) -> Result<()> {
        let points = sink.read_history(key, range).await?;
        info!(key = %key, points = points.len(), "Fetched history for playback");
        self.load(points)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[HistoryPoint] {
        &self.points
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Time span between the first and last loaded points
    pub fn duration(&self) -> chrono::Duration {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => {
                last.captured_at().signed_duration_since(first.captured_at())
            }
            _ => chrono::Duration::zero(),
        }
    }

    /// Frame for `index` without moving the cursor
    pub fn frame(&self, index: usize) -> Result<Frame> {
        let point = *self.points.get(index).ok_or(TrackerError::IndexOutOfRange {
            index,
            len: self.points.len(),
        })?;

        let total = self.prefix_meters[index];
        let elapsed = point
            .captured_at()
            .signed_duration_since(self.points[0].captured_at())
            .num_milliseconds() as f64
            / 1000.0;
        let average_speed_kmh = if elapsed > 0.0 { total / elapsed * 3.6 } else { 0.0 };

        Ok(Frame {
            point,
            index,
            stats: RunningStats {
                total_distance_meters: total,
                elapsed_seconds: elapsed,
                average_speed_kmh,
            },
        })
    }

    /// Start advancing at `speed` times the base cadence. No-op if already playing.
    ///
    /// Playing a finished track starts it over from the first point.
    pub fn play(&mut self, speed: f64) -> Result<()> {
        if self.points.is_empty() {
            return Err(TrackerError::EmptySequence);
        }
        validate_speed(speed)?;
        if self.playing {
            return Ok(());
        }

        self.speed = speed;
        if self.current_index + 1 >= self.points.len() {
            self.current_index = 0;
            if self.points.len() == 1 {
                self.emit_frame(0)?;
                self.emit(PlaybackEvent::Complete);
                return Ok(());
            }
        }

        self.playing = true;
        self.ticker = Some(self.cadence());
        debug!(speed, from = self.current_index, "Playback started");
        Ok(())
    }

    /// Stop advancing; the cursor stays put
    pub fn pause(&mut self) {
        if self.playing {
            debug!(at = self.current_index, "Playback paused");
        }
        self.halt();
    }

    /// Move the cursor and emit its frame; playing state is unchanged.
    pub fn seek(&mut self, index: usize) -> Result<Frame> {
        let frame = self.frame(index)?;
        self.current_index = index;
        self.emit(PlaybackEvent::Frame(frame));
        Ok(frame)
    }

    pub fn reset(&mut self) -> Result<Frame> {
        self.pause();
        self.seek(0)
    }

    /// Change the multiplier; a running playback restarts its cadence.
    pub fn set_speed(&mut self, speed: f64) -> Result<()> {
        validate_speed(speed)?;
        self.speed = speed;
        if self.playing {
            self.ticker = Some(self.cadence());
        }
        Ok(())
    }

    /// Wait for the next step and move one point forward.
    ///
    /// Never resolves while paused. Reaching the last point emits its frame,
    /// then `Complete`, and stops playback. A cursor already on the last point
    /// (after a seek) completes on the next step and returns that point's frame.
    pub async fn advance(&mut self) -> Frame {
        loop {
            match self.ticker.as_mut() {
                Some(ticker) if self.playing => {
                    ticker.tick().await;
                }
                _ => std::future::pending::<()>().await,
            }

            let last = self.points.len().saturating_sub(1);
            if self.current_index >= last {
                self.halt();
                self.emit(PlaybackEvent::Complete);
                match self.frame(self.current_index) {
                    Ok(frame) => return frame,
                    Err(_) => continue,
                }
            }

            self.current_index += 1;
            let Ok(frame) = self.frame(self.current_index) else {
                self.halt();
                continue;
            };
            self.emit(PlaybackEvent::Frame(frame));
            if self.current_index == last {
                self.halt();
                info!(
                    points = self.points.len(),
                    distance_m = frame.stats.total_distance_meters,
                    "Playback complete"
                );
                self.emit(PlaybackEvent::Complete);
            }
            return frame;
        }
    }

    fn cadence(&self) -> Interval {
        let seconds = self.config.base_interval_ms as f64 / 1000.0 / self.speed;
        let period = Duration::from_secs_f64(seconds);
        let period = period.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    fn halt(&mut self) {
        self.playing = false;
        self.ticker = None;
    }

    fn emit_frame(&self, index: usize) -> Result<()> {
        let frame = self.frame(index)?;
        self.emit(PlaybackEvent::Frame(frame));
        Ok(())
    }

    fn emit(&self, event: PlaybackEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

fn validate_speed(speed: f64) -> Result<()> {
    if !speed.is_finite() || speed < 1.0 {
        return Err(TrackerError::InvalidSpeed(speed));
    }
    Ok(())
}

/// `MM:SS` clock for an offset in seconds
pub fn format_clock(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.floor() as u64
    } else {
        0
    };
    format!("{:02}:{:02}", total / 60, total % 60)
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackEngine")
            .field("points", &self.points.len())
            .field("current_index", &self.current_index)
            .field("playing", &self.playing)
            .field("speed", &self.speed)
            .finish()
    }
}
