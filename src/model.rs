// src/model.rs
//! Session, history and summary types shared across the tracker

use crate::{geo, position::Position};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, fmt};

/// Key under which a vehicle's live status and history are stored
/// (the driver's registration number in practice).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key reduced to characters safe for a file name
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Durable, append-only trip sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    #[serde(flatten)]
    pub position: Position,
    pub cumulative_distance_meters: f64,
}

impl HistoryPoint {
    pub fn new(position: Position, cumulative_distance_meters: f64) -> Self {
        Self {
            position,
            cumulative_distance_meters,
        }
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.position.captured_at
    }
}

/// State of one tracking session, owned by the recorder.
#[derive(Debug, Clone)]
pub struct TrackSession {
    pub session_id: String,
    pub route_id: String,
    pub route_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cumulative_distance_meters: f64,
    pub last_position: Option<Position>,
    pub live_points: VecDeque<Position>,
    live_capacity: usize,
    samples: usize,
}

impl TrackSession {
    pub fn new(
        session_id: String,
        route_id: String,
        route_name: String,
        started_at: DateTime<Utc>,
        live_capacity: usize,
    ) -> Self {
        Self {
            session_id,
            route_id,
            route_name,
            started_at,
            ended_at: None,
            cumulative_distance_meters: 0.0,
            last_position: None,
            live_points: VecDeque::new(),
            live_capacity: live_capacity.max(1),
            samples: 0,
        }
    }

    /// Append to the live trail, evicting the oldest point beyond capacity
    pub fn push_live(&mut self, position: Position) {
        self.live_points.push_back(position);
        while self.live_points.len() > self.live_capacity {
            self.live_points.pop_front();
        }
        self.samples += 1;
    }

    /// Add the leg from the previous accepted position. Returns the leg length.
    pub fn add_leg_to(&mut self, position: &Position) -> f64 {
        let leg = self
            .last_position
            .as_ref()
            .map_or(0.0, |prev| geo::distance_meters(prev, position));
        self.cumulative_distance_meters += leg;
        leg
    }

    pub fn live_capacity(&self) -> usize {
        self.live_capacity
    }

    /// Number of samples accepted, including evicted ones
    pub fn sample_count(&self) -> usize {
        self.samples
    }

    pub(crate) fn restore_sample_count(&mut self, samples: usize) {
        self.samples = samples;
    }

    pub fn summary(&self, now: DateTime<Utc>) -> SessionSummary {
        let end = self.ended_at.unwrap_or(now);
        let duration = end.signed_duration_since(self.started_at);
        let seconds = duration.num_milliseconds() as f64 / 1000.0;
        let avg_speed = if seconds > 0.0 {
            Some(self.cumulative_distance_meters / seconds * 3.6)
        } else {
            None
        };

        SessionSummary {
            session_id: self.session_id.clone(),
            route_name: self.route_name.clone(),
            points: self.samples,
            distance_km: self.cumulative_distance_meters / 1000.0,
            duration,
            avg_speed,
        }
    }
}

/// Post-hoc figures for a finished or running session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub route_name: String,
    pub points: usize,
    pub distance_km: f64,
    pub duration: chrono::Duration,
    pub avg_speed: Option<f64>, // km/h
}

impl SessionSummary {
    pub fn format_duration(&self) -> String {
        let total_seconds = self.duration.num_seconds();
        let hours = total_seconds / 3600;
        let minutes = (total_seconds % 3600) / 60;
        let seconds = total_seconds % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    #[test]
    fn test_live_points_evict_oldest() {
        let mut session = TrackSession::new("s".into(), "r".into(), "Route".into(), at(0), 3);
        for i in 0..5 {
            session.push_live(Position::new(i as f64, 0.0, at(i)));
        }
        assert_eq!(session.live_points.len(), 3);
        assert_eq!(session.live_points.front().unwrap().latitude, 2.0);
        assert_eq!(session.sample_count(), 5);
    }

    #[test]
    fn test_first_leg_is_zero() {
        let mut session = TrackSession::new("s".into(), "r".into(), "Route".into(), at(0), 10);
        let p = Position::new(1.0, 1.0, at(0));
        assert_eq!(session.add_leg_to(&p), 0.0);
        session.last_position = Some(p);
        let leg = session.add_leg_to(&Position::new(1.001, 1.0, at(10)));
        assert!(leg > 100.0 && leg < 120.0);
        assert_eq!(session.cumulative_distance_meters, leg);
    }

    #[test]
    fn test_summary_formatting() {
        let mut session = TrackSession::new("s".into(), "r".into(), "Route".into(), at(0), 10);
        session.cumulative_distance_meters = 3600.0;
        session.ended_at = Some(at(3725));
        let summary = session.summary(at(9999));
        assert_eq!(summary.format_duration(), "1h 2m 5s");
        assert!((summary.distance_km - 3.6).abs() < 1e-9);
        assert!((summary.avg_speed.unwrap() - 3.479).abs() < 0.01);
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(SessionKey::new("drv/42 a").file_stem(), "drv_42_a");
    }
}
