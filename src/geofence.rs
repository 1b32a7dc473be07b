// src/geofence.rs
//! Periodic check of the vehicle's last position against a circular fence

use crate::{geo, position::Position};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::{
    sync::mpsc,
    time::{Interval, MissedTickBehavior},
};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeofenceConfig {
    pub check_interval_secs: u64,
    pub default_radius_meters: f64,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            default_radius_meters: 500.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub position: Position,
    pub distance_meters: f64,
    pub at: DateTime<Utc>,
}

/// Violation as raised to listeners, tagged with the route it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceViolation {
    pub route_id: String,
    pub position: Position,
    pub distance_meters: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub route_id: String,
    pub center: Position,
    pub radius_meters: f64,
    pub active: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub violations: Vec<Violation>,
}

impl Geofence {
    pub fn new(route_id: impl Into<String>, center: Position, radius_meters: f64) -> Self {
        Self {
            route_id: route_id.into(),
            center,
            radius_meters,
            active: true,
            last_checked_at: None,
            violations: Vec::new(),
        }
    }

    pub fn contains(&self, position: &Position) -> bool {
        geo::is_within_radius(position, &self.center, self.radius_meters)
    }
}

pub struct GeofenceMonitor {
    config: GeofenceConfig,
    fence: Option<Geofence>,
    ticker: Option<Interval>,
    events: Option<mpsc::UnboundedSender<GeofenceViolation>>,
}

impl GeofenceMonitor {
    pub fn new(config: GeofenceConfig) -> Self {
        Self {
            config,
            fence: None,
            ticker: None,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<GeofenceViolation>) -> Self {
        self.events = Some(events);
        self
    }

    /// Arm the fence. A `None` radius uses the configured default.
    ///
    /// Restarting replaces any previous fence and its violation history.
    pub fn start(
        &mut self,
        route_id: impl Into<String>,
        center: Position,
        radius_meters: Option<f64>,
    ) {
        let radius = radius_meters.unwrap_or(self.config.default_radius_meters).max(0.0);
        let fence = Geofence::new(route_id, center, radius);
        info!(route = %fence.route_id, radius_m = radius, "Geofence armed");
        self.fence = Some(fence);

        let period = Duration::from_secs(self.config.check_interval_secs.max(1));
        // First tick one full period after start
        let mut ticker = interval_after(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
    }

    /// Cancel the periodic check. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.ticker = None;
        if let Some(fence) = self.fence.as_mut() {
            if fence.active {
                fence.active = false;
                info!(
                    route = %fence.route_id,
                    violations = fence.violations.len(),
                    "Geofence stopped"
                );
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.fence.as_ref().map_or(false, |f| f.active)
    }

    pub fn geofence(&self) -> Option<&Geofence> {
        self.fence.as_ref()
    }

    /// Trim the violation list, keeping the newest `keep` entries
    pub fn trim_violations(&mut self, keep: usize) {
        if let Some(fence) = self.fence.as_mut() {
            let excess = fence.violations.len().saturating_sub(keep);
            fence.violations.drain(..excess);
        }
    }

    /// Resolves at the next scheduled check; never resolves while stopped.
    pub async fn next_tick(&mut self) {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// One check against `last`, the most recent known position.
    pub fn check(
        &mut self,
        last: Option<&Position>,
        now: DateTime<Utc>,
    ) -> Option<GeofenceViolation> {
        let fence = self.fence.as_mut().filter(|f| f.active)?;
        fence.last_checked_at = Some(now);

        let position = *last?;
        let distance = geo::distance_meters(&position, &fence.center);
        if distance <= fence.radius_meters {
            return None;
        }

        fence.violations.push(Violation {
            position,
            distance_meters: distance,
            at: now,
        });
        let violation = GeofenceViolation {
            route_id: fence.route_id.clone(),
            position,
            distance_meters: distance,
            at: now,
        };
        warn!(
            route = %violation.route_id,
            distance_m = distance,
            radius_m = fence.radius_meters,
            "Vehicle outside geofence"
        );
        if let Some(tx) = &self.events {
            let _ = tx.send(violation.clone());
        }
        Some(violation)
    }
}

fn interval_after(period: Duration) -> Interval {
    tokio::time::interval_at(tokio::time::Instant::now() + period, period)
}

impl std::fmt::Debug for GeofenceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeofenceMonitor")
            .field("config", &self.config)
            .field("fence", &self.fence)
            .field("ticking", &self.ticker.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn center() -> Position {
        Position::new(-5.0892, -42.8019, Utc::now())
    }

    fn offset(meters: f64) -> Position {
        let c = center();
        let (lat, lon) = geo::destination(c.latitude, c.longitude, 90.0, meters);
        Position::new(lat, lon, Utc::now())
    }

    #[tokio::test]
    async fn test_violation_outside_radius() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = GeofenceMonitor::new(GeofenceConfig::default()).with_events(tx);
        monitor.start("r-1", center(), Some(500.0));

        let now = Utc::now();
        let violation = monitor.check(Some(&offset(600.0)), now).unwrap();
        assert!((violation.distance_meters - 600.0).abs() < 0.5);
        assert_eq!(violation.route_id, "r-1");

        let fence = monitor.geofence().unwrap();
        assert_eq!(fence.violations.len(), 1);
        assert_eq!(fence.last_checked_at, Some(now));
        assert_eq!(rx.try_recv().unwrap(), violation);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_inside_or_unknown_only_updates_timestamp() {
        let mut monitor = GeofenceMonitor::new(GeofenceConfig::default());
        monitor.start("r-1", center(), None);
        assert_eq!(monitor.geofence().unwrap().radius_meters, 500.0);

        let first = Utc::now();
        assert!(monitor.check(Some(&offset(400.0)), first).is_none());
        let second = first + chrono::Duration::seconds(60);
        assert!(monitor.check(None, second).is_none());

        let fence = monitor.geofence().unwrap();
        assert!(fence.violations.is_empty());
        assert_eq!(fence.last_checked_at, Some(second));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_disables_checks() {
        let mut monitor = GeofenceMonitor::new(GeofenceConfig::default());
        monitor.start("r-1", center(), Some(100.0));
        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_active());
        assert!(monitor.check(Some(&offset(1000.0)), Utc::now()).is_none());
        assert!(monitor.geofence().unwrap().violations.is_empty());

        let pending = tokio::time::timeout(Duration::from_millis(10), monitor.next_tick()).await;
        assert!(pending.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_interval() {
        let config = GeofenceConfig {
            check_interval_secs: 60,
            ..GeofenceConfig::default()
        };
        let mut monitor = GeofenceMonitor::new(config);
        monitor.start("r-1", center(), None);

        let started = tokio::time::Instant::now();
        monitor.next_tick().await;
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(started.elapsed() < Duration::from_secs(61));
        monitor.next_tick().await;
        assert!(started.elapsed() >= Duration::from_secs(120));
        assert!(started.elapsed() < Duration::from_secs(121));
    }

    #[tokio::test]
    async fn test_trim_violations_keeps_newest() {
        let mut monitor = GeofenceMonitor::new(GeofenceConfig::default());
        monitor.start("r-1", center(), Some(10.0));
        for i in 1..=5 {
            monitor.check(Some(&offset(100.0 * i as f64)), Utc::now());
        }
        monitor.trim_violations(2);
        let fence = monitor.geofence().unwrap();
        assert_eq!(fence.violations.len(), 2);
        assert!(fence.violations[1].distance_meters > fence.violations[0].distance_meters);
        assert!(fence.violations[0].distance_meters > 350.0);
    }
}
