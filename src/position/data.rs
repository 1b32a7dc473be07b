// src/position/data.rs
//! Position samples and display helpers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One immutable location fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
    pub speed_mps: Option<f64>, // m/s, None when the receiver did not report it
    pub captured_at: DateTime<Utc>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_meters: 0.0,
            speed_mps: None,
            captured_at,
        }
    }

    pub fn with_accuracy(mut self, meters: f64) -> Self {
        self.accuracy_meters = meters;
        self
    }

    pub fn with_speed(mut self, mps: f64) -> Self {
        self.speed_mps = Some(mps);
        self
    }

    /// Reported speed in km/h, zero when unknown
    pub fn speed_kmh(&self) -> f64 {
        self.speed_mps.unwrap_or(0.0) * 3.6
    }

    /// Check that both coordinates are finite and inside their valid ranges
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Format coordinate for display
    pub fn format_coordinate(coord: f64) -> String {
        format!("{:>12.6}°", coord)
    }

    /// Format value with unit for display
    pub fn format_value<T: std::fmt::Display>(value: Option<T>, unit: &str) -> String {
        match value {
            Some(val) => format!("{:>12} {}", val, unit),
            None => "Unknown".to_string(),
        }
    }
}
