// src/error.rs
//! Error types for the fleet tracker

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrackerError>;

/// Classification of a failed position acquisition.
///
/// `PermissionDenied` is terminal: nothing should start a new watch until the
/// user grants access again. The other kinds are transient and the underlying
/// stream keeps retrying on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionErrorKind {
    PermissionDenied,
    PositionUnavailable,
    Timeout,
    Unknown,
}

impl PositionErrorKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionErrorKind::PermissionDenied)
    }

    /// Explanation shown to the driver, once per occurrence.
    pub fn user_message(&self) -> &'static str {
        match self {
            PositionErrorKind::PermissionDenied => {
                "Location permission denied. Enable location access in the device settings."
            }
            PositionErrorKind::PositionUnavailable => {
                "Location unavailable. Check that the GPS receiver is switched on."
            }
            PositionErrorKind::Timeout => "Timed out while acquiring a location. Retrying.",
            PositionErrorKind::Unknown => "Unknown GPS error.",
        }
    }
}

impl fmt::Display for PositionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PositionErrorKind::PermissionDenied => "permission denied",
            PositionErrorKind::PositionUnavailable => "position unavailable",
            PositionErrorKind::Timeout => "timeout",
            PositionErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A write to the data sink that was not acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("a tracking session is already active")]
    AlreadyActive,
    #[error("no tracking session is active")]
    NotActive,
    #[error("cannot play back an empty point sequence")]
    EmptySequence,
    #[error("index {index} out of range for {len} points")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("playback speed must be a finite value >= 1, got {0}")]
    InvalidSpeed(f64),
    #[error("position error: {0}")]
    Position(PositionErrorKind),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Error: {0}")]
    Other(String),
}

impl From<PositionErrorKind> for TrackerError {
    fn from(kind: PositionErrorKind) -> Self {
        TrackerError::Position(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_permission_denied_is_terminal() {
        assert!(PositionErrorKind::PermissionDenied.is_terminal());
        assert!(!PositionErrorKind::PositionUnavailable.is_terminal());
        assert!(!PositionErrorKind::Timeout.is_terminal());
        assert!(!PositionErrorKind::Unknown.is_terminal());
    }

    #[test]
    fn test_error_display() {
        let err = TrackerError::IndexOutOfRange { index: 7, len: 4 };
        assert_eq!(err.to_string(), "index 7 out of range for 4 points");

        let err: TrackerError = SinkError::Unavailable("offline".to_string()).into();
        assert_eq!(err.to_string(), "sink unavailable: offline");
    }
}
