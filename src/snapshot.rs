// src/snapshot.rs
//! Session snapshots so an interrupted tracking session can be resumed

use crate::{
    error::Result,
    model::SessionKey,
    position::Position,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

/// Enough of a running session to pick it up again after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_key: SessionKey,
    pub session_id: String,
    pub route_id: String,
    pub route_name: String,
    pub started_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
    pub cumulative_distance_meters: f64,
    pub sample_count: usize,
    pub last_position: Option<Position>,
    pub last_persisted: Option<Position>,
    /// Tail of the live trail, oldest first
    pub recent_points: Vec<Position>,
}

impl SessionSnapshot {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.saved_at)
    }

    /// A snapshot stamped in the future (clock skew) counts as fresh
    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age(now).to_std().map_or(true, |age| age <= max_age)
    }
}

/// JSON file holding at most one snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "Saved session snapshot");
        Ok(())
    }

    pub fn load(&self) -> Result<Option<SessionSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Remove the snapshot; missing file is fine
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
