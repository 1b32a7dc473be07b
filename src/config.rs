// src/config.rs
//! Configuration management with file-based storage

use crate::{
    error::{Result, TrackerError},
    geofence::GeofenceConfig,
    playback::PlaybackConfig,
    position::PositionOptions,
    recorder::RecorderConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Upper bound for every interval and age setting (one week)
pub const MAX_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionConfig {
    pub watch: PositionOptions,
    pub one_shot: PositionOptions,
}

fn check(ok: bool, field: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(TrackerError::Config(format!("{} is out of range", field)))
    }
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            watch: PositionOptions::watch_defaults(),
            one_shot: PositionOptions::one_shot_defaults(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsdConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GpsdConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 2947,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for the JSON sink, offline queues and session snapshots
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".local").join("share").join("fleet-tracker"))
            .unwrap_or_else(|_| PathBuf::from("fleet-tracker-data"));
        Self { data_dir }
    }
}

impl StorageConfig {
    pub fn sink_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    /// Offline queue file for one session key
    pub fn queue_path(&self, key_stem: &str) -> PathBuf {
        self.data_dir.join("offline").join(format!("{}.json", key_stem))
    }

    pub fn snapshot_path(&self, key_stem: &str) -> PathBuf {
        self.data_dir.join("snapshots").join(format!("{}.json", key_stem))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub recorder: RecorderConfig,
    pub position: PositionConfig,
    pub geofence: GeofenceConfig,
    pub playback: PlaybackConfig,
    pub gpsd: GpsdConfig,
    pub storage: StorageConfig,
}

impl TrackerConfig {
    /// Load configuration from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::get_config_path()?)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| TrackerError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| TrackerError::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TrackerError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| TrackerError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents)
            .map_err(|e| TrackerError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Get config file path
    pub fn get_config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME")
            .map_err(|_| TrackerError::Config("HOME environment variable not set".to_string()))?;

        Ok(PathBuf::from(home).join(".config").join("fleet-tracker").join("config.json"))
    }

    /// Reject thresholds that would stall or spin the tracker
    pub fn validate(&self) -> Result<()> {
        let r = &self.recorder;
        let interval_ok = |secs: u64| (1..=MAX_INTERVAL_SECS).contains(&secs);

        check(interval_ok(r.history_interval_secs), "recorder.history_interval_secs")?;
        check(r.history_distance_meters > 0.0, "recorder.history_distance_meters")?;
        check(r.live_point_capacity > 0, "recorder.live_point_capacity")?;
        check(interval_ok(r.snapshot_max_age_secs), "recorder.snapshot_max_age_secs")?;
        check(interval_ok(r.offline_retry_secs), "recorder.offline_retry_secs")?;
        check(interval_ok(self.geofence.check_interval_secs), "geofence.check_interval_secs")?;
        check(self.geofence.default_radius_meters >= 0.0, "geofence.default_radius_meters")?;
        check(self.playback.base_interval_ms > 0, "playback.base_interval_ms")?;
        check(
            self.position.watch.timeout_ms > 0 && self.position.one_shot.timeout_ms > 0,
            "position timeouts",
        )?;
        Ok(())
    }

    /// Update gpsd settings
    pub fn update_gpsd(&mut self, host: String, port: u16) {
        self.gpsd.host = host;
        self.gpsd.port = port;
    }

    /// Update the data directory
    pub fn update_storage(&mut self, data_dir: PathBuf) {
        self.storage.data_dir = data_dir;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrackerConfig::default();
        assert_eq!(config.recorder.history_interval_secs, 30);
        assert_eq!(config.recorder.history_distance_meters, 100.0);
        assert_eq!(config.recorder.live_point_capacity, 1000);
        assert_eq!(config.geofence.check_interval_secs, 60);
        assert_eq!(config.geofence.default_radius_meters, 500.0);
        assert_eq!(config.playback.base_interval_ms, 1000);
        assert_eq!(config.gpsd.port, 2947);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"recorder":{"history_interval_secs":10}}"#).unwrap();

        let config = TrackerConfig::load_from(&path).unwrap();
        assert_eq!(config.recorder.history_interval_secs, 10);
        assert_eq!(config.recorder.history_distance_meters, 100.0);
        assert_eq!(config.gpsd.host, "localhost");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = TrackerConfig::default();
        config.update_gpsd("gps.local".to_string(), 3000);
        config.save_to(&path).unwrap();

        assert_eq!(TrackerConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut config = TrackerConfig::default();
        config.recorder.live_point_capacity = 0;
        assert!(matches!(config.validate(), Err(TrackerError::Config(_))));
    }

    #[test]
    fn test_huge_intervals_rejected() {
        let mut config = TrackerConfig::default();
        config.recorder.history_interval_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(TrackerError::Config(_))));

        let mut config = TrackerConfig::default();
        config.recorder.snapshot_max_age_secs = MAX_INTERVAL_SECS + 1;
        assert!(matches!(config.validate(), Err(TrackerError::Config(_))));

        let mut config = TrackerConfig::default();
        config.recorder.snapshot_max_age_secs = MAX_INTERVAL_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_rejects_out_of_range_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"recorder":{"snapshot_max_age_secs":18446744073709551615}}"#)
            .unwrap();
        assert!(matches!(TrackerConfig::load_from(&path), Err(TrackerError::Config(_))));
    }
}
