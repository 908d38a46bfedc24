//! Persisted operator settings.
//!
//! `Settings.xml` carries the handful of values that survive restarts:
//! the data gathering interval, the database URL and the database
//! username. The root element is `Settings` with one attribute per
//! value. The file is created with defaults on first run; the database
//! password is never persisted (it comes from `DIODE_DB_PASSWORD`).

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DiodeError, Result};

/// Default data gathering interval in milliseconds.
pub const DEFAULT_GATHER_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "Settings")]
pub struct Settings {
    /// Data gathering interval in milliseconds
    #[serde(rename = "@gatherInterval")]
    pub gather_interval: u64,
    /// Database endpoint, `host` or `host:port`
    #[serde(rename = "@dbURL")]
    pub db_url: String,
    /// Database login username
    #[serde(rename = "@dbUsername")]
    pub db_username: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gather_interval: DEFAULT_GATHER_INTERVAL_MS,
            db_url: String::new(),
            db_username: String::new(),
        }
    }
}

impl Settings {
    /// Load settings from `path`, creating the file with defaults when it
    /// does not exist yet. A malformed file logs a warning and falls back
    /// to defaults rather than aborting startup.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let settings = Settings::default();
            settings.save(path)?;
            return Ok(settings);
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| DiodeError::config(format!("reading {}: {e}", path.display())))?;
        match quick_xml::de::from_str::<Settings>(&text) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                warn!("Settings file {} unreadable, using defaults: {e}", path.display());
                Ok(Settings::default())
            }
        }
    }

    /// Write settings back to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let body = quick_xml::se::to_string(self)
            .map_err(|e| DiodeError::config(format!("encoding settings: {e}")))?;
        let text = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{body}\n");
        std::fs::write(path, text)
            .map_err(|e| DiodeError::config(format!("writing {}: {e}", path.display())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Settings.xml");

        let settings = Settings::load_or_create(&path).unwrap();
        assert_eq!(settings.gather_interval, DEFAULT_GATHER_INTERVAL_MS);
        assert!(settings.db_url.is_empty());
        assert!(settings.db_username.is_empty());
        assert!(path.exists());
    }

    #[test]
    fn settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Settings.xml");

        let settings = Settings {
            gather_interval: 2500,
            db_url: "10.0.0.9:1433".to_string(),
            db_username: "historian".to_string(),
        };
        settings.save(&path).unwrap();

        let loaded = Settings::load_or_create(&path).unwrap();
        assert_eq!(loaded, settings);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("gatherInterval=\"2500\""));
        assert!(raw.contains("dbURL=\"10.0.0.9:1433\""));
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Settings.xml");
        std::fs::write(&path, "<Broken attr=>").unwrap();

        let settings = Settings::load_or_create(&path).unwrap();
        assert_eq!(settings, Settings::default());
    }
}
