//! # Settings Module
//!
//! The tuning reference is the only state kept across restarts. It is
//! stored as JSON under the application's config directory, keyed `"a4"`.
//! A missing, unreadable or invalid value falls back to the default
//! reference instead of failing.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tuning::TuningReference;

/// Directory name under the platform config directory.
pub const APP_DIR: &str = "heptatune";

const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "a4", default)]
    pub tuning_reference: TuningReference,
}

/// Location of the settings file.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/heptatune/settings.json`, if the platform has a config
    /// directory.
    pub fn default_location() -> Option<Self> {
        dirs::config_dir().map(|dir| Self::at(dir.join(APP_DIR).join(SETTINGS_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the settings, falling back to defaults on any problem.
    pub fn load(&self) -> Settings {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) => {
                debug!("No settings at {}: {e}", self.path.display());
                return Settings::default();
            }
        };
        match serde_json::from_str(&data) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Ignoring invalid settings in {}: {e}", self.path.display());
                Settings::default()
            }
        }
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, json)?;
        debug!("Settings saved to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::DEFAULT_REFERENCE_HZ;

    fn store(dir: &tempfile::TempDir) -> SettingsStore {
        SettingsStore::at(dir.path().join("nested").join(SETTINGS_FILE))
    }

    #[test]
    fn missing_file_gives_default_reference() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(store(&dir).load().tuning_reference.hz(), DEFAULT_REFERENCE_HZ);
    }

    #[test]
    fn saved_reference_survives_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let settings = Settings {
            tuning_reference: TuningReference::new(236.5).unwrap(),
        };
        store.save(&settings).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"a4\""));
        assert_eq!(store.load(), settings);
    }

    #[test]
    fn invalid_values_fall_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();

        for body in [r#"{"a4": -5.0}"#, r#"{"a4": 0}"#, r#"{"a4": "loud"}"#, "not json", "{}"] {
            fs::write(store.path(), body).unwrap();
            assert_eq!(
                store.load().tuning_reference.hz(),
                DEFAULT_REFERENCE_HZ,
                "body: {body}"
            );
        }
    }
}
