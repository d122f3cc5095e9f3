//! User settings persisted as JSON in the data directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to write settings to {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Unknown setting '{0}' (expected include_icloud_images, delete_original_live_photos or move_to_album)")]
    UnknownKey(String),

    #[error("Invalid value '{value}' for {key}: expected true or false")]
    InvalidValue { key: String, value: String },

    #[error("Expected key=value, got '{0}'")]
    Malformed(String),
}

/// The three user-facing switches of a cleaning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Allow fetching cloud-only originals over the network.
    pub include_icloud_images: bool,
    pub delete_original_live_photos: bool,
    pub move_to_album: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            include_icloud_images: false,
            delete_original_live_photos: true,
            move_to_album: true,
        }
    }
}

impl Settings {
    /// Apply one `key=value` assignment.
    pub fn assign(&mut self, assignment: &str) -> Result<(), SettingsError> {
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| SettingsError::Malformed(assignment.to_string()))?;
        let (key, value) = (key.trim(), value.trim());
        let flag = match value.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => true,
            "false" | "no" | "off" | "0" => false,
            _ => {
                return Err(SettingsError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
        };
        match key {
            "include_icloud_images" => self.include_icloud_images = flag,
            "delete_original_live_photos" => self.delete_original_live_photos = flag,
            "move_to_album" => self.move_to_album = flag,
            other => return Err(SettingsError::UnknownKey(other.to_string())),
        }
        Ok(())
    }
}

/// Reads and writes `settings.json`.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SETTINGS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings. Missing or malformed files yield the defaults.
    pub async fn load(&self) -> Settings {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Settings::default(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read settings, using defaults");
                return Settings::default();
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Malformed settings, using defaults");
                Settings::default()
            }
        }
    }

    pub async fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        let json = serde_json::to_vec_pretty(settings)?;
        let write_err = |source| SettingsError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        tokio::fs::write(&self.path, json).await.map_err(write_err)?;
        tracing::debug!(path = %self.path.display(), "Saved settings");
        Ok(())
    }
}
