use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_SETTINGS_PATH: &str = "settings.json";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write settings at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("settings are not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Opaque JSON document owned by the frontend, persisted as one file.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The document exactly as stored; it is not validated on the way out.
    pub async fn load(&self) -> Result<Bytes, SettingsError> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|source| SettingsError::Read {
                path: self.path.clone(),
                source,
            })?;
        Ok(Bytes::from(raw))
    }

    /// Replaces the whole document, pretty-printed.
    pub async fn save(&self, settings: &Value) -> Result<(), SettingsError> {
        let mut raw = serde_json::to_vec_pretty(settings)?;
        raw.push(b'\n');
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &raw)
            .await
            .map_err(|source| SettingsError::Write {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| SettingsError::Write {
                path: self.path.clone(),
                source,
            })
    }
}
