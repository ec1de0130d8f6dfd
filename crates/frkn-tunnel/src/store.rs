//! Configuration document storage.
//!
//! The engine reads its configuration from a file, so every session attempt
//! writes the built document to `<data dir>/config.json` first. The document
//! carries the server secrets and is readable by the owner only.

use crate::config::TunnelConfig;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the persisted document
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Writes configuration documents into the data directory
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the persisted document
    pub fn path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE_NAME)
    }

    /// Persist `config`, replacing any previous document
    pub fn write(&self, config: &TunnelConfig) -> Result<PathBuf, StoreError> {
        let json = config.to_json()?;
        fs::create_dir_all(&self.dir)?;

        let path = self.path();
        let staging = self.dir.join(format!("{}.tmp", CONFIG_FILE_NAME));
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&staging)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&staging, &path)?;

        debug!("Wrote configuration to {}", path.display());
        Ok(path)
    }

    /// Load the persisted document, `None` if there is none
    pub fn read(&self) -> Result<Option<TunnelConfig>, StoreError> {
        match fs::read_to_string(self.path()) {
            Ok(json) => Ok(Some(TunnelConfig::from_json(&json)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the persisted document, returning whether one existed
    pub fn remove(&self) -> Result<bool, StoreError> {
        match fs::remove_file(self.path()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
