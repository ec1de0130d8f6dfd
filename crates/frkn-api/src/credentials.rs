//! Credential store.
//!
//! The device token and referral code are opaque to this client; they are
//! kept as JSON in `<data dir>/credentials.json`, readable by the owner only.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CREDENTIALS_FILE_NAME: &str = "credentials.json";

/// Stored device credentials
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub device_id: String,
    pub device_token: String,
    pub referral_code: String,
    #[serde(default)]
    pub user_id: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("device_id", &self.device_id)
            .field("device_token", &"<redacted>")
            .field("referral_code", &self.referral_code)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Credential store errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Corrupt credential file: {0}")]
    Format(#[from] serde_json::Error),
}

/// File-backed credential store
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(CREDENTIALS_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored credentials, `None` when nothing was saved yet
    pub fn load(&self) -> Result<Option<Credentials>, CredentialError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        let json = serde_json::to_vec_pretty(credentials)?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let staging = self.path.with_extension("json.tmp");
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&staging)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&staging, &self.path)?;

        debug!("Saved credentials to {}", self.path.display());
        Ok(())
    }

    /// Forget stored credentials, returning whether any existed
    pub fn clear(&self) -> Result<bool, CredentialError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
