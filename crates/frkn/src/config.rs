//! Client configuration.
//!
//! Read from `$XDG_CONFIG_HOME/frkn/config.toml` (or the path given on the
//! command line). Every field is optional.
//!
//! ```toml
//! api_base_url = "https://riga.baby"
//! data_dir = "/var/lib/frkn"
//! engine_command = "sing-box"
//! request_timeout_secs = 15
//! log_level = "debug"
//! ```

use frkn_api::ApiConfig;
use frkn_tunnel::ProcessEngineFactory;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Registration backend
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Credentials, engine configuration and engine cache
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Engine executable
    #[serde(default = "default_engine_command")]
    pub engine_command: String,
    /// Arguments placed before `run -c <config>`
    #[serde(default)]
    pub engine_args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Name reported at registration, hostname when unset
    #[serde(default)]
    pub device_name: Option<String>,
}

fn default_api_base_url() -> String {
    "https://riga.baby".to_string()
}

fn default_engine_command() -> String {
    "sing-box".to_string()
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir).join("frkn");
    }
    if let Some(home) = env::var_os("HOME").filter(|h| !h.is_empty()) {
        return PathBuf::from(home).join(".local/share/frkn");
    }
    PathBuf::from(".frkn")
}

/// Default location of the configuration file
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|d| !d.is_empty()) {
        return Some(PathBuf::from(dir).join("frkn/config.toml"));
    }
    env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(|home| PathBuf::from(home).join(".config/frkn/config.toml"))
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            data_dir: default_data_dir(),
            engine_command: default_engine_command(),
            engine_args: Vec::new(),
            request_timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_timeout_secs(),
            log_level: default_log_level(),
            device_name: None,
        }
    }
}

impl AppConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load `explicit`, or the default file if it exists, or defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_toml_file(path),
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::from_toml_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig("timeouts must be non-zero".into()));
        }
        if !(self.api_base_url.starts_with("https://")
            || self.api_base_url.starts_with("http://"))
        {
            return Err(ConfigError::InvalidConfig(format!(
                "api_base_url must be an http(s) URL, got {}",
                self.api_base_url
            )));
        }
        if self.engine_command.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("engine_command is empty".into()));
        }
        Ok(())
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.api_base_url.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            ..ApiConfig::default()
        }
    }

    pub fn engine_factory(&self) -> ProcessEngineFactory {
        ProcessEngineFactory::new(&self.engine_command).with_args(self.engine_args.iter().cloned())
    }

    /// Registration name
    pub fn device_name(&self) -> String {
        self.device_name.clone().unwrap_or_else(frkn_api::device_name)
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}
