//! YAML configuration for the Patron client.
//!
//! Every section is optional; omitted fields take the production defaults.
//! Durations are written in milliseconds.
//!
//! ## Example YAML Configuration
//!
//! ```yaml
//! version: "1.0"
//! name: "staging"
//!
//! api:
//!   base_url: "https://staging.patron.example/api"
//!   request_timeout: 30000
//!   search_debounce: 300
//!   cache:
//!     max_entries: 100
//!     default_ttl: 300000
//!     prune_interval: 60000
//!   circuit_breaker:
//!     failure_threshold: 5
//!     reset_timeout: 60000
//!   retry:
//!     max_retries: 3
//!     base_delay: 1000
//!     jitter: true
//!   concurrency:
//!     max_concurrent: 10
//!
//! logging:
//!   level: "info"
//!   json: false
//!
//! credentials:
//!   path: ".patron/credential.json"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use api::ApiConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Overrides `api.base_url`.
pub const ENV_API_URL: &str = "PATRON_API_URL";
/// Overrides `logging.level`.
pub const ENV_LOG_LEVEL: &str = "PATRON_LOG_LEVEL";

/// Errors that can occur when loading YAML configuration files
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported config version: {0}")]
    UnsupportedVersion(String),
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatronConfig {
    /// Configuration format version
    pub version: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub credentials: CredentialsConfig,
}

impl Default for PatronConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            name: None,
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
            credentials: CredentialsConfig::default(),
        }
    }
}

impl PatronConfig {
    /// Load a YAML configuration file from the given path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse YAML configuration from a string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigLoadError> {
        let config: PatronConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PATRON_API_URL` / `PATRON_LOG_LEVEL` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigLoadError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup, then re-validate.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.api.base_url = url.trim().to_string();
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL).filter(|v| !v.trim().is_empty()) {
            self.logging.level = level.trim().to_string();
        }
        self.validate()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        match self.version.as_str() {
            "1.0" | "1" => Ok(()),
            v => Err(ConfigLoadError::UnsupportedVersion(v.to_string())),
        }?;

        let api = &self.api;
        if !(api.base_url.starts_with("http://") || api.base_url.starts_with("https://")) {
            return Err(ConfigLoadError::Validation(format!(
                "api.base_url must be an http(s) URL, got {:?}",
                api.base_url
            )));
        }
        if !api.refresh_path.starts_with('/') {
            return Err(ConfigLoadError::Validation(
                "api.refresh_path must start with '/'".to_string(),
            ));
        }
        if api.request_timeout.is_zero() {
            return Err(ConfigLoadError::Validation(
                "api.request_timeout must be > 0".to_string(),
            ));
        }
        if api.cache.max_entries == 0 {
            return Err(ConfigLoadError::Validation(
                "api.cache.max_entries must be >= 1".to_string(),
            ));
        }
        if api.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigLoadError::Validation(
                "api.circuit_breaker.failure_threshold must be >= 1".to_string(),
            ));
        }
        if api.concurrency.max_concurrent == 0 {
            return Err(ConfigLoadError::Validation(
                "api.concurrency.max_concurrent must be >= 1".to_string(),
            ));
        }
        if api.retry.base_delay > api.retry.max_delay {
            return Err(ConfigLoadError::Validation(
                "api.retry.base_delay must not exceed api.retry.max_delay".to_string(),
            ));
        }

        self.logging.validate()
    }
}

/// Log output settings for the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `"info"` or `"api=debug,resilience=info"`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl LoggingConfig {
    fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.level.trim().is_empty() {
            return Err(ConfigLoadError::Validation(
                "logging.level must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Where the credential is persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// JSON file for the credential; `None` keeps it in memory only.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}
