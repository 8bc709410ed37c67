//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The storage encryption key is loaded from AUTH_STORAGE_ENCRYPTION_KEY or
//! encryption_key_file, never stored in the TOML directly.

use api_client::{AuthHeaderMode, ClientConfig, DEFAULT_REFRESH_PATH, HeaderInjection};
use common::Secret;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Minimum encryption key length accepted for the credential file
pub const MIN_ENCRYPTION_KEY_CHARS: usize = 32;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// API endpoint settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default)]
    pub auth_header: AuthHeaderMode,
    /// Static headers added to every request
    #[serde(default)]
    pub headers: Vec<HeaderInjection>,
}

/// Credential storage settings
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// Path to a file containing the encryption key (alternative to the env var)
    #[serde(default)]
    pub encryption_key_file: Option<PathBuf>,
    #[serde(skip)]
    pub encryption_key: Option<Secret<String>>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            encryption_key_file: None,
            encryption_key: None,
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_refresh_path() -> String {
    DEFAULT_REFRESH_PATH.to_string()
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("auth-storage.json")
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// - API_URL replaces `api.base_url`
    /// - AUTH_STORAGE_ENCRYPTION_KEY takes precedence over `encryption_key_file`
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var("API_URL") {
            config.api.base_url = url;
        }

        if let Ok(key) = std::env::var("AUTH_STORAGE_ENCRYPTION_KEY") {
            config.storage.encryption_key = Some(Secret::new(key));
        } else if let Some(ref key_file) = config.storage.encryption_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read encryption_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.storage.encryption_key = Some(Secret::new(key));
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }

        if self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if !self.api.refresh_path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "refresh_path must start with /, got: {}",
                self.api.refresh_path
            )));
        }

        if let Some(ref key) = self.storage.encryption_key
            && key.char_len() < MIN_ENCRYPTION_KEY_CHARS
        {
            return Err(common::Error::InvalidSecret {
                source_name: "storage encryption key".into(),
                reason: format!("must be at least {MIN_ENCRYPTION_KEY_CHARS} characters"),
            });
        }

        Ok(())
    }

    /// Settings for `api_client::ApiClient`.
    pub fn client_config(&self) -> ClientConfig {
        let mut client = ClientConfig::new(self.api.base_url.clone());
        client.refresh_path = self.api.refresh_path.clone();
        client.timeout = Duration::from_secs(self.api.timeout_secs);
        client.auth_header = self.api.auth_header;
        client.headers = self.api.headers.clone();
        client
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-cli.toml")
    }
}
