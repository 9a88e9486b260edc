//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The identity client ID may come from IDENTITY_CLIENT_ID so a shared
//! config file can serve several deployments.

use alarm_auth::{DEFAULT_SCOPES, IdentityProvider};
use chrono_tz::Tz;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub identity: IdentityConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Local HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Identity provider (authorization endpoint) settings
#[derive(Debug, Deserialize)]
pub struct IdentityConfig {
    pub authorize_endpoint: String,
    #[serde(default)]
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

impl IdentityConfig {
    pub fn provider(&self) -> IdentityProvider {
        IdentityProvider {
            authorize_endpoint: self.authorize_endpoint.clone(),
            client_id: self.client_id.clone(),
            redirect_uri: self.redirect_uri.clone(),
            scopes: self.scopes.clone(),
        }
    }
}

/// Remote backend settings
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// IANA zone the calendar is grouped in and alarm start times are sent with
    #[serde(default = "default_time_zone")]
    pub time_zone: Tz,
}

/// Client-local storage file
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_max_connections() -> usize {
    64
}

fn default_scopes() -> Vec<String> {
    DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect()
}

fn default_timeout() -> u64 {
    30
}

fn default_time_zone() -> Tz {
    Tz::UTC
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("immersive-alarm-storage.json")
}

fn require_http_url(field: &str, value: &str) -> common::Result<()> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {value}"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(client_id) = std::env::var("IDENTITY_CLIENT_ID") {
            config.identity.client_id = client_id;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        require_http_url("identity.authorize_endpoint", &self.identity.authorize_endpoint)?;
        require_http_url("identity.redirect_uri", &self.identity.redirect_uri)?;
        require_http_url("backend.base_url", &self.backend.base_url)?;

        if self.identity.client_id.trim().is_empty() {
            return Err(common::Error::Config(
                "identity.client_id must be set (in the file or via IDENTITY_CLIENT_ID)".into(),
            ));
        }
        if self.identity.scopes.is_empty() {
            return Err(common::Error::Config(
                "identity.scopes must not be empty".into(),
            ));
        }
        if self.backend.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("immersive-alarm-client.toml")
    }
}
