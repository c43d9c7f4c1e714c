//! Configuration
//!
//! TOML files under `<config_dir>/sshdeck/`, with environment overrides:
//! - `client.toml`: server address, token, session limits
//! - `server.toml`: bind address, API tokens, ssh settings, connection profiles

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::protocol::{ConnectionId, ProfileRef};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid profile {id}: {reason}")]
    InvalidProfile { id: ConnectionId, reason: String },
}

impl From<ConfigError> for String {
    fn from(err: ConfigError) -> String {
        err.to_string()
    }
}

/// Client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Event channel endpoint (`ws://` or `wss://`)
    pub server_url: String,
    /// Bearer token for the server
    pub token: Option<String>,
    /// Maximum simultaneously active sessions
    pub max_sessions: usize,
    /// Seconds a session may wait for disconnect confirmation before it is reported
    pub stuck_after_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:5000/ws".to_string(),
            token: None,
            max_sessions: 10,
            stuck_after_secs: 30,
        }
    }
}

impl ClientConfig {
    /// Load from `path`, or from the default location when `None`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config: Self = load_file(path, "client.toml")?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `SSHDECK_SERVER` / `SSHDECK_TOKEN`
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = var("SSHDECK_SERVER") {
            self.server_url = url;
        }
        if let Some(token) = var("SSHDECK_TOKEN") {
            self.token = Some(token);
        }
        Ok(())
    }

    /// HTTP base of the server, derived from the channel URL
    pub fn api_base(&self) -> Result<Url, ConfigError> {
        let mut url =
            Url::parse(&self.server_url).map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.server_url, e)))?;

        let scheme = match url.scheme() {
            "ws" | "http" => "http",
            "wss" | "https" => "https",
            other => return Err(ConfigError::InvalidUrl(format!("unsupported scheme {}", other))),
        };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::InvalidUrl(self.server_url.clone()))?;
        url.set_path("/");
        url.set_query(None);
        Ok(url)
    }
}

/// How the server runs the system ssh client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// ssh binary name or path
    pub binary: String,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    /// Maximum open remote shells per socket
    pub max_sessions: usize,
    /// Value passed as `StrictHostKeyChecking`
    pub strict_host_key_checking: String,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            connect_timeout_secs: 30,
            command_timeout_secs: 30,
            max_sessions: 10,
            strict_host_key_checking: "accept-new".to_string(),
        }
    }
}

/// Credentials of a stored profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum ProfileAuth {
    /// Whatever the ssh agent offers
    Agent,
    Key {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    Password { password: String },
}

impl Default for ProfileAuth {
    fn default() -> Self {
        Self::Agent
    }
}

impl ProfileAuth {
    /// Secret the askpass helper must answer with, if any
    pub fn secret(&self) -> Option<&str> {
        match self {
            Self::Agent => None,
            Self::Key { passphrase, .. } => passphrase.as_deref(),
            Self::Password { password } => Some(password),
        }
    }
}

/// A stored connection profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub id: ConnectionId,
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub auth: ProfileAuth,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl ConnectionProfile {
    /// Public summary, without credentials
    pub fn summary(&self) -> ProfileRef {
        ProfileRef {
            id: self.id.clone(),
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            has_password: matches!(self.auth, ProfileAuth::Password { .. }),
            has_private_key: matches!(self.auth, ProfileAuth::Key { .. }),
            group: self.group.clone(),
            tags: self.tags.clone(),
            notes: self.notes.clone(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidProfile {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.host.trim().is_empty() {
            return Err(invalid("host is empty"));
        }
        if self.username.trim().is_empty() {
            return Err(invalid("username is empty"));
        }
        if self.port == 0 {
            return Err(invalid("port is 0"));
        }
        Ok(())
    }
}

/// Server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Accepted bearer tokens. Empty disables authentication.
    pub api_tokens: Vec<String>,
    pub ssh: SshSettings,
    pub profiles: Vec<ConnectionProfile>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            api_tokens: Vec::new(),
            ssh: SshSettings::default(),
            profiles: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load from `path`, or from the default location when `None`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config: Self = load_file(path, "server.toml")?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        info!(
            "Loaded {} connection profiles, {} API tokens",
            config.profiles.len(),
            config.api_tokens.len()
        );
        Ok(config)
    }

    /// Apply `WEB_HOST`, `WEB_PORT`, `SSH_TIMEOUT`, `SSH_MAX_CONNECTIONS` and
    /// `SSHDECK_API_TOKENS` (comma separated)
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("WEB_HOST") {
            self.host = host;
        }
        if let Some(port) = var("WEB_PORT") {
            self.port = parse_env("WEB_PORT", port)?;
        }
        if let Some(timeout) = var("SSH_TIMEOUT") {
            let secs = parse_env("SSH_TIMEOUT", timeout)?;
            self.ssh.connect_timeout_secs = secs;
            self.ssh.command_timeout_secs = secs;
        }
        if let Some(max) = var("SSH_MAX_CONNECTIONS") {
            self.ssh.max_sessions = parse_env("SSH_MAX_CONNECTIONS", max)?;
        }
        if let Some(tokens) = var("SSHDECK_API_TOKENS") {
            self.api_tokens = tokens
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(())
    }

    /// Reject duplicate ids and incomplete profiles
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for profile in &self.profiles {
            profile.validate()?;
            if !seen.insert(profile.id.clone()) {
                return Err(ConfigError::InvalidProfile {
                    id: profile.id.clone(),
                    reason: "duplicate id".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// `<config_dir>/sshdeck/<file>`
pub fn default_path(file: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sshdeck").join(file))
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}

/// An explicit path must exist; a missing default file yields defaults
fn load_file<T>(path: Option<&Path>, file: &str) -> Result<T, ConfigError>
where
    T: Default + for<'de> Deserialize<'de>,
{
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => match default_path(file) {
            Some(path) => (path, false),
            None => return Ok(T::default()),
        },
    };

    if !path.exists() {
        if explicit {
            return Err(ConfigError::NotFound(path));
        }
        debug!("No config at {}, using defaults", path.display());
        return Ok(T::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    debug!("Loading config from {}", path.display());
    Ok(toml::from_str(&text)?)
}
