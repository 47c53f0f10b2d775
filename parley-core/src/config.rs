// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Validates limits and token lifetimes, and redacts the signing secret in Debug output
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC signing secret. When absent an ephemeral secret is generated at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    #[serde(default = "default_access_token_minutes")]
    pub access_token_minutes: i64,
    #[serde(default = "default_refresh_token_days")]
    pub refresh_token_days: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            access_token_minutes: default_access_token_minutes(),
            refresh_token_days: default_refresh_token_days(),
        }
    }
}

// Custom Debug impl to redact jwt_secret
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "[REDACTED]"))
            .field("access_token_minutes", &self.access_token_minutes)
            .field("refresh_token_days", &self.refresh_token_days)
            .finish()
    }
}

/// Token bucket limits for the three admission scopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_user_requests_per_minute")]
    pub user_requests_per_minute: u64,
    #[serde(default = "default_channel_messages_per_second")]
    pub channel_messages_per_second: u64,
    #[serde(default = "default_llm_requests_per_minute")]
    pub llm_requests_per_minute: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user_requests_per_minute: default_user_requests_per_minute(),
            channel_messages_per_second: default_channel_messages_per_second(),
            llm_requests_per_minute: default_llm_requests_per_minute(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding sessions.db and the pointer registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

impl StorageConfig {
    pub fn resolved_data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => PathBuf::from(expand_tilde(dir)),
            None => paths::data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Per-connection outbound queue depth. Pushes beyond it are dropped.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("Unknown log format: {}", other),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// When set, logs are also written to daily rolling files here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    13100
}

fn default_access_token_minutes() -> i64 {
    30
}

fn default_refresh_token_days() -> i64 {
    7
}

fn default_true() -> bool {
    true
}

fn default_user_requests_per_minute() -> u64 {
    20
}

fn default_channel_messages_per_second() -> u64 {
    30
}

fn default_llm_requests_per_minute() -> u64 {
    60
}

fn default_outbound_buffer() -> usize {
    64
}

/// Expand tilde (~) to home directory in paths
fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(base_dirs) = directories::BaseDirs::new() {
            return base_dirs
                .home_dir()
                .join(stripped)
                .to_string_lossy()
                .to_string();
        }
        tracing::warn!(
            path = %path,
            "Failed to expand tilde in path: could not determine home directory"
        );
    }
    path.to_string()
}

impl Config {
    /// Find the config file, checking multiple locations in order:
    /// 1. PARLEY_CONFIG env var (if set)
    /// 2. ./config.toml (current directory - for development)
    /// 3. ~/.config/parley/config.toml (XDG config dir)
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("PARLEY_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load configuration using the standard search order.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration from an explicit path, or search when `None`.
    /// Environment overrides and validation apply either way.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let found = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::find_config_file(),
        };

        let mut config = if let Some(config_path) = found {
            tracing::info!(path = %config_path.display(), "Loading configuration from file");
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            tracing::info!("No config file found, using environment variables and defaults");
            Config::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("PARLEY_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = std::env::var("PARLEY_PORT") {
            self.server.port = val
                .parse()
                .with_context(|| format!("PARLEY_PORT must be a valid port number, got: {}", val))?;
        }
        if let Ok(val) = std::env::var("PARLEY_JWT_SECRET") {
            self.auth.jwt_secret = Some(val);
        }
        if let Ok(val) = std::env::var("PARLEY_DATA_DIR") {
            self.storage.data_dir = Some(val);
        }
        if let Ok(val) = std::env::var("PARLEY_RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = val.parse().with_context(|| {
                format!("PARLEY_RATE_LIMIT_ENABLED must be true or false, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("PARLEY_LOG_FORMAT") {
            self.logging.format = val.parse()?;
        }
        Ok(())
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            anyhow::bail!("server.host must not be empty (set in config.toml or PARLEY_HOST env var)");
        }
        if self.auth.access_token_minutes <= 0 {
            anyhow::bail!("auth.access_token_minutes must be positive");
        }
        if self.auth.refresh_token_days <= 0 {
            anyhow::bail!("auth.refresh_token_days must be positive");
        }
        if let Some(secret) = &self.auth.jwt_secret {
            if secret.trim().is_empty() {
                anyhow::bail!("auth.jwt_secret must not be blank when set");
            }
        }
        if self.rate_limit.enabled {
            if self.rate_limit.user_requests_per_minute == 0 {
                anyhow::bail!("rate_limit.user_requests_per_minute must be positive");
            }
            if self.rate_limit.channel_messages_per_second == 0 {
                anyhow::bail!("rate_limit.channel_messages_per_second must be positive");
            }
            if self.rate_limit.llm_requests_per_minute == 0 {
                anyhow::bail!("rate_limit.llm_requests_per_minute must be positive");
            }
        }
        if self.websocket.outbound_buffer == 0 {
            anyhow::bail!("websocket.outbound_buffer must be positive");
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
