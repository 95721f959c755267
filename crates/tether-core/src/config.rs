//! Configuration resolution for Tether.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config_dir>/tether/connector.json`), or the file given
//!    explicitly with `--config`
//! 3. Environment variables (highest priority)
//!
//! Every section is optional in the file; missing fields keep their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::ConnectorIdentity;

/// Environment variable overriding the cloud endpoint.
pub const ENV_CLOUD_URL: &str = "TETHER_CLOUD_URL";
/// Environment variable overriding the local service base URL.
pub const ENV_LOCAL_URL: &str = "TETHER_LOCAL_URL";
pub const ENV_CONNECTOR_ID: &str = "TETHER_CONNECTOR_ID";
pub const ENV_CONNECTOR_SECRET: &str = "TETHER_CONNECTOR_SECRET";
pub const ENV_LOG_LEVEL: &str = "TETHER_LOG_LEVEL";

/// Upper bound for every timeout, in seconds. Keeps deadline arithmetic in range.
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Complete connector configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConnectorConfig {
    /// Enrolled identity. `None` until the connector has been enrolled.
    #[serde(default)]
    pub identity: Option<ConnectorIdentity>,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Cloud endpoint and channel liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// WebSocket endpoint of the cloud control plane (`ws://` or `wss://`).
    pub url: String,
    pub heartbeat_interval_secs: u64,
    /// Close the channel when no pong arrives for this long.
    pub heartbeat_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub auth_timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            url: "wss://localhost/connector".to_string(),
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            connect_timeout_secs: 10,
            auth_timeout_secs: 10,
        }
    }
}

impl CloudConfig {
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub const fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

/// Local HTTP service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Base URL of the local service (`http://` or `https://`).
    pub url: String,
    /// Bearer token for the local service. Re-read on every request.
    pub gateway_token: Option<String>,
    /// JSON file owned by the local service that may hold its token.
    /// Defaults to `~/.openclaw/openclaw.json`; `null` turns discovery off.
    pub token_discovery_path: Option<PathBuf>,
    /// JSON pointer to the token inside `token_discovery_path`.
    pub token_discovery_pointer: String,
    /// Upper bound on total latency of one forwarded request.
    pub request_timeout_secs: u64,
    /// Path probed by health checks.
    pub health_path: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:18789".to_string(),
            gateway_token: None,
            token_discovery_path: default_discovery_path(),
            token_discovery_pointer: "/gateway/auth/token".to_string(),
            request_timeout_secs: 120,
            health_path: "/v1/models".to_string(),
        }
    }
}

/// Config file the local gateway keeps its own auth token in.
pub fn default_discovery_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".openclaw").join("openclaw.json"))
}

impl LocalConfig {
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of each delay that is randomized, in `[0, 1]`.
    pub jitter: f64,
    /// Connected time after which the failure counter resets.
    pub stable_threshold_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
            stable_threshold_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ConnectorConfig {
    /// The enrolled identity, or an error telling the operator to enroll.
    pub fn require_identity(&self) -> Result<ConnectorIdentity> {
        match &self.identity {
            Some(id) if id.is_complete() => Ok(id.clone()),
            Some(_) => Err(Error::NotEnrolled(
                "identity is missing connector_id or secret".into(),
            )),
            None => Err(Error::NotEnrolled("no identity in configuration".into())),
        }
    }

    /// Reject values the connector cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.cloud.url.starts_with("ws://") || self.cloud.url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "cloud.url must use ws:// or wss://, got {:?}",
                self.cloud.url
            )));
        }
        if !(self.local.url.starts_with("http://") || self.local.url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "local.url must use http:// or https://, got {:?}",
                self.local.url
            )));
        }
        let timeouts = [
            ("cloud.heartbeat_interval_secs", self.cloud.heartbeat_interval_secs),
            ("cloud.heartbeat_timeout_secs", self.cloud.heartbeat_timeout_secs),
            ("cloud.connect_timeout_secs", self.cloud.connect_timeout_secs),
            ("cloud.auth_timeout_secs", self.cloud.auth_timeout_secs),
            ("local.request_timeout_secs", self.local.request_timeout_secs),
            ("reconnect.initial_delay_ms", self.reconnect.initial_delay_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{name} must be positive")));
        }
        let limits = [
            ("cloud.heartbeat_interval_secs", self.cloud.heartbeat_interval_secs),
            ("cloud.heartbeat_timeout_secs", self.cloud.heartbeat_timeout_secs),
            ("cloud.connect_timeout_secs", self.cloud.connect_timeout_secs),
            ("cloud.auth_timeout_secs", self.cloud.auth_timeout_secs),
            ("local.request_timeout_secs", self.local.request_timeout_secs),
            ("reconnect.stable_threshold_secs", self.reconnect.stable_threshold_secs),
            ("reconnect.max_delay_ms", self.reconnect.max_delay_ms / 1_000),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, v)| *v > MAX_TIMEOUT_SECS) {
            return Err(Error::Config(format!(
                "{name} must be at most {MAX_TIMEOUT_SECS} seconds"
            )));
        }
        if self.cloud.heartbeat_interval_secs >= self.cloud.heartbeat_timeout_secs {
            return Err(Error::Config(
                "cloud.heartbeat_interval_secs must be less than cloud.heartbeat_timeout_secs"
                    .into(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(Error::Config(
                "reconnect.max_delay_ms must be >= reconnect.initial_delay_ms".into(),
            ));
        }
        if !(self.reconnect.multiplier >= 1.0) {
            return Err(Error::Config("reconnect.multiplier must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(Error::Config("reconnect.jitter must be within [0, 1]".into()));
        }
        if !self.local.health_path.starts_with('/') {
            return Err(Error::Config("local.health_path must start with '/'".into()));
        }
        Ok(())
    }
}

/// Default location of the connector config file.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tether").join("connector.json"))
}

/// The file that configuration is read from: the explicit path when given,
/// otherwise the global file.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit.map(Path::to_path_buf).or_else(global_config_path)
}

/// Load configuration with hierarchical resolution and validate it.
pub fn load_config(explicit: Option<&Path>) -> Result<ConnectorConfig> {
    let mut config = match resolve_config_path(explicit) {
        Some(path) if path.exists() => load_config_file(&path)?,
        Some(path) if explicit.is_some() => {
            return Err(Error::Config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        _ => ConnectorConfig::default(),
    };
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

pub fn load_config_file(path: &Path) -> Result<ConnectorConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut ConnectorConfig) {
    apply_overrides(config, |key| std::env::var(key).ok());
}

/// Apply `TETHER_*` overrides read through `lookup`. Empty values are ignored.
pub fn apply_overrides(config: &mut ConnectorConfig, lookup: impl Fn(&str) -> Option<String>) {
    let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

    if let Some(url) = get(ENV_CLOUD_URL) {
        config.cloud.url = url;
    }
    if let Some(url) = get(ENV_LOCAL_URL) {
        config.local.url = url;
    }
    if let Some(level) = get(ENV_LOG_LEVEL) {
        config.logging.level = level;
    }

    let id = get(ENV_CONNECTOR_ID);
    let secret = get(ENV_CONNECTOR_SECRET);
    if id.is_some() || secret.is_some() {
        let current = config.identity.take().unwrap_or_else(|| ConnectorIdentity::new("", ""));
        config.identity = Some(ConnectorIdentity {
            connector_id: id.unwrap_or(current.connector_id),
            secret: secret.unwrap_or(current.secret),
        });
    }
}
