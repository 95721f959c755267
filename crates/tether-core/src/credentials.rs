//! Credential lookup for the local service.
//!
//! Tokens are never cached: every forwarded request asks the provider again,
//! so a token rotated on disk is picked up without restarting the connector.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{LocalConfig, load_config_file};

/// Environment variable that overrides every other token source.
pub const ENV_GATEWAY_TOKEN: &str = "TETHER_GATEWAY_TOKEN";

/// Supplies the current bearer token for the local service.
///
/// `None` means "send the request unauthenticated"; it is not an error,
/// since some local services run without auth.
pub trait CredentialProvider: Send + Sync {
    fn current_gateway_token(&self) -> Option<String>;
}

/// A fixed token.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub const fn none() -> Self {
        Self(None)
    }
}

impl CredentialProvider for StaticToken {
    fn current_gateway_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Reads the token from the connector config file on every call.
///
/// Resolution order:
/// 1. `TETHER_GATEWAY_TOKEN`
/// 2. `local.gateway_token` in the connector config file
/// 3. the local service's own config file (`local.token_discovery_path`,
///    `~/.openclaw/openclaw.json` unless configured), at
///    `local.token_discovery_pointer`
#[derive(Debug, Clone)]
pub struct FileCredentialProvider {
    config_path: Option<PathBuf>,
    /// Discovery settings used when the config file is missing or unreadable.
    fallback: LocalConfig,
    env_var: Option<&'static str>,
}

impl FileCredentialProvider {
    pub fn new(config_path: Option<PathBuf>, fallback: LocalConfig) -> Self {
        Self {
            config_path,
            fallback,
            env_var: Some(ENV_GATEWAY_TOKEN),
        }
    }

    /// Ignore the environment override.
    #[must_use]
    pub const fn without_env(mut self) -> Self {
        self.env_var = None;
        self
    }

    fn current_local_config(&self) -> LocalConfig {
        let Some(path) = self.config_path.as_deref().filter(|p| p.exists()) else {
            return self.fallback.clone();
        };
        match load_config_file(path) {
            Ok(config) => config.local,
            Err(e) => {
                debug!(error = %e, "Config unreadable, using startup credentials");
                self.fallback.clone()
            }
        }
    }
}

impl CredentialProvider for FileCredentialProvider {
    fn current_gateway_token(&self) -> Option<String> {
        let from_env = self
            .env_var
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty());
        if from_env.is_some() {
            return from_env;
        }

        let local = self.current_local_config();
        if let Some(token) = local.gateway_token.filter(|t| !t.is_empty()) {
            return Some(token);
        }
        local
            .token_discovery_path
            .as_deref()
            .and_then(|path| discover_token(path, &local.token_discovery_pointer))
    }
}

/// Read a token out of another program's JSON config file.
pub fn discover_token(path: &Path, pointer: &str) -> Option<String> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Token discovery file unreadable");
            return None;
        }
    };
    let value: serde_json::Value = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Token discovery file is not JSON");
            return None;
        }
    };
    value
        .pointer(pointer)
        .and_then(serde_json::Value::as_str)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn static_token() {
        assert_eq!(StaticToken::new("t").current_gateway_token().as_deref(), Some("t"));
        assert_eq!(StaticToken::none().current_gateway_token(), None);
    }

    #[test]
    fn rotation_is_picked_up_without_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connector.json");
        write(&path, r#"{"local": {"gateway_token": "first"}}"#);

        let provider =
            FileCredentialProvider::new(Some(path.clone()), LocalConfig::default()).without_env();
        assert_eq!(provider.current_gateway_token().as_deref(), Some("first"));

        write(&path, r#"{"local": {"gateway_token": "second"}}"#);
        assert_eq!(provider.current_gateway_token().as_deref(), Some("second"));
    }

    #[test]
    fn falls_back_to_discovery_file() {
        let dir = tempfile::tempdir().unwrap();
        let service_cfg = dir.path().join("service.json");
        write(&service_cfg, r#"{"gateway": {"auth": {"token": "discovered"}}}"#);

        let path = dir.path().join("connector.json");
        let config = format!(
            r#"{{"local": {{"token_discovery_path": {:?}}}}}"#,
            service_cfg.display().to_string()
        );
        write(&path, &config);

        let provider =
            FileCredentialProvider::new(Some(path), LocalConfig::default()).without_env();
        assert_eq!(provider.current_gateway_token().as_deref(), Some("discovered"));
    }

    #[test]
    fn none_when_nothing_configured() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = LocalConfig {
            token_discovery_path: None,
            ..LocalConfig::default()
        };
        let provider =
            FileCredentialProvider::new(Some(dir.path().join("missing.json")), fallback)
                .without_env();
        assert_eq!(provider.current_gateway_token(), None);
    }

    #[test]
    fn discovery_needs_no_connector_config() {
        let dir = tempfile::tempdir().unwrap();
        let gateway_cfg = dir.path().join("openclaw.json");
        write(&gateway_cfg, r#"{"gateway": {"auth": {"token": "from-gateway"}}}"#);

        // No connector config on disk and no explicit pointer: the default
        // pointer is applied to the discovery file.
        let fallback = LocalConfig {
            token_discovery_path: Some(gateway_cfg),
            ..LocalConfig::default()
        };
        let provider =
            FileCredentialProvider::new(Some(dir.path().join("missing.json")), fallback)
                .without_env();
        assert_eq!(provider.current_gateway_token().as_deref(), Some("from-gateway"));
    }

    #[test]
    fn unreadable_config_uses_startup_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connector.json");
        write(&path, "{ truncated");
        let fallback = LocalConfig {
            gateway_token: Some("startup".into()),
            ..LocalConfig::default()
        };
        let provider = FileCredentialProvider::new(Some(path), fallback).without_env();
        assert_eq!(provider.current_gateway_token().as_deref(), Some("startup"));
    }

    #[test]
    fn discovery_ignores_wrong_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.json");
        write(&path, r#"{"gateway": {"auth": {"token": 12}}}"#);
        assert_eq!(discover_token(&path, "/gateway/auth/token"), None);
        write(&path, "not json");
        assert_eq!(discover_token(&path, "/gateway/auth/token"), None);
        assert_eq!(discover_token(&dir.path().join("absent"), "/x"), None);
    }
}
