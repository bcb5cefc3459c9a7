use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use concord_core::config::{optional_trimmed, EngineConfig};
use thiserror::Error;

const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Engine(#[from] concord_core::config::ConfigError),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub jwt_secret: String,
    pub jwt_issuer: Option<String>,
    pub auth_clock_skew: Duration,
    pub memory_adapter: bool,
    pub cloud_bridge: Option<CloudBridgeConfig>,
    pub engine: EngineConfig,
}

#[derive(Clone, PartialEq, Eq)]
pub struct CloudBridgeConfig {
    pub provider: String,
    pub url: String,
    pub token: String,
}

impl fmt::Debug for CloudBridgeConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CloudBridgeConfig")
            .field("provider", &self.provider)
            .field("url", &self.url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_issuer", &self.jwt_issuer)
            .field("auth_clock_skew", &self.auth_clock_skew)
            .field("memory_adapter", &self.memory_adapter)
            .field("cloud_bridge", &self.cloud_bridge)
            .field("engine", &self.engine)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "CONCORD_API_BIND_ADDR", "127.0.0.1:8080");
        let database_path =
            PathBuf::from(value_or_default(&lookup, "CONCORD_DB_PATH", "concord.db"));

        let jwt_secret = required_trimmed(&lookup, "CONCORD_JWT_SECRET")?;
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "CONCORD_JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} characters"
            )));
        }
        let jwt_issuer = optional_trimmed(&lookup, "CONCORD_JWT_ISSUER");

        let auth_clock_skew_secs = value_or_default(&lookup, "AUTH_CLOCK_SKEW_SECS", "60")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "AUTH_CLOCK_SKEW_SECS must be an integer in [0, 300]".to_string(),
                )
            })?;
        if auth_clock_skew_secs > 300 {
            return Err(ConfigError::Invalid(
                "AUTH_CLOCK_SKEW_SECS must be in [0, 300]".to_string(),
            ));
        }

        let memory_adapter = match value_or_default(&lookup, "CONCORD_MEMORY_ADAPTER", "false")
            .to_ascii_lowercase()
            .as_str()
        {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => {
                return Err(ConfigError::Invalid(
                    "CONCORD_MEMORY_ADAPTER must be true or false".to_string(),
                ))
            }
        };

        let cloud_bridge = parse_cloud_bridge(&lookup)?;
        let engine = EngineConfig::from_lookup(&lookup)?;

        Ok(Self {
            bind_addr,
            database_path,
            jwt_secret,
            jwt_issuer,
            auth_clock_skew: Duration::from_secs(auth_clock_skew_secs),
            memory_adapter,
            cloud_bridge,
            engine,
        })
    }
}

/// All three bridge variables or none of them.
fn parse_cloud_bridge(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<CloudBridgeConfig>, ConfigError> {
    let provider = optional_trimmed(&lookup, "CONCORD_CLOUD_BRIDGE_PROVIDER");
    let url = optional_trimmed(&lookup, "CONCORD_CLOUD_BRIDGE_URL");
    let token = optional_trimmed(&lookup, "CONCORD_CLOUD_BRIDGE_TOKEN");

    if provider.is_none() && url.is_none() && token.is_none() {
        return Ok(None);
    }

    let provider = provider.ok_or(ConfigError::MissingVar("CONCORD_CLOUD_BRIDGE_PROVIDER"))?;
    let url = url.ok_or(ConfigError::MissingVar("CONCORD_CLOUD_BRIDGE_URL"))?;
    let token = token.ok_or(ConfigError::MissingVar("CONCORD_CLOUD_BRIDGE_TOKEN"))?;
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ConfigError::Invalid(
            "CONCORD_CLOUD_BRIDGE_URL must start with http:// or https://".to_string(),
        ));
    }

    Ok(Some(CloudBridgeConfig {
        provider,
        url: url.trim_end_matches('/').to_string(),
        token,
    }))
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn config(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_jwt_secret() {
        let err = config(&[]).unwrap_err();
        assert!(err.to_string().contains("CONCORD_JWT_SECRET"));

        let err = config(&[("CONCORD_JWT_SECRET", "short")]).unwrap_err();
        assert!(err.to_string().contains("at least"));
    }

    #[test]
    fn config_defaults() {
        let config = config(&[("CONCORD_JWT_SECRET", SECRET)]).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.database_path, PathBuf::from("concord.db"));
        assert!(!config.memory_adapter);
        assert!(config.cloud_bridge.is_none());
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn cloud_bridge_is_all_or_nothing() {
        let err = config(&[
            ("CONCORD_JWT_SECRET", SECRET),
            ("CONCORD_CLOUD_BRIDGE_URL", "https://bridge.example.com"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("CONCORD_CLOUD_BRIDGE_PROVIDER"));

        let config = config(&[
            ("CONCORD_JWT_SECRET", SECRET),
            ("CONCORD_CLOUD_BRIDGE_PROVIDER", "sharepoint"),
            ("CONCORD_CLOUD_BRIDGE_URL", "https://bridge.example.com/"),
            ("CONCORD_CLOUD_BRIDGE_TOKEN", "bridge-token"),
        ])
        .unwrap();
        let bridge = config.cloud_bridge.unwrap();
        assert_eq!(bridge.url, "https://bridge.example.com");
    }

    #[test]
    fn engine_settings_are_validated() {
        let err = config(&[
            ("CONCORD_JWT_SECRET", SECRET),
            ("CONCORD_LOCK_TTL_SECS", "5"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Engine(_)));
    }

    #[test]
    fn config_redacts_sensitive_debug_fields() {
        let config = config(&[
            ("CONCORD_JWT_SECRET", "sensitive-jwt-secret-0123456789abcdef"),
            ("CONCORD_CLOUD_BRIDGE_PROVIDER", "sharepoint"),
            ("CONCORD_CLOUD_BRIDGE_URL", "https://bridge.example.com"),
            ("CONCORD_CLOUD_BRIDGE_TOKEN", "sensitive-bridge-token"),
        ])
        .unwrap();

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-jwt-secret"));
        assert!(!debug_output.contains("sensitive-bridge-token"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
