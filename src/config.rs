//! Configuration loading for the gateway.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. Explicit path (CLI flag)
//! 2. `~/.bifrost/config.toml` (user)
//! 3. `/etc/bifrost/config.toml` (system)
//!
//! Every section is optional; missing sections and keys take the defaults
//! documented on each struct. Durations are written as whole seconds
//! (`*_secs`) or milliseconds (`*_ms`).

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::persistence::FlushConfig;
use crate::rate_limit::RateLimitConfig;
use crate::{BifrostError, Result};

/// Gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub persistence: FlushConfig,
    /// Upstream endpoints keyed by canonical provider name. A file that has
    /// a `[providers.*]` table replaces the defaults entirely.
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyConfig::default(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            persistence: FlushConfig::default(),
            providers: default_providers(),
        }
    }
}

/// Upstream concurrency limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencyConfig {
    /// Maximum in-flight upstream requests (default: 16).
    #[serde(default = "default_max_upstream")]
    pub max_upstream: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_upstream: default_max_upstream(),
        }
    }
}

fn default_max_upstream() -> usize {
    16
}

/// One OpenAI-compatible upstream endpoint.
///
/// ```toml
/// [providers.azure]
/// base_url_env = "AZURE_OPENAI_ENDPOINT"
/// api_key_env = "AZURE_OPENAI_API_KEY"
/// api_key_header = "api-key"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the base URL when `base_url` is unset.
    #[serde(default)]
    pub base_url_env: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Header carrying the raw API key. Unset: `Authorization: Bearer`.
    #[serde(default)]
    pub api_key_header: Option<String>,
    /// Request timeout in seconds (default: 120).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            base_url_env: None,
            api_key_env: None,
            api_key_header: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ProviderConfig {
    /// Endpoint at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Self::default()
        }
    }

    /// Configured base URL, else the one in `base_url_env`.
    pub fn base_url(&self) -> Option<String> {
        self.base_url
            .clone()
            .or_else(|| read_env(self.base_url_env.as_deref()?))
    }

    /// API key read from the configured environment variable, if set.
    pub fn api_key(&self) -> Option<String> {
        read_env(self.api_key_env.as_deref()?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Matches the default primary/fallback providers of [`RateLimitConfig`].
fn default_providers() -> BTreeMap<String, ProviderConfig> {
    BTreeMap::from([
        (
            "azure".to_string(),
            ProviderConfig {
                base_url_env: Some("AZURE_OPENAI_ENDPOINT".to_string()),
                api_key_env: Some("AZURE_OPENAI_API_KEY".to_string()),
                api_key_header: Some("api-key".to_string()),
                ..ProviderConfig::default()
            },
        ),
        (
            "openai".to_string(),
            ProviderConfig {
                base_url: Some("https://api.openai.com/v1".to_string()),
                api_key_env: Some("OPENAI_API_KEY".to_string()),
                ..ProviderConfig::default()
            },
        ),
    ])
}

fn default_timeout_secs() -> u64 {
    120
}

impl GatewayConfig {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.bifrost/config.toml`
    /// 3. `/etc/bifrost/config.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        Self::load_from_file(&path)
    }

    /// Like [`load`](Self::load), but falls back to defaults when no file
    /// exists in the standard locations. An explicit path must still exist.
    pub fn load_or_default(explicit_path: Option<&Path>) -> Result<Self> {
        match Self::resolve_config_path(explicit_path) {
            Ok(path) => Self::load_from_file(&path),
            Err(_) if explicit_path.is_none() => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            BifrostError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        Self::parse(&content).map_err(|e| match e {
            BifrostError::Configuration(msg) => {
                BifrostError::Configuration(format!("{msg} (in {path:?})"))
            }
            other => other,
        })
    }

    /// Parse TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| {
            BifrostError::Configuration(format!("Failed to parse config: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency.max_upstream == 0 {
            return Err(BifrostError::InvalidConcurrency(0));
        }
        if self.persistence.batch_size == 0 {
            return Err(BifrostError::Configuration(
                "persistence.batch_size must be positive".to_string(),
            ));
        }
        for (class, keys) in &self.rate_limit.classes {
            if let Some(bad) = keys.iter().find(|k| !k.contains(':')) {
                return Err(BifrostError::Configuration(format!(
                    "rate_limit.classes.{class}: `{bad}` is not a provider:model key"
                )));
            }
        }
        Ok(())
    }

    /// Resolve the config file path.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(BifrostError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".bifrost").join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/bifrost/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(BifrostError::Configuration(
            "No config file found. Create ~/.bifrost/config.toml or /etc/bifrost/config.toml"
                .to_string(),
        ))
    }
}

/// `Duration` as whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_takes_defaults() {
        let config = GatewayConfig::parse("").unwrap();
        assert_eq!(config.concurrency.max_upstream, 16);
        assert_eq!(config.persistence.batch_size, 10);
        assert_eq!(config.persistence.flush_interval, Duration::from_millis(500));
        assert_eq!(config.cache.jail_threshold, 3);
        assert_eq!(
            config.providers["openai"].api_key_env.as_deref(),
            Some("OPENAI_API_KEY")
        );
        // Both default failover providers have an endpoint entry.
        assert!(config.providers.contains_key(&config.rate_limit.primary_provider));
        assert!(
            config
                .rate_limit
                .fallback_provider
                .as_ref()
                .is_some_and(|p| config.providers.contains_key(p))
        );
    }

    #[test]
    fn provider_tables_replace_defaults() {
        let config = GatewayConfig::parse(
            "[providers.local]\nbase_url = \"http://127.0.0.1:8080/v1\"\ntimeout_secs = 5\n",
        )
        .unwrap();
        assert_eq!(config.providers.len(), 1);
        let local = &config.providers["local"];
        assert_eq!(local.base_url().as_deref(), Some("http://127.0.0.1:8080/v1"));
        assert_eq!(local.timeout(), Duration::from_secs(5));
        assert!(local.api_key().is_none());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = GatewayConfig::parse("[concurrency]\nmax_upstream = 0\n").unwrap_err();
        assert!(matches!(err, BifrostError::InvalidConcurrency(0)));
    }

    #[test]
    fn class_entries_must_be_compound_keys() {
        let err = GatewayConfig::parse("[rate_limit.classes]\nhifi = [\"gpt-4.1\"]\n").unwrap_err();
        assert!(err.to_string().contains("hifi"));
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let err = GatewayConfig::load(Some(Path::new("/nonexistent/bifrost.toml"))).unwrap_err();
        assert!(matches!(err, BifrostError::Configuration(_)));
    }
}
