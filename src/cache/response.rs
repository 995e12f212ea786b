//! Two-tier response cache.
//!
//! Lookups try the local moka LRU + TTL tier first, then the optional
//! [`NetworkCache`]. A network hit is promoted into the local tier. Writes go
//! to both tiers; the network copy expires with the same TTL.
//!
//! Network failures never fail a request: reads degrade to a miss and
//! writes are logged and dropped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::CacheConfig;
use super::network::NetworkCache;
use crate::telemetry;

/// A cached HTTP-shaped response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedValue {
    /// Raw body bytes, base64 in serialized form.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
    /// Response headers with lowercase names.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub status_code: u16,
}

impl CachedValue {
    /// A 200 response carrying a JSON body.
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            body,
            headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
            status_code: 200,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

mod body_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Which tier served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Local,
    Network,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Local => "local",
            CacheTier::Network => "network",
        }
    }
}

/// Local tier in front of an optional network tier.
pub struct ResponseCache {
    local: Cache<String, CachedValue>,
    network: Option<Arc<dyn NetworkCache>>,
    ttl: Duration,
}

impl ResponseCache {
    /// Create a new response cache with the given configuration.
    pub fn new(config: &CacheConfig, network: Option<Arc<dyn NetworkCache>>) -> Self {
        let local = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.ttl)
            .build();
        Self {
            local,
            network,
            ttl: config.ttl,
        }
    }

    /// Look up `key`, emitting hit/miss metrics under `operation`.
    pub async fn get(&self, key: &str, operation: &'static str) -> Option<(CachedValue, CacheTier)> {
        if let Some(value) = self.local.get(key).await {
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "tier" => "local", "operation" => operation)
                .increment(1);
            return Some((value, CacheTier::Local));
        }

        if let Some(value) = self.network_get(key).await {
            self.local.insert(key.to_string(), value.clone()).await;
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "tier" => "network", "operation" => operation)
                .increment(1);
            return Some((value, CacheTier::Network));
        }

        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "operation" => operation).increment(1);
        None
    }

    async fn network_get(&self, key: &str) -> Option<CachedValue> {
        let network = self.network.as_ref()?;
        let raw = match network.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key, error = %e, "network cache read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "discarding undecodable network cache entry");
                None
            }
        }
    }

    /// Store `value` in both tiers.
    pub async fn insert(&self, key: &str, value: CachedValue, operation: &'static str) {
        if let Some(network) = &self.network {
            match serde_json::to_string(&value) {
                Ok(encoded) => {
                    if let Err(e) = network.set_with_expiry(key, encoded, self.ttl).await {
                        warn!(key, error = %e, "network cache write failed");
                    }
                }
                Err(e) => warn!(key, error = %e, "failed to encode cache entry"),
            }
        }
        self.local.insert(key.to_string(), value).await;
        metrics::counter!(telemetry::CACHE_WRITES_TOTAL, "operation" => operation).increment(1);
        debug!(key, operation, "cached response");
    }

    /// Drop `key` from both tiers.
    pub async fn invalidate(&self, key: &str) {
        self.local.invalidate(key).await;
        if let Some(network) = &self.network
            && let Err(e) = network.delete(key).await
        {
            warn!(key, error = %e, "network cache delete failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryNetworkCache, NetworkCache};

    fn value(body: &str) -> CachedValue {
        CachedValue::json(body.as_bytes().to_vec())
    }

    #[test]
    fn body_serializes_as_base64() {
        let json = serde_json::to_value(value("hi")).unwrap();
        assert_eq!(json["body"], "aGk=");
        assert_eq!(json["status_code"], 200);
    }

    #[tokio::test]
    async fn local_hit_after_insert() {
        let cache = ResponseCache::new(&CacheConfig::new(), None);
        assert!(cache.get("k", "generate").await.is_none());
        cache.insert("k", value("a"), "generate").await;
        let (hit, tier) = cache.get("k", "generate").await.unwrap();
        assert_eq!(hit, value("a"));
        assert_eq!(tier, CacheTier::Local);
    }

    #[tokio::test]
    async fn network_hit_is_promoted() {
        let network = Arc::new(MemoryNetworkCache::default());
        let writer = ResponseCache::new(&CacheConfig::new(), Some(network.clone()));
        writer.insert("k", value("shared"), "fetch").await;

        let reader = ResponseCache::new(&CacheConfig::new(), Some(network));
        let (_, tier) = reader.get("k", "fetch").await.unwrap();
        assert_eq!(tier, CacheTier::Network);
        let (_, tier) = reader.get("k", "fetch").await.unwrap();
        assert_eq!(tier, CacheTier::Local);
    }

    #[tokio::test]
    async fn invalidate_clears_both_tiers() {
        let network = Arc::new(MemoryNetworkCache::default());
        let cache = ResponseCache::new(&CacheConfig::new(), Some(network.clone()));
        cache.insert("k", value("a"), "fetch").await;
        cache.invalidate("k").await;
        assert!(cache.get("k", "fetch").await.is_none());
        assert!(network.get("k").await.unwrap().is_none());
    }
}
