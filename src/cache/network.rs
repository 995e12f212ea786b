//! Networked cache collaborator.
//!
//! A [`NetworkCache`] is a shared key/value store (Redis-like) that sits
//! behind the local tier of [`ResponseCache`](super::ResponseCache). Values
//! are opaque strings; callers own the encoding.
//!
//! [`MemoryNetworkCache`] is an in-process implementation for tests and
//! single-node deployments.

use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use tokio::time::Instant;

use crate::Result;

/// Shared string key/value store with optional per-key expiry.
#[async_trait]
pub trait NetworkCache: Send + Sync {
    /// Open the connection. Default: no-op.
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Close the connection. Default: no-op.
    async fn quit(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> Result<()>;

    async fn set_with_expiry(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Clone, Debug)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

/// In-memory [`NetworkCache`].
///
/// Expiry is checked on read against tokio's clock, so paused-time tests
/// can advance past it.
pub struct MemoryNetworkCache {
    entries: Cache<String, StoredValue>,
}

impl MemoryNetworkCache {
    pub fn new(max_entries: u64) -> Self {
        Self {
            entries: Cache::new(max_entries),
        }
    }

    /// Number of entries, including any not yet observed as expired.
    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryNetworkCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl NetworkCache for MemoryNetworkCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entries.get(key).await {
            Some(stored) if stored.expires_at.is_some_and(|at| at <= Instant::now()) => {
                self.entries.invalidate(key).await;
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.value)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries
            .insert(
                key.to_string(),
                StoredValue {
                    value,
                    expires_at: None,
                },
            )
            .await;
        Ok(())
    }

    async fn set_with_expiry(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.entries
            .insert(
                key.to_string(),
                StoredValue {
                    value,
                    expires_at: Some(Instant::now() + ttl),
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.invalidate(key).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let cache = MemoryNetworkCache::default();
        cache.connect().await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        cache.set("k", "v".into()).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        cache.quit().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_follows_tokio_clock() {
        let cache = MemoryNetworkCache::default();
        cache
            .set_with_expiry("k", "v".into(), Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get("k").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").await.unwrap().is_none());
    }
}
