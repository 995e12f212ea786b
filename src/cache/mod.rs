//! Caching subsystem.
//!
//! - [`jail::Jail`]: per-fingerprint observation counter. A response is only
//!   cached once its request has been seen more than `jail_threshold` times;
//!   until then every request is served live.
//! - [`response::ResponseCache`]: two-tier store (local moka LRU + TTL in
//!   front of an optional [`network::NetworkCache`]).
//! - [`fetch::CachedFetch`]: semaphore-bounded HTTP fetch that classifies
//!   responses as streaming or bufferable and caches graduated responses.
//! - [`middleware::CacheMiddleware`]: the same policy applied to
//!   generate/stream calls inside a model chain.

pub mod fetch;
pub mod fingerprint;
pub mod jail;
pub mod middleware;
pub mod network;
pub mod response;

pub use fetch::{ByteStream, CachedFetch, FetchRequest, FetchResponse, ResponseKind};
pub use jail::{Jail, JailRecord};
pub use middleware::CacheMiddleware;
pub use network::{MemoryNetworkCache, NetworkCache};
pub use response::{CacheTier, CachedValue, ResponseCache};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_secs;

/// Configuration for the response cache, the jail and stream capture.
///
/// ```rust
/// # use bifrost::cache::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_entries(10_000)
///     .ttl(Duration::from_secs(3600))
///     .jail_threshold(3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch. Default: enabled.
    pub enabled: bool,
    /// Maximum number of locally cached entries. Default: 10,000.
    pub max_entries: u64,
    /// Time-to-live for cached responses. Default: 1 hour.
    #[serde(rename = "ttl_secs", with = "duration_secs")]
    pub ttl: Duration,
    /// Observations a fingerprint needs before its response is cached.
    /// Default: 3 (the fourth request is the first one cached).
    pub jail_threshold: u64,
    /// Time-to-live of jail records. Default: 24 hours.
    #[serde(rename = "jail_ttl_secs", with = "duration_secs")]
    pub jail_ttl: Duration,
    /// Whether streamed responses are captured. Default: enabled.
    pub stream_caching: bool,
    /// Maximum captured chunks per stream. Default: 10,000.
    pub max_stream_chunks: usize,
    /// Maximum captured bytes per stream. Default: 4 MiB.
    pub max_stream_bytes: usize,
    /// Maximum bytes buffered before a response degrades to streaming.
    /// Default: 1 MiB.
    pub max_buffer_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            ttl: Duration::from_secs(3600),
            jail_threshold: 3,
            jail_ttl: Duration::from_secs(24 * 3600),
            stream_caching: true,
            max_stream_chunks: 10_000,
            max_stream_bytes: 4 * 1024 * 1024,
            max_buffer_bytes: 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable caching.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the maximum number of locally cached entries.
    pub fn max_entries(mut self, n: u64) -> Self {
        self.max_entries = n;
        self
    }

    /// Set the time-to-live for cached responses.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the jail threshold.
    pub fn jail_threshold(mut self, threshold: u64) -> Self {
        self.jail_threshold = threshold;
        self
    }

    /// Set the time-to-live of jail records.
    pub fn jail_ttl(mut self, ttl: Duration) -> Self {
        self.jail_ttl = ttl;
        self
    }

    /// Enable or disable stream capture.
    pub fn stream_caching(mut self, enabled: bool) -> Self {
        self.stream_caching = enabled;
        self
    }

    /// Bound captured streams by chunk count and total bytes.
    pub fn stream_limits(mut self, max_chunks: usize, max_bytes: usize) -> Self {
        self.max_stream_chunks = max_chunks;
        self.max_stream_bytes = max_bytes;
        self
    }

    /// Set the buffering limit for bufferable responses.
    pub fn max_buffer_bytes(mut self, n: usize) -> Self {
        self.max_buffer_bytes = n;
        self
    }
}
