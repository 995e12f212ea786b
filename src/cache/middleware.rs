//! Response cache middleware.
//!
//! Applies the jail policy to chain calls. Each request fingerprint is
//! counted on every call; at or below the threshold the request goes
//! straight to the next link and nothing is cached. Past the threshold a
//! cached response is served if present, otherwise the live response is
//! written back.
//!
//! Non-streaming results are written back before returning. Streams are
//! captured part by part (bounded by `max_stream_chunks` /
//! `max_stream_bytes`) and cached only when they end cleanly; a cached
//! stream is replayed part by part.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::{Stream, stream};
use pin_project_lite::pin_project;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::CacheConfig;
use super::fingerprint::generate_fingerprint;
use super::jail::{Jail, JailRecord};
use super::response::{CachedValue, ResponseCache};
use crate::middleware::{Middleware, Next};
use crate::registry::ModelRegistry;
use crate::types::{GenerateParams, GenerateResult, ModelHandle, PartStream, StreamPart};
use crate::{Result, telemetry};

/// Middleware id.
pub const CACHE_MIDDLEWARE_ID: &str = "cache";

/// What a cache entry written by this middleware holds.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum CachedPayload {
    Generate { result: GenerateResult },
    Stream { parts: Vec<StreamPart> },
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    jailed: AtomicU64,
}

/// Serialized middleware state.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheState {
    jail: BTreeMap<String, JailRecord>,
    hits: u64,
    misses: u64,
    writes: u64,
    jailed: u64,
}

struct Shared {
    cache: Arc<ResponseCache>,
    jail: Jail,
    config: CacheConfig,
    stats: CacheStats,
}

impl Shared {
    async fn store(&self, key: &str, payload: &CachedPayload, operation: &'static str) {
        match serde_json::to_vec(payload) {
            Ok(body) => {
                self.cache
                    .insert(key, CachedValue::json(body), operation)
                    .await;
                self.stats.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(key, error = %e, "failed to encode cache payload"),
        }
    }
}

/// Caches generate and stream results behind the jail.
pub struct CacheMiddleware {
    shared: Arc<Shared>,
    registry: Option<Arc<ModelRegistry>>,
}

impl CacheMiddleware {
    pub fn new(config: CacheConfig, cache: Arc<ResponseCache>) -> Self {
        let jail = Jail::new(config.jail_threshold, config.jail_ttl, config.max_entries);
        Self {
            shared: Arc::new(Shared {
                cache,
                jail,
                config,
                stats: CacheStats::default(),
            }),
            registry: None,
        }
    }

    /// Key entries by canonical model key instead of the raw handle.
    pub fn with_registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn jail(&self) -> &Jail {
        &self.shared.jail
    }

    async fn model_key(&self, handle: &ModelHandle, params: &GenerateParams) -> String {
        if let Some(routed) = &params.routed_model {
            return routed.clone();
        }
        let Some(registry) = &self.registry else {
            return handle.raw_key();
        };
        match registry.model_key(&handle.provider, &handle.model_id).await {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "registry unavailable, keying cache on raw handle");
                handle.raw_key()
            }
        }
    }

    /// Fingerprint and jail check. `Some(key)` when the cache may be used.
    async fn admit(
        &self,
        operation: &'static str,
        handle: &ModelHandle,
        params: &GenerateParams,
    ) -> Option<String> {
        if !self.shared.config.enabled {
            return None;
        }
        let model_key = self.model_key(handle, params).await;
        let key = match generate_fingerprint(operation, &model_key, params) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "failed to fingerprint request, bypassing cache");
                return None;
            }
        };
        let record = self.shared.jail.observe(&key);
        if self.shared.jail.is_released(&record) {
            return Some(key);
        }
        self.shared.stats.jailed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::JAILED_TOTAL, "operation" => operation).increment(1);
        debug!(count = record.count, threshold = self.shared.jail.threshold(), "request jailed");
        None
    }

    async fn lookup(&self, key: &str, operation: &'static str) -> Option<CachedPayload> {
        let (value, tier) = self.shared.cache.get(key, operation).await?;
        match serde_json::from_slice(&value.body) {
            Ok(payload) => {
                debug!(tier = tier.as_str(), operation, "cache hit");
                Some(payload)
            }
            Err(e) => {
                warn!(key, error = %e, "discarding undecodable cache entry");
                None
            }
        }
    }
}

#[async_trait]
impl Middleware for CacheMiddleware {
    fn id(&self) -> &str {
        CACHE_MIDDLEWARE_ID
    }

    async fn wrap_generate(
        &self,
        handle: &ModelHandle,
        params: GenerateParams,
        next: Next<'_>,
    ) -> Result<GenerateResult> {
        let Some(key) = self.admit("generate", handle, &params).await else {
            return next.generate(params).await;
        };

        if let Some(CachedPayload::Generate { result }) = self.lookup(&key, "generate").await {
            self.shared.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(result);
        }
        self.shared.stats.misses.fetch_add(1, Ordering::Relaxed);

        let result = next.generate(params).await?;

        let shared = self.shared.clone();
        let payload = CachedPayload::Generate {
            result: result.clone(),
        };
        // Completes even if the caller goes away.
        let write = tokio::spawn(async move { shared.store(&key, &payload, "generate").await });
        if let Err(e) = write.await {
            error!(error = %e, "cache write task failed");
        }
        Ok(result)
    }

    async fn wrap_stream(
        &self,
        handle: &ModelHandle,
        params: GenerateParams,
        next: Next<'_>,
    ) -> Result<PartStream> {
        // Counted even when streams are not cached.
        let admitted = self.admit("stream", handle, &params).await;
        let Some(key) = admitted.filter(|_| self.shared.config.stream_caching) else {
            return next.stream(params).await;
        };

        if let Some(CachedPayload::Stream { parts }) = self.lookup(&key, "stream").await {
            self.shared.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Box::pin(stream::iter(parts.into_iter().map(Ok))));
        }
        self.shared.stats.misses.fetch_add(1, Ordering::Relaxed);

        let inner = next.stream(params).await?;
        Ok(Box::pin(CaptureStream::new(inner, key, self.shared.clone())))
    }

    fn is_state_aware(&self) -> bool {
        true
    }

    fn collect_state(&self) -> Result<Option<serde_json::Value>> {
        let stats = &self.shared.stats;
        let state = CacheState {
            jail: self.shared.jail.snapshot(),
            hits: stats.hits.load(Ordering::Relaxed),
            misses: stats.misses.load(Ordering::Relaxed),
            writes: stats.writes.load(Ordering::Relaxed),
            jailed: stats.jailed.load(Ordering::Relaxed),
        };
        Ok(Some(serde_json::to_value(state)?))
    }

    fn restore_state(&self, state: &serde_json::Value) -> Result<()> {
        let state: CacheState = serde_json::from_value(state.clone())?;
        let stats = &self.shared.stats;
        stats.hits.store(state.hits, Ordering::Relaxed);
        stats.misses.store(state.misses, Ordering::Relaxed);
        stats.writes.store(state.writes, Ordering::Relaxed);
        stats.jailed.store(state.jailed, Ordering::Relaxed);
        self.shared.jail.restore(state.jail);
        Ok(())
    }
}

pin_project! {
    /// Forwards parts while keeping a bounded copy for the cache.
    struct CaptureStream<S> {
        #[pin]
        inner: S,
        key: String,
        shared: Arc<Shared>,
        parts: Vec<StreamPart>,
        bytes: usize,
        overflowed: bool,
        failed: bool,
    }
}

impl<S> CaptureStream<S> {
    fn new(inner: S, key: String, shared: Arc<Shared>) -> Self {
        Self {
            inner,
            key,
            shared,
            parts: Vec::new(),
            bytes: 0,
            overflowed: false,
            failed: false,
        }
    }
}

impl<S> Stream for CaptureStream<S>
where
    S: Stream<Item = Result<StreamPart>>,
{
    type Item = Result<StreamPart>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(part))) => {
                if !*this.overflowed && !*this.failed {
                    let config = &this.shared.config;
                    let size = part.size_hint();
                    if this.parts.len() + 1 > config.max_stream_chunks
                        || *this.bytes + size > config.max_stream_bytes
                    {
                        debug!("stream exceeded capture limits, not caching");
                        *this.overflowed = true;
                        *this.parts = Vec::new();
                    } else if matches!(part, StreamPart::Error { .. }) {
                        *this.failed = true;
                    } else {
                        *this.bytes += size;
                        this.parts.push(part.clone());
                    }
                }
                Poll::Ready(Some(Ok(part)))
            }
            Poll::Ready(Some(Err(e))) => {
                *this.failed = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if !*this.overflowed && !*this.failed && !this.parts.is_empty() {
                    let payload = CachedPayload::Stream {
                        parts: std::mem::take(this.parts),
                    };
                    let key = std::mem::take(this.key);
                    let shared = this.shared.clone();
                    tokio::spawn(async move { shared.store(&key, &payload, "stream").await });
                }
                Poll::Ready(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ModelChain;
    use crate::traits::LanguageModel;
    use futures_util::StreamExt;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Answers with the call number so cached responses are recognisable.
    struct CountingModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for CountingModel {
        fn name(&self) -> &str {
            "counting"
        }

        async fn do_generate(
            &self,
            _handle: &ModelHandle,
            _params: GenerateParams,
        ) -> Result<GenerateResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(GenerateResult::from_text(format!("response {n}")))
        }

        async fn do_stream(&self, _handle: &ModelHandle, _params: GenerateParams) -> Result<PartStream> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let parts = StreamPart::text_parts("t", format!("stream {n}"));
            Ok(Box::pin(stream::iter(parts.into_iter().map(Ok))))
        }
    }

    fn chain(config: CacheConfig) -> (ModelChain, Arc<CountingModel>) {
        let model = Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(ResponseCache::new(&config, None));
        let chain = ModelChain::builder(model.clone())
            .with(Arc::new(CacheMiddleware::new(config, cache)))
            .build()
            .unwrap();
        (chain, model)
    }

    fn handle() -> ModelHandle {
        ModelHandle::new("openai", "gpt-4.1", "hifi")
    }

    async fn collect_text(stream: PartStream) -> String {
        stream
            .filter_map(|p| async move {
                match p {
                    Ok(StreamPart::TextDelta { delta, .. }) => Some(delta),
                    _ => None,
                }
            })
            .collect::<Vec<_>>()
            .await
            .concat()
    }

    #[tokio::test]
    async fn jailed_requests_are_served_live() {
        let (chain, model) = chain(CacheConfig::new().jail_threshold(3));
        let mut texts = Vec::new();
        for _ in 0..6 {
            let result = chain
                .generate(&handle(), GenerateParams::from_prompt("hi"))
                .await
                .unwrap();
            texts.push(result.text);
        }
        // Calls 1-3 are jailed, call 4 is the first cached, 5-6 hit it.
        assert_eq!(
            texts,
            vec![
                "response 1",
                "response 2",
                "response 3",
                "response 4",
                "response 4",
                "response 4"
            ]
        );
        assert_eq!(model.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn disabled_cache_always_forwards() {
        let (chain, model) = chain(CacheConfig::new().enabled(false).jail_threshold(0));
        for _ in 0..3 {
            chain
                .generate(&handle(), GenerateParams::from_prompt("hi"))
                .await
                .unwrap();
        }
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn graduated_stream_is_replayed() {
        let (chain, model) = chain(CacheConfig::new().jail_threshold(0));
        let first = chain
            .stream(&handle(), GenerateParams::from_prompt("hi"))
            .await
            .unwrap();
        assert_eq!(collect_text(first).await, "stream 1");

        // The write is spawned when the stream ends.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let replay = chain
            .stream(&handle(), GenerateParams::from_prompt("hi"))
            .await
            .unwrap();
        assert_eq!(collect_text(replay).await, "stream 1");
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn uncached_streams_still_count_towards_the_jail() {
        let (chain, model) = chain(CacheConfig::new().jail_threshold(0).stream_caching(false));
        for _ in 0..2 {
            let s = chain
                .stream(&handle(), GenerateParams::from_prompt("hi"))
                .await
                .unwrap();
            collect_text(s).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);

        let entries = chain.collect_state().unwrap();
        let snapshot = entries[0].state().snapshot().unwrap();
        let counts: Vec<u64> = snapshot["jail"]
            .as_object()
            .unwrap()
            .values()
            .map(|record| record["count"].as_u64().unwrap())
            .collect();
        assert_eq!(counts, vec![2]);
    }

    #[tokio::test]
    async fn oversized_stream_is_not_cached() {
        let (chain, model) = chain(CacheConfig::new().jail_threshold(0).stream_limits(2, 1024));
        for _ in 0..3 {
            let s = chain
                .stream(&handle(), GenerateParams::from_prompt("hi"))
                .await
                .unwrap();
            collect_text(s).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn state_round_trips_jail_counts() {
        let config = CacheConfig::new().jail_threshold(3);
        let (source, _) = chain(config.clone());
        for _ in 0..2 {
            source
                .generate(&handle(), GenerateParams::from_prompt("hi"))
                .await
                .unwrap();
        }
        let entries = source.collect_state().unwrap();
        let data = crate::state::StateData::from_entries(entries);

        let (target, model) = chain(config);
        assert_eq!(target.restore_state(&data).unwrap(), 1);
        // Two prior observations carried over: the 2nd call here is the 4th overall.
        target
            .generate(&handle(), GenerateParams::from_prompt("hi"))
            .await
            .unwrap();
        let fourth = target
            .generate(&handle(), GenerateParams::from_prompt("hi"))
            .await
            .unwrap();
        let fifth = target
            .generate(&handle(), GenerateParams::from_prompt("hi"))
            .await
            .unwrap();
        assert_eq!(fourth.text, fifth.text);
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }
}
