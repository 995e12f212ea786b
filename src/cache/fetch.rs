//! Semaphore-bounded HTTP fetch with cache admission.
//!
//! Every outbound request holds one [`Semaphore`] slot for as long as its
//! body is being read. Responses are classified from their headers:
//!
//! - **streaming** (chunked transfer encoding, `text/event-stream`,
//!   `multipart/*`, or a transfer encoding without a content length): the
//!   body is handed back as a stream that keeps the slot until it ends or
//!   fails, releasing it exactly once. Graduated requests tee the chunks
//!   into the cache, bounded by chunk count and bytes.
//! - **bufferable**: the body is read into memory, the slot is released and
//!   the value may be cached. A body that outgrows `max_buffer_bytes` is
//!   degraded to streaming mid-read.
//!
//! Caching follows the jail policy: a request is counted on every call and
//! only looked up or written once its count exceeds the threshold.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt, stream};
use pin_project_lite::pin_project;
use reqwest::Method;
use tracing::{debug, error, instrument};

use super::CacheConfig;
use super::fingerprint::fetch_fingerprint;
use super::jail::Jail;
use super::response::{CachedValue, ResponseCache};
use crate::semaphore::{Semaphore, SemaphorePermit};
use crate::types::AbortSignal;
use crate::{BifrostError, Result};

/// A stream of raw body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// An outbound HTTP request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Whether the response may be cached at all.
    pub cacheable: bool,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            cacheable: true,
        }
    }

    /// POST with a JSON body.
    pub fn post_json(url: impl Into<String>, body: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            method: Method::POST,
            url: url.into(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Some(serde_json::to_vec(body)?),
            cacheable: true,
        })
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    fn fingerprint(&self) -> String {
        fetch_fingerprint(self.method.as_str(), &self.url, self.body.as_deref())
    }
}

/// How a response body is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Streaming,
    Bufferable,
}

/// Classify a response from its (lowercase-named) headers.
pub fn classify(headers: &BTreeMap<String, String>) -> ResponseKind {
    let transfer_encoding = headers
        .get("transfer-encoding")
        .map(|v| v.to_ascii_lowercase());
    if transfer_encoding
        .as_deref()
        .is_some_and(|te| te.contains("chunked"))
    {
        return ResponseKind::Streaming;
    }
    if let Some(content_type) = headers.get("content-type") {
        let content_type = content_type.to_ascii_lowercase();
        if content_type.starts_with("text/event-stream") || content_type.starts_with("multipart/")
        {
            return ResponseKind::Streaming;
        }
    }
    if transfer_encoding.is_some() && !headers.contains_key("content-length") {
        return ResponseKind::Streaming;
    }
    ResponseKind::Bufferable
}

/// Result of [`CachedFetch::fetch`].
pub enum FetchResponse {
    /// Fully read (or cached) response.
    Buffered(CachedValue),
    /// Live body still holding its upstream slot.
    Streaming {
        status_code: u16,
        headers: BTreeMap<String, String>,
        body: ByteStream,
    },
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchResponse::Buffered(value) => f.debug_tuple("Buffered").field(value).finish(),
            FetchResponse::Streaming {
                status_code,
                headers,
                ..
            } => f
                .debug_struct("Streaming")
                .field("status_code", status_code)
                .field("headers", headers)
                .finish_non_exhaustive(),
        }
    }
}

impl FetchResponse {
    pub fn status_code(&self) -> u16 {
        match self {
            FetchResponse::Buffered(value) => value.status_code,
            FetchResponse::Streaming { status_code, .. } => *status_code,
        }
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        match self {
            FetchResponse::Buffered(value) => &value.headers,
            FetchResponse::Streaming { headers, .. } => headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers()
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, FetchResponse::Streaming { .. })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code())
    }

    /// Body as a chunk stream, whichever way it was read.
    pub fn into_stream(self) -> ByteStream {
        match self {
            FetchResponse::Buffered(value) => Box::pin(stream::once(async move { Ok(value.body) })),
            FetchResponse::Streaming { body, .. } => body,
        }
    }

    /// Read the whole body.
    pub async fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            FetchResponse::Buffered(value) => Ok(value.body),
            FetchResponse::Streaming { mut body, .. } => {
                let mut out = Vec::new();
                while let Some(chunk) = body.next().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(out)
            }
        }
    }
}

/// HTTP client bounded by a shared [`Semaphore`], with optional caching.
pub struct CachedFetch {
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
    cache: Option<Arc<ResponseCache>>,
    jail: Arc<Jail>,
    config: CacheConfig,
}

impl CachedFetch {
    /// Uncached fetch bounded by `semaphore`.
    pub fn new(client: reqwest::Client, semaphore: Arc<Semaphore>, config: CacheConfig) -> Self {
        let jail = Arc::new(Jail::new(
            config.jail_threshold,
            config.jail_ttl,
            config.max_entries,
        ));
        Self {
            client,
            semaphore,
            cache: None,
            jail,
            config,
        }
    }

    /// Cache graduated responses in `cache`.
    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        if self.config.enabled {
            self.cache = Some(cache);
        }
        self
    }

    pub fn semaphore(&self) -> &Arc<Semaphore> {
        &self.semaphore
    }

    pub fn jail(&self) -> &Arc<Jail> {
        &self.jail
    }

    /// Send `request`, honouring `abort` while waiting for a slot, the
    /// response head and a buffered body.
    #[instrument(skip(self, request, abort), fields(method = %request.method, url = %request.url))]
    pub async fn fetch(
        &self,
        request: FetchRequest,
        abort: Option<&AbortSignal>,
    ) -> Result<FetchResponse> {
        if abort.is_some_and(AbortSignal::is_aborted) {
            return Err(BifrostError::Cancelled);
        }

        let cache_key = match &self.cache {
            Some(cache) if request.cacheable => {
                let key = request.fingerprint();
                let record = self.jail.observe(&key);
                if self.jail.is_released(&record) {
                    if let Some((value, tier)) = cache.get(&key, "fetch").await {
                        debug!(tier = tier.as_str(), "serving cached response");
                        return Ok(FetchResponse::Buffered(value));
                    }
                    Some((key, cache.clone()))
                } else {
                    debug!(count = record.count, "request jailed, fetching live");
                    None
                }
            }
            _ => None,
        };

        let permit = abortable(abort, self.semaphore.acquire()).await?;

        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = abortable(abort, builder.send()).await??;

        let status_code = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let cacheable_status = (200..300).contains(&status_code);
        let capture = |headers: &BTreeMap<String, String>| {
            cache_key
                .clone()
                .filter(|_| cacheable_status && self.config.stream_caching)
                .map(|(key, cache)| {
                    StreamCapture::new(key, cache, status_code, headers.clone(), &self.config)
                })
        };

        let mut body = Box::pin(response.bytes_stream());

        if classify(&headers) == ResponseKind::Streaming {
            let chunks = body.map(|r| r.map(|b| b.to_vec()).map_err(BifrostError::from));
            let capture = capture(&headers);
            return Ok(FetchResponse::Streaming {
                status_code,
                headers,
                body: Box::pin(PermitStream::new(chunks, permit, capture, abort.cloned())),
            });
        }

        let mut buffer = Vec::new();
        while let Some(chunk) = abortable(abort, body.next()).await? {
            buffer.extend_from_slice(&chunk?);
            if buffer.len() > self.config.max_buffer_bytes {
                debug!(
                    buffered = buffer.len(),
                    limit = self.config.max_buffer_bytes,
                    "response outgrew buffer, streaming remainder"
                );
                let rest = body.map(|r| r.map(|b| b.to_vec()).map_err(BifrostError::from));
                let chunks = stream::once(async move { Ok(buffer) }).chain(rest);
                let capture = capture(&headers);
                return Ok(FetchResponse::Streaming {
                    status_code,
                    headers,
                    body: Box::pin(PermitStream::new(chunks, permit, capture, abort.cloned())),
                });
            }
        }
        // The body is already read; a release failure must not discard it.
        release_slot(&mut Some(permit));

        let value = CachedValue {
            body: buffer,
            headers,
            status_code,
        };
        if let Some((key, cache)) = cache_key
            && cacheable_status
        {
            let stored = value.clone();
            // Completes even if the caller goes away.
            let write = tokio::spawn(async move { cache.insert(&key, stored, "fetch").await });
            if let Err(e) = write.await {
                error!(error = %e, "cache write task failed");
            }
        }
        Ok(FetchResponse::Buffered(value))
    }
}

async fn abortable<F: Future>(abort: Option<&AbortSignal>, fut: F) -> Result<F::Output> {
    match abort {
        Some(signal) => tokio::select! {
            biased;
            _ = signal.aborted() => Err(BifrostError::Cancelled),
            out = fut => Ok(out),
        },
        None => Ok(fut.await),
    }
}

/// Bounded copy of a streamed body, written to the cache on clean end.
struct StreamCapture {
    key: String,
    cache: Arc<ResponseCache>,
    status_code: u16,
    headers: BTreeMap<String, String>,
    chunks: Vec<Vec<u8>>,
    bytes: usize,
    max_chunks: usize,
    max_bytes: usize,
    overflowed: bool,
}

impl StreamCapture {
    fn new(
        key: String,
        cache: Arc<ResponseCache>,
        status_code: u16,
        mut headers: BTreeMap<String, String>,
        config: &CacheConfig,
    ) -> Self {
        headers.remove("transfer-encoding");
        Self {
            key,
            cache,
            status_code,
            headers,
            chunks: Vec::new(),
            bytes: 0,
            max_chunks: config.max_stream_chunks,
            max_bytes: config.max_stream_bytes,
            overflowed: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.overflowed {
            return;
        }
        if self.chunks.len() + 1 > self.max_chunks || self.bytes + chunk.len() > self.max_bytes {
            debug!(key = %self.key, "stream exceeded capture limits, not caching");
            self.overflowed = true;
            self.chunks = Vec::new();
            return;
        }
        self.bytes += chunk.len();
        self.chunks.push(chunk.to_vec());
    }

    fn finish(self) {
        if self.overflowed {
            return;
        }
        let value = CachedValue {
            body: self.chunks.concat(),
            headers: self.headers,
            status_code: self.status_code,
        };
        let (cache, key) = (self.cache, self.key);
        tokio::spawn(async move { cache.insert(&key, value, "fetch").await });
    }
}

pin_project! {
    /// Body stream holding an upstream slot until it ends or fails.
    pub struct PermitStream<S> {
        #[pin]
        inner: S,
        permit: Option<SemaphorePermit>,
        capture: Option<StreamCapture>,
        abort: Option<AbortSignal>,
        done: bool,
    }
}

impl<S> PermitStream<S> {
    fn new(
        inner: S,
        permit: SemaphorePermit,
        capture: Option<StreamCapture>,
        abort: Option<AbortSignal>,
    ) -> Self {
        Self {
            inner,
            permit: Some(permit),
            capture,
            abort,
            done: false,
        }
    }
}

fn release_slot(permit: &mut Option<SemaphorePermit>) {
    if let Some(permit) = permit.take()
        && let Err(e) = permit.release()
    {
        error!(error = %e, "failed to release upstream slot");
    }
}

impl<S> Stream for PermitStream<S>
where
    S: Stream<Item = Result<Vec<u8>>>,
{
    type Item = Result<Vec<u8>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }
        if this.abort.as_ref().is_some_and(AbortSignal::is_aborted) {
            *this.done = true;
            this.capture.take();
            release_slot(this.permit);
            return Poll::Ready(Some(Err(BifrostError::Cancelled)));
        }
        match this.inner.poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(capture) = this.capture.as_mut() {
                    capture.push(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                *this.done = true;
                this.capture.take();
                release_slot(this.permit);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                *this.done = true;
                if let Some(capture) = this.capture.take() {
                    capture.finish();
                }
                release_slot(this.permit);
                Poll::Ready(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn classify_streaming_responses() {
        assert_eq!(
            classify(&headers(&[("transfer-encoding", "chunked")])),
            ResponseKind::Streaming
        );
        assert_eq!(
            classify(&headers(&[("content-type", "text/event-stream; charset=utf-8")])),
            ResponseKind::Streaming
        );
        assert_eq!(
            classify(&headers(&[("content-type", "multipart/mixed; boundary=x")])),
            ResponseKind::Streaming
        );
        assert_eq!(
            classify(&headers(&[("transfer-encoding", "gzip")])),
            ResponseKind::Streaming
        );
    }

    #[test]
    fn classify_bufferable_responses() {
        assert_eq!(
            classify(&headers(&[
                ("content-type", "application/json"),
                ("content-length", "12")
            ])),
            ResponseKind::Bufferable
        );
        assert_eq!(
            classify(&headers(&[
                ("transfer-encoding", "gzip"),
                ("content-length", "12")
            ])),
            ResponseKind::Bufferable
        );
        assert_eq!(classify(&BTreeMap::new()), ResponseKind::Bufferable);
    }

    #[tokio::test]
    async fn permit_stream_releases_once_on_end() {
        let sem = Arc::new(Semaphore::new(1).unwrap());
        let permit = sem.acquire().await;
        let inner = stream::iter(vec![Ok(b"a".to_vec()), Ok(b"b".to_vec())]);
        let mut s = PermitStream::new(inner, permit, None, None);
        assert_eq!(sem.available(), 0);
        while s.next().await.is_some() {}
        assert_eq!(sem.available(), 1);
        assert!(s.next().await.is_none());
        // A second release would be unmatched.
        assert!(sem.release().is_err());
    }

    #[tokio::test]
    async fn permit_stream_releases_on_error_and_stops() {
        let sem = Arc::new(Semaphore::new(1).unwrap());
        let permit = sem.acquire().await;
        let inner = stream::iter(vec![
            Ok(b"a".to_vec()),
            Err(BifrostError::Stream("reset".into())),
            Ok(b"never".to_vec()),
        ]);
        let mut s = PermitStream::new(inner, permit, None, None);
        assert!(s.next().await.unwrap().is_ok());
        assert!(s.next().await.unwrap().is_err());
        assert_eq!(sem.available(), 1);
        assert!(s.next().await.is_none());
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn permit_stream_stops_on_abort() {
        let sem = Arc::new(Semaphore::new(1).unwrap());
        let permit = sem.acquire().await;
        let signal = AbortSignal::new();
        let inner = stream::iter(vec![Ok(b"a".to_vec()), Ok(b"b".to_vec())]);
        let mut s = PermitStream::new(inner, permit, None, Some(signal.clone()));
        assert!(s.next().await.unwrap().is_ok());
        signal.abort();
        assert!(matches!(s.next().await, Some(Err(BifrostError::Cancelled))));
        assert_eq!(sem.available(), 1);
    }

    fn capture(config: &CacheConfig) -> (StreamCapture, Arc<ResponseCache>) {
        let cache = Arc::new(ResponseCache::new(config, None));
        let capture = StreamCapture::new(
            "key".into(),
            cache.clone(),
            200,
            headers(&[("content-type", "text/event-stream"), ("transfer-encoding", "chunked")]),
            config,
        );
        (capture, cache)
    }

    async fn drain(mut s: impl Stream<Item = Result<Vec<u8>>> + Unpin) {
        while s.next().await.is_some() {}
        // The cache write is spawned on clean end.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>>> + Unpin {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(p.as_bytes().to_vec()))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn clean_stream_is_written_whole() {
        let config = CacheConfig::new();
        let (capture, cache) = capture(&config);
        let sem = Arc::new(Semaphore::new(1).unwrap());
        let permit = sem.acquire().await;
        drain(PermitStream::new(chunks(&["data: a\n\n", "data: b\n\n"]), permit, Some(capture), None)).await;

        let (value, _) = cache.get("key", "fetch").await.unwrap();
        assert_eq!(value.body, b"data: a\n\ndata: b\n\n");
        assert_eq!(value.header("content-type"), Some("text/event-stream"));
        assert!(value.header("transfer-encoding").is_none());
    }

    #[tokio::test]
    async fn stream_over_chunk_limit_is_not_written() {
        let config = CacheConfig::new().stream_limits(2, 1024);
        let (capture, cache) = capture(&config);
        let sem = Arc::new(Semaphore::new(1).unwrap());
        let permit = sem.acquire().await;
        drain(PermitStream::new(chunks(&["a", "b", "c"]), permit, Some(capture), None)).await;
        assert!(cache.get("key", "fetch").await.is_none());
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn stream_over_byte_limit_is_not_written() {
        let config = CacheConfig::new().stream_limits(100, 8);
        let (capture, cache) = capture(&config);
        let sem = Arc::new(Semaphore::new(1).unwrap());
        let permit = sem.acquire().await;
        drain(PermitStream::new(chunks(&["12345", "67890"]), permit, Some(capture), None)).await;
        assert!(cache.get("key", "fetch").await.is_none());
    }

    #[tokio::test]
    async fn failed_stream_is_not_written() {
        let config = CacheConfig::new();
        let (capture, cache) = capture(&config);
        let sem = Arc::new(Semaphore::new(1).unwrap());
        let permit = sem.acquire().await;
        let inner = stream::iter(vec![
            Ok(b"a".to_vec()),
            Err(BifrostError::Stream("reset".into())),
        ]);
        drain(PermitStream::new(inner, permit, Some(capture), None)).await;
        assert!(cache.get("key", "fetch").await.is_none());
    }

    #[tokio::test]
    async fn aborted_stream_is_not_written() {
        let config = CacheConfig::new();
        let (capture, cache) = capture(&config);
        let sem = Arc::new(Semaphore::new(1).unwrap());
        let permit = sem.acquire().await;
        let signal = AbortSignal::new();
        let mut s = PermitStream::new(chunks(&["a", "b"]), permit, Some(capture), Some(signal.clone()));
        assert!(s.next().await.unwrap().is_ok());
        signal.abort();
        drain(s).await;
        assert!(cache.get("key", "fetch").await.is_none());
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn dropped_permit_stream_releases() {
        let sem = Arc::new(Semaphore::new(1).unwrap());
        let permit = sem.acquire().await;
        let s = PermitStream::new(stream::pending::<Result<Vec<u8>>>(), permit, None, None);
        drop(s);
        assert_eq!(sem.available(), 1);
    }
}
