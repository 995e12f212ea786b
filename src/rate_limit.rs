//! Rate-limit / failover middleware.
//!
//! Per request: check availability of the requested model, then of the
//! model class's backing models (primary provider first, then the fallback
//! provider). The first available model is admitted and its estimated
//! tokens are charged against a sliding window. When nothing in the class
//! is available the request is handed to the [`QueueManager`] and the call
//! fails immediately with [`BifrostError::NoModelsAvailable`], whose message
//! carries the queued request id.
//!
//! Downstream errors are never masked: they are classified, recorded against
//! the model class and returned unchanged. An upstream
//! [`BifrostError::RateLimited`] additionally puts the serving model into a
//! cooldown so the next request fails over.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use futures_util::Stream;
use pin_project_lite::pin_project;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::duration_secs;
use crate::middleware::{Middleware, Next};
use crate::registry::{ModelRegistry, NormalizedModel, QuotaRecord};
use crate::types::{GenerateParams, GenerateResult, ModelHandle, PartStream, StreamPart};
use crate::{BifrostError, Result, telemetry};

/// Middleware id.
pub const RATE_LIMIT_MIDDLEWARE_ID: &str = "rate-limit";

// ============================================================================
// Configuration
// ============================================================================

/// Model classes and failover providers.
///
/// ```toml
/// [rate_limit]
/// primary_provider = "azure"
/// fallback_provider = "openai"
/// window_secs = 60
///
/// [rate_limit.classes]
/// hifi = ["azure:gpt-4.1", "openai:gpt-4.1"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Provider tried first within a class. Default: "azure".
    pub primary_provider: String,
    /// Provider tried when the primary has nothing available. Default: "openai".
    pub fallback_provider: Option<String>,
    /// Model class → `provider:model` keys, in preference order.
    pub classes: HashMap<String, Vec<String>>,
    /// Sliding window for token quotas. Default: 60 seconds.
    #[serde(rename = "window_secs", with = "duration_secs")]
    pub window: Duration,
    /// Request cap per model per window. Default: unlimited.
    pub max_requests_per_window: Option<u64>,
    /// Cooldown after an upstream rate limit without a retry hint.
    /// Default: 30 seconds.
    #[serde(rename = "cooldown_secs", with = "duration_secs")]
    pub cooldown: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let classes = [
            ("hifi", &["azure:gpt-4.1", "openai:gpt-4.1"][..]),
            ("lofi", &["azure:gpt-4.1-mini", "openai:gpt-4.1-mini"][..]),
            ("completions", &["openai:gpt-3.5-turbo-instruct"][..]),
            ("embedding", &["azure:text-embedding-3-large"][..]),
        ]
        .into_iter()
        .map(|(class, keys)| {
            (
                class.to_string(),
                keys.iter().map(|k| k.to_string()).collect(),
            )
        })
        .collect();
        Self {
            primary_provider: "azure".to_string(),
            fallback_provider: Some("openai".to_string()),
            classes,
            window: Duration::from_secs(60),
            max_requests_per_window: None,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn primary_provider(mut self, provider: impl Into<String>) -> Self {
        self.primary_provider = provider.into();
        self
    }

    pub fn fallback_provider(mut self, provider: Option<String>) -> Self {
        self.fallback_provider = provider;
        self
    }

    /// Replace the backing models of `class`.
    pub fn class(mut self, class: impl Into<String>, keys: &[&str]) -> Self {
        self.classes
            .insert(class.into(), keys.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn max_requests_per_window(mut self, n: Option<u64>) -> Self {
        self.max_requests_per_window = n;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

// ============================================================================
// Queue collaborator
// ============================================================================

/// A request parked for out-of-band retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub request_id: String,
    /// The original parameters, serialized.
    pub params: serde_json::Value,
    pub model_class: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Durable retry sink.
#[async_trait]
pub trait QueueManager: Send + Sync {
    async fn enqueue(&self, item: QueueItem) -> Result<()>;
}

/// In-memory [`QueueManager`].
#[derive(Debug, Default)]
pub struct MemoryQueue {
    items: tokio::sync::Mutex<VecDeque<QueueItem>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove and return every queued item, oldest first.
    pub async fn drain(&self) -> Vec<QueueItem> {
        self.items.lock().await.drain(..).collect()
    }
}

#[async_trait]
impl QueueManager for MemoryQueue {
    async fn enqueue(&self, item: QueueItem) -> Result<()> {
        self.items.lock().await.push_back(item);
        Ok(())
    }
}

// ============================================================================
// Quota tracking
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct UsageEvent {
    at: DateTime<Utc>,
    tokens: u64,
}

/// Usage of one model key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageWindow {
    events: VecDeque<UsageEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    day: Option<NaiveDate>,
    #[serde(default)]
    day_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cooldown_until: Option<DateTime<Utc>>,
}

impl UsageWindow {
    fn prune(&mut self, now: DateTime<Utc>, span: TimeDelta) {
        if let Some(cutoff) = now.checked_sub_signed(span) {
            while self.events.front().is_some_and(|e| e.at <= cutoff) {
                self.events.pop_front();
            }
        }
        if self.day != Some(now.date_naive()) {
            self.day = Some(now.date_naive());
            self.day_tokens = 0;
        }
        if self.cooldown_until.is_some_and(|until| until <= now) {
            self.cooldown_until = None;
        }
    }

    /// Requests in the current window.
    pub fn requests(&self) -> u64 {
        self.events.len() as u64
    }

    /// Tokens charged in the current window.
    pub fn tokens(&self) -> u64 {
        self.events.iter().map(|e| e.tokens).sum()
    }

    fn admits(&self, quota: Option<&QuotaRecord>, tokens: u64, max_requests: Option<u64>) -> bool {
        if self.cooldown_until.is_some() {
            return false;
        }
        if max_requests.is_some_and(|max| self.requests() >= max) {
            return false;
        }
        let Some(quota) = quota else {
            return true;
        };
        let over = |limit: Option<u64>, used: u64| limit.is_some_and(|max| used + tokens > max);
        !(over(quota.max_tokens_per_message, 0)
            || over(quota.max_tokens_per_minute, self.tokens())
            || over(quota.max_tokens_per_day, self.day_tokens))
    }
}

/// Sliding-window usage per normalized model key.
#[derive(Debug)]
pub struct QuotaTracker {
    span: TimeDelta,
    max_requests: Option<u64>,
    windows: Mutex<HashMap<String, UsageWindow>>,
}

impl QuotaTracker {
    pub fn new(window: Duration, max_requests: Option<u64>) -> Self {
        Self {
            span: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
            max_requests,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, UsageWindow>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `tokens` more would fit, without charging them.
    pub fn check(
        &self,
        key: &str,
        quota: Option<&QuotaRecord>,
        tokens: u64,
        now: DateTime<Utc>,
    ) -> bool {
        let mut windows = self.lock();
        let window = windows.entry(key.to_string()).or_default();
        window.prune(now, self.span);
        window.admits(quota, tokens, self.max_requests)
    }

    /// Charge `tokens` if they fit. Check and charge are atomic.
    pub fn try_admit(
        &self,
        key: &str,
        quota: Option<&QuotaRecord>,
        tokens: u64,
        now: DateTime<Utc>,
    ) -> bool {
        let mut windows = self.lock();
        let window = windows.entry(key.to_string()).or_default();
        window.prune(now, self.span);
        if !window.admits(quota, tokens, self.max_requests) {
            return false;
        }
        window.events.push_back(UsageEvent { at: now, tokens });
        window.day_tokens += tokens;
        true
    }

    /// Refuse `key` until `until`.
    pub fn cool_down(&self, key: &str, until: DateTime<Utc>) {
        let mut windows = self.lock();
        let window = windows.entry(key.to_string()).or_default();
        if window.cooldown_until.is_none_or(|current| current < until) {
            window.cooldown_until = Some(until);
        }
    }

    pub fn usage(&self, key: &str) -> Option<UsageWindow> {
        self.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, UsageWindow> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn restore(&self, windows: BTreeMap<String, UsageWindow>) {
        *self.lock() = windows.into_iter().collect();
    }
}

// ============================================================================
// Middleware
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct RateLimitState {
    windows: BTreeMap<String, UsageWindow>,
}

/// Admitted model for one request.
#[derive(Debug, Clone)]
struct Selection {
    key: String,
    failover: bool,
}

/// Admission control with class failover and request queueing.
pub struct RateLimitMiddleware {
    registry: Arc<ModelRegistry>,
    queue: Arc<dyn QueueManager>,
    config: RateLimitConfig,
    tracker: Arc<QuotaTracker>,
}

impl RateLimitMiddleware {
    pub fn new(
        registry: Arc<ModelRegistry>,
        queue: Arc<dyn QueueManager>,
        config: RateLimitConfig,
    ) -> Self {
        let tracker = Arc::new(QuotaTracker::new(
            config.window,
            config.max_requests_per_window,
        ));
        Self {
            registry,
            queue,
            config,
            tracker,
        }
    }

    pub fn tracker(&self) -> &Arc<QuotaTracker> {
        &self.tracker
    }

    /// Quota and active flag of a resolved model.
    async fn limits(&self, model: &NormalizedModel) -> Result<Option<Option<QuotaRecord>>> {
        let Some(model_id) = &model.model_id else {
            return Ok(None);
        };
        match self.registry.get_model(model_id).await? {
            Some(record) if record.active => {
                Ok(Some(self.registry.get_quota_by_model_id(model_id).await?))
            }
            _ => Ok(None),
        }
    }

    /// Admit `model` if it is active and within quota.
    async fn try_admit(&self, model: &NormalizedModel, tokens: u64) -> Result<Option<String>> {
        let (Some(key), Some(quota)) = (model.key(), self.limits(model).await?) else {
            return Ok(None);
        };
        let admitted = self
            .tracker
            .try_admit(&key, quota.as_ref(), tokens, Utc::now());
        Ok(admitted.then_some(key))
    }

    /// Class members in failover order: primary provider, then fallback.
    async fn candidates(&self, model_class: &str) -> Result<Vec<NormalizedModel>> {
        let Some(keys) = self.config.classes.get(model_class) else {
            return Ok(Vec::new());
        };
        let mut primary = Vec::new();
        let mut fallback = Vec::new();
        for key in keys {
            let Some((provider, model)) = key.split_once(':') else {
                continue;
            };
            let normalized = self.registry.normalize(provider, model).await?;
            match normalized.provider.as_deref() {
                Some(p) if p == self.config.primary_provider => primary.push(normalized),
                Some(p) if self.config.fallback_provider.as_deref() == Some(p) => {
                    fallback.push(normalized)
                }
                _ => debug!(key, "class member outside primary/fallback providers, skipping"),
            }
        }
        primary.extend(fallback);
        Ok(primary)
    }

    async fn select(
        &self,
        handle: &ModelHandle,
        params: &GenerateParams,
    ) -> Result<Option<Selection>> {
        let tokens = params.estimated_tokens();
        let requested = self
            .registry
            .normalize(&handle.provider, &handle.model_id)
            .await?;
        if let Some(key) = self.try_admit(&requested, tokens).await? {
            return Ok(Some(Selection {
                key,
                failover: false,
            }));
        }

        let requested_key = requested.key();
        for candidate in self.candidates(&handle.model_class).await? {
            if candidate.key().is_some() && candidate.key() == requested_key {
                continue;
            }
            if let Some(key) = self.try_admit(&candidate, tokens).await? {
                info!(
                    requested = %handle.raw_key(),
                    routed = %key,
                    class = %handle.model_class,
                    "failing over"
                );
                metrics::counter!(telemetry::FAILOVERS_TOTAL, "model_class" => handle.model_class.clone())
                    .increment(1);
                return Ok(Some(Selection {
                    key,
                    failover: true,
                }));
            }
        }
        Ok(None)
    }

    /// Park the request and build the admission error.
    async fn enqueue_and_fail(&self, handle: &ModelHandle, params: &GenerateParams) -> BifrostError {
        let request_id = params
            .rate_limit_context
            .as_ref()
            .and_then(|c| c.request_id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let serialized = match serde_json::to_value(params) {
            Ok(v) => v,
            Err(e) => return e.into(),
        };
        let item = QueueItem {
            request_id: request_id.clone(),
            params: serialized,
            model_class: handle.model_class.clone(),
            enqueued_at: Utc::now(),
        };
        if let Err(e) = self.queue.enqueue(item).await {
            warn!(request_id, error = %e, "failed to enqueue request");
            return BifrostError::Queue(format!("failed to enqueue {request_id}: {e}"));
        }
        metrics::counter!(telemetry::ENQUEUED_TOTAL, "model_class" => handle.model_class.clone())
            .increment(1);
        warn!(request_id, class = %handle.model_class, "no models available, request enqueued");
        BifrostError::NoModelsAvailable {
            model_class: handle.model_class.clone(),
            request_id,
        }
    }

    /// Authoritative admission shared by both wrappers.
    async fn admit(
        &self,
        handle: &ModelHandle,
        mut params: GenerateParams,
    ) -> Result<(GenerateParams, Selection)> {
        let selection = match self.select(handle, &params).await {
            Ok(Some(selection)) => selection,
            Ok(None) => {
                let err = self.enqueue_and_fail(handle, &params).await;
                record_error(&err, &handle.model_class);
                return Err(err);
            }
            Err(e) => {
                record_error(&e, &handle.model_class);
                return Err(e);
            }
        };
        if selection.failover {
            params.routed_model = Some(selection.key.clone());
        }
        Ok((params, selection))
    }

    fn observe_error(&self, err: &BifrostError, key: &str, model_class: &str) {
        observe_error(&self.tracker, self.config.cooldown, err, key, model_class);
    }
}

fn record_error(err: &BifrostError, model_class: &str) {
    metrics::counter!(
        telemetry::ERRORS_TOTAL,
        "kind" => err.kind(),
        "model_class" => model_class.to_string(),
    )
    .increment(1);
}

fn record_duration(started: Instant, model_class: &str, operation: &'static str) {
    metrics::histogram!(
        telemetry::PROCESSING_DURATION_SECONDS,
        "model_class" => model_class.to_string(),
        "operation" => operation,
    )
    .record(started.elapsed().as_secs_f64());
}

fn observe_error(
    tracker: &QuotaTracker,
    default_cooldown: Duration,
    err: &BifrostError,
    key: &str,
    model_class: &str,
) {
    if let BifrostError::RateLimited { retry_after } = err {
        let cooldown = retry_after.unwrap_or(default_cooldown);
        let until = Utc::now() + TimeDelta::from_std(cooldown).unwrap_or(TimeDelta::zero());
        warn!(key, cooldown_secs = cooldown.as_secs(), "upstream rate limited, cooling down");
        tracker.cool_down(key, until);
    }
    record_error(err, model_class);
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn id(&self) -> &str {
        RATE_LIMIT_MIDDLEWARE_ID
    }

    /// Non-blocking probe; logs, never fails.
    async fn transform_params(
        &self,
        handle: &ModelHandle,
        params: GenerateParams,
    ) -> Result<GenerateParams> {
        let requested = match self
            .registry
            .normalize(&handle.provider, &handle.model_id)
            .await
        {
            Ok(requested) => requested,
            Err(e) => {
                warn!(error = %e, "availability probe failed");
                return Ok(params);
            }
        };
        if let Err(e) = requested.rethrow() {
            warn!(error = %e, class = %handle.model_class, "requested model not registered");
            return Ok(params);
        }
        let available = match (requested.key(), self.limits(&requested).await) {
            (Some(key), Ok(Some(quota))) => {
                self.tracker
                    .check(&key, quota.as_ref(), params.estimated_tokens(), Utc::now())
            }
            (_, Err(e)) => {
                warn!(error = %e, "availability probe failed");
                return Ok(params);
            }
            _ => false,
        };
        if !available {
            warn!(
                model = %handle.raw_key(),
                class = %handle.model_class,
                "requested model unavailable, will try class fallbacks"
            );
        }
        Ok(params)
    }

    async fn wrap_generate(
        &self,
        handle: &ModelHandle,
        params: GenerateParams,
        next: Next<'_>,
    ) -> Result<GenerateResult> {
        let (params, selection) = self.admit(handle, params).await?;
        let started = Instant::now();
        let result = next.generate(params).await;
        record_duration(started, &handle.model_class, "generate");
        result.inspect_err(|e| self.observe_error(e, &selection.key, &handle.model_class))
    }

    async fn wrap_stream(
        &self,
        handle: &ModelHandle,
        params: GenerateParams,
        next: Next<'_>,
    ) -> Result<PartStream> {
        let (params, selection) = self.admit(handle, params).await?;
        let started = Instant::now();
        let inner = match next.stream(params).await {
            Ok(inner) => inner,
            Err(e) => {
                record_duration(started, &handle.model_class, "stream");
                self.observe_error(&e, &selection.key, &handle.model_class);
                return Err(e);
            }
        };
        Ok(Box::pin(MeteredStream {
            inner,
            started,
            key: selection.key,
            model_class: handle.model_class.clone(),
            tracker: self.tracker.clone(),
            cooldown: self.config.cooldown,
            done: false,
        }))
    }

    fn is_state_aware(&self) -> bool {
        true
    }

    fn collect_state(&self) -> Result<Option<serde_json::Value>> {
        let state = RateLimitState {
            windows: self.tracker.snapshot(),
        };
        Ok(Some(serde_json::to_value(state)?))
    }

    fn restore_state(&self, state: &serde_json::Value) -> Result<()> {
        let state: RateLimitState = serde_json::from_value(state.clone())?;
        self.tracker.restore(state.windows);
        Ok(())
    }
}

pin_project! {
    /// Records duration when the stream ends and classifies stream errors.
    struct MeteredStream<S> {
        #[pin]
        inner: S,
        started: Instant,
        key: String,
        model_class: String,
        tracker: Arc<QuotaTracker>,
        cooldown: Duration,
        done: bool,
    }
}

impl<S> Stream for MeteredStream<S>
where
    S: Stream<Item = Result<StreamPart>>,
{
    type Item = Result<StreamPart>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let polled = this.inner.poll_next(cx);
        match &polled {
            Poll::Ready(Some(Err(e))) => {
                observe_error(this.tracker, *this.cooldown, e, this.key, this.model_class);
            }
            Poll::Ready(None) if !*this.done => {
                *this.done = true;
                record_duration(*this.started, this.model_class, "stream");
            }
            _ => {}
        }
        polled
    }
}
