//! Chat persistence pipeline.
//!
//! [`PersistenceMiddleware`] records every request that carries a
//! [`ChatContext`] as a chat turn with one assistant message. Before the
//! upstream call it reserves a turn id and a pending message row; while a
//! stream is running it feeds parts through the assembler and writes partial
//! text every `batch_size` parts or `flush_interval`; at the end
//! [`FlushHandlers::flush`] finalizes the rows.
//!
//! Store failures never reach the caller. Each flush step is retried on its
//! own, failures are logged and counted, and the whole flush runs under a
//! timeout. The flush is spawned and awaited, so it completes even when the
//! caller goes away.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::assembler::{ProcessingQueue, QueueSender, StreamHandlerContext};
use crate::middleware::{Middleware, Next};
use crate::types::{GenerateParams, GenerateResult, ModelHandle, PartStream, StreamPart};
use crate::{BifrostError, Result, telemetry};

pub const PERSISTENCE_MIDDLEWARE_ID: &str = "persistence";

const RETRY_BASE_DELAY: Duration = Duration::from_millis(25);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(1);
const CANCELLED_REASON: &str = "stream cancelled before completion";

/// Where a request's turn is recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatContext {
    pub chat_id: String,
    /// Position of the assistant message within the chat.
    #[serde(default)]
    pub message_order: u32,
    /// Turn reserved by the caller. Reserved on first use when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(default)]
    pub flush: FlushOverrides,
}

impl ChatContext {
    pub fn new(chat_id: impl Into<String>, message_order: u32) -> Self {
        Self {
            chat_id: chat_id.into(),
            message_order,
            ..Self::default()
        }
    }

    pub fn turn_id(mut self, turn_id: impl Into<String>) -> Self {
        self.turn_id = Some(turn_id.into());
        self
    }

    pub fn overrides(mut self, overrides: FlushOverrides) -> Self {
        self.flush = overrides;
        self
    }
}

// ============================================================================
// Chat store collaborator
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Complete,
    Error,
}

/// New content for a message row.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageUpdate {
    pub content: String,
    /// Serialized structured content entries.
    pub content_json: String,
    pub status: MessageStatus,
}

/// New state for a turn row.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnUpdate {
    pub status: TurnStatus,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// Relational persistence for chat turns and messages.
///
/// The pipeline only issues commands; schema and storage are the
/// implementor's concern.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Reserve a new turn in `chat_id` and return its id.
    async fn reserve_turn_id(&self, chat_id: &str) -> Result<String>;

    /// Insert an empty assistant message and return its id.
    async fn insert_pending_message(
        &self,
        chat_id: &str,
        turn_id: &str,
        message_order: u32,
    ) -> Result<String>;

    async fn update_message(&self, message_id: &str, update: MessageUpdate) -> Result<()>;

    async fn update_turn(&self, turn_id: &str, update: TurnUpdate) -> Result<()>;

    async fn set_chat_title(&self, chat_id: &str, title: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnRecord {
    pub chat_id: String,
    pub status: TurnStatus,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub chat_id: String,
    pub turn_id: String,
    pub message_order: u32,
    pub status: MessageStatus,
    pub content: String,
    pub content_json: Option<String>,
    /// Number of updates applied.
    pub writes: u32,
}

#[derive(Default)]
struct MemoryChatState {
    turns: std::collections::HashMap<String, TurnRecord>,
    messages: std::collections::HashMap<String, MessageRecord>,
    titles: std::collections::HashMap<String, String>,
}

/// In-process [`ChatStore`].
#[derive(Default)]
pub struct MemoryChatStore {
    state: Mutex<MemoryChatState>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn turn(&self, turn_id: &str) -> Option<TurnRecord> {
        self.state.lock().await.turns.get(turn_id).cloned()
    }

    pub async fn message(&self, message_id: &str) -> Option<MessageRecord> {
        self.state.lock().await.messages.get(message_id).cloned()
    }

    /// Messages of `turn_id`, ordered by message order.
    pub async fn messages_for_turn(&self, turn_id: &str) -> Vec<MessageRecord> {
        let state = self.state.lock().await;
        let mut messages: Vec<_> = state
            .messages
            .values()
            .filter(|m| m.turn_id == turn_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.message_order);
        messages
    }

    /// Turns of `chat_id` as `(turn_id, record)` pairs.
    pub async fn turns_for_chat(&self, chat_id: &str) -> Vec<(String, TurnRecord)> {
        let state = self.state.lock().await;
        let mut turns: Vec<_> = state
            .turns
            .iter()
            .filter(|(_, t)| t.chat_id == chat_id)
            .map(|(id, t)| (id.clone(), t.clone()))
            .collect();
        turns.sort_by(|a, b| a.0.cmp(&b.0));
        turns
    }

    pub async fn title(&self, chat_id: &str) -> Option<String> {
        self.state.lock().await.titles.get(chat_id).cloned()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn reserve_turn_id(&self, chat_id: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.state.lock().await.turns.insert(
            id.clone(),
            TurnRecord {
                chat_id: chat_id.to_string(),
                status: TurnStatus::Pending,
                latency_ms: None,
                error: None,
            },
        );
        Ok(id)
    }

    async fn insert_pending_message(
        &self,
        chat_id: &str,
        turn_id: &str,
        message_order: u32,
    ) -> Result<String> {
        let mut state = self.state.lock().await;
        if !state.turns.contains_key(turn_id) {
            // Turns reserved by the caller are created on first sight.
            state.turns.insert(
                turn_id.to_string(),
                TurnRecord {
                    chat_id: chat_id.to_string(),
                    status: TurnStatus::Pending,
                    latency_ms: None,
                    error: None,
                },
            );
        }
        let id = uuid::Uuid::new_v4().to_string();
        state.messages.insert(
            id.clone(),
            MessageRecord {
                chat_id: chat_id.to_string(),
                turn_id: turn_id.to_string(),
                message_order,
                status: MessageStatus::Pending,
                content: String::new(),
                content_json: None,
                writes: 0,
            },
        );
        Ok(id)
    }

    async fn update_message(&self, message_id: &str, update: MessageUpdate) -> Result<()> {
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| BifrostError::Store(format!("unknown message {message_id}")))?;
        message.content = update.content;
        message.content_json = Some(update.content_json);
        message.status = update.status;
        message.writes += 1;
        Ok(())
    }

    async fn update_turn(&self, turn_id: &str, update: TurnUpdate) -> Result<()> {
        let mut state = self.state.lock().await;
        let turn = state
            .turns
            .get_mut(turn_id)
            .ok_or_else(|| BifrostError::Store(format!("unknown turn {turn_id}")))?;
        turn.status = update.status;
        turn.latency_ms = update.latency_ms;
        turn.error = update.error;
        Ok(())
    }

    async fn set_chat_title(&self, chat_id: &str, title: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .titles
            .insert(chat_id.to_string(), title.to_string());
        Ok(())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Flush defaults, loaded from the `[persistence]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Stream parts between progress writes.
    pub batch_size: usize,
    /// Longest gap between progress writes.
    #[serde(rename = "flush_interval_ms", with = "crate::config::duration_ms")]
    pub flush_interval: Duration,
    /// Attempts per flush step, including the first.
    pub retry_attempts: u32,
    /// Budget for one whole flush.
    #[serde(rename = "timeout_ms", with = "crate::config::duration_ms")]
    pub timeout: Duration,
    pub max_title_length: usize,
    pub max_title_words: usize,
    pub enable_metrics: bool,
    /// Store structured content as compact rather than pretty JSON.
    pub enable_compression: bool,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval: Duration::from_millis(500),
            retry_attempts: 3,
            timeout: Duration::from_secs(5),
            max_title_length: 100,
            max_title_words: 8,
            enable_metrics: true,
            enable_compression: true,
        }
    }
}

impl FlushConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn retry_attempts(mut self, n: u32) -> Self {
        self.retry_attempts = n;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn title_limits(mut self, max_words: usize, max_length: usize) -> Self {
        self.max_title_words = max_words;
        self.max_title_length = max_length;
        self
    }

    pub fn enable_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }

    pub fn enable_compression(mut self, enabled: bool) -> Self {
        self.enable_compression = enabled;
        self
    }

    /// These defaults with every field set in `overrides` replaced.
    pub fn merged(&self, overrides: &FlushOverrides) -> FlushConfig {
        FlushConfig {
            batch_size: overrides.batch_size.unwrap_or(self.batch_size),
            flush_interval: overrides
                .flush_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(self.flush_interval),
            retry_attempts: overrides.retry_attempts.unwrap_or(self.retry_attempts),
            timeout: overrides
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.timeout),
            max_title_length: overrides.max_title_length.unwrap_or(self.max_title_length),
            max_title_words: overrides.max_title_words.unwrap_or(self.max_title_words),
            enable_metrics: overrides.enable_metrics.unwrap_or(self.enable_metrics),
            enable_compression: overrides
                .enable_compression
                .unwrap_or(self.enable_compression),
        }
    }
}

/// Per-call replacements for [`FlushConfig`] fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlushOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flush_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_title_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_title_words: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_metrics: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_compression: Option<bool>,
}

// ============================================================================
// Flush handlers
// ============================================================================

/// Title from the first `max_words` words of `text`, cut to `max_length`
/// characters. `None` for blank text.
pub fn generate_title(text: &str, max_words: usize, max_length: usize) -> Option<String> {
    let words: Vec<&str> = text.split_whitespace().take(max_words).collect();
    if words.is_empty() {
        return None;
    }
    let title = words.join(" ");
    let title: String = title.chars().take(max_length).collect();
    let title = title.trim_end().to_string();
    (!title.is_empty()).then_some(title)
}

/// What a flush managed to do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    /// Steps that still failed after retries.
    pub failed_steps: Vec<&'static str>,
    pub timed_out: bool,
    pub title: Option<String>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty() && !self.timed_out
    }
}

async fn with_retry<F, Fut, T>(attempts: u32, step: &'static str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt + 1 < attempts {
                    let delay = RETRY_BASE_DELAY
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(RETRY_MAX_DELAY);
                    warn!(
                        step,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying persistence step"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| BifrostError::Store(format!("{step}: no attempts made"))))
}

/// Writes assembled output to a [`ChatStore`].
#[derive(Clone)]
pub struct FlushHandlers {
    store: Arc<dyn ChatStore>,
    config: FlushConfig,
}

impl FlushHandlers {
    pub fn new(store: Arc<dyn ChatStore>, config: FlushConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &FlushConfig {
        &self.config
    }

    fn encode(&self, ctx: &StreamHandlerContext) -> String {
        let encoded = if self.config.enable_compression {
            serde_json::to_string(&ctx.generated_json)
        } else {
            serde_json::to_string_pretty(&ctx.generated_json)
        };
        encoded.unwrap_or_else(|e| {
            warn!(error = %e, "failed to encode message content");
            "[]".to_string()
        })
    }

    fn step_failed(&self, report: &mut FlushReport, step: &'static str, e: &BifrostError) {
        error!(step, error = %e, "persistence step failed");
        if self.config.enable_metrics {
            metrics::counter!(telemetry::FLUSH_FAILURES_TOTAL, "step" => step).increment(1);
        }
        report.failed_steps.push(step);
    }

    /// Reserve the turn and pending message for a new request.
    ///
    /// Failures leave the ids unset, which turns later writes into no-ops.
    pub async fn begin(&self, chat: &ChatContext) -> StreamHandlerContext {
        let attempts = self.config.retry_attempts;
        let turn_id = match &chat.turn_id {
            Some(id) => Some(id.clone()),
            None => match with_retry(attempts, "reserve_turn", || {
                self.store.reserve_turn_id(&chat.chat_id)
            })
            .await
            {
                Ok(id) => Some(id),
                Err(e) => {
                    self.step_failed(&mut FlushReport::default(), "reserve_turn", &e);
                    None
                }
            },
        };

        let mut ctx = StreamHandlerContext::new(
            Some(chat.chat_id.clone()),
            turn_id.clone(),
            chat.message_order,
        );
        if let Some(turn_id) = &turn_id {
            match with_retry(attempts, "insert_message", || {
                self.store
                    .insert_pending_message(&chat.chat_id, turn_id, chat.message_order)
            })
            .await
            {
                Ok(id) => ctx.message_id = Some(id),
                Err(e) => self.step_failed(&mut FlushReport::default(), "insert_message", &e),
            }
        }
        ctx
    }

    /// Write partial output against the pending message. Single attempt.
    pub async fn write_progress(&self, ctx: &StreamHandlerContext) {
        let Some(message_id) = &ctx.message_id else {
            return;
        };
        let update = MessageUpdate {
            content: ctx.generated_text.clone(),
            content_json: self.encode(ctx),
            status: MessageStatus::Streaming,
        };
        if let Err(e) = self.store.update_message(message_id, update).await {
            warn!(message_id, error = %e, "progress write failed");
        }
    }

    /// Finalize a request. Never fails; problems are reported in the
    /// returned [`FlushReport`].
    #[instrument(name = "persistence.flush", skip_all, fields(turn_id = ctx.turn_id.as_deref(), failed = error.is_some()))]
    pub async fn flush(
        &self,
        ctx: &StreamHandlerContext,
        started: Instant,
        error: Option<&str>,
    ) -> FlushReport {
        let mut report = FlushReport::default();
        let steps = self.run_steps(ctx, started, error, &mut report);
        if tokio::time::timeout(self.config.timeout, steps).await.is_err() {
            warn!(
                timeout_ms = self.config.timeout.as_millis() as u64,
                "persistence flush timed out"
            );
            if self.config.enable_metrics {
                metrics::counter!(telemetry::FLUSH_FAILURES_TOTAL, "step" => "timeout")
                    .increment(1);
            }
            report.timed_out = true;
        }
        report
    }

    async fn run_steps(
        &self,
        ctx: &StreamHandlerContext,
        started: Instant,
        error: Option<&str>,
        report: &mut FlushReport,
    ) {
        let attempts = self.config.retry_attempts;
        let latency_ms = Some(started.elapsed().as_millis() as u64);

        if let Some(reason) = error {
            let Some(turn_id) = &ctx.turn_id else {
                return;
            };
            let update = TurnUpdate {
                status: TurnStatus::Error,
                latency_ms,
                error: Some(reason.to_string()),
            };
            if let Err(e) = with_retry(attempts, "mark_error", || {
                self.store.update_turn(turn_id, update.clone())
            })
            .await
            {
                self.step_failed(report, "mark_error", &e);
            }
            return;
        }

        if let Some(message_id) = &ctx.message_id {
            let update = MessageUpdate {
                content: ctx.generated_text.clone(),
                content_json: self.encode(ctx),
                status: MessageStatus::Complete,
            };
            if let Err(e) = with_retry(attempts, "finalize_message", || {
                self.store.update_message(message_id, update.clone())
            })
            .await
            {
                self.step_failed(report, "finalize_message", &e);
            }
        }

        if let Some(turn_id) = &ctx.turn_id {
            let update = TurnUpdate {
                status: TurnStatus::Complete,
                latency_ms,
                error: None,
            };
            if let Err(e) = with_retry(attempts, "complete_turn", || {
                self.store.update_turn(turn_id, update.clone())
            })
            .await
            {
                self.step_failed(report, "complete_turn", &e);
            }
        }

        let Some(chat_id) = &ctx.chat_id else {
            return;
        };
        let Some(title) = generate_title(
            &ctx.generated_text,
            self.config.max_title_words,
            self.config.max_title_length,
        ) else {
            debug!(chat_id, "no text generated, skipping title");
            return;
        };
        match with_retry(attempts, "title", || {
            self.store.set_chat_title(chat_id, &title)
        })
        .await
        {
            Ok(()) => report.title = Some(title),
            Err(e) => self.step_failed(report, "title", &e),
        }
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// Records requests carrying a [`ChatContext`]; forwards all others.
pub struct PersistenceMiddleware {
    store: Arc<dyn ChatStore>,
    config: FlushConfig,
}

impl PersistenceMiddleware {
    pub fn new(store: Arc<dyn ChatStore>, config: FlushConfig) -> Self {
        Self { store, config }
    }

    fn handlers(&self, chat: &ChatContext) -> FlushHandlers {
        FlushHandlers::new(self.store.clone(), self.config.merged(&chat.flush))
    }
}

/// Run a flush on its own task and wait for it.
async fn spawn_flush(
    handlers: FlushHandlers,
    ctx: StreamHandlerContext,
    started: Instant,
    error: Option<String>,
) -> FlushReport {
    let task =
        tokio::spawn(async move { handlers.flush(&ctx, started, error.as_deref()).await });
    task.await.unwrap_or_else(|e| {
        error!(error = %e, "persistence flush task failed");
        FlushReport {
            failed_steps: vec!["task"],
            ..FlushReport::default()
        }
    })
}

#[async_trait]
impl Middleware for PersistenceMiddleware {
    fn id(&self) -> &str {
        PERSISTENCE_MIDDLEWARE_ID
    }

    async fn wrap_generate(
        &self,
        _handle: &ModelHandle,
        params: GenerateParams,
        next: Next<'_>,
    ) -> Result<GenerateResult> {
        let Some(chat) = params.chat.clone() else {
            return next.generate(params).await;
        };
        let handlers = self.handlers(&chat);
        let started = Instant::now();
        let mut ctx = handlers.begin(&chat).await;

        let result = next.generate(params).await;
        let error = match &result {
            Ok(response) => {
                ctx.generated_text = response.text.clone();
                ctx.generated_json = response.content.clone();
                None
            }
            Err(e) => Some(e.to_string()),
        };
        spawn_flush(handlers, ctx, started, error).await;
        result
    }

    async fn wrap_stream(
        &self,
        _handle: &ModelHandle,
        params: GenerateParams,
        next: Next<'_>,
    ) -> Result<PartStream> {
        let Some(chat) = params.chat.clone() else {
            return next.stream(params).await;
        };
        let handlers = self.handlers(&chat);
        let started = Instant::now();
        let ctx = handlers.begin(&chat).await;

        match next.stream(params).await {
            Ok(inner) => Ok(Box::pin(PersistingStream::new(
                inner, ctx, handlers, started,
            ))),
            Err(e) => {
                spawn_flush(handlers, ctx, started, Some(e.to_string())).await;
                Err(e)
            }
        }
    }
}

struct Finalizer {
    queue: ProcessingQueue,
    handlers: FlushHandlers,
    started: Instant,
    progress: Option<JoinHandle<()>>,
}

impl Finalizer {
    /// Drain the assembler, wait for progress writes, then flush.
    fn spawn(self, error: Option<String>) -> JoinHandle<FlushReport> {
        let Finalizer {
            queue,
            handlers,
            started,
            progress,
        } = self;
        tokio::spawn(async move {
            if let Some(progress) = progress {
                let _ = progress.await;
            }
            let mut ctx = match queue.finish().await {
                Ok(ctx) => ctx,
                Err(e) => {
                    error!(error = %e, "assembler did not finish");
                    StreamHandlerContext::default()
                }
            };
            ctx.close_open_items();
            handlers.flush(&ctx, started, error.as_deref()).await
        })
    }
}

/// Tees a part stream into the assembler and finalizes on end or drop.
///
/// End of stream is reported only after the flush has completed.
struct PersistingStream {
    inner: PartStream,
    sender: Option<QueueSender>,
    finalizer: Option<Finalizer>,
    finishing: Option<JoinHandle<FlushReport>>,
    since_progress: usize,
    last_progress: Instant,
    error: Option<String>,
}

impl PersistingStream {
    fn new(
        inner: PartStream,
        ctx: StreamHandlerContext,
        handlers: FlushHandlers,
        started: Instant,
    ) -> Self {
        let queue = ProcessingQueue::new(ctx);
        Self {
            inner,
            sender: Some(queue.sender()),
            finalizer: Some(Finalizer {
                queue,
                handlers,
                started,
                progress: None,
            }),
            finishing: None,
            since_progress: 0,
            last_progress: Instant::now(),
            error: None,
        }
    }

    fn observe(&mut self, part: &StreamPart) {
        if let StreamPart::Error { message } = part {
            self.error.get_or_insert_with(|| message.clone());
        }
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(e) = sender.submit(part.clone()) {
            warn!(error = %e, "dropping part for persistence");
            return;
        }
        self.since_progress += 1;

        let Some(finalizer) = self.finalizer.as_mut() else {
            return;
        };
        let config = finalizer.handlers.config();
        if self.since_progress < config.batch_size
            && self.last_progress.elapsed() < config.flush_interval
        {
            return;
        }
        self.since_progress = 0;
        self.last_progress = Instant::now();

        let sender = sender.clone();
        let handlers = finalizer.handlers.clone();
        let previous = finalizer.progress.take();
        finalizer.progress = Some(tokio::spawn(async move {
            // Progress writes land in order.
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            match sender.snapshot().await {
                Ok(ctx) => handlers.write_progress(&ctx).await,
                Err(e) => debug!(error = %e, "skipping progress write"),
            }
        }));
    }

    fn start_finishing(&mut self) {
        // Dropping our sender lets the assembler drain.
        self.sender = None;
        if let Some(finalizer) = self.finalizer.take() {
            self.finishing = Some(finalizer.spawn(self.error.take()));
        }
    }
}

impl Stream for PersistingStream {
    type Item = Result<StreamPart>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(finishing) = this.finishing.as_mut() {
            return match Pin::new(finishing).poll(cx) {
                Poll::Ready(report) => {
                    this.finishing = None;
                    if let Err(e) = report {
                        error!(error = %e, "persistence flush task failed");
                    }
                    Poll::Ready(None)
                }
                Poll::Pending => Poll::Pending,
            };
        }
        if this.finalizer.is_none() {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(part))) => {
                this.observe(&part);
                Poll::Ready(Some(Ok(part)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.error.get_or_insert_with(|| e.to_string());
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.start_finishing();
                // Poll the flush task once so its waker is registered.
                Pin::new(this).poll_next(cx)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PersistingStream {
    fn drop(&mut self) {
        if self.finalizer.is_none() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            error!("stream dropped outside a runtime, turn left unfinalized");
            return;
        }
        warn!("stream dropped before completion, finalizing turn as cancelled");
        self.sender = None;
        if let Some(finalizer) = self.finalizer.take() {
            let reason = self
                .error
                .take()
                .unwrap_or_else(|| CANCELLED_REASON.to_string());
            drop(finalizer.spawn(Some(reason)));
        }
    }
}
