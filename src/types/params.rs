//! Request-side types: model handle, generation parameters, cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::prompt::{Message, ToolDefinition};
use crate::persistence::ChatContext;

/// The model a request is addressed to.
///
/// Immutable once constructed; every middleware in a chain sees the same
/// handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelHandle {
    /// Provider name or alias (e.g. `"azure-openai.chat"`).
    pub provider: String,
    /// Model name, deployment id or compound key.
    pub model_id: String,
    /// Routing tier (e.g. `"hifi"`, `"lofi"`, `"completions"`, `"embedding"`).
    pub model_class: String,
}

impl ModelHandle {
    pub fn new(
        provider: impl Into<String>,
        model_id: impl Into<String>,
        model_class: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            model_class: model_class.into(),
        }
    }

    /// Raw `provider:model` key (not normalized).
    pub fn raw_key(&self) -> String {
        format!("{}:{}", self.provider, self.model_id)
    }
}

/// Caller-supplied hints for the rate limiter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitContext {
    /// Caller-side request id, used instead of a generated one when queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// User on whose behalf the request runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Estimated token cost, charged against per-minute quotas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_tokens: Option<u64>,
}

/// Normalized generation parameters flowing through a chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateParams {
    /// Prompt messages.
    pub prompt: Vec<Message>,

    /// Sampling temperature (0.0 to 2.0).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum number of tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Nucleus sampling threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Sequences where generation should stop.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,

    /// Seed for deterministic generation (where supported).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Tools the model may call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Normalized `provider:model` key chosen by failover, when it differs
    /// from the handle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routed_model: Option<String>,

    /// Rate limiter hints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_context: Option<RateLimitContext>,

    /// Chat persistence target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatContext>,

    /// Cancellation signal honoured by upstream calls.
    #[serde(skip)]
    pub abort: Option<AbortSignal>,
}

impl GenerateParams {
    /// Parameters for a single user message.
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self::from_messages(vec![Message::user(prompt)])
    }

    pub fn from_messages(prompt: Vec<Message>) -> Self {
        Self {
            prompt,
            ..Self::default()
        }
    }

    /// Set temperature.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set max tokens.
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Add a tool.
    pub fn tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    /// Attach a chat persistence target.
    pub fn chat(mut self, chat: ChatContext) -> Self {
        self.chat = Some(chat);
        self
    }

    /// Attach rate limiter hints.
    pub fn rate_limit_context(mut self, context: RateLimitContext) -> Self {
        self.rate_limit_context = Some(context);
        self
    }

    /// Attach a cancellation signal.
    pub fn abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }

    /// Text of the prompt when it is exactly one message.
    pub fn single_prompt_text(&self) -> Option<&str> {
        match self.prompt.as_slice() {
            [only] => Some(only.content.as_str()),
            _ => None,
        }
    }

    /// Rough token estimate: caller hint, else ~4 characters per token.
    pub fn estimated_tokens(&self) -> u64 {
        if let Some(tokens) = self
            .rate_limit_context
            .as_ref()
            .and_then(|c| c.estimated_tokens)
        {
            return tokens;
        }
        let chars: usize = self.prompt.iter().map(|m| m.content.len()).sum();
        (chars as u64).div_ceil(4) + u64::from(self.max_tokens.unwrap_or(0))
    }
}

/// Cancellation signal shared between a caller and upstream calls.
///
/// Cloning yields a handle to the same signal.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

#[derive(Debug, Default)]
struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every holder.
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once [`abort()`](Self::abort) has been called.
    pub async fn aborted(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}
