//! OpenAI-compatible chat completions upstream.
//!
//! [`OpenAiCompatibleModel`] is the terminal [`LanguageModel`] of a chain.
//! Every request goes through [`CachedFetch`], so it holds an upstream slot
//! of the shared semaphore for exactly as long as the response is being
//! read. Streaming responses are decoded from SSE into [`StreamPart`]s on a
//! producer task behind a bounded channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use super::backpressure::{DEFAULT_STREAM_BUFFER, bounded_stream};
use super::sse::{SseDecoder, SseEvent};
use crate::cache::{ByteStream, CachedFetch, FetchRequest, FetchResponse};
use crate::config::ProviderConfig;
use crate::traits::LanguageModel;
use crate::types::{
    ContentPart, FinishReason, GenerateParams, GenerateResult, Message, ModelHandle, PartStream,
    StreamPart, Usage,
};
use crate::{BifrostError, Result};

/// Chat completions over an OpenAI-compatible HTTP API.
pub struct OpenAiCompatibleModel {
    name: String,
    base_url: String,
    api_key: Option<String>,
    /// Header for the raw key; `None` sends `Authorization: Bearer`.
    api_key_header: Option<String>,
    fetch: Arc<CachedFetch>,
    stream_buffer: usize,
}

impl OpenAiCompatibleModel {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, fetch: Arc<CachedFetch>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            api_key_header: None,
            fetch,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    /// Provider `name` from its `[providers.<name>]` section, reading the
    /// base URL and API key from the environment where configured.
    pub fn from_config(
        name: &str,
        config: &ProviderConfig,
        fetch: Arc<CachedFetch>,
    ) -> Result<Self> {
        let base_url = config.base_url().ok_or_else(|| {
            BifrostError::Configuration(format!("providers.{name}: no base URL configured"))
        })?;
        let mut model = Self::new(name, base_url, fetch);
        if let Some(key) = config.api_key() {
            model = model.api_key(key);
        }
        if let Some(header) = &config.api_key_header {
            model = model.api_key_header(header);
        }
        Ok(model)
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Send the API key raw in `header` instead of as a bearer token.
    pub fn api_key_header(mut self, header: impl Into<String>) -> Self {
        self.api_key_header = Some(header.into());
        self
    }

    /// Parts buffered between the decoder and the caller.
    pub fn stream_buffer(mut self, size: usize) -> Self {
        self.stream_buffer = size;
        self
    }

    fn request(&self, body: &Value) -> Result<FetchRequest> {
        let request = FetchRequest::post_json(format!("{}/chat/completions", self.base_url), body)?;
        Ok(match (&self.api_key, &self.api_key_header) {
            (Some(key), Some(header)) => request.header(header.as_str(), key.as_str()),
            (Some(key), None) => request.header("authorization", format!("Bearer {key}")),
            (None, _) => request,
        })
    }
}

/// Upstream model name: the routed model when failover picked one.
fn upstream_model(handle: &ModelHandle, params: &GenerateParams) -> String {
    match &params.routed_model {
        Some(key) => key
            .split_once(':')
            .map(|(_, model)| model)
            .unwrap_or(key.as_str())
            .to_string(),
        None => handle.model_id.clone(),
    }
}

fn wire_message(message: &Message) -> Value {
    let mut wire = json!({
        "role": message.role.as_str(),
        "content": message.content,
    });
    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    if let Some(name) = &message.name {
        wire["name"] = json!(name);
    }
    wire
}

fn request_body(model: &str, params: &GenerateParams, stream: bool) -> Value {
    let mut body = json!({
        "model": model,
        "messages": params.prompt.iter().map(wire_message).collect::<Vec<_>>(),
    });
    if let Some(t) = params.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(max) = params.max_tokens {
        body["max_tokens"] = json!(max);
    }
    if let Some(p) = params.top_p {
        body["top_p"] = json!(p);
    }
    if !params.stop_sequences.is_empty() {
        body["stop"] = json!(params.stop_sequences);
    }
    if let Some(seed) = params.seed {
        body["seed"] = json!(seed);
    }
    if !params.tools.is_empty() {
        body["tools"] = Value::Array(params.tools.iter().map(|t| t.to_openai()).collect());
    }
    if stream {
        body["stream"] = json!(true);
        body["stream_options"] = json!({ "include_usage": true });
    }
    body
}

/// Turn a non-2xx response into an error.
async fn check_status(response: FetchResponse) -> Result<FetchResponse> {
    if response.is_success() {
        return Ok(response);
    }
    let status = response.status_code();
    if status == 429 {
        let retry_after = response
            .header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(BifrostError::RateLimited { retry_after });
    }
    let body = response.into_bytes().await.unwrap_or_default();
    let message = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
    Err(BifrostError::Api { status, message })
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
    #[serde(default)]
    completion_tokens_details: Option<WireUsageDetails>,
}

#[derive(Debug, Deserialize)]
struct WireUsageDetails {
    #[serde(default)]
    reasoning_tokens: Option<u32>,
}

impl From<WireUsage> for Usage {
    fn from(usage: WireUsage) -> Self {
        Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            reasoning_tokens: usage
                .completion_tokens_details
                .and_then(|d| d.reasoning_tokens),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunction>,
}

#[derive(Debug, Default, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default, alias = "delta")]
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireCompletion {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

fn parse_completion(body: &[u8]) -> Result<GenerateResult> {
    let completion: WireCompletion = serde_json::from_slice(body)?;
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| BifrostError::Api {
            status: 200,
            message: "completion has no choices".to_string(),
        })?;

    let mut content = Vec::new();
    if let Some(reasoning) = choice.message.reasoning_content.filter(|r| !r.is_empty()) {
        content.push(ContentPart::Reasoning { text: reasoning });
    }
    let text = choice.message.content.unwrap_or_default();
    if !text.is_empty() {
        content.push(ContentPart::Text { text: text.clone() });
    }
    for (index, call) in choice.message.tool_calls.unwrap_or_default().into_iter().enumerate() {
        let function = call.function.unwrap_or(WireFunction {
            name: None,
            arguments: None,
        });
        let arguments = function.arguments.unwrap_or_default();
        content.push(ContentPart::ToolCall {
            tool_call_id: call.id.unwrap_or_else(|| format!("call_{index}")),
            tool_name: function.name.unwrap_or_default(),
            input: serde_json::from_str(&arguments).unwrap_or(Value::String(arguments)),
        });
    }

    Ok(GenerateResult {
        text,
        content,
        finish_reason: choice
            .finish_reason
            .as_deref()
            .map(FinishReason::from_openai)
            .unwrap_or_default(),
        usage: completion.usage.map(Usage::from),
        model: completion.model,
    })
}

/// Maps completion chunks onto start/delta/end item parts.
#[derive(Debug, Default)]
struct ChunkMapper {
    metadata_sent: bool,
    text_open: bool,
    reasoning_open: bool,
    /// Open tool inputs by choice-local index.
    tools: BTreeMap<u32, String>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

const TEXT_ID: &str = "text-0";
const REASONING_ID: &str = "reasoning-0";

impl ChunkMapper {
    fn map(&mut self, event: SseEvent) -> Result<Vec<StreamPart>> {
        let data = event.data.trim();
        if data == "[DONE]" || data.is_empty() {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(data)?;
        if let Some(error) = value.get("error") {
            let message = error["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Ok(vec![StreamPart::Error { message }]);
        }
        let chunk: WireCompletion = serde_json::from_value(value)?;

        let mut parts = Vec::new();
        if !self.metadata_sent {
            self.metadata_sent = true;
            parts.push(StreamPart::ResponseMetadata {
                id: chunk.id,
                model_id: chunk.model,
            });
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
        }
        for choice in chunk.choices {
            let delta = choice.message;
            if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
                if !self.reasoning_open {
                    self.reasoning_open = true;
                    parts.push(StreamPart::ReasoningStart {
                        id: REASONING_ID.to_string(),
                    });
                }
                parts.push(StreamPart::ReasoningDelta {
                    id: REASONING_ID.to_string(),
                    delta: reasoning,
                });
            }
            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                self.close_reasoning(&mut parts);
                if !self.text_open {
                    self.text_open = true;
                    parts.push(StreamPart::TextStart {
                        id: TEXT_ID.to_string(),
                    });
                }
                parts.push(StreamPart::TextDelta {
                    id: TEXT_ID.to_string(),
                    delta: text,
                });
            }
            for (position, call) in delta.tool_calls.unwrap_or_default().into_iter().enumerate() {
                let index = call.index.unwrap_or(position as u32);
                let function = call.function.unwrap_or(WireFunction {
                    name: None,
                    arguments: None,
                });
                let id = match self.tools.get(&index) {
                    Some(id) => id.clone(),
                    None => {
                        let id = call.id.unwrap_or_else(|| format!("call_{index}"));
                        self.tools.insert(index, id.clone());
                        parts.push(StreamPart::ToolInputStart {
                            id: id.clone(),
                            tool_name: function.name.clone().unwrap_or_default(),
                        });
                        id
                    }
                };
                if let Some(arguments) = function.arguments.filter(|a| !a.is_empty()) {
                    parts.push(StreamPart::ToolInputDelta {
                        id,
                        delta: arguments,
                    });
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(FinishReason::from_openai(&reason));
            }
        }
        Ok(parts)
    }

    fn close_reasoning(&mut self, parts: &mut Vec<StreamPart>) {
        if std::mem::take(&mut self.reasoning_open) {
            parts.push(StreamPart::ReasoningEnd {
                id: REASONING_ID.to_string(),
            });
        }
    }

    /// Close open items and report completion.
    fn finish(&mut self) -> Vec<StreamPart> {
        let mut parts = Vec::new();
        self.close_reasoning(&mut parts);
        if std::mem::take(&mut self.text_open) {
            parts.push(StreamPart::TextEnd {
                id: TEXT_ID.to_string(),
            });
        }
        for id in std::mem::take(&mut self.tools).into_values() {
            parts.push(StreamPart::ToolInputEnd { id });
        }
        parts.push(StreamPart::Finish {
            finish_reason: self.finish_reason.take().unwrap_or_default(),
            usage: self.usage.take(),
        });
        parts
    }
}

struct DecodeState {
    body: ByteStream,
    decoder: SseDecoder,
    mapper: ChunkMapper,
}

impl DecodeState {
    fn map_events(&mut self, events: Vec<SseEvent>, out: &mut Vec<Result<StreamPart>>) -> bool {
        for event in events {
            match self.mapper.map(event) {
                Ok(parts) => out.extend(parts.into_iter().map(Ok)),
                Err(e) => {
                    warn!(error = %e, "undecodable stream chunk");
                    out.push(Err(BifrostError::Stream(e.to_string())));
                    return false;
                }
            }
        }
        true
    }
}

/// Decode an SSE body into parts. Stops after the first error.
fn decode_stream(body: ByteStream) -> PartStream {
    let state = DecodeState {
        body,
        decoder: SseDecoder::new(),
        mapper: ChunkMapper::default(),
    };
    let parts = stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        let mut out = Vec::new();
        match state.body.next().await {
            Some(Ok(chunk)) => {
                let events = state.decoder.push(&chunk);
                if state.map_events(events, &mut out) {
                    return Some((out, Some(state)));
                }
                Some((out, None))
            }
            Some(Err(e)) => {
                out.push(Err(e));
                Some((out, None))
            }
            None => {
                let events = state.decoder.finish();
                if state.map_events(events, &mut out) {
                    out.extend(state.mapper.finish().into_iter().map(Ok));
                }
                Some((out, None))
            }
        }
    })
    .flat_map(stream::iter);
    Box::pin(parts)
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(name = "upstream.generate", skip(self, handle, params), fields(provider = %self.name, model = tracing::field::Empty))]
    async fn do_generate(
        &self,
        handle: &ModelHandle,
        params: GenerateParams,
    ) -> Result<GenerateResult> {
        let model = upstream_model(handle, &params);
        tracing::Span::current().record("model", model.as_str());
        let request = self.request(&request_body(&model, &params, false))?;
        let response = self.fetch.fetch(request, params.abort.as_ref()).await?;
        let response = check_status(response).await?;
        let body = response.into_bytes().await?;
        let result = parse_completion(&body)?;
        debug!(chars = result.text.len(), "completion received");
        Ok(result)
    }

    #[instrument(name = "upstream.stream", skip(self, handle, params), fields(provider = %self.name, model = tracing::field::Empty))]
    async fn do_stream(&self, handle: &ModelHandle, params: GenerateParams) -> Result<PartStream> {
        let model = upstream_model(handle, &params);
        tracing::Span::current().record("model", model.as_str());
        let request = self.request(&request_body(&model, &params, true))?;
        let response = self.fetch.fetch(request, params.abort.as_ref()).await?;
        let response = check_status(response).await?;
        Ok(bounded_stream(
            decode_stream(response.into_stream()),
            self.stream_buffer,
        ))
    }
}
