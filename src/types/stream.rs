//! Streaming chunk types

use std::pin::Pin;

use futures_util::Stream;
use serde::{Deserialize, Serialize};

use super::response::{FinishReason, Usage};
use crate::Result;

/// One fragment of a streamed model response.
///
/// Logical items (text, reasoning, tool input) are delimited by a
/// start/delta.../end triple sharing an item `id`; items of different ids
/// may interleave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamPart {
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ReasoningEnd {
        id: String,
    },
    ToolInputStart {
        id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
    },
    ToolInputDelta {
        id: String,
        delta: String,
    },
    ToolInputEnd {
        id: String,
    },
    /// A complete tool call; `input` is the JSON-encoded argument string.
    ToolCall {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: String,
    },
    ResponseMetadata {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, rename = "modelId", skip_serializing_if = "Option::is_none")]
        model_id: Option<String>,
    },
    Finish {
        #[serde(rename = "finishReason")]
        finish_reason: FinishReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Error {
        message: String,
    },
    /// Provider-specific chunk this crate does not model.
    Raw {
        #[serde(rename = "rawValue")]
        raw_value: serde_json::Value,
    },
}

impl StreamPart {
    /// Approximate in-memory size, used to bound stream caching.
    pub fn size_hint(&self) -> usize {
        match self {
            StreamPart::TextDelta { id, delta }
            | StreamPart::ReasoningDelta { id, delta }
            | StreamPart::ToolInputDelta { id, delta } => id.len() + delta.len(),
            StreamPart::ToolCall {
                tool_call_id,
                tool_name,
                input,
            } => tool_call_id.len() + tool_name.len() + input.len(),
            StreamPart::Raw { raw_value } => raw_value.to_string().len(),
            StreamPart::Error { message } => message.len(),
            _ => 32,
        }
    }

    /// Single-item text stream for a whole string.
    pub fn text_parts(id: &str, text: impl Into<String>) -> Vec<StreamPart> {
        vec![
            StreamPart::TextStart { id: id.to_string() },
            StreamPart::TextDelta {
                id: id.to_string(),
                delta: text.into(),
            },
            StreamPart::TextEnd { id: id.to_string() },
            StreamPart::Finish {
                finish_reason: FinishReason::Stop,
                usage: None,
            },
        ]
    }
}

/// A live stream of response fragments.
pub type PartStream = Pin<Box<dyn Stream<Item = Result<StreamPart>> + Send>>;
