//! Stable request fingerprints.
//!
//! Fingerprints are SHA-256 digests over a canonical JSON rendering of the
//! fields that determine a response, so they agree across processes and can
//! key a shared network cache. Routing and bookkeeping fields
//! (`routed_model` aside from the key itself, rate limiter hints, chat
//! target, abort signal) never contribute.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::Result;
use crate::types::{GenerateParams, Message, ToolDefinition};

/// Key namespace; bump when the canonical form changes.
const NAMESPACE: &str = "bifrost:v1";

#[derive(Serialize)]
struct GenerateInput<'a> {
    operation: &'a str,
    model: &'a str,
    prompt: Vec<CanonicalMessage<'a>>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    top_p: Option<f32>,
    stop_sequences: &'a [String],
    seed: Option<u64>,
    tools: &'a [ToolDefinition],
}

#[derive(Serialize)]
struct CanonicalMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

impl<'a> From<&'a Message> for CanonicalMessage<'a> {
    fn from(m: &'a Message) -> Self {
        Self {
            role: m.role.as_str(),
            content: m.content.trim(),
            tool_call_id: m.tool_call_id.as_deref(),
            name: m.name.as_deref(),
        }
    }
}

/// Fingerprint of a chain call against the model identified by `model_key`.
pub fn generate_fingerprint(
    operation: &str,
    model_key: &str,
    params: &GenerateParams,
) -> Result<String> {
    let input = GenerateInput {
        operation,
        model: model_key,
        prompt: params.prompt.iter().map(CanonicalMessage::from).collect(),
        temperature: params.temperature,
        max_tokens: params.max_tokens,
        top_p: params.top_p,
        stop_sequences: &params.stop_sequences,
        seed: params.seed,
        tools: &params.tools,
    };
    let canonical = serde_json::to_vec(&input)?;
    Ok(digest(&[b"generate", &canonical]))
}

/// Fingerprint of an outbound HTTP request.
pub fn fetch_fingerprint(method: &str, url: &str, body: Option<&[u8]>) -> String {
    digest(&[
        b"fetch",
        method.as_bytes(),
        url.as_bytes(),
        body.unwrap_or_default(),
    ])
}

fn digest(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        // Length-prefix each part so boundaries cannot shift.
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    format!("{NAMESPACE}:{}", hex::encode(hasher.finalize()))
}
