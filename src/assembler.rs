//! Stream chunk assembler.
//!
//! A streamed response interleaves several logical items (text, reasoning,
//! tool inputs), each delimited by start/delta.../end parts sharing an item
//! id. [`StreamHandlerContext`] keeps one open buffer per active id and, on
//! `end`, appends the finished item to `generated_json` in completion order.
//! Plain-text items also extend `generated_text`.
//!
//! Parts are applied by a single consumer task ([`ProcessingQueue`]) in
//! arrival order. A part that fails to apply rejects only its own caller;
//! the queue keeps draining.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::{ContentPart, StreamPart};
use crate::{BifrostError, Result, telemetry};

/// Accumulated state of one tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallState {
    pub tool_name: String,
    /// Raw JSON argument text received so far.
    pub input: String,
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum ItemKind {
    Text,
    Reasoning,
    ToolInput { tool_name: String },
}

impl ItemKind {
    fn label(&self) -> &'static str {
        match self {
            ItemKind::Text => "text",
            ItemKind::Reasoning => "reasoning",
            ItemKind::ToolInput { .. } => "tool-input",
        }
    }
}

#[derive(Debug, Clone)]
struct OpenItem {
    kind: ItemKind,
    buffer: String,
    started: u64,
}

/// Per-request assembly state.
#[derive(Debug, Clone, Default)]
pub struct StreamHandlerContext {
    pub chat_id: Option<String>,
    pub turn_id: Option<String>,
    /// Id of the pending assistant message row, once reserved.
    pub message_id: Option<String>,
    pub current_message_order: u32,
    /// Concatenated plain text (and serialized unknown parts).
    pub generated_text: String,
    /// Finished content entries in completion order.
    pub generated_json: Vec<ContentPart>,
    pub tool_calls: HashMap<String, ToolCallState>,
    open: HashMap<String, OpenItem>,
    next_seq: u64,
    parts_seen: u64,
}

impl StreamHandlerContext {
    pub fn new(chat_id: Option<String>, turn_id: Option<String>, message_order: u32) -> Self {
        Self {
            chat_id,
            turn_id,
            current_message_order: message_order,
            ..Self::default()
        }
    }

    /// Parts applied so far, including failed ones.
    pub fn parts_seen(&self) -> u64 {
        self.parts_seen
    }

    /// Item ids with an open buffer.
    pub fn open_items(&self) -> Vec<&str> {
        let mut open: Vec<_> = self.open.iter().collect();
        open.sort_by_key(|(_, item)| item.started);
        open.into_iter().map(|(id, _)| id.as_str()).collect()
    }

    fn start(&mut self, id: String, kind: ItemKind) -> Result<()> {
        if self.open.contains_key(&id) {
            return Err(BifrostError::Assembly(format!(
                "duplicate start for item {id}"
            )));
        }
        self.next_seq += 1;
        self.open.insert(
            id,
            OpenItem {
                kind,
                buffer: String::new(),
                started: self.next_seq,
            },
        );
        Ok(())
    }

    fn delta(&mut self, id: &str, expected: &'static str, delta: &str) -> Result<()> {
        let item = self.open.get_mut(id).ok_or_else(|| {
            BifrostError::Assembly(format!("{expected} delta for unknown item {id}"))
        })?;
        if item.kind.label() != expected {
            return Err(BifrostError::Assembly(format!(
                "{expected} delta for {} item {id}",
                item.kind.label()
            )));
        }
        item.buffer.push_str(delta);
        if let ItemKind::ToolInput { .. } = item.kind
            && let Some(call) = self.tool_calls.get_mut(id)
        {
            call.input.push_str(delta);
        }
        Ok(())
    }

    fn end(&mut self, id: &str, expected: &'static str) -> Result<()> {
        match self.open.get(id) {
            Some(item) if item.kind.label() == expected => {}
            Some(item) => {
                return Err(BifrostError::Assembly(format!(
                    "{expected} end for {} item {id}",
                    item.kind.label()
                )));
            }
            None => {
                return Err(BifrostError::Assembly(format!(
                    "{expected} end for unknown item {id}"
                )));
            }
        }
        if let Some(item) = self.open.remove(id) {
            self.finalize(id.to_string(), item);
        }
        Ok(())
    }

    fn finalize(&mut self, id: String, item: OpenItem) {
        match item.kind {
            ItemKind::Text => {
                self.generated_text.push_str(&item.buffer);
                self.generated_json
                    .push(ContentPart::Text { text: item.buffer });
            }
            ItemKind::Reasoning => {
                self.generated_json
                    .push(ContentPart::Reasoning { text: item.buffer });
            }
            ItemKind::ToolInput { tool_name } => {
                let input = parse_tool_input(&id, &item.buffer);
                if let Some(call) = self.tool_calls.get_mut(&id) {
                    call.complete = true;
                }
                self.generated_json.push(ContentPart::ToolInput {
                    id,
                    tool_name,
                    input,
                });
            }
        }
    }

    /// Apply one part.
    pub fn apply(&mut self, part: StreamPart) -> Result<()> {
        self.parts_seen += 1;
        match part {
            StreamPart::TextStart { id } => self.start(id, ItemKind::Text),
            StreamPart::TextDelta { id, delta } => self.delta(&id, "text", &delta),
            StreamPart::TextEnd { id } => self.end(&id, "text"),
            StreamPart::ReasoningStart { id } => self.start(id, ItemKind::Reasoning),
            StreamPart::ReasoningDelta { id, delta } => self.delta(&id, "reasoning", &delta),
            StreamPart::ReasoningEnd { id } => self.end(&id, "reasoning"),
            StreamPart::ToolInputStart { id, tool_name } => {
                self.start(
                    id.clone(),
                    ItemKind::ToolInput {
                        tool_name: tool_name.clone(),
                    },
                )?;
                self.tool_calls.insert(
                    id,
                    ToolCallState {
                        tool_name,
                        ..ToolCallState::default()
                    },
                );
                Ok(())
            }
            StreamPart::ToolInputDelta { id, delta } => self.delta(&id, "tool-input", &delta),
            StreamPart::ToolInputEnd { id } => self.end(&id, "tool-input"),
            StreamPart::ToolCall {
                tool_call_id,
                tool_name,
                input,
            } => {
                let parsed = parse_tool_input(&tool_call_id, &input);
                self.tool_calls.insert(
                    tool_call_id.clone(),
                    ToolCallState {
                        tool_name: tool_name.clone(),
                        input,
                        complete: true,
                    },
                );
                self.generated_json.push(ContentPart::ToolCall {
                    tool_call_id,
                    tool_name,
                    input: parsed,
                });
                Ok(())
            }
            StreamPart::ResponseMetadata { id, model_id } => {
                self.generated_json
                    .push(ContentPart::ResponseMetadata { id, model_id });
                Ok(())
            }
            StreamPart::Finish {
                finish_reason,
                usage,
            } => {
                self.generated_json.push(ContentPart::Finish {
                    finish_reason,
                    usage,
                });
                Ok(())
            }
            StreamPart::Error { message } => {
                self.generated_json.push(ContentPart::Error { message });
                Ok(())
            }
            raw @ StreamPart::Raw { .. } => {
                let serialized = serde_json::to_string(&raw)?;
                self.generated_text.push_str(&serialized);
                Ok(())
            }
        }
    }

    /// Finalize items still open (stream cut short), in start order.
    pub fn close_open_items(&mut self) {
        let mut open: Vec<_> = self.open.drain().collect();
        open.sort_by_key(|(_, item)| item.started);
        for (id, item) in open {
            debug!(id, kind = item.kind.label(), "closing unterminated item");
            self.finalize(id, item);
        }
    }
}

/// Tool arguments as JSON; unparseable input is kept as a string.
fn parse_tool_input(id: &str, raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(id, error = %e, "tool input is not valid JSON, keeping raw text");
        serde_json::Value::String(raw.to_string())
    })
}

enum Command {
    Apply {
        part: StreamPart,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Snapshot(oneshot::Sender<StreamHandlerContext>),
}

/// Cloneable producer side of a [`ProcessingQueue`].
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<Command>,
}

fn queue_closed() -> BifrostError {
    BifrostError::Assembly("processing queue closed".to_string())
}

impl QueueSender {
    /// Queue `part` and wait for it to be applied.
    pub async fn enqueue(&self, part: StreamPart) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Apply {
                part,
                reply: Some(reply),
            })
            .map_err(|_| queue_closed())?;
        rx.await.map_err(|_| queue_closed())?
    }

    /// Queue `part` without waiting. Failures are only logged.
    pub fn submit(&self, part: StreamPart) -> Result<()> {
        self.tx
            .send(Command::Apply { part, reply: None })
            .map_err(|_| queue_closed())
    }

    /// Copy of the context after every part queued so far.
    pub async fn snapshot(&self) -> Result<StreamHandlerContext> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot(reply))
            .map_err(|_| queue_closed())?;
        rx.await.map_err(|_| queue_closed())
    }
}

/// Single-consumer FIFO applying parts to a [`StreamHandlerContext`].
pub struct ProcessingQueue {
    sender: QueueSender,
    worker: JoinHandle<StreamHandlerContext>,
}

impl ProcessingQueue {
    /// Spawn the consumer task. Must be called inside a tokio runtime.
    pub fn new(mut context: StreamHandlerContext) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let worker = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Apply { part, reply } => {
                        let result = context.apply(part);
                        if let Err(e) = &result {
                            warn!(error = %e, "failed to assemble stream part");
                            metrics::counter!(telemetry::ASSEMBLY_ERRORS_TOTAL).increment(1);
                        }
                        if let Some(reply) = reply {
                            // The caller may have stopped waiting.
                            let _ = reply.send(result);
                        }
                    }
                    Command::Snapshot(reply) => {
                        let _ = reply.send(context.clone());
                    }
                }
            }
            context
        });
        Self {
            sender: QueueSender { tx },
            worker,
        }
    }

    /// Producer handle for use from other tasks.
    pub fn sender(&self) -> QueueSender {
        self.sender.clone()
    }

    pub async fn enqueue(&self, part: StreamPart) -> Result<()> {
        self.sender.enqueue(part).await
    }

    pub fn submit(&self, part: StreamPart) -> Result<()> {
        self.sender.submit(part)
    }

    pub async fn snapshot(&self) -> Result<StreamHandlerContext> {
        self.sender.snapshot().await
    }

    /// Drain the queue and return the final context.
    ///
    /// Waits for every outstanding [`QueueSender`] to be dropped.
    pub async fn finish(self) -> Result<StreamHandlerContext> {
        drop(self.sender);
        self.worker
            .await
            .map_err(|e| BifrostError::Assembly(format!("assembler task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FinishReason;
    use serde_json::json;

    fn text_delta(id: &str, delta: &str) -> StreamPart {
        StreamPart::TextDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    fn reasoning_delta(id: &str, delta: &str) -> StreamPart {
        StreamPart::ReasoningDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    #[test]
    fn deltas_concatenate_in_arrival_order() {
        let mut ctx = StreamHandlerContext::default();
        ctx.apply(StreamPart::TextStart { id: "t".into() }).unwrap();
        ctx.apply(text_delta("t", "Hello")).unwrap();
        ctx.apply(text_delta("t", " World")).unwrap();
        assert!(ctx.generated_text.is_empty());
        ctx.apply(StreamPart::TextEnd { id: "t".into() }).unwrap();
        assert_eq!(ctx.generated_text, "Hello World");
        assert_eq!(
            ctx.generated_json,
            vec![ContentPart::Text {
                text: "Hello World".into()
            }]
        );
    }

    #[test]
    fn interleaved_items_stay_separate() {
        let mut ctx = StreamHandlerContext::default();
        let parts = vec![
            StreamPart::TextStart { id: "t".into() },
            StreamPart::ReasoningStart { id: "r".into() },
            text_delta("t", "A"),
            reasoning_delta("r", "1"),
            text_delta("t", "B"),
            reasoning_delta("r", "2"),
            StreamPart::ReasoningEnd { id: "r".into() },
            StreamPart::TextEnd { id: "t".into() },
        ];
        for part in parts {
            ctx.apply(part).unwrap();
        }
        assert_eq!(ctx.generated_json.len(), 2);
        assert!(ctx.generated_json.contains(&ContentPart::Text { text: "AB".into() }));
        assert!(
            ctx.generated_json
                .contains(&ContentPart::Reasoning { text: "12".into() })
        );
        assert_eq!(ctx.generated_text, "AB");
    }

    #[test]
    fn tool_input_is_parsed_on_end() {
        let mut ctx = StreamHandlerContext::default();
        ctx.apply(StreamPart::ToolInputStart {
            id: "call_1".into(),
            tool_name: "search".into(),
        })
        .unwrap();
        for chunk in [r#"{"q":"#, r#""rust"}"#] {
            ctx.apply(StreamPart::ToolInputDelta {
                id: "call_1".into(),
                delta: chunk.into(),
            })
            .unwrap();
        }
        assert!(!ctx.tool_calls["call_1"].complete);
        ctx.apply(StreamPart::ToolInputEnd {
            id: "call_1".into(),
        })
        .unwrap();
        assert_eq!(
            ctx.generated_json,
            vec![ContentPart::ToolInput {
                id: "call_1".into(),
                tool_name: "search".into(),
                input: json!({"q": "rust"}),
            }]
        );
        assert!(ctx.tool_calls["call_1"].complete);
        assert!(ctx.generated_text.is_empty());
    }

    #[test]
    fn unknown_and_metadata_parts() {
        let mut ctx = StreamHandlerContext::default();
        ctx.apply(StreamPart::Raw {
            raw_value: json!({"x": 1}),
        })
        .unwrap();
        ctx.apply(StreamPart::ResponseMetadata {
            id: Some("resp_1".into()),
            model_id: None,
        })
        .unwrap();
        ctx.apply(StreamPart::Finish {
            finish_reason: FinishReason::Stop,
            usage: None,
        })
        .unwrap();
        assert_eq!(ctx.generated_text, r#"{"type":"raw","rawValue":{"x":1}}"#);
        assert_eq!(ctx.generated_json.len(), 2);
    }

    #[test]
    fn delta_for_unknown_item_is_rejected() {
        let mut ctx = StreamHandlerContext::default();
        assert!(matches!(
            ctx.apply(text_delta("ghost", "x")),
            Err(BifrostError::Assembly(_))
        ));
        ctx.apply(StreamPart::ReasoningStart { id: "r".into() }).unwrap();
        assert!(ctx.apply(text_delta("r", "x")).is_err());
        assert!(ctx.apply(StreamPart::TextEnd { id: "r".into() }).is_err());
    }

    #[test]
    fn open_items_close_in_start_order() {
        let mut ctx = StreamHandlerContext::default();
        ctx.apply(StreamPart::ReasoningStart { id: "r".into() }).unwrap();
        ctx.apply(StreamPart::TextStart { id: "t".into() }).unwrap();
        ctx.apply(text_delta("t", "partial")).unwrap();
        assert_eq!(ctx.open_items(), vec!["r", "t"]);
        ctx.close_open_items();
        assert_eq!(ctx.generated_text, "partial");
        assert!(matches!(ctx.generated_json[0], ContentPart::Reasoning { .. }));
    }

    #[tokio::test]
    async fn queue_keeps_draining_after_a_bad_part() {
        let queue = ProcessingQueue::new(StreamHandlerContext::default());
        queue
            .enqueue(StreamPart::TextStart { id: "t".into() })
            .await
            .unwrap();
        assert!(queue.enqueue(text_delta("ghost", "x")).await.is_err());
        queue.submit(text_delta("t", "Hello")).unwrap();
        queue.submit(text_delta("t", " World")).unwrap();
        queue
            .enqueue(StreamPart::TextEnd { id: "t".into() })
            .await
            .unwrap();

        let snapshot = queue.snapshot().await.unwrap();
        assert_eq!(snapshot.generated_text, "Hello World");

        let ctx = queue.finish().await.unwrap();
        assert_eq!(ctx.parts_seen(), 5);
        assert_eq!(ctx.generated_json.len(), 1);
    }
}
