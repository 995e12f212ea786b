//! Chat persistence through a chain: assembly, progress writes, finalization.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};

use bifrost::persistence::{MessageStatus, TurnStatus};
use bifrost::{
    BifrostError, ChatContext, ContentPart, FinishReason, FlushConfig, GenerateParams,
    GenerateResult, LanguageModel, MemoryChatStore, ModelChain, ModelHandle, PartStream,
    PersistenceMiddleware, Result, StreamPart,
};

/// Streams a fixed part list; `pending` keeps the stream open afterwards.
struct ScriptedModel {
    parts: Vec<StreamPart>,
    pending: bool,
    fail: bool,
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn do_generate(
        &self,
        _handle: &ModelHandle,
        _params: GenerateParams,
    ) -> Result<GenerateResult> {
        if self.fail {
            return Err(BifrostError::Api {
                status: 500,
                message: "upstream exploded".into(),
            });
        }
        Ok(GenerateResult::from_text("Paris is the capital of France."))
    }

    async fn do_stream(&self, _handle: &ModelHandle, _params: GenerateParams) -> Result<PartStream> {
        let parts = stream::iter(self.parts.clone().into_iter().map(Ok));
        if self.pending {
            Ok(Box::pin(parts.chain(stream::pending())))
        } else {
            Ok(Box::pin(parts))
        }
    }
}

fn delta(id: &str, text: &str) -> StreamPart {
    StreamPart::TextDelta {
        id: id.into(),
        delta: text.into(),
    }
}

fn interleaved() -> Vec<StreamPart> {
    vec![
        StreamPart::ReasoningStart { id: "r".into() },
        StreamPart::TextStart { id: "t".into() },
        StreamPart::ReasoningDelta {
            id: "r".into(),
            delta: "user wants a greeting".into(),
        },
        delta("t", "Hello"),
        StreamPart::ReasoningEnd { id: "r".into() },
        delta("t", " brave new"),
        delta("t", " world"),
        StreamPart::TextEnd { id: "t".into() },
        StreamPart::Finish {
            finish_reason: FinishReason::Stop,
            usage: None,
        },
    ]
}

fn chain(model: ScriptedModel, store: Arc<MemoryChatStore>, config: FlushConfig) -> ModelChain {
    ModelChain::builder(Arc::new(model))
        .with(Arc::new(PersistenceMiddleware::new(store, config)))
        .build()
        .unwrap()
}

fn handle() -> ModelHandle {
    ModelHandle::new("openai", "gpt-4.1", "hifi")
}

fn chat_params(chat: ChatContext) -> GenerateParams {
    GenerateParams::from_prompt("greet me").chat(chat)
}

#[tokio::test]
async fn completed_stream_finalizes_turn_message_and_title() {
    let store = Arc::new(MemoryChatStore::new());
    let chain = chain(
        ScriptedModel {
            parts: interleaved(),
            pending: false,
            fail: false,
        },
        store.clone(),
        FlushConfig::default().batch_size(3).title_limits(2, 100),
    );

    let parts: Vec<_> = chain
        .stream(&handle(), chat_params(ChatContext::new("chat-1", 2)))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(parts.len(), interleaved().len());

    // End of stream is only reported after the flush.
    let turns = store.turns_for_chat("chat-1").await;
    assert_eq!(turns.len(), 1);
    let (turn_id, turn) = &turns[0];
    assert_eq!(turn.status, TurnStatus::Complete);
    assert!(turn.latency_ms.is_some());

    let messages = store.messages_for_turn(turn_id).await;
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message.status, MessageStatus::Complete);
    assert_eq!(message.message_order, 2);
    assert_eq!(message.content, "Hello brave new world");
    // Progress writes happened before the final one.
    assert!(message.writes > 1, "writes = {}", message.writes);

    let content: Vec<ContentPart> =
        serde_json::from_str(message.content_json.as_deref().unwrap()).unwrap();
    assert_eq!(
        content[0],
        ContentPart::Reasoning {
            text: "user wants a greeting".into()
        }
    );
    assert_eq!(
        content[1],
        ContentPart::Text {
            text: "Hello brave new world".into()
        }
    );

    assert_eq!(store.title("chat-1").await.as_deref(), Some("Hello brave"));
}

#[tokio::test]
async fn dropped_stream_marks_turn_cancelled() {
    let store = Arc::new(MemoryChatStore::new());
    let chain = chain(
        ScriptedModel {
            parts: vec![StreamPart::TextStart { id: "t".into() }, delta("t", "Hel")],
            pending: true,
            fail: false,
        },
        store.clone(),
        FlushConfig::default(),
    );

    let mut parts = chain
        .stream(
            &handle(),
            chat_params(ChatContext::new("chat-2", 1).turn_id("turn-2")),
        )
        .await
        .unwrap();
    parts.next().await.unwrap().unwrap();
    parts.next().await.unwrap().unwrap();
    drop(parts);

    let mut turn = None;
    for _ in 0..100 {
        turn = store.turn("turn-2").await.filter(|t| t.status != TurnStatus::Pending);
        if turn.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let turn = turn.expect("turn was not finalized");
    assert_eq!(turn.status, TurnStatus::Error);
    assert!(turn.error.unwrap().contains("cancelled"));
    assert!(store.title("chat-2").await.is_none());
}

#[tokio::test]
async fn generate_records_the_answer() {
    let store = Arc::new(MemoryChatStore::new());
    let chain = chain(
        ScriptedModel {
            parts: Vec::new(),
            pending: false,
            fail: false,
        },
        store.clone(),
        FlushConfig::default(),
    );
    let result = chain
        .generate(&handle(), chat_params(ChatContext::new("chat-3", 1)))
        .await
        .unwrap();
    assert_eq!(result.text, "Paris is the capital of France.");

    let (turn_id, turn) = store.turns_for_chat("chat-3").await.remove(0);
    assert_eq!(turn.status, TurnStatus::Complete);
    let message = store.messages_for_turn(&turn_id).await.remove(0);
    assert_eq!(message.content, result.text);
    assert_eq!(
        store.title("chat-3").await.as_deref(),
        Some("Paris is the capital of France.")
    );
}

#[tokio::test]
async fn upstream_failure_is_returned_and_recorded() {
    let store = Arc::new(MemoryChatStore::new());
    let chain = chain(
        ScriptedModel {
            parts: Vec::new(),
            pending: false,
            fail: true,
        },
        store.clone(),
        FlushConfig::default(),
    );
    let err = chain
        .generate(&handle(), chat_params(ChatContext::new("chat-4", 1)))
        .await
        .unwrap_err();
    assert!(matches!(err, BifrostError::Api { status: 500, .. }));

    let (_, turn) = store.turns_for_chat("chat-4").await.remove(0);
    assert_eq!(turn.status, TurnStatus::Error);
    assert!(turn.error.unwrap().contains("upstream exploded"));
}

#[tokio::test]
async fn requests_without_chat_are_not_recorded() {
    let store = Arc::new(MemoryChatStore::new());
    let chain = chain(
        ScriptedModel {
            parts: interleaved(),
            pending: false,
            fail: false,
        },
        store.clone(),
        FlushConfig::default(),
    );
    let parts: Vec<_> = chain
        .stream(&handle(), GenerateParams::from_prompt("hi"))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(parts.len(), interleaved().len());
    assert!(store.turns_for_chat("").await.is_empty());
}
