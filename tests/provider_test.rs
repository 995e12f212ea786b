//! OpenAI-compatible upstream against a mock server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use bifrost::cache::{CacheConfig, CachedFetch};
use bifrost::{
    BifrostError, ContentPart, FinishReason, GenerateParams, LanguageModel, ModelHandle,
    OpenAiCompatibleModel, Semaphore, StreamHandlerContext, StreamPart,
};

fn model(server: &MockServer) -> (OpenAiCompatibleModel, Arc<Semaphore>) {
    let semaphore = Arc::new(Semaphore::new(2).unwrap());
    let fetch = Arc::new(CachedFetch::new(
        reqwest::Client::new(),
        semaphore.clone(),
        CacheConfig::new().enabled(false),
    ));
    let model = OpenAiCompatibleModel::new("openai", server.uri(), fetch).api_key("sk-test");
    (model, semaphore)
}

fn handle() -> ModelHandle {
    ModelHandle::new("openai", "gpt-4.1", "hifi")
}

#[tokio::test]
async fn generate_parses_a_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-4.1",
            "messages": [{"role": "user", "content": "capital of France?"}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "model": "gpt-4.1-2025-04-14",
            "choices": [{
                "message": {"role": "assistant", "content": "Paris."},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 2, "total_tokens": 14}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (model, semaphore) = model(&server);
    let result = model
        .do_generate(&handle(), GenerateParams::from_prompt("capital of France?"))
        .await
        .unwrap();
    assert_eq!(result.text, "Paris.");
    assert_eq!(result.finish_reason, FinishReason::Stop);
    assert_eq!(result.usage.unwrap().total_tokens, 14);
    assert_eq!(result.model.as_deref(), Some("gpt-4.1-2025-04-14"));
    assert_eq!(semaphore.available(), 2);
}

#[tokio::test]
async fn routed_model_is_sent_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"model": "gpt-4.1-mini"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "ok"}, "finish_reason": "stop"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (model, _) = model(&server);
    let mut params = GenerateParams::from_prompt("hi");
    params.routed_model = Some("openai:gpt-4.1-mini".into());
    let result = model.do_generate(&handle(), params).await.unwrap();
    assert_eq!(result.text, "ok");
}

#[tokio::test]
async fn stream_decodes_into_item_parts() {
    let server = MockServer::start().await;
    let body = [
        json!({"id": "c1", "model": "gpt-4.1", "choices": [{"delta": {"reasoning_content": "thinking"}}]}),
        json!({"choices": [{"delta": {"content": "Hel"}}]}),
        json!({"choices": [{"delta": {"content": "lo"}}]}),
        json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "call_a", "function": {"name": "lookup", "arguments": "{\"q\":"}}
        ]}}]}),
        json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "\"paris\"}"}}
        ]}, "finish_reason": "tool_calls"}]}),
        json!({"choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12}}),
    ]
    .iter()
    .map(|chunk| format!("data: {chunk}\n\n"))
    .chain(std::iter::once("data: [DONE]\n\n".to_string()))
    .collect::<String>();

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let (model, semaphore) = model(&server);
    let parts: Vec<StreamPart> = model
        .do_stream(&handle(), GenerateParams::from_prompt("hi"))
        .await
        .unwrap()
        .map(|p| p.unwrap())
        .collect()
        .await;

    assert!(matches!(
        &parts[0],
        StreamPart::ResponseMetadata { id: Some(id), .. } if id == "c1"
    ));
    assert!(matches!(
        parts.last(),
        Some(StreamPart::Finish {
            finish_reason: FinishReason::ToolCalls,
            usage: Some(_)
        })
    ));

    let mut context = StreamHandlerContext::default();
    for part in parts {
        context.apply(part).unwrap();
    }
    assert_eq!(context.generated_text, "Hello");
    assert!(context.open_items().is_empty());
    assert!(context.generated_json.contains(&ContentPart::Reasoning {
        text: "thinking".into()
    }));
    assert!(context.generated_json.contains(&ContentPart::ToolInput {
        id: "call_a".into(),
        tool_name: "lookup".into(),
        input: json!({"q": "paris"}),
    }));

    // Slot is freed once the body is fully read.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(semaphore.available(), 2);
}

#[tokio::test]
async fn mid_stream_error_event_becomes_an_error_part() {
    let server = MockServer::start().await;
    let body = "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n\
                data: {\"error\":{\"message\":\"overloaded\"}}\n\n";
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let (model, _) = model(&server);
    let parts: Vec<_> = model
        .do_stream(&handle(), GenerateParams::from_prompt("hi"))
        .await
        .unwrap()
        .collect()
        .await;
    assert!(parts.iter().any(|p| matches!(
        p,
        Ok(StreamPart::Error { message }) if message == "overloaded"
    )));
}

#[tokio::test]
async fn too_many_requests_maps_to_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
        .mount(&server)
        .await;

    let (model, semaphore) = model(&server);
    let err = model
        .do_generate(&handle(), GenerateParams::from_prompt("hi"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BifrostError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(30)
    ));
    assert_eq!(semaphore.available(), 2);
}

#[tokio::test]
async fn api_error_carries_upstream_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "context length exceeded", "type": "invalid_request_error"}
        })))
        .mount(&server)
        .await;

    let (model, _) = model(&server);
    let err = model
        .do_stream(&handle(), GenerateParams::from_prompt("hi"))
        .await
        .err()
        .unwrap();
    match err {
        BifrostError::Api { status, message } => {
            assert_eq!(status, 400);
            assert_eq!(message, "context length exceeded");
        }
        other => panic!("unexpected error: {other}"),
    }
}
