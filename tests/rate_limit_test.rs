//! Admission, failover and queueing through the rate-limit middleware.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use futures_util::{StreamExt, stream};

use bifrost::rate_limit::{QueueItem, QueueManager};
use bifrost::{
    BifrostError, GenerateParams, GenerateResult, LanguageModel, MemoryQueue, ModelChain,
    ModelHandle, ModelRegistry, PartStream, RateLimitConfig, RateLimitContext,
    RateLimitMiddleware, Result, StreamPart,
};

/// Records the routed model of every call.
#[derive(Default)]
struct RoutingModel {
    calls: AtomicUsize,
    routed: Mutex<Vec<Option<String>>>,
    fail_with_429: bool,
}

#[async_trait]
impl LanguageModel for RoutingModel {
    fn name(&self) -> &str {
        "routing"
    }

    async fn do_generate(
        &self,
        _handle: &ModelHandle,
        params: GenerateParams,
    ) -> Result<GenerateResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.routed.lock().unwrap().push(params.routed_model.clone());
        if self.fail_with_429 {
            return Err(BifrostError::RateLimited { retry_after: None });
        }
        Ok(GenerateResult::from_text("ok"))
    }

    async fn do_stream(&self, _handle: &ModelHandle, params: GenerateParams) -> Result<PartStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.routed.lock().unwrap().push(params.routed_model.clone());
        let parts = StreamPart::text_parts("t", "ok");
        Ok(Box::pin(stream::iter(parts.into_iter().map(Ok))))
    }
}

/// Queue that refuses every item.
struct BrokenQueue;

#[async_trait]
impl QueueManager for BrokenQueue {
    async fn enqueue(&self, _item: QueueItem) -> Result<()> {
        Err(BifrostError::Queue("broker unreachable".into()))
    }
}

struct Fixture {
    chain: ModelChain,
    model: Arc<RoutingModel>,
    queue: Arc<MemoryQueue>,
    limiter: Arc<RateLimitMiddleware>,
}

fn fixture(model: RoutingModel) -> Fixture {
    let model = Arc::new(model);
    let queue = Arc::new(MemoryQueue::new());
    let limiter = Arc::new(RateLimitMiddleware::new(
        Arc::new(ModelRegistry::with_embedded_seed()),
        queue.clone(),
        RateLimitConfig::default(),
    ));
    let chain = ModelChain::builder(model.clone())
        .with(limiter.clone())
        .build()
        .unwrap();
    Fixture {
        chain,
        model,
        queue,
        limiter,
    }
}

fn hifi() -> ModelHandle {
    ModelHandle::new("azure", "gpt-4.1", "hifi")
}

/// A request no seeded model accepts (per-message ceiling is 32768).
fn oversized(request_id: Option<&str>) -> GenerateParams {
    GenerateParams::from_prompt("summarise the archive").rate_limit_context(RateLimitContext {
        request_id: request_id.map(str::to_string),
        estimated_tokens: Some(40_000),
        ..RateLimitContext::default()
    })
}

#[tokio::test]
async fn available_model_is_served_as_requested() {
    let f = fixture(RoutingModel::default());
    f.chain
        .generate(&hifi(), GenerateParams::from_prompt("hi"))
        .await
        .unwrap();
    assert_eq!(*f.model.routed.lock().unwrap(), vec![None]);
    assert!(f.limiter.tracker().usage("azure:gpt-4.1").is_some());
}

#[tokio::test]
async fn cooling_model_fails_over_to_fallback_provider() {
    let f = fixture(RoutingModel::default());
    f.limiter
        .tracker()
        .cool_down("azure:gpt-4.1", Utc::now() + TimeDelta::minutes(5));

    f.chain
        .generate(&hifi(), GenerateParams::from_prompt("hi"))
        .await
        .unwrap();
    assert_eq!(
        *f.model.routed.lock().unwrap(),
        vec![Some("openai:gpt-4.1".to_string())]
    );
}

#[tokio::test]
async fn exhausted_class_enqueues_exactly_once() {
    let f = fixture(RoutingModel::default());
    let err = f
        .chain
        .generate(&hifi(), oversized(None))
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(
        message.starts_with("No hifi models available. Request enqueued with ID: "),
        "unexpected message: {message}"
    );
    assert_eq!(f.model.calls.load(Ordering::SeqCst), 0);

    let items = f.queue.drain().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].model_class, "hifi");
    assert!(message.ends_with(&items[0].request_id));
}

#[tokio::test]
async fn caller_request_id_is_kept() {
    let f = fixture(RoutingModel::default());
    let err = f
        .chain
        .stream(&hifi(), oversized(Some("req-7")))
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        BifrostError::NoModelsAvailable { ref request_id, .. } if request_id == "req-7"
    ));
    assert_eq!(f.queue.drain().await[0].request_id, "req-7");
}

#[tokio::test]
async fn failed_enqueue_surfaces_queue_error() {
    let model = Arc::new(RoutingModel::default());
    let chain = ModelChain::builder(model)
        .with(Arc::new(RateLimitMiddleware::new(
            Arc::new(ModelRegistry::with_embedded_seed()),
            Arc::new(BrokenQueue),
            RateLimitConfig::default(),
        )))
        .build()
        .unwrap();
    let err = chain.generate(&hifi(), oversized(None)).await.unwrap_err();
    assert!(matches!(err, BifrostError::Queue(_)));
}

#[tokio::test]
async fn upstream_429_cools_the_serving_model() {
    let f = fixture(RoutingModel {
        fail_with_429: true,
        ..RoutingModel::default()
    });
    let err = f
        .chain
        .generate(&hifi(), GenerateParams::from_prompt("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, BifrostError::RateLimited { .. }));

    // The next request avoids the cooling deployment.
    let _ = f
        .chain
        .generate(&hifi(), GenerateParams::from_prompt("hi again"))
        .await;
    assert_eq!(
        f.model.routed.lock().unwrap().last().cloned().flatten(),
        Some("openai:gpt-4.1".to_string())
    );
}

#[tokio::test]
async fn streams_are_admitted_like_generates() {
    let f = fixture(RoutingModel::default());
    let parts: Vec<_> = f
        .chain
        .stream(&hifi(), GenerateParams::from_prompt("hi"))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(parts.len(), 4);
    assert!(parts.iter().all(|p| p.is_ok()));
    assert_eq!(f.model.calls.load(Ordering::SeqCst), 1);
}
