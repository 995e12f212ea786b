//! Per-provider dispatch of the terminal model call.
//!
//! [`ProviderRouter`] holds one upstream [`LanguageModel`] per canonical
//! provider name. A request goes to the provider of its routed model when
//! the rate limiter failed it over, otherwise to the provider of its handle.
//! Handle providers may be aliases (`"azure-openai.chat"`); they are resolved
//! through the [`ModelRegistry`] when one is attached.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::registry::ModelRegistry;
use crate::telemetry;
use crate::traits::LanguageModel;
use crate::types::{GenerateParams, GenerateResult, ModelHandle, PartStream};
use crate::{BifrostError, Result};

/// Upstream models keyed by canonical provider name.
#[derive(Default)]
pub struct ProviderRouter {
    providers: BTreeMap<String, Arc<dyn LanguageModel>>,
    registry: Option<Arc<ModelRegistry>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve provider aliases through `registry`.
    pub fn with_registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Serve `provider` with `model`, replacing any previous upstream.
    pub fn add(mut self, provider: impl Into<String>, model: Arc<dyn LanguageModel>) -> Self {
        self.providers.insert(provider.into(), model);
        self
    }

    /// Configured provider names, sorted.
    pub fn providers(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Canonical provider a request is sent to.
    pub async fn target(&self, handle: &ModelHandle, params: &GenerateParams) -> String {
        if let Some((provider, _)) = params
            .routed_model
            .as_deref()
            .and_then(|key| key.split_once(':'))
        {
            return provider.to_string();
        }
        if self.providers.contains_key(&handle.provider) {
            return handle.provider.clone();
        }
        let Some(registry) = &self.registry else {
            return handle.provider.clone();
        };
        match registry.normalize(&handle.provider, &handle.model_id).await {
            Ok(normalized) => normalized
                .provider
                .unwrap_or_else(|| handle.provider.clone()),
            Err(e) => {
                warn!(provider = %handle.provider, error = %e, "registry unavailable, routing on raw provider");
                handle.provider.clone()
            }
        }
    }

    async fn route(
        &self,
        handle: &ModelHandle,
        params: &GenerateParams,
    ) -> Result<(String, &Arc<dyn LanguageModel>)> {
        let provider = self.target(handle, params).await;
        match self.providers.get(&provider) {
            Some(model) => {
                debug!(provider = %provider, upstream = model.name(), "routing request");
                Ok((provider, model))
            }
            None => Err(BifrostError::Configuration(format!(
                "no upstream configured for provider `{provider}`"
            ))),
        }
    }

    fn record_request(operation: &'static str, provider: String, ok: bool) {
        let status = if ok { "ok" } else { "error" };
        metrics::counter!(telemetry::UPSTREAM_REQUESTS_TOTAL,
            "provider" => provider,
            "operation" => operation,
            "status" => status,
        )
        .increment(1);
    }
}

#[async_trait]
impl LanguageModel for ProviderRouter {
    fn name(&self) -> &str {
        "router"
    }

    #[instrument(name = "router.generate", skip_all, fields(provider = %handle.provider))]
    async fn do_generate(
        &self,
        handle: &ModelHandle,
        params: GenerateParams,
    ) -> Result<GenerateResult> {
        let (provider, model) = self.route(handle, &params).await?;
        let result = model.do_generate(handle, params).await;
        Self::record_request("generate", provider, result.is_ok());
        result
    }

    #[instrument(name = "router.stream", skip_all, fields(provider = %handle.provider))]
    async fn do_stream(&self, handle: &ModelHandle, params: GenerateParams) -> Result<PartStream> {
        let (provider, model) = self.route(handle, &params).await?;
        let result = model.do_stream(handle, params).await;
        Self::record_request("stream", provider, result.is_ok());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    /// Answers with its own name.
    struct Named(&'static str);

    #[async_trait]
    impl LanguageModel for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn do_generate(
            &self,
            _handle: &ModelHandle,
            _params: GenerateParams,
        ) -> Result<GenerateResult> {
            Ok(GenerateResult::from_text(self.0))
        }

        async fn do_stream(&self, _handle: &ModelHandle, _params: GenerateParams) -> Result<PartStream> {
            Ok(Box::pin(stream::empty()))
        }
    }

    fn router() -> ProviderRouter {
        ProviderRouter::new()
            .with_registry(Arc::new(ModelRegistry::with_embedded_seed()))
            .add("azure", Arc::new(Named("azure")))
            .add("openai", Arc::new(Named("openai")))
    }

    #[tokio::test]
    async fn handle_provider_is_used_without_failover() {
        let handle = ModelHandle::new("azure", "gpt-4.1", "hifi");
        let result = router()
            .do_generate(&handle, GenerateParams::from_prompt("hi"))
            .await
            .unwrap();
        assert_eq!(result.text, "azure");
    }

    #[tokio::test]
    async fn routed_model_selects_its_provider() {
        let handle = ModelHandle::new("azure", "gpt-4.1", "hifi");
        let mut params = GenerateParams::from_prompt("hi");
        params.routed_model = Some("openai:gpt-4.1".into());
        let result = router().do_generate(&handle, params).await.unwrap();
        assert_eq!(result.text, "openai");
    }

    #[tokio::test]
    async fn provider_alias_resolves_through_registry() {
        let handle = ModelHandle::new("azure-openai.chat", "gpt-4.1", "hifi");
        let router = router();
        assert_eq!(
            router
                .target(&handle, &GenerateParams::from_prompt("hi"))
                .await,
            "azure"
        );
    }

    #[tokio::test]
    async fn unconfigured_provider_is_a_configuration_error() {
        let handle = ModelHandle::new("anthropic", "claude", "hifi");
        let err = router()
            .do_generate(&handle, GenerateParams::from_prompt("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, BifrostError::Configuration(ref m) if m.contains("anthropic")));
    }
}
