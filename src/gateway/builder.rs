//! Builder for model chains

use std::sync::Arc;

use tracing::{info, warn};

use super::ModelChain;
use crate::cache::{CacheMiddleware, CachedFetch, NetworkCache, ResponseCache};
use crate::config::GatewayConfig;
use crate::middleware::Middleware;
use crate::persistence::{ChatStore, PersistenceMiddleware};
use crate::providers::{OpenAiCompatibleModel, ProviderRouter};
use crate::rate_limit::{QueueManager, RateLimitMiddleware};
use crate::registry::ModelRegistry;
use crate::semaphore::Semaphore;
use crate::traits::LanguageModel;
use crate::{BifrostError, Result};

/// External collaborators of the standard chain.
pub struct Collaborators {
    pub registry: Arc<ModelRegistry>,
    pub queue: Arc<dyn QueueManager>,
    pub chat_store: Arc<dyn ChatStore>,
    pub network_cache: Option<Arc<dyn NetworkCache>>,
}

/// Builder for [`ModelChain`]. Middleware runs in the order it is added:
/// the first one added sees requests first and results last.
pub struct ChainBuilder {
    model: Arc<dyn LanguageModel>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl ChainBuilder {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            middleware: Vec::new(),
        }
    }

    /// The standard chain described by `config`:
    /// persistence, rate limit, cache, then the configured upstreams.
    ///
    /// Persistence runs outermost so cache hits and admission failures are
    /// still recorded against the chat. Each `[providers.<name>]` entry gets
    /// its own upstream behind a [`ProviderRouter`], so a failed-over
    /// request reaches the fallback provider's endpoint. All upstreams share
    /// one semaphore of `concurrency.max_upstream` slots. Providers without
    /// a resolvable base URL are skipped with a warning.
    pub fn from_config(config: &GatewayConfig, collaborators: Collaborators) -> Result<Self> {
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max_upstream)?);
        let mut router = ProviderRouter::new().with_registry(collaborators.registry.clone());
        for (name, provider) in &config.providers {
            let client = reqwest::Client::builder()
                .timeout(provider.timeout())
                .build()?;
            let fetch = Arc::new(CachedFetch::new(
                client,
                semaphore.clone(),
                config.cache.clone(),
            ));
            match OpenAiCompatibleModel::from_config(name, provider, fetch) {
                Ok(model) => router = router.add(name.as_str(), Arc::new(model)),
                Err(e) => warn!(provider = %name, error = %e, "skipping upstream provider"),
            }
        }
        if router.is_empty() {
            return Err(BifrostError::Configuration(
                "no upstream provider has a base URL".to_string(),
            ));
        }

        let cache = Arc::new(ResponseCache::new(
            &config.cache,
            collaborators.network_cache,
        ));
        let cache_middleware = config.cache.enabled.then(|| {
            Arc::new(
                CacheMiddleware::new(config.cache.clone(), cache)
                    .with_registry(collaborators.registry.clone()),
            ) as Arc<dyn Middleware>
        });

        info!(
            providers = ?router.providers(),
            max_upstream = config.concurrency.max_upstream,
            cache = config.cache.enabled,
            "assembling model chain"
        );
        Ok(Self::new(Arc::new(router))
            .with(Arc::new(PersistenceMiddleware::new(
                collaborators.chat_store,
                config.persistence.clone(),
            )))
            .with(Arc::new(RateLimitMiddleware::new(
                collaborators.registry,
                collaborators.queue,
                config.rate_limit.clone(),
            )))
            .with_optional(cache_middleware))
    }

    /// Append a middleware.
    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Append a middleware if present.
    pub fn with_optional(self, middleware: Option<Arc<dyn Middleware>>) -> Self {
        match middleware {
            Some(m) => self.with(m),
            None => self,
        }
    }

    /// Build the chain.
    ///
    /// Fails if two middleware share an id, since state entries are keyed
    /// by id.
    pub fn build(self) -> Result<ModelChain> {
        let mut seen = std::collections::HashSet::new();
        for m in &self.middleware {
            if !seen.insert(m.id().to_string()) {
                return Err(BifrostError::Configuration(format!(
                    "duplicate middleware id: {}",
                    m.id()
                )));
            }
        }
        Ok(ModelChain::new(self.middleware, self.model))
    }
}
