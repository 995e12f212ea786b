//! Provider/model registry: canonicalises provider and model identifiers.
//!
//! The registry resolves the many spellings a model can arrive under into a
//! [`NormalizedModel`]:
//!
//! - provider aliases (`"azure.chat"`, `"azure-openai.chat"`) map to one
//!   canonical provider name (`"azure"`)
//! - model identifiers may be a bare name (`"gpt-4.1"`), a deployment id,
//!   a `provider:model` pair or a `providerId:modelName` compound key
//!
//! # Loading
//!
//! Records come from a [`RegistryStore`]. They are loaded lazily on the
//! first lookup and kept for the lifetime of the registry instance;
//! [`ModelRegistry::reset()`] drops them so the next lookup reloads (hot
//! reload, tests). The default store is the JSON seed compiled into the
//! binary.
//!
//! # Soft lookup, explicit rethrow
//!
//! [`ModelRegistry::normalize()`] never fails on unknown identifiers; fields
//! it could not resolve are `None`. Callers that need a hard failure call
//! [`NormalizedModel::rethrow()`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{BifrostError, Result};

/// A provider and the aliases it is known by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// Stable provider id (e.g. `"prov-azure"`).
    pub id: String,
    /// Canonical provider name (e.g. `"azure"`).
    pub name: String,
    /// Alternative names that resolve to this provider.
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// A model offered by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Stable model id.
    pub id: String,
    /// Id of the owning [`ProviderRecord`].
    pub provider_id: String,
    /// Model name as used in requests (e.g. `"gpt-4.1"`).
    pub name: String,
    /// Provider-side deployment identifier, if different from `name`.
    #[serde(default)]
    pub deployment_id: Option<String>,
    /// Human-readable name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Whether the model is currently offered.
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Token ceilings registered for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// Maximum tokens in a single message.
    #[serde(default)]
    pub max_tokens_per_message: Option<u64>,
    /// Maximum tokens per rolling minute.
    #[serde(default)]
    pub max_tokens_per_minute: Option<u64>,
    /// Maximum tokens per day.
    #[serde(default)]
    pub max_tokens_per_day: Option<u64>,
}

impl QuotaRecord {
    /// Create a quota record.
    pub fn new(per_message: Option<u64>, per_minute: Option<u64>, per_day: Option<u64>) -> Self {
        Self {
            max_tokens_per_message: per_message,
            max_tokens_per_minute: per_minute,
            max_tokens_per_day: per_day,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct QuotaEntry {
    model_id: String,
    #[serde(flatten)]
    quota: QuotaRecord,
}

/// Everything a [`RegistryStore`] returns in one load.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub providers: Vec<ProviderRecord>,
    #[serde(default)]
    pub models: Vec<ModelRecord>,
    #[serde(default, deserialize_with = "deserialize_quotas")]
    pub quotas: HashMap<String, QuotaRecord>,
}

fn deserialize_quotas<'de, D>(
    deserializer: D,
) -> std::result::Result<HashMap<String, QuotaRecord>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let entries = Vec::<QuotaEntry>::deserialize(deserializer)?;
    Ok(entries.into_iter().map(|e| (e.model_id, e.quota)).collect())
}

/// Backing store for registry records.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Load all provider, model and quota records.
    async fn load(&self) -> Result<RegistrySnapshot>;
}

/// Store backed by the JSON seed compiled into the binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeedStore;

/// Raw JSON seed data compiled into the binary.
const EMBEDDED_SEED: &str = include_str!("seed.json");

#[async_trait]
impl RegistryStore for SeedStore {
    async fn load(&self) -> Result<RegistrySnapshot> {
        Ok(serde_json::from_str(EMBEDDED_SEED)?)
    }
}

/// Store returning a fixed snapshot (config files, tests).
#[derive(Debug, Clone, Default)]
pub struct StaticStore {
    snapshot: RegistrySnapshot,
}

impl StaticStore {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl RegistryStore for StaticStore {
    async fn load(&self) -> Result<RegistrySnapshot> {
        Ok(self.snapshot.clone())
    }
}

/// Result of [`ModelRegistry::normalize()`]. Any field may be `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedModel {
    /// Canonical provider name.
    pub provider: Option<String>,
    /// Stable provider id.
    pub provider_id: Option<String>,
    /// Model name.
    pub model_name: Option<String>,
    /// Stable model id.
    pub model_id: Option<String>,
    /// Provider identifier as supplied by the caller.
    pub requested_provider: String,
    /// `providerId:modelName` key tried during model lookup.
    pub attempted_key: String,
}

impl NormalizedModel {
    /// Turn an unresolved lookup into an error.
    ///
    /// No-op when both provider and model resolved.
    pub fn rethrow(&self) -> Result<()> {
        if self.provider_id.is_none() {
            return Err(BifrostError::ProviderNotFound {
                provider: self.requested_provider.clone(),
            });
        }
        if self.model_id.is_none() {
            return Err(BifrostError::ModelNotFound {
                key: self.attempted_key.clone(),
            });
        }
        Ok(())
    }

    /// Whether both provider and model resolved.
    pub fn is_resolved(&self) -> bool {
        self.provider_id.is_some() && self.model_id.is_some()
    }

    /// Canonical `provider:model` key, when resolved.
    pub fn key(&self) -> Option<String> {
        match (&self.provider, &self.model_name) {
            (Some(p), Some(m)) => Some(format!("{p}:{m}")),
            _ => None,
        }
    }
}

/// Indexed view over one loaded snapshot.
#[derive(Debug, Default)]
struct RegistryIndex {
    /// Lower-cased name, id and aliases → provider.
    providers: HashMap<String, ProviderRecord>,
    /// `(provider_id, identifier)` → model, where identifier is the model's
    /// name, id or deployment id.
    models: HashMap<(String, String), ModelRecord>,
    /// Models by id.
    models_by_id: HashMap<String, ModelRecord>,
    quotas: HashMap<String, QuotaRecord>,
}

impl RegistryIndex {
    fn build(snapshot: RegistrySnapshot) -> Self {
        let mut index = Self::default();
        for provider in snapshot.providers {
            let names = [provider.name.clone(), provider.id.clone()]
                .into_iter()
                .chain(provider.aliases.iter().cloned());
            for name in names {
                index
                    .providers
                    .insert(name.to_ascii_lowercase(), provider.clone());
            }
        }
        for model in snapshot.models {
            let pid = model.provider_id.clone();
            let identifiers = [
                Some(model.name.clone()),
                Some(model.id.clone()),
                model.deployment_id.clone(),
            ];
            for ident in identifiers.into_iter().flatten() {
                index.models.insert((pid.clone(), ident), model.clone());
            }
            index.models_by_id.insert(model.id.clone(), model);
        }
        index.quotas = snapshot.quotas;
        index
    }

    fn provider(&self, name: &str) -> Option<&ProviderRecord> {
        self.providers.get(&name.trim().to_ascii_lowercase())
    }

    fn model(&self, provider_id: &str, ident: &str) -> Option<&ModelRecord> {
        self.models
            .get(&(provider_id.to_string(), ident.to_string()))
            .or_else(|| {
                // Identifiers are case-insensitive as a fallback.
                let lowered = ident.to_ascii_lowercase();
                self.models
                    .iter()
                    .find(|((pid, id), _)| pid == provider_id && id.to_ascii_lowercase() == lowered)
                    .map(|(_, m)| m)
            })
    }
}

/// Registry of providers, models and quotas.
///
/// Instances are cheap to share behind an `Arc`; lookups take a read lock
/// on the loaded index.
pub struct ModelRegistry {
    store: Arc<dyn RegistryStore>,
    index: RwLock<Option<Arc<RegistryIndex>>>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::with_embedded_seed()
    }
}

impl ModelRegistry {
    /// Create a registry over the given store. Nothing is loaded yet.
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            index: RwLock::new(None),
        }
    }

    /// Registry backed by the compiled-in seed.
    pub fn with_embedded_seed() -> Self {
        Self::new(Arc::new(SeedStore))
    }

    /// Registry over a fixed snapshot.
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        Self::new(Arc::new(StaticStore::new(snapshot)))
    }

    async fn index(&self) -> Result<Arc<RegistryIndex>> {
        if let Some(index) = self.index.read().await.as_ref() {
            return Ok(index.clone());
        }
        let mut guard = self.index.write().await;
        if let Some(index) = guard.as_ref() {
            return Ok(index.clone());
        }
        let snapshot = self.store.load().await?;
        info!(
            providers = snapshot.providers.len(),
            models = snapshot.models.len(),
            "registry loaded"
        );
        let index = Arc::new(RegistryIndex::build(snapshot));
        *guard = Some(index.clone());
        Ok(index)
    }

    /// Drop loaded records; the next lookup reloads from the store.
    pub async fn reset(&self) {
        *self.index.write().await = None;
    }

    /// Whether records are currently loaded.
    pub async fn is_loaded(&self) -> bool {
        self.index.read().await.is_some()
    }

    /// Resolve a provider (or alias) and model identifier.
    ///
    /// Only store failures are returned as errors; unresolved identifiers
    /// produce `None` fields. See [`NormalizedModel::rethrow()`].
    pub async fn normalize(&self, provider_or_alias: &str, model: &str) -> Result<NormalizedModel> {
        let index = self.index().await?;

        let mut requested_provider = provider_or_alias.trim().to_string();
        let mut provider = index.provider(&requested_provider).cloned();
        let mut model_ident = model.trim().to_string();

        // `provider:model` and `providerId:modelName` forms carry their own provider.
        if let Some((prefix, rest)) = model_ident.split_once(':')
            && let Some(prefixed) = index.provider(prefix)
        {
            if provider.is_none() {
                requested_provider = prefix.to_string();
            }
            provider = Some(prefixed.clone());
            model_ident = rest.to_string();
        }

        let Some(provider) = provider else {
            debug!(provider = %requested_provider, model = %model_ident, "provider not resolved");
            return Ok(NormalizedModel {
                provider: None,
                provider_id: None,
                model_name: None,
                model_id: None,
                attempted_key: format!("{requested_provider}:{model_ident}"),
                requested_provider,
            });
        };

        let attempted_key = format!("{}:{}", provider.id, model_ident);
        let record = index.model(&provider.id, &model_ident);
        if record.is_none() {
            debug!(key = %attempted_key, "model not resolved");
        }
        Ok(NormalizedModel {
            provider: Some(provider.name.clone()),
            provider_id: Some(provider.id.clone()),
            model_name: record.map(|m| m.name.clone()),
            model_id: record.map(|m| m.id.clone()),
            requested_provider,
            attempted_key,
        })
    }

    /// Canonical `provider:model` key, falling back to the raw identifiers
    /// when the pair does not resolve.
    pub async fn model_key(&self, provider_or_alias: &str, model: &str) -> Result<String> {
        let normalized = self.normalize(provider_or_alias, model).await?;
        Ok(normalized
            .key()
            .unwrap_or_else(|| format!("{provider_or_alias}:{model}")))
    }

    /// Look up a provider by name, id or alias.
    pub async fn get_provider(&self, name: &str) -> Result<Option<ProviderRecord>> {
        Ok(self.index().await?.provider(name).cloned())
    }

    /// Look up a model by its stable id.
    pub async fn get_model(&self, model_id: &str) -> Result<Option<ModelRecord>> {
        Ok(self.index().await?.models_by_id.get(model_id).cloned())
    }

    /// All models, optionally only the active ones. Sorted by id.
    pub async fn list_models(&self, active_only: bool) -> Result<Vec<ModelRecord>> {
        let index = self.index().await?;
        let mut models: Vec<_> = index
            .models_by_id
            .values()
            .filter(|m| !active_only || m.active)
            .cloned()
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }

    /// Token ceilings for a model, or `None` if none are registered.
    pub async fn get_quota_by_model_id(&self, model_id: &str) -> Result<Option<QuotaRecord>> {
        Ok(self.index().await?.quotas.get(model_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn embedded_seed_parses() {
        let snapshot: RegistrySnapshot = serde_json::from_str(EMBEDDED_SEED).unwrap();
        assert!(!snapshot.providers.is_empty());
        assert!(!snapshot.models.is_empty());
        assert!(snapshot.quotas.contains_key("mdl-azure-gpt-4.1"));
    }

    #[tokio::test]
    async fn alias_resolves_to_canonical_provider() {
        let registry = ModelRegistry::with_embedded_seed();
        let n = registry.normalize("azure-openai.chat", "gpt-4.1").await.unwrap();
        assert_eq!(n.provider.as_deref(), Some("azure"));
        assert_eq!(n.model_id.as_deref(), Some("mdl-azure-gpt-4.1"));
        assert!(n.rethrow().is_ok());
        assert_eq!(n.key().as_deref(), Some("azure:gpt-4.1"));
    }

    #[tokio::test]
    async fn deployment_id_resolves() {
        let registry = ModelRegistry::with_embedded_seed();
        let n = registry.normalize("azure.chat", "gpt-4.1-mini-prod").await.unwrap();
        assert_eq!(n.model_name.as_deref(), Some("gpt-4.1-mini"));
    }

    #[tokio::test]
    async fn prefixed_model_identifiers_carry_provider() {
        let registry = ModelRegistry::with_embedded_seed();

        let n = registry.normalize("", "openai:gpt-4.1").await.unwrap();
        assert_eq!(n.provider.as_deref(), Some("openai"));
        assert_eq!(n.model_id.as_deref(), Some("mdl-openai-gpt-4.1"));

        let n = registry.normalize("", "prov-azure:gpt-4.1").await.unwrap();
        assert_eq!(n.provider.as_deref(), Some("azure"));
        assert_eq!(n.model_id.as_deref(), Some("mdl-azure-gpt-4.1"));
    }

    #[tokio::test]
    async fn unknown_provider_rethrows_provider_not_found() {
        let registry = ModelRegistry::with_embedded_seed();
        let n = registry.normalize("unknown-provider", "x").await.unwrap();
        assert!(n.provider.is_none());
        assert!(matches!(
            n.rethrow(),
            Err(BifrostError::ProviderNotFound { provider }) if provider == "unknown-provider"
        ));
    }

    #[tokio::test]
    async fn unknown_model_rethrows_model_not_found_with_key() {
        let registry = ModelRegistry::with_embedded_seed();
        let n = registry.normalize("azure-openai.chat", "nope").await.unwrap();
        assert_eq!(n.provider.as_deref(), Some("azure"));
        assert!(matches!(
            n.rethrow(),
            Err(BifrostError::ModelNotFound { key }) if key == "prov-azure:nope"
        ));
    }

    #[tokio::test]
    async fn quota_lookup() {
        let registry = ModelRegistry::with_embedded_seed();
        let quota = registry
            .get_quota_by_model_id("mdl-azure-gpt-4.1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(quota.max_tokens_per_minute, Some(450_000));
        assert!(
            registry
                .get_quota_by_model_id("mdl-anthropic-sonnet")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn list_models_filters_inactive() {
        let registry = ModelRegistry::with_embedded_seed();
        let all = registry.list_models(false).await.unwrap();
        let active = registry.list_models(true).await.unwrap();
        assert_eq!(all.len(), active.len() + 1);
    }

    struct CountingStore(AtomicUsize);

    #[async_trait]
    impl RegistryStore for CountingStore {
        async fn load(&self) -> Result<RegistrySnapshot> {
            self.0.fetch_add(1, Ordering::SeqCst);
            SeedStore.load().await
        }
    }

    #[tokio::test]
    async fn loads_lazily_once_until_reset() {
        let store = Arc::new(CountingStore(AtomicUsize::new(0)));
        let registry = ModelRegistry::new(store.clone());
        assert!(!registry.is_loaded().await);

        registry.normalize("azure", "gpt-4.1").await.unwrap();
        registry.normalize("openai", "gpt-4.1").await.unwrap();
        assert_eq!(store.0.load(Ordering::SeqCst), 1);

        registry.reset().await;
        assert!(!registry.is_loaded().await);
        registry.normalize("azure", "gpt-4.1").await.unwrap();
        assert_eq!(store.0.load(Ordering::SeqCst), 2);
    }
}
