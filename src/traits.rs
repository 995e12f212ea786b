//! Core LanguageModel trait

use async_trait::async_trait;

use crate::Result;
use crate::types::{GenerateParams, GenerateResult, ModelHandle, PartStream};

/// A raw provider call: the terminal step of a middleware chain.
///
/// Implementations honour `params.abort` and, when set, `params.routed_model`
/// in preference to the handle's model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider name for logging/debugging.
    fn name(&self) -> &str;

    /// Non-streaming generation
    async fn do_generate(
        &self,
        handle: &ModelHandle,
        params: GenerateParams,
    ) -> Result<GenerateResult>;

    /// Streaming generation
    async fn do_stream(&self, handle: &ModelHandle, params: GenerateParams) -> Result<PartStream>;
}
