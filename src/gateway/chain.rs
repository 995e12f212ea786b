//! Chain runner.
//!
//! A [`ModelChain`] holds middleware in registration order and folds
//! [`Next`] continuations over them, ending at the [`LanguageModel`]. Order
//! is fixed at build time, so cross-middleware side effects (rate-limit
//! check before cache lookup, say) are the same for every request.
//!
//! Control-plane requests ([`ModelRequest::CollectState`],
//! [`ModelRequest::RestoreState`]) are answered by the chain itself and never
//! reach the provider.

use std::sync::Arc;

use futures_util::stream;
use tracing::{debug, instrument, warn};

use super::builder::ChainBuilder;
use crate::middleware::{Middleware, Next};
use crate::state::{
    self, RESTORE_CONFIRMATION, RESTORE_MISSING_STATE, StateData, StateEntry, StateValue,
};
use crate::traits::LanguageModel;
use crate::Result;
use crate::types::{GenerateResult, ModelHandle, ModelRequest, PartStream, StreamPart};

/// Ordered middleware over a terminal model call.
pub struct ModelChain {
    middleware: Vec<Arc<dyn Middleware>>,
    model: Arc<dyn LanguageModel>,
}

impl ModelChain {
    pub(crate) fn new(
        middleware: Vec<Arc<dyn Middleware>>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        Self { middleware, model }
    }

    /// Start building a chain over `model`.
    pub fn builder(model: Arc<dyn LanguageModel>) -> ChainBuilder {
        ChainBuilder::new(model)
    }

    /// Middleware ids in execution order.
    pub fn middleware_ids(&self) -> Vec<&str> {
        self.middleware.iter().map(|m| m.id()).collect()
    }

    fn next<'a>(&'a self, handle: &'a ModelHandle) -> Next<'a> {
        Next::new(&self.middleware, self.model.as_ref(), handle)
    }

    /// Non-streaming request through the chain.
    #[instrument(
        name = "chain.generate",
        skip(self, request),
        fields(provider = %handle.provider, model = %handle.model_id, class = %handle.model_class)
    )]
    pub async fn generate(
        &self,
        handle: &ModelHandle,
        request: impl Into<ModelRequest>,
    ) -> Result<GenerateResult> {
        match request.into() {
            ModelRequest::Generate(params) => self.next(handle).generate(params).await,
            ModelRequest::CollectState => Ok(GenerateResult::from_text(self.collect_text()?)),
            ModelRequest::RestoreState(data) => {
                Ok(GenerateResult::from_text(self.restore_text(data)))
            }
        }
    }

    /// Streaming request through the chain.
    #[instrument(
        name = "chain.stream",
        skip(self, request),
        fields(provider = %handle.provider, model = %handle.model_id, class = %handle.model_class)
    )]
    pub async fn stream(
        &self,
        handle: &ModelHandle,
        request: impl Into<ModelRequest>,
    ) -> Result<PartStream> {
        match request.into() {
            ModelRequest::Generate(params) => self.next(handle).stream(params).await,
            ModelRequest::CollectState => Ok(text_stream(self.collect_text()?)),
            ModelRequest::RestoreState(data) => Ok(text_stream(self.restore_text(data))),
        }
    }

    fn collect_text(&self) -> Result<String> {
        state::encode_entries(&self.collect_state()?)
    }

    /// Restore outcome as response text. Failures become a payload, never
    /// an error.
    fn restore_text(&self, data: Option<StateData>) -> String {
        let Some(data) = data else {
            warn!("restore requested without state data");
            return RESTORE_MISSING_STATE.to_string();
        };
        match self.restore_state(&data) {
            Ok(restored) => {
                debug!(restored, "middleware state restored");
                RESTORE_CONFIRMATION.to_string()
            }
            Err(e) => {
                warn!(error = %e, "middleware state restore failed");
                serde_json::json!({"restored": false, "error": e.to_string()}).to_string()
            }
        }
    }

    /// Collect `[middlewareId, state]` entries from state-aware middleware,
    /// in chain order.
    pub fn collect_state(&self) -> Result<Vec<StateEntry>> {
        let mut entries = Vec::new();
        for middleware in self.middleware.iter().filter(|m| m.is_state_aware()) {
            let value = match middleware.collect_state()? {
                Some(snapshot) => StateValue::Snapshot(snapshot),
                None => StateValue::present(),
            };
            entries.push(StateEntry(middleware.id().to_string(), value));
        }
        Ok(entries)
    }

    /// Hand each state-aware middleware its entry from `data`.
    ///
    /// Returns the number of middleware whose state was replaced. Entries
    /// without a snapshot, and middleware without an entry, are skipped.
    pub fn restore_state(&self, data: &StateData) -> Result<usize> {
        let mut restored = 0;
        for middleware in self.middleware.iter().filter(|m| m.is_state_aware()) {
            if let Some(snapshot) = data.get(middleware.id()).and_then(StateValue::snapshot) {
                middleware.restore_state(snapshot)?;
                restored += 1;
            }
        }
        Ok(restored)
    }
}

fn text_stream(text: String) -> PartStream {
    let parts = StreamPart::text_parts("control", text);
    Box::pin(stream::iter(parts.into_iter().map(Ok)))
}
