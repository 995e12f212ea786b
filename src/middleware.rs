//! The in-process middleware contract.
//!
//! A middleware sits between callers and a [`LanguageModel`]. For every
//! request it may:
//!
//! 1. transform the parameters before they travel further
//!    ([`Middleware::transform_params`])
//! 2. short-circuit without calling [`Next`] (rate limit, cache hit)
//! 3. wrap the result of [`Next`] to observe or react to it (cache
//!    write-back, persistence, assembly)
//!
//! Middleware that keeps per-process state opts into the state protocol
//! (see [`crate::state`]) by returning `true` from
//! [`Middleware::is_state_aware`] and, optionally, implementing
//! [`Middleware::collect_state`] / [`Middleware::restore_state`].
//!
//! # Streams outlive the call
//!
//! A [`PartStream`] is `'static`, so a middleware that wraps one must move
//! owned (typically `Arc`-shared) state into the wrapper rather than
//! borrowing `self`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::traits::LanguageModel;
use crate::types::{GenerateParams, GenerateResult, ModelHandle, PartStream};

/// One link in a model chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stable id, used as the key of this middleware's state entry.
    fn id(&self) -> &str;

    /// Rewrite parameters before [`wrap_generate`](Self::wrap_generate) /
    /// [`wrap_stream`](Self::wrap_stream) see them.
    async fn transform_params(
        &self,
        _handle: &ModelHandle,
        params: GenerateParams,
    ) -> Result<GenerateParams> {
        Ok(params)
    }

    /// Wrap a non-streaming call. Default: forward.
    async fn wrap_generate(
        &self,
        _handle: &ModelHandle,
        params: GenerateParams,
        next: Next<'_>,
    ) -> Result<GenerateResult> {
        next.generate(params).await
    }

    /// Wrap a streaming call. Default: forward.
    async fn wrap_stream(
        &self,
        _handle: &ModelHandle,
        params: GenerateParams,
        next: Next<'_>,
    ) -> Result<PartStream> {
        next.stream(params).await
    }

    /// Whether this middleware takes part in state collection.
    fn is_state_aware(&self) -> bool {
        false
    }

    /// Snapshot of private state. `None` reports `{"present": true}`.
    fn collect_state(&self) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }

    /// Replace private state with a snapshot from [`collect_state`](Self::collect_state).
    fn restore_state(&self, _state: &serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Continuation to the rest of the chain.
///
/// Consumed by value: each middleware continues the chain at most once.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    model: &'a dyn LanguageModel,
    handle: &'a ModelHandle,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        remaining: &'a [Arc<dyn Middleware>],
        model: &'a dyn LanguageModel,
        handle: &'a ModelHandle,
    ) -> Self {
        Self {
            remaining,
            model,
            handle,
        }
    }

    /// Run the rest of the chain as a non-streaming call.
    pub async fn generate(self, params: GenerateParams) -> Result<GenerateResult> {
        match self.remaining.split_first() {
            Some((middleware, rest)) => {
                let params = middleware.transform_params(self.handle, params).await?;
                let next = Next::new(rest, self.model, self.handle);
                middleware.wrap_generate(self.handle, params, next).await
            }
            None => self.model.do_generate(self.handle, params).await,
        }
    }

    /// Run the rest of the chain as a streaming call.
    pub async fn stream(self, params: GenerateParams) -> Result<PartStream> {
        match self.remaining.split_first() {
            Some((middleware, rest)) => {
                let params = middleware.transform_params(self.handle, params).await?;
                let next = Next::new(rest, self.model, self.handle);
                middleware.wrap_stream(self.handle, params, next).await
            }
            None => self.model.do_stream(self.handle, params).await,
        }
    }

    /// Ids of the middleware still ahead, in order.
    pub fn remaining_ids(&self) -> Vec<&str> {
        self.remaining.iter().map(|m| m.id()).collect()
    }
}
