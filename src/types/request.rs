//! Request variants accepted by a model chain.

use super::params::GenerateParams;
use crate::state::{COLLECT_SENTINEL, RESTORE_SENTINEL, StateData};

/// What a caller asks a chain to do.
///
/// Control-plane variants never reach the upstream provider.
#[derive(Debug, Clone)]
pub enum ModelRequest {
    /// A real generation request.
    Generate(GenerateParams),
    /// Snapshot every state-aware middleware.
    CollectState,
    /// Restore middleware state from a previous collection. `None` means the
    /// caller supplied no state data.
    RestoreState(Option<StateData>),
}

impl ModelRequest {
    /// Map the prompt-sentinel wire form onto a variant.
    ///
    /// A prompt consisting of exactly the `COLLECT` or `RESTORE` sentinel is
    /// a control message; `state` is the auxiliary channel carrying restore
    /// data.
    pub fn from_prompt(params: GenerateParams, state: Option<StateData>) -> Self {
        match params.single_prompt_text().map(str::trim) {
            Some(COLLECT_SENTINEL) => ModelRequest::CollectState,
            Some(RESTORE_SENTINEL) => ModelRequest::RestoreState(state),
            _ => ModelRequest::Generate(params),
        }
    }

    /// Whether this request is a control-plane message.
    pub fn is_control(&self) -> bool {
        !matches!(self, ModelRequest::Generate(_))
    }
}

impl From<GenerateParams> for ModelRequest {
    fn from(params: GenerateParams) -> Self {
        ModelRequest::Generate(params)
    }
}
