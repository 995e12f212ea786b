//! Middleware state collection/restoration protocol.
//!
//! A [`ModelRequest::CollectState`](crate::types::ModelRequest) asks every
//! state-aware middleware in a chain for a snapshot. The chain answers with
//! a JSON list of `[middlewareId, state]` pairs as the response text:
//!
//! ```json
//! [["rate-limit", {"windows": {...}}], ["audit", {"present": true}]]
//! ```
//!
//! Middleware without a custom serializer reports `{"present": true}` so
//! chain composition stays introspectable. Feeding the same list back as
//! [`StateData`] in a `RestoreState` request replaces each middleware's
//! private state, possibly on another process.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Prompt sentinel for a state collection request.
pub const COLLECT_SENTINEL: &str = "COLLECT";

/// Prompt sentinel for a state restoration request.
pub const RESTORE_SENTINEL: &str = "RESTORE";

/// Response text confirming a restore.
pub const RESTORE_CONFIRMATION: &str = r#"{"restored":true}"#;

/// Response text for a restore request that carried no state data.
pub const RESTORE_MISSING_STATE: &str =
    r#"{"restored":false,"error":"no state data supplied"}"#;

/// The `{"present": true}` marker. Any other field makes the object a
/// snapshot instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Presence {
    pub present: bool,
}

/// State reported by one middleware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    /// State-aware middleware with no serializer.
    Present(Presence),
    /// Serialized private state.
    Snapshot(serde_json::Value),
}

impl StateValue {
    pub fn present() -> Self {
        StateValue::Present(Presence { present: true })
    }

    /// The snapshot payload, if this entry carries one.
    pub fn snapshot(&self) -> Option<&serde_json::Value> {
        match self {
            StateValue::Snapshot(v) => Some(v),
            StateValue::Present(_) => None,
        }
    }
}

/// One `[middlewareId, state]` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry(pub String, pub StateValue);

impl StateEntry {
    pub fn middleware_id(&self) -> &str {
        &self.0
    }

    pub fn state(&self) -> &StateValue {
        &self.1
    }
}

/// Collected entries indexed by middleware id, for restoration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateData {
    entries: HashMap<String, StateValue>,
}

impl StateData {
    pub fn from_entries(entries: impl IntoIterator<Item = StateEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|StateEntry(id, v)| (id, v)).collect(),
        }
    }

    /// Parse the response text of a collection request.
    pub fn parse(text: &str) -> Result<Self> {
        let entries: Vec<StateEntry> = serde_json::from_str(text)?;
        Ok(Self::from_entries(entries))
    }

    pub fn get(&self, middleware_id: &str) -> Option<&StateValue> {
        self.entries.get(middleware_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Serialize collected entries as response text.
pub fn encode_entries(entries: &[StateEntry]) -> Result<String> {
    Ok(serde_json::to_string(entries)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entries_serialize_as_pairs() {
        let entries = vec![
            StateEntry("cache".into(), StateValue::Snapshot(json!({"hits": 2}))),
            StateEntry("audit".into(), StateValue::present()),
        ];
        let text = encode_entries(&entries).unwrap();
        assert_eq!(text, r#"[["cache",{"hits":2}],["audit",{"present":true}]]"#);

        let data = StateData::parse(&text).unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.get("cache").unwrap().snapshot(), Some(&json!({"hits": 2})));
        assert_eq!(data.get("audit"), Some(&StateValue::present()));
    }

    #[test]
    fn snapshot_with_a_present_field_stays_a_snapshot() {
        let data = StateData::parse(r#"[["flags",{"present":false,"seen":3}]]"#).unwrap();
        assert_eq!(
            data.get("flags").unwrap().snapshot(),
            Some(&json!({"present": false, "seen": 3}))
        );
    }

    #[test]
    fn malformed_state_text_is_an_error() {
        assert!(StateData::parse("not json").is_err());
    }
}
