//! Signal-driven workflow state

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

/// Key/value state rebuilt on every replay by [`Workflow::handle_signal`]
///
/// It lives only in memory; history is the durable copy.
///
/// [`Workflow::handle_signal`]: super::Workflow::handle_signal
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowState {
    values: Map<String, Value>,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a value, `None` when missing or not decodable as `T`
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Store a value; values that fail to serialize are stored as null
    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_get_set() {
        let mut state = WorkflowState::new();
        assert!(state.is_empty());

        state.set("approvals", 2u32);
        state.set("approver", "ops");

        assert_eq!(state.get::<u32>("approvals"), Some(2));
        assert_eq!(state.get::<String>("approver").as_deref(), Some("ops"));
        assert_eq!(state.get::<u32>("approver"), None);
        assert!(state.contains("approvals"));

        state.remove("approvals");
        assert!(!state.contains("approvals"));
    }
}
