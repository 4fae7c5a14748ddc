//! Workflow signals for external communication

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// External notification delivered to a workflow instance
///
/// Signals are appended to history as soon as they arrive and stay buffered
/// until a matching `wait_signal` consumes them, in arrival order.
///
/// # Example
///
/// ```ignore
/// engine.signal(instance_id, "approval", json!({"approved": true})).await?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    /// Signal name
    pub name: String,

    /// Signal payload (JSON)
    pub payload: serde_json::Value,

    /// When the signal was sent
    pub sent_at: DateTime<Utc>,
}

impl WorkflowSignal {
    /// Create a new signal
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Decode the payload
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
