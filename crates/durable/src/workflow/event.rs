//! History events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Command, WorkflowError, WorkflowSignal};
use crate::activity::ActivityError;

/// Kinds of rows in the `workflow_history` table
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // =========================================================================
    // Step Events
    // =========================================================================
    /// A command reached the frontier and was dispatched
    CommandIssued,

    /// Activity returned a result
    ActivityCompleted,

    /// Activity failed permanently (retries exhausted)
    ActivityFailed,

    /// Timer due time elapsed
    TimerFired,

    /// Side effect value captured on first execution
    SideEffectRecorded,

    // =========================================================================
    // Signal Events
    // =========================================================================
    /// External signal was received
    SignalReceived,

    // =========================================================================
    // Terminal Markers
    // =========================================================================
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCanceled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommandIssued => "command_issued",
            Self::ActivityCompleted => "activity_completed",
            Self::ActivityFailed => "activity_failed",
            Self::TimerFired => "timer_fired",
            Self::SideEffectRecorded => "side_effect_recorded",
            Self::SignalReceived => "signal_received",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowFailed => "workflow_failed",
            Self::WorkflowCanceled => "workflow_canceled",
        }
    }

    /// Parse the stored representation
    pub fn parse(s: &str) -> Option<Self> {
        let event_type = match s {
            "command_issued" => Self::CommandIssued,
            "activity_completed" => Self::ActivityCompleted,
            "activity_failed" => Self::ActivityFailed,
            "timer_fired" => Self::TimerFired,
            "side_effect_recorded" => Self::SideEffectRecorded,
            "signal_received" => Self::SignalReceived,
            "workflow_completed" => Self::WorkflowCompleted,
            "workflow_failed" => Self::WorkflowFailed,
            "workflow_canceled" => Self::WorkflowCanceled,
            _ => return None,
        };
        Some(event_type)
    }

    /// Events that record the command for a step (one per step)
    pub fn is_step_issue(&self) -> bool {
        matches!(self, Self::CommandIssued | Self::SideEffectRecorded)
    }

    /// Events that resolve an issued command (one per step)
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            Self::ActivityCompleted | Self::ActivityFailed | Self::TimerFired
        )
    }

    /// Check if this is a terminal workflow event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted | Self::WorkflowFailed | Self::WorkflowCanceled
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event about to be appended; the store assigns sequence and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub step_index: Option<u32>,
    pub command: Option<Command>,
    pub signal: Option<WorkflowSignal>,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
}

impl NewEvent {
    fn bare(event_type: EventType) -> Self {
        Self {
            event_type,
            step_index: None,
            command: None,
            signal: None,
            result: None,
            error: None,
        }
    }

    pub fn command_issued(step_index: u32, command: Command) -> Self {
        Self {
            step_index: Some(step_index),
            command: Some(command),
            ..Self::bare(EventType::CommandIssued)
        }
    }

    pub fn activity_completed(step_index: u32, result: serde_json::Value) -> Self {
        Self {
            step_index: Some(step_index),
            result: Some(result),
            ..Self::bare(EventType::ActivityCompleted)
        }
    }

    pub fn activity_failed(step_index: u32, error: &ActivityError) -> Self {
        Self {
            step_index: Some(step_index),
            error: serde_json::to_value(error).ok(),
            ..Self::bare(EventType::ActivityFailed)
        }
    }

    pub fn timer_fired(step_index: u32) -> Self {
        Self {
            step_index: Some(step_index),
            ..Self::bare(EventType::TimerFired)
        }
    }

    pub fn side_effect_recorded(step_index: u32, value: serde_json::Value) -> Self {
        Self {
            step_index: Some(step_index),
            command: Some(Command::side_effect()),
            result: Some(value),
            ..Self::bare(EventType::SideEffectRecorded)
        }
    }

    pub fn signal_received(signal: WorkflowSignal) -> Self {
        Self {
            signal: Some(signal),
            ..Self::bare(EventType::SignalReceived)
        }
    }

    pub fn workflow_completed(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::bare(EventType::WorkflowCompleted)
        }
    }

    pub fn workflow_failed(error: &WorkflowError) -> Self {
        Self {
            error: serde_json::to_value(error).ok(),
            ..Self::bare(EventType::WorkflowFailed)
        }
    }

    pub fn workflow_canceled(reason: &WorkflowError) -> Self {
        Self {
            error: serde_json::to_value(reason).ok(),
            ..Self::bare(EventType::WorkflowCanceled)
        }
    }

    /// Materialize with the store-assigned position
    pub fn into_event(
        self,
        instance_id: Uuid,
        sequence_number: i64,
        recorded_at: DateTime<Utc>,
    ) -> HistoryEvent {
        HistoryEvent {
            instance_id,
            sequence_number,
            event_type: self.event_type,
            step_index: self.step_index,
            command: self.command,
            signal: self.signal,
            result: self.result,
            error: self.error,
            recorded_at,
        }
    }
}

/// One row of an instance's append-only history
///
/// Events are immutable once written. Sequence numbers start at 1 and have no
/// gaps within an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    pub instance_id: Uuid,
    pub sequence_number: i64,
    pub event_type: EventType,
    pub step_index: Option<u32>,
    pub command: Option<Command>,
    pub signal: Option<WorkflowSignal>,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEvent {
    /// Error of an `activity_failed` event
    pub fn activity_error(&self) -> Option<ActivityError> {
        let error = self.error.clone()?;
        Some(
            serde_json::from_value(error.clone())
                .unwrap_or_else(|_| ActivityError::non_retryable(error.to_string())),
        )
    }

    /// Error of a `workflow_failed` / `workflow_canceled` event
    pub fn workflow_error(&self) -> Option<WorkflowError> {
        let error = self.error.clone()?;
        Some(
            serde_json::from_value(error.clone())
                .unwrap_or_else(|_| WorkflowError::new(error.to_string())),
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_string_roundtrip() {
        for event_type in [
            EventType::CommandIssued,
            EventType::ActivityCompleted,
            EventType::ActivityFailed,
            EventType::TimerFired,
            EventType::SideEffectRecorded,
            EventType::SignalReceived,
            EventType::WorkflowCompleted,
            EventType::WorkflowFailed,
            EventType::WorkflowCanceled,
        ] {
            assert_eq!(EventType::parse(event_type.as_str()), Some(event_type));
        }
        assert_eq!(EventType::parse("unknown"), None);
    }

    #[test]
    fn test_event_type_serde_matches_as_str() {
        let json = serde_json::to_string(&EventType::SideEffectRecorded).unwrap();
        assert_eq!(json, "\"side_effect_recorded\"");
    }

    #[test]
    fn test_step_classification() {
        assert!(EventType::CommandIssued.is_step_issue());
        assert!(EventType::SideEffectRecorded.is_step_issue());
        assert!(EventType::TimerFired.is_resolution());
        assert!(!EventType::SignalReceived.is_resolution());
        assert!(EventType::WorkflowCanceled.is_terminal());
        assert!(!EventType::ActivityFailed.is_terminal());
    }

    #[test]
    fn test_activity_failed_carries_error() {
        let error = ActivityError::non_retryable("boom").with_type("BOOM");
        let event = NewEvent::activity_failed(3, &error).into_event(Uuid::now_v7(), 7, Utc::now());

        assert_eq!(event.step_index, Some(3));
        assert_eq!(event.activity_error(), Some(error));
    }

    #[test]
    fn test_history_event_serialization() {
        let event = NewEvent::activity_completed(0, json!({"id": 123}))
            .into_event(Uuid::now_v7(), 2, Utc::now());

        let json = serde_json::to_string(&event).unwrap();
        let parsed: HistoryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }
}
