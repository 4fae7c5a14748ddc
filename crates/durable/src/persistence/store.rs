//! HistoryStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::workflow::{ActivityCommand, HistoryEvent, NewEvent, WorkflowError};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Instance not found
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Instance already reached a terminal status
    #[error("workflow instance {0} is terminal")]
    InstanceTerminal(Uuid),

    /// A step already has its command or its resolution recorded
    #[error("step {step_index} of instance {instance_id} is already recorded")]
    DuplicateStep { instance_id: Uuid, step_index: u32 },

    /// Concurrent writers raced on the same row
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Errors a completion path treats as "someone else got there first"
    pub fn is_already_resolved(&self) -> bool {
        matches!(
            self,
            Self::DuplicateStep { .. } | Self::InstanceTerminal(_)
        )
    }
}

/// Instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created, not yet executed
    Created,

    /// An engine run is in progress
    Running,

    /// Waiting on an activity, timer or signal
    Suspended,

    /// Workflow returned successfully
    Completed,

    /// Workflow returned an error
    Failed,

    /// Canceled by a caller
    Canceled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let status = match s {
            "created" => Self::Created,
            "running" => Self::Running,
            "suspended" => Self::Suspended,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot row of `workflow_instance`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub workflow_type: String,
    pub workflow_version: u32,
    pub business_key: Option<String>,
    pub input: serde_json::Value,
    pub status: InstanceStatus,
    pub result: Option<serde_json::Value>,
    pub failure: Option<WorkflowError>,
    pub quarantine_reason: Option<String>,
    /// Signal names the suspended instance is blocked on
    pub awaiting_signals: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn is_quarantined(&self) -> bool {
        self.quarantine_reason.is_some()
    }
}

/// Parameters for a new instance
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub workflow_type: String,
    pub workflow_version: u32,
    pub input: serde_json::Value,
    pub business_key: Option<String>,
}

/// Result of `create_instance`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedInstance {
    pub id: Uuid,
    /// False when a live instance with the same business key was returned
    pub created: bool,
}

/// Terminal outcome written by `finalize`
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceOutcome {
    Completed(serde_json::Value),
    Failed(WorkflowError),
    Canceled(WorkflowError),
}

impl InstanceOutcome {
    pub fn status(&self) -> InstanceStatus {
        match self {
            Self::Completed(_) => InstanceStatus::Completed,
            Self::Failed(_) => InstanceStatus::Failed,
            Self::Canceled(_) => InstanceStatus::Canceled,
        }
    }

    /// Terminal marker event for this outcome
    pub fn marker(&self) -> NewEvent {
        match self {
            Self::Completed(result) => NewEvent::workflow_completed(result.clone()),
            Self::Failed(error) => NewEvent::workflow_failed(error),
            Self::Canceled(reason) => NewEvent::workflow_canceled(reason),
        }
    }
}

/// Durable due-time record of a timer command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRecord {
    pub instance_id: Uuid,
    pub step_index: u32,
    pub fire_at: DateTime<Utc>,
}

/// Task status in the activity queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// An activity command to be queued
#[derive(Debug, Clone)]
pub struct ActivityTask {
    pub instance_id: Uuid,
    pub step_index: u32,
    pub command: ActivityCommand,
}

/// A task that has been claimed by a worker
#[derive(Debug, Clone)]
pub struct ClaimedActivity {
    pub task_id: Uuid,
    pub instance_id: Uuid,
    pub step_index: u32,
    pub command: ActivityCommand,
    /// Attempt being started (1-based)
    pub attempt: u32,
}

impl ClaimedActivity {
    pub fn max_attempts(&self) -> u32 {
        self.command.options.retry_policy.max_attempts()
    }
}

/// Filter for `claim_activities`
#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    /// Queues to claim from
    pub queues: Vec<String>,

    /// Activity types the worker can run (empty = any)
    pub activity_types: Vec<String>,
}

impl ActivityFilter {
    pub fn new(queues: Vec<String>, activity_types: Vec<String>) -> Self {
        Self {
            queues,
            activity_types,
        }
    }

    pub fn accepts(&self, queue_name: &str, activity_type: &str) -> bool {
        self.queues.iter().any(|q| q == queue_name)
            && (self.activity_types.is_empty()
                || self.activity_types.iter().any(|t| t == activity_type))
    }
}

/// Persistence for instances, history, timers and the activity queue
///
/// Implementations must make every multi-event append atomic, allocate
/// gapless sequence numbers per instance, and reject a second issue event or a
/// second resolution event for the same step with [`StoreError::DuplicateStep`].
/// Appending a resolution event, or a signal the instance is waiting for,
/// marks the instance runnable.
#[async_trait]
pub trait HistoryStore: Send + Sync + 'static {
    // =========================================================================
    // Instances
    // =========================================================================

    /// Create an instance, or return the live one with the same business key
    async fn create_instance(&self, new: NewInstance) -> Result<CreatedInstance, StoreError>;

    async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, StoreError>;

    /// Update a non-terminal status and the signals the instance waits on
    ///
    /// Marks the instance runnable when a signal for one of `awaiting_signals`
    /// was appended while the run was in flight.
    async fn set_status(
        &self,
        instance_id: Uuid,
        status: InstanceStatus,
        awaiting_signals: Vec<String>,
    ) -> Result<(), StoreError>;

    /// Halt an instance until an operator releases it
    async fn quarantine(&self, instance_id: Uuid, reason: &str) -> Result<(), StoreError>;

    /// Clear the quarantine and make the instance runnable again
    async fn release_quarantine(&self, instance_id: Uuid) -> Result<(), StoreError>;

    /// Append `events` plus the terminal marker and set the terminal status
    ///
    /// Pending timers are discarded and queued tasks canceled in the same
    /// transaction.
    async fn finalize(
        &self,
        instance_id: Uuid,
        events: Vec<NewEvent>,
        outcome: InstanceOutcome,
    ) -> Result<i64, StoreError>;

    // =========================================================================
    // History
    // =========================================================================

    /// Append events atomically; returns the last sequence number written
    async fn append_events(
        &self,
        instance_id: Uuid,
        events: Vec<NewEvent>,
    ) -> Result<i64, StoreError>;

    /// Full history ordered by sequence number
    async fn load_history(&self, instance_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError>;

    // =========================================================================
    // Execution leases
    // =========================================================================

    /// Lease up to `limit` instances that have work to replay
    ///
    /// Candidates are non-terminal, not quarantined, not leased (or with an
    /// expired lease), and either runnable, newly created, or left `running`
    /// by a crashed owner.
    async fn claim_runnable(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Drop a lease held by `owner`
    async fn release_lease(&self, instance_id: Uuid, owner: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Timers
    // =========================================================================

    /// Persist a due-time record (idempotent per step)
    async fn schedule_timer(&self, timer: TimerRecord) -> Result<(), StoreError>;

    /// Append `timer_fired` for timers due at `now` and return them
    async fn fire_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimerRecord>, StoreError>;

    // =========================================================================
    // Activity queue
    // =========================================================================

    /// Queue a task (idempotent per step); returns the task id
    async fn enqueue_activity(
        &self,
        task: ActivityTask,
        visible_at: DateTime<Utc>,
    ) -> Result<Uuid, StoreError>;

    /// Claim visible tasks and bump their attempt counter
    async fn claim_activities(
        &self,
        worker_id: &str,
        filter: &ActivityFilter,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimedActivity>, StoreError>;

    /// Record `activity_completed` and close the task
    async fn complete_activity(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Put the task back with a delay; no history is written
    async fn retry_activity(
        &self,
        task_id: Uuid,
        error: &ActivityError,
        visible_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Record `activity_failed` and close the task
    async fn fail_activity(&self, task_id: Uuid, error: &ActivityError) -> Result<(), StoreError>;

    /// Return tasks whose worker went silent past timeout + `grace`
    ///
    /// Tasks with attempts left go back to the queue; the rest fail.
    async fn reclaim_stale_activities(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<usize, StoreError>;

    // =========================================================================
    // Queries
    // =========================================================================

    /// Earliest pending timer or delayed task for the instance
    async fn next_due_at(&self, instance_id: Uuid) -> Result<Option<DateTime<Utc>>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            InstanceStatus::Created,
            InstanceStatus::Running,
            InstanceStatus::Suspended,
            InstanceStatus::Completed,
            InstanceStatus::Failed,
            InstanceStatus::Canceled,
        ] {
            assert_eq!(InstanceStatus::parse(status.as_str()), Some(status));
            assert_eq!(status.to_string(), status.as_str());
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Canceled.is_terminal());
        assert!(!InstanceStatus::Suspended.is_terminal());
        assert!(!InstanceStatus::Created.is_terminal());
    }

    #[test]
    fn test_activity_filter() {
        let filter = ActivityFilter::new(vec!["default".into()], vec![]);
        assert!(filter.accepts("default", "anything"));
        assert!(!filter.accepts("emails", "anything"));

        let filter = ActivityFilter::new(vec!["default".into()], vec!["charge".into()]);
        assert!(filter.accepts("default", "charge"));
        assert!(!filter.accepts("default", "refund"));
    }

    #[test]
    fn test_already_resolved_errors() {
        let id = Uuid::now_v7();
        assert!(StoreError::InstanceTerminal(id).is_already_resolved());
        assert!(StoreError::DuplicateStep {
            instance_id: id,
            step_index: 0
        }
        .is_already_resolved());
        assert!(!StoreError::Database("down".into()).is_already_resolved());
    }
}
