//! Commands a workflow yields and activity options

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::reliability::{duration_millis, RetryPolicy};

/// Instructions a workflow issues through its context
///
/// Every command occupies one step index. The command is persisted inside the
/// `command_issued` (or `side_effect_recorded`) history event for that step and
/// compared against the replayed command on every later run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Invoke an activity (or its compensation)
    Activity(ActivityCommand),

    /// Wake up at a point in time
    Timer(TimerCommand),

    /// Record a non-deterministic value once
    SideEffect(SideEffectCommand),

    /// Block until a named signal is available
    SignalWait(SignalWaitCommand),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityCommand {
    /// Type of activity to execute (used to look up in registry)
    pub activity_type: String,

    /// Input data for the activity (JSON)
    pub payload: serde_json::Value,

    /// Execution options (retries, timeouts, queue)
    pub options: ActivityOptions,

    /// Route to the activity's `compensate` instead of `execute`
    #[serde(default)]
    pub compensation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimerCommand {
    pub fire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SideEffectCommand {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalWaitCommand {
    pub signal_name: String,
}

impl Command {
    /// Create an activity command
    pub fn activity(
        activity_type: impl Into<String>,
        payload: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self::Activity(ActivityCommand {
            activity_type: activity_type.into(),
            payload,
            options,
            compensation: false,
        })
    }

    /// Create a compensation command for a previously executed activity
    pub fn compensation(
        activity_type: impl Into<String>,
        original_payload: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self::Activity(ActivityCommand {
            activity_type: activity_type.into(),
            payload: original_payload,
            options,
            compensation: true,
        })
    }

    /// Create a timer command
    pub fn timer(fire_at: DateTime<Utc>) -> Self {
        Self::Timer(TimerCommand { fire_at })
    }

    /// Create a side effect command
    pub fn side_effect() -> Self {
        Self::SideEffect(SideEffectCommand {})
    }

    /// Create a signal wait command
    pub fn signal_wait(signal_name: impl Into<String>) -> Self {
        Self::SignalWait(SignalWaitCommand {
            signal_name: signal_name.into(),
        })
    }

    /// Short name used in logs and determinism errors
    pub fn describe(&self) -> String {
        match self {
            Self::Activity(cmd) if cmd.compensation => {
                format!("compensate({})", cmd.activity_type)
            }
            Self::Activity(cmd) => format!("activity({})", cmd.activity_type),
            Self::Timer(_) => "timer".to_string(),
            Self::SideEffect(_) => "side_effect".to_string(),
            Self::SignalWait(cmd) => format!("signal_wait({})", cmd.signal_name),
        }
    }

    /// Whether a replayed command is the same logical step as a recorded one
    ///
    /// Timers compare by kind only: duration-based timers compute `fire_at`
    /// when first issued and the recorded value stays authoritative. Activity
    /// options are not compared so engine defaults can change between deploys.
    pub fn matches(&self, recorded: &Command) -> bool {
        match (self, recorded) {
            (Self::Activity(a), Self::Activity(b)) => {
                a.activity_type == b.activity_type
                    && a.compensation == b.compensation
                    && a.payload == b.payload
            }
            (Self::Timer(_), Self::Timer(_)) => true,
            (Self::SideEffect(_), Self::SideEffect(_)) => true,
            (Self::SignalWait(a), Self::SignalWait(b)) => a.signal_name == b.signal_name,
            _ => false,
        }
    }
}

/// Options for activity execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Maximum time for a single attempt
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Retry policy (retry count is tracked per command)
    pub retry_policy: RetryPolicy,

    /// Task queue the activity is dispatched to
    pub queue_name: String,
}

/// Queue used when a command does not name one
pub const DEFAULT_QUEUE: &str = "default";

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            retry_policy: RetryPolicy::default(),
            queue_name: DEFAULT_QUEUE.to_string(),
        }
    }
}

impl ActivityOptions {
    /// Set the per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the number of retries after the first attempt
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry_policy.max_retries = max_retries;
        self
    }

    /// Set the delay before a retry
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_policy = self.retry_policy.with_retry_delay(delay);
        self
    }

    /// Set the task queue
    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.retry_policy.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_serialization_is_tagged() {
        let cmd = Command::signal_wait("approval");
        let value = serde_json::to_value(&cmd).unwrap();

        assert_eq!(value["type"], "signal_wait");
        assert_eq!(value["signal_name"], "approval");
    }

    #[test]
    fn test_activity_command_roundtrip() {
        let cmd = Command::activity(
            "send_email",
            json!({"to": "a@b.com"}),
            ActivityOptions::default().with_max_retries(2),
        );

        let json = serde_json::to_string(&cmd).unwrap();
        let parsed: Command = serde_json::from_str(&json).unwrap();

        assert_eq!(cmd, parsed);
    }

    #[test]
    fn test_activity_matches_on_type_and_payload() {
        let recorded = Command::activity("charge", json!({"amount": 10}), ActivityOptions::default());

        let same = Command::activity(
            "charge",
            json!({"amount": 10}),
            ActivityOptions::default().with_queue("payments"),
        );
        let other_payload = Command::activity("charge", json!({"amount": 11}), ActivityOptions::default());
        let compensation =
            Command::compensation("charge", json!({"amount": 10}), ActivityOptions::default());

        assert!(same.matches(&recorded));
        assert!(!other_payload.matches(&recorded));
        assert!(!compensation.matches(&recorded));
    }

    #[test]
    fn test_timer_matches_regardless_of_fire_at() {
        let recorded = Command::timer(Utc::now());
        let replayed = Command::timer(Utc::now() + chrono::Duration::hours(1));

        assert!(replayed.matches(&recorded));
        assert!(!replayed.matches(&Command::side_effect()));
    }

    #[test]
    fn test_signal_wait_matches_on_name() {
        assert!(Command::signal_wait("a").matches(&Command::signal_wait("a")));
        assert!(!Command::signal_wait("a").matches(&Command::signal_wait("b")));
    }

    #[test]
    fn test_options_builders() {
        let options = ActivityOptions::default()
            .with_timeout(Duration::from_secs(5))
            .with_max_retries(2)
            .with_retry_delay(Duration::from_secs(30))
            .with_queue("emails");

        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.max_retries(), 2);
        assert_eq!(options.retry_policy.retry_delay, Duration::from_secs(30));
        assert_eq!(options.queue_name, "emails");
    }
}
