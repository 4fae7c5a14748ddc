//! Activity trait definition

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Failure of one activity attempt
///
/// Stored as the `error_payload` of `activity_failed` and surfaced to the
/// workflow at the yield point. `error_type` is what retry policies match
/// against in `non_retryable_errors`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    pub message: String,

    /// Machine-readable code, e.g. `TIMEOUT` or an application code
    pub error_type: Option<String>,

    /// `false` fails the step without consulting the retry policy
    pub retryable: bool,

    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Code for an attempt that exceeded its timeout
    pub const TIMEOUT: &'static str = "TIMEOUT";
    /// Code for an attempt that panicked
    pub const PANIC: &'static str = "PANIC";
    /// Code for a task whose type no worker has registered
    pub const UNKNOWN_ACTIVITY: &'static str = "UNKNOWN_ACTIVITY";
    /// Code for a claimed task abandoned by its worker
    pub const WORKER_LOST: &'static str = "WORKER_LOST";

    /// Transient failure, retried while the policy allows
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    /// Permanent failure
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::retryable(message)
        }
    }

    pub fn timed_out(timeout: Duration) -> Self {
        Self::retryable(format!("activity timed out after {timeout:?}")).with_type(Self::TIMEOUT)
    }

    pub fn panicked() -> Self {
        Self::retryable("activity panicked").with_type(Self::PANIC)
    }

    pub fn unknown_activity(activity_type: &str) -> Self {
        Self::non_retryable(format!("no activity registered for type {activity_type}"))
            .with_type(Self::UNKNOWN_ACTIVITY)
    }

    pub fn worker_lost() -> Self {
        Self::non_retryable("activity worker stopped responding").with_type(Self::WORKER_LOST)
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn has_type(&self, error_type: &str) -> bool {
        self.error_type.as_deref() == Some(error_type)
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "[{error_type}] {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ActivityError {}

/// Errors from helper code with `?`; treated as transient
impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

/// An activity is a unit of external work invoked by a workflow
///
/// Activities are the only place a workflow touches the outside world. They:
/// - Run on a worker pool, outside the replay loop
/// - Are retried according to the command's retry policy
/// - May run more than once for the same step, so they must be idempotent
///
/// # Example
///
/// ```ignore
/// use steadfast_durable::prelude::*;
///
/// struct SendWelcomeEmail;
///
/// #[async_trait]
/// impl Activity for SendWelcomeEmail {
///     const TYPE: &'static str = "send_welcome_email";
///     type Input = WelcomeEmail;
///     type Output = EmailSent;
///
///     async fn execute(
///         &self,
///         ctx: &ActivityContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, ActivityError> {
///         // Send email...
///         Ok(EmailSent { sent: true })
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Unique type identifier for this activity
    ///
    /// This is used to look up the activity in the registry.
    const TYPE: &'static str;

    /// Input type for the activity
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute the activity
    ///
    /// # Errors
    ///
    /// Return `ActivityError::retryable()` for transient failures that should be retried.
    /// Return `ActivityError::non_retryable()` for permanent failures.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;

    /// Cleanup hook, called once when the last attempt has failed
    ///
    /// Runs before the failure is recorded in history.
    async fn on_failure(&self, ctx: &ActivityContext, error: &ActivityError) {
        let _ = (ctx, error);
    }

    /// Undo a previous successful `execute` with the same input
    ///
    /// Never called by the engine on its own; workflows request it through
    /// `WorkflowContext::compensate` or a `Saga`.
    async fn compensate(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<serde_json::Value, ActivityError> {
        let _ = (ctx, input);
        Err(ActivityError::non_retryable(format!(
            "activity {} does not support compensation",
            Self::TYPE
        ))
        .with_type("COMPENSATION_UNSUPPORTED"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ChargeCard;

    #[async_trait]
    impl Activity for ChargeCard {
        const TYPE: &'static str = "charge_card";
        type Input = u64;
        type Output = String;

        async fn execute(&self, _ctx: &ActivityContext, cents: u64) -> Result<String, ActivityError> {
            if cents == 0 {
                return Err(ActivityError::non_retryable("nothing to charge").with_type("EMPTY"));
            }
            Ok(format!("charge-{cents}"))
        }
    }

    fn ctx() -> ActivityContext {
        ActivityContext::new(uuid::Uuid::nil(), 0, ChargeCard::TYPE.to_string(), 1, 1)
    }

    #[test]
    fn test_engine_error_codes() {
        let timeout = ActivityError::timed_out(Duration::from_secs(5));
        assert!(timeout.retryable);
        assert!(timeout.has_type(ActivityError::TIMEOUT));
        assert_eq!(timeout.to_string(), "[TIMEOUT] activity timed out after 5s");

        assert!(ActivityError::panicked().retryable);
        assert!(!ActivityError::unknown_activity("x").retryable);
        assert!(!ActivityError::worker_lost().retryable);
    }

    #[test]
    fn test_anyhow_errors_are_transient() {
        let err = anyhow::anyhow!("connection reset").context("calling mailer");
        let error = ActivityError::from(err);
        assert!(error.retryable);
        assert_eq!(error.message, "calling mailer: connection reset");
        assert_eq!(error.to_string(), "calling mailer: connection reset");
    }

    #[test]
    fn test_error_payload_keeps_details() {
        let error = ActivityError::non_retryable("card declined")
            .with_type("DECLINED")
            .with_details(serde_json::json!({"decline_code": "insufficient_funds"}));

        let payload = serde_json::to_value(&error).unwrap();
        assert_eq!(payload["error_type"], "DECLINED");
        assert_eq!(serde_json::from_value::<ActivityError>(payload).unwrap(), error);
    }

    #[tokio::test]
    async fn test_execute_and_default_compensation() {
        let ctx = ctx();
        assert_eq!(ChargeCard.execute(&ctx, 250).await.unwrap(), "charge-250");
        assert!(ChargeCard.execute(&ctx, 0).await.unwrap_err().has_type("EMPTY"));

        let error = ChargeCard.compensate(&ctx, 250).await.unwrap_err();
        assert!(!error.retryable);
        assert!(error.has_type("COMPENSATION_UNSUPPORTED"));
    }
}
