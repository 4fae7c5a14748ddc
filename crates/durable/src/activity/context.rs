//! Activity execution context

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Context provided to activities during execution
///
/// The context provides:
/// - The instance and step the invocation belongs to
/// - Information about the current execution attempt
/// - Cancellation detection (set when the worker pool shuts down)
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext, input: Input) -> Result<Output, ActivityError> {
///     tokio::select! {
///         result = do_work(input, ctx.idempotency_key()) => result,
///         _ = ctx.cancelled() => Err(ActivityError::retryable("worker shutting down")),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Unique execution attempt ID
    pub attempt_id: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    /// Workflow instance that issued the command
    pub instance_id: Uuid,

    /// Step index of the command within the instance
    pub step_index: u32,

    /// Activity type being executed
    pub activity_type: String,

    cancellation: CancellationToken,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(
        instance_id: Uuid,
        step_index: u32,
        activity_type: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            attempt_id: Uuid::now_v7(),
            attempt,
            max_attempts,
            instance_id,
            step_index,
            activity_type: activity_type.into(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Tie cancellation to an external token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Stable key for deduplicating side effects across attempts
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.instance_id, self.step_index)
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when cancellation is requested
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_context_creation() {
        let instance_id = Uuid::now_v7();
        let ctx = ActivityContext::new(instance_id, 2, "send_email", 1, 3);

        assert_eq!(ctx.instance_id, instance_id);
        assert_eq!(ctx.step_index, 2);
        assert_eq!(ctx.activity_type, "send_email");
        assert_eq!(ctx.attempt, 1);
        assert!(!ctx.is_cancelled());
        assert!(!ctx.is_last_attempt());
    }

    #[test]
    fn test_is_last_attempt() {
        let ctx = ActivityContext::new(Uuid::now_v7(), 0, "a", 3, 3);
        assert!(ctx.is_last_attempt());

        let ctx = ActivityContext::new(Uuid::now_v7(), 0, "a", 2, 3);
        assert!(!ctx.is_last_attempt());
    }

    #[test]
    fn test_idempotency_key_is_stable_across_attempts() {
        let instance_id = Uuid::now_v7();
        let first = ActivityContext::new(instance_id, 4, "charge", 1, 3);
        let second = ActivityContext::new(instance_id, 4, "charge", 2, 3);

        assert_eq!(first.idempotency_key(), second.idempotency_key());
        assert_ne!(first.attempt_id, second.attempt_id);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let token = CancellationToken::new();
        let ctx = ActivityContext::new(Uuid::now_v7(), 0, "a", 1, 3).with_cancellation(token.clone());

        assert!(!ctx.is_cancelled());
        token.cancel();

        assert!(ctx.is_cancelled());
        ctx.cancelled().await;
    }
}
