//! Runs claimed activity tasks and records their outcome
//!
//! One call to [`ActivityExecutor::invoke`] is one attempt. The executor never
//! sleeps between attempts: a retry puts the task back in the queue with a
//! `visible_at` in the future and the next claim after that picks it up.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{ActivityContext, ActivityError, ActivityRegistry};
use crate::clock::{to_chrono, Clock, SystemClock};
use crate::persistence::{ClaimedActivity, HistoryStore, StoreError};

/// What happened to one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome {
    /// `activity_completed` was recorded
    Completed,

    /// Re-queued; `next_attempt` becomes visible after `delay`
    Retrying { next_attempt: u32, delay: Duration },

    /// Retries exhausted or error not retryable; `activity_failed` was recorded
    Failed { error: ActivityError },

    /// The step was already resolved or the instance already finished
    Ignored,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Executes activity attempts against an [`ActivityRegistry`]
pub struct ActivityExecutor<S: HistoryStore> {
    store: Arc<S>,
    registry: Arc<ActivityRegistry>,
    clock: Arc<dyn Clock>,
    cancellation: CancellationToken,
}

impl<S: HistoryStore> Clone for ActivityExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            clock: Arc::clone(&self.clock),
            cancellation: self.cancellation.clone(),
        }
    }
}

impl<S: HistoryStore> ActivityExecutor<S> {
    pub fn new(store: Arc<S>, registry: Arc<ActivityRegistry>) -> Self {
        Self {
            store,
            registry,
            clock: Arc::new(SystemClock),
            cancellation: CancellationToken::new(),
        }
    }

    /// Use a custom clock for retry visibility
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Token handed to every [`ActivityContext`]; cancel it on shutdown
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ActivityRegistry> {
        &self.registry
    }

    /// Run one attempt of a claimed task and record the outcome
    #[instrument(
        skip(self, task),
        fields(
            task_id = %task.task_id,
            instance_id = %task.instance_id,
            step_index = task.step_index,
            activity_type = %task.command.activity_type,
            attempt = task.attempt
        )
    )]
    pub async fn invoke(&self, task: ClaimedActivity) -> Result<ActivityOutcome, ExecutorError> {
        let command = &task.command;
        let ctx = ActivityContext::new(
            task.instance_id,
            task.step_index,
            command.activity_type.clone(),
            task.attempt,
            task.max_attempts(),
        )
        .with_cancellation(self.cancellation.child_token());

        let Some(activity) = self.registry.get(&command.activity_type) else {
            let error = ActivityError::unknown_activity(&command.activity_type);
            warn!(error = %error, "activity type not registered");
            return self.record_failure(&task, error).await;
        };

        let payload = command.payload.clone();
        let attempt = async {
            if command.compensation {
                activity.compensate(&ctx, payload).await
            } else {
                activity.execute(&ctx, payload).await
            }
        };

        let result = match tokio::time::timeout(
            command.options.timeout,
            AssertUnwindSafe(attempt).catch_unwind(),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ActivityError::panicked()),
            Err(_) => Err(ActivityError::timed_out(command.options.timeout)),
        };

        match result {
            Ok(output) => match self.store.complete_activity(task.task_id, output).await {
                Ok(()) => {
                    debug!("activity completed");
                    Ok(ActivityOutcome::Completed)
                }
                Err(e) if e.is_already_resolved() => {
                    debug!(reason = %e, "activity result discarded");
                    Ok(ActivityOutcome::Ignored)
                }
                Err(e) => Err(e.into()),
            },
            Err(error) => {
                let policy = &command.options.retry_policy;
                let retry = error.retryable
                    && policy.should_retry(error.error_type.as_deref())
                    && policy.has_attempts_remaining(task.attempt);

                if !retry {
                    activity.on_failure(&ctx, &error).await;
                    return self.record_failure(&task, error).await;
                }

                let delay = policy.delay_for_retry(task.attempt);
                let visible_at = self
                    .clock
                    .now()
                    .checked_add_signed(to_chrono(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                self.store
                    .retry_activity(task.task_id, &error, visible_at)
                    .await?;

                info!(error = %error, ?delay, "activity attempt failed, retrying");
                Ok(ActivityOutcome::Retrying {
                    next_attempt: task.attempt + 1,
                    delay,
                })
            }
        }
    }

    async fn record_failure(
        &self,
        task: &ClaimedActivity,
        error: ActivityError,
    ) -> Result<ActivityOutcome, ExecutorError> {
        match self.store.fail_activity(task.task_id, &error).await {
            Ok(()) => {
                warn!(error = %error, "activity failed");
                Ok(ActivityOutcome::Failed { error })
            }
            Err(e) if e.is_already_resolved() => Ok(ActivityOutcome::Ignored),
            Err(e) => Err(e.into()),
        }
    }
}
