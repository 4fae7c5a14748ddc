//! Explicit compensation for multi-step workflows
//!
//! Nothing is rolled back automatically. A workflow registers a compensation
//! after each step succeeds and runs them, newest first, from its own error
//! handling branch. Each compensation is an ordinary activity command, so it
//! is recorded and replayed like any other step.

use serde_json::Value;
use tracing::warn;

use super::{WorkflowContext, WorkflowError};
use crate::activity::Activity;

/// Stack of compensations for the steps completed so far
///
/// # Example
///
/// ```ignore
/// let mut saga = Saga::new(&ctx);
///
/// let reservation = ctx.activity::<ReserveStock>(order.clone()).await?;
/// saga.add::<ReserveStock>(&order)?;
///
/// if let Err(e) = ctx.activity::<ChargeCard>(payment).await {
///     saga.compensate().await?;
///     return Err(e.into());
/// }
/// ```
#[derive(Debug)]
pub struct Saga {
    ctx: WorkflowContext,
    compensations: Vec<(String, Value)>,
}

impl Saga {
    pub fn new(ctx: &WorkflowContext) -> Self {
        Self {
            ctx: ctx.clone(),
            compensations: Vec::new(),
        }
    }

    /// Register the compensation of `A` for a call made with `original_input`
    pub fn add<A: Activity>(&mut self, original_input: &A::Input) -> Result<(), WorkflowError> {
        let payload = serde_json::to_value(original_input)?;
        self.compensations.push((A::TYPE.to_string(), payload));
        Ok(())
    }

    /// Register a compensation by activity name
    pub fn add_raw(&mut self, activity_type: impl Into<String>, original_payload: Value) {
        self.compensations
            .push((activity_type.into(), original_payload));
    }

    pub fn len(&self) -> usize {
        self.compensations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compensations.is_empty()
    }

    /// Run every registered compensation in reverse order
    ///
    /// All compensations are attempted even if one fails; the first failure
    /// is returned.
    pub async fn compensate(self) -> Result<(), WorkflowError> {
        let replaying = self.ctx.is_replaying();
        let mut first_error = None;

        for (activity_type, payload) in self.compensations.into_iter().rev() {
            if let Err(e) = self.ctx.compensate_raw(activity_type.clone(), payload).await {
                if !replaying {
                    warn!(
                        instance_id = %self.ctx.instance_id(),
                        activity_type = %activity_type,
                        error = %e,
                        "Compensation failed"
                    );
                }
                first_error.get_or_insert_with(|| {
                    WorkflowError::from(e).with_code("COMPENSATION_FAILED")
                });
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
