//! Workflow trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use super::{WorkflowContext, WorkflowSignal, WorkflowState};
use crate::activity::ActivityError;

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,

    /// Whether this error is retryable
    pub retryable: bool,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// Activity failures surface at the yield point; `?` turns them into a workflow failure.
impl From<ActivityError> for WorkflowError {
    fn from(err: ActivityError) -> Self {
        Self {
            message: err.message,
            code: err.error_type,
            retryable: err.retryable,
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string()).with_code("SERIALIZATION")
    }
}

/// A workflow is ordinary sequential async code driven by replay
///
/// Each resumption re-runs [`Workflow::execute`] from the start. Every command
/// issued through the [`WorkflowContext`] (activities, timers, side effects,
/// signal waits) is resolved from history when it was already recorded, so
/// completed work is never repeated. The first unresolved command is the
/// frontier: it is persisted and dispatched, and the run stops there.
///
/// # Determinism
///
/// Given the same history, `execute` must issue the same commands in the same
/// order. Branch only on the input, command results and recorded side effects.
/// Read the clock or generate ids through [`WorkflowContext::now`] and
/// [`WorkflowContext::new_uuid`], never directly.
///
/// # Example
///
/// ```ignore
/// use steadfast_durable::prelude::*;
///
/// struct Onboarding;
///
/// #[async_trait]
/// impl Workflow for Onboarding {
///     const TYPE: &'static str = "onboarding";
///     type Input = OnboardingInput;
///     type Output = String;
///
///     async fn execute(
///         &self,
///         ctx: WorkflowContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, WorkflowError> {
///         let user = ctx.activity::<CreateUserRecord>(input.into()).await?;
///         ctx.activity::<SendWelcomeEmail>(user.clone().into()).await?;
///         Ok(format!("Onboarding complete for user: {}", user.id))
///     }
/// }
/// ```
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier for this workflow
    ///
    /// This is used to look up the workflow in the registry during replay.
    const TYPE: &'static str;

    /// Definition version
    ///
    /// Instances are pinned to the version that started them. Bump it on any
    /// change that alters the command sequence for existing histories, and
    /// keep the old version registered until its instances finish.
    const VERSION: u32 = 1;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type when workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Workflow body
    async fn execute(
        &self,
        ctx: WorkflowContext,
        input: Self::Input,
    ) -> Result<Self::Output, WorkflowError>;

    /// Called during replay for every received signal, in history order
    ///
    /// Use it to fold signals into [`WorkflowState`] that `execute` reads via
    /// [`WorkflowContext::state`]. Must be deterministic.
    fn handle_signal(&self, state: &mut WorkflowState, signal: &WorkflowSignal) {
        let _ = (state, signal);
    }
}
