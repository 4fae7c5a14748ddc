//! Workflow engine with replay support
//!
//! The `WorkflowEngine` is responsible for:
//! - Starting new instances
//! - Replaying instances from history and persisting the new frontier
//! - Dispatching frontier commands to the activity queue and timer service
//! - Signals, cancellation and operator actions

use std::sync::Arc;
use std::task::Poll;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::{env_millis_or, env_or, env_string_or};
use crate::persistence::{
    ActivityTask, HistoryStore, InstanceOutcome, InstanceStatus, NewInstance, StoreError,
};
use crate::workflow::{
    ActivityOptions, Command, HistoryEvent, NewEvent, Workflow, WorkflowContext, WorkflowError,
    WorkflowSignal,
};

use super::registry::{RegistryError, WorkflowRegistry};
use super::replay::{poll_workflow, NonDeterminismError, PendingCommand, ReplayState};
use super::timer::TimerService;

/// Configuration for the workflow engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Options for activities started without explicit options
    pub default_activity_options: ActivityOptions,

    /// History length beyond which an instance is quarantined
    pub max_history_events: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_activity_options: ActivityOptions::default(),
            max_history_events: 10_000,
        }
    }
}

impl EngineConfig {
    /// Read `STEADFAST_*` overrides from the environment
    ///
    /// - `STEADFAST_MAX_HISTORY_EVENTS`
    /// - `STEADFAST_ACTIVITY_TIMEOUT_MS`
    /// - `STEADFAST_ACTIVITY_MAX_RETRIES`
    /// - `STEADFAST_ACTIVITY_RETRY_DELAY_MS`
    /// - `STEADFAST_ACTIVITY_QUEUE`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let options = defaults.default_activity_options;
        Self {
            default_activity_options: ActivityOptions::default()
                .with_timeout(env_millis_or("ACTIVITY_TIMEOUT_MS", options.timeout))
                .with_max_retries(env_or("ACTIVITY_MAX_RETRIES", options.max_retries()))
                .with_retry_delay(env_millis_or(
                    "ACTIVITY_RETRY_DELAY_MS",
                    options.retry_policy.retry_delay,
                ))
                .with_queue(env_string_or("ACTIVITY_QUEUE", options.queue_name)),
            max_history_events: env_or("MAX_HISTORY_EVENTS", defaults.max_history_events),
        }
    }

    /// Set the default activity options
    pub fn with_default_activity_options(mut self, options: ActivityOptions) -> Self {
        self.default_activity_options = options;
        self
    }

    /// Set the history length limit
    pub fn with_max_history_events(mut self, max: usize) -> Self {
        self.max_history_events = max;
        self
    }
}

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Instance not found
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// Instance already completed, failed or canceled
    #[error("workflow instance {0} is terminal")]
    InstanceTerminal(Uuid),

    /// Replay diverged from history; the instance is quarantined
    #[error(transparent)]
    NonDeterminism(#[from] NonDeterminismError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InstanceNotFound(id) => Self::InstanceNotFound(id),
            StoreError::InstanceTerminal(id) => Self::InstanceTerminal(id),
            other => Self::Store(other),
        }
    }
}

/// Result of one resumption cycle
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutcome {
    /// Blocked on the listed commands
    Suspended { pending: Vec<PendingCommand> },

    /// Workflow returned a value
    Completed { result: Value },

    /// Workflow returned an error or panicked
    Failed { error: WorkflowError },

    /// Nothing to do, the instance had already finished
    AlreadyTerminal { status: InstanceStatus },

    /// Nothing was run, the instance is quarantined
    Quarantined { reason: String },
}

impl EngineOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::AlreadyTerminal { .. }
        )
    }
}

/// Point-in-time view of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub instance_id: Uuid,
    pub workflow_type: String,
    pub workflow_version: u32,
    pub status: InstanceStatus,
    pub result: Option<Value>,
    pub failure: Option<WorkflowError>,
    pub quarantine_reason: Option<String>,
    pub awaiting_signals: Vec<String>,
    /// Earliest pending timer or delayed activity retry
    pub next_due_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Workflow engine
///
/// Drives instances by replaying their history through the registered
/// workflow code. Each call to [`WorkflowEngine::execute`] is one resumption
/// cycle: replay, persist the new frontier, dispatch it, suspend.
///
/// # Example
///
/// ```ignore
/// use steadfast_durable::prelude::*;
///
/// let store = Arc::new(InMemoryHistoryStore::new());
/// let mut engine = WorkflowEngine::new(store);
/// engine.register(Onboarding);
///
/// let id = engine.run("onboarding", json!({"email": "ada@example.com"}), None).await?;
/// engine.execute(id).await?;
/// ```
pub struct WorkflowEngine<S: HistoryStore> {
    store: Arc<S>,
    registry: WorkflowRegistry,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    timers: TimerService<S>,
}

impl<S: HistoryStore> WorkflowEngine<S> {
    /// Create a new engine with the given store
    pub fn new(store: Arc<S>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            timers: TimerService::new(Arc::clone(&store), Arc::clone(&clock)),
            store,
            registry: WorkflowRegistry::new(),
            config: EngineConfig::default(),
            clock,
        }
    }

    /// Use a custom config
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom clock for timers
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.timers = TimerService::new(Arc::clone(&self.store), Arc::clone(&clock));
        self.clock = clock;
        self
    }

    /// Register a workflow definition
    pub fn register<W: Workflow>(&mut self, workflow: W) {
        self.registry.register(workflow);
        info!(workflow_type = W::TYPE, version = W::VERSION, "registered workflow");
    }

    /// Get a reference to the store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn timers(&self) -> &TimerService<S> {
        &self.timers
    }

    // =========================================================================
    // Start / query
    // =========================================================================

    /// Create an instance of the latest registered version
    ///
    /// With a business key, an existing non-terminal instance for that key is
    /// returned instead of creating a new one.
    #[instrument(skip(self, input))]
    pub async fn run(
        &self,
        workflow_type: &str,
        input: Value,
        business_key: Option<String>,
    ) -> Result<Uuid, EngineError> {
        let definition = self.registry.latest(workflow_type)?;

        let created = self
            .store
            .create_instance(NewInstance {
                workflow_type: workflow_type.to_string(),
                workflow_version: definition.version(),
                input,
                business_key,
            })
            .await?;

        if created.created {
            info!(
                instance_id = %created.id,
                workflow_type,
                version = definition.version(),
                "created workflow instance"
            );
        } else {
            debug!(instance_id = %created.id, "business key matched existing instance");
        }
        Ok(created.id)
    }

    /// Typed variant of [`WorkflowEngine::run`]
    pub async fn start<W: Workflow>(
        &self,
        input: W::Input,
        business_key: Option<String>,
    ) -> Result<Uuid, EngineError> {
        let input = serde_json::to_value(input)?;
        self.run(W::TYPE, input, business_key).await
    }

    /// Current status, result and next due time
    #[instrument(skip(self))]
    pub async fn get_status(&self, instance_id: Uuid) -> Result<StatusReport, EngineError> {
        let instance = self.store.get_instance(instance_id).await?;
        let next_due_at = if instance.status.is_terminal() {
            None
        } else {
            self.store.next_due_at(instance_id).await?
        };

        Ok(StatusReport {
            instance_id,
            workflow_type: instance.workflow_type,
            workflow_version: instance.workflow_version,
            status: instance.status,
            result: instance.result,
            failure: instance.failure,
            quarantine_reason: instance.quarantine_reason,
            awaiting_signals: instance.awaiting_signals,
            next_due_at,
            updated_at: instance.updated_at,
        })
    }

    /// Ordered history of an instance
    pub async fn history(&self, instance_id: Uuid) -> Result<Vec<HistoryEvent>, EngineError> {
        Ok(self.store.load_history(instance_id).await?)
    }

    // =========================================================================
    // Signals, cancellation, operator actions
    // =========================================================================

    /// Record a signal; returns its sequence number
    ///
    /// The signal is appended whether or not the workflow waits for it yet.
    /// An instance blocked on a wait for `signal_name` becomes runnable.
    #[instrument(skip(self, payload))]
    pub async fn signal(
        &self,
        instance_id: Uuid,
        signal_name: &str,
        payload: Value,
    ) -> Result<i64, EngineError> {
        let instance = self.store.get_instance(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::InstanceTerminal(instance_id));
        }

        let mut signal = WorkflowSignal::new(signal_name, payload);
        signal.sent_at = self.clock.now();
        let sequence = self
            .store
            .append_events(instance_id, vec![NewEvent::signal_received(signal)])
            .await?;

        info!(%instance_id, signal_name, sequence, "signal received");
        Ok(sequence)
    }

    /// Cancel a non-terminal instance
    ///
    /// Queued activity tasks and pending timers are dropped. Completions that
    /// arrive afterwards are rejected by the store and ignored.
    #[instrument(skip(self))]
    pub async fn cancel(&self, instance_id: Uuid, reason: &str) -> Result<(), EngineError> {
        let reason = WorkflowError::new(reason).with_code("CANCELED");
        self.store
            .finalize(instance_id, vec![], InstanceOutcome::Canceled(reason))
            .await?;

        info!(%instance_id, "workflow canceled");
        Ok(())
    }

    /// Let a quarantined instance run again
    #[instrument(skip(self))]
    pub async fn release_quarantine(&self, instance_id: Uuid) -> Result<(), EngineError> {
        self.store.release_quarantine(instance_id).await?;
        info!(%instance_id, "quarantine released");
        Ok(())
    }

    // =========================================================================
    // Resumption cycle
    // =========================================================================

    /// Replay an instance and advance it to its next suspension point
    ///
    /// Callers must ensure at most one concurrent `execute` per instance
    /// (the scheduler does this with a store lease and an in-process lock).
    #[instrument(skip(self), fields(workflow_type, version))]
    pub async fn execute(&self, instance_id: Uuid) -> Result<EngineOutcome, EngineError> {
        let instance = self.store.get_instance(instance_id).await?;
        if instance.status.is_terminal() {
            return Ok(EngineOutcome::AlreadyTerminal {
                status: instance.status,
            });
        }
        if let Some(reason) = instance.quarantine_reason {
            return Ok(EngineOutcome::Quarantined { reason });
        }

        let span = tracing::Span::current();
        span.record("workflow_type", instance.workflow_type.as_str());
        span.record("version", instance.workflow_version);

        let workflow = match self
            .registry
            .get(&instance.workflow_type, instance.workflow_version)
        {
            Ok(workflow) => workflow,
            Err(e) => {
                let divergence = NonDeterminismError {
                    step_index: 0,
                    replayed: format!("no definition ({e})"),
                    recorded: format!(
                        "{} version {}",
                        instance.workflow_type, instance.workflow_version
                    ),
                };
                return Err(self.quarantine(instance_id, divergence).await);
            }
        };

        let history = self.store.load_history(instance_id).await?;
        if history.len() > self.config.max_history_events {
            let reason = format!(
                "history has {} events, limit is {}",
                history.len(),
                self.config.max_history_events
            );
            self.store.quarantine(instance_id, &reason).await?;
            warn!(%instance_id, %reason, "instance quarantined");
            return Ok(EngineOutcome::Quarantined { reason });
        }

        self.store
            .set_status(instance_id, InstanceStatus::Running, vec![])
            .await?;

        let replay = Arc::new(Mutex::new(ReplayState::new(
            instance_id,
            Arc::clone(&workflow),
            history,
            self.clock.now(),
            self.config.default_activity_options.clone(),
        )));

        let poll = {
            let mut body = workflow.run(WorkflowContext::new(Arc::clone(&replay)), instance.input);
            poll_workflow(&mut body)
        };

        let (events, pending, divergence) = {
            let mut replay = replay.lock();
            if matches!(poll, Poll::Ready(Ok(_))) {
                replay.check_fully_replayed();
            }
            replay.take_parts()
        };

        if let Some(divergence) = divergence {
            return Err(self.quarantine(instance_id, divergence).await);
        }

        let outcome = match poll {
            Poll::Ready(Ok(result)) => {
                self.finish(instance_id, events, InstanceOutcome::Completed(result.clone()))
                    .await?
                    .unwrap_or(EngineOutcome::Completed { result })
            }
            Poll::Ready(Err(error)) => {
                self.finish(instance_id, events, InstanceOutcome::Failed(error.clone()))
                    .await?
                    .unwrap_or(EngineOutcome::Failed { error })
            }
            Poll::Pending => self.suspend(instance_id, events, pending).await?,
        };

        match &outcome {
            EngineOutcome::Completed { .. } => info!(%instance_id, "workflow completed"),
            EngineOutcome::Failed { error } => {
                info!(%instance_id, error = %error, "workflow failed")
            }
            EngineOutcome::Suspended { pending } => {
                debug!(%instance_id, pending = pending.len(), "workflow suspended")
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Write the terminal marker; `Some` when someone else finished first
    async fn finish(
        &self,
        instance_id: Uuid,
        events: Vec<NewEvent>,
        outcome: InstanceOutcome,
    ) -> Result<Option<EngineOutcome>, EngineError> {
        match self.store.finalize(instance_id, events, outcome).await {
            Ok(_) => Ok(None),
            Err(StoreError::InstanceTerminal(_)) => {
                let instance = self.store.get_instance(instance_id).await?;
                Ok(Some(EngineOutcome::AlreadyTerminal {
                    status: instance.status,
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the frontier, dispatch it and park the instance
    async fn suspend(
        &self,
        instance_id: Uuid,
        events: Vec<NewEvent>,
        pending: Vec<PendingCommand>,
    ) -> Result<EngineOutcome, EngineError> {
        if pending.is_empty() {
            let reason =
                "workflow suspended on a future that is not a workflow command".to_string();
            self.store.quarantine(instance_id, &reason).await?;
            warn!(%instance_id, %reason, "instance quarantined");
            return Ok(EngineOutcome::Quarantined { reason });
        }

        if !events.is_empty() {
            match self.store.append_events(instance_id, events).await {
                Ok(_) => {}
                Err(StoreError::InstanceTerminal(_)) => {
                    let instance = self.store.get_instance(instance_id).await?;
                    return Ok(EngineOutcome::AlreadyTerminal {
                        status: instance.status,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Already-issued commands are dispatched again; both queues are
        // keyed by step, so this only fills gaps left by a crash.
        let now = self.clock.now();
        let mut awaiting_signals: Vec<String> = Vec::new();
        for command in &pending {
            match &command.command {
                Command::Activity(activity) => {
                    self.store
                        .enqueue_activity(
                            ActivityTask {
                                instance_id,
                                step_index: command.step_index,
                                command: activity.clone(),
                            },
                            now,
                        )
                        .await?;
                }
                Command::Timer(timer) => {
                    self.timers
                        .schedule(instance_id, command.step_index, timer.fire_at)
                        .await?;
                }
                Command::SignalWait(wait) => {
                    if !awaiting_signals.contains(&wait.signal_name) {
                        awaiting_signals.push(wait.signal_name.clone());
                    }
                }
                Command::SideEffect(_) => {}
            }
        }

        match self
            .store
            .set_status(instance_id, InstanceStatus::Suspended, awaiting_signals)
            .await
        {
            Ok(()) => Ok(EngineOutcome::Suspended { pending }),
            Err(StoreError::InstanceTerminal(_)) => {
                let instance = self.store.get_instance(instance_id).await?;
                Ok(EngineOutcome::AlreadyTerminal {
                    status: instance.status,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn quarantine(&self, instance_id: Uuid, divergence: NonDeterminismError) -> EngineError {
        warn!(%instance_id, error = %divergence, "non-determinism detected, quarantining instance");
        match self
            .store
            .quarantine(instance_id, &divergence.to_string())
            .await
        {
            Ok(()) => EngineError::NonDeterminism(divergence),
            Err(e) => e.into(),
        }
    }
}
