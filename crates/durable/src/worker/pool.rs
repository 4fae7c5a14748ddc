//! Worker pool for activity execution
//!
//! Claims activity tasks from the store, runs them through an
//! [`ActivityExecutor`] under a concurrency limit and reclaims tasks whose
//! worker went away.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{Poller, PollerConfig};
use crate::activity::{ActivityExecutor, ActivityOutcome, ActivityRegistry, ExecutorError};
use crate::clock::{Clock, SystemClock};
use crate::config::{env_list_or, env_millis_or, env_or, env_string_or};
use crate::persistence::{ActivityFilter, ClaimedActivity, HistoryStore, StoreError};
use crate::reliability::duration_millis;
use crate::workflow::DEFAULT_QUEUE;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Task queues this worker claims from
    pub queues: Vec<String>,

    /// Activity types this worker handles (empty = every registered type)
    pub activity_types: Vec<String>,

    /// Maximum concurrent activity executions
    pub max_concurrency: usize,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Stale task reclamation interval
    #[serde(with = "duration_millis")]
    pub stale_reclaim_interval: Duration,

    /// Extra time past an attempt's timeout before it counts as abandoned
    #[serde(with = "duration_millis")]
    pub stale_grace: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            queues: vec![DEFAULT_QUEUE.to_string()],
            activity_types: vec![],
            max_concurrency: 10,
            poller: PollerConfig::default(),
            stale_reclaim_interval: Duration::from_secs(30),
            stale_grace: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration restricted to the given activity types
    pub fn new(activity_types: Vec<String>) -> Self {
        Self {
            activity_types,
            ..Default::default()
        }
    }

    /// Read `STEADFAST_WORKER_*` overrides from the environment
    ///
    /// - `STEADFAST_WORKER_ID`
    /// - `STEADFAST_WORKER_QUEUES` (comma separated)
    /// - `STEADFAST_WORKER_ACTIVITY_TYPES` (comma separated)
    /// - `STEADFAST_WORKER_MAX_CONCURRENCY`
    /// - `STEADFAST_WORKER_POLL_MIN_MS`, `STEADFAST_WORKER_POLL_MAX_MS`, `STEADFAST_WORKER_BATCH_SIZE`
    /// - `STEADFAST_WORKER_RECLAIM_INTERVAL_MS`, `STEADFAST_WORKER_STALE_GRACE_MS`
    /// - `STEADFAST_WORKER_SHUTDOWN_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_id: env_string_or("WORKER_ID", defaults.worker_id),
            queues: env_list_or("WORKER_QUEUES", defaults.queues),
            activity_types: env_list_or("WORKER_ACTIVITY_TYPES", defaults.activity_types),
            max_concurrency: env_or("WORKER_MAX_CONCURRENCY", defaults.max_concurrency).max(1),
            poller: PollerConfig::from_env("WORKER_"),
            stale_reclaim_interval: env_millis_or(
                "WORKER_RECLAIM_INTERVAL_MS",
                defaults.stale_reclaim_interval,
            ),
            stale_grace: env_millis_or("WORKER_STALE_GRACE_MS", defaults.stale_grace),
            shutdown_timeout: env_millis_or(
                "WORKER_SHUTDOWN_TIMEOUT_MS",
                defaults.shutdown_timeout,
            ),
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the queues to claim from
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Set the grace period for stale task reclamation
    pub fn with_stale_grace(mut self, grace: Duration) -> Self {
        self.stale_grace = grace;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Worker is running and accepting tasks
    Running,
    /// Worker is draining (completing current tasks, not accepting new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Executor error
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Worker pool for executing activities
///
/// # Example
///
/// ```ignore
/// use steadfast_durable::worker::{WorkerPool, WorkerPoolConfig};
///
/// let mut activities = ActivityRegistry::new();
/// activities.register(SendWelcomeEmail::new(mailer));
///
/// let pool = WorkerPool::new(store, Arc::new(activities), WorkerPoolConfig::from_env());
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool<S: HistoryStore> {
    store: Arc<S>,
    executor: ActivityExecutor<S>,
    filter: ActivityFilter,
    config: WorkerPoolConfig,
    clock: Arc<dyn Clock>,
    shutdown_tx: watch::Sender<bool>,
    cancellation: CancellationToken,
    status: RwLock<WorkerPoolStatus>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: HistoryStore> WorkerPool<S> {
    /// Create a new worker pool
    pub fn new(store: Arc<S>, registry: Arc<ActivityRegistry>, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let cancellation = CancellationToken::new();

        // A worker only claims what it can run
        let activity_types = if config.activity_types.is_empty() {
            registry.activity_types()
        } else {
            config.activity_types.clone()
        };
        let filter = ActivityFilter::new(config.queues.clone(), activity_types);

        Self {
            executor: ActivityExecutor::new(Arc::clone(&store), registry)
                .with_cancellation(cancellation.clone()),
            store,
            filter,
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            clock: Arc::new(SystemClock),
            shutdown_tx,
            cancellation,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            tracker: TaskTracker::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Use a custom clock for claims, retries and reclamation
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.executor = self.executor.with_clock(Arc::clone(&clock));
        self.clock = clock;
        self
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Number of activities currently executing
    pub fn current_load(&self) -> usize {
        self.config.max_concurrency - self.permits.available_permits()
    }

    pub fn filter(&self) -> &ActivityFilter {
        &self.filter
    }

    /// Claim up to `limit` tasks and run them to completion in this task
    ///
    /// Used by tests and single-shot drivers; [`WorkerPool::start`] runs the
    /// same steps continuously in the background.
    pub async fn run_once(&self, limit: usize) -> Result<Vec<ActivityOutcome>, WorkerPoolError> {
        let tasks = self.claim(limit).await?;
        let results =
            futures::future::join_all(tasks.into_iter().map(|task| self.executor.invoke(task)))
                .await;

        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            outcomes.push(result?);
        }
        Ok(outcomes)
    }

    /// Requeue or fail tasks whose worker went silent
    pub async fn reclaim_stale(&self) -> Result<usize, WorkerPoolError> {
        let reclaimed = self
            .store
            .reclaim_stale_activities(self.clock.now(), self.config.stale_grace)
            .await?;
        if reclaimed > 0 {
            info!(count = reclaimed, "reclaimed stale activity tasks");
        }
        Ok(reclaimed)
    }

    /// Start the poll and reclaim loops
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(self: &Arc<Self>) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }
        self.shutdown_tx.send_replace(false);
        self.tracker.reopen();

        info!(
            worker_id = %self.config.worker_id,
            queues = ?self.filter.queues,
            activity_types = ?self.filter.activity_types,
            max_concurrency = self.config.max_concurrency,
            "starting worker pool"
        );

        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(Arc::clone(self).poll_loop()));
        handles.push(tokio::spawn(Arc::clone(self).reclaim_loop()));
        Ok(())
    }

    /// Stop claiming and wait for running activities to finish
    ///
    /// On timeout, running activities are cancelled through their context
    /// and their tasks are left for stale reclamation.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker loop panicked");
            }
        }

        self.tracker.close();
        let drained = tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait()).await;
        *self.status.write() = WorkerPoolStatus::Stopped;

        if drained.is_err() {
            warn!(remaining = self.tracker.len(), "shutdown timeout reached");
            self.cancellation.cancel();
            return Err(WorkerPoolError::ShutdownTimeout);
        }

        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedActivity>, WorkerPoolError> {
        if limit == 0 || self.filter.activity_types.is_empty() {
            return Ok(vec![]);
        }
        let tasks = self
            .store
            .claim_activities(&self.config.worker_id, &self.filter, self.clock.now(), limit)
            .await?;
        if !tasks.is_empty() {
            debug!(count = tasks.len(), "claimed activity tasks");
        }
        Ok(tasks)
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut poller = Poller::new(self.config.poller.clone(), self.shutdown_tx.subscribe());

        loop {
            if poller.is_shutdown() {
                break;
            }

            let limit = poller.batch(self.permits.available_permits());
            match self.claim(limit).await {
                Ok(tasks) => {
                    poller.record(tasks.len());
                    for task in tasks {
                        // Claims never exceed free permits, and only this loop acquires
                        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                            break;
                        };
                        let executor = self.executor.clone();
                        self.tracker.spawn(async move {
                            let task_id = task.task_id;
                            if let Err(e) = executor.invoke(task).await {
                                error!(%task_id, error = %e, "failed to record activity outcome");
                            }
                            drop(permit);
                        });
                    }
                }
                Err(e) => {
                    poller.record(0);
                    error!(error = %e, "activity poll failed");
                }
            }

            if poller.wait().await {
                break;
            }
        }

        debug!("poll loop exited");
    }

    async fn reclaim_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.stale_reclaim_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reclaim_stale().await {
                        error!(error = %e, "stale task reclamation failed");
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        debug!("reclaim loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{Activity, ActivityContext, ActivityError};
    use crate::persistence::{ActivityTask, InMemoryHistoryStore, NewInstance, TaskStatus};
    use crate::workflow::{ActivityCommand, ActivityOptions};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Double;

    #[async_trait]
    impl Activity for Double {
        const TYPE: &'static str = "double";
        type Input = i64;
        type Output = i64;

        async fn execute(&self, _ctx: &ActivityContext, input: i64) -> Result<i64, ActivityError> {
            Ok(input * 2)
        }
    }

    fn pool(store: Arc<InMemoryHistoryStore>, config: WorkerPoolConfig) -> WorkerPool<InMemoryHistoryStore> {
        let mut registry = ActivityRegistry::new();
        registry.register(Double);
        WorkerPool::new(store, Arc::new(registry), config)
    }

    async fn enqueue(store: &InMemoryHistoryStore, activity_type: &str, queue: &str) -> Uuid {
        let instance_id = store
            .create_instance(NewInstance {
                workflow_type: "w".to_string(),
                workflow_version: 1,
                input: json!(null),
                business_key: None,
            })
            .await
            .unwrap()
            .id;
        store
            .enqueue_activity(
                ActivityTask {
                    instance_id,
                    step_index: 0,
                    command: ActivityCommand {
                        activity_type: activity_type.to_string(),
                        payload: json!(21),
                        options: ActivityOptions::default().with_queue(queue),
                        compensation: false,
                    },
                },
                chrono::Utc::now(),
            )
            .await
            .unwrap();
        instance_id
    }

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.queues, vec![DEFAULT_QUEUE.to_string()]);
        assert_eq!(config.max_concurrency, 10);
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new(vec!["double".to_string()])
            .with_worker_id("test-worker")
            .with_queues(vec!["emails".to_string()])
            .with_max_concurrency(0)
            .with_shutdown_timeout(Duration::from_secs(1));

        assert_eq!(config.worker_id, "test-worker");
        assert_eq!(config.queues, vec!["emails"]);
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_filter_defaults_to_registered_types() {
        let pool = pool(Arc::new(InMemoryHistoryStore::new()), WorkerPoolConfig::default());
        assert_eq!(pool.filter().activity_types, vec!["double".to_string()]);
    }

    #[tokio::test]
    async fn test_run_once_completes_tasks() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let pool = pool(Arc::clone(&store), WorkerPoolConfig::default());
        let instance_id = enqueue(&store, "double", DEFAULT_QUEUE).await;

        let outcomes = pool.run_once(10).await.unwrap();
        assert_eq!(outcomes, vec![ActivityOutcome::Completed]);
        assert_eq!(
            store.task_state(instance_id, 0),
            Some((TaskStatus::Completed, 1))
        );

        let history = store.load_history(instance_id).await.unwrap();
        assert_eq!(history.last().unwrap().result, Some(Value::from(42)));
    }

    #[tokio::test]
    async fn test_other_queues_are_left_alone() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let pool = pool(Arc::clone(&store), WorkerPoolConfig::default());
        enqueue(&store, "double", "emails").await;

        assert!(pool.run_once(10).await.unwrap().is_empty());
        assert_eq!(store.pending_task_count(), 1);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let config = WorkerPoolConfig::default()
            .with_poller(PollerConfig::new().with_min_interval(Duration::from_millis(5)));
        let pool = Arc::new(pool(Arc::clone(&store), config));
        let instance_id = enqueue(&store, "double", DEFAULT_QUEUE).await;

        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(WorkerPoolError::AlreadyRunning)));

        for _ in 0..100 {
            if store.task_state(instance_id, 0).map(|(s, _)| s) == Some(TaskStatus::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        pool.shutdown().await.unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
        assert_eq!(
            store.task_state(instance_id, 0),
            Some((TaskStatus::Completed, 1))
        );
    }
}
