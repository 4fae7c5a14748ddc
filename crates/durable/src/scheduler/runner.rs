//! Scheduler loop: fire timers, lease runnable instances, replay them

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{env_millis_or, env_or, env_string_or};
use crate::engine::{EngineError, EngineOutcome, WorkflowEngine};
use crate::persistence::{HistoryStore, StoreError};
use crate::reliability::duration_millis;
use crate::worker::{Poller, PollerConfig};

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Lease owner name written to claimed instances
    pub owner_id: String,

    /// How long a claimed instance stays leased without being released
    #[serde(with = "duration_millis")]
    pub lease_ttl: Duration,

    /// Timers fired per tick
    pub timer_batch_size: usize,

    /// Instances replayed concurrently
    pub max_concurrent: usize,

    /// Poll interval and instance batch size
    pub poller: PollerConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            owner_id: format!("scheduler-{}", Uuid::now_v7()),
            lease_ttl: Duration::from_secs(60),
            timer_batch_size: 100,
            max_concurrent: 8,
            poller: PollerConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Read `STEADFAST_SCHEDULER_*` overrides from the environment
    ///
    /// - `STEADFAST_SCHEDULER_ID`
    /// - `STEADFAST_SCHEDULER_LEASE_TTL_MS`
    /// - `STEADFAST_SCHEDULER_TIMER_BATCH_SIZE`
    /// - `STEADFAST_SCHEDULER_MAX_CONCURRENT`
    /// - `STEADFAST_SCHEDULER_POLL_MIN_MS`, `STEADFAST_SCHEDULER_POLL_MAX_MS`, `STEADFAST_SCHEDULER_BATCH_SIZE`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            owner_id: env_string_or("SCHEDULER_ID", defaults.owner_id),
            lease_ttl: env_millis_or("SCHEDULER_LEASE_TTL_MS", defaults.lease_ttl),
            timer_batch_size: env_or("SCHEDULER_TIMER_BATCH_SIZE", defaults.timer_batch_size)
                .max(1),
            max_concurrent: env_or("SCHEDULER_MAX_CONCURRENT", defaults.max_concurrent).max(1),
            poller: PollerConfig::from_env("SCHEDULER_"),
        }
    }

    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }
}

/// Counts from one scheduler tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub timers_fired: usize,
    pub instances_claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub suspended: usize,
    pub quarantined: usize,
    pub errors: usize,
}

impl PollSummary {
    /// Whether the tick found anything to do
    pub fn is_idle(&self) -> bool {
        self.timers_fired == 0 && self.instances_claimed == 0
    }

    fn record(&mut self, outcome: &Result<EngineOutcome, EngineError>) {
        match outcome {
            Ok(EngineOutcome::Completed { .. }) => self.completed += 1,
            Ok(EngineOutcome::Failed { .. }) => self.failed += 1,
            Ok(EngineOutcome::Suspended { .. }) => self.suspended += 1,
            Ok(EngineOutcome::Quarantined { .. }) | Err(EngineError::NonDeterminism(_)) => {
                self.quarantined += 1
            }
            Ok(EngineOutcome::AlreadyTerminal { .. }) => {}
            Err(_) => self.errors += 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Drives instances forward
///
/// Each tick fires due timers, leases runnable instances and replays them
/// through the engine. The store lease keeps other processes away from an
/// instance; the in-process lock map keeps two ticks of this process apart.
///
/// # Example
///
/// ```ignore
/// let scheduler = Scheduler::new(Arc::new(engine), SchedulerConfig::from_env());
/// let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
/// tokio::spawn(async move { scheduler.run(shutdown_rx).await });
/// ```
pub struct Scheduler<S: HistoryStore> {
    engine: Arc<WorkflowEngine<S>>,
    config: SchedulerConfig,
    in_flight: DashMap<Uuid, ()>,
}

impl<S: HistoryStore> Scheduler<S> {
    pub fn new(engine: Arc<WorkflowEngine<S>>, config: SchedulerConfig) -> Self {
        Self {
            engine,
            config,
            in_flight: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine<S>> {
        &self.engine
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one tick
    #[instrument(skip(self), fields(owner = %self.config.owner_id))]
    pub async fn poll_and_dispatch(&self) -> Result<PollSummary, SchedulerError> {
        let mut summary = PollSummary::default();

        let fired = self
            .engine
            .timers()
            .fire_due(self.config.timer_batch_size)
            .await?;
        summary.timers_fired = fired.len();

        let claimed = self
            .engine
            .store()
            .claim_runnable(
                &self.config.owner_id,
                self.engine.clock().now(),
                self.config.lease_ttl,
                self.config.poller.batch_size,
            )
            .await?;
        summary.instances_claimed = claimed.len();

        let outcomes: Vec<_> = stream::iter(claimed)
            .map(|instance_id| self.drive(instance_id))
            .buffer_unordered(self.config.max_concurrent)
            .collect()
            .await;

        for outcome in outcomes.iter().flatten() {
            summary.record(outcome);
        }

        if !summary.is_idle() {
            debug!(?summary, "scheduler tick");
        }
        Ok(summary)
    }

    /// Tick until shutdown is signaled
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut poller = Poller::new(self.config.poller.clone(), shutdown);
        info!(owner = %self.config.owner_id, "scheduler started");

        loop {
            if poller.is_shutdown() {
                break;
            }

            match self.poll_and_dispatch().await {
                Ok(summary) => {
                    poller.record(summary.timers_fired + summary.instances_claimed)
                }
                Err(e) => {
                    poller.record(0);
                    error!(error = %e, "scheduler tick failed");
                }
            }

            if poller.wait().await {
                break;
            }
        }

        info!(owner = %self.config.owner_id, "scheduler stopped");
    }

    /// Replay one leased instance and drop the lease
    ///
    /// `None` when this process is already executing the instance.
    async fn drive(&self, instance_id: Uuid) -> Option<Result<EngineOutcome, EngineError>> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, instance_id) else {
            debug!(%instance_id, "instance already executing in this process");
            return None;
        };

        let outcome = self.engine.execute(instance_id).await;
        match &outcome {
            Ok(_) => {}
            Err(EngineError::NonDeterminism(e)) => {
                warn!(%instance_id, error = %e, "instance quarantined")
            }
            Err(e) => error!(%instance_id, error = %e, "workflow execution failed"),
        }

        if let Err(e) = self
            .engine
            .store()
            .release_lease(instance_id, &self.config.owner_id)
            .await
        {
            warn!(%instance_id, error = %e, "failed to release lease");
        }
        Some(outcome)
    }
}

/// Entry in the in-process lock map, removed on drop
struct InFlightGuard<'a> {
    map: &'a DashMap<Uuid, ()>,
    instance_id: Uuid,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(map: &'a DashMap<Uuid, ()>, instance_id: Uuid) -> Option<Self> {
        match map.entry(instance_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(());
                Some(Self { map, instance_id })
            }
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.instance_id);
    }
}
