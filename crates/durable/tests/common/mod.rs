//! Shared harness for integration tests
//!
//! Wires an engine, scheduler and worker pool around one in-memory store and
//! a manual clock, and drives them until nothing is left to do.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use steadfast_durable::activity::{ActivityOutcome, ActivityRegistry};
use steadfast_durable::engine::{EngineConfig, StatusReport, WorkflowEngine};
use steadfast_durable::persistence::{InMemoryHistoryStore, InstanceStatus};
use steadfast_durable::scheduler::{PollSummary, Scheduler, SchedulerConfig};
use steadfast_durable::worker::{WorkerPool, WorkerPoolConfig};
use steadfast_durable::workflow::{EventType, HistoryEvent};
use steadfast_durable::ManualClock;
use uuid::Uuid;

pub struct TestEnv {
    pub store: Arc<InMemoryHistoryStore>,
    pub clock: ManualClock,
    pub engine: Arc<WorkflowEngine<InMemoryHistoryStore>>,
    pub scheduler: Scheduler<InMemoryHistoryStore>,
    pub pool: WorkerPool<InMemoryHistoryStore>,
}

impl TestEnv {
    pub fn new(
        register: impl FnOnce(&mut WorkflowEngine<InMemoryHistoryStore>),
        activities: ActivityRegistry,
    ) -> Self {
        Self::with_store(
            Arc::new(InMemoryHistoryStore::new()),
            ManualClock::default(),
            register,
            activities,
        )
    }

    /// Build on an existing store, e.g. to simulate a redeploy with new code
    pub fn with_store(
        store: Arc<InMemoryHistoryStore>,
        clock: ManualClock,
        register: impl FnOnce(&mut WorkflowEngine<InMemoryHistoryStore>),
        activities: ActivityRegistry,
    ) -> Self {
        let mut engine = WorkflowEngine::new(Arc::clone(&store))
            .with_config(EngineConfig::default())
            .with_clock(Arc::new(clock.clone()));
        register(&mut engine);
        let engine = Arc::new(engine);

        let scheduler = Scheduler::new(Arc::clone(&engine), SchedulerConfig::default());
        let pool = WorkerPool::new(
            Arc::clone(&store),
            Arc::new(activities),
            WorkerPoolConfig::default(),
        )
        .with_clock(Arc::new(clock.clone()));

        Self {
            store,
            clock,
            engine,
            scheduler,
            pool,
        }
    }

    /// Alternate scheduler ticks and worker rounds until both are idle
    pub async fn drive(&self) -> Drive {
        let mut drive = Drive::default();
        for _ in 0..50 {
            let summary = self.scheduler.poll_and_dispatch().await.unwrap();
            let outcomes = self.pool.run_once(10).await.unwrap();
            let idle = summary.is_idle() && outcomes.is_empty();
            drive.ticks.push(summary);
            drive.activity_outcomes.extend(outcomes);
            if idle {
                return drive;
            }
        }
        panic!("instances still busy after 50 rounds");
    }

    /// Advance the manual clock and drive
    pub async fn advance(&self, by: Duration) -> Drive {
        self.clock.advance(by);
        self.drive().await
    }

    pub async fn status(&self, id: Uuid) -> StatusReport {
        self.engine.get_status(id).await.unwrap()
    }

    pub async fn history(&self, id: Uuid) -> Vec<HistoryEvent> {
        self.engine.history(id).await.unwrap()
    }

    pub async fn count_events(&self, id: Uuid, event_type: EventType) -> usize {
        self.history(id)
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub async fn assert_completed(&self, id: Uuid) -> Value {
        let status = self.status(id).await;
        assert_eq!(status.status, InstanceStatus::Completed, "{status:?}");
        status.result.unwrap()
    }
}

#[derive(Debug, Default)]
pub struct Drive {
    pub ticks: Vec<PollSummary>,
    pub activity_outcomes: Vec<ActivityOutcome>,
}

impl Drive {
    pub fn timers_fired(&self) -> usize {
        self.ticks.iter().map(|t| t.timers_fired).sum()
    }
}
