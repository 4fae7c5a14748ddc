//! # Steadfast Durable
//!
//! A replay-based durable workflow engine backed by PostgreSQL.
//!
//! ## Features
//!
//! - **Workflows as plain async code**: state is rebuilt by replaying an append-only history
//! - **Activities**: external work with per-attempt timeouts, durable retries and compensation
//! - **Durable timers**: sleeps of days or months survive restarts
//! - **Signals**: buffered external events delivered in order
//! - **Versioning**: instances stay pinned to the definition version that started them
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                             │
//! │  (fires due timers, leases runnable instances)               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                          │
//! │  (replays history through workflow code, records frontier)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       HistoryStore                           │
//! │  (PostgreSQL: instances, history, timers, activity tasks)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │  (claims activity tasks, runs them, records results)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use steadfast_durable::prelude::*;
//!
//! struct Onboarding;
//!
//! #[async_trait]
//! impl Workflow for Onboarding {
//!     const TYPE: &'static str = "onboarding";
//!     type Input = NewUser;
//!     type Output = String;
//!
//!     async fn execute(&self, ctx: WorkflowContext, input: NewUser) -> Result<String, WorkflowError> {
//!         let user = ctx.activity::<CreateUserRecord>(input).await?;
//!         ctx.activity::<SendWelcomeEmail>(user.clone()).await?;
//!         ctx.sleep(Duration::from_secs(3 * 24 * 3600)).await;
//!         ctx.activity::<SendFollowUpEmail>(user.clone()).await?;
//!         Ok(format!("Onboarding complete for user: {}", user.id))
//!     }
//! }
//! ```

pub mod activity;
pub mod clock;
pub mod config;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod scheduler;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::engine::{
        EngineConfig, EngineError, EngineOutcome, StatusReport, WorkflowEngine, WorkflowRegistry,
    };
    pub use crate::persistence::{
        HistoryStore, InMemoryHistoryStore, InstanceStatus, PostgresHistoryStore, StoreError,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::scheduler::{Scheduler, SchedulerConfig};
    pub use crate::worker::{WorkerPool, WorkerPoolConfig};
    pub use crate::workflow::{
        ActivityOptions, Saga, Workflow, WorkflowContext, WorkflowError, WorkflowSignal,
        WorkflowState,
    };
    pub use async_trait::async_trait;
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{EngineConfig, EngineError, EngineOutcome, WorkflowEngine, WorkflowRegistry};
pub use persistence::{HistoryStore, InMemoryHistoryStore, PostgresHistoryStore, StoreError};
pub use reliability::RetryPolicy;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{ActivityOptions, Workflow, WorkflowContext, WorkflowError, WorkflowSignal};
