//! Worker pool for activity execution
//!
//! This module provides:
//! - [`WorkerPool`] - Claims activity tasks and runs them with bounded concurrency
//! - [`Poller`] / [`PollerConfig`] - Polling with exponential backoff, shared with the scheduler
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  ┌─────────────┐                     ┌─────────────────────┐ │
//! │  │   Poller    │                     │  Stale Reclaimer    │ │
//! │  │  (backoff)  │                     │     (30s)           │ │
//! │  └──────┬──────┘                     └─────────────────────┘ │
//! │         │ claim_activities(queues, types)                    │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │       ActivityExecutor (Semaphore-limited)          │    │
//! │  │  [Task 1] [Task 2] [Task 3] ... [Task N]            │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use steadfast_durable::worker::{WorkerPool, WorkerPoolConfig};
//!
//! let config = WorkerPoolConfig::default()
//!     .with_worker_id("email-worker-1")
//!     .with_queues(vec!["emails".to_string()])
//!     .with_max_concurrency(20);
//!
//! let pool = Arc::new(WorkerPool::new(store, Arc::new(activities), config));
//! pool.start()?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```

mod poller;
mod pool;

pub use poller::{Poller, PollerConfig};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
