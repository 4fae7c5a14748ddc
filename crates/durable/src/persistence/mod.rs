//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`HistoryStore`] trait for instances, history, timers and the activity queue
//! - [`InMemoryHistoryStore`] for testing
//! - [`PostgresHistoryStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryHistoryStore;
pub use postgres::{PostgresHistoryStore, MIGRATOR};
pub use store::{
    ActivityFilter, ActivityTask, ClaimedActivity, CreatedInstance, HistoryStore,
    InstanceOutcome, InstanceStatus, NewInstance, StoreError, TaskStatus, TimerRecord,
    WorkflowInstance,
};
