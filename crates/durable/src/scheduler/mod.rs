//! Scheduler / runner
//!
//! Finds instances with work to do and replays them:
//! - [`Scheduler::poll_and_dispatch`] - one tick (fire timers, lease, replay)
//! - [`Scheduler::run`] - tick with backoff until shutdown

mod runner;

pub use runner::{PollSummary, Scheduler, SchedulerConfig, SchedulerError};
