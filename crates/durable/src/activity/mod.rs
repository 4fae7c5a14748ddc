//! Activity abstractions
//!
//! Activities are units of external work that are executed by workers. They:
//! - May fail and be retried according to the command's retry policy
//! - Are bounded by a per-attempt timeout
//! - May define a failure hook and a compensation

mod context;
mod definition;
mod executor;
mod registry;

pub use context::ActivityContext;
pub use definition::{Activity, ActivityError};
pub use executor::{ActivityExecutor, ActivityOutcome, ExecutorError};
pub use registry::{ActivityRegistry, AnyActivity};
