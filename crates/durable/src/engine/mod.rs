//! Workflow execution engine
//!
//! The engine module provides the [`WorkflowEngine`], which replays workflow
//! code against persisted history and dispatches the commands it blocks on.

mod executor;
mod registry;
pub(crate) mod replay;
mod timer;

pub use executor::{EngineConfig, EngineError, EngineOutcome, StatusReport, WorkflowEngine};
pub use registry::{AnyWorkflow, RegistryError, WorkflowRegistry};
pub use replay::{NonDeterminismError, PendingCommand};
pub use timer::TimerService;
