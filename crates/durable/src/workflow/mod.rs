//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining workflows as async functions
//! - [`WorkflowContext`] for issuing commands during replay
//! - [`Command`] enum for the instructions a workflow yields
//! - [`HistoryEvent`] for persisted history rows
//! - [`WorkflowSignal`] for external communication
//! - [`Saga`] for explicit compensation

mod command;
mod context;
mod definition;
mod event;
mod saga;
mod signal;
mod state;

pub use command::{
    ActivityCommand, ActivityOptions, Command, SideEffectCommand, SignalWaitCommand, TimerCommand,
    DEFAULT_QUEUE,
};
pub use context::WorkflowContext;
pub use definition::{Workflow, WorkflowError};
pub use event::{EventType, HistoryEvent, NewEvent};
pub use saga::Saga;
pub use signal::WorkflowSignal;
pub use state::WorkflowState;
