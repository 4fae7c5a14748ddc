//! Replay of workflow code against recorded history
//!
//! A run re-executes the workflow body from the start. Each command the body
//! issues takes the next step index and is looked up in history:
//!
//! - issue and resolution recorded: the recorded result is returned in memory
//! - issue recorded, no resolution: the step is pending on the outside world
//! - nothing recorded: the step is new frontier work to persist and dispatch
//!
//! The body is polled exactly once. Steps resolve synchronously, so a body
//! that is not finished after one poll is blocked on its frontier.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use super::registry::AnyWorkflow;
use crate::activity::ActivityError;
use crate::workflow::{
    ActivityOptions, Command, EventType, HistoryEvent, NewEvent, WorkflowError, WorkflowSignal,
    WorkflowState,
};

/// Result a step yields back into workflow code
pub(crate) type StepOutcome = Result<Value, ActivityError>;

/// Replayed code disagrees with recorded history
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("non-deterministic workflow at step {step_index}: replay produced {replayed}, history has {recorded}")]
pub struct NonDeterminismError {
    pub step_index: u32,
    /// What the current code did at this step
    pub replayed: String,
    /// What history recorded for this step
    pub recorded: String,
}

/// A command the instance is blocked on after a run
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub step_index: u32,
    pub command: Command,
    /// Issued during this run (otherwise it was already in history)
    pub newly_issued: bool,
}

/// Per-run replay bookkeeping shared by all clones of a `WorkflowContext`
pub(crate) struct ReplayState {
    instance_id: Uuid,
    workflow: Arc<dyn AnyWorkflow>,
    run_started_at: DateTime<Utc>,
    default_activity_options: ActivityOptions,

    issued: HashMap<u32, HistoryEvent>,
    resolutions: HashMap<u32, HistoryEvent>,
    signals: Vec<HistoryEvent>,
    last_recorded_step: Option<u32>,

    next_step: u32,
    signal_cursors: HashMap<String, usize>,
    delivered_signals: usize,
    watermark: i64,
    state: WorkflowState,

    new_events: Vec<NewEvent>,
    pending: Vec<PendingCommand>,
    divergence: Option<NonDeterminismError>,
}

impl ReplayState {
    pub(crate) fn new(
        instance_id: Uuid,
        workflow: Arc<dyn AnyWorkflow>,
        history: Vec<HistoryEvent>,
        run_started_at: DateTime<Utc>,
        default_activity_options: ActivityOptions,
    ) -> Self {
        let mut issued = HashMap::new();
        let mut resolutions = HashMap::new();
        let mut signals = Vec::new();
        let mut last_recorded_step: Option<u32> = None;

        for event in history {
            match (event.event_type, event.step_index) {
                (t, Some(step)) if t.is_step_issue() => {
                    last_recorded_step = Some(last_recorded_step.map_or(step, |s| s.max(step)));
                    issued.insert(step, event);
                }
                (t, Some(step)) if t.is_resolution() => {
                    resolutions.insert(step, event);
                }
                (EventType::SignalReceived, _) => signals.push(event),
                _ => {}
            }
        }
        signals.sort_by_key(|e| e.sequence_number);

        Self {
            instance_id,
            workflow,
            run_started_at,
            default_activity_options,
            issued,
            resolutions,
            signals,
            last_recorded_step,
            next_step: 0,
            signal_cursors: HashMap::new(),
            delivered_signals: 0,
            watermark: 0,
            state: WorkflowState::new(),
            new_events: Vec::new(),
            pending: Vec::new(),
            divergence: None,
        }
    }

    pub(crate) fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub(crate) fn run_started_at(&self) -> DateTime<Utc> {
        self.run_started_at
    }

    pub(crate) fn default_activity_options(&self) -> &ActivityOptions {
        &self.default_activity_options
    }

    pub(crate) fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// True while the next step is still covered by recorded history
    pub(crate) fn is_replaying(&self) -> bool {
        self.last_recorded_step
            .is_some_and(|last| self.next_step <= last)
    }

    /// Issue a command for the next step; `None` means the step blocks
    pub(crate) fn issue(&mut self, command: Command) -> Option<StepOutcome> {
        if self.divergence.is_some() {
            return None;
        }
        let step = self.next_step;
        self.next_step += 1;

        let (recorded_command, recorded_result) = match self.issued.get(&step) {
            Some(recorded) => (recorded.command.clone(), recorded.result.clone()),
            None => return self.issue_new(step, command),
        };

        // The recorded command wins: a timer keeps its original due time
        let recorded_command = match recorded_command {
            Some(recorded) if command.matches(&recorded) => recorded,
            other => {
                self.diverge(step, command.describe(), describe_recorded(other.as_ref()));
                return None;
            }
        };

        match &command {
            Command::SideEffect(_) => {
                // Side effects do not move the watermark: their sequence number
                // depends on when the next batch was written.
                Some(Ok(recorded_result.unwrap_or(Value::Null)))
            }
            Command::SignalWait(wait) => {
                let consumed = self.consume_signal(&wait.signal_name);
                match consumed {
                    Some((sequence, value)) => {
                        self.advance_watermark(sequence);
                        Some(Ok(value))
                    }
                    None => {
                        self.block(step, recorded_command, false);
                        None
                    }
                }
            }
            Command::Activity(_) | Command::Timer(_) => match self.resolutions.get(&step) {
                Some(resolution) => {
                    let sequence = resolution.sequence_number;
                    let outcome = resolution_outcome(resolution);
                    self.advance_watermark(sequence);
                    Some(outcome)
                }
                None => {
                    self.block(step, recorded_command, false);
                    None
                }
            },
        }
    }

    fn issue_new(&mut self, step: u32, command: Command) -> Option<StepOutcome> {
        if let Some(last) = self.last_recorded_step {
            if step <= last {
                self.diverge(step, command.describe(), "no command".to_string());
                return None;
            }
        }
        if matches!(command, Command::SideEffect(_)) {
            // Side effects go through record_side_effect
            self.diverge(step, command.describe(), "no command".to_string());
            return None;
        }

        self.new_events
            .push(NewEvent::command_issued(step, command.clone()));

        if let Command::SignalWait(wait) = &command {
            // A buffered signal resolves the wait right away
            if let Some((sequence, value)) = self.consume_signal(&wait.signal_name) {
                self.advance_watermark(sequence);
                return Some(Ok(value));
            }
        }

        self.block(step, command, true);
        None
    }

    /// Return the recorded value or capture a new one from `producer`
    pub(crate) fn record_side_effect<F>(&mut self, producer: F) -> Option<Result<Value, WorkflowError>>
    where
        F: FnOnce() -> Result<Value, serde_json::Error>,
    {
        if self.divergence.is_some() {
            return None;
        }
        let command = Command::side_effect();
        if self.issued.contains_key(&self.next_step) {
            return self.issue(command).map(|o| o.map_err(WorkflowError::from));
        }

        let step = self.next_step;
        self.next_step += 1;
        if let Some(last) = self.last_recorded_step {
            if step <= last {
                self.diverge(step, command.describe(), "no command".to_string());
                return None;
            }
        }

        match producer() {
            Ok(value) => {
                self.new_events
                    .push(NewEvent::side_effect_recorded(step, value.clone()));
                Some(Ok(value))
            }
            Err(e) => Some(Err(WorkflowError::from(e))),
        }
    }

    /// Completed runs must have replayed every recorded step
    pub(crate) fn check_fully_replayed(&mut self) {
        if self.divergence.is_some() {
            return;
        }
        if let Some(last) = self.last_recorded_step {
            if last >= self.next_step {
                let recorded = self
                    .issued
                    .get(&self.next_step)
                    .and_then(|e| e.command.as_ref())
                    .map(Command::describe)
                    .unwrap_or_else(|| format!("step {last}"));
                self.diverge(self.next_step, "workflow return".to_string(), recorded);
            }
        }
    }

    pub(crate) fn pending(&self) -> &[PendingCommand] {
        &self.pending
    }

    /// Drain what the run produced
    pub(crate) fn take_parts(&mut self) -> (Vec<NewEvent>, Vec<PendingCommand>, Option<NonDeterminismError>) {
        (
            std::mem::take(&mut self.new_events),
            std::mem::take(&mut self.pending),
            self.divergence.take(),
        )
    }

    fn block(&mut self, step_index: u32, command: Command, newly_issued: bool) {
        self.pending.push(PendingCommand {
            step_index,
            command,
            newly_issued,
        });
    }

    fn diverge(&mut self, step_index: u32, replayed: String, recorded: String) {
        if self.divergence.is_none() {
            self.divergence = Some(NonDeterminismError {
                step_index,
                replayed,
                recorded,
            });
        }
    }

    /// FIFO per name: the n-th wait on a name takes the n-th signal with it
    fn consume_signal(&mut self, name: &str) -> Option<(i64, Value)> {
        let cursor = self.signal_cursors.entry(name.to_string()).or_insert(0);
        let event = self
            .signals
            .iter()
            .filter(|e| e.signal.as_ref().is_some_and(|s| s.name == name))
            .nth(*cursor)?;
        *cursor += 1;

        let value = event
            .signal
            .as_ref()
            .and_then(|s| serde_json::to_value(s).ok())
            .unwrap_or(Value::Null);
        Some((event.sequence_number, value))
    }

    /// Deliver every signal recorded at or before `sequence` to the handler
    fn advance_watermark(&mut self, sequence: i64) {
        self.watermark = self.watermark.max(sequence);
        while let Some(event) = self.signals.get(self.delivered_signals) {
            if event.sequence_number > self.watermark {
                break;
            }
            if let Some(signal) = &event.signal {
                self.workflow.handle_signal(&mut self.state, signal);
            }
            self.delivered_signals += 1;
        }
    }
}

fn describe_recorded(command: Option<&Command>) -> String {
    command
        .map(Command::describe)
        .unwrap_or_else(|| "an event without a command".to_string())
}

fn resolution_outcome(event: &HistoryEvent) -> StepOutcome {
    match event.event_type {
        EventType::ActivityFailed => Err(event
            .activity_error()
            .unwrap_or_else(|| ActivityError::non_retryable("activity failed"))),
        _ => Ok(event.result.clone().unwrap_or(Value::Null)),
    }
}

/// Future of a single step, decided when the command was issued
pub(crate) struct Step {
    outcome: Option<StepOutcome>,
}

impl Step {
    pub(crate) fn new(outcome: Option<StepOutcome>) -> Self {
        Self { outcome }
    }
}

impl Future for Step {
    type Output = StepOutcome;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut().outcome.take() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

/// Poll a future once with a waker that never fires
pub(crate) fn poll_once<T>(fut: &mut BoxFuture<'_, T>) -> Poll<T> {
    let mut cx = Context::from_waker(futures::task::noop_waker_ref());
    fut.as_mut().poll(&mut cx)
}

/// Poll once and turn a panic in workflow code into a workflow error
pub(crate) fn poll_workflow(
    fut: &mut BoxFuture<'_, Result<Value, WorkflowError>>,
) -> Poll<Result<Value, WorkflowError>> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| poll_once(fut))) {
        Ok(poll) => poll,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "workflow panicked".to_string());
            Poll::Ready(Err(WorkflowError::new(message).with_code("PANIC")))
        }
    }
}

/// Decode a signal wait result
pub(crate) fn decode_signal(value: Value) -> Result<WorkflowSignal, WorkflowError> {
    serde_json::from_value(value).map_err(WorkflowError::from)
}
