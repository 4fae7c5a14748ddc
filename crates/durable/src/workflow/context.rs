//! Workflow execution context

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{ActivityOptions, Command, WorkflowError, WorkflowSignal};
use crate::activity::{Activity, ActivityError};
use crate::clock::to_chrono;
use crate::engine::replay::{decode_signal, ReplayState, Step};

/// Handle workflow code uses to issue commands
///
/// Every method that returns a future takes the next step index at call time,
/// so commands are numbered in program order. Await them in sequence; a
/// future that is not ready means the instance suspends at that step.
///
/// # Example
///
/// ```ignore
/// let user: CreatedUser = ctx.activity::<CreateUserRecord>(input).await?;
/// ctx.sleep(Duration::from_secs(3 * 24 * 3600)).await;
/// let approval = ctx.wait_signal("approval").await?;
/// let request_id = ctx.new_uuid().await?;
/// ```
#[derive(Clone)]
pub struct WorkflowContext {
    replay: Arc<Mutex<ReplayState>>,
    instance_id: Uuid,
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl WorkflowContext {
    pub(crate) fn new(replay: Arc<Mutex<ReplayState>>) -> Self {
        let instance_id = replay.lock().instance_id();
        Self {
            replay,
            instance_id,
        }
    }

    /// Instance this run belongs to
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Whether the next command is answered from history
    ///
    /// Useful to keep logs quiet during replay.
    pub fn is_replaying(&self) -> bool {
        self.replay.lock().is_replaying()
    }

    /// Engine-wide activity defaults, the base for per-command overrides
    pub fn default_activity_options(&self) -> ActivityOptions {
        self.replay.lock().default_activity_options().clone()
    }

    /// Read a value folded in by `Workflow::handle_signal`
    pub fn state<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.replay.lock().state().get(key)
    }

    // =========================================================================
    // Activities
    // =========================================================================

    /// Run an activity with the engine's default options
    pub fn activity<A: Activity>(
        &self,
        input: A::Input,
    ) -> impl Future<Output = Result<A::Output, ActivityError>> + Send + 'static {
        let options = self.default_activity_options();
        self.activity_with_options::<A>(input, options)
    }

    /// Run an activity with explicit options
    pub fn activity_with_options<A: Activity>(
        &self,
        input: A::Input,
        options: ActivityOptions,
    ) -> impl Future<Output = Result<A::Output, ActivityError>> + Send + 'static {
        let step = match serde_json::to_value(&input) {
            Ok(payload) => self.step(Command::activity(A::TYPE, payload, options)),
            Err(e) => Step::new(Some(Err(encode_error(e)))),
        };
        async move {
            let value = step.await?;
            serde_json::from_value(value).map_err(decode_error)
        }
    }

    /// Run an activity by name with a raw JSON payload
    pub fn call_activity(
        &self,
        activity_type: impl Into<String>,
        payload: Value,
        options: ActivityOptions,
    ) -> impl Future<Output = Result<Value, ActivityError>> + Send + 'static {
        self.step(Command::activity(activity_type, payload, options))
    }

    /// Invoke an activity's compensation with the payload of the original call
    pub fn compensate<A: Activity>(
        &self,
        original_input: A::Input,
    ) -> impl Future<Output = Result<Value, ActivityError>> + Send + 'static {
        let options = self.default_activity_options();
        match serde_json::to_value(&original_input) {
            Ok(payload) => self.step(Command::compensation(A::TYPE, payload, options)),
            Err(e) => Step::new(Some(Err(encode_error(e)))),
        }
    }

    /// Compensate an activity by name
    pub fn compensate_raw(
        &self,
        activity_type: impl Into<String>,
        original_payload: Value,
    ) -> impl Future<Output = Result<Value, ActivityError>> + Send + 'static {
        let options = self.default_activity_options();
        self.step(Command::compensation(activity_type, original_payload, options))
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Suspend for `duration`, measured from when the timer is first issued
    pub fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send + 'static {
        let started = self.replay.lock().run_started_at();
        let fire_at = started
            .checked_add_signed(to_chrono(duration))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.sleep_until(fire_at)
    }

    /// Suspend until `fire_at`
    pub fn sleep_until(&self, fire_at: DateTime<Utc>) -> impl Future<Output = ()> + Send + 'static {
        let step = self.step(Command::timer(fire_at));
        async move {
            // Timers never fail
            let _ = step.await;
        }
    }

    // =========================================================================
    // Side effects
    // =========================================================================

    /// Run `producer` once per instance and replay its recorded value afterwards
    pub fn side_effect<T, F>(
        &self,
        producer: F,
    ) -> impl Future<Output = Result<T, WorkflowError>> + Send + 'static
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> T,
    {
        let recorded = self
            .replay
            .lock()
            .record_side_effect(|| serde_json::to_value(producer()));
        async move {
            match recorded {
                Some(value) => serde_json::from_value(value?).map_err(WorkflowError::from),
                None => futures::future::pending().await,
            }
        }
    }

    /// Current time, recorded on first execution
    pub fn now(&self) -> impl Future<Output = Result<DateTime<Utc>, WorkflowError>> + Send + 'static {
        self.side_effect(Utc::now)
    }

    /// Fresh UUID, recorded on first execution
    pub fn new_uuid(&self) -> impl Future<Output = Result<Uuid, WorkflowError>> + Send + 'static {
        self.side_effect(Uuid::now_v7)
    }

    // =========================================================================
    // Signals
    // =========================================================================

    /// Wait for the next unconsumed signal with this name
    ///
    /// Signals that arrived earlier are buffered and consumed in arrival order.
    /// Several waits may be pending at once (for example under
    /// `futures::future::select`); a signal for any of them resumes the run.
    pub fn wait_signal(
        &self,
        signal_name: impl Into<String>,
    ) -> impl Future<Output = Result<WorkflowSignal, WorkflowError>> + Send + 'static {
        let step = self.step(Command::signal_wait(signal_name));
        async move {
            let value = step.await.map_err(WorkflowError::from)?;
            decode_signal(value)
        }
    }

    /// Wait for a signal and decode its payload
    pub fn wait_signal_as<T: DeserializeOwned + Send + 'static>(
        &self,
        signal_name: impl Into<String>,
    ) -> impl Future<Output = Result<T, WorkflowError>> + Send + 'static {
        let signal = self.wait_signal(signal_name);
        async move {
            let signal = signal.await?;
            signal.payload_as().map_err(WorkflowError::from)
        }
    }

    fn step(&self, command: Command) -> Step {
        Step::new(self.replay.lock().issue(command))
    }
}

fn encode_error(err: serde_json::Error) -> ActivityError {
    ActivityError::non_retryable(format!("failed to encode activity input: {err}"))
        .with_type("SERIALIZATION")
}

fn decode_error(err: serde_json::Error) -> ActivityError {
    ActivityError::non_retryable(format!("failed to decode activity output: {err}"))
        .with_type("SERIALIZATION")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::AnyWorkflow;
    use crate::workflow::{NewEvent, WorkflowState};
    use async_trait::async_trait;
    use futures::future::BoxFuture;
    use serde::Deserialize;
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready, task};

    struct Placeholder;

    impl AnyWorkflow for Placeholder {
        fn workflow_type(&self) -> &'static str {
            "placeholder"
        }

        fn version(&self) -> u32 {
            1
        }

        fn run(&self, _ctx: WorkflowContext, _input: Value) -> BoxFuture<'_, Result<Value, WorkflowError>> {
            Box::pin(async { Ok(Value::Null) })
        }

        fn handle_signal(&self, _state: &mut WorkflowState, _signal: &WorkflowSignal) {}
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Greeting {
        name: String,
    }

    struct Greet;

    #[async_trait]
    impl Activity for Greet {
        const TYPE: &'static str = "greet";
        type Input = Greeting;
        type Output = String;

        async fn execute(
            &self,
            _ctx: &crate::activity::ActivityContext,
            input: Self::Input,
        ) -> Result<Self::Output, ActivityError> {
            Ok(format!("hello {}", input.name))
        }
    }

    fn context(history: Vec<NewEvent>) -> (WorkflowContext, Arc<Mutex<ReplayState>>) {
        let instance_id = Uuid::now_v7();
        let history = history
            .into_iter()
            .enumerate()
            .map(|(i, e)| e.into_event(instance_id, i as i64 + 1, Utc::now()))
            .collect();
        let replay = Arc::new(Mutex::new(ReplayState::new(
            instance_id,
            Arc::new(Placeholder),
            history,
            Utc::now(),
            ActivityOptions::default(),
        )));
        (WorkflowContext::new(replay.clone()), replay)
    }

    #[test]
    fn test_activity_is_pending_at_frontier() {
        let (ctx, replay) = context(vec![]);

        let mut fut = task::spawn(ctx.activity::<Greet>(Greeting {
            name: "ada".to_string(),
        }));
        assert_pending!(fut.poll());

        let replay = replay.lock();
        let pending = replay.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].command,
            Command::activity("greet", json!({"name": "ada"}), ActivityOptions::default())
        );
    }

    #[test]
    fn test_activity_resolves_from_history() {
        let command = Command::activity("greet", json!({"name": "ada"}), ActivityOptions::default());
        let (ctx, _) = context(vec![
            NewEvent::command_issued(0, command),
            NewEvent::activity_completed(0, json!("hello ada")),
        ]);

        let mut fut = task::spawn(ctx.activity::<Greet>(Greeting {
            name: "ada".to_string(),
        }));
        let output = assert_ready!(fut.poll()).unwrap();

        assert_eq!(output, "hello ada");
        assert!(!ctx.is_replaying());
    }

    #[test]
    fn test_failed_activity_surfaces_error() {
        let command = Command::activity("greet", json!({"name": "ada"}), ActivityOptions::default());
        let (ctx, _) = context(vec![
            NewEvent::command_issued(0, command),
            NewEvent::activity_failed(0, &ActivityError::non_retryable("mailbox full")),
        ]);

        let mut fut = task::spawn(ctx.activity::<Greet>(Greeting {
            name: "ada".to_string(),
        }));
        let error = assert_ready!(fut.poll()).unwrap_err();

        assert_eq!(error.message, "mailbox full");
    }

    #[test]
    fn test_sleep_uses_run_start_time() {
        let (ctx, replay) = context(vec![]);
        let started = replay.lock().run_started_at();

        let mut fut = task::spawn(ctx.sleep(Duration::from_secs(60)));
        assert_pending!(fut.poll());

        let replay = replay.lock();
        assert_eq!(
            replay.pending()[0].command,
            Command::timer(started + chrono::Duration::seconds(60))
        );
    }

    #[test]
    fn test_side_effect_value_is_returned() {
        let (ctx, _) = context(vec![]);

        let mut fut = task::spawn(ctx.side_effect(|| 7u32));
        assert_eq!(assert_ready!(fut.poll()).unwrap(), 7);
    }

    #[test]
    fn test_signal_wait_uses_buffered_signal() {
        let (ctx, _) = context(vec![NewEvent::signal_received(WorkflowSignal::new(
            "approval",
            json!({"approved": true}),
        ))]);

        #[derive(Deserialize)]
        struct Approval {
            approved: bool,
        }

        let mut fut = task::spawn(ctx.wait_signal_as::<Approval>("approval"));
        let approval = assert_ready!(fut.poll()).unwrap();
        assert!(approval.approved);

        let mut next = task::spawn(ctx.wait_signal("approval"));
        assert_pending!(next.poll());
    }

    #[test]
    fn test_side_effect_replays_recorded_value() {
        let (ctx, _) = context(vec![NewEvent::side_effect_recorded(0, json!("recorded"))]);

        let mut fut = task::spawn(ctx.side_effect(|| "fresh".to_string()));
        assert_eq!(assert_ready!(fut.poll()).unwrap(), "recorded");
    }
}
