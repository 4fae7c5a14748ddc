//! In-memory implementation of HistoryStore for testing

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::workflow::{Command, EventType, HistoryEvent, NewEvent};

/// Internal instance state
struct InstanceRecord {
    instance: WorkflowInstance,
    history: Vec<HistoryEvent>,
    issued: HashSet<u32>,
    resolved: HashSet<u32>,
    runnable: bool,
    lease: Option<(String, DateTime<Utc>)>,
}

impl InstanceRecord {
    fn next_sequence(&self) -> i64 {
        self.history.len() as i64 + 1
    }

    fn ensure_not_terminal(&self) -> Result<(), StoreError> {
        if self.instance.status.is_terminal() {
            return Err(StoreError::InstanceTerminal(self.instance.id));
        }
        Ok(())
    }

    /// Validate the whole batch before writing anything
    fn check_batch(&self, events: &[NewEvent]) -> Result<(), StoreError> {
        let mut issued = HashSet::new();
        let mut resolved = HashSet::new();
        for event in events {
            let Some(step_index) = event.step_index else {
                continue;
            };
            let duplicate = if event.event_type.is_step_issue() {
                self.issued.contains(&step_index) || !issued.insert(step_index)
            } else if event.event_type.is_resolution() {
                self.resolved.contains(&step_index) || !resolved.insert(step_index)
            } else {
                false
            };
            if duplicate {
                return Err(StoreError::DuplicateStep {
                    instance_id: self.instance.id,
                    step_index,
                });
            }
        }
        Ok(())
    }

    fn push(&mut self, events: Vec<NewEvent>, now: DateTime<Utc>) -> i64 {
        let mut last = self.history.len() as i64;
        for event in events {
            match (event.event_type, event.step_index) {
                (t, Some(step)) if t.is_step_issue() => {
                    self.issued.insert(step);
                }
                (t, Some(step)) if t.is_resolution() => {
                    self.resolved.insert(step);
                    self.runnable = true;
                }
                (EventType::SignalReceived, _) => {
                    if let Some(signal) = &event.signal {
                        if self.instance.awaiting_signals.contains(&signal.name) {
                            self.runnable = true;
                        }
                    }
                }
                _ => {}
            }
            let sequence = self.next_sequence();
            self.history
                .push(event.into_event(self.instance.id, sequence, now));
            last = sequence;
        }
        self.instance.updated_at = now;
        last
    }

    /// Signals with `name` already outnumber the waits issued on it
    fn has_unconsumed_signal(&self, name: &str) -> bool {
        let waits = self
            .history
            .iter()
            .filter(|e| {
                matches!(&e.command, Some(Command::SignalWait(w)) if w.signal_name == name)
            })
            .count();
        let signals = self
            .history
            .iter()
            .filter(|e| e.signal.as_ref().is_some_and(|s| s.name == name))
            .count();
        signals >= waits
    }
}

/// Internal task state
struct TaskRecord {
    id: Uuid,
    task: ActivityTask,
    status: TaskStatus,
    attempt: u32,
    max_attempts: u32,
    visible_at: DateTime<Utc>,
    #[allow(dead_code)] // Kept for debugging
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    instances: HashMap<Uuid, InstanceRecord>,
    /// Live instances by (workflow_type, business_key)
    business_keys: HashMap<(String, String), Uuid>,
    timers: BTreeSet<(DateTime<Utc>, Uuid, u32)>,
    timer_keys: HashSet<(Uuid, u32)>,
    tasks: HashMap<Uuid, TaskRecord>,
    task_keys: HashMap<(Uuid, u32), Uuid>,
}

impl MemoryState {
    fn instance_mut(&mut self, instance_id: Uuid) -> Result<&mut InstanceRecord, StoreError> {
        self.instances
            .get_mut(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))
    }

    fn append(
        &mut self,
        instance_id: Uuid,
        events: Vec<NewEvent>,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let record = self.instance_mut(instance_id)?;
        record.ensure_not_terminal()?;
        record.check_batch(&events)?;
        Ok(record.push(events, now))
    }

    /// Append a task's resolution and close the task
    fn resolve_task(
        &mut self,
        task_id: Uuid,
        event: impl FnOnce(u32) -> NewEvent,
        closed_status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (instance_id, step_index) = {
            let task = self
                .tasks
                .get(&task_id)
                .ok_or(StoreError::TaskNotFound(task_id))?;
            (task.task.instance_id, task.task.step_index)
        };

        let appended = self.append(instance_id, vec![event(step_index)], now);
        let status = match &appended {
            Err(StoreError::InstanceTerminal(_)) => TaskStatus::Canceled,
            _ => closed_status,
        };
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.status = status;
            task.claimed_by = None;
        }
        appended.map(|_| ())
    }
}

/// In-memory implementation of HistoryStore
///
/// This is primarily for testing. It stores all data in memory behind a
/// single lock and provides the same semantics as the PostgreSQL
/// implementation.
///
/// # Example
///
/// ```
/// use steadfast_durable::InMemoryHistoryStore;
///
/// let store = InMemoryHistoryStore::new();
/// assert_eq!(store.instance_count(), 0);
/// ```
pub struct InMemoryHistoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryHistoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    /// Get the number of instances
    pub fn instance_count(&self) -> usize {
        self.state.read().instances.len()
    }

    /// Get the number of tasks waiting to be claimed
    pub fn pending_task_count(&self) -> usize {
        self.state
            .read()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Get the number of timers that have not fired
    pub fn pending_timer_count(&self) -> usize {
        self.state.read().timers.len()
    }

    /// Status and attempt counter of the task for a step
    pub fn task_state(&self, instance_id: Uuid, step_index: u32) -> Option<(TaskStatus, u32)> {
        let state = self.state.read();
        let task_id = state.task_keys.get(&(instance_id, step_index))?;
        state.tasks.get(task_id).map(|t| (t.status, t.attempt))
    }

    /// Last error recorded on the task for a step
    pub fn task_last_error(&self, instance_id: Uuid, step_index: u32) -> Option<String> {
        let state = self.state.read();
        let task_id = state.task_keys.get(&(instance_id, step_index))?;
        state.tasks.get(task_id).and_then(|t| t.last_error.clone())
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.state.write() = MemoryState::default();
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, new: NewInstance) -> Result<CreatedInstance, StoreError> {
        let mut state = self.state.write();

        let business_key = new
            .business_key
            .clone()
            .map(|key| (new.workflow_type.clone(), key));
        if let Some(key) = &business_key {
            if let Some(existing) = state.business_keys.get(key) {
                return Ok(CreatedInstance {
                    id: *existing,
                    created: false,
                });
            }
        }

        let now = Utc::now();
        let id = Uuid::now_v7();
        let instance = WorkflowInstance {
            id,
            workflow_type: new.workflow_type,
            workflow_version: new.workflow_version,
            business_key: new.business_key.clone(),
            input: new.input,
            status: InstanceStatus::Created,
            result: None,
            failure: None,
            quarantine_reason: None,
            awaiting_signals: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        if let Some(key) = business_key {
            state.business_keys.insert(key, id);
        }
        state.instances.insert(
            id,
            InstanceRecord {
                instance,
                history: Vec::new(),
                issued: HashSet::new(),
                resolved: HashSet::new(),
                runnable: true,
                lease: None,
            },
        );

        Ok(CreatedInstance { id, created: true })
    }

    async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, StoreError> {
        self.state
            .read()
            .instances
            .get(&instance_id)
            .map(|r| r.instance.clone())
            .ok_or(StoreError::InstanceNotFound(instance_id))
    }

    async fn set_status(
        &self,
        instance_id: Uuid,
        status: InstanceStatus,
        awaiting_signals: Vec<String>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let record = state.instance_mut(instance_id)?;
        record.ensure_not_terminal()?;

        // A signal appended while the run was in flight
        if awaiting_signals
            .iter()
            .any(|name| record.has_unconsumed_signal(name))
        {
            record.runnable = true;
        }
        record.instance.status = status;
        record.instance.awaiting_signals = awaiting_signals;
        record.instance.updated_at = Utc::now();
        Ok(())
    }

    async fn quarantine(&self, instance_id: Uuid, reason: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let record = state.instance_mut(instance_id)?;
        record.ensure_not_terminal()?;
        record.instance.quarantine_reason = Some(reason.to_string());
        record.instance.updated_at = Utc::now();
        Ok(())
    }

    async fn release_quarantine(&self, instance_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let record = state.instance_mut(instance_id)?;
        record.ensure_not_terminal()?;
        record.instance.quarantine_reason = None;
        record.runnable = true;
        record.instance.updated_at = Utc::now();
        Ok(())
    }

    async fn finalize(
        &self,
        instance_id: Uuid,
        mut events: Vec<NewEvent>,
        outcome: InstanceOutcome,
    ) -> Result<i64, StoreError> {
        let mut state = self.state.write();
        let now = Utc::now();
        events.push(outcome.marker());

        let record = state.instance_mut(instance_id)?;
        record.ensure_not_terminal()?;
        record.check_batch(&events)?;
        let last = record.push(events, now);

        record.instance.status = outcome.status();
        record.instance.awaiting_signals.clear();
        record.runnable = false;
        record.lease = None;
        match outcome {
            InstanceOutcome::Completed(result) => record.instance.result = Some(result),
            InstanceOutcome::Failed(error) | InstanceOutcome::Canceled(error) => {
                record.instance.failure = Some(error)
            }
        }

        if let Some(key) = record.instance.business_key.clone() {
            let key = (record.instance.workflow_type.clone(), key);
            if state.business_keys.get(&key) == Some(&instance_id) {
                state.business_keys.remove(&key);
            }
        }
        state.timers.retain(|(_, id, _)| *id != instance_id);
        for task in state.tasks.values_mut() {
            if task.task.instance_id == instance_id
                && matches!(task.status, TaskStatus::Pending | TaskStatus::Claimed)
            {
                task.status = TaskStatus::Canceled;
            }
        }

        Ok(last)
    }

    async fn append_events(
        &self,
        instance_id: Uuid,
        events: Vec<NewEvent>,
    ) -> Result<i64, StoreError> {
        self.state.write().append(instance_id, events, Utc::now())
    }

    async fn load_history(&self, instance_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        self.state
            .read()
            .instances
            .get(&instance_id)
            .map(|r| r.history.clone())
            .ok_or(StoreError::InstanceNotFound(instance_id))
    }

    async fn claim_runnable(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.write();
        let expires_at = now
            .checked_add_signed(crate::clock::to_chrono(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = state
            .instances
            .values()
            .filter(|r| {
                !r.instance.status.is_terminal()
                    && !r.instance.is_quarantined()
                    && !matches!(&r.lease, Some((_, until)) if *until > now)
                    && (r.runnable
                        || matches!(
                            r.instance.status,
                            InstanceStatus::Created | InstanceStatus::Running
                        ))
            })
            .map(|r| (r.instance.updated_at, r.instance.id))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(record) = state.instances.get_mut(&id) {
                record.lease = Some((owner.to_string(), expires_at));
                record.runnable = false;
                claimed.push(id);
            }
        }
        Ok(claimed)
    }

    async fn release_lease(&self, instance_id: Uuid, owner: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let record = state.instance_mut(instance_id)?;
        if record.lease.as_ref().is_some_and(|(o, _)| o == owner) {
            record.lease = None;
        }
        Ok(())
    }

    async fn schedule_timer(&self, timer: TimerRecord) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state
            .instances
            .get(&timer.instance_id)
            .ok_or(StoreError::InstanceNotFound(timer.instance_id))?
            .ensure_not_terminal()?;

        if state
            .timer_keys
            .insert((timer.instance_id, timer.step_index))
        {
            state
                .timers
                .insert((timer.fire_at, timer.instance_id, timer.step_index));
        }
        Ok(())
    }

    async fn fire_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimerRecord>, StoreError> {
        let mut state = self.state.write();
        let due: Vec<_> = state
            .timers
            .iter()
            .take_while(|(fire_at, _, _)| *fire_at <= now)
            .take(limit)
            .copied()
            .collect();

        let mut fired = Vec::with_capacity(due.len());
        for entry in due {
            let (fire_at, instance_id, step_index) = entry;
            state.timers.remove(&entry);
            match state.append(instance_id, vec![NewEvent::timer_fired(step_index)], now) {
                Ok(_) => fired.push(TimerRecord {
                    instance_id,
                    step_index,
                    fire_at,
                }),
                Err(e) if e.is_already_resolved() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(fired)
    }

    async fn enqueue_activity(
        &self,
        task: ActivityTask,
        visible_at: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let mut state = self.state.write();
        let key = (task.instance_id, task.step_index);
        if let Some(existing) = state.task_keys.get(&key) {
            return Ok(*existing);
        }
        state
            .instances
            .get(&task.instance_id)
            .ok_or(StoreError::InstanceNotFound(task.instance_id))?
            .ensure_not_terminal()?;

        let id = Uuid::now_v7();
        let max_attempts = task.command.options.retry_policy.max_attempts();
        state.task_keys.insert(key, id);
        state.tasks.insert(
            id,
            TaskRecord {
                id,
                task,
                status: TaskStatus::Pending,
                attempt: 0,
                max_attempts,
                visible_at,
                claimed_by: None,
                claimed_at: None,
                last_error: None,
            },
        );
        Ok(id)
    }

    async fn claim_activities(
        &self,
        worker_id: &str,
        filter: &ActivityFilter,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimedActivity>, StoreError> {
        let mut state = self.state.write();

        let mut visible: Vec<(DateTime<Utc>, Uuid)> = state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.visible_at <= now
                    && filter.accepts(
                        &t.task.command.options.queue_name,
                        &t.task.command.activity_type,
                    )
            })
            .map(|t| (t.visible_at, t.id))
            .collect();
        visible.sort();
        visible.truncate(limit);

        let mut claimed = Vec::with_capacity(visible.len());
        for (_, id) in visible {
            if let Some(task) = state.tasks.get_mut(&id) {
                task.status = TaskStatus::Claimed;
                task.attempt += 1;
                task.claimed_by = Some(worker_id.to_string());
                task.claimed_at = Some(now);
                claimed.push(ClaimedActivity {
                    task_id: task.id,
                    instance_id: task.task.instance_id,
                    step_index: task.task.step_index,
                    command: task.task.command.clone(),
                    attempt: task.attempt,
                });
            }
        }
        Ok(claimed)
    }

    async fn complete_activity(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.state.write().resolve_task(
            task_id,
            |step| NewEvent::activity_completed(step, result),
            TaskStatus::Completed,
            Utc::now(),
        )
    }

    async fn retry_activity(
        &self,
        task_id: Uuid,
        error: &ActivityError,
        visible_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        if task.status != TaskStatus::Claimed {
            return Ok(());
        }
        task.status = TaskStatus::Pending;
        task.visible_at = visible_at;
        task.claimed_by = None;
        task.claimed_at = None;
        task.last_error = Some(error.message.clone());
        Ok(())
    }

    async fn fail_activity(&self, task_id: Uuid, error: &ActivityError) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.last_error = Some(error.message.clone());
        }
        state.resolve_task(
            task_id,
            |step| NewEvent::activity_failed(step, error),
            TaskStatus::Failed,
            Utc::now(),
        )
    }

    async fn reclaim_stale_activities(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.write();

        let stale: Vec<(Uuid, bool)> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Claimed)
            .filter_map(|t| {
                let claimed_at = t.claimed_at?;
                let budget =
                    crate::clock::to_chrono(t.task.command.options.timeout.saturating_add(grace));
                let deadline = claimed_at
                    .checked_add_signed(budget)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                (deadline <= now).then_some((t.id, t.attempt < t.max_attempts))
            })
            .collect();

        let count = stale.len();
        for (task_id, retry) in stale {
            if retry {
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    task.status = TaskStatus::Pending;
                    task.visible_at = now;
                    task.claimed_by = None;
                    task.claimed_at = None;
                }
            } else {
                let error = ActivityError::worker_lost();
                match state.resolve_task(
                    task_id,
                    |step| NewEvent::activity_failed(step, &error),
                    TaskStatus::Failed,
                    now,
                ) {
                    Ok(()) => {}
                    Err(e) if e.is_already_resolved() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(count)
    }

    async fn next_due_at(&self, instance_id: Uuid) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.state.read();
        if !state.instances.contains_key(&instance_id) {
            return Err(StoreError::InstanceNotFound(instance_id));
        }

        let timer = state
            .timers
            .iter()
            .filter(|(_, id, _)| *id == instance_id)
            .map(|(fire_at, _, _)| *fire_at)
            .min();
        let task = state
            .tasks
            .values()
            .filter(|t| t.task.instance_id == instance_id && t.status == TaskStatus::Pending)
            .map(|t| t.visible_at)
            .min();

        Ok(match (timer, task) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }
}
