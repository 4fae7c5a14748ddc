//! PostgreSQL implementation of HistoryStore
//!
//! - Per-instance row lock (`FOR UPDATE`) serializes appends and allocates
//!   gapless sequence numbers from `workflow_instance.next_sequence`
//! - Partial unique indexes enforce one issue and one resolution per step
//! - Task and lease claiming with `FOR UPDATE SKIP LOCKED`

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::workflow::{ActivityCommand, EventType, HistoryEvent, NewEvent, WorkflowError};

/// Embedded schema migrations
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'canceled')";

/// Upper bound for millisecond columns (about 1000 years) so that
/// `claimed_at + ms * INTERVAL` stays inside the timestamptz range
const MAX_INTERVAL_MS: i64 = 1000 * 365 * 24 * 60 * 60 * 1000;

/// PostgreSQL implementation of HistoryStore
///
/// # Example
///
/// ```ignore
/// use steadfast_durable::PostgresHistoryStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/steadfast").await?;
/// let store = PostgresHistoryStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresHistoryStore {
    pool: PgPool,
}

impl PostgresHistoryStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await.map_err(|e| {
            error!("Failed to run migrations: {}", e);
            StoreError::Database(e.to_string())
        })
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Postgres>, StoreError> {
        self.pool.begin().await.map_err(db_error("begin transaction"))
    }

    async fn set_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_activity_task
            SET status = $2,
                claimed_by = NULL,
                last_error = COALESCE($3, last_error)
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(last_error)
        .execute(&self.pool)
        .await
        .map_err(db_error("update task status"))?;
        Ok(())
    }

    /// Append a task's resolution and close the task
    async fn resolve_task(
        &self,
        task_id: Uuid,
        event: impl FnOnce(u32) -> NewEvent + Send,
        closed_status: TaskStatus,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT instance_id, step_index
            FROM workflow_activity_task
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("load task"))?
        .ok_or(StoreError::TaskNotFound(task_id))?;

        let instance_id: Uuid = row.get("instance_id");
        let step_index = row.get::<i32, _>("step_index") as u32;

        match append_locked(&mut tx, instance_id, vec![event(step_index)]).await {
            Ok(_) => {
                sqlx::query(
                    r#"
                    UPDATE workflow_activity_task
                    SET status = $2, claimed_by = NULL, last_error = COALESCE($3, last_error)
                    WHERE id = $1
                    "#,
                )
                .bind(task_id)
                .bind(closed_status.as_str())
                .bind(last_error)
                .execute(&mut *tx)
                .await
                .map_err(db_error("close task"))?;
                tx.commit().await.map_err(db_error("commit"))?;
                debug!(%task_id, %instance_id, step_index, "resolved task");
                Ok(())
            }
            Err(e) => {
                drop(tx);
                let status = match e {
                    StoreError::InstanceTerminal(_) => TaskStatus::Canceled,
                    _ => closed_status,
                };
                if e.is_already_resolved() {
                    self.set_task_status(task_id, status, last_error).await?;
                }
                Err(e)
            }
        }
    }
}

fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        error!("Failed to {}: {}", context, e);
        StoreError::Database(e.to_string())
    }
}

/// Duration as bounded milliseconds for interval arithmetic in SQL
fn interval_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis())
        .unwrap_or(i64::MAX)
        .min(MAX_INTERVAL_MS)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_status(status: &str) -> Result<InstanceStatus, StoreError> {
    InstanceStatus::parse(status)
        .ok_or_else(|| StoreError::Database(format!("Unknown instance status: {}", status)))
}

/// Lock the instance row and check it accepts events
async fn lock_instance(
    conn: &mut PgConnection,
    instance_id: Uuid,
) -> Result<PgRow, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT status, next_sequence, awaiting_signals
        FROM workflow_instance
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(instance_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("lock instance"))?
    .ok_or(StoreError::InstanceNotFound(instance_id))?;

    let status: String = row.get("status");
    if parse_status(&status)?.is_terminal() {
        return Err(StoreError::InstanceTerminal(instance_id));
    }
    Ok(row)
}

/// Append events inside the caller's transaction
async fn append_locked(
    conn: &mut PgConnection,
    instance_id: Uuid,
    events: Vec<NewEvent>,
) -> Result<i64, StoreError> {
    let row = lock_instance(conn, instance_id).await?;
    let mut sequence: i64 = row.get("next_sequence");
    let awaiting_signals: Vec<String> = row.get("awaiting_signals");

    let mut wake = false;
    for event in events {
        match event.event_type {
            t if t.is_resolution() => wake = true,
            EventType::SignalReceived => {
                wake |= event
                    .signal
                    .as_ref()
                    .is_some_and(|s| awaiting_signals.contains(&s.name));
            }
            _ => {}
        }

        let command = event.command.as_ref().map(to_json).transpose()?;
        let signal = event.signal.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO workflow_history (
                instance_id, sequence_number, event_type, step_index,
                command_payload, signal_payload, result_payload, error_payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(instance_id)
        .bind(sequence)
        .bind(event.event_type.as_str())
        .bind(event.step_index.map(|s| s as i32))
        .bind(&command)
        .bind(&signal)
        .bind(&event.result)
        .bind(&event.error)
        .execute(&mut *conn)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::DuplicateStep {
                instance_id,
                step_index: event.step_index.unwrap_or_default(),
            },
            other => db_error("insert history event")(other),
        })?;

        sequence += 1;
    }

    sqlx::query(
        r#"
        UPDATE workflow_instance
        SET next_sequence = $2,
            runnable = runnable OR $3,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(instance_id)
    .bind(sequence)
    .bind(wake)
    .execute(&mut *conn)
    .await
    .map_err(db_error("advance sequence"))?;

    Ok(sequence - 1)
}

fn row_to_instance(row: &PgRow) -> Result<WorkflowInstance, StoreError> {
    let status: String = row.get("status");
    let failure: Option<serde_json::Value> = row.get("failure");
    Ok(WorkflowInstance {
        id: row.get("id"),
        workflow_type: row.get("workflow_type"),
        workflow_version: row.get::<i32, _>("workflow_version") as u32,
        business_key: row.get("business_key"),
        input: row.get("input"),
        status: parse_status(&status)?,
        result: row.get("result"),
        failure: failure.map(from_json::<WorkflowError>).transpose()?,
        quarantine_reason: row.get("quarantine_reason"),
        awaiting_signals: row.get("awaiting_signals"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_event(row: &PgRow) -> Result<HistoryEvent, StoreError> {
    let event_type: String = row.get("event_type");
    let command: Option<serde_json::Value> = row.get("command_payload");
    let signal: Option<serde_json::Value> = row.get("signal_payload");
    Ok(HistoryEvent {
        instance_id: row.get("instance_id"),
        sequence_number: row.get("sequence_number"),
        event_type: EventType::parse(&event_type)
            .ok_or_else(|| StoreError::Database(format!("Unknown event type: {}", event_type)))?,
        step_index: row.get::<Option<i32>, _>("step_index").map(|s| s as u32),
        command: command.map(from_json).transpose()?,
        signal: signal.map(from_json).transpose()?,
        result: row.get("result_payload"),
        error: row.get("error_payload"),
        recorded_at: row.get("recorded_at"),
    })
}

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    #[instrument(skip(self, new), fields(workflow_type = %new.workflow_type))]
    async fn create_instance(&self, new: NewInstance) -> Result<CreatedInstance, StoreError> {
        let id = Uuid::now_v7();

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO workflow_instance (id, workflow_type, workflow_version, business_key, input)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (workflow_type, business_key)
                WHERE business_key IS NOT NULL AND status NOT IN {TERMINAL_STATUSES}
                DO NOTHING
            RETURNING id
            "#
        ))
        .bind(id)
        .bind(&new.workflow_type)
        .bind(new.workflow_version as i32)
        .bind(&new.business_key)
        .bind(&new.input)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("create instance"))?;

        if inserted.is_some() {
            debug!(%id, "created instance");
            return Ok(CreatedInstance { id, created: true });
        }

        let existing = sqlx::query(&format!(
            r#"
            SELECT id FROM workflow_instance
            WHERE workflow_type = $1 AND business_key = $2
              AND status NOT IN {TERMINAL_STATUSES}
            "#
        ))
        .bind(&new.workflow_type)
        .bind(&new.business_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("find instance by business key"))?
        .ok_or_else(|| {
            StoreError::ConcurrencyConflict("business key instance finished during create".into())
        })?;

        Ok(CreatedInstance {
            id: existing.get("id"),
            created: false,
        })
    }

    #[instrument(skip(self))]
    async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_type, workflow_version, business_key, input, status, result,
                   failure, quarantine_reason, awaiting_signals, created_at, updated_at
            FROM workflow_instance
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get instance"))?
        .ok_or(StoreError::InstanceNotFound(instance_id))?;

        row_to_instance(&row)
    }

    #[instrument(skip(self))]
    async fn set_status(
        &self,
        instance_id: Uuid,
        status: InstanceStatus,
        awaiting_signals: Vec<String>,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        lock_instance(&mut tx, instance_id).await?;

        let mut wake = false;
        for name in &awaiting_signals {
            // A signal appended while the run was in flight
            let row = sqlx::query(
                r#"
                SELECT
                    COUNT(*) FILTER (
                        WHERE event_type = 'command_issued'
                          AND command_payload->>'type' = 'signal_wait'
                          AND command_payload->>'signal_name' = $2
                    ) AS waits,
                    COUNT(*) FILTER (
                        WHERE event_type = 'signal_received'
                          AND signal_payload->>'name' = $2
                    ) AS signals
                FROM workflow_history
                WHERE instance_id = $1
                "#,
            )
            .bind(instance_id)
            .bind(name)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("count signals"))?;
            if row.get::<i64, _>("signals") >= row.get::<i64, _>("waits") {
                wake = true;
                break;
            }
        }

        sqlx::query(
            r#"
            UPDATE workflow_instance
            SET status = $2,
                awaiting_signals = $3,
                runnable = runnable OR $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(status.as_str())
        .bind(&awaiting_signals)
        .bind(wake)
        .execute(&mut *tx)
        .await
        .map_err(db_error("set status"))?;

        tx.commit().await.map_err(db_error("commit"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn quarantine(&self, instance_id: Uuid, reason: &str) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        lock_instance(&mut tx, instance_id).await?;

        sqlx::query(
            r#"
            UPDATE workflow_instance
            SET quarantine_reason = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(reason)
        .execute(&mut *tx)
        .await
        .map_err(db_error("quarantine instance"))?;

        tx.commit().await.map_err(db_error("commit"))?;
        warn!(%instance_id, reason, "instance quarantined");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn release_quarantine(&self, instance_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        lock_instance(&mut tx, instance_id).await?;

        sqlx::query(
            r#"
            UPDATE workflow_instance
            SET quarantine_reason = NULL, runnable = TRUE, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error("release quarantine"))?;

        tx.commit().await.map_err(db_error("commit"))?;
        Ok(())
    }

    #[instrument(skip(self, events, outcome))]
    async fn finalize(
        &self,
        instance_id: Uuid,
        mut events: Vec<NewEvent>,
        outcome: InstanceOutcome,
    ) -> Result<i64, StoreError> {
        events.push(outcome.marker());
        let status = outcome.status();
        let (result, failure) = match &outcome {
            InstanceOutcome::Completed(result) => (Some(result.clone()), None),
            InstanceOutcome::Failed(error) | InstanceOutcome::Canceled(error) => {
                (None, Some(to_json(error)?))
            }
        };

        let mut tx = self.begin().await?;
        let last = append_locked(&mut tx, instance_id, events).await?;

        sqlx::query(
            r#"
            UPDATE workflow_instance
            SET status = $2,
                result = $3,
                failure = $4,
                awaiting_signals = '{}',
                runnable = FALSE,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(status.as_str())
        .bind(&result)
        .bind(&failure)
        .execute(&mut *tx)
        .await
        .map_err(db_error("finalize instance"))?;

        sqlx::query("DELETE FROM workflow_timer WHERE instance_id = $1 AND fired_at IS NULL")
            .bind(instance_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("discard timers"))?;

        sqlx::query(
            r#"
            UPDATE workflow_activity_task
            SET status = 'canceled', claimed_by = NULL
            WHERE instance_id = $1 AND status IN ('pending', 'claimed')
            "#,
        )
        .bind(instance_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error("cancel tasks"))?;

        tx.commit().await.map_err(db_error("commit"))?;
        debug!(%instance_id, %status, "finalized instance");
        Ok(last)
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append_events(
        &self,
        instance_id: Uuid,
        events: Vec<NewEvent>,
    ) -> Result<i64, StoreError> {
        let mut tx = self.begin().await?;
        let last = append_locked(&mut tx, instance_id, events).await?;
        tx.commit().await.map_err(db_error("commit"))?;

        debug!(%instance_id, last, "appended events");
        Ok(last)
    }

    #[instrument(skip(self))]
    async fn load_history(&self, instance_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT instance_id, sequence_number, event_type, step_index, command_payload,
                   signal_payload, result_payload, error_payload, recorded_at
            FROM workflow_history
            WHERE instance_id = $1
            ORDER BY sequence_number
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("load history"))?;

        if rows.is_empty() {
            // Distinguish "no events yet" from "no such instance"
            self.get_instance(instance_id).await?;
        }

        rows.iter().map(row_to_event).collect()
    }

    #[instrument(skip(self))]
    async fn claim_runnable(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            WITH candidates AS (
                SELECT id
                FROM workflow_instance
                WHERE status NOT IN {TERMINAL_STATUSES}
                  AND quarantine_reason IS NULL
                  AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
                  AND (runnable OR status IN ('created', 'running'))
                ORDER BY updated_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE workflow_instance w
            SET lease_owner = $3,
                lease_expires_at = $4,
                runnable = FALSE
            FROM candidates c
            WHERE w.id = c.id
            RETURNING w.id
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .bind(owner)
        .bind(
            now.checked_add_signed(crate::clock::to_chrono(lease))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("claim runnable instances"))?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, instance_id: Uuid, owner: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workflow_instance
            SET lease_owner = NULL, lease_expires_at = NULL
            WHERE id = $1 AND lease_owner = $2
            "#,
        )
        .bind(instance_id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(db_error("release lease"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn schedule_timer(&self, timer: TimerRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_timer (instance_id, step_index, fire_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (instance_id, step_index) DO NOTHING
            "#,
        )
        .bind(timer.instance_id)
        .bind(timer.step_index as i32)
        .bind(timer.fire_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("schedule timer"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fire_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimerRecord>, StoreError> {
        let due = sqlx::query(
            r#"
            SELECT instance_id, step_index, fire_at
            FROM workflow_timer
            WHERE fired_at IS NULL AND fire_at <= $1
            ORDER BY fire_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("find due timers"))?;

        let mut fired = Vec::with_capacity(due.len());
        for row in due {
            let timer = TimerRecord {
                instance_id: row.get("instance_id"),
                step_index: row.get::<i32, _>("step_index") as u32,
                fire_at: row.get("fire_at"),
            };

            let mut tx = self.begin().await?;
            let marked = sqlx::query(
                r#"
                UPDATE workflow_timer
                SET fired_at = $3
                WHERE instance_id = $1 AND step_index = $2 AND fired_at IS NULL
                "#,
            )
            .bind(timer.instance_id)
            .bind(timer.step_index as i32)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_error("mark timer fired"))?;
            if marked.rows_affected() == 0 {
                // Another poller got it
                continue;
            }

            match append_locked(
                &mut tx,
                timer.instance_id,
                vec![NewEvent::timer_fired(timer.step_index)],
            )
            .await
            {
                Ok(_) => {
                    tx.commit().await.map_err(db_error("commit"))?;
                    fired.push(timer);
                }
                Err(e) if e.is_already_resolved() => {
                    drop(tx);
                    sqlx::query(
                        "DELETE FROM workflow_timer WHERE instance_id = $1 AND step_index = $2",
                    )
                    .bind(timer.instance_id)
                    .bind(timer.step_index as i32)
                    .execute(&self.pool)
                    .await
                    .map_err(db_error("discard timer"))?;
                }
                Err(e) => return Err(e),
            }
        }

        if !fired.is_empty() {
            debug!(count = fired.len(), "fired timers");
        }
        Ok(fired)
    }

    #[instrument(skip(self, task), fields(instance_id = %task.instance_id, step_index = task.step_index))]
    async fn enqueue_activity(
        &self,
        task: ActivityTask,
        visible_at: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let task_id = Uuid::now_v7();
        let command = to_json(&task.command)?;
        let options = &task.command.options;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO workflow_activity_task (
                id, instance_id, step_index, activity_type, queue_name, command,
                max_attempts, timeout_ms, visible_at
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9
            WHERE EXISTS (
                SELECT 1 FROM workflow_instance
                WHERE id = $2 AND status NOT IN {TERMINAL_STATUSES}
            )
            ON CONFLICT (instance_id, step_index) DO NOTHING
            RETURNING id
            "#
        ))
        .bind(task_id)
        .bind(task.instance_id)
        .bind(task.step_index as i32)
        .bind(&task.command.activity_type)
        .bind(&options.queue_name)
        .bind(&command)
        .bind(options.retry_policy.max_attempts() as i32)
        .bind(interval_millis(options.timeout))
        .bind(visible_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("enqueue activity"))?;

        if inserted.is_some() {
            debug!(%task_id, activity_type = %task.command.activity_type, "enqueued task");
            return Ok(task_id);
        }

        let existing = sqlx::query(
            "SELECT id FROM workflow_activity_task WHERE instance_id = $1 AND step_index = $2",
        )
        .bind(task.instance_id)
        .bind(task.step_index as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("find task"))?;

        match existing {
            Some(row) => Ok(row.get("id")),
            None => {
                let instance = self.get_instance(task.instance_id).await?;
                Err(StoreError::InstanceTerminal(instance.id))
            }
        }
    }

    #[instrument(skip(self, filter))]
    async fn claim_activities(
        &self,
        worker_id: &str,
        filter: &ActivityFilter,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimedActivity>, StoreError> {
        if filter.queues.is_empty() {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM workflow_activity_task
                WHERE status = 'pending'
                  AND queue_name = ANY($1)
                  AND (cardinality($2::text[]) = 0 OR activity_type = ANY($2))
                  AND visible_at <= $3
                ORDER BY visible_at
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE workflow_activity_task t
            SET status = 'claimed',
                claimed_by = $5,
                claimed_at = $3,
                attempt = attempt + 1
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.instance_id, t.step_index, t.command, t.attempt
            "#,
        )
        .bind(&filter.queues)
        .bind(&filter.activity_types)
        .bind(now)
        .bind(limit as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("claim activities"))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let command: ActivityCommand = from_json(row.get("command"))?;
            claimed.push(ClaimedActivity {
                task_id: row.get("id"),
                instance_id: row.get("instance_id"),
                step_index: row.get::<i32, _>("step_index") as u32,
                command,
                attempt: row.get::<i32, _>("attempt") as u32,
            });
        }

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed tasks");
        }
        Ok(claimed)
    }

    #[instrument(skip(self, result))]
    async fn complete_activity(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.resolve_task(
            task_id,
            |step| NewEvent::activity_completed(step, result),
            TaskStatus::Completed,
            None,
        )
        .await
    }

    #[instrument(skip(self, error))]
    async fn retry_activity(
        &self,
        task_id: Uuid,
        error: &ActivityError,
        visible_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE workflow_activity_task
            SET status = 'pending',
                visible_at = $2,
                claimed_by = NULL,
                claimed_at = NULL,
                last_error = $3
            WHERE id = $1 AND status = 'claimed'
            "#,
        )
        .bind(task_id)
        .bind(visible_at)
        .bind(&error.message)
        .execute(&self.pool)
        .await
        .map_err(db_error("requeue task"))?;

        if updated.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM workflow_activity_task WHERE id = $1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("find task"))?;
            if exists.is_none() {
                return Err(StoreError::TaskNotFound(task_id));
            }
        }
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn fail_activity(&self, task_id: Uuid, error: &ActivityError) -> Result<(), StoreError> {
        self.resolve_task(
            task_id,
            |step| NewEvent::activity_failed(step, error),
            TaskStatus::Failed,
            Some(&error.message),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn reclaim_stale_activities(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<usize, StoreError> {
        let grace_ms = interval_millis(grace);

        let requeued = sqlx::query(
            r#"
            UPDATE workflow_activity_task
            SET status = 'pending',
                visible_at = $1,
                claimed_by = NULL,
                claimed_at = NULL
            WHERE status = 'claimed'
              AND attempt < max_attempts
              AND claimed_at + (timeout_ms + $2) * INTERVAL '1 millisecond' <= $1
            "#,
        )
        .bind(now)
        .bind(grace_ms)
        .execute(&self.pool)
        .await
        .map_err(db_error("reclaim stale tasks"))?
        .rows_affected() as usize;

        let exhausted = sqlx::query(
            r#"
            SELECT id
            FROM workflow_activity_task
            WHERE status = 'claimed'
              AND attempt >= max_attempts
              AND claimed_at + (timeout_ms + $2) * INTERVAL '1 millisecond' <= $1
            "#,
        )
        .bind(now)
        .bind(grace_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("find exhausted tasks"))?;

        let error = ActivityError::worker_lost();
        let mut failed = 0;
        for row in exhausted {
            match self.fail_activity(row.get("id"), &error).await {
                Ok(()) => failed += 1,
                Err(e) if e.is_already_resolved() => failed += 1,
                Err(e) => return Err(e),
            }
        }

        if requeued + failed > 0 {
            warn!(requeued, failed, "reclaimed stale tasks");
        }
        Ok(requeued + failed)
    }

    #[instrument(skip(self))]
    async fn next_due_at(&self, instance_id: Uuid) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                EXISTS (SELECT 1 FROM workflow_instance WHERE id = $1) AS found,
                LEAST(
                    (SELECT MIN(fire_at) FROM workflow_timer
                     WHERE instance_id = $1 AND fired_at IS NULL),
                    (SELECT MIN(visible_at) FROM workflow_activity_task
                     WHERE instance_id = $1 AND status = 'pending')
                ) AS due_at
            "#,
        )
        .bind(instance_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("compute next due time"))?;

        if !row.get::<bool, _>("found") {
            return Err(StoreError::InstanceNotFound(instance_id));
        }
        Ok(row.get("due_at"))
    }
}
