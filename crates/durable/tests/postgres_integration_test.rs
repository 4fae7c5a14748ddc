//! Integration tests for PostgresHistoryStore
//!
//! Run with: cargo test -p steadfast-durable --test postgres_integration_test -- --test-threads=1
//!
//! Requirements:
//! - PostgreSQL reachable through DATABASE_URL (tests are skipped when it is unset)
//! - Migrations are applied by the tests themselves

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use steadfast_durable::activity::ActivityError;
use steadfast_durable::persistence::{
    ActivityFilter, ActivityTask, CreatedInstance, HistoryStore, InstanceOutcome, InstanceStatus, NewInstance,
    PostgresHistoryStore, StoreError, TimerRecord,
};
use steadfast_durable::reliability::RetryPolicy;
use steadfast_durable::workflow::{
    ActivityCommand, ActivityOptions, Command, EventType, NewEvent, WorkflowError, WorkflowSignal,
    DEFAULT_QUEUE,
};

/// Connect and migrate, or `None` when no database is configured
async fn create_test_store() -> Option<PostgresHistoryStore> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };
    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to PostgreSQL");
    let store = PostgresHistoryStore::new(pool);
    store.migrate().await.expect("Failed to run migrations");
    Some(store)
}

/// History, timers and tasks go with the instance (ON DELETE CASCADE)
async fn cleanup(store: &PostgresHistoryStore, instance_id: Uuid) {
    sqlx::query("DELETE FROM workflow_instance WHERE id = $1")
        .bind(instance_id)
        .execute(store.pool())
        .await
        .ok();
}

async fn create(store: &PostgresHistoryStore, business_key: Option<String>) -> Uuid {
    create_typed(store, "pg_test", business_key).await.id
}

async fn create_typed(
    store: &PostgresHistoryStore,
    workflow_type: &str,
    business_key: Option<String>,
) -> CreatedInstance {
    store
        .create_instance(NewInstance {
            workflow_type: workflow_type.to_string(),
            workflow_version: 1,
            input: json!({"email": "a@b.com"}),
            business_key,
        })
        .await
        .unwrap()
}

/// Activity type unique to one test so parallel runs do not steal tasks
fn unique_type(name: &str) -> String {
    format!("{name}_{}", Uuid::now_v7().simple())
}

fn activity_command(activity_type: &str, policy: RetryPolicy) -> ActivityCommand {
    ActivityCommand {
        activity_type: activity_type.to_string(),
        payload: json!({"n": 1}),
        options: ActivityOptions::default().with_retry(policy),
        compensation: false,
    }
}

/// Issue an activity at step 0 and queue its task
async fn issue_activity(
    store: &PostgresHistoryStore,
    instance_id: Uuid,
    command: ActivityCommand,
) -> Uuid {
    store
        .append_events(
            instance_id,
            vec![NewEvent::command_issued(0, Command::Activity(command.clone()))],
        )
        .await
        .unwrap();
    store
        .enqueue_activity(
            ActivityTask {
                instance_id,
                step_index: 0,
                command,
            },
            Utc::now(),
        )
        .await
        .unwrap()
}

fn filter_for(activity_type: &str) -> ActivityFilter {
    ActivityFilter::new(
        vec![DEFAULT_QUEUE.to_string()],
        vec![activity_type.to_string()],
    )
}

// ============================================
// Instance Lifecycle Tests
// ============================================

#[tokio::test]
async fn test_create_and_get_instance() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let id = create(&store, None).await;

    let instance = store.get_instance(id).await.unwrap();
    assert_eq!(instance.workflow_type, "pg_test");
    assert_eq!(instance.workflow_version, 1);
    assert_eq!(instance.status, InstanceStatus::Created);
    assert_eq!(instance.input, json!({"email": "a@b.com"}));

    cleanup(&store, id).await;
}

#[tokio::test]
async fn test_get_missing_instance() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let result = store.get_instance(Uuid::now_v7()).await;
    assert!(matches!(result, Err(StoreError::InstanceNotFound(_))));
}

#[tokio::test]
async fn test_business_key_is_unique_while_live() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let key = format!("user:{}", Uuid::now_v7());

    let first = create(&store, Some(key.clone())).await;
    let again = create(&store, Some(key.clone())).await;
    assert_eq!(first, again);

    store
        .finalize(first, vec![], InstanceOutcome::Completed(json!("done")))
        .await
        .unwrap();
    let after = create(&store, Some(key)).await;
    assert_ne!(first, after);

    cleanup(&store, first).await;
    cleanup(&store, after).await;
}

#[tokio::test]
async fn test_business_key_scoped_to_workflow_type() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let key = format!("user:{}", Uuid::now_v7());

    let onboarding = create_typed(&store, "pg_onboarding", Some(key.clone())).await;
    let billing = create_typed(&store, "pg_billing", Some(key.clone())).await;
    assert!(onboarding.created);
    assert!(billing.created);
    assert_ne!(onboarding.id, billing.id);

    let again = create_typed(&store, "pg_billing", Some(key)).await;
    assert!(!again.created);
    assert_eq!(again.id, billing.id);

    cleanup(&store, onboarding.id).await;
    cleanup(&store, billing.id).await;
}

// ============================================
// History Tests
// ============================================

#[tokio::test]
async fn test_append_assigns_gapless_sequences() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let id = create(&store, None).await;

    let last = store
        .append_events(
            id,
            vec![
                NewEvent::command_issued(0, Command::side_effect()),
                NewEvent::side_effect_recorded(0, json!(42)),
            ],
        )
        .await
        .unwrap();
    assert_eq!(last, 2);

    let last = store
        .append_events(id, vec![NewEvent::signal_received(WorkflowSignal::new("go", json!(1)))])
        .await
        .unwrap();
    assert_eq!(last, 3);

    let history = store.load_history(id).await.unwrap();
    let sequences: Vec<i64> = history.iter().map(|e| e.sequence_number).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(history[1].result, Some(json!(42)));
    assert_eq!(history[2].signal.as_ref().unwrap().name, "go");

    cleanup(&store, id).await;
}

#[tokio::test]
async fn test_duplicate_resolution_rejected() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let id = create(&store, None).await;
    store
        .append_events(
            id,
            vec![
                NewEvent::command_issued(0, Command::side_effect()),
                NewEvent::side_effect_recorded(0, json!(1)),
            ],
        )
        .await
        .unwrap();

    let result = store
        .append_events(id, vec![NewEvent::side_effect_recorded(0, json!(2))])
        .await;
    assert!(result.unwrap_err().is_already_resolved());
    assert_eq!(store.load_history(id).await.unwrap().len(), 2);

    cleanup(&store, id).await;
}

#[tokio::test]
async fn test_finalize_blocks_further_appends() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let id = create(&store, None).await;

    store
        .finalize(
            id,
            vec![],
            InstanceOutcome::Failed(WorkflowError::new("boom").with_code("TEST")),
        )
        .await
        .unwrap();

    let instance = store.get_instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.failure.unwrap().code.as_deref(), Some("TEST"));

    let result = store
        .append_events(id, vec![NewEvent::signal_received(WorkflowSignal::new("late", json!(null)))])
        .await;
    assert!(matches!(result, Err(StoreError::InstanceTerminal(_))));

    let history = store.load_history(id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event_type, EventType::WorkflowFailed);

    cleanup(&store, id).await;
}

// ============================================
// Lease Tests
// ============================================

#[tokio::test]
async fn test_claim_runnable_leases_once() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let id = create(&store, None).await;
    let now = Utc::now();

    let first = store
        .claim_runnable("owner-a", now, Duration::from_secs(60), 1000)
        .await
        .unwrap();
    assert!(first.contains(&id));

    let second = store
        .claim_runnable("owner-b", now, Duration::from_secs(60), 1000)
        .await
        .unwrap();
    assert!(!second.contains(&id));

    store.release_lease(id, "owner-a").await.unwrap();
    store
        .set_status(id, InstanceStatus::Suspended, vec!["approval".to_string()])
        .await
        .unwrap();

    // Suspended without a matching signal: nothing to do
    let idle = store
        .claim_runnable("owner-b", now, Duration::from_secs(60), 1000)
        .await
        .unwrap();
    assert!(!idle.contains(&id));

    store
        .append_events(id, vec![NewEvent::signal_received(WorkflowSignal::new("approval", json!(true)))])
        .await
        .unwrap();
    let woken = store
        .claim_runnable("owner-b", now, Duration::from_secs(60), 1000)
        .await
        .unwrap();
    assert!(woken.contains(&id));

    cleanup(&store, id).await;
}

#[tokio::test]
async fn test_suspend_after_signal_already_arrived_stays_runnable() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let id = create(&store, None).await;
    let now = Utc::now();

    let claimed = store
        .claim_runnable("owner-a", now, Duration::from_secs(60), 1000)
        .await
        .unwrap();
    assert!(claimed.contains(&id));
    store.set_status(id, InstanceStatus::Running, vec![]).await.unwrap();
    store
        .append_events(id, vec![NewEvent::command_issued(0, Command::signal_wait("x"))])
        .await
        .unwrap();

    // Signal lands while the run is still in flight
    store
        .append_events(id, vec![NewEvent::signal_received(WorkflowSignal::new("x", json!(1)))])
        .await
        .unwrap();
    store
        .set_status(id, InstanceStatus::Suspended, vec!["x".to_string()])
        .await
        .unwrap();
    store.release_lease(id, "owner-a").await.unwrap();

    let woken = store
        .claim_runnable("owner-b", now, Duration::from_secs(60), 1000)
        .await
        .unwrap();
    assert!(woken.contains(&id));

    cleanup(&store, id).await;
}

#[tokio::test]
async fn test_signal_wakes_any_pending_wait() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let id = create(&store, None).await;
    let now = Utc::now();

    store
        .claim_runnable("owner-a", now, Duration::from_secs(60), 1000)
        .await
        .unwrap();
    store
        .append_events(
            id,
            vec![
                NewEvent::command_issued(0, Command::signal_wait("approve")),
                NewEvent::command_issued(1, Command::signal_wait("reject")),
            ],
        )
        .await
        .unwrap();
    store
        .set_status(
            id,
            InstanceStatus::Suspended,
            vec!["approve".to_string(), "reject".to_string()],
        )
        .await
        .unwrap();
    store.release_lease(id, "owner-a").await.unwrap();
    assert_eq!(
        store.get_instance(id).await.unwrap().awaiting_signals,
        vec!["approve".to_string(), "reject".to_string()]
    );

    store
        .append_events(id, vec![NewEvent::signal_received(WorkflowSignal::new("reject", json!(1)))])
        .await
        .unwrap();
    let woken = store
        .claim_runnable("owner-b", now, Duration::from_secs(60), 1000)
        .await
        .unwrap();
    assert!(woken.contains(&id));

    cleanup(&store, id).await;
}

#[tokio::test]
async fn test_quarantined_instance_not_claimed() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let id = create(&store, None).await;
    store.quarantine(id, "step 0 diverged").await.unwrap();

    let claimed = store
        .claim_runnable("owner", Utc::now(), Duration::from_secs(60), 1000)
        .await
        .unwrap();
    assert!(!claimed.contains(&id));
    assert_eq!(
        store.get_instance(id).await.unwrap().quarantine_reason.as_deref(),
        Some("step 0 diverged")
    );

    store.release_quarantine(id).await.unwrap();
    let claimed = store
        .claim_runnable("owner", Utc::now(), Duration::from_secs(60), 1000)
        .await
        .unwrap();
    assert!(claimed.contains(&id));

    cleanup(&store, id).await;
}

// ============================================
// Timer Tests
// ============================================

#[tokio::test]
async fn test_timer_fires_once_when_due() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let id = create(&store, None).await;
    let now = Utc::now();
    let fire_at = now + chrono::Duration::hours(1);

    store
        .append_events(id, vec![NewEvent::command_issued(0, Command::timer(fire_at))])
        .await
        .unwrap();
    let timer = TimerRecord {
        instance_id: id,
        step_index: 0,
        fire_at,
    };
    store.schedule_timer(timer.clone()).await.unwrap();
    store.schedule_timer(timer.clone()).await.unwrap();
    assert_eq!(store.next_due_at(id).await.unwrap(), Some(fire_at));

    let early = store.fire_due_timers(now, 1000).await.unwrap();
    assert!(!early.iter().any(|t| t.instance_id == id));

    let due = store
        .fire_due_timers(fire_at, 1000)
        .await
        .unwrap();
    assert_eq!(due.iter().filter(|t| t.instance_id == id).count(), 1);

    let again = store
        .fire_due_timers(fire_at + chrono::Duration::hours(1), 1000)
        .await
        .unwrap();
    assert!(!again.iter().any(|t| t.instance_id == id));

    let history = store.load_history(id).await.unwrap();
    assert_eq!(history.last().unwrap().event_type, EventType::TimerFired);
    assert_eq!(store.next_due_at(id).await.unwrap(), None);

    cleanup(&store, id).await;
}

// ============================================
// Activity Queue Tests
// ============================================

#[tokio::test]
async fn test_task_claim_and_complete() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let id = create(&store, None).await;
    let activity_type = unique_type("complete");
    let task_id = issue_activity(&store, id, activity_command(&activity_type, RetryPolicy::no_retry())).await;

    let claimed = store
        .claim_activities("worker-1", &filter_for(&activity_type), Utc::now(), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].task_id, task_id);
    assert_eq!(claimed[0].attempt, 1);

    // Claimed tasks are not handed out twice
    let none = store
        .claim_activities("worker-2", &filter_for(&activity_type), Utc::now(), 10)
        .await
        .unwrap();
    assert!(none.is_empty());

    store.complete_activity(task_id, json!({"ok": true})).await.unwrap();
    let duplicate = store.complete_activity(task_id, json!({"ok": false})).await;
    assert!(duplicate.unwrap_err().is_already_resolved());

    let history = store.load_history(id).await.unwrap();
    assert_eq!(history.last().unwrap().event_type, EventType::ActivityCompleted);
    assert_eq!(history.last().unwrap().result, Some(json!({"ok": true})));

    cleanup(&store, id).await;
}

#[tokio::test]
async fn test_task_retry_is_delayed_then_fails() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let id = create(&store, None).await;
    let activity_type = unique_type("retry");
    let task_id = issue_activity(
        &store,
        id,
        activity_command(&activity_type, RetryPolicy::fixed(Duration::from_secs(30), 1)),
    )
    .await;
    let filter = filter_for(&activity_type);
    let now = Utc::now();

    store.claim_activities("w", &filter, now, 10).await.unwrap();
    let error = ActivityError::retryable("flaky");
    store
        .retry_activity(task_id, &error, now + chrono::Duration::seconds(30))
        .await
        .unwrap();

    // No history for a retried attempt
    assert_eq!(store.load_history(id).await.unwrap().len(), 1);

    let hidden = store.claim_activities("w", &filter, now, 10).await.unwrap();
    assert!(hidden.is_empty());

    let visible = store
        .claim_activities("w", &filter, now + chrono::Duration::seconds(30), 10)
        .await
        .unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].attempt, 2);

    store.fail_activity(task_id, &error).await.unwrap();
    let history = store.load_history(id).await.unwrap();
    let failed = history.last().unwrap();
    assert_eq!(failed.event_type, EventType::ActivityFailed);
    assert_eq!(failed.activity_error().unwrap().message, "flaky");

    cleanup(&store, id).await;
}

#[tokio::test]
async fn test_finalize_cancels_queued_tasks() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let id = create(&store, None).await;
    let activity_type = unique_type("cancel");
    let task_id = issue_activity(&store, id, activity_command(&activity_type, RetryPolicy::no_retry())).await;

    store
        .finalize(
            id,
            vec![],
            InstanceOutcome::Canceled(WorkflowError::new("stop").with_code("CANCELED")),
        )
        .await
        .unwrap();

    let claimed = store
        .claim_activities("w", &filter_for(&activity_type), Utc::now(), 10)
        .await
        .unwrap();
    assert!(claimed.is_empty());

    let late = store.complete_activity(task_id, json!(1)).await;
    assert!(late.unwrap_err().is_already_resolved());

    cleanup(&store, id).await;
}

#[tokio::test]
async fn test_stale_task_is_reclaimed() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let id = create(&store, None).await;
    let activity_type = unique_type("stale");
    let command = ActivityCommand {
        options: ActivityOptions::default()
            .with_timeout(Duration::from_secs(1))
            .with_retry(RetryPolicy::fixed(Duration::ZERO, 1)),
        ..activity_command(&activity_type, RetryPolicy::no_retry())
    };
    issue_activity(&store, id, command).await;
    let filter = filter_for(&activity_type);
    let now = Utc::now();

    store.claim_activities("dead-worker", &filter, now, 10).await.unwrap();

    let later = now + chrono::Duration::seconds(10);
    let reclaimed = store
        .reclaim_stale_activities(later, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(reclaimed >= 1);

    let again = store.claim_activities("w", &filter, later, 10).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].attempt, 2);

    cleanup(&store, id).await;
}

#[tokio::test]
async fn test_unbounded_timeout_is_never_reclaimed() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let id = create(&store, None).await;
    let activity_type = unique_type("unbounded");
    let command = ActivityCommand {
        options: ActivityOptions::default()
            .with_timeout(Duration::MAX)
            .with_retry(RetryPolicy::fixed(Duration::ZERO, 3)),
        ..activity_command(&activity_type, RetryPolicy::no_retry())
    };
    issue_activity(&store, id, command).await;
    let filter = filter_for(&activity_type);
    let now = Utc::now();

    store.claim_activities("slow-worker", &filter, now, 10).await.unwrap();

    let later = now + chrono::Duration::days(365);
    store
        .reclaim_stale_activities(later, Duration::MAX)
        .await
        .unwrap();
    let again = store.claim_activities("w", &filter, later, 10).await.unwrap();
    assert!(again.is_empty());

    cleanup(&store, id).await;
}
