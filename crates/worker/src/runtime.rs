// Process wiring: store, engine, scheduler and worker pool
//
// The engine is generic over the store, so selection happens once here and
// the rest of the process is monomorphized for the chosen backend.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use steadfast_durable::prelude::*;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::WorkerConfig;
use crate::onboarding::{self, NewUser, Onboarding};

/// Run until `shutdown` resolves
pub async fn run(config: WorkerConfig, shutdown: impl Future<Output = ()>) -> Result<()> {
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(&url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            let store = PostgresHistoryStore::new(pool);
            if config.run_migrations {
                store.migrate().await.context("Failed to run migrations")?;
                info!("migrations applied");
            }
            info!("using PostgreSQL history store");
            run_with_store(Arc::new(store), config, shutdown).await
        }
        None => {
            info!("DATABASE_URL not set, using in-memory history store");
            run_with_store(Arc::new(InMemoryHistoryStore::new()), config, shutdown).await
        }
    }
}

/// Run the scheduler and worker pool against `store`
pub async fn run_with_store<S: HistoryStore>(
    store: Arc<S>,
    config: WorkerConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let mut engine = WorkflowEngine::new(Arc::clone(&store)).with_config(config.engine.clone());
    onboarding::register_workflows(&mut engine);
    let engine = Arc::new(engine);

    if config.seed_demo {
        let input = NewUser {
            email: "demo@example.com".to_string(),
            name: "Demo".to_string(),
        };
        let id = engine
            .start::<Onboarding>(input, Some("demo@example.com".to_string()))
            .await
            .context("Failed to start demo workflow")?;
        info!(instance_id = %id, "started demo onboarding workflow");
    }

    let pool = Arc::new(WorkerPool::new(
        Arc::clone(&store),
        Arc::new(onboarding::activity_registry()),
        config.pool.clone(),
    ));
    pool.start().context("Failed to start worker pool")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(Arc::clone(&engine), config.scheduler.clone());
    let scheduler_handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    info!(
        worker_id = %pool.worker_id(),
        owner = %config.scheduler.owner_id,
        "worker running"
    );

    shutdown.await;
    info!("shutting down");

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "scheduler task panicked");
    }
    pool.shutdown().await.context("Worker pool shutdown failed")?;

    Ok(())
}
