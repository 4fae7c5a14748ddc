use anyhow::Result;
use steadfast_worker::{init_telemetry, run, TelemetryConfig, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present; real environment variables take precedence
    dotenvy::dotenv().ok();

    // Configure via RUST_LOG or LOG_LEVEL (default: "info")
    let telemetry_config = TelemetryConfig::from_env();
    init_telemetry(&telemetry_config)?;

    tracing::info!("steadfast-worker starting...");

    let config = WorkerConfig::from_env();
    tracing::info!(
        postgres = config.database_url.is_some(),
        max_concurrency = config.pool.max_concurrency,
        queues = ?config.pool.queues,
        "Loaded configuration"
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Received shutdown signal");
    };

    if let Err(e) = run(config, shutdown).await {
        tracing::error!(error = %e, "Worker error");
        return Err(e);
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
