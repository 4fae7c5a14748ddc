// Worker configuration
//
// Everything comes from the environment (after `.env` is loaded by main).

use steadfast_durable::{EngineConfig, SchedulerConfig, WorkerPoolConfig};

/// Configuration for the worker process
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// PostgreSQL connection string; the in-memory store is used when unset
    pub database_url: Option<String>,
    /// Maximum connections in the PostgreSQL pool
    pub max_connections: u32,
    /// Apply migrations at startup
    pub run_migrations: bool,
    /// Start one demo onboarding instance on boot
    pub seed_demo: bool,
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    pub pool: WorkerPoolConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            run_migrations: true,
            seed_demo: false,
            engine: EngineConfig::default(),
            scheduler: SchedulerConfig::default(),
            pool: WorkerPoolConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: PostgreSQL connection string
    /// - `DATABASE_MAX_CONNECTIONS`: Pool size (default: 10)
    /// - `RUN_MIGRATIONS`: "false" to skip migrations
    /// - `SEED_DEMO`: "true" to start one demo onboarding instance
    /// - `STEADFAST_*`: engine, scheduler and worker pool settings
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_connections),
            run_migrations: std::env::var("RUN_MIGRATIONS")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(defaults.run_migrations),
            seed_demo: std::env::var("SEED_DEMO")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(defaults.seed_demo),
            engine: EngineConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
            pool: WorkerPoolConfig::from_env(),
        }
    }
}
