pub mod config;
pub mod onboarding;
pub mod runtime;
pub mod telemetry;

pub use config::WorkerConfig;
pub use runtime::run;
pub use telemetry::{init_telemetry, TelemetryConfig};
