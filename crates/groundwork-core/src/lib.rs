//! Groundwork Core
//!
//! The engine behind groundwork:
//! - Registry: selector -> builder/runner resolution and compatibility checks
//! - Config: `.env.toml` loading and layered config coalescing
//! - Aggregator: concurrent consumption and classification of instance output
//! - Healthcheck: sequential check/fix engine with a memoized report
//! - Engine: validate -> build -> healthcheck -> run -> aggregate
//! - Daemon: the healthcheck request handler

pub mod aggregator;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod fakes;
pub mod healthcheck;
pub mod metrics;
pub mod obs;
pub mod registry;
pub mod telemetry;

pub use aggregator::{
    AggregateOutcome, Aggregator, ClassifiedLine, InstanceVerdict, LineClass, RunOutcome,
};
pub use config::{coalesce, decode_config, DaemonConfig, Directories, EnvConfig};
pub use daemon::{handle_healthcheck, HealthcheckResponse};
pub use engine::{Engine, OrchestrateOptions, RunReport};
pub use healthcheck::{
    all_of, any_of, checker, dir_exists_checker, dir_exists_fixer, fixer, CheckError, CheckOutcome,
    Checker, Fixer, Healthcheck, HealthcheckPolicy,
};
pub use metrics::EngineMetrics;
pub use registry::Registry;
pub use telemetry::init_tracing;

// Re-export the domain model for convenience
pub use groundwork_api as api;

/// Groundwork version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
