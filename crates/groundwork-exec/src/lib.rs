//! Groundwork local backends
//!
//! Process-based backends that run a composition on one machine without
//! containers:
//! - `exec:bin`: resolves a prebuilt executable shipped with the plan
//! - `local:exec`: spawns one child process per instance

pub mod builder;
pub mod runner;

use std::sync::Arc;

use groundwork_core::{EnvConfig, Registry};

pub use builder::{ExecBinBuilder, ExecBinConfig};
pub use runner::{encode_params, instance_env, LocalExecConfig, LocalExecRunner};

/// A registry with every local backend registered.
pub fn default_registry(env: &EnvConfig) -> Registry {
    let registry = Registry::new();
    registry.register_builder(Arc::new(ExecBinBuilder::new()));
    registry.register_runner(Arc::new(LocalExecRunner::new(env.dirs().clone())));
    registry
}
