//! Runner contract.
//!
//! A runner schedules instances of built artifacts. It owns process lifecycle;
//! stream consumption belongs to whoever implements [`InstanceSink`].

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncRead;

use crate::context::RunContext;
use crate::error::{ConfigError, RunError};
use crate::healthcheck::Healthchecker;
use crate::selector::Selector;

/// An instance's live output stream.
pub type InstanceStream = Pin<Box<dyn AsyncRead + Send>>;

/// Streams of one started instance.
pub struct InstanceOutput {
    pub id: String,
    pub group_id: String,
    pub stdout: InstanceStream,
    pub stderr: InstanceStream,
}

impl std::fmt::Debug for InstanceOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceOutput")
            .field("id", &self.id)
            .field("group_id", &self.group_id)
            .finish_non_exhaustive()
    }
}

/// Receives instance streams as instances start.
pub trait InstanceSink: Send + Sync {
    /// Take over consumption of an instance's streams.
    fn manage(&self, output: InstanceOutput);

    /// Record an instance that never started.
    fn fail_start(&self, id: &str, reason: &str);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunGroup {
    pub id: String,
    pub instances: u32,
    /// Artifact from the build stage, or the group's prebuilt artifact.
    pub artifact: String,
    pub parameters: BTreeMap<String, String>,
    /// Coalesced run configuration for this group.
    pub run_config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInput {
    pub run_id: String,
    pub plan: String,
    pub case: String,
    pub total_instances: u32,
    pub groups: Vec<RunGroup>,
    /// Run configuration coalesced at the global level.
    pub run_config: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    pub run_id: String,
    /// Instances handed to the sink.
    pub started: u32,
    /// Instances reported through `fail_start`.
    pub failed_to_start: u32,
}

#[async_trait]
pub trait Runner: Send + Sync {
    fn id(&self) -> &Selector;

    /// Builder kinds (the part before `:`) whose artifacts this runner can run.
    fn compatible_builders(&self) -> Vec<String>;

    fn is_compatible(&self, builder: &Selector) -> bool {
        self.compatible_builders()
            .iter()
            .any(|k| k == builder.kind())
    }

    /// Type-check the coalesced run configuration.
    fn check_config(&self, _config: &Value) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Start every instance, handing streams to `sink` as they appear.
    /// Returns once all instances have been started or reported as failed;
    /// it does not wait for them to exit.
    async fn run(
        &self,
        ctx: &RunContext,
        input: RunInput,
        sink: &dyn InstanceSink,
    ) -> Result<RunOutput, RunError>;

    fn healthchecker(&self) -> Option<&dyn Healthchecker> {
        None
    }

    /// Stop every instance this runner started.
    async fn terminate_all(&self, _ctx: &RunContext) -> Result<(), RunError> {
        Ok(())
    }
}
