//! Builder contract.
//!
//! A builder turns a plan's sources plus a resolved build configuration into
//! an artifact the runner can execute. Builds must be pure functions of their
//! input; the engine caches results by [`fingerprint`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::context::RunContext;
use crate::error::{BuildError, ConfigError};
use crate::selector::Selector;

/// Everything a builder needs for one build.
#[derive(Debug, Clone)]
pub struct BuildInput {
    pub build_id: String,
    pub plan: String,
    /// Directory holding the plan's sources.
    pub plan_source: PathBuf,
    /// Groups sharing this build.
    pub group_ids: Vec<String>,
    pub selectors: Vec<String>,
    /// Dependency overrides, module -> version.
    pub dependencies: BTreeMap<String, String>,
    /// Coalesced build configuration; already accepted by `check_config`.
    pub build_config: Value,
    pub fingerprint: String,
}

impl BuildInput {
    /// Decode the coalesced configuration into the builder's own type.
    pub fn config<T: DeserializeOwned>(&self, component: &Selector) -> Result<T, ConfigError> {
        serde_json::from_value(self.build_config.clone()).map_err(|e| ConfigError::Decode {
            component: component.to_string(),
            message: e.to_string(),
        })
    }
}

/// What a builder hands back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    /// Artifact reference (a path, an image id, ...).
    pub artifact: String,
    /// Dependency versions actually used.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

/// A completed build. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub builder: Selector,
    pub artifact: String,
    pub group_ids: Vec<String>,
    pub fingerprint: String,
    pub dependencies: BTreeMap<String, String>,
}

#[async_trait]
pub trait Builder: Send + Sync {
    fn id(&self) -> &Selector;

    /// Selectors this builder understands. Groups requesting anything else
    /// are rejected before the build starts.
    fn supported_selectors(&self) -> &[&str] {
        &[]
    }

    /// Type-check the coalesced build configuration.
    fn check_config(&self, _config: &Value) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn build(&self, ctx: &RunContext, input: BuildInput) -> Result<BuildOutput, BuildError>;
}

/// SHA-256 over the builder, plan, build key and resolved config, hex encoded.
pub fn fingerprint(builder: &Selector, plan: &str, build_key: &str, config: &Value) -> String {
    let mut hasher = Sha256::new();
    for part in [builder.to_string().as_str(), plan, build_key] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(config.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
