//! Error taxonomy for orchestration.
//!
//! Configuration errors (validation, selectors, compatibility, config shape) are
//! all detected before any instance starts. Build and run errors come from the
//! backends. Test-level failures never show up here: the aggregator folds them
//! into the run verdict.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::healthcheck::HealthcheckReport;
use crate::selector::{ComponentKind, Selector, SelectorParseError};

/// A single problem found while validating a composition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("global.plan must not be empty")]
    EmptyPlan,

    #[error("global.case must not be empty")]
    EmptyCase,

    #[error("{field}: {source}")]
    MalformedSelector {
        field: &'static str,
        source: SelectorParseError,
    },

    #[error("composition declares no groups")]
    NoGroups,

    #[error("group at index {index} has an empty id")]
    EmptyGroupId { index: usize },

    #[error("group ids not unique; found duplicate: {0}")]
    DuplicateGroupId(String),

    #[error("group {group}: instances must set either count or percentage, not both")]
    CountAndPercentage { group: String },

    #[error("group {group}: percentage requires global.total_instances to be set")]
    PercentageWithoutTotal { group: String },

    #[error("group {group}: percentage {percentage} outside of (0, 1]")]
    PercentageOutOfRange { group: String, percentage: String },

    #[error("group {group}: instance count must be greater than zero")]
    ZeroInstances { group: String },

    #[error("sum of calculated instances per group doesn't match total; total={total}, calculated={calculated}")]
    TotalMismatch { total: u32, calculated: u64 },

    #[error("sum of instances per group ({calculated}) exceeds the maximum of {max}")]
    TotalOverflow { calculated: u64, max: u32 },

    #[error("invalid group index {0}")]
    GroupIndexOutOfRange(usize),
}

/// Every violation found in one validation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    pub fn single(v: Violation) -> Self {
        Self {
            violations: vec![v],
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid composition ({} violation(s))", self.violations.len())?;
        for v in &self.violations {
            write!(f, "; {v}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {component}: {selector}")]
pub struct UnknownSelectorError {
    pub component: ComponentKind,
    pub selector: Selector,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("runner {runner} is incompatible with builder {builder}; compatible builder kinds: {compatible:?}")]
pub struct IncompatiblePairError {
    pub runner: Selector,
    pub builder: Selector,
    pub compatible: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("builder {builder} does not support selector(s): {}", .selectors.join(", "))]
pub struct UnsupportedSelectorError {
    pub builder: Selector,
    /// Sorted and deduplicated.
    pub selectors: Vec<String>,
}

/// Configuration could not be loaded, parsed or coalesced into the shape a
/// component expects.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("error while coalescing configuration values for {component}: {message}")]
    Decode { component: String, message: String },

    #[error("failed to parse TOML document: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to parse JSON document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("found .env.toml at {path}, but failed to parse: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("home path is not a directory: {0}")]
    HomeNotDirectory(PathBuf),

    #[error("could not determine a home directory; set GROUNDWORK_HOME")]
    NoHome,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("build failed: {0:#}")]
    Failed(#[source] anyhow::Error),

    #[error("build canceled")]
    Canceled,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("run failed: {0:#}")]
    Failed(#[source] anyhow::Error),

    #[error("invalid run input: {0}")]
    InvalidInput(String),

    #[error("run canceled")]
    Canceled,
}

/// Healthcheck engine failure, as opposed to a check that legitimately failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HealthcheckEngineError {
    #[error("healthcheck canceled before all checks ran")]
    Canceled,
}

/// Orchestration stage, reported on the failure path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Resolve,
    Compatibility,
    Build,
    Healthcheck,
    Run,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Validate => "validate",
            Stage::Resolve => "resolve",
            Stage::Compatibility => "compatibility",
            Stage::Build => "build",
            Stage::Healthcheck => "healthcheck",
            Stage::Run => "run",
        };
        f.write_str(s)
    }
}

/// Terminal error of one orchestration attempt.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    UnknownSelector(#[from] UnknownSelectorError),

    #[error(transparent)]
    Incompatible(#[from] IncompatiblePairError),

    #[error("groups {groups:?}: {source}")]
    UnsupportedSelector {
        groups: Vec<String>,
        #[source]
        source: UnsupportedSelectorError,
    },

    #[error("{stage} stage: {source}")]
    Config {
        stage: Stage,
        #[source]
        source: ConfigError,
    },

    #[error("build for groups {groups:?} failed: {source}")]
    Build {
        groups: Vec<String>,
        #[source]
        source: BuildError,
    },

    #[error("healthcheck errored: {0}")]
    Healthcheck(#[from] HealthcheckEngineError),

    #[error("healthcheck rejected scheduling: {reason}\n{report}")]
    HealthcheckRejected {
        reason: String,
        report: HealthcheckReport,
    },

    #[error(transparent)]
    Run(RunError),

    #[error("orchestration canceled during {stage} stage")]
    Canceled { stage: Stage },
}

impl OrchestrationError {
    /// The stage that failed.
    pub fn stage(&self) -> Stage {
        match self {
            OrchestrationError::Validation(_) => Stage::Validate,
            OrchestrationError::UnknownSelector(_) => Stage::Resolve,
            OrchestrationError::Incompatible(_) => Stage::Compatibility,
            OrchestrationError::UnsupportedSelector { .. } => Stage::Build,
            OrchestrationError::Config { stage, .. } => *stage,
            OrchestrationError::Build { .. } => Stage::Build,
            OrchestrationError::Healthcheck(_) => Stage::Healthcheck,
            OrchestrationError::HealthcheckRejected { .. } => Stage::Healthcheck,
            OrchestrationError::Run(_) => Stage::Run,
            OrchestrationError::Canceled { stage } => *stage,
        }
    }

    /// Whether this is a configuration error (detected before any instance started).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            OrchestrationError::Validation(_)
                | OrchestrationError::UnknownSelector(_)
                | OrchestrationError::Incompatible(_)
                | OrchestrationError::UnsupportedSelector { .. }
                | OrchestrationError::Config { .. }
        )
    }

    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            OrchestrationError::Canceled { .. }
                | OrchestrationError::Build {
                    source: BuildError::Canceled,
                    ..
                }
                | OrchestrationError::Run(RunError::Canceled)
                | OrchestrationError::Healthcheck(HealthcheckEngineError::Canceled)
        )
    }
}
