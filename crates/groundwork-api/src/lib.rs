//! Groundwork API
//!
//! Domain model shared by the engine and every backend:
//! - Composition: the declarative description of a test run (groups, instances,
//!   builder/runner selection, configuration overlays)
//! - Selector: `kind:implementation` tags naming builders and runners
//! - Event: the newline-delimited JSON protocol instances speak on stdout
//! - Builder / Runner: the contracts a backend implements
//! - HealthcheckReport: preflight check/fix results
//!
//! Nothing in this crate schedules work; see `groundwork-core` for the engine.

pub mod builder;
pub mod composition;
pub mod context;
pub mod error;
pub mod event;
pub mod healthcheck;
pub mod runner;
pub mod selector;

pub use builder::{fingerprint, BuildInput, BuildOutput, BuildResult, Builder};
pub use composition::{
    Build, Composition, ConfigMap, Dependency, Global, Group, Instances, Metadata, Run,
    ValidatedComposition,
};
pub use context::RunContext;
pub use error::{
    BuildError, ConfigError, HealthcheckEngineError, IncompatiblePairError, OrchestrationError,
    RunError, Stage, UnknownSelectorError, UnsupportedSelectorError, ValidationError, Violation,
};
pub use event::{Envelope, EnvelopeError, Event, EventType, Outcome, UnknownOutcome};
pub use healthcheck::{
    HealthcheckItem, HealthcheckReport, HealthcheckRequest, HealthcheckStatus, Healthchecker,
};
pub use runner::{InstanceOutput, InstanceSink, InstanceStream, RunGroup, RunInput, RunOutput, Runner};
pub use selector::{ComponentKind, Selector, SelectorParseError};

/// Groundwork API version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
