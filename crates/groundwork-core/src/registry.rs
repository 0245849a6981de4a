//! Selector -> implementation registry for builders and runners.
//!
//! Populated at startup; resolving an unregistered selector is a terminal
//! configuration error.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use groundwork_api::{
    Builder, ComponentKind, IncompatiblePairError, Runner, Selector, UnknownSelectorError,
};

#[derive(Default)]
pub struct Registry {
    builders: RwLock<BTreeMap<Selector, Arc<dyn Builder>>>,
    runners: RwLock<BTreeMap<Selector, Arc<dyn Runner>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("builders", &self.builders())
            .field("runners", &self.runners())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builder under its own id, replacing any previous one.
    pub fn register_builder(&self, builder: Arc<dyn Builder>) {
        let id = builder.id().clone();
        debug!(builder = %id, "registering builder");
        self.builders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, builder);
    }

    /// Register a runner under its own id, replacing any previous one.
    pub fn register_runner(&self, runner: Arc<dyn Runner>) {
        let id = runner.id().clone();
        debug!(runner = %id, "registering runner");
        self.runners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, runner);
    }

    pub fn builder(&self, selector: &Selector) -> Result<Arc<dyn Builder>, UnknownSelectorError> {
        self.builders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(selector)
            .cloned()
            .ok_or_else(|| UnknownSelectorError {
                component: ComponentKind::Builder,
                selector: selector.clone(),
            })
    }

    pub fn runner(&self, selector: &Selector) -> Result<Arc<dyn Runner>, UnknownSelectorError> {
        self.runners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(selector)
            .cloned()
            .ok_or_else(|| UnknownSelectorError {
                component: ComponentKind::Runner,
                selector: selector.clone(),
            })
    }

    /// Registered builder selectors, sorted.
    pub fn builders(&self) -> Vec<Selector> {
        self.builders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Registered runner selectors, sorted.
    pub fn runners(&self) -> Vec<Selector> {
        self.runners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

/// Fail unless `runner` accepts artifacts of `builder`'s kind.
pub fn check_compatible(runner: &dyn Runner, builder: &Selector) -> Result<(), IncompatiblePairError> {
    if runner.is_compatible(builder) {
        return Ok(());
    }
    Err(IncompatiblePairError {
        runner: runner.id().clone(),
        builder: builder.clone(),
        compatible: runner.compatible_builders(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeBuilder, FakeRunner};

    #[test]
    fn test_resolve_registered_and_unknown() {
        let reg = Registry::new();
        reg.register_builder(Arc::new(FakeBuilder::new("exec:go")));
        reg.register_runner(Arc::new(FakeRunner::new("local:exec", &["exec"])));

        let sel: Selector = "exec:go".parse().unwrap();
        assert_eq!(reg.builder(&sel).unwrap().id(), &sel);

        let missing: Selector = "docker:go".parse().unwrap();
        let err = reg.builder(&missing).err().unwrap();
        assert_eq!(err.component, ComponentKind::Builder);
        assert_eq!(err.to_string(), "unknown builder: docker:go");

        let err = reg.runner(&"cluster:k8s".parse().unwrap()).err().unwrap();
        assert_eq!(err.component, ComponentKind::Runner);
    }

    #[test]
    fn test_listing_is_sorted() {
        let reg = Registry::new();
        reg.register_builder(Arc::new(FakeBuilder::new("exec:go")));
        reg.register_builder(Arc::new(FakeBuilder::new("docker:go")));
        let names: Vec<String> = reg.builders().iter().map(|s| s.to_string()).collect();
        assert_eq!(names, vec!["docker:go", "exec:go"]);
    }

    #[test]
    fn test_compatibility() {
        let runner = FakeRunner::new("local:exec", &["exec"]);
        assert!(check_compatible(&runner, &"exec:go".parse().unwrap()).is_ok());

        let err = check_compatible(&runner, &"docker:go".parse().unwrap()).unwrap_err();
        assert_eq!(err.compatible, vec!["exec".to_string()]);
        assert!(err
            .to_string()
            .starts_with("runner local:exec is incompatible with builder docker:go"));
    }
}
