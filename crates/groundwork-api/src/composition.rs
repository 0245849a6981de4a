//! Composition model: the declarative description of a test run.
//!
//! A composition is constructed from an external document (TOML or JSON),
//! validated once at orchestration entry and immutable afterwards. Validation
//! trickles global build/run defaults down to the groups, resolves instance
//! counts and yields a [`ValidatedComposition`].

use std::collections::{BTreeMap, HashSet};
use std::ops::Deref;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ValidationError, Violation};
use crate::selector::Selector;

/// Free-form configuration table. Keys are kept sorted, so serializing a map
/// is canonical.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Composition {
    /// Optional metadata about this composition.
    #[serde(default)]
    pub metadata: Metadata,

    /// General parameters for this composition.
    pub global: Global,

    /// The instance groups participating in this composition.
    #[serde(default)]
    pub groups: Vec<Group>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub author: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Global {
    /// The test plan to run.
    #[serde(default)]
    pub plan: String,

    /// The test case within the plan.
    #[serde(default)]
    pub case: String,

    /// Total number of instances; zero means "infer from the groups".
    #[serde(default)]
    pub total_instances: u32,

    /// Builder selector, e.g. `exec:go`.
    #[serde(default)]
    pub builder: String,

    /// Runner selector, e.g. `local:exec`.
    #[serde(default)]
    pub runner: String,

    /// Global build configuration; groups overlay their own `build_config`.
    #[serde(default)]
    pub build_config: ConfigMap,

    /// Build defaults trickled down to groups (selectors, dependencies).
    #[serde(default)]
    pub build: Option<Build>,

    /// Global run configuration; groups overlay their own `run_config`.
    #[serde(default)]
    pub run_config: ConfigMap,

    /// Run defaults trickled down to groups (artifact, test params).
    #[serde(default)]
    pub run: Option<Run>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Unique ID of this group.
    pub id: String,

    #[serde(default)]
    pub instances: Instances,

    #[serde(default)]
    pub build: Build,

    /// Per-group build overrides, overlaid on `global.build_config`.
    #[serde(default)]
    pub build_config: ConfigMap,

    /// Per-group run overrides, overlaid on `global.run_config`.
    #[serde(default)]
    pub run_config: ConfigMap,

    #[serde(default)]
    pub run: Run,
}

/// Instance sizing of a group. Exactly one of `count` / `percentage` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Instances {
    #[serde(default)]
    pub count: u32,

    /// Fraction of `global.total_instances`, in (0, 1].
    #[serde(default)]
    pub percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    /// Optional builder behaviors requested by this group (for go builders,
    /// build tags).
    #[serde(default)]
    pub selectors: Vec<String>,

    /// Upstream dependency overrides.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub module: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// Prebuilt artifact to use instead of building this group.
    #[serde(default)]
    pub artifact: Option<String>,

    /// Test parameters passed to the instances of this group.
    #[serde(default)]
    pub test_params: BTreeMap<String, String>,
}

impl Build {
    /// Composite key identifying this build, suitable for deduplication.
    /// Selector and dependency order does not matter.
    pub fn build_key(&self) -> String {
        let mut selectors = self.selectors.clone();
        selectors.sort();
        selectors.dedup();

        let mut deps = self.dependencies.clone();
        deps.sort_by(|a, b| a.module.cmp(&b.module));

        let mut key = format!("selectors={};dependencies=", selectors.join(","));
        for d in &deps {
            key.push_str(&format!("{}:{}|", d.module, d.version));
        }
        key
    }

    /// Dependencies as a module -> version map.
    pub fn dependency_map(&self) -> BTreeMap<String, String> {
        self.dependencies
            .iter()
            .map(|d| (d.module.clone(), d.version.clone()))
            .collect()
    }

    /// Fill in selectors and dependencies from `defaults` where this build
    /// leaves them unset. Explicit dependency versions win.
    fn apply_defaults(&mut self, defaults: &Build) {
        if self.selectors.is_empty() {
            self.selectors = defaults.selectors.clone();
        }
        let present: HashSet<String> = self.dependencies.iter().map(|d| d.module.clone()).collect();
        for d in &defaults.dependencies {
            if !present.contains(&d.module) {
                self.dependencies.push(d.clone());
            }
        }
    }
}

impl Group {
    /// Key under which groups share one build: the build key plus the
    /// group's own build config overlay.
    pub fn build_key(&self) -> String {
        let overlay = serde_json::Value::Object(self.build_config.clone());
        format!("{};config={}", self.build.build_key(), overlay)
    }
}

impl Run {
    fn apply_defaults(&mut self, defaults: &Run) {
        if self.artifact.is_none() {
            self.artifact = defaults.artifact.clone();
        }
        for (k, v) in &defaults.test_params {
            self.test_params.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

/// Which fields validation insists on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Build,
    Run,
}

impl Composition {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Validate this composition for a full run (build + schedule).
    pub fn validate(&self) -> Result<ValidatedComposition, ValidationError> {
        self.validate_with(Mode::Run)
    }

    /// Validate this composition for a build only: case and runner may be omitted.
    pub fn validate_for_build(&self) -> Result<ValidatedComposition, ValidationError> {
        self.validate_with(Mode::Build)
    }

    /// Clone this composition, retaining only the groups at `indices`.
    pub fn pick_groups(&self, indices: &[usize]) -> Result<Composition, ValidationError> {
        let bad: Vec<Violation> = indices
            .iter()
            .filter(|&&i| i >= self.groups.len())
            .map(|&i| Violation::GroupIndexOutOfRange(i))
            .collect();
        if !bad.is_empty() {
            return Err(ValidationError { violations: bad });
        }

        let mut picked = self.clone();
        picked.groups = indices.iter().map(|&i| self.groups[i].clone()).collect();
        Ok(picked)
    }

    fn apply_global_defaults(&mut self) {
        if let Some(def) = self.global.build.clone() {
            for g in &mut self.groups {
                g.build.apply_defaults(&def);
            }
        }
        if let Some(def) = self.global.run.clone() {
            for g in &mut self.groups {
                g.run.apply_defaults(&def);
            }
        }
    }

    fn validate_with(&self, mode: Mode) -> Result<ValidatedComposition, ValidationError> {
        let mut violations = Vec::new();

        if self.global.plan.trim().is_empty() {
            violations.push(Violation::EmptyPlan);
        }
        if mode == Mode::Run && self.global.case.trim().is_empty() {
            violations.push(Violation::EmptyCase);
        }

        let builder = match Selector::from_str(&self.global.builder) {
            Ok(s) => Some(s),
            Err(source) => {
                violations.push(Violation::MalformedSelector {
                    field: "global.builder",
                    source,
                });
                None
            }
        };

        let runner = if mode == Mode::Build && self.global.runner.is_empty() {
            None
        } else {
            match Selector::from_str(&self.global.runner) {
                Ok(s) => Some(s),
                Err(source) => {
                    violations.push(Violation::MalformedSelector {
                        field: "global.runner",
                        source,
                    });
                    None
                }
            }
        };

        if self.groups.is_empty() {
            violations.push(Violation::NoGroups);
        }

        let total = self.global.total_instances;
        let mut seen = HashSet::with_capacity(self.groups.len());
        let mut counts = Vec::with_capacity(self.groups.len());
        let mut counts_ok = true;

        for (index, g) in self.groups.iter().enumerate() {
            if g.id.trim().is_empty() {
                violations.push(Violation::EmptyGroupId { index });
            } else if !seen.insert(g.id.as_str()) {
                violations.push(Violation::DuplicateGroupId(g.id.clone()));
            }

            let Instances { count, percentage } = g.instances;
            let resolved = if count > 0 && percentage > 0.0 {
                violations.push(Violation::CountAndPercentage {
                    group: g.id.clone(),
                });
                None
            } else if count > 0 {
                Some(count)
            } else if percentage > 1.0 {
                violations.push(Violation::PercentageOutOfRange {
                    group: g.id.clone(),
                    percentage: percentage.to_string(),
                });
                None
            } else if percentage > 0.0 {
                if total == 0 {
                    violations.push(Violation::PercentageWithoutTotal {
                        group: g.id.clone(),
                    });
                    None
                } else {
                    Some((percentage * f64::from(total)).round() as u32).filter(|n| *n > 0)
                }
            } else {
                None
            };

            match resolved {
                Some(n) => counts.push(n),
                None => {
                    counts_ok = false;
                    if !violations.iter().any(|v| violation_names_group(v, &g.id)) {
                        violations.push(Violation::ZeroInstances {
                            group: g.id.clone(),
                        });
                    }
                    counts.push(0);
                }
            }
        }

        let calculated: u64 = counts.iter().map(|&c| u64::from(c)).sum();
        let total_instances = if total == 0 {
            u32::try_from(calculated).unwrap_or_else(|_| {
                violations.push(Violation::TotalOverflow {
                    calculated,
                    max: u32::MAX,
                });
                0
            })
        } else {
            if counts_ok && u64::from(total) != calculated {
                violations.push(Violation::TotalMismatch { total, calculated });
            }
            total
        };

        if !violations.is_empty() {
            return Err(ValidationError { violations });
        }

        let (Some(builder), runner) = (builder, runner) else {
            return Err(ValidationError::single(Violation::MalformedSelector {
                field: "global.builder",
                source: crate::selector::SelectorParseError::Empty,
            }));
        };

        let mut composition = self.clone();
        composition.global.total_instances = total_instances;
        composition.apply_global_defaults();

        Ok(ValidatedComposition {
            composition,
            builder,
            runner,
            instance_counts: counts,
        })
    }
}

fn violation_names_group(v: &Violation, group: &str) -> bool {
    match v {
        Violation::CountAndPercentage { group: g }
        | Violation::PercentageWithoutTotal { group: g }
        | Violation::PercentageOutOfRange { group: g, .. } => g == group,
        _ => false,
    }
}

/// A composition that passed validation, with resolved selectors and instance
/// counts. Read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedComposition {
    composition: Composition,
    builder: Selector,
    runner: Option<Selector>,
    instance_counts: Vec<u32>,
}

impl ValidatedComposition {
    pub fn builder(&self) -> &Selector {
        &self.builder
    }

    /// Always present for compositions validated with [`Composition::validate`].
    pub fn runner(&self) -> Option<&Selector> {
        self.runner.as_ref()
    }

    /// Resolved instance count of the group at `index`.
    pub fn instance_count(&self, index: usize) -> u32 {
        self.instance_counts.get(index).copied().unwrap_or(0)
    }

    pub fn total_instances(&self) -> u32 {
        self.composition.global.total_instances
    }

    pub fn into_inner(self) -> Composition {
        self.composition
    }
}

impl Deref for ValidatedComposition {
    type Target = Composition;

    fn deref(&self) -> &Composition {
        &self.composition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: &str, count: u32) -> Group {
        Group {
            id: id.to_string(),
            instances: Instances {
                count,
                percentage: 0.0,
            },
            ..Default::default()
        }
    }

    fn composition(groups: Vec<Group>, total: u32) -> Composition {
        Composition {
            global: Global {
                plan: "placebo".into(),
                case: "ok".into(),
                total_instances: total,
                builder: "exec:go".into(),
                runner: "local:exec".into(),
                ..Default::default()
            },
            groups,
            ..Default::default()
        }
    }

    #[test]
    fn test_total_inferred_from_groups() {
        let v = composition(vec![group("a", 2), group("b", 3)], 0)
            .validate()
            .unwrap();
        assert_eq!(v.total_instances(), 5);
        assert_eq!(v.instance_count(1), 3);
        assert_eq!(v.builder().to_string(), "exec:go");
        assert_eq!(v.runner().unwrap().to_string(), "local:exec");
    }

    #[test]
    fn test_inferred_total_overflow_rejected() {
        let err = composition(vec![group("a", u32::MAX), group("b", 2)], 0)
            .validate()
            .unwrap_err();
        assert_eq!(
            err.violations,
            vec![Violation::TotalOverflow {
                calculated: u64::from(u32::MAX) + 2,
                max: u32::MAX
            }]
        );
    }

    #[test]
    fn test_total_mismatch_rejected() {
        let err = composition(vec![group("a", 2), group("b", 3)], 4)
            .validate()
            .unwrap_err();
        assert_eq!(
            err.violations,
            vec![Violation::TotalMismatch {
                total: 4,
                calculated: 5
            }]
        );
    }

    #[test]
    fn test_every_violation_reported() {
        let mut c = composition(vec![group("a", 1), group("a", 0)], 0);
        c.global.plan = String::new();
        c.global.case = " ".into();
        c.global.runner = "docker".into();

        let err = c.validate().unwrap_err();
        assert!(err.violations.contains(&Violation::EmptyPlan));
        assert!(err.violations.contains(&Violation::EmptyCase));
        assert!(err.violations.contains(&Violation::DuplicateGroupId("a".into())));
        assert!(err
            .violations
            .contains(&Violation::ZeroInstances { group: "a".into() }));
        assert!(err.violations.iter().any(|v| matches!(
            v,
            Violation::MalformedSelector {
                field: "global.runner",
                ..
            }
        )));
        assert_eq!(err.violations.len(), 5);
    }

    #[test]
    fn test_percentage_resolution() {
        let mut half = group("half", 0);
        half.instances.percentage = 0.5;
        let mut other = group("other", 0);
        other.instances.percentage = 0.5;

        let v = composition(vec![half, other], 10).validate().unwrap();
        assert_eq!(v.instance_count(0), 5);
        assert_eq!(v.instance_count(1), 5);

        let mut both = group("both", 2);
        both.instances.percentage = 0.5;
        let err = composition(vec![both], 0).validate().unwrap_err();
        assert_eq!(
            err.violations,
            vec![Violation::CountAndPercentage {
                group: "both".into()
            }]
        );
    }

    #[test]
    fn test_build_only_validation_skips_case_and_runner() {
        let mut c = composition(vec![group("a", 1)], 0);
        c.global.case.clear();
        c.global.runner.clear();
        assert!(c.validate().is_err());

        let v = c.validate_for_build().unwrap();
        assert!(v.runner().is_none());
    }

    #[test]
    fn test_global_defaults_trickle_down() {
        let mut explicit = group("explicit", 1);
        explicit.build.selectors = vec!["foo".into()];
        explicit.build.dependencies = vec![Dependency {
            module: "libp2p".into(),
            version: "v2".into(),
        }];
        explicit.run.test_params.insert("size".into(), "big".into());

        let mut c = composition(vec![explicit, group("defaulted", 1)], 0);
        c.global.build = Some(Build {
            selectors: vec!["bar".into()],
            dependencies: vec![
                Dependency {
                    module: "libp2p".into(),
                    version: "v1".into(),
                },
                Dependency {
                    module: "ipfs".into(),
                    version: "v0.5".into(),
                },
            ],
        });
        c.global.run = Some(Run {
            artifact: Some("/bin/true".into()),
            test_params: [("size".to_string(), "small".to_string())].into(),
        });

        let v = c.validate().unwrap();
        let explicit = &v.groups[0];
        assert_eq!(explicit.build.selectors, vec!["foo".to_string()]);
        assert_eq!(explicit.build.dependency_map()["libp2p"], "v2");
        assert_eq!(explicit.build.dependency_map()["ipfs"], "v0.5");
        assert_eq!(explicit.run.test_params["size"], "big");
        assert_eq!(explicit.run.artifact.as_deref(), Some("/bin/true"));

        let defaulted = &v.groups[1];
        assert_eq!(defaulted.build.selectors, vec!["bar".to_string()]);
        assert_eq!(defaulted.run.test_params["size"], "small");
    }

    #[test]
    fn test_build_key_is_order_insensitive() {
        let a = Build {
            selectors: vec!["b".into(), "a".into()],
            dependencies: vec![
                Dependency {
                    module: "y".into(),
                    version: "1".into(),
                },
                Dependency {
                    module: "x".into(),
                    version: "2".into(),
                },
            ],
        };
        let mut b = a.clone();
        b.selectors.reverse();
        b.dependencies.reverse();
        assert_eq!(a.build_key(), b.build_key());
        assert_eq!(a.build_key(), "selectors=a,b;dependencies=x:2|y:1|");
    }

    #[test]
    fn test_pick_groups() {
        let c = composition(vec![group("a", 1), group("b", 1), group("c", 1)], 0);
        let picked = c.pick_groups(&[2, 0]).unwrap();
        let ids: Vec<_> = picked.groups.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);

        let err = c.pick_groups(&[3]).unwrap_err();
        assert_eq!(err.violations, vec![Violation::GroupIndexOutOfRange(3)]);
    }

    #[test]
    fn test_parse_toml_document() {
        let doc = r#"
            [metadata]
            name = "smoke"

            [global]
            plan = "network"
            case = "ping-pong"
            builder = "exec:go"
            runner = "local:exec"
            total_instances = 2

            [global.build_config]
            go_proxy_mode = "direct"

            [[groups]]
            id = "pingers"
            instances = { count = 2 }

            [groups.build]
            selectors = ["foo"]

            [groups.run_config]
            keep_outputs = true
        "#;

        let c = Composition::from_toml_str(doc).unwrap();
        assert_eq!(c.metadata.name, "smoke");
        assert_eq!(c.global.build_config["go_proxy_mode"], "direct");
        assert_eq!(c.groups[0].build.selectors, vec!["foo".to_string()]);
        assert_eq!(c.groups[0].run_config["keep_outputs"], true);
        assert!(c.validate().is_ok());
    }
}
