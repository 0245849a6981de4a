//! Orchestrator: validate -> resolve -> compatibility -> build -> healthcheck
//! -> run -> aggregate.
//!
//! Every stage short-circuits on failure. Configuration problems are
//! reported before any build starts and before any instance is scheduled.
//! Test-level failures are not errors: they end up in [`RunReport::outcome`].

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

use groundwork_api::{
    fingerprint, BuildError, BuildInput, BuildOutput, BuildResult, Builder, Composition,
    HealthcheckReport, OrchestrationError, RunContext, RunError, RunGroup, RunInput, Runner,
    Selector, SelectorParseError, Stage, UnsupportedSelectorError, ValidatedComposition,
    ValidationError, Violation,
};

use crate::aggregator::{Aggregator, ClassifiedLine, InstanceVerdict, RunOutcome};
use crate::config::{coalesce, EnvConfig};
use crate::healthcheck::HealthcheckPolicy;
use crate::metrics::EngineMetrics;
use crate::obs;
use crate::registry::{check_compatible, Registry};

/// Per-invocation knobs.
#[derive(Debug, Clone, Default)]
pub struct OrchestrateOptions {
    /// Where the plan's sources live; defaults to `<home>/plans/<plan>`.
    pub plan_source: Option<PathBuf>,
    /// Gate policy; defaults to the environment's `[daemon]` settings.
    pub healthcheck: Option<HealthcheckPolicy>,
    /// Print classified instance output to stdout while the run progresses.
    pub console: bool,
}

/// Result of a run that reached the aggregation stage.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub instances: BTreeMap<String, InstanceVerdict>,
    pub log: Vec<ClassifiedLine>,
    pub builds: Vec<BuildResult>,
    pub healthcheck: Option<HealthcheckReport>,
}

/// A set of groups sharing one build.
struct BuildUnit {
    key: String,
    group_ids: Vec<String>,
    selectors: Vec<String>,
    dependencies: BTreeMap<String, String>,
    config: serde_json::Value,
    fingerprint: String,
}

pub struct Engine {
    registry: Arc<Registry>,
    env: EnvConfig,
    metrics: EngineMetrics,
    /// fingerprint -> completed build
    cache: Mutex<HashMap<String, BuildResult>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("home", &self.env.dirs().home())
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(registry: Arc<Registry>, env: EnvConfig) -> Self {
        Self {
            registry,
            env,
            metrics: EngineMetrics::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn env(&self) -> &EnvConfig {
        &self.env
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn list_builders(&self) -> Vec<Selector> {
        self.registry.builders()
    }

    pub fn list_runners(&self) -> Vec<Selector> {
        self.registry.runners()
    }

    /// Build and run `composition`, returning the aggregated verdict.
    pub async fn orchestrate(
        &self,
        ctx: &RunContext,
        composition: &Composition,
        opts: &OrchestrateOptions,
    ) -> Result<RunReport, OrchestrationError> {
        let result = self
            .orchestrate_inner(ctx, composition, opts)
            .instrument(ctx.span().clone())
            .await;
        if let Err(e) = &result {
            let _entered = ctx.span().enter();
            obs::emit_stage_failed(e.stage(), e);
        }
        result
    }

    /// Run the build stage only. The runner may be omitted from the
    /// composition.
    pub async fn build_only(
        &self,
        ctx: &RunContext,
        composition: &Composition,
        opts: &OrchestrateOptions,
    ) -> Result<Vec<BuildResult>, OrchestrationError> {
        async {
            let comp = composition.validate_for_build()?;
            let builder = self.registry.builder(comp.builder())?;
            self.build_groups(ctx, &comp, builder, opts).await
        }
        .instrument(ctx.span().clone())
        .await
    }

    /// Run a runner's healthcheck on demand. `Ok(None)` when the runner has no
    /// healthcheck.
    pub async fn healthcheck(
        &self,
        ctx: &RunContext,
        runner: &Selector,
        fix: bool,
    ) -> Result<Option<HealthcheckReport>, OrchestrationError> {
        let runner = self.registry.runner(runner)?;
        let Some(hc) = runner.healthchecker() else {
            return Ok(None);
        };
        let report = hc.healthcheck(ctx, fix).await?;
        obs::emit_healthcheck_evaluated(&runner.id().to_string(), &report);
        Ok(Some(report))
    }

    async fn orchestrate_inner(
        &self,
        ctx: &RunContext,
        composition: &Composition,
        opts: &OrchestrateOptions,
    ) -> Result<RunReport, OrchestrationError> {
        let comp = composition.validate()?;

        let builder = self.registry.builder(comp.builder())?;
        let runner_sel = comp.runner().ok_or_else(|| {
            ValidationError::single(Violation::MalformedSelector {
                field: "global.runner",
                source: SelectorParseError::Empty,
            })
        })?;
        let runner = self.registry.runner(runner_sel)?;

        check_compatible(runner.as_ref(), comp.builder())?;

        let builds = self.build_groups(ctx, &comp, builder, opts).await?;

        let policy = opts
            .healthcheck
            .unwrap_or_else(|| self.env.daemon.healthcheck_policy());
        let healthcheck = self.gate(ctx, runner.as_ref(), &policy).await?;

        let input = self.run_input(ctx, &comp, runner.as_ref(), &builds)?;
        if ctx.is_cancelled() {
            return Err(OrchestrationError::Canceled { stage: Stage::Run });
        }

        let aggregator = if opts.console {
            Aggregator::with_console(ctx.clone())
        } else {
            Aggregator::new(ctx.clone())
        };

        let started = Instant::now();
        obs::emit_run_started(
            &ctx.run_id,
            &comp.global.plan,
            &comp.global.case,
            &runner_sel.to_string(),
            comp.total_instances(),
        );

        match runner.run(ctx, input, &aggregator).await {
            Ok(out) => {
                debug!(
                    started = out.started,
                    failed_to_start = out.failed_to_start,
                    "runner scheduled all instances"
                );
            }
            Err(RunError::Canceled) => {
                info!("run canceled while scheduling instances");
                ctx.cancel();
            }
            Err(e) => {
                self.terminate(ctx, runner.as_ref()).await;
                return Err(OrchestrationError::Run(e));
            }
        }

        let aggregate = aggregator.wait().await;
        if ctx.is_cancelled() {
            self.terminate(ctx, runner.as_ref()).await;
        }

        let failed = match aggregate.outcome {
            RunOutcome::Failure { failed } => u64::from(failed),
            _ => 0,
        };
        self.metrics.inc_runs_completed();
        self.metrics.add_instances_failed(failed);
        self.metrics.flush();
        obs::emit_run_finished(
            &ctx.run_id,
            started.elapsed().as_millis() as u64,
            aggregate.outcome.as_str(),
            failed,
        );

        Ok(RunReport {
            run_id: ctx.run_id.clone(),
            outcome: aggregate.outcome,
            instances: aggregate.instances,
            log: aggregate.log,
            builds,
            healthcheck,
        })
    }

    async fn terminate(&self, ctx: &RunContext, runner: &dyn Runner) {
        if let Err(e) = runner.terminate_all(ctx).await {
            warn!(runner = %runner.id(), error = %e, "failed to terminate instances");
        }
    }

    /// Preflight the runner. Fixes failing is fatal by default; failing
    /// checks only warn.
    async fn gate(
        &self,
        ctx: &RunContext,
        runner: &dyn Runner,
        policy: &HealthcheckPolicy,
    ) -> Result<Option<HealthcheckReport>, OrchestrationError> {
        if !policy.enabled {
            return Ok(None);
        }
        let Some(hc) = runner.healthchecker() else {
            debug!(runner = %runner.id(), "runner has no healthcheck");
            return Ok(None);
        };

        let report = hc.healthcheck(ctx, policy.fix).await?;
        obs::emit_healthcheck_evaluated(&runner.id().to_string(), &report);

        if let Some(reason) = policy.rejection(&report) {
            return Err(OrchestrationError::HealthcheckRejected { reason, report });
        }
        Ok(Some(report))
    }

    fn run_input(
        &self,
        ctx: &RunContext,
        comp: &ValidatedComposition,
        runner: &dyn Runner,
        builds: &[BuildResult],
    ) -> Result<RunInput, OrchestrationError> {
        let env_layer = self.env.runner_config(runner.id());
        let config_err = |source| OrchestrationError::Config {
            stage: Stage::Run,
            source,
        };

        let run_config = coalesce([&env_layer, &comp.global.run_config]);
        runner.check_config(&run_config).map_err(config_err)?;

        let artifacts: HashMap<&str, &str> = builds
            .iter()
            .flat_map(|b| b.group_ids.iter().map(|g| (g.as_str(), b.artifact.as_str())))
            .collect();

        let mut groups = Vec::with_capacity(comp.groups.len());
        for (i, g) in comp.groups.iter().enumerate() {
            let merged = coalesce([&env_layer, &comp.global.run_config, &g.run_config]);
            runner.check_config(&merged).map_err(config_err)?;

            let artifact = g
                .run
                .artifact
                .clone()
                .or_else(|| artifacts.get(g.id.as_str()).map(|a| a.to_string()))
                .unwrap_or_default();

            groups.push(RunGroup {
                id: g.id.clone(),
                instances: comp.instance_count(i),
                artifact,
                parameters: g.run.test_params.clone(),
                run_config: merged,
            });
        }

        Ok(RunInput {
            run_id: ctx.run_id.clone(),
            plan: comp.global.plan.clone(),
            case: comp.global.case.clone(),
            total_instances: comp.total_instances(),
            groups,
            run_config,
        })
    }

    /// Group the composition into build units, check selectors and configs,
    /// then build every unit not already cached, concurrently.
    async fn build_groups(
        &self,
        ctx: &RunContext,
        comp: &ValidatedComposition,
        builder: Arc<dyn Builder>,
        opts: &OrchestrateOptions,
    ) -> Result<Vec<BuildResult>, OrchestrationError> {
        let units = self.plan_builds(comp, builder.as_ref())?;
        if ctx.is_cancelled() {
            return Err(OrchestrationError::Canceled { stage: Stage::Build });
        }

        let plan = comp.global.plan.clone();
        let plan_source = opts
            .plan_source
            .clone()
            .unwrap_or_else(|| self.env.dirs().plans().join(&plan));

        let mut results: Vec<Option<BuildResult>> = vec![None; units.len()];
        let mut pending = Vec::new();
        for (i, unit) in units.iter().enumerate() {
            let cached = self
                .cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&unit.fingerprint)
                .cloned();
            match cached {
                Some(hit) => {
                    debug!(fingerprint = %unit.fingerprint, groups = ?unit.group_ids, "build cache hit");
                    self.metrics.inc_build_cache_hits();
                    obs::emit_build_finished(&unit.fingerprint, 0, true, true);
                    results[i] = Some(BuildResult {
                        group_ids: unit.group_ids.clone(),
                        ..hit
                    });
                }
                None => pending.push(i),
            }
        }

        let build_ctx = ctx.child("build");
        let mut set = JoinSet::new();
        for &i in &pending {
            let unit = &units[i];
            let input = BuildInput {
                build_id: uuid::Uuid::new_v4().to_string(),
                plan: plan.clone(),
                plan_source: plan_source.clone(),
                group_ids: unit.group_ids.clone(),
                selectors: unit.selectors.clone(),
                dependencies: unit.dependencies.clone(),
                build_config: unit.config.clone(),
                fingerprint: unit.fingerprint.clone(),
            };
            let builder = Arc::clone(&builder);
            let task_ctx = build_ctx.clone();
            let span = build_ctx.span().clone();

            obs::emit_build_started(&input.build_id, &builder.id().to_string(), &unit.group_ids);
            set.spawn(
                async move {
                    let started = Instant::now();
                    let build_id = input.build_id.clone();
                    let res = builder.build(&task_ctx, input).await;
                    let ms = started.elapsed().as_millis() as u64;
                    obs::emit_build_finished(&build_id, ms, false, res.is_ok());
                    (i, res)
                }
                .instrument(span),
            );
        }

        let mut failure: Option<(usize, BuildError)> = None;
        while let Some(joined) = set.join_next().await {
            let (i, res): (usize, Result<BuildOutput, BuildError>) = match joined {
                Ok(r) => r,
                Err(e) => {
                    build_ctx.cancel();
                    if failure.is_none() {
                        let source = anyhow::anyhow!("build task join error: {e}");
                        failure = Some((usize::MAX, BuildError::Failed(source)));
                    }
                    continue;
                }
            };
            match res {
                Ok(out) => {
                    let unit = &units[i];
                    let result = BuildResult {
                        builder: builder.id().clone(),
                        artifact: out.artifact,
                        group_ids: unit.group_ids.clone(),
                        fingerprint: unit.fingerprint.clone(),
                        dependencies: out.dependencies,
                    };
                    self.metrics.inc_builds_executed();
                    self.cache
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(unit.fingerprint.clone(), result.clone());
                    results[i] = Some(result);
                }
                Err(e) => {
                    // the first failure cancels the remaining builds
                    build_ctx.cancel();
                    let replace = match &failure {
                        None => true,
                        Some((_, BuildError::Canceled)) => !matches!(e, BuildError::Canceled),
                        Some(_) => false,
                    };
                    if replace {
                        failure = Some((i, e));
                    }
                }
            }
        }

        if let Some((i, source)) = failure {
            if ctx.is_cancelled() {
                return Err(OrchestrationError::Canceled { stage: Stage::Build });
            }
            let groups = units.get(i).map(|u| u.group_ids.clone()).unwrap_or_default();
            return Err(OrchestrationError::Build { groups, source });
        }

        Ok(results.into_iter().flatten().collect())
    }

    /// Deduplicate groups by build key and resolve each unit's config and
    /// fingerprint. Groups with a prebuilt artifact are skipped.
    fn plan_builds(
        &self,
        comp: &ValidatedComposition,
        builder: &dyn Builder,
    ) -> Result<Vec<BuildUnit>, OrchestrationError> {
        let supported = builder.supported_selectors();
        let mut unsupported = Vec::new();
        let mut offending = Vec::new();
        for g in comp.groups.iter().filter(|g| g.run.artifact.is_none()) {
            let unknown: Vec<&String> = g
                .build
                .selectors
                .iter()
                .filter(|s| !supported.contains(&s.as_str()))
                .collect();
            if !unknown.is_empty() {
                offending.push(g.id.clone());
                unsupported.extend(unknown.into_iter().cloned());
            }
        }
        if !unsupported.is_empty() {
            unsupported.sort();
            unsupported.dedup();
            return Err(OrchestrationError::UnsupportedSelector {
                groups: offending,
                source: UnsupportedSelectorError {
                    builder: builder.id().clone(),
                    selectors: unsupported,
                },
            });
        }

        let env_layer = self.env.builder_config(builder.id());
        let mut units: Vec<BuildUnit> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();
        for g in comp.groups.iter().filter(|g| g.run.artifact.is_none()) {
            let key = g.build_key();
            if let Some(&i) = by_key.get(&key) {
                units[i].group_ids.push(g.id.clone());
                continue;
            }

            let config = coalesce([&env_layer, &comp.global.build_config, &g.build_config]);
            builder
                .check_config(&config)
                .map_err(|source| OrchestrationError::Config {
                    stage: Stage::Build,
                    source,
                })?;

            let mut selectors = g.build.selectors.clone();
            selectors.sort();
            selectors.dedup();

            by_key.insert(key.clone(), units.len());
            units.push(BuildUnit {
                fingerprint: fingerprint(builder.id(), &comp.global.plan, &key, &config),
                key,
                group_ids: vec![g.id.clone()],
                selectors,
                dependencies: g.build.dependency_map(),
                config,
            });
        }

        for u in &units {
            debug!(key = %u.key, groups = ?u.group_ids, "planned build");
        }
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeBuilder, FakeRunner};
    use groundwork_api::{Global, Group, Instances};

    fn composition(groups: &[(&str, u32, &[&str])]) -> Composition {
        Composition {
            global: Global {
                plan: "network".into(),
                case: "ping".into(),
                builder: "exec:go".into(),
                runner: "local:exec".into(),
                ..Default::default()
            },
            groups: groups
                .iter()
                .map(|(id, count, selectors)| Group {
                    id: id.to_string(),
                    instances: Instances {
                        count: *count,
                        percentage: 0.0,
                    },
                    build: groundwork_api::Build {
                        selectors: selectors.iter().map(|s| s.to_string()).collect(),
                        dependencies: vec![],
                    },
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn engine(builder: FakeBuilder) -> (Engine, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Registry::new();
        reg.register_builder(Arc::new(builder));
        reg.register_runner(Arc::new(FakeRunner::new("local:exec", &["exec"])));
        (Engine::new(Arc::new(reg), EnvConfig::new(tmp.path())), tmp)
    }

    #[test]
    fn test_plan_builds_dedups_by_key() {
        let (engine, _tmp) = engine(FakeBuilder::new("exec:go").with_selectors(&["foo", "bar"]));
        let comp = composition(&[("a", 1, &["foo", "bar"]), ("b", 1, &["bar", "foo"]), ("c", 1, &[])])
            .validate()
            .unwrap();
        let builder = engine.registry().builder(comp.builder()).unwrap();

        let units = engine.plan_builds(&comp, builder.as_ref()).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].group_ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(units[0].selectors, vec!["bar".to_string(), "foo".to_string()]);
        assert_ne!(units[0].fingerprint, units[1].fingerprint);
    }

    #[test]
    fn test_unsupported_selectors_named_together() {
        let (engine, _tmp) = engine(FakeBuilder::new("exec:go"));
        let comp = composition(&[("a", 1, &["foo"]), ("b", 1, &["bar", "foo"]), ("c", 1, &[])])
            .validate()
            .unwrap();
        let builder = engine.registry().builder(comp.builder()).unwrap();

        let err = engine.plan_builds(&comp, builder.as_ref()).err().unwrap();
        match err {
            OrchestrationError::UnsupportedSelector { groups, source } => {
                assert_eq!(groups, vec!["a".to_string(), "b".to_string()]);
                assert_eq!(source.selectors, vec!["bar".to_string(), "foo".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_build_cache_reuses_fingerprint() {
        let builder = Arc::new(FakeBuilder::new("exec:go"));
        let tmp = tempfile::tempdir().unwrap();
        let reg = Registry::new();
        reg.register_builder(builder.clone());
        let engine = Engine::new(Arc::new(reg), EnvConfig::new(tmp.path()));

        let mut comp = composition(&[("a", 1, &[])]);
        comp.global.runner.clear();
        let ctx = RunContext::new("r");
        let opts = OrchestrateOptions::default();

        let first = engine.build_only(&ctx, &comp, &opts).await.unwrap();
        let second = engine.build_only(&ctx, &comp, &opts).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(builder.builds(), 1);
        assert_eq!(engine.metrics().build_cache_hits(), 1);
        assert_eq!(engine.metrics().builds_executed(), 1);
    }
}
