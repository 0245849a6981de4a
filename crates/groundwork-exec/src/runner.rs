//! `local:exec` runner: one child process per instance on this machine.
//!
//! Each instance gets its run environment through `TEST_*` variables and an
//! outputs directory under `<home>/outputs/<run>/<group>/<n>`. Stdout and
//! stderr are handed to the sink as-is; the runner never interprets them.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use groundwork_api::{
    ConfigError, Healthchecker, InstanceOutput, InstanceSink, RunContext, RunError, RunGroup,
    RunInput, RunOutput, Runner, Selector,
};
use groundwork_core::{decode_config, dir_exists_checker, dir_exists_fixer, Directories, Healthcheck};

/// Runner configuration, coalesced from `.env.toml`, the composition and the
/// group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalExecConfig {
    /// Extra arguments passed to every instance.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables. `TEST_*` variables set by the runner win.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

pub struct LocalExecRunner {
    id: Selector,
    dirs: Directories,
    healthcheck: Healthcheck,
    /// run id -> (instance id, child)
    children: Mutex<BTreeMap<String, Vec<(String, Child)>>>,
}

impl std::fmt::Debug for LocalExecRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalExecRunner")
            .field("id", &self.id)
            .field("home", &self.dirs.home())
            .finish_non_exhaustive()
    }
}

impl LocalExecRunner {
    pub const ID: &'static str = "local:exec";

    pub fn new(dirs: Directories) -> Self {
        let mut healthcheck = Healthcheck::new();
        healthcheck
            .enlist_with_fix(
                "local-outputs-dir",
                dir_exists_checker(dirs.outputs()),
                dir_exists_fixer(dirs.outputs()),
            )
            .enlist_with_fix(
                "local-work-dir",
                dir_exists_checker(dirs.work()),
                dir_exists_fixer(dirs.work()),
            );

        Self {
            id: Selector::from_static("local", "exec"),
            dirs,
            healthcheck,
            children: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of spawned instances of `run_id` still tracked (not yet
    /// reaped or killed).
    pub async fn tracked(&self, run_id: &str) -> usize {
        let mut children = self.children.lock().await;
        reap(&mut children);
        children.get(run_id).map_or(0, Vec::len)
    }

    fn spawn(
        &self,
        input: &RunInput,
        group: &RunGroup,
        cfg: &LocalExecConfig,
        seq: u32,
    ) -> Result<Child, RunError> {
        let outputs = self
            .dirs
            .outputs()
            .join(&input.run_id)
            .join(&group.id)
            .join(seq.to_string());
        std::fs::create_dir_all(&outputs).map_err(|e| {
            RunError::Failed(anyhow::anyhow!("creating outputs dir {}: {e}", outputs.display()))
        })?;

        let mut cmd = Command::new(&group.artifact);
        cmd.args(&cfg.args)
            .envs(&cfg.env)
            .envs(instance_env(input, group))
            .env("TEST_OUTPUTS_PATH", &outputs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn()
            .map_err(|e| RunError::Failed(anyhow::anyhow!("{}: {e}", group.artifact)))
    }
}

/// `TEST_*` environment shared by every instance of `group`.
pub fn instance_env(input: &RunInput, group: &RunGroup) -> Vec<(&'static str, String)> {
    vec![
        ("TEST_PLAN", input.plan.clone()),
        ("TEST_CASE", input.case.clone()),
        ("TEST_RUN", input.run_id.clone()),
        ("TEST_GROUP_ID", group.id.clone()),
        ("TEST_GROUP_INSTANCE_COUNT", group.instances.to_string()),
        ("TEST_INSTANCE_COUNT", input.total_instances.to_string()),
        ("TEST_INSTANCE_PARAMS", encode_params(&group.parameters)),
    ]
}

/// `k=v|k=v`, keys sorted.
pub fn encode_params(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("|")
}

/// Drop children that already exited, and runs with nothing left.
fn reap(children: &mut BTreeMap<String, Vec<(String, Child)>>) {
    children.retain(|_, run| {
        run.retain_mut(|(_, child)| matches!(child.try_wait(), Ok(None)));
        !run.is_empty()
    });
}

#[async_trait]
impl Runner for LocalExecRunner {
    fn id(&self) -> &Selector {
        &self.id
    }

    fn compatible_builders(&self) -> Vec<String> {
        vec!["exec".to_string()]
    }

    fn check_config(&self, config: &Value) -> Result<(), ConfigError> {
        decode_config::<LocalExecConfig>(&self.id, config).map(|_| ())
    }

    async fn run(
        &self,
        ctx: &RunContext,
        input: RunInput,
        sink: &dyn InstanceSink,
    ) -> Result<RunOutput, RunError> {
        if input.groups.is_empty() {
            return Err(RunError::InvalidInput("no groups to run".to_string()));
        }

        let mut configs = Vec::with_capacity(input.groups.len());
        for group in &input.groups {
            if group.artifact.is_empty() {
                return Err(RunError::InvalidInput(format!("group {} has no artifact", group.id)));
            }
            let cfg: LocalExecConfig = decode_config(&self.id, &group.run_config)
                .map_err(|e| RunError::InvalidInput(e.to_string()))?;
            configs.push(cfg);
        }

        let mut out = RunOutput {
            run_id: input.run_id.clone(),
            ..Default::default()
        };
        let mut children = self.children.lock().await;
        reap(&mut children);

        for (group, cfg) in input.groups.iter().zip(&configs) {
            for seq in 0..group.instances {
                if ctx.is_cancelled() {
                    info!(started = out.started, "run canceled while spawning instances");
                    return Err(RunError::Canceled);
                }

                let id = format!("{}[{:03}]", group.id, seq);
                let mut child = match self.spawn(&input, group, cfg, seq) {
                    Ok(child) => child,
                    Err(e) => {
                        warn!(instance = %id, error = %e, "instance failed to start");
                        sink.fail_start(&id, &e.to_string());
                        out.failed_to_start += 1;
                        continue;
                    }
                };

                let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
                    sink.fail_start(&id, "stdout/stderr not captured");
                    out.failed_to_start += 1;
                    continue;
                };
                debug!(instance = %id, pid = ?child.id(), artifact = %group.artifact, "instance started");

                sink.manage(InstanceOutput {
                    id: id.clone(),
                    group_id: group.id.clone(),
                    stdout: Box::pin(stdout),
                    stderr: Box::pin(stderr),
                });
                children
                    .entry(input.run_id.clone())
                    .or_default()
                    .push((id, child));
                out.started += 1;
            }
        }

        info!(
            run_id = %input.run_id,
            started = out.started,
            failed_to_start = out.failed_to_start,
            "local instances scheduled"
        );
        Ok(out)
    }

    fn healthchecker(&self) -> Option<&dyn Healthchecker> {
        Some(&self.healthcheck)
    }

    /// Kill the instances of `ctx`'s run. Other runs sharing this runner
    /// are left alone.
    async fn terminate_all(&self, ctx: &RunContext) -> Result<(), RunError> {
        let Some(mut run) = self.children.lock().await.remove(&ctx.run_id) else {
            debug!(run_id = %ctx.run_id, "no local instances to terminate");
            return Ok(());
        };
        let mut killed = 0usize;
        for (id, child) in run.iter_mut() {
            if let Err(e) = child.kill().await {
                warn!(instance = %id, error = %e, "failed to kill instance");
            } else {
                killed += 1;
            }
        }
        info!(run_id = %ctx.run_id, killed, "terminated local instances");
        Ok(())
    }
}
