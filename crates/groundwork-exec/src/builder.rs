//! `exec:bin` builder: the plan ships a ready-to-run executable.
//!
//! Building resolves the executable inside the plan source and checks that it
//! can be run. Nothing is compiled.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use groundwork_api::{
    BuildError, BuildInput, BuildOutput, Builder, ConfigError, RunContext, Selector,
};
use groundwork_core::decode_config;

/// Builder configuration, coalesced from `.env.toml`, the composition and the
/// group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecBinConfig {
    /// Executable path, relative to the plan source. Defaults to the plan
    /// name.
    #[serde(default)]
    pub binary: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecBinBuilder {
    id: Selector,
}

impl ExecBinBuilder {
    pub const ID: &'static str = "exec:bin";

    pub fn new() -> Self {
        Self {
            id: Selector::from_static("exec", "bin"),
        }
    }
}

impl Default for ExecBinBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve(input: &BuildInput, cfg: &ExecBinConfig) -> PathBuf {
    let name = cfg.binary.as_deref().unwrap_or(&input.plan);
    input.plan_source.join(name)
}

async fn check_executable(path: &Path) -> anyhow::Result<()> {
    let md = tokio::fs::metadata(path)
        .await
        .map_err(|e| anyhow::anyhow!("artifact {}: {e}", path.display()))?;
    if !md.is_file() {
        anyhow::bail!("artifact {} is not a regular file", path.display());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if md.permissions().mode() & 0o111 == 0 {
            anyhow::bail!("artifact {} is not executable", path.display());
        }
    }
    Ok(())
}

#[async_trait]
impl Builder for ExecBinBuilder {
    fn id(&self) -> &Selector {
        &self.id
    }

    fn check_config(&self, config: &Value) -> Result<(), ConfigError> {
        decode_config::<ExecBinConfig>(&self.id, config).map(|_| ())
    }

    async fn build(&self, ctx: &RunContext, input: BuildInput) -> Result<BuildOutput, BuildError> {
        if ctx.is_cancelled() {
            return Err(BuildError::Canceled);
        }
        if !input.dependencies.is_empty() {
            return Err(BuildError::Failed(anyhow::anyhow!(
                "{} cannot override dependencies: {:?}",
                self.id,
                input.dependencies.keys().collect::<Vec<_>>()
            )));
        }

        let cfg: ExecBinConfig = input
            .config(&self.id)
            .map_err(|e| BuildError::Failed(e.into()))?;
        let path = resolve(&input, &cfg);
        debug!(build_id = %input.build_id, path = %path.display(), "resolving executable");

        check_executable(&path).await.map_err(BuildError::Failed)?;
        let artifact = tokio::fs::canonicalize(&path).await.unwrap_or(path);

        info!(
            build_id = %input.build_id,
            groups = ?input.group_ids,
            artifact = %artifact.display(),
            "executable resolved"
        );
        Ok(BuildOutput {
            artifact: artifact.to_string_lossy().into_owned(),
            dependencies: Default::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn input(plan_source: &Path, config: Value) -> BuildInput {
        BuildInput {
            build_id: "b1".into(),
            plan: "ping".into(),
            plan_source: plan_source.to_path_buf(),
            group_ids: vec!["peers".into()],
            selectors: vec![],
            dependencies: BTreeMap::new(),
            build_config: config,
            fingerprint: "0".repeat(64),
        }
    }

    #[test]
    fn test_check_config_rejects_unknown_keys() {
        let b = ExecBinBuilder::new();
        assert!(b.check_config(&json!({})).is_ok());
        assert!(b.check_config(&json!({"binary": "bin/run"})).is_ok());
        let err = b.check_config(&json!({"go_version": "1.14"})).unwrap_err();
        assert!(err.to_string().contains("exec:bin"));
    }

    #[test]
    fn test_resolve_defaults_to_plan_name() {
        let dir = Path::new("/plans/ping");
        assert_eq!(resolve(&input(dir, json!({})), &ExecBinConfig::default()), dir.join("ping"));

        let cfg = ExecBinConfig {
            binary: Some("/usr/local/bin/ping-test".into()),
        };
        assert_eq!(resolve(&input(dir, json!({})), &cfg), PathBuf::from("/usr/local/bin/ping-test"));
    }

    #[tokio::test]
    async fn test_missing_executable_fails_build() {
        let tmp = tempfile::tempdir().unwrap();
        let b = ExecBinBuilder::new();
        let err = b
            .build(&RunContext::new("r"), input(tmp.path(), json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Failed(_)));
    }

    #[tokio::test]
    async fn test_dependency_overrides_are_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let mut i = input(tmp.path(), json!({}));
        i.dependencies.insert("github.com/libp2p/go-libp2p".into(), "v0.11.0".into());

        let err = ExecBinBuilder::new().build(&RunContext::new("r"), i).await.unwrap_err();
        assert!(err.to_string().contains("go-libp2p"));
    }
}
