//! In-memory builder and runner fakes (testing only)
//!
//! `FakeBuilder` counts builds and can be told to fail or reject config;
//! `FakeRunner` replays scripted stdout/stderr per instance without spawning
//! any process.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, DuplexStream};

use groundwork_api::{
    BuildError, BuildInput, BuildOutput, Builder, ConfigError, Envelope, Event, Healthchecker,
    InstanceOutput, InstanceSink, InstanceStream, RunContext, RunError, RunInput, RunOutput,
    Runner, Selector,
};

use crate::healthcheck::Healthcheck;

fn selector(s: &str) -> Selector {
    s.parse().expect("fake selector must be well-formed")
}

fn rejects(key: &Option<String>, config: &Value, component: &Selector) -> Result<(), ConfigError> {
    match key {
        Some(k) if config.get(k).is_some() => Err(ConfigError::Decode {
            component: component.to_string(),
            message: format!("unknown field `{k}`"),
        }),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// FakeBuilder
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FakeBuilder {
    id: Selector,
    selectors: Vec<&'static str>,
    builds: AtomicUsize,
    fail_with: Option<String>,
    reject_key: Option<String>,
    delay: Option<Duration>,
    inputs: Mutex<Vec<BuildInput>>,
}

impl FakeBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: selector(id),
            selectors: Vec::new(),
            builds: AtomicUsize::new(0),
            fail_with: None,
            reject_key: None,
            delay: None,
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_selectors(mut self, selectors: &[&'static str]) -> Self {
        self.selectors = selectors.to_vec();
        self
    }

    /// Every build fails with `message`.
    pub fn failing(mut self, message: &str) -> Self {
        self.fail_with = Some(message.to_string());
        self
    }

    /// `check_config` rejects any config containing `key`.
    pub fn rejecting_key(mut self, key: &str) -> Self {
        self.reject_key = Some(key.to_string());
        self
    }

    /// Every build takes `delay`, unless cancelled first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times `build` was invoked.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<BuildInput> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Builder for FakeBuilder {
    fn id(&self) -> &Selector {
        &self.id
    }

    fn supported_selectors(&self) -> &[&str] {
        &self.selectors
    }

    fn check_config(&self, config: &Value) -> Result<(), ConfigError> {
        rejects(&self.reject_key, config, &self.id)
    }

    async fn build(&self, ctx: &RunContext, input: BuildInput) -> Result<BuildOutput, BuildError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(input.clone());

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = ctx.cancelled() => return Err(BuildError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if let Some(msg) = &self.fail_with {
            return Err(BuildError::Failed(anyhow::anyhow!("{msg}")));
        }

        Ok(BuildOutput {
            artifact: format!("fake://{}/{}", input.plan, &input.fingerprint[..12.min(input.fingerprint.len())]),
            dependencies: input.dependencies,
        })
    }
}

// ---------------------------------------------------------------------------
// FakeRunner
// ---------------------------------------------------------------------------

/// What one fake instance prints.
#[derive(Debug, Clone, Default)]
pub struct InstanceScript {
    pub stdout: String,
    pub stderr: String,
    /// Report the instance as failed to start with this reason.
    pub fail_start: Option<String>,
    /// Keep stdout open after the script until `terminate_all`.
    pub hang: bool,
}

impl InstanceScript {
    pub fn events(events: &[Event]) -> Self {
        Self {
            stdout: events
                .iter()
                .map(|e| Envelope::new(e.clone()).to_line() + "\n")
                .collect(),
            ..Self::default()
        }
    }

    pub fn ok() -> Self {
        Self::events(&[Event::start(), Event::ok()])
    }

    pub fn failed(error: &str) -> Self {
        Self::events(&[Event::start(), Event::failed(error)])
    }

    pub fn crashed(error: &str) -> Self {
        Self::events(&[Event::start(), Event::crashed(error, "goroutine 1 [running]")])
    }

    /// Starts but never finishes.
    pub fn silent() -> Self {
        Self::events(&[Event::start()])
    }

    pub fn fail_to_start(reason: &str) -> Self {
        Self {
            fail_start: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::events(&[Event::start()])
        }
    }

    pub fn with_stderr(mut self, stderr: &str) -> Self {
        self.stderr = stderr.to_string();
        self
    }
}

#[derive(Debug)]
pub struct FakeRunner {
    id: Selector,
    compatible: Vec<String>,
    scripts: Vec<InstanceScript>,
    default_script: InstanceScript,
    run_error: Option<String>,
    reject_key: Option<String>,
    healthcheck: Option<Healthcheck>,
    runs: AtomicUsize,
    terminations: AtomicUsize,
    inputs: Mutex<Vec<RunInput>>,
    open_streams: Mutex<Vec<DuplexStream>>,
}

impl FakeRunner {
    pub fn new(id: &str, compatible: &[&str]) -> Self {
        Self {
            id: selector(id),
            compatible: compatible.iter().map(|s| s.to_string()).collect(),
            scripts: Vec::new(),
            default_script: InstanceScript::ok(),
            run_error: None,
            reject_key: None,
            healthcheck: None,
            runs: AtomicUsize::new(0),
            terminations: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
            open_streams: Mutex::new(Vec::new()),
        }
    }

    /// Scripts by global instance index; instances past the end use the
    /// default script (finish/ok).
    pub fn with_scripts(mut self, scripts: Vec<InstanceScript>) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn with_default_script(mut self, script: InstanceScript) -> Self {
        self.default_script = script;
        self
    }

    pub fn with_healthcheck(mut self, hc: Healthcheck) -> Self {
        self.healthcheck = Some(hc);
        self
    }

    /// `run` fails outright with `message` after starting the instances.
    pub fn failing(mut self, message: &str) -> Self {
        self.run_error = Some(message.to_string());
        self
    }

    pub fn rejecting_key(mut self, key: &str) -> Self {
        self.reject_key = Some(key.to_string());
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<RunInput> {
        self.inputs.lock().unwrap().clone()
    }

    async fn stream(&self, text: &str, hang: bool) -> InstanceStream {
        if !hang {
            return Box::pin(std::io::Cursor::new(text.as_bytes().to_vec()));
        }
        let (mut writer, reader) = tokio::io::duplex(text.len() + 64);
        writer.write_all(text.as_bytes()).await.ok();
        self.open_streams.lock().unwrap().push(writer);
        Box::pin(reader)
    }
}

#[async_trait]
impl Runner for FakeRunner {
    fn id(&self) -> &Selector {
        &self.id
    }

    fn compatible_builders(&self) -> Vec<String> {
        self.compatible.clone()
    }

    fn check_config(&self, config: &Value) -> Result<(), ConfigError> {
        rejects(&self.reject_key, config, &self.id)
    }

    async fn run(
        &self,
        _ctx: &RunContext,
        input: RunInput,
        sink: &dyn InstanceSink,
    ) -> Result<RunOutput, RunError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(input.clone());

        let mut out = RunOutput {
            run_id: input.run_id.clone(),
            ..Default::default()
        };
        let mut idx = 0usize;
        for group in &input.groups {
            for i in 0..group.instances {
                let id = format!("{}[{:03}]", group.id, i);
                let script = self.scripts.get(idx).unwrap_or(&self.default_script);
                idx += 1;

                if let Some(reason) = &script.fail_start {
                    sink.fail_start(&id, reason);
                    out.failed_to_start += 1;
                    continue;
                }
                sink.manage(InstanceOutput {
                    id,
                    group_id: group.id.clone(),
                    stdout: self.stream(&script.stdout, script.hang).await,
                    stderr: self.stream(&script.stderr, false).await,
                });
                out.started += 1;
            }
        }

        if let Some(msg) = &self.run_error {
            return Err(RunError::Failed(anyhow::anyhow!("{msg}")));
        }
        Ok(out)
    }

    fn healthchecker(&self) -> Option<&dyn Healthchecker> {
        self.healthcheck.as_ref().map(|h| h as &dyn Healthchecker)
    }

    async fn terminate_all(&self, _ctx: &RunContext) -> Result<(), RunError> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.open_streams.lock().unwrap().clear();
        Ok(())
    }
}

/// Instance counts by group id, handy for asserting on [`RunInput`]s.
pub fn group_sizes(input: &RunInput) -> BTreeMap<String, u32> {
    input
        .groups
        .iter()
        .map(|g| (g.id.clone(), g.instances))
        .collect()
}
