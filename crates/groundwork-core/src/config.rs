//! Environment configuration and layered config coalescing.
//!
//! The environment lives under `$GROUNDWORK_HOME` (default
//! `<config dir>/groundwork`):
//!
//! ```text
//! $GROUNDWORK_HOME/
//!   .env.toml     optional; [builders."<sel>"], [runners."<sel>"], [daemon]
//!   outputs/      instance outputs, one directory per run
//!   work/         scratch space for builders
//!   plans/        test plan sources
//! ```
//!
//! ## Coalescing
//!
//! Builder and runner configuration is assembled from layers, lowest
//! precedence first: the environment table for the component, the
//! composition's global config, the group's config. Later layers win key by key.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use groundwork_api::{ConfigError, ConfigMap, Selector};

use crate::healthcheck::HealthcheckPolicy;

/// Environment variable overriding the home directory.
pub const ENV_HOME: &str = "GROUNDWORK_HOME";

pub const ENV_FILE: &str = ".env.toml";

/// `[daemon]` table: defaults applied to every orchestration in this
/// environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Run the runner healthcheck before every run.
    #[serde(default = "default_true")]
    pub healthcheck_before_run: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            healthcheck_before_run: true,
        }
    }
}

impl DaemonConfig {
    /// Gate policy used when the caller does not pick one.
    pub fn healthcheck_policy(&self) -> HealthcheckPolicy {
        if self.healthcheck_before_run {
            HealthcheckPolicy::default()
        } else {
            HealthcheckPolicy::disabled()
        }
    }
}

/// Well-known directories under the home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directories {
    home: PathBuf,
}

impl Directories {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn outputs(&self) -> PathBuf {
        self.home.join("outputs")
    }

    pub fn work(&self) -> PathBuf {
        self.home.join("work")
    }

    pub fn plans(&self) -> PathBuf {
        self.home.join("plans")
    }

    /// Create the home directory and its subdirectories if missing.
    pub fn ensure(&self) -> Result<(), ConfigError> {
        if self.home.exists() && !self.home.is_dir() {
            return Err(ConfigError::HomeNotDirectory(self.home.clone()));
        }
        for dir in [self.home.clone(), self.outputs(), self.work(), self.plans()] {
            fs::create_dir_all(&dir).map_err(|source| ConfigError::Io { path: dir, source })?;
        }
        Ok(())
    }
}

/// Contents of `.env.toml`, plus the directories it was loaded from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    #[serde(skip, default = "unset_dirs")]
    dirs: Directories,

    /// Per-builder defaults, keyed by selector string.
    #[serde(default)]
    pub builders: BTreeMap<String, ConfigMap>,

    /// Per-runner defaults, keyed by selector string.
    #[serde(default)]
    pub runners: BTreeMap<String, ConfigMap>,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

fn unset_dirs() -> Directories {
    Directories::new(PathBuf::new())
}

impl EnvConfig {
    /// An empty environment rooted at `home`.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            dirs: Directories::new(home),
            builders: BTreeMap::new(),
            runners: BTreeMap::new(),
            daemon: DaemonConfig::default(),
        }
    }

    /// Resolve the home directory: `$GROUNDWORK_HOME`, else
    /// `<config dir>/groundwork`.
    pub fn default_home() -> Result<PathBuf, ConfigError> {
        if let Some(v) = std::env::var_os(ENV_HOME).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(v));
        }
        dirs::config_dir()
            .map(|d| d.join("groundwork"))
            .ok_or(ConfigError::NoHome)
    }

    /// Load from the default home. See [`EnvConfig::load_from`].
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_home()?)
    }

    /// Load `.env.toml` from `home`, creating the directory layout.
    ///
    /// A missing file yields defaults; a malformed one is an error.
    pub fn load_from(home: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let dirs = Directories::new(home);
        dirs.ensure()?;

        let path = dirs.home().join(ENV_FILE);
        let mut cfg = if path.is_file() {
            let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            toml::from_str::<EnvConfig>(&content)
                .map_err(|source| ConfigError::EnvFile { path: path.clone(), source })?
        } else {
            debug!(path = %path.display(), "no env file found; using defaults");
            Self::new(PathBuf::new())
        };

        cfg.dirs = dirs;
        Ok(cfg)
    }

    pub fn dirs(&self) -> &Directories {
        &self.dirs
    }

    /// Environment layer for a builder; empty if none is configured.
    pub fn builder_config(&self, selector: &Selector) -> ConfigMap {
        self.builders
            .get(&selector.to_string())
            .cloned()
            .unwrap_or_default()
    }

    /// Environment layer for a runner; empty if none is configured.
    pub fn runner_config(&self, selector: &Selector) -> ConfigMap {
        self.runners
            .get(&selector.to_string())
            .cloned()
            .unwrap_or_default()
    }
}

/// Merge `layers` into one JSON object; later layers win key by key.
pub fn coalesce<'a>(layers: impl IntoIterator<Item = &'a ConfigMap>) -> Value {
    let mut all = ConfigMap::new();
    for layer in layers {
        for (k, v) in layer {
            all.insert(k.clone(), v.clone());
        }
    }
    Value::Object(all)
}

/// Decode a coalesced config into a component's typed configuration.
pub fn decode_config<T: DeserializeOwned>(component: &Selector, merged: &Value) -> Result<T, ConfigError> {
    serde_json::from_value(merged.clone()).map_err(|e| ConfigError::Decode {
        component: component.to_string(),
        message: e.to_string(),
    })
}
