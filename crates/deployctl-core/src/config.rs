//! Configuration file support (`.deployctl.toml`).
//!
//! Mirrors the upstream `.shipper.toml` loading shape: an optional file
//! discovered in the workspace root, parsed with `toml`/`serde`, merged with
//! CLI-supplied overrides where the CLI always wins.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::{EngineOptions, Project, Server};

/// Top-level configuration loaded from `.deployctl.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployctlConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub projects: Vec<Project>,

    #[serde(default)]
    pub servers: Vec<Server>,

    /// Path to a private key used for all SSH connections unless a server
    /// overrides it (not currently overridable per-server; see DESIGN.md).
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    /// Root directory for cached repository checkouts.
    #[serde(default = "default_repo_cache_dir")]
    pub repo_cache_dir: PathBuf,

    /// Root directory for the filesystem Record Store.
    #[serde(default = "default_record_store_dir")]
    pub record_store_dir: PathBuf,
}

fn default_repo_cache_dir() -> PathBuf {
    PathBuf::from(".deployctl/repos")
}

fn default_record_store_dir() -> PathBuf {
    PathBuf::from(".deployctl/records")
}

impl Default for DeployctlConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            projects: Vec::new(),
            servers: Vec::new(),
            identity_file: None,
            repo_cache_dir: default_repo_cache_dir(),
            record_store_dir: default_record_store_dir(),
        }
    }
}

/// Engine tunables, see [`crate::types::EngineOptions`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_deploy")]
    pub max_deploy: usize,

    #[serde(with = "humantime_serde", default = "default_release_timeout")]
    pub max_release_timeout: Duration,
}

fn default_max_deploy() -> usize {
    5
}

fn default_release_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_deploy: default_max_deploy(),
            max_release_timeout: default_release_timeout(),
        }
    }
}

impl From<EngineConfig> for EngineOptions {
    fn from(cfg: EngineConfig) -> Self {
        EngineOptions {
            max_deploy: cfg.max_deploy,
            max_release_timeout: cfg.max_release_timeout,
        }
    }
}

/// CLI-supplied overrides that always win over the config file.
///
/// `Option` fields mean "the flag was not passed" when `None`.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub max_deploy: Option<usize>,
    pub max_release_timeout: Option<Duration>,
    pub identity_file: Option<PathBuf>,
}

impl DeployctlConfig {
    /// Searches `workspace_root` for `.deployctl.toml`. Returns `Ok(None)`
    /// if absent.
    pub fn load_from_workspace(workspace_root: &Path) -> Result<Option<Self>> {
        let path = workspace_root.join(".deployctl.toml");
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from_file(&path).map(Some)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_deploy == 0 {
            bail!("engine.max_deploy must be greater than 0");
        }
        if self.engine.max_release_timeout.is_zero() {
            bail!("engine.max_release_timeout must be greater than 0");
        }
        let mut ids = std::collections::HashSet::new();
        for project in &self.projects {
            if !ids.insert(project.id) {
                bail!("duplicate project id {}", project.id);
            }
        }
        ids.clear();
        for server in &self.servers {
            if !ids.insert(server.id) {
                bail!("duplicate server id {}", server.id);
            }
        }
        Ok(())
    }

    /// Merges CLI overrides (which always win) into this config's engine
    /// section.
    pub fn engine_options(&self, cli: &CliOverrides) -> EngineOptions {
        EngineOptions {
            max_deploy: cli.max_deploy.unwrap_or(self.engine.max_deploy),
            max_release_timeout: cli
                .max_release_timeout
                .unwrap_or(self.engine.max_release_timeout),
        }
    }

    pub fn identity_file(&self, cli: &CliOverrides) -> Option<PathBuf> {
        cli.identity_file.clone().or_else(|| self.identity_file.clone())
    }

    pub fn project(&self, id: i64) -> Option<&Project> {
        self.projects.iter().find(|p| p.id == id)
    }

    pub fn server(&self, id: i64) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }
}
