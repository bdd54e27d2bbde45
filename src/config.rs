//! Runtime configuration for the autodev engine.
//!
//! Values come from three layers, lowest priority first: built-in defaults,
//! the optional `.autodev/config.toml` in the project, and environment
//! variables (`AUTODEV_AGENT_CMD`, `AUTODEV_SKIP_PERMISSIONS`).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Silence window after which a run is presumed hung.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub project_dir: PathBuf,
    /// `<project>/.autodev` — backlog file, backup, config.
    pub state_dir: PathBuf,
    pub agent_cmd: String,
    pub skip_permissions: bool,
    pub concurrency: usize,
    pub idle_timeout: Duration,
    /// Roots the path authorizer accepts. Defaults to the project directory.
    pub allowed_roots: Vec<PathBuf>,
    pub verbose: bool,
}

/// On-disk shape of `.autodev/config.toml`. All fields optional.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    agent_cmd: Option<String>,
    skip_permissions: Option<bool>,
    concurrency: Option<usize>,
    idle_timeout_ms: Option<u64>,
    allowed_roots: Option<Vec<PathBuf>>,
}

impl OrchestratorConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let state_dir = project_dir.join(".autodev");

        let file = Self::read_config_file(&state_dir)?;

        let agent_cmd = std::env::var("AUTODEV_AGENT_CMD")
            .ok()
            .or(file.agent_cmd)
            .unwrap_or_else(|| "claude".to_string());
        let skip_permissions = std::env::var("AUTODEV_SKIP_PERMISSIONS")
            .map(|v| v != "false")
            .ok()
            .or(file.skip_permissions)
            .unwrap_or(true);
        let concurrency = file.concurrency.unwrap_or(1).max(1);
        let idle_timeout = file
            .idle_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT);
        let allowed_roots = file
            .allowed_roots
            .unwrap_or_else(|| vec![project_dir.clone()]);

        Ok(Self {
            project_dir,
            state_dir,
            agent_cmd,
            skip_permissions,
            concurrency,
            idle_timeout,
            allowed_roots,
            verbose: false,
        })
    }

    fn read_config_file(state_dir: &std::path::Path) -> Result<ConfigFile> {
        let path = state_dir.join("config.toml");
        if !path.exists() {
            return Ok(ConfigFile::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Fixed flags for the agent CLI invocation.
    pub fn agent_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        flags
    }
}
