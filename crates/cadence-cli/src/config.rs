use cadence_core::{CadenceError, CadenceResult};
use cadence_orchestrator::{OrchestratorConfig, SandboxConfig, SchedulerConfig};
use cadence_sync::SyncConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Everything in `cadence.toml` except `[[tasks]]`, which the task store owns.
#[derive(Debug, Clone, Deserialize)]
pub struct CadenceConfig {
    /// Schedule state and run logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// `[orchestrator]` section.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// `[scheduler]` section.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// `[sync]` section.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Directory of the config file; relative paths are anchored here.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".cadence")
}

impl CadenceConfig {
    /// Read, resolve and validate the config at `path`.
    pub fn load(path: &Path) -> CadenceResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CadenceError::Config(format!(
                "Failed to read config '{}': {}",
                path.display(),
                e
            ))
        })?;
        let mut config = Self::parse(&content)?;
        config.resolve_paths(&config_dir(path));
        Ok(config)
    }

    /// Parse and validate TOML text without touching the filesystem.
    pub fn parse(content: &str) -> CadenceResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CadenceError::Config(format!("Failed to parse config: {e}")))?;
        config.orchestrator.validate()?;
        config.scheduler.validate()?;
        config.sync.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        self.data_dir = anchor(base, &self.data_dir);
        self.orchestrator.output_root = anchor(base, &self.orchestrator.output_root);
        self.sync.repo_path = anchor(base, &self.sync.repo_path);
        self.base_dir = base.to_path_buf();

        // Engine state inside the synced tree is never published.
        if let Ok(inside) = self.data_dir.strip_prefix(&self.sync.repo_path) {
            if !inside.as_os_str().is_empty() && !self.sync.exclude.iter().any(|p| p == inside) {
                self.sync.exclude.push(inside.to_path_buf());
            }
        }
    }

    /// Persisted schedule entries.
    pub fn schedule_path(&self) -> PathBuf {
        self.data_dir.join("schedule.json")
    }

    /// Root of the per-task run logs.
    pub fn log_root(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Per-task run lock files, shared by every cadence process on this config.
    pub fn lock_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }

    /// Monitor snapshot written by a running scheduler.
    pub fn status_path(&self) -> PathBuf {
        self.data_dir.join("status.json")
    }

    /// Sandbox settings derived from the resolved paths.
    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig::new(
            &self.base_dir,
            &self.orchestrator.output_root,
            self.log_root(),
        )
    }
}

/// Absolute directory containing the config file.
pub fn config_dir(path: &Path) -> PathBuf {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::path::absolute(&parent).unwrap_or(parent)
}

fn anchor(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
