use crate::types::TaskDescriptor;
use crate::{CadenceError, CadenceResult};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// The part of the config file the registry cares about. Other sections are ignored.
#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<TaskDescriptor>,
}

/// Registry of known tasks, in declaration order.
///
/// The set is swapped as a whole on [`TaskStore::reload`]: readers see either
/// the old registry or the new one, never a mix, and a failed reload leaves
/// the previous registry in place.
pub struct TaskStore {
    source: Option<PathBuf>,
    tasks: RwLock<Arc<Vec<TaskDescriptor>>>,
}

impl TaskStore {
    /// Load the `[[tasks]]` array from a TOML file.
    pub fn load(path: impl Into<PathBuf>) -> CadenceResult<Self> {
        let path = path.into();
        let tasks = read_tasks(&path)?;
        info!(path = %path.display(), count = tasks.len(), "Task registry loaded");
        Ok(Self {
            source: Some(path),
            tasks: RwLock::new(Arc::new(tasks)),
        })
    }

    /// Build a registry from descriptors that have no backing file.
    pub fn from_tasks(tasks: Vec<TaskDescriptor>) -> CadenceResult<Self> {
        validate(&tasks)?;
        Ok(Self {
            source: None,
            tasks: RwLock::new(Arc::new(tasks)),
        })
    }

    /// Parse and validate task descriptors from TOML text.
    pub fn parse(content: &str) -> CadenceResult<Vec<TaskDescriptor>> {
        let file: TaskFile = toml::from_str(content)
            .map_err(|e| CadenceError::Config(format!("Failed to parse task registry: {e}")))?;
        validate(&file.tasks)?;
        Ok(file.tasks)
    }

    /// Re-read the backing file and atomically replace the registry.
    ///
    /// Returns the number of tasks now registered. On error the previous
    /// registry is retained unchanged.
    pub fn reload(&self) -> CadenceResult<usize> {
        let path = self.source.as_deref().ok_or_else(|| {
            CadenceError::Config("Task registry has no backing file to reload".to_string())
        })?;

        match read_tasks(path) {
            Ok(tasks) => {
                let count = tasks.len();
                *self.tasks.write() = Arc::new(tasks);
                info!(path = %path.display(), count, "Task registry reloaded");
                Ok(count)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Task registry reload failed, keeping previous set");
                Err(e)
            }
        }
    }

    /// Look up one task by id.
    pub fn get(&self, id: &str) -> CadenceResult<TaskDescriptor> {
        self.tasks
            .read()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| CadenceError::TaskNotFound(id.to_string()))
    }

    /// All tasks in declaration order.
    pub fn all(&self) -> Vec<TaskDescriptor> {
        self.snapshot().as_ref().clone()
    }

    /// Enabled tasks in declaration order.
    pub fn enabled(&self) -> Vec<TaskDescriptor> {
        self.snapshot().iter().filter(|t| t.enabled).cloned().collect()
    }

    /// Cheap shared view of the current registry.
    pub fn snapshot(&self) -> Arc<Vec<TaskDescriptor>> {
        self.tasks.read().clone()
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    /// No tasks registered.
    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Path of the backing file, if any.
    pub fn source_path(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

fn read_tasks(path: &Path) -> CadenceResult<Vec<TaskDescriptor>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CadenceError::Config(format!(
            "Failed to read task registry '{}': {}",
            path.display(),
            e
        ))
    })?;
    TaskStore::parse(&content)
}

fn validate(tasks: &[TaskDescriptor]) -> CadenceResult<()> {
    let mut seen = HashSet::new();
    for task in tasks {
        if task.id.is_empty() {
            return Err(CadenceError::Config("Task with empty id".to_string()));
        }
        if !task
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            || task.id.starts_with('.')
        {
            return Err(CadenceError::Config(format!(
                "Task id '{}' may only contain letters, digits, '-', '_' and '.'",
                task.id
            )));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(CadenceError::Config(format!(
                "Duplicate task id '{}'",
                task.id
            )));
        }
        if task.executable.trim().is_empty() {
            return Err(CadenceError::Config(format!(
                "Task '{}' has no executable",
                task.id
            )));
        }
        if task.timeout_secs == Some(0) {
            return Err(CadenceError::Config(format!(
                "Task '{}' has a zero timeout",
                task.id
            )));
        }
    }
    Ok(())
}
