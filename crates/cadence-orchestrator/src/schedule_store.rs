use cadence_core::{CadenceError, CadenceResult, ScheduleEntry, TaskDescriptor};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ScheduleFile {
    #[serde(default)]
    entries: Vec<ScheduleEntry>,
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    /// Task ids that gained an entry.
    pub added: Vec<String>,
    /// Task ids whose entry was dropped.
    pub removed: Vec<String>,
}

impl Reconciled {
    /// Nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Persisted per-task schedule, one JSON file on disk.
///
/// Every write goes to a sibling temp file that is then renamed into
/// place, so a crash mid-save leaves either the old or the new state.
pub struct ScheduleStore {
    path: PathBuf,
    entries: BTreeMap<String, ScheduleEntry>,
}

impl ScheduleStore {
    /// Open the store at `path`. A missing file is an empty schedule.
    pub async fn open(path: impl Into<PathBuf>) -> CadenceResult<Self> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(data) => {
                let file: ScheduleFile = serde_json::from_str(&data).map_err(|e| {
                    CadenceError::Config(format!(
                        "Failed to parse schedule state '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
                file.entries
                    .into_iter()
                    .map(|e| (e.task_id.clone(), e))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), entries = entries.len(), "Schedule state loaded");
        Ok(Self { path, entries })
    }

    /// Location of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries, ordered by task id.
    pub fn entries(&self) -> Vec<ScheduleEntry> {
        self.entries.values().cloned().collect()
    }

    /// Entry for one task.
    pub fn get(&self, task_id: &str) -> Option<&ScheduleEntry> {
        self.entries.get(task_id)
    }

    /// Insert or replace an entry keyed by its task id.
    pub fn upsert(&mut self, entry: ScheduleEntry) {
        self.entries.insert(entry.task_id.clone(), entry);
    }

    /// Drop an entry, returning it if present.
    pub fn remove(&mut self, task_id: &str) -> Option<ScheduleEntry> {
        self.entries.remove(task_id)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Align entries with the current registry.
    ///
    /// Enabled scheduled tasks without an entry become due one interval from
    /// `now`. Entries whose task vanished, was disabled, or went on-demand are
    /// dropped. Existing entries keep their `next_due_at`.
    pub fn reconcile(&mut self, tasks: &[TaskDescriptor], now: DateTime<Utc>) -> Reconciled {
        let mut changes = Reconciled::default();

        let wanted: BTreeMap<&str, &TaskDescriptor> = tasks
            .iter()
            .filter(|t| t.enabled && t.frequency.is_scheduled())
            .map(|t| (t.id.as_str(), t))
            .collect();

        self.entries.retain(|id, _| {
            let keep = wanted.contains_key(id.as_str());
            if !keep {
                changes.removed.push(id.clone());
            }
            keep
        });

        for (id, task) in wanted {
            if self.entries.contains_key(id) {
                continue;
            }
            if let Some(entry) = ScheduleEntry::new(id, task.frequency, now) {
                changes.added.push(id.to_string());
                self.entries.insert(id.to_string(), entry);
            }
        }

        if !changes.is_empty() {
            info!(
                added = ?changes.added,
                removed = ?changes.removed,
                "Schedule reconciled with task registry"
            );
        }
        changes
    }

    /// Ids of the entries due at `now`, earliest first.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<&ScheduleEntry> =
            self.entries.values().filter(|e| e.is_due(now)).collect();
        due.sort_by_key(|e| e.next_due_at);
        due.into_iter().map(|e| e.task_id.clone()).collect()
    }

    /// Advance an entry after a run finished. Returns `false` if the entry is gone.
    pub fn record_run(&mut self, task_id: &str, finished_at: DateTime<Utc>, interval: Duration) -> bool {
        match self.entries.get_mut(task_id) {
            Some(entry) => {
                entry.record_run(finished_at, interval);
                true
            }
            None => false,
        }
    }

    /// Write the whole schedule to disk atomically.
    pub async fn save(&self) -> CadenceResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = ScheduleFile {
            entries: self.entries(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), entries = self.entries.len(), "Schedule state saved");
        Ok(())
    }
}
