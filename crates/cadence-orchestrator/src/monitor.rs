use cadence_core::{CadenceResult, RunRecord, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Whether a task currently has an invocation in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Nothing in flight.
    Idle,
    /// An invocation is executing.
    Running,
}

/// Counters accumulated per task since the process started.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetrics {
    /// Invocations that actually executed.
    pub runs: u32,
    /// Runs that exited with status zero.
    pub succeeded: u32,
    /// Runs that failed, start failures included.
    pub failures: u32,
    /// Runs killed at their timeout.
    pub timeouts: u32,
    /// Requests skipped because the task was disabled or already running.
    pub skipped: u32,
    /// Total wall time of executed runs.
    pub duration_ms: u64,
}

/// Real-time snapshot of one task's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    /// Task id.
    pub task_id: String,
    /// Idle or running.
    pub status: WorkerStatus,
    /// Start of the in-flight run.
    pub running_since: Option<DateTime<Utc>>,
    /// Status of the latest record, skips included.
    pub last_status: Option<RunStatus>,
    /// When the latest record was produced.
    pub last_finished_at: Option<DateTime<Utc>>,
    /// Counters since process start.
    pub metrics: TaskMetrics,
}

impl TaskState {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: WorkerStatus::Idle,
            running_since: None,
            last_status: None,
            last_finished_at: None,
            metrics: TaskMetrics::default(),
        }
    }
}

/// Progress of the most recent batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Members in the batch.
    pub total: usize,
    /// Members with a record so far.
    pub finished: usize,
    /// When the batch began. `None` before the first batch.
    pub started_at: Option<DateTime<Utc>>,
}

impl BatchProgress {
    /// Every member has a record.
    pub fn is_complete(&self) -> bool {
        self.finished >= self.total
    }
}

/// Tracks per-task state and batch progress.
///
/// A long-running process can mirror it to a JSON status file with
/// [`RunMonitor::publish`], which is what `cadence scheduler status` reads.
pub struct RunMonitor {
    states: Arc<RwLock<BTreeMap<String, TaskState>>>,
    batch: Arc<RwLock<BatchProgress>>,
}

impl RunMonitor {
    /// Empty monitor.
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(BTreeMap::new())),
            batch: Arc::new(RwLock::new(BatchProgress::default())),
        }
    }

    /// Reset batch progress for a new batch of `total` tasks.
    pub async fn begin_batch(&self, total: usize) {
        let mut batch = self.batch.write().await;
        *batch = BatchProgress {
            total,
            finished: 0,
            started_at: Some(Utc::now()),
        };
    }

    /// Mark a task as running.
    pub async fn task_started(&self, task_id: &str) {
        let mut states = self.states.write().await;
        let state = states
            .entry(task_id.to_string())
            .or_insert_with(|| TaskState::new(task_id));
        state.status = WorkerStatus::Running;
        state.running_since = Some(Utc::now());
    }

    /// Fold a finished record into the task's state and counters.
    pub async fn task_finished(&self, record: &RunRecord) {
        {
            let mut states = self.states.write().await;
            let state = states
                .entry(record.task_id.clone())
                .or_insert_with(|| TaskState::new(&record.task_id));

            // A skipped duplicate must not clear the state of the run that is still going.
            if record.status != RunStatus::Skipped {
                state.status = WorkerStatus::Idle;
                state.running_since = None;
                state.metrics.runs += 1;
                state.metrics.duration_ms += record.duration_ms().max(0) as u64;
            }
            match record.status {
                RunStatus::Succeeded => state.metrics.succeeded += 1,
                RunStatus::Failed => state.metrics.failures += 1,
                RunStatus::TimedOut => state.metrics.timeouts += 1,
                RunStatus::Skipped => state.metrics.skipped += 1,
            }
            state.last_status = Some(record.status);
            state.last_finished_at = Some(record.finished_at);
        }
    }

    /// Count one more batch member as finished.
    pub async fn batch_advance(&self) {
        let mut batch = self.batch.write().await;
        batch.finished = (batch.finished + 1).min(batch.total);
    }

    /// Progress of the current or latest batch.
    pub async fn progress(&self) -> BatchProgress {
        self.batch.read().await.clone()
    }

    /// Snapshot of all known task states, ordered by task id.
    pub async fn snapshot(&self) -> Vec<TaskState> {
        let states = self.states.read().await;
        states.values().cloned().collect()
    }

    /// State of one task, if it ever ran or was skipped.
    pub async fn get_state(&self, task_id: &str) -> Option<TaskState> {
        let states = self.states.read().await;
        states.get(task_id).cloned()
    }

    /// Sum of all per-task counters.
    pub async fn aggregate_metrics(&self) -> TaskMetrics {
        let states = self.states.read().await;
        let mut total = TaskMetrics::default();
        for state in states.values() {
            total.runs += state.metrics.runs;
            total.succeeded += state.metrics.succeeded;
            total.failures += state.metrics.failures;
            total.timeouts += state.metrics.timeouts;
            total.skipped += state.metrics.skipped;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    /// Current state as JSON: `tasks`, `aggregate`, `batch` and `updated_at`.
    pub async fn to_json(&self) -> serde_json::Value {
        let states = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        let batch = self.progress().await;
        serde_json::json!({
            "tasks": states,
            "aggregate": aggregate,
            "batch": batch,
            "updated_at": Utc::now(),
        })
    }

    /// Write [`RunMonitor::to_json`] to `path` via a temp file and rename.
    pub async fn write_json(&self, path: &Path) -> CadenceResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(&self.to_json().await)?;
        let mut tmp = path.to_path_buf().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Rewrite the status file every `every` until `cancel` fires, then once more.
    pub fn publish(
        self: Arc<Self>,
        path: PathBuf,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.write_json(&path).await {
                            warn!(path = %path.display(), error = %e, "Failed to write status file");
                        }
                    }
                }
            }
            if let Err(e) = self.write_json(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to write final status file");
            }
            debug!(path = %path.display(), "Status publisher stopped");
        })
    }
}

impl Default for RunMonitor {
    fn default() -> Self {
        Self::new()
    }
}
