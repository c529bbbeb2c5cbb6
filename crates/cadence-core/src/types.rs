use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Declared recurrence of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Frequency {
    /// Every hour.
    Hourly,
    /// Every 24 hours.
    Daily,
    /// Every 7 days.
    Weekly,
    /// Every 30 days.
    Monthly,
    /// Never scheduled automatically; only run when asked.
    #[default]
    #[serde(alias = "on_demand", alias = "ondemand")]
    OnDemand,
}

impl Frequency {
    /// Interval between two scheduled runs, or `None` for on-demand tasks.
    pub fn interval(self) -> Option<Duration> {
        match self {
            Frequency::Hourly => Some(Duration::hours(1)),
            Frequency::Daily => Some(Duration::days(1)),
            Frequency::Weekly => Some(Duration::days(7)),
            Frequency::Monthly => Some(Duration::days(30)),
            Frequency::OnDemand => None,
        }
    }

    /// Whether the scheduler should ever trigger this task on its own.
    pub fn is_scheduled(self) -> bool {
        self.interval().is_some()
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frequency::Hourly => write!(f, "hourly"),
            Frequency::Daily => write!(f, "daily"),
            Frequency::Weekly => write!(f, "weekly"),
            Frequency::Monthly => write!(f, "monthly"),
            Frequency::OnDemand => write!(f, "on-demand"),
        }
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(Frequency::Hourly),
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            "on-demand" | "on_demand" | "ondemand" => Ok(Frequency::OnDemand),
            other => Err(format!("unknown frequency '{other}'")),
        }
    }
}

/// One runnable task, as declared in the `[[tasks]]` section of the config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Unique, stable key. Names the task's output area, logs, and schedule entry.
    pub id: String,
    /// Program to start. Opaque to everything but the execution sandbox.
    pub executable: String,
    /// Arguments passed to the executable, no shell expansion.
    #[serde(default)]
    pub args: Vec<String>,
    /// Disabled tasks are listed but never executed.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// How often the scheduler runs the task.
    #[serde(default)]
    pub frequency: Frequency,
    /// Overrides the orchestrator's default timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Free text shown by `cadence list`.
    #[serde(default)]
    pub description: Option<String>,
    /// Passed through to the executable untouched.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

impl TaskDescriptor {
    /// An enabled, on-demand task with no arguments or parameters.
    pub fn new(id: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            executable: executable.into(),
            args: Vec::new(),
            enabled: true,
            frequency: Frequency::OnDemand,
            timeout_secs: None,
            description: None,
            parameters: BTreeMap::new(),
        }
    }

    /// Replace the argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the scheduling frequency.
    pub fn with_frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = frequency;
        self
    }

    /// Enable or disable the task.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Override the default timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Add one task parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// Terminal status of one task invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The process exited with code 0.
    Succeeded,
    /// Non-zero exit, killed by a signal, or could not be started.
    Failed,
    /// Killed after exceeding its timeout.
    TimedOut,
    /// Never started (disabled, already running, or fail-fast).
    Skipped,
}

impl RunStatus {
    /// `Failed` and `TimedOut` count as failures; `Skipped` does not.
    pub fn is_failure(self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::TimedOut)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::TimedOut => write!(f, "timed_out"),
            RunStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Outcome of one task execution. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Task this record belongs to.
    pub task_id: String,
    /// When the invocation began.
    pub started_at: DateTime<Utc>,
    /// When the invocation ended. Equal to `started_at` for skipped runs.
    pub finished_at: DateTime<Utc>,
    /// How the invocation ended.
    pub status: RunStatus,
    /// Process exit code when the process ran to completion.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Free-form diagnostic text (tail of output on failure, skip reason, ...).
    pub exit_detail: String,
    /// Location of the captured combined output, when any was produced.
    #[serde(default)]
    pub output_ref: Option<PathBuf>,
}

impl RunRecord {
    /// A record for an invocation that was never started.
    pub fn skipped(task_id: impl Into<String>, detail: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            started_at: now,
            finished_at: now,
            status: RunStatus::Skipped,
            exit_code: None,
            exit_detail: detail.into(),
            output_ref: None,
        }
    }

    /// A failed record spanning `[started_at, now]`.
    pub fn failed(
        task_id: impl Into<String>,
        started_at: DateTime<Utc>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            started_at,
            finished_at: Utc::now(),
            status: RunStatus::Failed,
            exit_code: None,
            exit_detail: detail.into(),
            output_ref: None,
        }
    }

    /// Wall-clock duration in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Concurrency policy for a batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPolicy {
    /// All tasks at once, bounded by the orchestrator's concurrency limit.
    #[default]
    Parallel,
    /// One task at a time, in declaration order.
    Sequential,
}

impl std::fmt::Display for RunPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunPolicy::Parallel => write!(f, "parallel"),
            RunPolicy::Sequential => write!(f, "sequential"),
        }
    }
}

impl FromStr for RunPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parallel" => Ok(RunPolicy::Parallel),
            "sequential" => Ok(RunPolicy::Sequential),
            other => Err(format!("unknown run policy '{other}' (expected parallel or sequential)")),
        }
    }
}

/// Overall status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    /// The batch ran to the end; `failures` says how many tasks failed.
    Completed,
    /// Fail-fast was requested and at least one task failed.
    Failed,
}

/// Aggregated outcome of a batch, one record per requested task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique id of this batch.
    pub run_id: Uuid,
    /// Policy the batch ran under.
    pub policy: RunPolicy,
    /// When the batch began.
    pub started_at: DateTime<Utc>,
    /// When the last record was produced.
    pub finished_at: DateTime<Utc>,
    /// Overall outcome.
    pub status: ReportStatus,
    /// Records that are `failed` or `timed_out`.
    pub failures: usize,
    /// One record per requested task, in request order.
    pub records: Vec<RunRecord>,
}

impl RunReport {
    /// Build a report, deriving `failures` and `status` from the records.
    pub fn from_records(
        policy: RunPolicy,
        fail_fast: bool,
        started_at: DateTime<Utc>,
        records: Vec<RunRecord>,
    ) -> Self {
        let failures = records.iter().filter(|r| r.status.is_failure()).count();
        let status = if fail_fast && failures > 0 {
            ReportStatus::Failed
        } else {
            ReportStatus::Completed
        };
        Self {
            run_id: Uuid::new_v4(),
            policy,
            started_at,
            finished_at: Utc::now(),
            status,
            failures,
            records,
        }
    }

    /// Number of records with the given status.
    pub fn count(&self, status: RunStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    /// Whether any task failed or timed out.
    pub fn has_failures(&self) -> bool {
        self.failures > 0
    }

    /// Whether the batch contained no tasks.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// One-line human summary, used in sync commit messages.
    pub fn summary(&self) -> String {
        format!(
            "{} run of {} task(s): {} succeeded, {} failed, {} timed out, {} skipped",
            self.policy,
            self.records.len(),
            self.count(RunStatus::Succeeded),
            self.count(RunStatus::Failed),
            self.count(RunStatus::TimedOut),
            self.count(RunStatus::Skipped),
        )
    }
}

/// Scheduler bookkeeping for one task. Only the scheduler mutates these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Task this entry schedules.
    pub task_id: String,
    /// The task runs on the first tick at or after this instant.
    pub next_due_at: DateTime<Utc>,
    /// Completion time of the last scheduled run.
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    /// Fresh entry for a never-run task: due one interval after `now`.
    /// Returns `None` for on-demand tasks.
    pub fn new(task_id: impl Into<String>, frequency: Frequency, now: DateTime<Utc>) -> Option<Self> {
        let interval = frequency.interval()?;
        Some(Self {
            task_id: task_id.into(),
            next_due_at: now + interval,
            last_run_at: None,
        })
    }

    /// Whether `now` has reached `next_due_at`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_due_at <= now
    }

    /// Record a completed run (any status) and push `next_due_at` one interval
    /// past its completion time.
    pub fn record_run(&mut self, finished_at: DateTime<Utc>, interval: Duration) {
        self.last_run_at = Some(finished_at);
        self.next_due_at = finished_at + interval;
    }
}

/// Result of one change-sync pipeline invocation.
///
/// `pushed` implies `committed`; `review_request_ref` implies `pushed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Paths reported as changed in the working tree.
    pub changed_files: usize,
    /// A commit was created, or earlier unpublished commits were found.
    pub committed: bool,
    /// The push was accepted by the remote.
    pub pushed: bool,
    /// URL of the review request, when one was opened.
    #[serde(default)]
    pub review_request_ref: Option<String>,
    /// First step failure, if any. `"diverged"` for a rejected push.
    #[serde(default)]
    pub error: Option<String>,
    /// Id of the commit created by this sync.
    #[serde(default)]
    pub commit_id: Option<String>,
    /// Branch the commit landed on.
    #[serde(default)]
    pub branch: Option<String>,
}

impl SyncOutcome {
    /// The deliberate no-op outcome for a clean working tree.
    pub fn no_changes() -> Self {
        Self::default()
    }

    /// Whether the documented invariants between the flags hold.
    pub fn is_consistent(&self) -> bool {
        (!self.pushed || self.committed) && (self.review_request_ref.is_none() || self.pushed)
    }

    /// No step reported an error.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
