use crate::lock::TaskLock;
use crate::monitor::RunMonitor;
use crate::sandbox::TaskExecutor;
use cadence_core::{
    CadenceError, CadenceResult, RunPolicy, RunRecord, RunReport, TaskDescriptor, TaskStore,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Orchestrator settings, the `[orchestrator]` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrently executing tasks.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Timeout for tasks that do not set their own.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Root of the per-task output directories.
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    /// Default for `run-all` when the caller does not say.
    #[serde(default)]
    pub fail_fast: bool,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_output_root() -> PathBuf {
    PathBuf::from("data/tasks")
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_timeout_secs: default_timeout_secs(),
            output_root: default_output_root(),
            fail_fast: false,
        }
    }
}

impl OrchestratorConfig {
    /// Reject settings the orchestrator cannot run with.
    pub fn validate(&self) -> CadenceResult<()> {
        if self.max_concurrency == 0 {
            return Err(CadenceError::Config(
                "orchestrator.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.default_timeout_secs == 0 {
            return Err(CadenceError::Config(
                "orchestrator.default_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a batch should be driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Parallel or sequential execution.
    pub policy: RunPolicy,
    /// Sequential: skip the rest after the first failure. Parallel: only the report status changes.
    pub fail_fast: bool,
}

impl RunOptions {
    /// Parallel batch without fail-fast.
    pub fn parallel() -> Self {
        Self {
            policy: RunPolicy::Parallel,
            fail_fast: false,
        }
    }

    /// Sequential batch without fail-fast.
    pub fn sequential() -> Self {
        Self {
            policy: RunPolicy::Sequential,
            fail_fast: false,
        }
    }

    /// Set the fail-fast flag.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

const DISABLED_DETAIL: &str = "task is disabled";
const RUNNING_DETAIL: &str = "task is already running";
const FAIL_FAST_DETAIL: &str = "fail-fast: an earlier task failed";

/// Membership in the running set plus, when configured, the task's file lock.
/// Both are released on drop, including during unwinding.
struct RunGuard {
    task_id: String,
    running: Arc<Mutex<HashSet<String>>>,
    _file_lock: Option<TaskLock>,
}

impl RunGuard {
    fn acquire(
        running: &Arc<Mutex<HashSet<String>>>,
        task_id: &str,
        lock_dir: Option<&Path>,
    ) -> CadenceResult<Self> {
        if !running.lock().insert(task_id.to_string()) {
            return Err(CadenceError::LockConflict(task_id.to_string()));
        }
        let mut guard = Self {
            task_id: task_id.to_string(),
            running: Arc::clone(running),
            _file_lock: None,
        };
        // On error the partially built guard drops and leaves the set again.
        if let Some(dir) = lock_dir {
            guard._file_lock = Some(TaskLock::try_acquire(dir, task_id)?);
        }
        Ok(guard)
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.task_id);
    }
}

/// Drives task executions under a concurrency policy and aggregates their records.
///
/// Guarantees at most one in-flight invocation per task id across every caller
/// sharing this orchestrator (manual runs and the scheduler alike). With a lock
/// directory set via [`Orchestrator::with_lock_dir`] the guarantee extends to
/// every process using that directory. A request for a task that is already
/// running is recorded as `skipped`, never queued.
pub struct Orchestrator {
    store: Arc<TaskStore>,
    executor: Arc<dyn TaskExecutor>,
    config: OrchestratorConfig,
    permits: Arc<Semaphore>,
    running: Arc<Mutex<HashSet<String>>>,
    lock_dir: Option<PathBuf>,
    monitor: Arc<RunMonitor>,
}

impl Orchestrator {
    /// Build an orchestrator over a registry and an executor.
    pub fn new(
        store: Arc<TaskStore>,
        executor: Arc<dyn TaskExecutor>,
        config: OrchestratorConfig,
    ) -> CadenceResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            executor,
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            running: Arc::new(Mutex::new(HashSet::new())),
            lock_dir: None,
            monitor: Arc::new(RunMonitor::new()),
        })
    }

    /// Also take a file lock per run under `dir`, shared with other processes.
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    /// The task registry.
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Active settings.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Get a reference to the monitor.
    pub fn monitor(&self) -> &Arc<RunMonitor> {
        &self.monitor
    }

    /// Whether an invocation of `task_id` is currently in flight in this process.
    pub fn is_running(&self, task_id: &str) -> bool {
        self.running.lock().contains(task_id)
    }

    /// Effective timeout for a task.
    pub fn timeout_for(&self, task: &TaskDescriptor) -> Duration {
        Duration::from_secs(task.timeout_secs.unwrap_or(self.config.default_timeout_secs))
    }

    /// Run every task in `tasks` and return one record per task, in the given order.
    ///
    /// Never fails: per-task problems are reported inside the records.
    pub async fn run_all(&self, tasks: &[TaskDescriptor], options: RunOptions) -> RunReport {
        let started_at = Utc::now();
        info!(
            policy = %options.policy,
            fail_fast = options.fail_fast,
            task_count = tasks.len(),
            "Orchestrator: starting batch"
        );
        self.monitor.begin_batch(tasks.len()).await;

        let records = match options.policy {
            RunPolicy::Parallel => {
                let runs = tasks.iter().map(|task| self.run_tracked(task));
                futures_util::future::join_all(runs).await
            }
            RunPolicy::Sequential => {
                let mut records = Vec::with_capacity(tasks.len());
                let mut failed = false;
                for task in tasks {
                    let record = if failed && options.fail_fast {
                        let record = RunRecord::skipped(&task.id, FAIL_FAST_DETAIL);
                        self.monitor.task_finished(&record).await;
                        self.monitor.batch_advance().await;
                        record
                    } else {
                        self.run_tracked(task).await
                    };
                    failed |= record.status.is_failure();
                    records.push(record);
                }
                records
            }
        };

        let report = RunReport::from_records(options.policy, options.fail_fast, started_at, records);
        info!(
            run_id = %report.run_id,
            status = ?report.status,
            failures = report.failures,
            duration_ms = (report.finished_at - report.started_at).num_milliseconds(),
            "Orchestrator: batch complete"
        );
        report
    }

    /// Run every registered task (disabled ones come back as skipped).
    pub async fn run_registered(&self, options: RunOptions) -> RunReport {
        let tasks = self.store.snapshot();
        self.run_all(&tasks, options).await
    }

    /// Run a single registered task.
    ///
    /// Fails only when `task_id` is unknown. A disabled task, or one that is
    /// already running, yields a `skipped` record.
    pub async fn run_one(&self, task_id: &str) -> CadenceResult<RunRecord> {
        let task = self.store.get(task_id)?;
        Ok(self.run_task(&task).await)
    }

    /// Run one descriptor directly, bypassing the registry lookup.
    pub async fn run_task(&self, task: &TaskDescriptor) -> RunRecord {
        let record = self.invoke(task).await;
        self.monitor.task_finished(&record).await;
        record
    }

    async fn run_tracked(&self, task: &TaskDescriptor) -> RunRecord {
        let record = self.run_task(task).await;
        self.monitor.batch_advance().await;
        record
    }

    async fn invoke(&self, task: &TaskDescriptor) -> RunRecord {
        if !task.enabled {
            info!(task_id = %task.id, "Skipping disabled task");
            return RunRecord::skipped(&task.id, DISABLED_DETAIL);
        }

        // Claim the id before waiting for a permit so a duplicate is skipped, not queued.
        let guard = match RunGuard::acquire(&self.running, &task.id, self.lock_dir.as_deref()) {
            Ok(guard) => guard,
            Err(CadenceError::LockConflict(_)) => {
                warn!(task_id = %task.id, "Skipping overlapping run");
                return RunRecord::skipped(&task.id, RUNNING_DETAIL);
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Cannot take run lock");
                return RunRecord::failed(
                    &task.id,
                    Utc::now(),
                    format!("failed to start: cannot take run lock: {e}"),
                );
            }
        };

        let started_at = Utc::now();
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                return RunRecord::failed(&task.id, started_at, format!("failed to start: {e}"));
            }
        };

        self.monitor.task_started(&task.id).await;
        let timeout = self.timeout_for(task);
        let executor = Arc::clone(&self.executor);
        let owned = task.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _permit = permit;
            executor.execute(&owned, timeout).await
        });

        match handle.await {
            Ok(record) => record,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Task invocation aborted");
                let detail = if e.is_panic() {
                    "task invocation panicked".to_string()
                } else {
                    format!("task invocation aborted: {e}")
                };
                RunRecord::failed(&task.id, started_at, detail)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadence_core::{Frequency, ReportStatus, RunStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Executor that sleeps, then succeeds unless the task id starts with `fail`.
    struct MockExecutor {
        delay: Duration,
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MockExecutor {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl TaskExecutor for MockExecutor {
        async fn execute(&self, task: &TaskDescriptor, _timeout: Duration) -> RunRecord {
            let started_at = Utc::now();
            self.calls.lock().push(task.id.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            if task.id.starts_with("panic") {
                panic!("executor blew up");
            }
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if task.id.starts_with("fail") {
                RunRecord::failed(&task.id, started_at, "exited with code 1")
            } else {
                RunRecord {
                    task_id: task.id.clone(),
                    started_at,
                    finished_at: Utc::now(),
                    status: RunStatus::Succeeded,
                    exit_code: Some(0),
                    exit_detail: "exited with code 0".into(),
                    output_ref: None,
                }
            }
        }
    }

    fn orchestrator(
        tasks: Vec<TaskDescriptor>,
        executor: Arc<MockExecutor>,
        max_concurrency: usize,
    ) -> Orchestrator {
        let store = Arc::new(TaskStore::from_tasks(tasks).unwrap());
        let config = OrchestratorConfig {
            max_concurrency,
            ..Default::default()
        };
        Orchestrator::new(store, executor, config).unwrap()
    }

    fn task(id: &str) -> TaskDescriptor {
        TaskDescriptor::new(id, "bin/true")
    }

    #[test]
    fn test_config_validation() {
        assert!(OrchestratorConfig::default().validate().is_ok());
        let zero = OrchestratorConfig {
            max_concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(zero.validate(), Err(CadenceError::Config(_))));
    }

    #[tokio::test]
    async fn test_sequential_preserves_declaration_order() {
        let exec = MockExecutor::new(Duration::from_millis(5));
        let tasks = vec![task("c"), task("fail-a"), task("b")];
        let orch = orchestrator(tasks.clone(), exec.clone(), 4);

        let report = orch.run_all(&tasks, RunOptions::sequential()).await;
        let ids: Vec<&str> = report.records.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "fail-a", "b"]);
        assert_eq!(exec.calls(), vec!["c", "fail-a", "b"]);
        assert_eq!(exec.peak.load(Ordering::SeqCst), 1);
        assert_eq!(report.status, ReportStatus::Completed);
        assert_eq!(report.failures, 1);
    }

    #[tokio::test]
    async fn test_sequential_fail_fast_skips_the_rest() {
        let exec = MockExecutor::new(Duration::from_millis(1));
        let tasks = vec![task("a"), task("fail-b"), task("c")];
        let orch = orchestrator(tasks.clone(), exec.clone(), 4);

        let report = orch
            .run_all(&tasks, RunOptions::sequential().with_fail_fast(true))
            .await;
        assert_eq!(report.records.len(), 3);
        assert_eq!(report.records[2].status, RunStatus::Skipped);
        assert!(report.records[2].exit_detail.contains("fail-fast"));
        assert_eq!(report.status, ReportStatus::Failed);
        assert_eq!(exec.calls(), vec!["a", "fail-b"]);
    }

    #[tokio::test]
    async fn test_parallel_respects_concurrency_bound() {
        let exec = MockExecutor::new(Duration::from_millis(50));
        let tasks: Vec<_> = (0..6).map(|i| task(&format!("t{i}"))).collect();
        let orch = orchestrator(tasks.clone(), exec.clone(), 2);

        let report = orch.run_all(&tasks, RunOptions::parallel()).await;
        assert_eq!(report.records.len(), 6);
        assert!(report.records.iter().all(|r| r.status == RunStatus::Succeeded));
        assert!(exec.peak.load(Ordering::SeqCst) <= 2);
        assert!(orch.monitor().progress().await.is_complete());
    }

    #[tokio::test]
    async fn test_parallel_fail_fast_does_not_cancel_siblings() {
        let exec = MockExecutor::new(Duration::from_millis(10));
        let tasks = vec![task("fail-a"), task("b"), task("c")];
        let orch = orchestrator(tasks.clone(), exec.clone(), 4);

        let report = orch
            .run_all(&tasks, RunOptions::parallel().with_fail_fast(true))
            .await;
        assert_eq!(report.status, ReportStatus::Failed);
        assert_eq!(report.count(RunStatus::Succeeded), 2);
        assert_eq!(exec.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_disabled_task_is_never_invoked() {
        let exec = MockExecutor::new(Duration::from_millis(1));
        let tasks = vec![
            task("a").with_frequency(Frequency::Daily),
            task("b").with_enabled(false),
        ];
        let orch = orchestrator(tasks, exec.clone(), 4);

        let report = orch.run_registered(RunOptions::parallel()).await;
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[1].status, RunStatus::Skipped);
        assert_eq!(report.records[1].exit_detail, DISABLED_DETAIL);
        assert_eq!(exec.calls(), vec!["a"]);

        let record = orch.run_one("b").await.unwrap();
        assert_eq!(record.status, RunStatus::Skipped);
        assert_eq!(exec.calls(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_run_one_unknown_task() {
        let exec = MockExecutor::new(Duration::from_millis(1));
        let orch = orchestrator(vec![task("a")], exec, 1);
        let err = orch.run_one("missing").await.unwrap_err();
        assert!(matches!(err, CadenceError::TaskNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_overlapping_run_one_is_skipped() {
        let exec = MockExecutor::new(Duration::from_millis(200));
        let orch = Arc::new(orchestrator(vec![task("x")], exec.clone(), 4));

        let (first, second) = tokio::join!(orch.run_one("x"), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            orch.run_one("x").await
        });
        let statuses = [first.unwrap().status, second.unwrap().status];
        assert!(statuses.contains(&RunStatus::Succeeded));
        assert!(statuses.contains(&RunStatus::Skipped));
        assert_eq!(exec.calls().len(), 1);
        assert!(!orch.is_running("x"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shared_lock_dir_excludes_other_orchestrators() {
        let locks = tempfile::tempdir().unwrap();
        let exec_a = MockExecutor::new(Duration::from_millis(200));
        let exec_b = MockExecutor::new(Duration::from_millis(1));
        // Two orchestrators stand in for two processes: nothing but the lock dir is shared.
        let a = Arc::new(
            orchestrator(vec![task("x")], exec_a.clone(), 4).with_lock_dir(locks.path()),
        );
        let b = orchestrator(vec![task("x")], exec_b.clone(), 4).with_lock_dir(locks.path());

        let (first, second) = tokio::join!(a.run_one("x"), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            b.run_one("x").await
        });
        assert_eq!(first.unwrap().status, RunStatus::Succeeded);
        let second = second.unwrap();
        assert_eq!(second.status, RunStatus::Skipped);
        assert_eq!(second.exit_detail, RUNNING_DETAIL);
        assert!(exec_b.calls().is_empty());
        assert!(!b.is_running("x"));

        // Released once the first run is over.
        let again = b.run_one("x").await.unwrap();
        assert_eq!(again.status, RunStatus::Succeeded);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unusable_lock_dir_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let exec = MockExecutor::new(Duration::from_millis(1));
        let orch = orchestrator(vec![task("x")], exec.clone(), 1).with_lock_dir(&blocker);

        let record = orch.run_one("x").await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.exit_detail.contains("cannot take run lock"));
        assert!(exec.calls().is_empty());
        assert!(!orch.is_running("x"));
    }

    #[tokio::test]
    async fn test_duplicate_ids_in_one_batch_never_overlap() {
        let exec = MockExecutor::new(Duration::from_millis(30));
        let tasks = vec![task("x"), task("x"), task("y")];
        let orch = orchestrator(vec![task("x"), task("y")], exec, 4);

        let report = orch.run_all(&tasks, RunOptions::parallel()).await;
        assert_eq!(report.records.len(), 3);
        let real: Vec<_> = report
            .records
            .iter()
            .filter(|r| r.task_id == "x" && r.status != RunStatus::Skipped)
            .collect();
        assert_eq!(real.len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_executor_is_contained() {
        let exec = MockExecutor::new(Duration::from_millis(1));
        let tasks = vec![task("panic-a"), task("b")];
        let orch = orchestrator(tasks.clone(), exec, 4);

        let report = orch.run_all(&tasks, RunOptions::parallel()).await;
        assert_eq!(report.records[0].status, RunStatus::Failed);
        assert!(report.records[0].exit_detail.contains("panicked"));
        assert_eq!(report.records[1].status, RunStatus::Succeeded);
        assert!(!orch.is_running("panic-a"));
    }

    #[tokio::test]
    async fn test_timeout_for_prefers_task_override() {
        let exec = MockExecutor::new(Duration::from_millis(1));
        let orch = orchestrator(vec![], exec, 1);
        assert_eq!(orch.timeout_for(&task("a")), Duration::from_secs(600));
        assert_eq!(
            orch.timeout_for(&task("a").with_timeout_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let exec = MockExecutor::new(Duration::from_millis(1));
        let orch = orchestrator(vec![], exec, 1);
        let report = orch.run_all(&[], RunOptions::parallel()).await;
        assert!(report.is_empty());
        assert_eq!(report.status, ReportStatus::Completed);
    }
}
