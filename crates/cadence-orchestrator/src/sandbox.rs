//! Execution sandbox: runs one task as an external process.
//!
//! Every task is treated as an opaque program with a three-part contract:
//! parameters go in through the environment, output goes to a task-scoped
//! log file and output directory, and the outcome comes back as the exit
//! status. The sandbox always produces a [`RunRecord`]; start failures,
//! abnormal exits and timeouts are data, never errors.

use async_trait::async_trait;
use cadence_core::{RunRecord, RunStatus, TaskDescriptor};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Anything that can execute a task and report how it went.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run `task` to completion or until `timeout` elapses.
    async fn execute(&self, task: &TaskDescriptor, timeout: Duration) -> RunRecord;
}

/// Where the sandbox resolves executables and places task output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Base for relative executable paths (the config file's directory).
    pub base_dir: PathBuf,
    /// Per-task output areas live under `<output_root>/<task_id>/`.
    pub output_root: PathBuf,
    /// Combined stdout/stderr logs live under `<log_root>/<task_id>/`.
    pub log_root: PathBuf,
    /// Lines of output kept in `exit_detail` on failure.
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
}

fn default_tail_lines() -> usize {
    20
}

const TAIL_MAX_BYTES: usize = 4096;

impl SandboxConfig {
    /// Settings with the default tail length.
    pub fn new(
        base_dir: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        log_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            output_root: output_root.into(),
            log_root: log_root.into(),
            tail_lines: default_tail_lines(),
        }
    }
}

/// Runs tasks as child processes of the current process.
pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    /// Sandbox over `config`.
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Active settings.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The task's own output area. Also its working directory.
    pub fn output_dir(&self, task_id: &str) -> PathBuf {
        absolutize(self.config.output_root.join(task_id))
    }

    /// Paths with a separator are taken relative to `base_dir`; bare names go through `PATH`.
    pub fn resolve_executable(&self, executable: &str) -> PathBuf {
        let path = Path::new(executable);
        if path.is_absolute() || path.components().count() <= 1 {
            path.to_path_buf()
        } else {
            // The child runs inside its output area, so relative paths must be anchored first.
            absolutize(self.config.base_dir.join(path))
        }
    }

    fn log_path(&self, task_id: &str) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        self.config
            .log_root
            .join(task_id)
            .join(format!("{stamp}.log"))
    }

    fn build_command(&self, task: &TaskDescriptor, output_dir: &Path) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(self.resolve_executable(&task.executable));
        cmd.args(&task.args)
            .current_dir(output_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .env("CADENCE_TASK_ID", &task.id)
            .env("CADENCE_OUTPUT_DIR", output_dir);
        // Own process group, so a timeout can take down everything the task spawned.
        #[cfg(unix)]
        cmd.process_group(0);

        let params = serde_json::to_string(&task.parameters).unwrap_or_else(|_| "{}".to_string());
        cmd.env("CADENCE_PARAMS", params);
        for (key, value) in &task.parameters {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            cmd.env(param_env_key(key), rendered);
        }
        cmd
    }
}

#[async_trait]
impl TaskExecutor for ProcessSandbox {
    async fn execute(&self, task: &TaskDescriptor, timeout: Duration) -> RunRecord {
        let started_at = Utc::now();
        let output_dir = self.output_dir(&task.id);
        let log_path = self.log_path(&task.id);

        let log_file = match prepare_output(&output_dir, &log_path).await {
            Ok(file) => file,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Could not prepare task output area");
                return RunRecord::failed(
                    &task.id,
                    started_at,
                    format!("failed to start: cannot prepare output area: {e}"),
                );
            }
        };

        let stderr_file = match log_file.try_clone() {
            Ok(f) => f,
            Err(e) => {
                return RunRecord::failed(
                    &task.id,
                    started_at,
                    format!("failed to start: cannot open log file: {e}"),
                );
            }
        };

        let mut cmd = self.build_command(task, &output_dir);
        cmd.stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file));

        info!(
            task_id = %task.id,
            executable = %task.executable,
            timeout_secs = timeout.as_secs(),
            "Starting task"
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Task failed to start");
                let mut record = RunRecord::failed(
                    &task.id,
                    started_at,
                    format!("failed to start '{}': {e}", task.executable),
                );
                record.output_ref = Some(log_path);
                return record;
            }
        };

        let waited = tokio::time::timeout(timeout, child.wait()).await;
        let (status, exit_code, detail) = match waited {
            Ok(Ok(exit)) if exit.success() => (
                RunStatus::Succeeded,
                exit.code(),
                "exited with code 0".to_string(),
            ),
            Ok(Ok(exit)) => {
                let tail = read_tail(&log_path, self.config.tail_lines).await;
                let head = match exit.code() {
                    Some(code) => format!("exited with code {code}"),
                    None => "terminated by signal".to_string(),
                };
                (RunStatus::Failed, exit.code(), join_detail(head, &tail))
            }
            Ok(Err(e)) => (
                RunStatus::Failed,
                None,
                format!("failed waiting for process: {e}"),
            ),
            Err(_) => {
                terminate(&mut child, &task.id).await;
                let tail = read_tail(&log_path, self.config.tail_lines).await;
                (
                    RunStatus::TimedOut,
                    None,
                    join_detail(format!("timed out after {}s", timeout.as_secs_f64()), &tail),
                )
            }
        };

        let record = RunRecord {
            task_id: task.id.clone(),
            started_at,
            finished_at: Utc::now(),
            status,
            exit_code,
            exit_detail: detail,
            output_ref: Some(log_path),
        };

        debug!(
            task_id = %record.task_id,
            status = %record.status,
            duration_ms = record.duration_ms(),
            "Task process finished"
        );
        record
    }
}

/// Kill the task's whole process group, then the child itself, and reap it.
async fn terminate(child: &mut tokio::process::Child, task_id: &str) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            warn!(task_id, pgid = pid, error = %e, "Failed to kill task process group");
        }
    }
    if let Err(e) = child.kill().await {
        warn!(task_id, error = %e, "Failed to kill timed out task");
    }
}

fn absolutize(path: PathBuf) -> PathBuf {
    std::path::absolute(&path).unwrap_or(path)
}

async fn prepare_output(output_dir: &Path, log_path: &Path) -> std::io::Result<std::fs::File> {
    tokio::fs::create_dir_all(output_dir).await?;
    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::File::create(log_path).await?;
    Ok(file.into_std().await)
}

/// `CADENCE_PARAM_<KEY>` with the key upper-cased and anything outside `[A-Z0-9_]` replaced.
pub fn param_env_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("CADENCE_PARAM_{cleaned}")
}

/// Last `lines` lines of a log file, capped at a few KiB.
async fn read_tail(path: &Path, lines: usize) -> String {
    let Ok(bytes) = tokio::fs::read(path).await else {
        return String::new();
    };
    let start = bytes.len().saturating_sub(TAIL_MAX_BYTES);
    let text = String::from_utf8_lossy(&bytes[start..]);
    let all: Vec<&str> = text.lines().collect();
    let from = all.len().saturating_sub(lines);
    all[from..].join("\n")
}

fn join_detail(head: String, tail: &str) -> String {
    if tail.trim().is_empty() {
        head
    } else {
        format!("{head}\n{tail}")
    }
}
