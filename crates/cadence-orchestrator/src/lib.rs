//! Task execution, batch orchestration, and recurring scheduling for cadence.
//!
//! Runs registered tasks as isolated external processes, aggregates their
//! outcomes into run reports, and triggers them on a persisted schedule.
//!
//! # Main types
//!
//! - [`ProcessSandbox`]: Runs one task as a child process with timeout and output capture.
//! - [`Orchestrator`]: Drives batches under a parallel or sequential policy, one run per task id at a time.
//! - [`TaskLock`]: File lock that extends the one-run-per-id rule across processes.
//! - [`RunMonitor`]: Tracks per-task state and batch progress.
//! - [`ScheduleStore`]: JSON-persisted next-due bookkeeping per task.
//! - [`Scheduler`]: Control loop that runs due tasks through the orchestrator.

/// Batch orchestration and per-task mutual exclusion.
pub mod engine;
/// Cross-process run locks.
pub mod lock;
/// Per-task state and batch progress tracking.
pub mod monitor;
/// Process-based execution sandbox.
pub mod sandbox;
/// Persisted schedule entries.
pub mod schedule_store;
/// Recurring scheduler control loop.
pub mod scheduler;

pub use engine::{Orchestrator, OrchestratorConfig, RunOptions};
pub use lock::TaskLock;
pub use monitor::{BatchProgress, RunMonitor, TaskMetrics, TaskState, WorkerStatus};
pub use sandbox::{ProcessSandbox, SandboxConfig, TaskExecutor};
pub use schedule_store::{Reconciled, ScheduleStore};
pub use scheduler::{AfterTick, Scheduler, SchedulerConfig};
