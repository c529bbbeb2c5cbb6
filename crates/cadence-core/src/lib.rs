//! Core types and error definitions for the cadence task engine.
//!
//! This crate provides the foundational types shared across all cadence crates:
//! the error taxonomy, the task registry, and the value objects produced by runs
//! and syncs.
//!
//! # Main types
//!
//! - [`CadenceError`]: Unified error enum for all cadence subsystems.
//! - [`CadenceResult`]: Convenience alias for `Result<T, CadenceError>`.
//! - [`TaskDescriptor`]: One runnable task as declared in the configuration.
//! - [`TaskStore`]: The registry of known tasks, reloadable at runtime.
//! - [`RunRecord`] / [`RunReport`]: Outcome of one task run / of a batch.
//! - [`ScheduleEntry`]: Persisted next-due bookkeeping for one task.
//! - [`SyncOutcome`]: Result of one change-sync pipeline invocation.

/// Task registry backed by the TOML configuration file.
pub mod registry;
/// Shared value types (descriptors, run records, schedule entries, sync outcomes).
pub mod types;

pub use registry::TaskStore;
pub use types::{
    Frequency, ReportStatus, RunPolicy, RunRecord, RunReport, RunStatus, ScheduleEntry,
    SyncOutcome, TaskDescriptor,
};

// --- Error types ---

/// Top-level error type for cadence.
///
/// Per-task failures never surface through this type at the orchestrator
/// boundary; they are folded into [`RunRecord`]s. Only store-level and
/// pipeline-level problems are reported as errors.
#[derive(Debug, thiserror::Error)]
pub enum CadenceError {
    /// Malformed or missing task registry / configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A request addressed a task id that is not in the registry.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// A task exited abnormally, timed out, or could not be started.
    #[error("Execution failure: {0}")]
    Execution(String),

    /// A task was requested while another invocation of it is in flight.
    #[error("Task '{0}' is already running")]
    LockConflict(String),

    /// The remote branch has diverged from the local one.
    #[error("Sync conflict: {0}")]
    SyncConflict(String),

    /// Credentials were missing or rejected by the remote host.
    #[error("Sync auth failure: {0}")]
    SyncAuthFailure(String),

    /// A version-control command failed.
    #[error("VCS error: {0}")]
    Vcs(String),

    /// An outbound HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The sync pipeline was misused (e.g. invoked while already running).
    #[error("Sync error: {0}")]
    Sync(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`CadenceError`].
pub type CadenceResult<T> = Result<T, CadenceError>;
