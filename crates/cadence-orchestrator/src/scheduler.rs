use crate::engine::Orchestrator;
use crate::schedule_store::ScheduleStore;
use async_trait::async_trait;
use cadence_core::{
    CadenceError, CadenceResult, RunPolicy, RunRecord, RunReport, ScheduleEntry, TaskDescriptor,
};
use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Scheduler settings, the `[scheduler]` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two evaluations of the schedule.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Run the change sync pipeline after every tick that ran something.
    #[serde(default)]
    pub sync_after_run: bool,
}

fn default_poll_interval_secs() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            sync_after_run: false,
        }
    }
}

impl SchedulerConfig {
    /// The poll interval must stay below the shortest frequency (one hour).
    pub fn validate(&self) -> CadenceResult<()> {
        if !(1..=3600).contains(&self.poll_interval_secs) {
            return Err(CadenceError::Config(format!(
                "scheduler.poll_interval_secs must be between 1 and 3600, got {}",
                self.poll_interval_secs
            )));
        }
        Ok(())
    }

    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Hook invoked once a tick's runs have all returned.
#[async_trait]
pub trait AfterTick: Send + Sync {
    /// Called with the tick's report. Not called when nothing was due.
    async fn after_tick(&self, report: &RunReport);
}

/// Recurring trigger for registered tasks.
///
/// Each tick reconciles the persisted schedule with the registry, runs every
/// due task once through the shared [`Orchestrator`], and persists the
/// advanced entries after each completion. Missed intervals collapse into a
/// single catch-up run. Every record advances its entry, whatever its
/// status, so a failing or skipped task is retried one interval later.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    schedule: Mutex<ScheduleStore>,
    config: SchedulerConfig,
    after_tick: Option<Arc<dyn AfterTick>>,
}

impl Scheduler {
    /// Scheduler over a shared orchestrator and a loaded schedule.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        schedule: ScheduleStore,
        config: SchedulerConfig,
    ) -> CadenceResult<Self> {
        config.validate()?;
        Ok(Self {
            orchestrator,
            schedule: Mutex::new(schedule),
            config,
            after_tick: None,
        })
    }

    /// Hook run after every tick that ran something.
    pub fn with_after_tick(mut self, hook: Arc<dyn AfterTick>) -> Self {
        self.after_tick = Some(hook);
        self
    }

    /// Active settings.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Current persisted entries, ordered by task id.
    pub async fn entries(&self) -> Vec<ScheduleEntry> {
        self.schedule.lock().await.entries()
    }

    /// Evaluate the schedule once at `now`.
    ///
    /// Returns the report of the tasks run during this tick, which is empty
    /// when nothing was due. Fails only if the schedule could not be persisted.
    pub async fn tick(&self, now: DateTime<Utc>) -> CadenceResult<RunReport> {
        let started_at = Utc::now();
        let tasks = self.orchestrator.store().snapshot();
        let by_id: HashMap<&str, &TaskDescriptor> =
            tasks.iter().map(|t| (t.id.as_str(), t)).collect();

        let due = {
            let mut schedule = self.schedule.lock().await;
            let changes = schedule.reconcile(&tasks, now);
            if !changes.is_empty() {
                schedule.save().await?;
            }
            schedule.due(now)
        };

        if due.is_empty() {
            tracing::debug!("Scheduler: no tasks due");
            return Ok(RunReport::from_records(RunPolicy::Parallel, false, started_at, Vec::new()));
        }
        tracing::info!(due = ?due, "Scheduler: running due tasks");

        let mut pending: FuturesUnordered<_> = due
            .iter()
            .enumerate()
            .filter_map(|(idx, id)| by_id.get(id.as_str()).map(|task| (idx, *task)))
            .map(|(idx, task)| async move { (idx, task, self.orchestrator.run_task(task).await) })
            .collect();

        let mut finished: Vec<(usize, RunRecord)> = Vec::with_capacity(due.len());
        let mut save_error: Option<CadenceError> = None;
        while let Some((idx, task, record)) = pending.next().await {
            tracing::info!(
                task_id = %record.task_id,
                status = %record.status,
                duration_ms = record.duration_ms(),
                "Scheduler: task finished"
            );
            if let Some(interval) = task.frequency.interval() {
                let mut schedule = self.schedule.lock().await;
                // Never earlier than the tick that started the run.
                schedule.record_run(&task.id, record.finished_at.max(now), interval);
                if let Err(e) = schedule.save().await {
                    tracing::error!(task_id = %task.id, error = %e, "Scheduler: failed to persist schedule");
                    save_error.get_or_insert(e);
                }
            }
            finished.push((idx, record));
        }

        finished.sort_by_key(|(idx, _)| *idx);
        let records = finished.into_iter().map(|(_, r)| r).collect();
        let report = RunReport::from_records(RunPolicy::Parallel, false, started_at, records);

        if let Some(e) = save_error {
            return Err(e);
        }
        if let Some(hook) = &self.after_tick {
            hook.after_tick(&report).await;
        }
        Ok(report)
    }

    /// Start the control loop in the background.
    ///
    /// The first tick fires immediately, which is when overdue tasks catch up.
    /// Cancelling `cancel` stops the loop after any in-progress tick returns.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(
                poll_interval_secs = self.config.poll_interval_secs,
                "Scheduler: control loop started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick(Utc::now()).await {
                            tracing::warn!(error = %e, "Scheduler: tick failed");
                        }
                    }
                }
            }
            tracing::info!("Scheduler: control loop stopped");
        })
    }
}
