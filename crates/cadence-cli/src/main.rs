mod config;
mod config_watcher;

use async_trait::async_trait;
use cadence_core::{RunPolicy, RunReport, SyncOutcome, TaskStore};
use cadence_orchestrator::{
    AfterTick, Orchestrator, ProcessSandbox, RunOptions, ScheduleStore, Scheduler,
};
use cadence_sync::{SyncOptions, SyncPipeline};
use clap::{Parser, Subcommand};
use config::CadenceConfig;
use config_watcher::ConfigWatcher;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence", about = "cadence: run, schedule and publish automation tasks")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cadence.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered tasks
    List,
    /// Run every registered task
    RunAll {
        /// parallel or sequential
        #[arg(long, default_value = "parallel")]
        policy: RunPolicy,
        /// Stop a sequential batch at the first failure
        #[arg(long)]
        fail_fast: bool,
        /// Sync the working tree once the batch has finished
        #[arg(long)]
        sync: bool,
    },
    /// Run a single task
    Run {
        task_id: String,
        /// Sync the working tree once the task has finished
        #[arg(long)]
        sync: bool,
    },
    /// Commit and publish changes in the working tree
    Sync {
        /// Commit even if nothing changed
        #[arg(long)]
        force: bool,
        #[arg(long, conflicts_with = "no_push")]
        push: bool,
        #[arg(long)]
        no_push: bool,
        /// Open a review request after pushing
        #[arg(long, conflicts_with = "no_review")]
        review: bool,
        #[arg(long)]
        no_review: bool,
    },
    /// Recurring scheduler
    Scheduler {
        #[command(subcommand)]
        action: SchedulerAction,
    },
}

#[derive(Subcommand)]
enum SchedulerAction {
    /// Run the scheduler in the foreground until Ctrl-C
    Start,
    /// Print persisted schedule entries and the running scheduler's monitor snapshot
    Status,
}

const EXIT_TASK_FAILURE: u8 = 1;
const EXIT_HARD_FAILURE: u8 = 2;
const STATUS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            warn!(error = %e, "Failed to load .env file");
        }
    }

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "cadence failed");
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_HARD_FAILURE)
        }
    }
}

/// Shared handles built from the config file.
struct App {
    config: CadenceConfig,
    store: Arc<TaskStore>,
    orchestrator: Arc<Orchestrator>,
}

impl App {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let config = CadenceConfig::load(path)?;
        let store = Arc::new(TaskStore::load(path)?);
        let sandbox = ProcessSandbox::new(config.sandbox_config());
        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            Arc::new(sandbox),
            config.orchestrator.clone(),
        )?
        .with_lock_dir(config.lock_dir());
        let orchestrator = Arc::new(orchestrator);
        Ok(Self {
            config,
            store,
            orchestrator,
        })
    }

    fn sync_pipeline(&self) -> anyhow::Result<SyncPipeline> {
        Ok(SyncPipeline::from_config(self.config.sync.clone())?)
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let app = App::load(&cli.config)?;

    match cli.command {
        Commands::List => {
            let tasks: Vec<_> = app
                .store
                .all()
                .into_iter()
                .map(|t| {
                    serde_json::json!({
                        "id": t.id,
                        "enabled": t.enabled,
                        "frequency": t.frequency,
                        "executable": t.executable,
                        "description": t.description,
                    })
                })
                .collect();
            print_json(&tasks)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::RunAll {
            policy,
            fail_fast,
            sync,
        } => {
            let options = RunOptions {
                policy,
                fail_fast: fail_fast || app.config.orchestrator.fail_fast,
            };
            let report = app.orchestrator.run_registered(options).await;
            finish_run(&app, report, sync).await
        }
        Commands::Run { task_id, sync } => {
            let started_at = chrono::Utc::now();
            let record = app.orchestrator.run_one(&task_id).await?;
            if !sync {
                print_json(&record)?;
                return Ok(exit_for(record.status.is_failure(), None));
            }
            let report =
                RunReport::from_records(RunPolicy::Sequential, false, started_at, vec![record]);
            finish_run(&app, report, true).await
        }
        Commands::Sync {
            force,
            push,
            no_push,
            review,
            no_review,
        } => {
            let defaults = SyncOptions::from_config(&app.config.sync);
            let options = SyncOptions {
                force,
                push: flag(push, no_push, defaults.push),
                open_review_request: flag(review, no_review, defaults.open_review_request),
                report: None,
            };
            let outcome = app.sync_pipeline()?.sync(options).await?;
            print_json(&outcome)?;
            Ok(exit_for(false, Some(&outcome)))
        }
        Commands::Scheduler { action } => match action {
            SchedulerAction::Status => {
                let schedule = ScheduleStore::open(app.config.schedule_path()).await?;
                let monitor = read_status(&app.config.status_path()).await;
                print_json(&serde_json::json!({
                    "entries": schedule.entries(),
                    "monitor": monitor,
                }))?;
                Ok(ExitCode::SUCCESS)
            }
            SchedulerAction::Start => run_scheduler(&app).await,
        },
    }
}

/// Print the report, syncing first when asked, and pick the exit code.
async fn finish_run(app: &App, report: RunReport, sync: bool) -> anyhow::Result<ExitCode> {
    if !sync {
        print_json(&report)?;
        return Ok(exit_for(report.has_failures(), None));
    }

    let options = SyncOptions::from_config(&app.config.sync).with_report(report.clone());
    let outcome = match app.sync_pipeline()?.sync(options).await {
        Ok(outcome) => outcome,
        Err(e) => {
            // The runs happened regardless; report them before failing.
            print_json(&report)?;
            return Err(e.into());
        }
    };
    print_json(&serde_json::json!({ "report": report, "sync": outcome }))?;
    Ok(exit_for(report.has_failures(), Some(&outcome)))
}

async fn run_scheduler(app: &App) -> anyhow::Result<ExitCode> {
    let schedule = ScheduleStore::open(app.config.schedule_path()).await?;
    let mut scheduler = Scheduler::new(
        Arc::clone(&app.orchestrator),
        schedule,
        app.config.scheduler.clone(),
    )?;
    if app.config.scheduler.sync_after_run {
        let hook = SyncAfterRun {
            pipeline: app.sync_pipeline()?,
            options: SyncOptions::from_config(&app.config.sync),
        };
        scheduler = scheduler.with_after_tick(Arc::new(hook));
    }

    let _watcher = ConfigWatcher::start(Arc::clone(&app.store), 500)?;
    let cancel = CancellationToken::new();
    let status = Arc::clone(app.orchestrator.monitor()).publish(
        app.config.status_path(),
        STATUS_INTERVAL,
        cancel.clone(),
    );
    let handle = Arc::new(scheduler).start(cancel.clone());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping scheduler");
    cancel.cancel();
    handle.await?;
    status.await?;
    Ok(ExitCode::SUCCESS)
}

/// Last snapshot a scheduler wrote, or `null` when none is readable.
async fn read_status(path: &Path) -> serde_json::Value {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable status file");
            serde_json::Value::Null
        }),
        Err(_) => serde_json::Value::Null,
    }
}

/// Runs the sync pipeline after every scheduler tick that ran something.
struct SyncAfterRun {
    pipeline: SyncPipeline,
    options: SyncOptions,
}

#[async_trait]
impl AfterTick for SyncAfterRun {
    async fn after_tick(&self, report: &RunReport) {
        let options = self.options.clone().with_report(report.clone());
        match self.pipeline.sync(options).await {
            Ok(outcome) if outcome.is_success() => {
                info!(
                    changed_files = outcome.changed_files,
                    committed = outcome.committed,
                    pushed = outcome.pushed,
                    "Post-run sync finished"
                );
            }
            Ok(outcome) => {
                warn!(error = ?outcome.error, committed = outcome.committed, "Post-run sync reported an error");
            }
            Err(e) => error!(error = %e, "Post-run sync failed"),
        }
    }
}

fn flag(on: bool, off: bool, default: bool) -> bool {
    if on {
        true
    } else if off {
        false
    } else {
        default
    }
}

fn exit_for(task_failed: bool, outcome: Option<&SyncOutcome>) -> ExitCode {
    let sync_failed = outcome.is_some_and(|o| !o.is_success());
    if task_failed || sync_failed {
        ExitCode::from(EXIT_TASK_FAILURE)
    } else {
        ExitCode::SUCCESS
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
