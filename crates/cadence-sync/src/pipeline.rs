use crate::config::SyncConfig;
use crate::git::{GitCli, VcsDriver};
use crate::review::{GitHubReviewProvider, ReviewProvider, ReviewRequest};
use cadence_core::{CadenceError, CadenceResult, RunReport, SyncOutcome};
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Error text reported when the remote branch moved on.
pub const DIVERGED: &str = "diverged";

/// Per-invocation switches. Defaults come from [`SyncConfig`].
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Commit even when the tree is clean (an empty commit).
    pub force: bool,
    /// Push the commit, or commits left unpushed by earlier syncs.
    pub push: bool,
    /// Open a review request once the push succeeded.
    pub open_review_request: bool,
    /// The run that produced the changes, when syncing after a run.
    pub report: Option<RunReport>,
}

impl SyncOptions {
    /// Switches as configured, without force or a report.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            force: false,
            push: config.push,
            open_review_request: config.open_review_request,
            report: None,
        }
    }

    /// Attach the run that produced the changes.
    pub fn with_report(mut self, report: RunReport) -> Self {
        self.report = Some(report);
        self
    }
}

/// Detects working-tree changes, commits them, pushes, and opens a review request.
///
/// A clean tree still pushes local commits that an earlier sync failed to
/// publish, so a transient push failure is retried on the next sync.
///
/// Not reentrant: a call made while another is in progress fails immediately.
/// Every step after change detection reports failure inside the returned
/// [`SyncOutcome`]; only an unusable repository is an `Err`.
pub struct SyncPipeline {
    config: SyncConfig,
    vcs: Arc<dyn VcsDriver>,
    review: Option<Arc<dyn ReviewProvider>>,
    busy: Mutex<()>,
}

impl SyncPipeline {
    /// Pipeline over any driver, without a review provider.
    pub fn new(config: SyncConfig, vcs: Arc<dyn VcsDriver>) -> Self {
        Self {
            config,
            vcs,
            review: None,
            busy: Mutex::new(()),
        }
    }

    /// Provider used when a review request is asked for.
    pub fn with_review_provider(mut self, provider: Arc<dyn ReviewProvider>) -> Self {
        self.review = Some(provider);
        self
    }

    /// Git CLI driver plus a GitHub provider when a review target is configured.
    pub fn from_config(config: SyncConfig) -> CadenceResult<Self> {
        config.validate()?;
        let git = GitCli::new(&config.repo_path)
            .with_author(config.author_name.clone(), config.author_email.clone())
            .with_excludes(&config.exclude)
            .with_timeout(config.git_timeout());
        let review = if config.review.is_configured() {
            Some(Arc::new(GitHubReviewProvider::from_config(&config.review)?) as Arc<dyn ReviewProvider>)
        } else {
            None
        };
        let mut pipeline = Self::new(config, Arc::new(git));
        pipeline.review = review;
        Ok(pipeline)
    }

    /// Active settings.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one sync. See the type docs for which failures are `Err`.
    pub async fn sync(&self, options: SyncOptions) -> CadenceResult<SyncOutcome> {
        let _busy = self
            .busy
            .try_lock()
            .map_err(|_| CadenceError::Sync("a sync is already in progress".to_string()))?;

        self.vcs.ensure_repository().await?;
        let changed = self.vcs.changed_paths().await?;
        let mut outcome = SyncOutcome {
            changed_files: changed.len(),
            ..SyncOutcome::default()
        };

        if changed.is_empty() && !options.force {
            return Ok(self.publish_pending(outcome, &options).await);
        }
        info!(changed_files = changed.len(), force = options.force, "Sync: starting");

        let now = Utc::now();
        let branch = match self.target_branch(now).await {
            Ok(branch) => branch,
            Err(e) => return Ok(fail(outcome, e)),
        };

        if let Err(e) = self.vcs.stage_all().await {
            return Ok(fail(outcome, e));
        }

        let message = commit_message(
            &self.config.commit_message_prefix,
            options.report.as_ref(),
            now,
        );
        match self.vcs.commit(&message, changed.is_empty()).await {
            Ok(Some(id)) => {
                info!(commit = %id, branch = %branch, "Sync: committed");
                outcome.committed = true;
                outcome.commit_id = Some(id);
                outcome.branch = Some(branch.clone());
            }
            Ok(None) => {
                info!("Sync: nothing was staged, no commit created");
                return Ok(outcome);
            }
            Err(e) => return Ok(fail(outcome, e)),
        }

        if !options.push {
            return Ok(outcome);
        }
        Ok(self.publish(outcome, &options, &branch, &message).await)
    }

    /// Clean tree: push commits an earlier sync left behind, if any.
    async fn publish_pending(&self, outcome: SyncOutcome, options: &SyncOptions) -> SyncOutcome {
        if !options.push {
            info!("Sync: working tree clean, nothing to do");
            return outcome;
        }
        let branch = match &self.config.branch {
            Some(branch) => branch.clone(),
            None => match self.vcs.current_branch().await {
                Ok(branch) => branch,
                Err(e) => return fail(outcome, e),
            },
        };
        let pending = match self.vcs.unpushed_commits(&self.config.remote, &branch).await {
            Ok(count) => count,
            Err(e) => return fail(outcome, e),
        };
        if pending == 0 {
            info!("Sync: working tree clean, nothing to do");
            return outcome;
        }

        info!(branch = %branch, unpushed = pending, "Sync: retrying push of earlier commits");
        let outcome = SyncOutcome {
            committed: true,
            branch: Some(branch.clone()),
            ..outcome
        };
        let message = commit_message(
            &self.config.commit_message_prefix,
            options.report.as_ref(),
            Utc::now(),
        );
        self.publish(outcome, options, &branch, &message).await
    }

    /// Push `branch`, then open the review request if asked to.
    async fn publish(
        &self,
        mut outcome: SyncOutcome,
        options: &SyncOptions,
        branch: &str,
        message: &str,
    ) -> SyncOutcome {
        match self
            .vcs
            .push(&self.config.remote, branch, self.config.branch_per_sync)
            .await
        {
            Ok(()) => {
                info!(remote = %self.config.remote, branch = %branch, "Sync: pushed");
                outcome.pushed = true;
            }
            Err(CadenceError::SyncConflict(detail)) => {
                warn!(branch = %branch, detail = %detail, "Sync: remote has diverged, local commit kept");
                outcome.error = Some(DIVERGED.to_string());
                return outcome;
            }
            Err(e) => return fail(outcome, e),
        }

        if options.open_review_request {
            let request = self.review_request(message, branch, outcome.changed_files);
            match &self.review {
                Some(provider) => match provider.open(&request).await {
                    Ok(reference) => outcome.review_request_ref = Some(reference),
                    Err(e) => return fail(outcome, e),
                },
                None => {
                    return fail(
                        outcome,
                        CadenceError::Config("no review provider is configured".to_string()),
                    );
                }
            }
        }
        outcome
    }

    async fn target_branch(&self, now: DateTime<Utc>) -> CadenceResult<String> {
        if self.config.branch_per_sync {
            let name = sync_branch_name(&self.config.branch_prefix, now);
            self.vcs.create_branch(&name).await?;
            return Ok(name);
        }
        match &self.config.branch {
            Some(branch) => Ok(branch.clone()),
            None => self.vcs.current_branch().await,
        }
    }

    fn review_request(&self, message: &str, branch: &str, changed_files: usize) -> ReviewRequest {
        let (title, rest) = message.split_once('\n').unwrap_or((message, ""));
        let mut body = String::from("Automated changes produced by scheduled task runs.\n");
        if !rest.trim().is_empty() {
            body.push_str("\n## Run summary\n\n");
            body.push_str(rest.trim());
            body.push('\n');
        }
        body.push_str(&format!("\nChanged files: {changed_files}\n"));
        ReviewRequest {
            title: title.to_string(),
            body,
            head: branch.to_string(),
            base: self.config.base_branch.clone(),
            labels: self.config.review.labels.clone(),
        }
    }
}

fn fail(mut outcome: SyncOutcome, error: CadenceError) -> SyncOutcome {
    warn!(error = %error, "Sync: step failed");
    outcome.error = Some(error.to_string());
    outcome
}

/// `<prefix><summary>`, followed by one line per record when a report is given.
pub fn commit_message(prefix: &str, report: Option<&RunReport>, now: DateTime<Utc>) -> String {
    match report {
        Some(report) => {
            let mut message = format!("{prefix}{}\n", report.summary());
            for record in &report.records {
                message.push_str(&format!("\n- {}: {}", record.task_id, record.status));
            }
            message
        }
        None => format!(
            "{prefix}automatic sync {}",
            now.to_rfc3339_opts(SecondsFormat::Secs, true)
        ),
    }
}

/// `<prefix>-<UTC timestamp>`, unique per second.
pub fn sync_branch_name(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{prefix}-{}", now.format("%Y%m%d-%H%M%S"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadence_core::{RunPolicy, RunRecord};
    use chrono::TimeZone;
    use parking_lot::Mutex as SyncMutex;

    /// In-memory VCS: `changes` is what `status` reports, cleared by a commit.
    #[derive(Default)]
    struct MockVcs {
        changes: SyncMutex<Vec<String>>,
        commits: SyncMutex<Vec<String>>,
        pushes: SyncMutex<Vec<(String, String, bool)>>,
        branches: SyncMutex<Vec<String>>,
        push_error: SyncMutex<Option<fn() -> CadenceError>>,
        commit_delay_ms: u64,
        /// Commits not yet pushed.
        ahead: SyncMutex<usize>,
    }

    impl MockVcs {
        fn with_changes(paths: &[&str]) -> Self {
            let vcs = Self::default();
            *vcs.changes.lock() = paths.iter().map(|p| p.to_string()).collect();
            vcs
        }
    }

    #[async_trait]
    impl VcsDriver for MockVcs {
        async fn ensure_repository(&self) -> CadenceResult<()> {
            Ok(())
        }

        async fn changed_paths(&self) -> CadenceResult<Vec<String>> {
            Ok(self.changes.lock().clone())
        }

        async fn current_branch(&self) -> CadenceResult<String> {
            Ok("main".to_string())
        }

        async fn create_branch(&self, name: &str) -> CadenceResult<()> {
            self.branches.lock().push(name.to_string());
            Ok(())
        }

        async fn stage_all(&self) -> CadenceResult<()> {
            Ok(())
        }

        async fn commit(&self, message: &str, allow_empty: bool) -> CadenceResult<Option<String>> {
            if self.commit_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.commit_delay_ms)).await;
            }
            let had_changes = !std::mem::take(&mut *self.changes.lock()).is_empty();
            if !had_changes && !allow_empty {
                return Ok(None);
            }
            let mut commits = self.commits.lock();
            commits.push(message.to_string());
            *self.ahead.lock() += 1;
            Ok(Some(format!("c{}", commits.len())))
        }

        async fn push(&self, remote: &str, branch: &str, set_upstream: bool) -> CadenceResult<()> {
            if let Some(make) = *self.push_error.lock() {
                return Err(make());
            }
            self.pushes
                .lock()
                .push((remote.to_string(), branch.to_string(), set_upstream));
            *self.ahead.lock() = 0;
            Ok(())
        }

        async fn unpushed_commits(&self, _remote: &str, _branch: &str) -> CadenceResult<usize> {
            Ok(*self.ahead.lock())
        }
    }

    struct StaticReview(CadenceResult<String>);

    #[async_trait]
    impl ReviewProvider for StaticReview {
        async fn open(&self, _request: &ReviewRequest) -> CadenceResult<String> {
            match &self.0 {
                Ok(url) => Ok(url.clone()),
                Err(e) => Err(CadenceError::SyncAuthFailure(e.to_string())),
            }
        }
    }

    fn options(push: bool, review: bool) -> SyncOptions {
        SyncOptions {
            force: false,
            push,
            open_review_request: review,
            report: None,
        }
    }

    #[tokio::test]
    async fn test_clean_tree_is_noop() {
        let vcs = Arc::new(MockVcs::default());
        let pipeline = SyncPipeline::new(SyncConfig::default(), vcs.clone());
        let outcome = pipeline.sync(options(true, false)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::no_changes());
        assert!(vcs.commits.lock().is_empty());
    }

    #[tokio::test]
    async fn test_commit_and_push() {
        let vcs = Arc::new(MockVcs::with_changes(&["a.txt", "b.txt"]));
        let pipeline = SyncPipeline::new(SyncConfig::default(), vcs.clone());
        let outcome = pipeline.sync(options(true, false)).await.unwrap();
        assert_eq!(outcome.changed_files, 2);
        assert!(outcome.committed);
        assert!(outcome.pushed);
        assert!(outcome.is_consistent());
        assert_eq!(outcome.branch.as_deref(), Some("main"));
        assert_eq!(
            *vcs.pushes.lock(),
            vec![("origin".to_string(), "main".to_string(), false)]
        );
        assert!(vcs.commits.lock()[0].starts_with("[cadence] automatic sync "));

        // Second call with nothing new is a no-op.
        let again = pipeline.sync(options(true, false)).await.unwrap();
        assert_eq!(again.changed_files, 0);
        assert!(!again.committed);
    }

    #[tokio::test]
    async fn test_no_push_stops_after_commit() {
        let vcs = Arc::new(MockVcs::with_changes(&["a.txt"]));
        let pipeline = SyncPipeline::new(SyncConfig::default(), vcs.clone());
        let outcome = pipeline.sync(options(false, true)).await.unwrap();
        assert!(outcome.committed);
        assert!(!outcome.pushed);
        assert!(outcome.review_request_ref.is_none());
        assert!(vcs.pushes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_diverged_push_keeps_commit() {
        let vcs = Arc::new(MockVcs::with_changes(&["a.txt"]));
        *vcs.push_error.lock() = Some(|| CadenceError::SyncConflict("[rejected]".into()));
        let pipeline = SyncPipeline::new(SyncConfig::default(), vcs.clone());
        let outcome = pipeline.sync(options(true, true)).await.unwrap();
        assert!(outcome.committed);
        assert!(!outcome.pushed);
        assert_eq!(outcome.error.as_deref(), Some(DIVERGED));
        assert!(outcome.review_request_ref.is_none());
        assert_eq!(vcs.commits.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_push_is_retried_on_clean_tree() {
        let vcs = Arc::new(MockVcs::with_changes(&["a.txt"]));
        *vcs.push_error.lock() = Some(|| CadenceError::Vcs("git push failed: unreachable".into()));
        let pipeline = SyncPipeline::new(SyncConfig::default(), vcs.clone());

        let first = pipeline.sync(options(true, false)).await.unwrap();
        assert!(first.committed);
        assert!(!first.pushed);
        assert!(first.error.unwrap().contains("unreachable"));

        // Remote reachable again; nothing new in the tree.
        *vcs.push_error.lock() = None;
        let retry = pipeline.sync(options(true, false)).await.unwrap();
        assert_eq!(retry.changed_files, 0);
        assert!(retry.committed);
        assert!(retry.commit_id.is_none());
        assert!(retry.pushed);
        assert!(retry.is_success());
        assert!(retry.is_consistent());
        assert_eq!(vcs.commits.lock().len(), 1);
        assert_eq!(vcs.pushes.lock().len(), 1);

        // Caught up: back to a no-op.
        let idle = pipeline.sync(options(true, false)).await.unwrap();
        assert_eq!(idle, SyncOutcome::no_changes());
    }

    #[tokio::test]
    async fn test_unpushed_commits_ignored_without_push() {
        let vcs = Arc::new(MockVcs::default());
        *vcs.ahead.lock() = 2;
        let pipeline = SyncPipeline::new(SyncConfig::default(), vcs.clone());
        let outcome = pipeline.sync(options(false, false)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::no_changes());
        assert!(vcs.pushes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_force_on_clean_tree_makes_empty_commit() {
        let vcs = Arc::new(MockVcs::default());
        let pipeline = SyncPipeline::new(SyncConfig::default(), vcs.clone());
        let mut opts = options(true, false);
        opts.force = true;
        let outcome = pipeline.sync(opts).await.unwrap();
        assert_eq!(outcome.changed_files, 0);
        assert!(outcome.committed);
        assert!(outcome.pushed);
    }

    #[tokio::test]
    async fn test_review_request_opened_after_push() {
        let vcs = Arc::new(MockVcs::with_changes(&["a.txt"]));
        let config = SyncConfig {
            branch_per_sync: true,
            ..SyncConfig::default()
        };
        let pipeline = SyncPipeline::new(config, vcs.clone()).with_review_provider(Arc::new(
            StaticReview(Ok("https://github.example.test/acme/reports/pull/7".into())),
        ));
        let outcome = pipeline.sync(options(true, true)).await.unwrap();
        assert!(outcome.pushed);
        assert_eq!(
            outcome.review_request_ref.as_deref(),
            Some("https://github.example.test/acme/reports/pull/7")
        );
        let branch = vcs.branches.lock()[0].clone();
        assert!(branch.starts_with("cadence-sync-"));
        assert_eq!(vcs.pushes.lock()[0], ("origin".into(), branch, true));
    }

    #[tokio::test]
    async fn test_review_failure_does_not_undo_push() {
        let vcs = Arc::new(MockVcs::with_changes(&["a.txt"]));
        let pipeline = SyncPipeline::new(SyncConfig::default(), vcs)
            .with_review_provider(Arc::new(StaticReview(Err(CadenceError::Http("401".into())))));
        let outcome = pipeline.sync(options(true, true)).await.unwrap();
        assert!(outcome.pushed);
        assert!(outcome.review_request_ref.is_none());
        assert!(outcome.error.unwrap().contains("Sync auth failure"));
    }

    #[tokio::test]
    async fn test_review_without_provider_is_reported() {
        let vcs = Arc::new(MockVcs::with_changes(&["a.txt"]));
        let pipeline = SyncPipeline::new(SyncConfig::default(), vcs);
        let outcome = pipeline.sync(options(true, true)).await.unwrap();
        assert!(outcome.pushed);
        assert!(outcome.error.unwrap().contains("no review provider"));
    }

    #[tokio::test]
    async fn test_concurrent_sync_is_rejected() {
        let vcs = Arc::new(MockVcs {
            commit_delay_ms: 200,
            ..MockVcs::with_changes(&["a.txt"])
        });
        let pipeline = SyncPipeline::new(SyncConfig::default(), vcs);
        let (first, second) = tokio::join!(pipeline.sync(options(false, false)), async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            pipeline.sync(options(false, false)).await
        });
        assert!(first.unwrap().committed);
        assert!(matches!(second, Err(CadenceError::Sync(_))));
    }

    #[test]
    fn test_commit_message_from_report() {
        let report = RunReport::from_records(
            RunPolicy::Parallel,
            false,
            Utc::now(),
            vec![
                RunRecord::failed("scan", Utc::now(), "exit 1"),
                RunRecord::skipped("digest", "task is disabled"),
            ],
        );
        let message = commit_message("[bot] ", Some(&report), Utc::now());
        let mut lines = message.lines();
        assert_eq!(
            lines.next().unwrap(),
            "[bot] parallel run of 2 task(s): 0 succeeded, 1 failed, 0 timed out, 1 skipped"
        );
        assert!(message.contains("- scan: failed"));
        assert!(message.contains("- digest: skipped"));
    }

    #[test]
    fn test_standalone_message_and_branch_name() {
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(
            commit_message("[cadence] ", None, now),
            "[cadence] automatic sync 2026-03-04T05:06:07Z"
        );
        assert_eq!(sync_branch_name("cadence-sync", now), "cadence-sync-20260304-050607");
    }
}
