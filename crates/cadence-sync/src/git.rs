//! Version-control driver backed by the `git` command line.

use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, warn};

/// The narrow slice of version control the sync pipeline needs.
#[async_trait]
pub trait VcsDriver: Send + Sync {
    /// Fail unless the working tree is a usable repository.
    async fn ensure_repository(&self) -> CadenceResult<()>;

    /// Modified, added, removed and untracked paths.
    async fn changed_paths(&self) -> CadenceResult<Vec<String>>;

    /// Name of the checked-out branch.
    async fn current_branch(&self) -> CadenceResult<String>;

    /// Create `name` from the current commit and switch to it.
    async fn create_branch(&self, name: &str) -> CadenceResult<()>;

    /// Stage every change [`VcsDriver::changed_paths`] reports.
    async fn stage_all(&self) -> CadenceResult<()>;

    /// Commit the index. `Ok(None)` when there was nothing to commit.
    async fn commit(&self, message: &str, allow_empty: bool) -> CadenceResult<Option<String>>;

    /// Push the current commit to `remote`'s `branch`. Never forces.
    ///
    /// A rejected push because the remote moved on is a
    /// [`CadenceError::SyncConflict`]; rejected credentials are a
    /// [`CadenceError::SyncAuthFailure`].
    async fn push(&self, remote: &str, branch: &str, set_upstream: bool) -> CadenceResult<()>;

    /// Local commits not yet on `remote`'s `branch`.
    ///
    /// When the remote branch is unknown locally every commit on `HEAD`
    /// counts. An unborn branch has none.
    async fn unpushed_commits(&self, remote: &str, branch: &str) -> CadenceResult<usize>;
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Drives the `git` executable found on `PATH`.
///
/// Each invocation is bounded by a timeout; a git process still running
/// when it elapses is killed.
pub struct GitCli {
    repo: PathBuf,
    author_name: Option<String>,
    author_email: Option<String>,
    excludes: Vec<String>,
    timeout: Duration,
}

impl GitCli {
    /// Driver for the working tree at `repo`.
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            author_name: None,
            author_email: None,
            excludes: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Paths relative to the repository that status and staging ignore.
    pub fn with_excludes<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        self.excludes = paths
            .into_iter()
            .map(|p| p.as_ref().to_string_lossy().replace('\\', "/"))
            .filter(|p| !p.is_empty())
            .collect();
        self
    }

    /// Upper bound on each git invocation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Commit identity passed per invocation instead of read from git config.
    pub fn with_author(mut self, name: Option<String>, email: Option<String>) -> Self {
        self.author_name = name;
        self.author_email = email;
        self
    }

    /// The working tree.
    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// `-- :/ :(exclude)<path>...`, or nothing when no paths are excluded.
    fn pathspec(&self) -> Vec<String> {
        if self.excludes.is_empty() {
            return Vec::new();
        }
        let mut args = vec!["--".to_string(), ":/".to_string()];
        args.extend(self.excludes.iter().map(|p| format!(":(exclude){p}")));
        args
    }

    async fn run(&self, args: &[&str]) -> CadenceResult<GitOutput> {
        debug!(repo = %self.repo.display(), args = ?args, "Running git");
        let mut cmd = tokio::process::Command::new("git");
        cmd.args(args)
            .current_dir(&self.repo)
            .stdin(Stdio::null())
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CadenceError::Vcs("git executable not found on PATH".to_string())
                } else {
                    CadenceError::Vcs(format!(
                        "failed to run git in '{}': {e}",
                        self.repo.display()
                    ))
                }
            })?,
            Err(_) => {
                warn!(args = ?args, timeout_secs = self.timeout.as_secs_f64(), "git timed out");
                return Err(CadenceError::Vcs(format!(
                    "git {} timed out after {}s",
                    args.join(" "),
                    self.timeout.as_secs_f64()
                )));
            }
        };
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_checked(&self, args: &[&str]) -> CadenceResult<String> {
        let out = self.run(args).await?;
        if !out.success {
            return Err(CadenceError::Vcs(format!(
                "git {} failed: {}",
                args.join(" "),
                out.stderr.trim()
            )));
        }
        Ok(out.stdout)
    }

    fn identity_args(&self) -> Vec<String> {
        let mut args = vec!["-c".to_string(), "commit.gpgsign=false".to_string()];
        if let Some(name) = &self.author_name {
            args.push("-c".to_string());
            args.push(format!("user.name={name}"));
        }
        if let Some(email) = &self.author_email {
            args.push("-c".to_string());
            args.push(format!("user.email={email}"));
        }
        args
    }
}

#[async_trait]
impl VcsDriver for GitCli {
    async fn ensure_repository(&self) -> CadenceResult<()> {
        if !self.repo.is_dir() {
            return Err(CadenceError::Vcs(format!(
                "repository path '{}' does not exist",
                self.repo.display()
            )));
        }
        let out = self.run(&["rev-parse", "--is-inside-work-tree"]).await?;
        if !out.success || out.stdout.trim() != "true" {
            return Err(CadenceError::Vcs(format!(
                "'{}' is not a git working tree",
                self.repo.display()
            )));
        }
        Ok(())
    }

    async fn changed_paths(&self) -> CadenceResult<Vec<String>> {
        let pathspec = self.pathspec();
        let mut args = vec!["status", "--porcelain", "--untracked-files=all"];
        args.extend(pathspec.iter().map(String::as_str));
        let stdout = self.run_checked(&args).await?;
        Ok(parse_porcelain(&stdout))
    }

    async fn current_branch(&self) -> CadenceResult<String> {
        // Works on an unborn branch too, unlike rev-parse.
        let out = self.run(&["symbolic-ref", "--short", "HEAD"]).await?;
        if !out.success {
            return Err(CadenceError::Vcs(
                "HEAD is detached; configure sync.branch or check out a branch".to_string(),
            ));
        }
        Ok(out.stdout.trim().to_string())
    }

    async fn create_branch(&self, name: &str) -> CadenceResult<()> {
        self.run_checked(&["checkout", "-b", name]).await?;
        Ok(())
    }

    async fn stage_all(&self) -> CadenceResult<()> {
        let pathspec = self.pathspec();
        let mut args = vec!["add", "--all"];
        args.extend(pathspec.iter().map(String::as_str));
        self.run_checked(&args).await?;
        Ok(())
    }

    async fn commit(&self, message: &str, allow_empty: bool) -> CadenceResult<Option<String>> {
        let identity = self.identity_args();
        let mut args: Vec<&str> = identity.iter().map(String::as_str).collect();
        args.extend(["commit", "--quiet", "-m", message]);
        if allow_empty {
            args.push("--allow-empty");
        }

        let out = self.run(&args).await?;
        if !out.success {
            let text = format!("{}{}", out.stdout, out.stderr);
            if text.contains("nothing to commit") || text.contains("no changes added to commit") {
                return Ok(None);
            }
            return Err(CadenceError::Vcs(format!("git commit failed: {}", text.trim())));
        }

        let head = self.run_checked(&["rev-parse", "HEAD"]).await?;
        Ok(Some(head.trim().to_string()))
    }

    async fn push(&self, remote: &str, branch: &str, set_upstream: bool) -> CadenceResult<()> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        let mut args = vec!["push", "--porcelain"];
        if set_upstream {
            args.push("--set-upstream");
        }
        args.push(remote);
        args.push(&refspec);

        let out = self.run(&args).await?;
        if out.success {
            return Ok(());
        }
        Err(classify_push_failure(&format!("{}\n{}", out.stdout, out.stderr)))
    }

    async fn unpushed_commits(&self, remote: &str, branch: &str) -> CadenceResult<usize> {
        let tracking = format!("refs/remotes/{remote}/{branch}");
        let known = self
            .run(&["rev-parse", "--verify", "--quiet", tracking.as_str()])
            .await?
            .success;
        let range = if known {
            format!("{tracking}..HEAD")
        } else {
            "HEAD".to_string()
        };

        let out = self.run(&["rev-list", "--count", range.as_str()]).await?;
        if !out.success {
            // Unborn HEAD.
            return Ok(0);
        }
        out.stdout.trim().parse().map_err(|e| {
            CadenceError::Vcs(format!("unexpected rev-list output '{}': {e}", out.stdout.trim()))
        })
    }
}

/// Paths from `git status --porcelain` output.
pub fn parse_porcelain(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let path = &line[3..];
            // Renames are reported as "old -> new".
            match path.split_once(" -> ") {
                Some((_, new)) => new.to_string(),
                None => path.to_string(),
            }
        })
        .collect()
}

/// Map git's push diagnostics onto the error taxonomy.
pub fn classify_push_failure(output: &str) -> CadenceError {
    let lower = output.to_ascii_lowercase();
    let detail = output.trim().to_string();

    if lower.contains("non-fast-forward")
        || lower.contains("fetch first")
        || lower.contains("[rejected]")
        || lower.contains("updates were rejected")
    {
        return CadenceError::SyncConflict(detail);
    }
    if lower.contains("authentication failed")
        || lower.contains("permission denied")
        || lower.contains("could not read username")
        || lower.contains("invalid username or password")
        || lower.contains("access denied")
        || lower.contains("the requested url returned error: 403")
    {
        return CadenceError::SyncAuthFailure(detail);
    }
    CadenceError::Vcs(format!("git push failed: {detail}"))
}
