use cadence_core::{CadenceError, CadenceResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// The `[sync]` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Working tree to synchronize.
    #[serde(default = "default_repo_path")]
    pub repo_path: PathBuf,
    /// Remote to push to.
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Remote branch to push to. The current branch when absent.
    #[serde(default)]
    pub branch: Option<String>,
    /// Target branch of review requests.
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    /// Prepended to every commit message.
    #[serde(default = "default_commit_message_prefix")]
    pub commit_message_prefix: String,
    /// Push after committing.
    #[serde(default = "default_push")]
    pub push: bool,
    /// Open a review request after a successful push.
    #[serde(default)]
    pub open_review_request: bool,
    /// Commit every sync on a fresh `<branch_prefix>-<timestamp>` branch.
    #[serde(default)]
    pub branch_per_sync: bool,
    /// Prefix of per-sync branch names.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Commit author name. Git's own configuration when absent.
    #[serde(default)]
    pub author_name: Option<String>,
    /// Commit author email. Git's own configuration when absent.
    #[serde(default)]
    pub author_email: Option<String>,
    /// Paths, relative to `repo_path`, that are never staged or counted as changes.
    #[serde(default)]
    pub exclude: Vec<PathBuf>,
    /// Upper bound on a single git invocation.
    #[serde(default = "default_git_timeout_secs")]
    pub git_timeout_secs: u64,
    /// Review request settings.
    #[serde(default)]
    pub review: ReviewConfig,
}

fn default_repo_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_commit_message_prefix() -> String {
    "[cadence] ".to_string()
}

fn default_push() -> bool {
    true
}

fn default_branch_prefix() -> String {
    "cadence-sync".to_string()
}

fn default_git_timeout_secs() -> u64 {
    120
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            repo_path: default_repo_path(),
            remote: default_remote(),
            branch: None,
            base_branch: default_base_branch(),
            commit_message_prefix: default_commit_message_prefix(),
            push: default_push(),
            open_review_request: false,
            branch_per_sync: false,
            branch_prefix: default_branch_prefix(),
            author_name: None,
            author_email: None,
            exclude: Vec::new(),
            git_timeout_secs: default_git_timeout_secs(),
            review: ReviewConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> CadenceResult<()> {
        if self.remote.trim().is_empty() {
            return Err(CadenceError::Config("sync.remote must not be empty".to_string()));
        }
        if self.git_timeout_secs == 0 {
            return Err(CadenceError::Config(
                "sync.git_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.review.timeout_secs == 0 {
            return Err(CadenceError::Config(
                "sync.review.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.branch_per_sync && self.branch_prefix.trim().is_empty() {
            return Err(CadenceError::Config(
                "sync.branch_prefix must not be empty when branch_per_sync is set".to_string(),
            ));
        }
        if self.open_review_request && !self.review.is_configured() {
            return Err(CadenceError::Config(
                "sync.open_review_request requires sync.review.owner and sync.review.repo"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Timeout applied to each git invocation.
    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }
}

/// The `[sync.review]` section: where review requests are opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// REST API root, overridable for enterprise hosts and tests.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Repository owner.
    #[serde(default)]
    pub owner: Option<String>,
    /// Repository name.
    #[serde(default)]
    pub repo: Option<String>,
    /// Name of the environment variable holding the API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Labels applied to each new review request.
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
    /// Upper bound on each API request, connect included.
    #[serde(default = "default_review_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_labels() -> Vec<String> {
    vec!["automation".to_string()]
}

fn default_review_timeout_secs() -> u64 {
    30
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            owner: None,
            repo: None,
            token_env: default_token_env(),
            labels: default_labels(),
            timeout_secs: default_review_timeout_secs(),
        }
    }
}

impl ReviewConfig {
    /// Whether a target repository is named.
    pub fn is_configured(&self) -> bool {
        self.owner.as_deref().is_some_and(|o| !o.is_empty())
            && self.repo.as_deref().is_some_and(|r| !r.is_empty())
    }

    /// Timeout applied to each API request.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
