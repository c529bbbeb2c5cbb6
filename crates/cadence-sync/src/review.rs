use crate::config::ReviewConfig;
use async_trait::async_trait;
use cadence_core::{CadenceError, CadenceResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// A proposal to merge `head` into `base`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRequest {
    /// One-line title.
    pub title: String,
    /// Markdown description.
    pub body: String,
    /// Branch carrying the changes.
    pub head: String,
    /// Branch to merge into.
    pub base: String,
    /// Labels to apply once opened.
    #[serde(default)]
    pub labels: Vec<String>,
}

/// A host that accepts review requests (pull/merge requests).
#[async_trait]
pub trait ReviewProvider: Send + Sync {
    /// Open the request and return a reference to it (its URL).
    async fn open(&self, request: &ReviewRequest) -> CadenceResult<String>;
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    number: u64,
    html_url: String,
}

/// GitHub pull requests over the REST API.
///
/// Every request, labels included, is bounded by the client timeout.
pub struct GitHubReviewProvider {
    http: reqwest::Client,
    api_base_url: String,
    owner: String,
    repo: String,
    token: Option<String>,
}

impl GitHubReviewProvider {
    /// Provider for `owner/repo` under `api_base_url`.
    pub fn new(
        api_base_url: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> CadenceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CadenceError::Http(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            owner: owner.into(),
            repo: repo.into(),
            token,
        })
    }

    /// Build from `[sync.review]`, reading the token from the configured env var.
    pub fn from_config(config: &ReviewConfig) -> CadenceResult<Self> {
        let (Some(owner), Some(repo)) = (&config.owner, &config.repo) else {
            return Err(CadenceError::Config(
                "sync.review.owner and sync.review.repo are required".to_string(),
            ));
        };
        let token = std::env::var(&config.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        Self::new(&config.api_base_url, owner, repo, token, config.timeout())
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_base_url, self.owner, self.repo, path
        )
    }

    fn post(&self, url: &str, token: &str) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", concat!("cadence/", env!("CARGO_PKG_VERSION")))
    }

    async fn add_labels(&self, number: u64, labels: &[String], token: &str) {
        let url = self.repo_url(&format!("issues/{number}/labels"));
        let result = self
            .post(&url, token)
            .json(&serde_json::json!({ "labels": labels }))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                info!(number, labels = ?labels, "Labels added to review request");
            }
            Ok(resp) => {
                warn!(number, status = %resp.status(), "Failed to label review request");
            }
            Err(e) => {
                warn!(number, error = %e, "Failed to label review request");
            }
        }
    }
}

#[async_trait]
impl ReviewProvider for GitHubReviewProvider {
    async fn open(&self, request: &ReviewRequest) -> CadenceResult<String> {
        let token = self.token.as_deref().ok_or_else(|| {
            CadenceError::SyncAuthFailure("no API token available for review requests".to_string())
        })?;

        let url = self.repo_url("pulls");
        let body = serde_json::json!({
            "title": request.title,
            "body": request.body,
            "head": request.head,
            "base": request.base,
        });

        let resp = self
            .post(&url, token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CadenceError::Http(format!("GitHub API request timed out: {e}"))
                } else {
                    CadenceError::Http(e.to_string())
                }
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let text = resp.text().await.unwrap_or_default();
            return Err(CadenceError::SyncAuthFailure(format!(
                "GitHub rejected credentials ({status}): {text}"
            )));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(CadenceError::Http(format!("GitHub API error {status}: {text}")));
        }

        let pull: PullResponse = resp
            .json()
            .await
            .map_err(|e| CadenceError::Http(format!("Unexpected GitHub response: {e}")))?;
        info!(number = pull.number, url = %pull.html_url, "Review request opened");

        if !request.labels.is_empty() {
            self.add_labels(pull.number, &request.labels, token).await;
        }
        Ok(pull.html_url)
    }
}
