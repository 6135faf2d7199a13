//! Pull-request creation collaborator.
//!
//! Invoked by the outcome reporter once a pipeline reaches `done`.

use async_trait::async_trait;
use octocrab::Octocrab;
use tracing::info;

use crate::config::GitHubConfig;
use crate::error::PullRequestError;
use crate::model::FeatureId;

/// Environment variable holding the GitHub token.
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";

/// Opens a pull request for a finished feature and returns its URL.
#[async_trait]
pub trait PullRequestService: Send + Sync {
    async fn create_pull_request(
        &self,
        feature: &FeatureId,
        branch: &str,
        summary: &str,
    ) -> Result<String, PullRequestError>;
}

/// Pull requests against a GitHub repository.
pub struct GitHubPullRequests {
    client: Octocrab,
    config: GitHubConfig,
}

impl GitHubPullRequests {
    pub fn new(client: Octocrab, config: GitHubConfig) -> Self {
        Self { client, config }
    }

    /// Build a client authenticated with `GITHUB_TOKEN`.
    pub fn from_env(config: GitHubConfig) -> Result<Self, PullRequestError> {
        let token = std::env::var(GITHUB_TOKEN_ENV).map_err(|_| {
            PullRequestError::NotConfigured(format!("{} is not set", GITHUB_TOKEN_ENV))
        })?;
        let client = Octocrab::builder().personal_token(token).build()?;
        Ok(Self::new(client, config))
    }
}

#[async_trait]
impl PullRequestService for GitHubPullRequests {
    async fn create_pull_request(
        &self,
        feature: &FeatureId,
        branch: &str,
        summary: &str,
    ) -> Result<String, PullRequestError> {
        let title = summary.lines().next().unwrap_or(feature.as_str());
        let pr = self
            .client
            .pulls(&self.config.owner, &self.config.repo)
            .create(title, branch, &self.config.base_branch)
            .body(summary)
            .send()
            .await?;
        let url = pr
            .html_url
            .map(|u| u.to_string())
            .ok_or_else(|| PullRequestError::Other(format!("pull request #{} has no URL", pr.number)))?;
        info!(feature = %feature, url = %url, "pull request opened");
        Ok(url)
    }
}

/// Logs instead of calling out. Used when no GitHub repository is configured.
#[derive(Debug, Default)]
pub struct DryRunPullRequests;

#[async_trait]
impl PullRequestService for DryRunPullRequests {
    async fn create_pull_request(
        &self,
        feature: &FeatureId,
        branch: &str,
        summary: &str,
    ) -> Result<String, PullRequestError> {
        info!(feature = %feature, branch = %branch, "dry run: would open pull request: {}", summary);
        Ok(format!("dry-run://{}", branch))
    }
}
