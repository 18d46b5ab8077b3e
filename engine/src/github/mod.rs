//! GitHub API access
//!
//! Pull request metadata for fork tag discovery and commit status
//! publication. Uses the blocking reqwest client because the trust search
//! is synchronous.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TrustError};
use crate::models::{CommitStatus, PullRequestMetadata};

const GITHUB_MEDIA_TYPE: &str = "application/vnd.github+json";

/// `owner/name` as GitHub allows them
static REPOSITORY_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]*/[A-Za-z0-9_.-]+$").expect("valid repository pattern")
});

/// Check that `full_name` is an `owner/name` pair safe to put in a URL path
pub fn validate_repository_name(full_name: &str) -> Result<()> {
    let name = full_name.split_once('/').map(|(_, name)| name).unwrap_or_default();
    if REPOSITORY_NAME.is_match(full_name) && name != "." && name != ".." {
        Ok(())
    } else {
        Err(TrustError::InvalidReference {
            value: full_name.to_string(),
        })
    }
}

/// GitHub API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    /// API base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Web base URL repositories are cloned from
    #[serde(default = "default_web_url")]
    pub web_url: String,
    /// Token used for API requests and status publication
    #[serde(default)]
    pub token: Option<String>,
    /// Context name of published commit statuses
    #[serde(default = "default_status_context")]
    pub status_context: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_web_url() -> String {
    "https://github.com".to_string()
}

fn default_status_context() -> String {
    "keygate/signature".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("keygate/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            web_url: default_web_url(),
            token: None,
            status_context: default_status_context(),
            timeout_seconds: default_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl GitHubConfig {
    /// API URL of pull request `number` in `owner/repo`
    pub fn pull_request_url(&self, repository: &str, number: u64) -> String {
        format!(
            "{}/repos/{}/pulls/{}",
            self.api_url.trim_end_matches('/'),
            repository,
            number
        )
    }

    /// Statuses API URL of commit `sha` in `owner/repo`
    pub fn statuses_url(&self, repository: &str, sha: &str) -> String {
        format!(
            "{}/repos/{}/statuses/{}",
            self.api_url.trim_end_matches('/'),
            repository,
            sha
        )
    }

    /// Clone URL of `owner/repo`
    pub fn clone_url(&self, repository: &str) -> String {
        format!("{}/{}.git", self.web_url.trim_end_matches('/'), repository)
    }
}

/// Hosting API operations required by the trust search
#[cfg_attr(test, mockall::automock)]
pub trait ForgeApi {
    /// Metadata of the pull request at `api_url`
    fn pull_request(&self, api_url: &str) -> Result<PullRequestMetadata>;
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    number: u64,
    head: PullRequestHead,
}

#[derive(Debug, Deserialize)]
struct PullRequestHead {
    sha: String,
    /// Null when the source repository was deleted
    repo: Option<RepositoryResponse>,
}

#[derive(Debug, Deserialize)]
struct RepositoryResponse {
    clone_url: String,
}

impl PullRequestResponse {
    fn into_metadata(self) -> PullRequestMetadata {
        PullRequestMetadata {
            number: self.number,
            head_sha: self.head.sha,
            source_clone_url: self.head.repo.map(|repo| repo.clone_url),
        }
    }
}

/// GitHub REST API client
pub struct GitHubClient {
    config: GitHubConfig,
    client: Client,
}

impl GitHubClient {
    pub fn new(config: GitHubConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &GitHubConfig {
        &self.config
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder
            .header(ACCEPT, GITHUB_MEDIA_TYPE)
            .header(USER_AGENT, &self.config.user_agent);
        match &self.config.token {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => builder,
        }
    }

    fn check_status(url: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_else(|_| "Unknown error".to_string());
        Err(TrustError::Api {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    /// Publish a commit status at `statuses_url` (`.../statuses/<sha>`)
    pub fn post_commit_status(&self, statuses_url: &str, status: &CommitStatus) -> Result<()> {
        debug!(url = %statuses_url, state = ?status.state, "Posting commit status");
        let response = self
            .request(self.client.post(statuses_url))
            .json(status)
            .send()?;
        Self::check_status(statuses_url, response)?;
        info!(url = %statuses_url, state = ?status.state, "Commit status posted");
        Ok(())
    }
}

impl ForgeApi for GitHubClient {
    fn pull_request(&self, api_url: &str) -> Result<PullRequestMetadata> {
        debug!(url = %api_url, "Fetching pull request metadata");
        let response = self.request(self.client.get(api_url)).send()?;
        let response = Self::check_status(api_url, response)?;
        let pull: PullRequestResponse = response.json()?;
        Ok(pull.into_metadata())
    }
}
