//! GitHub REST endpoints and payloads used by the sync engine.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use log::debug;
use reqwest::Url;
use serde::{Deserialize, de::DeserializeOwned};

use crate::{
    config::HttpConfig,
    device_config::Repository,
    http::{HttpClient, HttpError},
    rate_limiter::{ApiResource, QuotaInfo, RateLimiter},
};

use super::SyncError;

const API_VERSION: &str = "2022-11-28";
/// Slack on top of the client timeout before the call is abandoned.
const CALL_GRACE: Duration = Duration::from_secs(1);

pub const SEARCH_PAGE_SIZE: usize = 100;
/// GitHub stops serving search results after the first thousand.
pub const SEARCH_RESULT_CAP: usize = 1000;
pub const ACTIVITY_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse<T> {
    pub total_count: u64,
    #[serde(default)]
    pub incomplete_results: bool,
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitItem {
    pub sha: String,
    pub commit: CommitDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitDetail {
    pub committer: Option<GitActor>,
    pub author: Option<GitActor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitActor {
    pub date: DateTime<Utc>,
}

impl CommitItem {
    /// Day the commit landed, preferring the committer date.
    pub fn day(&self) -> Option<NaiveDate> {
        self.commit
            .committer
            .as_ref()
            .or(self.commit.author.as_ref())
            .map(|actor| actor.date.date_naive())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueItem {
    pub number: u64,
    pub state: String,
    pub repository_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub pull_request: Option<PullRequestRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestRef {
    pub merged_at: Option<DateTime<Utc>>,
}

impl IssueItem {
    /// `owner/name` taken from the trailing segments of `repository_url`.
    pub fn repository(&self) -> Option<Repository> {
        let mut segments = self.repository_url.trim_end_matches('/').rsplit('/');
        let name = segments.next()?;
        let owner = segments.next()?;
        format!("{owner}/{name}").parse().ok()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewComment {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub pull_request_url: String,
}

impl ReviewComment {
    /// Pull request number parsed from `pull_request_url`, if present.
    pub fn pull_number(&self) -> Option<u64> {
        self.pull_request_url.rsplit('/').next()?.parse().ok()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub login: String,
}

/// Authenticated access to the GitHub REST API through an [`HttpClient`].
#[derive(Clone)]
pub struct GitHubApi {
    http: Arc<dyn HttpClient>,
    base: Url,
    token: String,
    user_agent: String,
    timeout: Duration,
}

impl GitHubApi {
    pub fn new(http: Arc<dyn HttpClient>, config: &HttpConfig, token: &str) -> Result<Self> {
        let mut base = config.api_base.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base)
            .with_context(|| format!("Invalid API base URL '{}'", config.api_base))?;

        Ok(Self {
            http,
            base,
            token: token.to_string(),
            user_agent: config.user_agent.clone(),
            timeout: config.timeout(),
        })
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("Authorization".into(), format!("Bearer {}", self.token)),
            ("Accept".into(), "application/vnd.github+json".into()),
            ("User-Agent".into(), self.user_agent.clone()),
            ("X-GitHub-Api-Version".into(), API_VERSION.into()),
        ]
    }

    fn endpoint(&self, path: &str) -> Result<Url, SyncError> {
        self.base
            .join(path)
            .map_err(|e| SyncError::Malformed(format!("endpoint {path}: {e}")))
    }

    /// One page of commits authored by `user` in `repositories` since
    /// `since`, newest first. Pages start at 1.
    pub fn commit_search_url(
        &self,
        user: &str,
        repositories: &[Repository],
        since: NaiveDate,
        page: u32,
    ) -> Result<Url, SyncError> {
        let mut query = format!("author:{user} committer-date:>={}", since.format("%Y-%m-%d"));
        for repository in repositories {
            query.push_str(&format!(" repo:{repository}"));
        }

        let mut url = self.endpoint("search/commits")?;
        url.query_pairs_mut()
            .append_pair("q", &query)
            .append_pair("sort", "committer-date")
            .append_pair("order", "desc")
            .append_pair("page", &page.max(1).to_string())
            .append_pair("per_page", &SEARCH_PAGE_SIZE.to_string());
        Ok(url)
    }

    /// Pull requests in `repositories` updated at or after `since`, oldest first.
    pub fn pull_request_search_url(
        &self,
        repositories: &[Repository],
        since: DateTime<Utc>,
    ) -> Result<Url, SyncError> {
        let mut query = String::from("is:pr");
        for repository in repositories {
            query.push_str(&format!(" repo:{repository}"));
        }
        query.push_str(&format!(" updated:>={}", since.format("%Y-%m-%dT%H:%M:%SZ")));

        let mut url = self.endpoint("search/issues")?;
        url.query_pairs_mut()
            .append_pair("q", &query)
            .append_pair("sort", "updated")
            .append_pair("order", "asc")
            .append_pair("per_page", &ACTIVITY_PAGE_SIZE.to_string());
        Ok(url)
    }

    /// Review comments on `repository` updated at or after `since`.
    pub fn review_comments_url(
        &self,
        repository: &Repository,
        since: DateTime<Utc>,
    ) -> Result<Url, SyncError> {
        let mut url = self.endpoint(&format!(
            "repos/{}/{}/pulls/comments",
            repository.owner(),
            repository.name()
        ))?;
        url.query_pairs_mut()
            .append_pair("sort", "updated")
            .append_pair("direction", "asc")
            .append_pair("since", &since.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .append_pair("per_page", &ACTIVITY_PAGE_SIZE.to_string());
        Ok(url)
    }

    /// Issues one GET, records it against `limiter` and decodes the body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &Url,
        limiter: &mut RateLimiter,
        now: DateTime<Utc>,
    ) -> Result<T, SyncError> {
        let headers = self.headers();
        let resource = ApiResource::for_path(url.path());
        let request = self.http.get(url.as_str(), &headers, self.timeout);

        let result = match tokio::time::timeout(self.timeout + CALL_GRACE, request).await {
            Ok(result) => result,
            Err(_) => Err(HttpError::Timeout),
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                limiter.record_call(resource, None, now);
                return Err(e.into());
            }
        };

        let quota = QuotaInfo::from_headers(&response);
        limiter.record_call(resource, quota.as_ref(), now);
        debug!(
            "GET {} -> {} (remaining {:?})",
            url.path(),
            response.status,
            quota.as_ref().map(|q| q.remaining)
        );

        if !response.is_success() {
            let retry_after = response
                .header("retry-after")
                .and_then(|v| v.trim().parse::<i64>().ok())
                .and_then(|secs| now.checked_add_signed(chrono::Duration::seconds(secs)));
            return Err(SyncError::from_status(response.status, quota.as_ref(), retry_after));
        }

        serde_json::from_str(&response.body).map_err(|e| SyncError::Malformed(e.to_string()))
    }

    /// Checks the token against `GET /user` and returns the login it belongs to.
    pub async fn validate_token(
        &self,
        limiter: &mut RateLimiter,
        now: DateTime<Utc>,
    ) -> Result<String, SyncError> {
        let url = self.endpoint("user")?;
        let user: User = self.get_json(&url, limiter, now).await?;
        Ok(user.login)
    }
}
