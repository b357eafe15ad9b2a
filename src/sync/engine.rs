//! The sync engine: one budgeted query per due signal per tick.
//!
//! Polling is split in two. [`GitHubSyncEngine::fetch`] talks to the network
//! and returns a [`SyncBatch`] without touching cursors or the graph;
//! [`GitHubSyncEngine::apply`] folds a batch in. The caller can drop a batch
//! between the two, which is how a lost link discards in-flight results.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, error, info, warn};

use crate::{
    config::NotificationConfig,
    device_config::{DeviceConfig, PollIntervals, Repository},
    graph::ContributionGraph,
    notification::{EventKind, NotificationEvent},
    rate_limiter::RateLimiter,
};

use super::{
    Signal, SyncError,
    cursor::{CommentCursor, PullRequestCursor},
    github::{CommitItem, GitHubApi, IssueItem, ReviewComment, SEARCH_PAGE_SIZE, SEARCH_RESULT_CAP, SearchResponse},
    scheduler::SyncScheduler,
};

/// Decoded response for one signal.
#[derive(Debug, Clone)]
pub enum Payload {
    Commits {
        since: NaiveDate,
        page: u32,
        results: SearchResponse<CommitItem>,
    },
    PullRequests(SearchResponse<IssueItem>),
    ReviewComments {
        repository: Repository,
        comments: Vec<ReviewComment>,
    },
}

#[derive(Debug, Clone)]
pub struct SignalPoll {
    pub signal: Signal,
    /// Repository a review comment poll was aimed at.
    pub target: Option<Repository>,
    pub result: Result<Payload, SyncError>,
}

/// Results of one tick's network calls, in poll order.
#[derive(Debug, Clone, Default)]
pub struct SyncBatch {
    pub polls: Vec<SignalPoll>,
}

impl SyncBatch {
    pub fn is_empty(&self) -> bool {
        self.polls.is_empty()
    }

    pub fn len(&self) -> usize {
        self.polls.len()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.polls.iter().map(|p| p.signal).collect()
    }

    /// Status of the first rejected-token response, if any.
    pub fn auth_failure(&self) -> Option<u16> {
        self.polls.iter().find_map(|p| match p.result {
            Err(SyncError::Auth(status)) => Some(status),
            _ => None,
        })
    }
}

/// Progress of the first commit query, which pages through the whole graph
/// window before switching to today-only queries.
#[derive(Debug, Clone)]
struct Backfill {
    page: u32,
    fetched: usize,
    counts: BTreeMap<NaiveDate, u32>,
    seen: HashSet<String>,
}

impl Backfill {
    fn new() -> Self {
        Self {
            page: 1,
            fetched: 0,
            counts: BTreeMap::new(),
            seen: HashSet::new(),
        }
    }
}

/// Keeps the contribution graph and event cursors in step with GitHub.
pub struct GitHubSyncEngine {
    api: GitHubApi,
    username: String,
    repositories: Vec<Repository>,
    intervals: PollIntervals,
    scheduler: SyncScheduler,
    pull_requests: PullRequestCursor,
    comments: CommentCursor,
    graph: ContributionGraph,
    commit_since: Option<NaiveDate>,
    backfill: Option<Backfill>,
    ttl: chrono::Duration,
}

impl GitHubSyncEngine {
    /// Starts with an empty graph for `now`'s day and cursors at
    /// `now - ttl`.
    pub fn new(
        api: GitHubApi,
        device: &DeviceConfig,
        notifications: &NotificationConfig,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if device.repositories.is_empty() {
            bail!("No repositories to monitor");
        }
        if device.github_username.trim().is_empty() {
            bail!("GitHub username is not set");
        }

        let ttl = notifications.ttl();
        let initial = now.checked_sub_signed(ttl).unwrap_or(now);

        Ok(Self {
            api,
            username: device.github_username.clone(),
            repositories: device.repositories.clone(),
            intervals: device.intervals,
            scheduler: SyncScheduler::new(&device.intervals, now),
            pull_requests: PullRequestCursor::new(initial),
            comments: CommentCursor::new(&device.repositories, initial),
            graph: ContributionGraph::new(now.date_naive()),
            commit_since: None,
            backfill: Some(Backfill::new()),
            ttl,
        })
    }

    pub fn graph(&self) -> &ContributionGraph {
        &self.graph
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn pull_request_cursor(&self) -> &PullRequestCursor {
        &self.pull_requests
    }

    pub fn comment_cursor(&self) -> &CommentCursor {
        &self.comments
    }

    /// Whether the graph window is still being filled page by page.
    pub fn is_backfilling(&self) -> bool {
        self.backfill.is_some()
    }

    /// Rolls the graph over to `now`'s day. Returns the columns evicted.
    pub fn refresh_calendar(&mut self, now: DateTime<Utc>) -> usize {
        let shifted = self.graph.advance_to(now.date_naive());
        if shifted > 0 {
            info!("Contribution graph advanced {shifted} week(s)");
        }
        shifted
    }

    /// Whether some signal is due and the budget would let it through.
    pub fn is_any_due(&self, now: DateTime<Utc>, limiter: &RateLimiter) -> bool {
        self.scheduler
            .due_signals(now)
            .into_iter()
            .any(|signal| limiter.can_poll(signal, now))
    }

    /// Recomputes intervals for the hour and the current quota pressure.
    fn prepare(&mut self, now: DateTime<Utc>, limiter: &mut RateLimiter) {
        self.refresh_calendar(now);
        self.scheduler.refresh_bases(&self.intervals, now);
        let multiplier = limiter.update_backoff(self.scheduler.demand_per_hour(), now);
        self.scheduler.set_multiplier(multiplier);
    }

    /// Issues one request per due signal that the limiter admits, in
    /// [`Signal::ALL`] order. Each permission check sees the quota spent by
    /// the signals before it. Denied signals stay due for the next tick.
    pub async fn fetch(&mut self, now: DateTime<Utc>, limiter: &mut RateLimiter) -> SyncBatch {
        self.prepare(now, limiter);

        let mut batch = SyncBatch::default();
        for signal in self.scheduler.due_signals(now) {
            if !limiter.can_poll(signal, now) {
                continue;
            }

            let poll = match signal {
                Signal::Commits => {
                    let (since, page) = match (&self.backfill, self.commit_since) {
                        (Some(backfill), _) => (self.graph.window_start(), backfill.page),
                        (None, Some(since)) => (since, 1),
                        (None, None) => (self.graph.window_start(), 1),
                    };
                    let result = match self.api.commit_search_url(&self.username, &self.repositories, since, page) {
                        Ok(url) => self
                            .api
                            .get_json(&url, limiter, now)
                            .await
                            .map(|results| Payload::Commits { since, page, results }),
                        Err(e) => Err(e),
                    };
                    SignalPoll {
                        signal,
                        target: None,
                        result,
                    }
                }
                Signal::PullRequests => {
                    let since = self.pull_requests.updated_since();
                    let result = match self.api.pull_request_search_url(&self.repositories, since) {
                        Ok(url) => self
                            .api
                            .get_json(&url, limiter, now)
                            .await
                            .map(Payload::PullRequests),
                        Err(e) => Err(e),
                    };
                    SignalPoll {
                        signal,
                        target: None,
                        result,
                    }
                }
                Signal::ReviewComments => {
                    let Some((repository, since)) = self.comments.next() else {
                        continue;
                    };
                    let repository = repository.clone();
                    let result = match self.api.review_comments_url(&repository, since) {
                        Ok(url) => self.api.get_json(&url, limiter, now).await.map(|comments| {
                            Payload::ReviewComments {
                                repository: repository.clone(),
                                comments,
                            }
                        }),
                        Err(e) => Err(e),
                    };
                    SignalPoll {
                        signal,
                        target: Some(repository),
                        result,
                    }
                }
            };
            batch.polls.push(poll);
        }
        batch
    }

    /// Folds a batch into the graph and cursors and returns the events it
    /// produced. Failed signals keep their cursors and retry soon.
    pub fn apply(&mut self, batch: SyncBatch, now: DateTime<Utc>) -> Vec<NotificationEvent> {
        let mut events = Vec::new();

        for poll in batch.polls {
            match poll.result {
                Ok(payload) => {
                    if self.apply_payload(payload, now, &mut events) {
                        self.scheduler.mark_success(poll.signal, now);
                    } else {
                        self.scheduler.mark_partial(poll.signal, now);
                    }
                }
                Err(e) => {
                    if let Some(repository) = &poll.target {
                        self.comments.skip(repository);
                    }
                    match e {
                        SyncError::Auth(_) => {
                            error!("GitHub rejected the token while polling {}: {e}", poll.signal);
                            self.scheduler.mark_failure(poll.signal, now);
                        }
                        SyncError::QuotaExceeded { retry_at: Some(until) } => {
                            warn!("Polling {} is rate limited until {until}", poll.signal);
                            self.scheduler.hold_until(poll.signal, until, now);
                        }
                        _ => {
                            warn!("Polling {} failed: {e}", poll.signal);
                            self.scheduler.mark_failure(poll.signal, now);
                        }
                    }
                }
            }
        }

        events
    }

    /// `fetch` followed by `apply`.
    pub async fn poll(&mut self, now: DateTime<Utc>, limiter: &mut RateLimiter) -> Vec<NotificationEvent> {
        let batch = self.fetch(now, limiter).await;
        self.apply(batch, now)
    }

    /// Returns `false` when the signal has more pages to fetch.
    fn apply_payload(&mut self, payload: Payload, now: DateTime<Utc>, events: &mut Vec<NotificationEvent>) -> bool {
        match payload {
            Payload::Commits { since, page, results } => {
                if self.backfill.is_some() {
                    return self.absorb_backfill_page(page, &results, now);
                }
                let changed = self.tally_commits(since, &results, now);
                debug!(
                    "Commit search since {since}: {} item(s) of {}, {changed} day(s) changed",
                    results.items.len(),
                    results.total_count
                );
                self.commit_since = Some(now.date_naive());
            }
            Payload::PullRequests(page) => {
                if page.incomplete_results {
                    debug!("Pull request search returned incomplete results");
                }
                for transition in self.pull_requests.observe(&page.items) {
                    info!(
                        "{}#{} is now {:?}",
                        transition.repository, transition.number, transition.state
                    );
                    events.push(NotificationEvent::new(
                        transition.state.event_kind(),
                        transition.repository,
                        transition.number,
                        transition.at,
                        self.ttl,
                    ));
                }
            }
            Payload::ReviewComments {
                repository,
                comments,
            } => {
                for comment in self.comments.observe(&repository, &comments) {
                    info!("New review comment on {}#{}", comment.repository, comment.pull_number);
                    events.push(NotificationEvent::new(
                        EventKind::ReviewComment,
                        comment.repository,
                        comment.pull_number,
                        comment.at,
                        self.ttl,
                    ));
                }
            }
        }
        true
    }

    /// Adds one backfill page to the running per-day totals. Commits are
    /// keyed by SHA so results shifting between pages are not counted twice.
    fn absorb_backfill_page(&mut self, page: u32, results: &SearchResponse<CommitItem>, now: DateTime<Utc>) -> bool {
        let Some(backfill) = self.backfill.as_mut() else {
            return true;
        };

        let mut touched = BTreeSet::new();
        for item in &results.items {
            if !backfill.seen.insert(item.sha.clone()) {
                continue;
            }
            if let Some(day) = item.day() {
                *backfill.counts.entry(day).or_default() += 1;
                touched.insert(day);
            }
        }
        backfill.fetched += results.items.len();
        for day in touched {
            if let Some(count) = backfill.counts.get(&day) {
                self.graph.record(day, *count, now);
            }
        }

        let total = usize::try_from(results.total_count).unwrap_or(usize::MAX);
        let last_page = results.items.len() < SEARCH_PAGE_SIZE
            || backfill.fetched >= total
            || backfill.fetched >= SEARCH_RESULT_CAP;
        if !last_page {
            debug!("Commit backfill page {page}: {} of {total} fetched", backfill.fetched);
            backfill.page = page + 1;
            return false;
        }

        if total > SEARCH_RESULT_CAP {
            warn!("Commit history has {total} results, only the newest {SEARCH_RESULT_CAP} are counted");
        }
        info!(
            "Commit backfill finished: {} commit(s) over {page} page(s)",
            backfill.seen.len()
        );
        self.backfill = None;
        self.commit_since = Some(now.date_naive());
        true
    }

    /// Counts commits per day and raises the graph cells. A single-day query
    /// trusts `total_count` when the page was truncated.
    fn tally_commits(&mut self, since: NaiveDate, page: &SearchResponse<CommitItem>, now: DateTime<Utc>) -> usize {
        let mut per_day: BTreeMap<NaiveDate, u32> = BTreeMap::new();
        for item in &page.items {
            if let Some(day) = item.day() {
                *per_day.entry(day).or_default() += 1;
            }
        }

        let today = now.date_naive();
        let truncated = u64::try_from(page.items.len()).unwrap_or(u64::MAX) < page.total_count;
        if since == today && truncated {
            per_day.insert(today, u32::try_from(page.total_count).unwrap_or(u32::MAX));
        }

        let mut changed = 0;
        for (day, count) in per_day {
            if self.graph.record(day, count, now) {
                changed += 1;
            }
        }
        changed
    }
}
