//! Sync cursors: what has already been seen for each signal.
//!
//! Cursors start at `boot - ttl` so that events from shortly before boot
//! still reach the bar while older history never floods it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::{device_config::Repository, notification::EventKind};

use super::github::{IssueItem, ReviewComment};

/// Tracked pull requests beyond this are forgotten oldest-update first.
pub const MAX_TRACKED_PULL_REQUESTS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

impl PrState {
    pub fn of(item: &IssueItem) -> Self {
        if item.pull_request.as_ref().is_some_and(|pr| pr.merged_at.is_some()) {
            PrState::Merged
        } else if item.state == "closed" {
            PrState::Closed
        } else {
            PrState::Open
        }
    }

    pub const fn event_kind(self) -> EventKind {
        match self {
            PrState::Open => EventKind::PrOpened,
            PrState::Merged => EventKind::PrMerged,
            PrState::Closed => EventKind::PrClosed,
        }
    }

    /// When `item` entered this state.
    fn transition_time(self, item: &IssueItem) -> DateTime<Utc> {
        match self {
            PrState::Open => item.created_at,
            PrState::Merged => item
                .pull_request
                .as_ref()
                .and_then(|pr| pr.merged_at)
                .unwrap_or(item.updated_at),
            PrState::Closed => item.closed_at.unwrap_or(item.updated_at),
        }
    }
}

/// A state change worth a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrTransition {
    pub repository: Repository,
    pub number: u64,
    pub state: PrState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct TrackedPr {
    state: PrState,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PullRequestCursor {
    initial: DateTime<Utc>,
    updated_since: DateTime<Utc>,
    known: HashMap<(Repository, u64), TrackedPr>,
}

impl PullRequestCursor {
    pub fn new(initial: DateTime<Utc>) -> Self {
        Self {
            initial,
            updated_since: initial,
            known: HashMap::new(),
        }
    }

    /// Lower bound for the next `updated:>=` query.
    pub const fn updated_since(&self) -> DateTime<Utc> {
        self.updated_since
    }

    pub fn tracked(&self) -> usize {
        self.known.len()
    }

    pub fn state_of(&self, repository: &Repository, number: u64) -> Option<PrState> {
        self.known
            .get(&(repository.clone(), number))
            .map(|t| t.state)
    }

    /// Folds one successful search page into the cursor and returns the
    /// transitions it reveals, oldest first.
    pub fn observe(&mut self, items: &[IssueItem]) -> Vec<PrTransition> {
        let mut transitions = Vec::new();

        for item in items {
            let Some(repository) = item.repository() else {
                continue;
            };
            let state = PrState::of(item);
            let key = (repository.clone(), item.number);

            let changed = match self.known.get(&key) {
                Some(tracked) => tracked.state != state,
                None => state.transition_time(item) >= self.initial,
            };
            if changed {
                transitions.push(PrTransition {
                    repository,
                    number: item.number,
                    state,
                    at: state.transition_time(item),
                });
            }

            self.known.insert(
                key,
                TrackedPr {
                    state,
                    updated_at: item.updated_at,
                },
            );
            self.updated_since = self.updated_since.max(item.updated_at);
        }

        self.evict();
        transitions.sort_by_key(|t| t.at);
        transitions
    }

    fn evict(&mut self) {
        while self.known.len() > MAX_TRACKED_PULL_REQUESTS {
            let Some(oldest) = self
                .known
                .iter()
                .min_by_key(|(_, t)| t.updated_at)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            self.known.remove(&oldest);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RepositoryComments {
    since: DateTime<Utc>,
    last_id: u64,
}

/// A review comment not seen before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewComment {
    pub repository: Repository,
    pub id: u64,
    pub pull_number: u64,
    pub at: DateTime<Utc>,
}

/// Per-repository comment cursors, visited round-robin.
#[derive(Debug, Clone)]
pub struct CommentCursor {
    initial: DateTime<Utc>,
    repositories: Vec<Repository>,
    cursors: Vec<RepositoryComments>,
    next_index: usize,
}

impl CommentCursor {
    pub fn new(repositories: &[Repository], initial: DateTime<Utc>) -> Self {
        Self {
            initial,
            repositories: repositories.to_vec(),
            cursors: vec![
                RepositoryComments {
                    since: initial,
                    last_id: 0,
                };
                repositories.len()
            ],
            next_index: 0,
        }
    }

    /// Repository due for the next comment poll and its `since` bound.
    pub fn next(&self) -> Option<(&Repository, DateTime<Utc>)> {
        let repository = self.repositories.get(self.next_index)?;
        let cursor = self.cursors.get(self.next_index)?;
        Some((repository, cursor.since))
    }

    pub fn last_id(&self, repository: &Repository) -> Option<u64> {
        self.repositories
            .iter()
            .position(|r| r == repository)
            .and_then(|i| self.cursors.get(i))
            .map(|c| c.last_id)
    }

    /// Folds a successful page for `repository` in and moves the round-robin
    /// on. Returns comments newer than anything seen, oldest first.
    pub fn observe(&mut self, repository: &Repository, comments: &[ReviewComment]) -> Vec<NewComment> {
        let Some(index) = self.repositories.iter().position(|r| r == repository) else {
            return Vec::new();
        };
        let initial = self.initial;
        let cursor = &mut self.cursors[index];

        let mut fresh: Vec<NewComment> = comments
            .iter()
            .filter(|c| c.id > cursor.last_id && c.created_at >= initial)
            .map(|c| NewComment {
                repository: repository.clone(),
                id: c.id,
                pull_number: c.pull_number().unwrap_or_default(),
                at: c.created_at,
            })
            .collect();
        fresh.sort_by_key(|c| (c.at, c.id));

        for comment in comments {
            cursor.last_id = cursor.last_id.max(comment.id);
            cursor.since = cursor.since.max(comment.updated_at);
        }

        if !self.repositories.is_empty() {
            self.next_index = (index + 1) % self.repositories.len();
        }
        fresh
    }

    /// Moves on after a failed poll so one broken repository cannot starve
    /// the others. The failed repository's cursor is untouched.
    pub fn skip(&mut self, repository: &Repository) {
        if let Some(index) = self.repositories.iter().position(|r| r == repository) {
            self.next_index = (index + 1) % self.repositories.len();
        }
    }
}
