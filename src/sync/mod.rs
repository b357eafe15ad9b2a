//! GitHub synchronisation: scheduled, budgeted polling of three signals.

pub mod cursor;
pub mod engine;
pub mod error;
pub mod github;
pub mod scheduler;

use std::fmt;

use crate::rate_limiter::ApiResource;

pub use engine::{GitHubSyncEngine, SyncBatch};
pub use error::SyncError;

/// The independently scheduled data sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Commits,
    PullRequests,
    ReviewComments,
}

impl Signal {
    /// Poll order within a tick.
    pub const ALL: [Signal; 3] = [Signal::Commits, Signal::PullRequests, Signal::ReviewComments];

    /// Multiple of the safety margin that must remain after a call. Signals
    /// with a larger reserve are denied first when quota runs low.
    pub const fn reserve_factor(self) -> u32 {
        match self {
            Signal::Commits => 3,
            Signal::ReviewComments => 2,
            Signal::PullRequests => 1,
        }
    }

    /// Quota bucket the signal's query is billed to.
    pub const fn resource(self) -> ApiResource {
        match self {
            Signal::Commits | Signal::PullRequests => ApiResource::Search,
            Signal::ReviewComments => ApiResource::Core,
        }
    }

    /// Exponent applied to the backoff multiplier for this signal.
    pub const fn backoff_share(self) -> f64 {
        match self {
            Signal::Commits => 1.0,
            Signal::ReviewComments => 0.5,
            Signal::PullRequests => 0.25,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Commits => "commits",
            Signal::PullRequests => "pull requests",
            Signal::ReviewComments => "review comments",
        };
        f.write_str(name)
    }
}
