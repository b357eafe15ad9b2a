use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{http::HttpError, rate_limiter::QuotaInfo};

/// Why a poll slot failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Timeouts, connection failures and 5xx. Retried on the next slot.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The token was rejected. Needs reconfiguration.
    #[error("authentication rejected with status {0}")]
    Auth(u16),
    /// Rate limited. `retry_at` comes from `retry-after` or the quota reset.
    #[error("API quota exhausted")]
    QuotaExceeded { retry_at: Option<DateTime<Utc>> },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl SyncError {
    /// Classifies a non-success status. A 403 with no quota left, or with a
    /// `retry-after`, is a rate limit, not an authentication problem.
    pub fn from_status(status: u16, quota: Option<&QuotaInfo>, retry_after: Option<DateTime<Utc>>) -> Self {
        let exhausted = quota.is_some_and(|q| q.remaining == 0);
        let retry_at = retry_after.or_else(|| quota.filter(|q| q.remaining == 0).and_then(|q| q.reset));
        match status {
            429 => SyncError::QuotaExceeded { retry_at },
            403 if exhausted || retry_after.is_some() => SyncError::QuotaExceeded { retry_at },
            401 | 403 => SyncError::Auth(status),
            _ => SyncError::Transient(format!("unexpected status {status}")),
        }
    }

    pub const fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }
}

impl From<HttpError> for SyncError {
    fn from(error: HttpError) -> Self {
        SyncError::Transient(error.to_string())
    }
}
