//! Per-signal polling schedule.
//!
//! One [`ScheduledSignal`] per [`Signal`], evaluated in [`Signal::ALL`] order
//! every tick. The backoff multiplier from the rate limiter widens each
//! signal's interval by `multiplier ^ share`, so pull requests slow down
//! least and commits most.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::device_config::PollIntervals;

use super::Signal;

/// Upper bound on the retry delay after a failed poll.
pub const FAILURE_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledSignal {
    pub signal: Signal,
    pub base_interval: Duration,
    pub next_due: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl ScheduledSignal {
    fn new(signal: Signal, base_interval: Duration) -> Self {
        Self {
            signal,
            base_interval,
            next_due: None,
            last_success: None,
            consecutive_failures: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncScheduler {
    entries: Vec<ScheduledSignal>,
    multiplier: u32,
}

fn base_interval(intervals: &PollIntervals, signal: Signal, now: DateTime<Utc>) -> Duration {
    match signal {
        Signal::Commits => intervals.commits(),
        Signal::PullRequests => intervals.pull_requests(),
        Signal::ReviewComments => intervals.review_comments(now),
    }
}

fn add(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl SyncScheduler {
    /// Every signal starts out due.
    pub fn new(intervals: &PollIntervals, now: DateTime<Utc>) -> Self {
        Self {
            entries: Signal::ALL
                .iter()
                .map(|s| ScheduledSignal::new(*s, base_interval(intervals, *s, now)))
                .collect(),
            multiplier: 1,
        }
    }

    /// Re-reads base intervals; the review cadence depends on the hour.
    pub fn refresh_bases(&mut self, intervals: &PollIntervals, now: DateTime<Utc>) {
        for entry in &mut self.entries {
            entry.base_interval = base_interval(intervals, entry.signal, now);
        }
    }

    pub fn set_multiplier(&mut self, multiplier: u32) {
        self.multiplier = multiplier.max(1);
    }

    pub const fn multiplier(&self) -> u32 {
        self.multiplier
    }

    pub fn entry(&self, signal: Signal) -> Option<&ScheduledSignal> {
        self.entries.iter().find(|e| e.signal == signal)
    }

    fn entry_mut(&mut self, signal: Signal) -> Option<&mut ScheduledSignal> {
        self.entries.iter_mut().find(|e| e.signal == signal)
    }

    /// Base interval stretched by the current backoff.
    pub fn effective_interval(&self, signal: Signal) -> Duration {
        let Some(entry) = self.entry(signal) else {
            return Duration::ZERO;
        };
        if self.multiplier <= 1 {
            return entry.base_interval;
        }
        let factor = f64::from(self.multiplier).powf(signal.backoff_share());
        Duration::from_secs_f64((entry.base_interval.as_secs_f64() * factor).round())
    }

    pub fn is_due(&self, signal: Signal, now: DateTime<Utc>) -> bool {
        self.entry(signal)
            .is_some_and(|e| e.next_due.is_none_or(|due| now >= due))
    }

    /// Due signals in poll order.
    pub fn due_signals(&self, now: DateTime<Utc>) -> Vec<Signal> {
        Signal::ALL
            .into_iter()
            .filter(|s| self.is_due(*s, now))
            .collect()
    }

    pub fn mark_success(&mut self, signal: Signal, now: DateTime<Utc>) {
        let interval = self.effective_interval(signal);
        if let Some(entry) = self.entry_mut(signal) {
            entry.next_due = Some(add(now, interval));
            entry.last_success = Some(now);
            entry.consecutive_failures = 0;
        }
    }

    pub fn mark_failure(&mut self, signal: Signal, now: DateTime<Utc>) {
        let retry = self.effective_interval(signal).min(FAILURE_RETRY);
        if let Some(entry) = self.entry_mut(signal) {
            entry.next_due = Some(add(now, retry));
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        }
    }

    /// Rate limited: the signal waits for the quota to refill, and at least
    /// as long as an ordinary failure would.
    pub fn hold_until(&mut self, signal: Signal, until: DateTime<Utc>, now: DateTime<Utc>) {
        let retry = add(now, self.effective_interval(signal).min(FAILURE_RETRY));
        if let Some(entry) = self.entry_mut(signal) {
            entry.next_due = Some(until.max(retry));
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        }
    }

    /// The poll succeeded but has more pages to fetch; stay due.
    pub fn mark_partial(&mut self, signal: Signal, now: DateTime<Utc>) {
        if let Some(entry) = self.entry_mut(signal) {
            entry.next_due = Some(now);
            entry.last_success = Some(now);
            entry.consecutive_failures = 0;
        }
    }

    /// Polls per hour the base schedule asks for, before backoff.
    pub fn demand_per_hour(&self) -> f64 {
        self.entries
            .iter()
            .filter(|e| !e.base_interval.is_zero())
            .map(|e| 3600.0 / e.base_interval.as_secs_f64())
            .sum()
    }
}
