//! Request quota tracking and adaptive polling backoff.
//!
//! The limiter keeps a rolling log of its own calls and combines it with the
//! quota the server reports in `x-ratelimit-*` headers. The smaller of the two
//! wins, so the device stays under the ceiling even if the server stops
//! reporting or the clocks disagree.
//!
//! GitHub bills search endpoints to their own bucket. That bucket is tracked
//! separately and only gates the signals that query it.

use std::{collections::VecDeque, fmt};

use chrono::{DateTime, Duration, TimeZone, Utc};
use log::{debug, warn};

use crate::{config::RateLimitConfig, http::HttpResponse, sync::Signal};

/// Largest backoff multiplier.
pub const MAX_BACKOFF: u32 = 64;

/// Server-side quota bucket a request is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiResource {
    Core,
    Search,
}

impl ApiResource {
    /// Maps an `x-ratelimit-resource` value. Buckets the device never uses
    /// map to `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "core" => Some(ApiResource::Core),
            "search" => Some(ApiResource::Search),
            _ => None,
        }
    }

    /// Bucket for a request path; everything under `/search/` is billed
    /// separately.
    pub fn for_path(path: &str) -> Self {
        if path.contains("/search/") || path.starts_with("search/") {
            ApiResource::Search
        } else {
            ApiResource::Core
        }
    }
}

impl fmt::Display for ApiResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ApiResource::Core => "core",
            ApiResource::Search => "search",
        })
    }
}

/// Quota reported by the server with a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaInfo {
    pub limit: Option<u32>,
    pub remaining: u32,
    pub reset: Option<DateTime<Utc>>,
    pub resource: Option<String>,
}

impl QuotaInfo {
    /// Extracts quota headers; `None` when `x-ratelimit-remaining` is absent.
    pub fn from_headers(response: &HttpResponse) -> Option<Self> {
        let remaining = response
            .header("x-ratelimit-remaining")?
            .trim()
            .parse()
            .ok()?;

        Some(Self {
            limit: response
                .header("x-ratelimit-limit")
                .and_then(|v| v.trim().parse().ok()),
            remaining,
            reset: response
                .header("x-ratelimit-reset")
                .and_then(|v| v.trim().parse::<i64>().ok())
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            resource: response.header("x-ratelimit-resource").map(str::to_string),
        })
    }

    /// Bucket this quota describes. Responses without a resource header are
    /// charged to `fallback`.
    pub fn bucket(&self, fallback: ApiResource) -> Option<ApiResource> {
        match self.resource.as_deref() {
            Some(name) => ApiResource::from_name(name),
            None => Some(fallback),
        }
    }
}

/// Snapshot of the request budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub remaining: u32,
    pub reset_at: Option<DateTime<Utc>>,
    pub backoff_multiplier: u32,
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    settings: RateLimitConfig,
    calls: VecDeque<DateTime<Utc>>,
    core: Option<QuotaInfo>,
    search: Option<QuotaInfo>,
    backoff_multiplier: u32,
}

impl RateLimiter {
    pub fn new(settings: RateLimitConfig) -> Self {
        Self {
            settings,
            calls: VecDeque::new(),
            core: None,
            search: None,
            backoff_multiplier: 1,
        }
    }

    pub fn settings(&self) -> &RateLimitConfig {
        &self.settings
    }

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.settings.window())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn calls_in_window(&self, now: DateTime<Utc>) -> u32 {
        let start = self.window_start(now);
        let count = self.calls.iter().filter(|t| **t > start).count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    fn local_remaining(&self, now: DateTime<Utc>) -> u32 {
        self.settings
            .ceiling
            .saturating_sub(self.calls_in_window(now).saturating_mul(self.settings.call_cost))
    }

    fn server_quota(&self, resource: ApiResource) -> Option<&QuotaInfo> {
        match resource {
            ApiResource::Core => self.core.as_ref(),
            ApiResource::Search => self.search.as_ref(),
        }
    }

    fn server_quota_mut(&mut self, resource: ApiResource) -> &mut Option<QuotaInfo> {
        match resource {
            ApiResource::Core => &mut self.core,
            ApiResource::Search => &mut self.search,
        }
    }

    /// Server quota for `resource`, as long as its reset time has not passed.
    fn live_server_quota(&self, resource: ApiResource, now: DateTime<Utc>) -> Option<&QuotaInfo> {
        self.server_quota(resource)
            .filter(|q| q.reset.is_none_or(|reset| reset > now))
    }

    /// Requests that can still be made in the current window.
    pub fn remaining(&self, now: DateTime<Utc>) -> u32 {
        let local = self.local_remaining(now);
        match self.live_server_quota(ApiResource::Core, now) {
            Some(server) => local.min(server.remaining),
            None => local,
        }
    }

    /// Last reported quota left in a secondary bucket such as search.
    pub fn server_remaining(&self, resource: ApiResource, now: DateTime<Utc>) -> Option<u32> {
        self.live_server_quota(resource, now).map(|q| q.remaining)
    }

    /// When the server says `resource` refills, if that is still ahead.
    pub fn server_reset(&self, resource: ApiResource, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.live_server_quota(resource, now).and_then(|q| q.reset)
    }

    /// When the budget is expected to recover.
    pub fn reset_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(reset) = self.server_reset(ApiResource::Core, now) {
            return Some(reset);
        }
        let start = self.window_start(now);
        self.calls
            .iter()
            .find(|t| **t > start)
            .and_then(|oldest| oldest.checked_add_signed(self.settings.window()))
    }

    pub fn budget(&self, now: DateTime<Utc>) -> RateBudget {
        RateBudget {
            remaining: self.remaining(now),
            reset_at: self.reset_at(now),
            backoff_multiplier: self.backoff_multiplier,
        }
    }

    pub const fn backoff_multiplier(&self) -> u32 {
        self.backoff_multiplier
    }

    /// Whether one call for `signal` fits the budget while keeping that
    /// signal's share of the safety margin in reserve. Signals billed to a
    /// secondary bucket also need that bucket to have room.
    pub fn can_poll(&self, signal: Signal, now: DateTime<Utc>) -> bool {
        let remaining = self.remaining(now);
        let cost = self.settings.call_cost;
        let reserve = self
            .settings
            .safety_margin
            .saturating_mul(signal.reserve_factor());

        if remaining < cost || remaining - cost < reserve {
            debug!("Quota denies {signal} poll: {remaining} remaining, reserve {reserve}");
            return false;
        }

        let resource = signal.resource();
        if resource != ApiResource::Core {
            if let Some(left) = self.server_remaining(resource, now).filter(|left| *left < cost) {
                debug!("Quota denies {signal} poll: {left} {resource} request(s) remaining");
                return false;
            }
        }
        true
    }

    /// Records one outbound call charged to `resource`. Calls that failed
    /// before a response arrived are recorded with `None` and still count.
    pub fn record_call(&mut self, resource: ApiResource, quota: Option<&QuotaInfo>, now: DateTime<Utc>) {
        let start = self.window_start(now);
        while self.calls.front().is_some_and(|t| *t <= start) {
            self.calls.pop_front();
        }
        self.calls.push_back(now);

        let reported = quota.and_then(|q| q.bucket(resource).map(|bucket| (bucket, q)));
        match reported {
            Some((bucket, quota)) => {
                if let Some(limit) = quota.limit.filter(|_| bucket == ApiResource::Core) {
                    if limit < self.settings.ceiling {
                        debug!("Server limit {limit} is below configured ceiling");
                    }
                }
                if quota.remaining == 0 {
                    warn!("GitHub {bucket} quota exhausted until {:?}", quota.reset);
                }
                *self.server_quota_mut(bucket) = Some(quota.clone());
            }
            None => {
                let cost = self.settings.call_cost;
                if let Some(server) = self.server_quota_mut(resource).as_mut() {
                    server.remaining = server.remaining.saturating_sub(cost);
                }
            }
        }
    }

    /// Recomputes the backoff multiplier from the expected call rate.
    ///
    /// `M = next_power_of_two(ceil(demand / safe_rate))`, clamped to
    /// `1..=MAX_BACKOFF`, where `safe_rate` spreads the budget above the
    /// safety margin over the time left until reset.
    pub fn update_backoff(&mut self, demand_per_hour: f64, now: DateTime<Utc>) -> u32 {
        let multiplier = self.compute_backoff(demand_per_hour, now);
        if multiplier != self.backoff_multiplier {
            warn!(
                "Polling backoff changed from x{} to x{} ({} requests remaining)",
                self.backoff_multiplier,
                multiplier,
                self.remaining(now)
            );
            self.backoff_multiplier = multiplier;
        }
        multiplier
    }

    fn compute_backoff(&self, demand_per_hour: f64, now: DateTime<Utc>) -> u32 {
        if demand_per_hour <= 0.0 {
            return 1;
        }

        let usable = self.remaining(now).saturating_sub(self.settings.safety_margin);
        if usable == 0 {
            return MAX_BACKOFF;
        }

        let until_reset = self
            .reset_at(now)
            .map(|reset| reset - now)
            .unwrap_or_else(|| self.settings.window())
            .max(Duration::minutes(1));
        let hours = until_reset.num_seconds() as f64 / 3600.0;
        let safe_rate = f64::from(usable) / hours;

        let ratio = (demand_per_hour / safe_rate).ceil();
        if ratio <= 1.0 {
            return 1;
        }
        if ratio >= f64::from(MAX_BACKOFF) {
            return MAX_BACKOFF;
        }
        (ratio as u32).next_power_of_two().min(MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn settings(ceiling: u32, margin: u32) -> RateLimitConfig {
        RateLimitConfig {
            ceiling,
            window_secs: 3600,
            safety_margin: margin,
            call_cost: 1,
        }
    }

    fn quota(remaining: u32, reset: DateTime<Utc>) -> QuotaInfo {
        QuotaInfo {
            limit: Some(5000),
            remaining,
            reset: Some(reset),
            resource: Some("core".into()),
        }
    }

    #[test]
    fn quota_parsed_from_headers() {
        let response = HttpResponse::new(200, "[]")
            .with_header("X-RateLimit-Limit", "5000")
            .with_header("X-RateLimit-Remaining", "4321")
            .with_header("X-RateLimit-Reset", "1714568400")
            .with_header("X-RateLimit-Resource", "core");

        let info = QuotaInfo::from_headers(&response).unwrap();
        assert_eq!(info.limit, Some(5000));
        assert_eq!(info.remaining, 4321);
        assert_eq!(info.reset, Utc.timestamp_opt(1_714_568_400, 0).single());
        assert_eq!(info.bucket(ApiResource::Search), Some(ApiResource::Core));
    }

    #[test]
    fn resource_buckets() {
        assert_eq!(ApiResource::for_path("/search/commits"), ApiResource::Search);
        assert_eq!(ApiResource::for_path("/v3/search/issues"), ApiResource::Search);
        assert_eq!(ApiResource::for_path("/repos/octocat/hello/pulls/comments"), ApiResource::Core);
        assert_eq!(ApiResource::from_name("graphql"), None);
        assert_eq!(Signal::Commits.resource(), ApiResource::Search);
        assert_eq!(Signal::ReviewComments.resource(), ApiResource::Core);
    }

    #[test]
    fn quota_absent_without_remaining_header() {
        let response = HttpResponse::new(200, "[]").with_header("x-ratelimit-limit", "5000");
        assert_eq!(QuotaInfo::from_headers(&response), None);
    }

    #[test]
    fn fresh_limiter_allows_every_signal() {
        let limiter = RateLimiter::new(settings(5000, 100));
        for signal in Signal::ALL {
            assert!(limiter.can_poll(signal, t0()));
        }
        assert_eq!(limiter.remaining(t0()), 5000);
        assert_eq!(limiter.reset_at(t0()), None);
    }

    #[test]
    fn exhausted_server_quota_blocks_until_reset() {
        let mut limiter = RateLimiter::new(settings(5000, 100));
        let reset = t0() + Duration::minutes(10);
        limiter.record_call(ApiResource::Core, Some(&quota(0, reset)), t0());

        for minute in [0, 5, 9] {
            let now = t0() + Duration::minutes(minute);
            for signal in Signal::ALL {
                assert!(!limiter.can_poll(signal, now), "{signal} at +{minute}m");
            }
        }

        let after = reset + Duration::seconds(1);
        for signal in Signal::ALL {
            assert!(limiter.can_poll(signal, after));
        }
    }

    #[test]
    fn reserve_denies_commits_before_pull_requests() {
        let mut limiter = RateLimiter::new(settings(5000, 100));
        let reset = t0() + Duration::minutes(30);
        limiter.record_call(ApiResource::Core, Some(&quota(250, reset)), t0());

        assert!(!limiter.can_poll(Signal::Commits, t0()));
        assert!(limiter.can_poll(Signal::ReviewComments, t0()));
        assert!(limiter.can_poll(Signal::PullRequests, t0()));
    }

    #[test]
    fn calls_without_headers_decrement_server_estimate() {
        let mut limiter = RateLimiter::new(settings(5000, 0));
        let reset = t0() + Duration::minutes(30);
        limiter.record_call(ApiResource::Core, Some(&quota(3, reset)), t0());
        limiter.record_call(ApiResource::Core, None, t0() + Duration::seconds(1));
        limiter.record_call(ApiResource::Core, None, t0() + Duration::seconds(2));

        assert_eq!(limiter.remaining(t0() + Duration::seconds(3)), 1);
    }

    #[test]
    fn exhausted_search_quota_only_blocks_search_signals() {
        let mut limiter = RateLimiter::new(settings(5000, 100));
        let reset = t0() + Duration::minutes(10);
        let mut search = quota(0, reset);
        search.limit = Some(30);
        search.resource = Some("search".into());
        limiter.record_call(ApiResource::Search, Some(&search), t0());

        let later = t0() + Duration::minutes(5);
        assert_eq!(limiter.remaining(later), 4999);
        assert!(!limiter.can_poll(Signal::Commits, later));
        assert!(!limiter.can_poll(Signal::PullRequests, later));
        assert!(limiter.can_poll(Signal::ReviewComments, later));
        assert_eq!(limiter.server_reset(ApiResource::Search, later), Some(reset));

        assert!(limiter.can_poll(Signal::PullRequests, reset + Duration::seconds(1)));
    }

    #[test]
    fn unreported_search_calls_spend_the_search_estimate() {
        let mut limiter = RateLimiter::new(settings(5000, 0));
        let mut search = quota(2, t0() + Duration::minutes(1));
        search.resource = Some("search".into());
        limiter.record_call(ApiResource::Search, Some(&search), t0());
        limiter.record_call(ApiResource::Search, None, t0() + Duration::seconds(1));
        limiter.record_call(ApiResource::Search, None, t0() + Duration::seconds(2));

        assert_eq!(limiter.server_remaining(ApiResource::Search, t0()), Some(0));
        assert!(!limiter.can_poll(Signal::PullRequests, t0() + Duration::seconds(3)));
        assert_eq!(limiter.remaining(t0() + Duration::seconds(3)), 4997);
    }

    #[test]
    fn unknown_buckets_are_ignored() {
        let mut limiter = RateLimiter::new(settings(5000, 100));
        let mut graphql = quota(0, t0() + Duration::minutes(1));
        graphql.resource = Some("graphql".into());
        limiter.record_call(ApiResource::Core, Some(&graphql), t0());

        assert_eq!(limiter.remaining(t0()), 4999);
        assert!(limiter.can_poll(Signal::PullRequests, t0()));
    }

    #[test]
    fn local_log_expires_after_window() {
        let mut limiter = RateLimiter::new(settings(3, 0));
        for i in 0..3 {
            limiter.record_call(ApiResource::Core, None, t0() + Duration::seconds(i));
        }
        assert!(!limiter.can_poll(Signal::PullRequests, t0() + Duration::seconds(10)));
        assert_eq!(
            limiter.reset_at(t0() + Duration::seconds(10)),
            Some(t0() + Duration::hours(1))
        );

        let later = t0() + Duration::hours(1) + Duration::seconds(1);
        assert!(limiter.can_poll(Signal::PullRequests, later));
    }

    #[test]
    fn backoff_is_one_under_normal_load() {
        let mut limiter = RateLimiter::new(settings(5000, 100));
        // 4 commit polls + 30 PR polls + 60 comment polls per hour
        assert_eq!(limiter.update_backoff(94.0, t0()), 1);
        assert_eq!(limiter.budget(t0()).backoff_multiplier, 1);
    }

    #[test]
    fn backoff_widens_with_quota_pressure() {
        let mut limiter = RateLimiter::new(settings(5000, 100));
        let reset = t0() + Duration::hours(1);
        limiter.record_call(ApiResource::Core, Some(&quota(130, reset)), t0());

        // 30 usable requests for the next hour against a demand of 94
        assert_eq!(limiter.update_backoff(94.0, t0()), 4);

        limiter.record_call(ApiResource::Core, Some(&quota(100, reset)), t0());
        assert_eq!(limiter.update_backoff(94.0, t0()), MAX_BACKOFF);
    }

    #[test]
    fn backoff_relaxes_after_reset() {
        let mut limiter = RateLimiter::new(settings(5000, 100));
        let reset = t0() + Duration::minutes(5);
        limiter.record_call(ApiResource::Core, Some(&quota(0, reset)), t0());
        assert_eq!(limiter.update_backoff(94.0, t0()), MAX_BACKOFF);

        assert_eq!(limiter.update_backoff(94.0, reset + Duration::seconds(1)), 1);
    }

    proptest! {
        #[test]
        fn rolling_window_never_exceeds_ceiling(
            ceiling in 1u32..40,
            margin in 0u32..5,
            gaps in prop::collection::vec(0i64..400, 1..300),
        ) {
            prop_assume!(margin < ceiling);
            let mut limiter = RateLimiter::new(RateLimitConfig {
                ceiling,
                window_secs: 3600,
                safety_margin: margin,
                call_cost: 1,
            });

            let mut now = t0();
            let mut made: Vec<DateTime<Utc>> = Vec::new();
            for (i, gap) in gaps.iter().enumerate() {
                now += Duration::seconds(*gap);
                let signal = Signal::ALL[i % 3];
                if limiter.can_poll(signal, now) {
                    limiter.record_call(ApiResource::Core, None, now);
                    made.push(now);
                }
            }

            for (i, start) in made.iter().enumerate() {
                let end = *start + Duration::hours(1);
                let in_window = made[i..].iter().take_while(|t| **t < end).count();
                prop_assert!(in_window as u32 <= ceiling);
            }
        }

        #[test]
        fn backoff_is_monotonic_in_remaining(low in 0u32..5000, extra in 0u32..5000) {
            let reset = t0() + Duration::minutes(30);
            let mut scarce = RateLimiter::new(settings(5000, 100));
            scarce.record_call(ApiResource::Core, Some(&quota(low, reset)), t0());
            let mut plenty = RateLimiter::new(settings(5000, 100));
            plenty.record_call(ApiResource::Core, Some(&quota(low.saturating_add(extra).min(5000), reset)), t0());

            prop_assert!(scarce.update_backoff(200.0, t0()) >= plenty.update_backoff(200.0, t0()));
        }
    }
}
