//! Adaptive rate limiting for provider API calls.
//!
//! Each endpoint gets its own token bucket. After every response the bucket
//! is retuned from the server's quota headers so that the remaining quota is
//! spread evenly over what is left of the window. When the quota is
//! exhausted, no request is let through until the reset instant, after which
//! requests are paced at `limit / window` with a burst of one.
//!
//! Uses governor direct limiters, one per endpoint, held in a DashMap.
//! Governor quotas are immutable, so retuning swaps in a fresh limiter.

use crate::config::LimitsConfig;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use http::HeaderMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Header carrying the request quota for the current window.
pub const LIMIT_HEADER: &str = "x-rate-limit-limit";
/// Header carrying the requests left in the current window.
pub const REMAINING_HEADER: &str = "x-rate-limit-remaining";
/// Header carrying the window reset time, in unix seconds.
pub const RESET_HEADER: &str = "x-rate-limit-reset";

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Clone)]
struct EndpointLimit {
    limiter: Arc<DirectLimiter>,
    not_before: Option<Instant>,
    rate: f64,
}

impl EndpointLimit {
    /// One request per `period`, burst 1, optionally held until `not_before`.
    fn paced(period: Duration, not_before: Option<Instant>) -> Self {
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX))
            .allow_burst(NonZeroU32::MIN);
        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            not_before,
            rate: 1.0 / period.as_secs_f64(),
        }
    }
}

/// Quota headers of one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QuotaHeaders {
    limit: u32,
    remaining: u32,
    reset: DateTime<Utc>,
}

/// Per-endpoint limiter retuned from response headers.
pub struct AdaptiveRateLimiter {
    endpoints: DashMap<String, EndpointLimit>,
    window: Duration,
    fixed: Option<NonZeroU32>,
}

impl std::fmt::Debug for AdaptiveRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRateLimiter")
            .field("endpoints", &self.endpoints.len())
            .field("window", &self.window)
            .field("fixed", &self.fixed)
            .finish()
    }
}

impl AdaptiveRateLimiter {
    /// Create a limiter with the given quota window.
    ///
    /// `fixed`, when set, replaces the limit reported by the server.
    pub fn new(window: Duration, fixed: Option<u32>) -> Self {
        Self {
            endpoints: DashMap::new(),
            window,
            fixed: fixed.and_then(NonZeroU32::new),
        }
    }

    /// Create a limiter from configuration.
    pub fn from_config(config: &LimitsConfig) -> Self {
        Self::new(config.window(), config.fixed)
    }

    // Before any response has been seen: the fixed quota if configured,
    // otherwise one request per second.
    fn initial(&self) -> EndpointLimit {
        match self.fixed {
            Some(n) => EndpointLimit::paced(self.window / n.get(), None),
            None => EndpointLimit::paced(Duration::from_secs(1), None),
        }
    }

    fn limit_for(&self, endpoint: &str) -> EndpointLimit {
        self.endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| self.initial())
            .clone()
    }

    /// Wait for permission to call `endpoint`.
    pub async fn wait(
        &self,
        endpoint: &str,
        cancel: &CancellationToken,
    ) -> Result<(), RateLimitError> {
        let limit = self.limit_for(endpoint);

        if let Some(at) = limit.not_before {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                _ = tokio::time::sleep_until(at) => {}
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RateLimitError::Cancelled),
            _ = limit.limiter.until_ready() => Ok(()),
        }
    }

    /// Retune `endpoint` from the quota headers of its latest response.
    ///
    /// Call after every response, not only on errors. Responses without
    /// quota headers leave the limiter unchanged; malformed headers are
    /// logged and ignored.
    pub fn update(&self, endpoint: &str, headers: &HeaderMap) {
        self.update_at(endpoint, headers, Utc::now());
    }

    fn update_at(&self, endpoint: &str, headers: &HeaderMap, now: DateTime<Utc>) {
        let quota = match parse_headers(headers) {
            Ok(Some(quota)) => quota,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Ignoring rate limit headers for {}: {}", endpoint, e);
                return;
            }
        };

        let limit = self.fixed.map_or(quota.limit, NonZeroU32::get);
        let until_reset = (quota.reset - now).to_std().unwrap_or(Duration::ZERO);

        let next = if quota.remaining == 0 {
            let Some(limit) = NonZeroU32::new(limit) else {
                tracing::warn!("Ignoring zero rate limit for {}", endpoint);
                return;
            };
            EndpointLimit::paced(
                self.window / limit.get(),
                Some(Instant::now() + until_reset),
            )
        } else if until_reset.is_zero() {
            EndpointLimit::paced(self.window / limit.max(1), None)
        } else {
            EndpointLimit::paced(until_reset / quota.remaining, None)
        };

        // The response being accounted for already spent this period's
        // request, so the next one waits a full period from now. Held
        // limiters keep their token for the first request after reset.
        if next.not_before.is_none() {
            let _ = next.limiter.check();
        }

        tracing::debug!(
            "Rate limit for {}: limit={} remaining={} reset_in={:?} rate={:.3}/s",
            endpoint,
            limit,
            quota.remaining,
            until_reset,
            next.rate
        );
        self.endpoints.insert(endpoint.to_string(), next);
    }

    /// Current pace for `endpoint` in requests per second, if it has been used.
    pub fn rate_per_sec(&self, endpoint: &str) -> Option<f64> {
        self.endpoints.get(endpoint).map(|l| l.rate)
    }

    /// When `endpoint` is next allowed a request, if it is held until a reset.
    pub fn ready_at(&self, endpoint: &str) -> Option<Instant> {
        self.endpoints
            .get(endpoint)
            .and_then(|l| l.not_before)
            .filter(|at| *at > Instant::now())
    }

    /// Number of endpoints tracked.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}

fn header<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<Option<&'a str>, RateLimitError> {
    headers
        .get(name)
        .map(|v| {
            v.to_str().map_err(|_| RateLimitError::MalformedHeader {
                name,
                value: String::from_utf8_lossy(v.as_bytes()).into_owned(),
            })
        })
        .transpose()
}

fn parse_number<T: std::str::FromStr>(
    name: &'static str,
    value: &str,
) -> Result<T, RateLimitError> {
    value
        .trim()
        .parse()
        .map_err(|_| RateLimitError::MalformedHeader {
            name,
            value: value.to_string(),
        })
}

fn parse_headers(headers: &HeaderMap) -> Result<Option<QuotaHeaders>, RateLimitError> {
    let (Some(limit), Some(remaining), Some(reset)) = (
        header(headers, LIMIT_HEADER)?,
        header(headers, REMAINING_HEADER)?,
        header(headers, RESET_HEADER)?,
    ) else {
        return Ok(None);
    };

    let reset_secs: i64 = parse_number(RESET_HEADER, reset)?;
    let reset = DateTime::from_timestamp(reset_secs, 0).ok_or_else(|| {
        RateLimitError::MalformedHeader {
            name: RESET_HEADER,
            value: reset.to_string(),
        }
    })?;

    Ok(Some(QuotaHeaders {
        limit: parse_number(LIMIT_HEADER, limit)?,
        remaining: parse_number(REMAINING_HEADER, remaining)?,
        reset,
    }))
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// The wait was cancelled.
    #[error("rate limit wait cancelled")]
    Cancelled,
    /// A quota header could not be parsed.
    #[error("malformed {name} header: {value:?}")]
    MalformedHeader {
        /// Header name.
        name: &'static str,
        /// Raw header value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use http::HeaderValue;

    fn quota_headers(limit: &str, remaining: &str, reset: i64) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(LIMIT_HEADER, HeaderValue::from_str(limit).unwrap());
        headers.insert(REMAINING_HEADER, HeaderValue::from_str(remaining).unwrap());
        headers.insert(
            RESET_HEADER,
            HeaderValue::from_str(&reset.to_string()).unwrap(),
        );
        headers
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn exhausted_quota_holds_until_reset_then_paces_at_window_rate() {
        let limiter = AdaptiveRateLimiter::new(Duration::from_secs(60), None);
        let headers = quota_headers("50", "0", t0().timestamp() + 30);

        let before = Instant::now();
        limiter.update_at("/api/v1/users", &headers, t0());

        let ready = limiter.ready_at("/api/v1/users").unwrap();
        let held = ready - before;
        assert!(held >= Duration::from_secs(29), "held {held:?}");
        assert!(held <= Duration::from_secs(31), "held {held:?}");

        let rate = limiter.rate_per_sec("/api/v1/users").unwrap();
        assert!((rate - 50.0 / 60.0).abs() < 0.01, "rate {rate}");
    }

    #[test]
    fn remaining_quota_is_spread_over_window() {
        let limiter = AdaptiveRateLimiter::new(Duration::from_secs(60), None);
        let headers = quota_headers("600", "10", t0().timestamp() + 20);
        limiter.update_at("/api/v1/groups", &headers, t0());

        let rate = limiter.rate_per_sec("/api/v1/groups").unwrap();
        assert!((rate - 0.5).abs() < 0.01, "rate {rate}");
        assert!(limiter.ready_at("/api/v1/groups").is_none());
    }

    #[test]
    fn past_reset_falls_back_to_window_rate() {
        let limiter = AdaptiveRateLimiter::new(Duration::from_secs(60), None);
        let headers = quota_headers("120", "5", t0().timestamp() - 1);
        limiter.update_at("/api/v1/users", &headers, t0());
        let rate = limiter.rate_per_sec("/api/v1/users").unwrap();
        assert!((rate - 2.0).abs() < 0.01, "rate {rate}");
    }

    #[test]
    fn fixed_quota_overrides_reported_limit() {
        let limiter = AdaptiveRateLimiter::new(Duration::from_secs(60), Some(120));
        let headers = quota_headers("50", "0", t0().timestamp() + 30);
        limiter.update_at("/api/v1/users", &headers, t0());
        let rate = limiter.rate_per_sec("/api/v1/users").unwrap();
        assert!((rate - 2.0).abs() < 0.01, "rate {rate}");
    }

    #[test]
    fn missing_headers_leave_limiter_untouched() {
        let limiter = AdaptiveRateLimiter::new(Duration::from_secs(60), None);
        limiter.update_at("/api/v1/users", &HeaderMap::new(), t0());
        assert!(limiter.rate_per_sec("/api/v1/users").is_none());

        let mut partial = HeaderMap::new();
        partial.insert(LIMIT_HEADER, HeaderValue::from_static("50"));
        limiter.update_at("/api/v1/users", &partial, t0());
        assert_eq!(limiter.endpoint_count(), 0);
    }

    #[test]
    fn malformed_headers_keep_prior_setting() {
        let limiter = AdaptiveRateLimiter::new(Duration::from_secs(60), None);
        limiter.update_at(
            "/api/v1/users",
            &quota_headers("600", "10", t0().timestamp() + 20),
            t0(),
        );

        limiter.update_at(
            "/api/v1/users",
            &quota_headers("lots", "10", t0().timestamp() + 20),
            t0(),
        );
        let rate = limiter.rate_per_sec("/api/v1/users").unwrap();
        assert!((rate - 0.5).abs() < 0.01, "rate {rate}");
    }

    #[test]
    fn malformed_header_is_reported() {
        let err = parse_headers(&quota_headers("50", "-1", 0)).unwrap_err();
        assert_eq!(
            err,
            RateLimitError::MalformedHeader {
                name: REMAINING_HEADER,
                value: "-1".into()
            }
        );
    }

    #[tokio::test]
    async fn first_request_is_immediate() {
        let limiter = AdaptiveRateLimiter::new(Duration::from_secs(60), None);
        let cancel = CancellationToken::new();
        tokio::time::timeout(Duration::from_millis(500), limiter.wait("/a", &cancel))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn retuning_after_every_response_keeps_requests_paced() {
        let limiter = AdaptiveRateLimiter::new(Duration::from_secs(60), None);
        let cancel = CancellationToken::new();
        // 20 requests left over 2 seconds: one every 100ms.
        let headers = quota_headers("600", "20", t0().timestamp() + 2);

        let started = std::time::Instant::now();
        for _ in 0..4 {
            limiter.wait("/a", &cancel).await.unwrap();
            limiter.update_at("/a", &headers, t0());
        }
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_millis(290),
            "4 requests took {elapsed:?}"
        );
        assert!(elapsed < Duration::from_secs(2), "4 requests took {elapsed:?}");
    }

    #[tokio::test]
    async fn first_request_after_reset_is_not_delayed_further() {
        let limiter = AdaptiveRateLimiter::new(Duration::from_secs(60), None);
        // Quota of 1 per window: a second request inside the window would
        // wait a minute, but the held limiter keeps its token for the reset.
        let reset = Utc::now().timestamp() + 1;
        limiter.update("/a", &quota_headers("1", "0", reset));

        let cancel = CancellationToken::new();
        tokio::time::timeout(Duration::from_secs(3), limiter.wait("/a", &cancel))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn exhausted_quota_blocks_wait() {
        let limiter = AdaptiveRateLimiter::new(Duration::from_secs(60), None);
        let reset = Utc::now().timestamp() + 2;
        limiter.update("/a", &quota_headers("50", "0", reset));

        let cancel = CancellationToken::new();
        let waited =
            tokio::time::timeout(Duration::from_millis(200), limiter.wait("/a", &cancel)).await;
        assert!(waited.is_err(), "wait should still be blocked");
    }

    #[tokio::test]
    async fn cancellation_releases_wait() {
        let limiter = AdaptiveRateLimiter::new(Duration::from_secs(60), None);
        let reset = Utc::now().timestamp() + 60;
        limiter.update("/a", &quota_headers("50", "0", reset));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), limiter.wait("/a", &cancel))
            .await
            .unwrap();
        assert_eq!(result, Err(RateLimitError::Cancelled));
    }
}
