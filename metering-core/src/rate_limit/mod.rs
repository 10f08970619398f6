use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderValue};

use crate::window::WindowKind;

pub mod limiter;

pub use limiter::RateLimiter;

/// State of a single fixed window at check time. `used` already counts the
/// request being admitted; `remaining` is what is left after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStatus {
    pub kind: WindowKind,
    pub limit: i64,
    pub used: i64,
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
    pub retry_after: Option<u32>,
}

impl WindowStatus {
    pub fn to_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            limit: self.limit,
            remaining: self.remaining.max(0),
            reset: self.reset_at.timestamp().max(0) as u64,
            retry_after: self.retry_after,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: i64,
    pub remaining: i64,
    pub reset: u64,               // Unix timestamp
    pub retry_after: Option<u32>, // Seconds
}

impl RateLimitHeaders {
    pub fn to_header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        // These conversions are safe because we're converting numbers to strings.
        // Numbers always produce valid header values.
        if let Ok(value) = HeaderValue::from_str(&self.limit.to_string()) {
            headers.insert("X-RateLimit-Limit", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.remaining.to_string()) {
            headers.insert("X-RateLimit-Remaining", value);
        }

        if let Ok(value) = HeaderValue::from_str(&self.reset.to_string()) {
            headers.insert("X-RateLimit-Reset", value);
        }

        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                headers.insert("Retry-After", value);
            }
        }

        headers
    }
}

/// Result of a rate limit check. `tightest` is the checked window with the
/// fewest requests left, `None` when every window is uncapped. `degraded`
/// reports that at least one window was skipped because neither store could
/// answer in time.
#[derive(Debug)]
pub enum RateLimitDecision {
    Allow {
        tightest: Option<WindowStatus>,
        degraded: bool,
    },
    Deny {
        status: WindowStatus,
        degraded: bool,
    },
}

#[derive(Debug, Default)]
pub struct RateLimiterMetrics {
    pub fast_checks: std::sync::atomic::AtomicU64,
    pub durable_fallbacks: std::sync::atomic::AtomicU64,
    pub fail_open_allows: std::sync::atomic::AtomicU64,
    pub denials: std::sync::atomic::AtomicU64,
}

impl RateLimiterMetrics {
    pub fn record_fast_check(&self) {
        self.fast_checks
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_durable_fallback(&self) {
        self.durable_fallbacks
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_fail_open(&self) {
        self.fail_open_allows
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_denial(&self) {
        self.denials
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}
