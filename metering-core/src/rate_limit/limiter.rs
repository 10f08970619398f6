use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::warn;

use crate::counter::WindowCounter;
use crate::ledger::Ledger;
use crate::rate_limit::{RateLimitDecision, RateLimiterMetrics, WindowStatus};
use crate::tier::{TierLimits, UNLIMITED};
use crate::window::WindowKind;

/// Sliding tier of fixed-window rate checks over the fast store, with the
/// durable ledger as fallback when the fast store cannot answer.
///
/// `check` never returns an error: when neither store answers inside its
/// timeout the window is skipped and the decision is flagged `degraded`.
/// Counters are read here and incremented by the caller after the full
/// admission pipeline passes, so denied requests are never counted.
pub struct RateLimiter {
    counter: Arc<WindowCounter>,
    ledger: Arc<dyn Ledger>,
    durable_timeout: Duration,
    pub metrics: Arc<RateLimiterMetrics>,
}

impl RateLimiter {
    pub fn new(
        counter: Arc<WindowCounter>,
        ledger: Arc<dyn Ledger>,
        durable_timeout: Duration,
    ) -> Self {
        RateLimiter {
            counter,
            ledger,
            durable_timeout,
            metrics: Arc::new(RateLimiterMetrics::default()),
        }
    }

    /// Checks the minute, hour, and day windows in order, denying on the
    /// first exhausted one.
    pub async fn check(
        &self,
        identity: &str,
        limits: &TierLimits,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let mut degraded = false;
        let mut tightest: Option<WindowStatus> = None;

        for kind in WindowKind::RATE {
            let limit = limits.rate_limit_for(kind);
            if limit == UNLIMITED {
                continue;
            }

            let used = match self.window_used(identity, kind, now).await {
                Some(used) => used,
                None => {
                    // Fail open: a store outage must not reject traffic.
                    self.metrics.record_fail_open();
                    degraded = true;
                    continue;
                }
            };

            if used >= limit {
                self.metrics.record_denial();
                return RateLimitDecision::Deny {
                    status: WindowStatus {
                        kind,
                        limit,
                        used,
                        remaining: 0,
                        reset_at: kind.next_boundary(now),
                        retry_after: Some(kind.retry_after_seconds(now) as u32),
                    },
                    degraded,
                };
            }

            let status = WindowStatus {
                kind,
                limit,
                used: used + 1,
                remaining: limit - used - 1,
                reset_at: kind.next_boundary(now),
                retry_after: None,
            };
            let tighter = match tightest {
                Some(current) => status.remaining < current.remaining,
                None => true,
            };
            if tighter {
                tightest = Some(status);
            }
        }

        RateLimitDecision::Allow { tightest, degraded }
    }

    /// Count already admitted in the window, or `None` when neither store
    /// could answer.
    async fn window_used(
        &self,
        identity: &str,
        kind: WindowKind,
        now: DateTime<Utc>,
    ) -> Option<i64> {
        match self.counter.current(identity, kind, now).await {
            Ok(count) => {
                self.metrics.record_fast_check();
                return Some(count.unwrap_or(0));
            }
            Err(e) => {
                warn!(
                    identity,
                    window = kind.as_str(),
                    "Fast store unavailable for rate check, falling back to ledger: {e}"
                );
            }
        }

        let window_start = kind.truncate(now);
        match timeout(
            self.durable_timeout,
            self.ledger.window_count(identity, kind, window_start),
        )
        .await
        {
            Ok(Ok(count)) => {
                self.metrics.record_durable_fallback();
                Some(count)
            }
            Ok(Err(e)) => {
                warn!(
                    identity,
                    window = kind.as_str(),
                    "Ledger fallback failed for rate check: {e}"
                );
                None
            }
            Err(_) => {
                warn!(
                    identity,
                    window = kind.as_str(),
                    "Ledger fallback timed out after {}ms",
                    self.durable_timeout.as_millis()
                );
                None
            }
        }
    }
}
