//! Admission pipeline.
//!
//! Every request passes three gates in order: rate windows against the fast
//! store, calendar quotas against the ledger, and the org credit pool. The
//! first gate to deny wins and nothing is counted; only a fully admitted
//! request increments counters and spends credits.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MeteringConfig;
use crate::counter::WindowCounter;
use crate::error::Error;
use crate::ledger::{Ledger, UsageEvent};
use crate::quota::{CreditDecision, QuotaDecision, QuotaEnforcer};
use crate::rate_limit::{RateLimitDecision, RateLimitHeaders, RateLimiter, WindowStatus};
use crate::sync::ConsistencySync;
use crate::tier::{LimitsTable, TierResolver, UNLIMITED};
use crate::window::WindowKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    RateLimitMinute,
    RateLimitHour,
    RateLimitDay,
    QuotaDaily,
    QuotaMonthly,
    CreditExhausted,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::RateLimitMinute => "RATE_LIMIT_MINUTE",
            DenyReason::RateLimitHour => "RATE_LIMIT_HOUR",
            DenyReason::RateLimitDay => "RATE_LIMIT_DAY",
            DenyReason::QuotaDaily => "QUOTA_DAILY",
            DenyReason::QuotaMonthly => "QUOTA_MONTHLY",
            DenyReason::CreditExhausted => "CREDIT_EXHAUSTED",
        }
    }

    /// Status string written to the usage event ledger for audited denials.
    pub fn event_status(&self) -> &'static str {
        match self {
            DenyReason::RateLimitMinute => "denied:rate_limit_minute",
            DenyReason::RateLimitHour => "denied:rate_limit_hour",
            DenyReason::RateLimitDay => "denied:rate_limit_day",
            DenyReason::QuotaDaily => "denied:quota_daily",
            DenyReason::QuotaMonthly => "denied:quota_monthly",
            DenyReason::CreditExhausted => "denied:credit_exhausted",
        }
    }

    fn for_rate_window(kind: WindowKind) -> DenyReason {
        match kind {
            WindowKind::Minute => DenyReason::RateLimitMinute,
            WindowKind::Hour => DenyReason::RateLimitHour,
            _ => DenyReason::RateLimitDay,
        }
    }

    fn for_quota_window(kind: WindowKind) -> DenyReason {
        match kind {
            WindowKind::Month => DenyReason::QuotaMonthly,
            _ => DenyReason::QuotaDaily,
        }
    }
}

/// A metered request presented to the gate.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub identity: String,
    pub org_id: Option<String>,
    pub endpoint: String,
    pub tokens_used: i64,
    /// Credit cost of this request, deducted from the org pool on admit.
    pub cost_credits: i64,
    /// Deduplicates credit spends across retries of the same request.
    pub request_id: String,
}

#[derive(Debug, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
    /// Window fields describe the denying window on deny, or the tightest
    /// checked window on allow. Absent for fully uncapped tiers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u32>,
    /// Credit pool balance after this request. `-1` for uncapped pools,
    /// absent for identities that are not credit metered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credits_remaining: Option<i64>,
    /// Set when a store outage forced a rate window to be skipped.
    pub degraded: bool,
}

impl AdmissionDecision {
    fn allow(tightest: Option<WindowStatus>, degraded: bool) -> Self {
        AdmissionDecision {
            allowed: true,
            reason: None,
            window: tightest.map(|s| s.kind),
            limit: tightest.map(|s| s.limit),
            used: tightest.map(|s| s.used),
            remaining: tightest.map(|s| s.remaining),
            reset_at: tightest.map(|s| s.reset_at),
            retry_after: None,
            credits_remaining: None,
            degraded,
        }
    }

    fn deny_window(reason: DenyReason, status: WindowStatus, degraded: bool) -> Self {
        AdmissionDecision {
            allowed: false,
            reason: Some(reason),
            window: Some(status.kind),
            limit: Some(status.limit),
            used: Some(status.used),
            remaining: Some(status.remaining),
            reset_at: Some(status.reset_at),
            retry_after: status.retry_after,
            credits_remaining: None,
            degraded,
        }
    }

    /// Credit denials carry the pool balance and no retry hint; the pool
    /// refills on allocation change, not on a clock boundary.
    fn deny_credits(remaining: i64) -> Self {
        AdmissionDecision {
            allowed: false,
            reason: Some(DenyReason::CreditExhausted),
            window: None,
            limit: None,
            used: None,
            remaining: None,
            reset_at: None,
            retry_after: None,
            credits_remaining: Some(remaining),
            degraded: false,
        }
    }

    pub fn headers(&self) -> HeaderMap {
        match (self.limit, self.remaining, self.reset_at) {
            (Some(limit), Some(remaining), Some(reset_at)) => RateLimitHeaders {
                limit,
                remaining: remaining.max(0),
                reset: reset_at.timestamp().max(0) as u64,
                retry_after: self.retry_after,
            }
            .to_header_map(),
            _ => HeaderMap::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct GateMetrics {
    pub admitted: std::sync::atomic::AtomicU64,
    pub denied: std::sync::atomic::AtomicU64,
    pub errors: std::sync::atomic::AtomicU64,
}

impl GateMetrics {
    fn record_admitted(&self) {
        self.admitted
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn record_denied(&self) {
        self.denied
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

pub struct AdmissionGate {
    resolver: Arc<dyn TierResolver>,
    limits: LimitsTable,
    rate_limiter: RateLimiter,
    quota: QuotaEnforcer,
    sync: Arc<ConsistencySync>,
    counter: Arc<WindowCounter>,
    ledger: Arc<dyn Ledger>,
    audit_credit_denials: bool,
    audit_rate_denials: bool,
    pub metrics: Arc<GateMetrics>,
}

impl AdmissionGate {
    pub fn new(
        config: &MeteringConfig,
        resolver: Arc<dyn TierResolver>,
        counter: Arc<WindowCounter>,
        ledger: Arc<dyn Ledger>,
    ) -> Result<Self, Error> {
        let limits = config.limits_table()?;
        let rate_limiter =
            RateLimiter::new(counter.clone(), ledger.clone(), config.durable_timeout());
        let quota = QuotaEnforcer::new(
            ledger.clone(),
            config.durable_timeout(),
            config.credit_cache_capacity,
            config.credit_cache_ttl(),
        );
        let sync = Arc::new(ConsistencySync::new(
            ledger.clone(),
            counter.clone(),
            config.durable_timeout(),
            config.retry_queue_capacity,
            config.retry_flush_interval(),
            config.retry_max_attempts,
        ));
        Ok(AdmissionGate {
            resolver,
            limits,
            rate_limiter,
            quota,
            sync,
            counter,
            ledger,
            audit_credit_denials: config.audit_credit_denials,
            audit_rate_denials: config.audit_rate_denials,
            metrics: Arc::new(GateMetrics::default()),
        })
    }

    /// Background consistency machinery, exposed so the host can spawn the
    /// sweeper and drain the retry queue on shutdown.
    pub fn sync(&self) -> Arc<ConsistencySync> {
        self.sync.clone()
    }

    pub async fn check_and_admit(&self, request: &AdmissionRequest) -> Result<AdmissionDecision, Error> {
        self.check_and_admit_at(request, Utc::now()).await
    }

    /// Runs the full pipeline at an explicit instant.
    ///
    /// Rate and quota checks only read; counters are incremented after every
    /// gate has passed, so a denied request leaves no trace in any window.
    /// The credit gate is the exception: its check is the deduct itself,
    /// which is what makes the last credit race safe.
    pub async fn check_and_admit_at(
        &self,
        request: &AdmissionRequest,
        now: DateTime<Utc>,
    ) -> Result<AdmissionDecision, Error> {
        let tier = match self.resolver.resolve_tier(&request.identity).await {
            Ok(tier) => tier,
            Err(e) => {
                self.metrics.record_error();
                return Err(e);
            }
        };
        let limits = self.limits.limits_for(tier);

        let (rate_tightest, degraded) =
            match self.rate_limiter.check(&request.identity, &limits, now).await {
                RateLimitDecision::Allow { tightest, degraded } => (tightest, degraded),
                RateLimitDecision::Deny { status, degraded } => {
                    let reason = DenyReason::for_rate_window(status.kind);
                    self.deny(request, reason, now).await;
                    return Ok(AdmissionDecision::deny_window(reason, status, degraded));
                }
            };

        let quota_tightest = match self.quota.check_quota(&request.identity, &limits, now).await {
            Ok(QuotaDecision::Allow { tightest }) => tightest,
            Ok(QuotaDecision::Deny { status }) => {
                let reason = DenyReason::for_quota_window(status.kind);
                self.deny(request, reason, now).await;
                return Ok(AdmissionDecision::deny_window(reason, status, degraded));
            }
            Err(e) => {
                self.metrics.record_error();
                return Err(e);
            }
        };

        let mut credits_remaining = None;
        if request.org_id.is_some() && tier.is_unlimited() {
            // Unlimited tiers are never blocked, not even by their org's
            // pool; their usage is settled off-pool by billing.
            credits_remaining = Some(UNLIMITED);
        } else if let Some(org_id) = &request.org_id {
            let decision = self
                .quota
                .check_credits(
                    org_id,
                    &request.identity,
                    request.cost_credits,
                    &request.request_id,
                    now,
                )
                .await;
            match decision {
                Ok(CreditDecision::Granted { remaining }) => {
                    credits_remaining = Some(remaining);
                }
                Ok(CreditDecision::Exhausted { remaining }) => {
                    self.deny(request, DenyReason::CreditExhausted, now).await;
                    return Ok(AdmissionDecision::deny_credits(remaining));
                }
                Ok(CreditDecision::NotMetered) => {}
                Err(e) => {
                    self.metrics.record_error();
                    return Err(e);
                }
            }
        }

        self.metrics.record_admitted();
        self.sync
            .record_admission(
                UsageEvent::admitted(
                    &request.identity,
                    request.org_id.as_deref(),
                    &request.endpoint,
                    request.tokens_used,
                    request.cost_credits,
                    now,
                ),
                now,
            )
            .await;

        let tightest = match (rate_tightest, quota_tightest) {
            (Some(rate), Some(quota)) => {
                Some(if quota.remaining < rate.remaining { quota } else { rate })
            }
            (rate, quota) => rate.or(quota),
        };
        let mut decision = AdmissionDecision::allow(tightest, degraded);
        decision.credits_remaining = credits_remaining;
        debug!(
            identity = %request.identity,
            tier = tier.as_str(),
            "Request admitted"
        );
        Ok(decision)
    }

    /// Clears the identity's daily and monthly consumption and zeroes the
    /// org's credit spend for the current period. Rate windows and history
    /// are left alone.
    pub async fn reset_quota(
        &self,
        identity: &str,
        org_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.ledger.reset_quota(identity, org_id, now).await?;
        // The ledger reset is committed at this point. Fast counters are
        // best-effort; a failed clear converges at the next sweep.
        for kind in [WindowKind::Day, WindowKind::Month] {
            if let Err(e) = self.counter.clear(identity, kind, now).await {
                warn!(
                    identity,
                    window = kind.as_str(),
                    "Quota reset could not clear fast counter: {e}"
                );
            }
        }
        if let Some(org_id) = org_id {
            self.quota.invalidate_allocation(org_id).await;
        }
        Ok(())
    }

    async fn deny(&self, request: &AdmissionRequest, reason: DenyReason, now: DateTime<Utc>) {
        self.metrics.record_denied();
        let audited = match reason {
            DenyReason::CreditExhausted => self.audit_credit_denials,
            _ => self.audit_rate_denials,
        };
        if audited {
            self.sync
                .record_event(UsageEvent::with_status(
                    &request.identity,
                    request.org_id.as_deref(),
                    &request.endpoint,
                    request.tokens_used,
                    0,
                    reason.event_status(),
                    now,
                ))
                .await;
        }
        debug!(
            identity = %request.identity,
            reason = reason.as_str(),
            "Request denied"
        );
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_deny_reason_wire_format() {
        let json = serde_json::to_string(&DenyReason::RateLimitMinute).unwrap();
        assert_eq!(json, "\"RATE_LIMIT_MINUTE\"");
        let back: DenyReason = serde_json::from_str("\"CREDIT_EXHAUSTED\"").unwrap();
        assert_eq!(back, DenyReason::CreditExhausted);
    }

    #[test]
    fn test_denied_decision_headers() {
        let status = WindowStatus {
            kind: WindowKind::Minute,
            limit: 5,
            used: 5,
            remaining: 0,
            reset_at: Utc.with_ymd_and_hms(2025, 3, 10, 14, 31, 0).unwrap(),
            retry_after: Some(48),
        };
        let decision =
            AdmissionDecision::deny_window(DenyReason::RateLimitMinute, status, false);
        let headers = decision.headers();
        assert_eq!(headers.get("X-RateLimit-Limit").unwrap(), "5");
        assert_eq!(headers.get("Retry-After").unwrap(), "48");
    }

    #[test]
    fn test_credit_denial_has_no_window_fields() {
        let decision = AdmissionDecision::deny_credits(20);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenyReason::CreditExhausted));
        assert_eq!(decision.credits_remaining, Some(20));
        assert!(decision.retry_after.is_none());
        assert!(decision.headers().is_empty());
    }
}
