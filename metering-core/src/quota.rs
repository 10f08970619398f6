use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::timeout;

use crate::cache::Cache;
use crate::error::{Error, ErrorDetails};
use crate::ledger::{DeductOutcome, Ledger};
use crate::rate_limit::WindowStatus;
use crate::tier::{TierLimits, UNLIMITED};
use crate::window::WindowKind;

/// Allocation shape kept in the fast cache. Only the dimensions that change
/// once per billing period live here; `used_credits` is always read and
/// written through the conditional update in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationShape {
    pub allocated_credits: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

#[derive(Debug)]
pub enum QuotaDecision {
    Allow { tightest: Option<WindowStatus> },
    Deny { status: WindowStatus },
}

#[derive(Debug, PartialEq, Eq)]
pub enum CreditDecision {
    Granted { remaining: i64 },
    Exhausted { remaining: i64 },
    /// No allocation row for the org's current period. Such identities are
    /// not credit metered and pass through.
    NotMetered,
}

#[derive(Debug, Default)]
pub struct QuotaMetrics {
    pub checks: std::sync::atomic::AtomicU64,
    pub quota_denials: std::sync::atomic::AtomicU64,
    pub credit_denials: std::sync::atomic::AtomicU64,
}

impl QuotaMetrics {
    pub fn record_check(&self) {
        self.checks
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_quota_denial(&self) {
        self.quota_denials
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_credit_denial(&self) {
        self.credit_denials
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Calendar quota and credit pool enforcement over the durable ledger.
///
/// Unlike rate checks these fail hard: a ledger that cannot answer inside
/// its timeout surfaces as an error rather than an allow, since letting a
/// request through here spends money.
pub struct QuotaEnforcer {
    ledger: Arc<dyn Ledger>,
    durable_timeout: Duration,
    allocation_cache: Cache<String, Option<AllocationShape>>,
    pub metrics: Arc<QuotaMetrics>,
}

impl QuotaEnforcer {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        durable_timeout: Duration,
        cache_capacity: u64,
        cache_ttl: Duration,
    ) -> Self {
        QuotaEnforcer {
            ledger,
            durable_timeout,
            allocation_cache: Cache::new(cache_capacity, cache_ttl),
            metrics: Arc::new(QuotaMetrics::default()),
        }
    }

    async fn guarded<T, F>(&self, context: &str, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        match timeout(self.durable_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorDetails::LedgerTimeout {
                context: format!(
                    "{context} exceeded {}ms",
                    self.durable_timeout.as_millis()
                ),
            })),
        }
    }

    /// Checks the daily then monthly calendar quota against the ledger.
    pub async fn check_quota(
        &self,
        identity: &str,
        limits: &TierLimits,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, Error> {
        self.metrics.record_check();
        let mut tightest: Option<WindowStatus> = None;

        for (kind, limit) in [
            (WindowKind::Day, limits.daily),
            (WindowKind::Month, limits.monthly),
        ] {
            if limit == UNLIMITED {
                continue;
            }

            let window_start = kind.truncate(now);
            let used = self
                .guarded(
                    "quota read",
                    self.ledger.window_count(identity, kind, window_start),
                )
                .await?;

            if used >= limit {
                self.metrics.record_quota_denial();
                return Ok(QuotaDecision::Deny {
                    status: WindowStatus {
                        kind,
                        limit,
                        used,
                        remaining: 0,
                        reset_at: kind.next_boundary(now),
                        retry_after: Some(kind.retry_after_seconds(now) as u32),
                    },
                });
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

        Ok(QuotaDecision::Allow { tightest })
    }

    /// Atomically spends `amount` credits from the org's shared pool.
    ///
    /// The deduct itself is the check: the conditional update in the ledger
    /// guarantees that concurrent callers racing for the last credits see
    /// exactly one winner. The cache only answers "does this org have an
    /// allocation, and is it capped"; balances are never served from cache.
    pub async fn check_credits(
        &self,
        org_id: &str,
        user_id: &str,
        amount: i64,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> Result<CreditDecision, Error> {
        let shape = self.allocation_shape(org_id, now).await?;
        let shape = match shape {
            Some(shape) if shape.period_start <= now && now < shape.period_end => shape,
            Some(_) => {
                // Cached shape belongs to an expired period. Refresh once.
                self.allocation_cache.invalidate(&org_id.to_string()).await;
                match self.allocation_shape(org_id, now).await? {
                    Some(shape) => shape,
                    None => return Ok(CreditDecision::NotMetered),
                }
            }
            None => return Ok(CreditDecision::NotMetered),
        };

        if shape.allocated_credits == UNLIMITED {
            return Ok(CreditDecision::Granted {
                remaining: UNLIMITED,
            });
        }

        let outcome = self
            .guarded(
                "credit deduct",
                self.ledger
                    .deduct_credits(org_id, user_id, amount, idempotency_key, now),
            )
            .await?;

        match outcome {
            DeductOutcome::Deducted { remaining } => Ok(CreditDecision::Granted { remaining }),
            DeductOutcome::InsufficientCredit { remaining } => {
                self.metrics.record_credit_denial();
                Ok(CreditDecision::Exhausted { remaining })
            }
            DeductOutcome::NoAllocation => Ok(CreditDecision::NotMetered),
        }
    }

    /// Drops the cached allocation shape, forcing the next check to re-read
    /// the ledger. Called after `reset_quota` and allocation changes.
    pub async fn invalidate_allocation(&self, org_id: &str) {
        self.allocation_cache.invalidate(&org_id.to_string()).await;
    }

    async fn allocation_shape(
        &self,
        org_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AllocationShape>, Error> {
        let ledger = self.ledger.clone();
        let key = org_id.to_string();
        let lookup = {
            let key = key.clone();
            async move {
                match timeout(self.durable_timeout, ledger.credit_allocation(&key, now)).await {
                    Ok(result) => Ok(result?.map(|allocation| AllocationShape {
                        allocated_credits: allocation.allocated_credits,
                        period_start: allocation.period_start,
                        period_end: allocation.period_end,
                    })),
                    Err(_) => Err(Error::new(ErrorDetails::LedgerTimeout {
                        context: format!(
                            "allocation read exceeded {}ms",
                            self.durable_timeout.as_millis()
                        ),
                    })),
                }
            }
        };
        self.allocation_cache.get_or_compute(key, lookup).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::ledger::memory::MemoryLedger;
    use crate::ledger::CreditAllocation;
    use crate::tier::{LimitsTable, Tier};

    fn march_10(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, s).unwrap()
    }

    fn march_allocation(org: &str, allocated: i64, used: i64) -> CreditAllocation {
        CreditAllocation {
            org_id: org.to_string(),
            user_id: "owner".to_string(),
            allocated_credits: allocated,
            used_credits: used,
            period_start: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            period_end: Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap(),
        }
    }

    fn enforcer(ledger: Arc<MemoryLedger>) -> QuotaEnforcer {
        QuotaEnforcer::new(ledger, Duration::from_millis(250), 100, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_daily_quota_denies_before_monthly() {
        let ledger = Arc::new(MemoryLedger::new());
        let limits = LimitsTable::default().limits_for(Tier::Trial);
        let now = march_10(12, 0, 0);

        ledger
            .upsert_window("u1", WindowKind::Day, WindowKind::Day.truncate(now), limits.daily)
            .await
            .unwrap();

        let enforcer = enforcer(ledger);
        match enforcer.check_quota("u1", &limits, now).await.unwrap() {
            QuotaDecision::Deny { status } => {
                assert_eq!(status.kind, WindowKind::Day);
                assert_eq!(status.used, limits.daily);
            }
            other => panic!("expected daily deny, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_monthly_quota_denies_when_daily_open() {
        let ledger = Arc::new(MemoryLedger::new());
        let limits = LimitsTable::default().limits_for(Tier::Trial);
        let now = march_10(12, 0, 0);

        ledger
            .upsert_window(
                "u1",
                WindowKind::Month,
                WindowKind::Month.truncate(now),
                limits.monthly,
            )
            .await
            .unwrap();

        let enforcer = enforcer(ledger);
        match enforcer.check_quota("u1", &limits, now).await.unwrap() {
            QuotaDecision::Deny { status } => assert_eq!(status.kind, WindowKind::Month),
            other => panic!("expected monthly deny, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unlimited_quota_short_circuits() {
        let ledger = Arc::new(MemoryLedger::new());
        let enforcer = enforcer(ledger);
        let decision = enforcer
            .check_quota("u1", &TierLimits::unlimited(), march_10(12, 0, 0))
            .await
            .unwrap();
        match decision {
            QuotaDecision::Allow { tightest } => assert!(tightest.is_none()),
            other => panic!("expected allow, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_credit_deduct_and_exhaustion() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.set_allocation(march_allocation("org-1", 1000, 950)).await;
        let enforcer = enforcer(ledger);
        let now = march_10(12, 0, 0);

        let first = enforcer
            .check_credits("org-1", "alice", 30, "req-1", now)
            .await
            .unwrap();
        assert_eq!(first, CreditDecision::Granted { remaining: 20 });

        let second = enforcer
            .check_credits("org-1", "bob", 30, "req-2", now)
            .await
            .unwrap();
        assert_eq!(second, CreditDecision::Exhausted { remaining: 20 });
    }

    #[tokio::test]
    async fn test_missing_allocation_is_not_metered() {
        let ledger = Arc::new(MemoryLedger::new());
        let enforcer = enforcer(ledger);
        let decision = enforcer
            .check_credits("org-none", "alice", 1, "req-1", march_10(12, 0, 0))
            .await
            .unwrap();
        assert_eq!(decision, CreditDecision::NotMetered);
    }

    #[tokio::test]
    async fn test_unlimited_allocation_never_deducts() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .set_allocation(march_allocation("org-big", UNLIMITED, 0))
            .await;
        let enforcer = enforcer(ledger.clone());
        let now = march_10(12, 0, 0);

        let decision = enforcer
            .check_credits("org-big", "alice", 10_000, "req-1", now)
            .await
            .unwrap();
        assert_eq!(decision, CreditDecision::Granted { remaining: UNLIMITED });

        let allocation = ledger.credit_allocation("org-big", now).await.unwrap().unwrap();
        assert_eq!(allocation.used_credits, 0);
    }

    #[tokio::test]
    async fn test_balance_never_served_from_cache() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.set_allocation(march_allocation("org-1", 100, 0)).await;
        let enforcer = enforcer(ledger);
        let now = march_10(12, 0, 0);

        // Warm the cache, then keep deducting. Each call must see the live
        // balance even though the shape is cached.
        for i in 0..10 {
            let decision = enforcer
                .check_credits("org-1", "alice", 10, &format!("req-{i}"), now)
                .await
                .unwrap();
            assert_eq!(decision, CreditDecision::Granted { remaining: 90 - i * 10 });
        }
        let decision = enforcer
            .check_credits("org-1", "alice", 10, "req-final", now)
            .await
            .unwrap();
        assert_eq!(decision, CreditDecision::Exhausted { remaining: 0 });
    }

    /// Ledger whose allocation reads hang past any deadline.
    struct StalledAllocationLedger {
        inner: MemoryLedger,
    }

    #[async_trait::async_trait]
    impl Ledger for StalledAllocationLedger {
        async fn upsert_window(
            &self,
            identity: &str,
            kind: WindowKind,
            window_start: DateTime<Utc>,
            delta: i64,
        ) -> Result<i64, Error> {
            self.inner.upsert_window(identity, kind, window_start, delta).await
        }

        async fn window_count(
            &self,
            identity: &str,
            kind: WindowKind,
            window_start: DateTime<Utc>,
        ) -> Result<i64, Error> {
            self.inner.window_count(identity, kind, window_start).await
        }

        async fn active_windows(
            &self,
            now: DateTime<Utc>,
        ) -> Result<Vec<crate::ledger::WindowRow>, Error> {
            self.inner.active_windows(now).await
        }

        async fn record_event(&self, event: &crate::ledger::UsageEvent) -> Result<(), Error> {
            self.inner.record_event(event).await
        }

        async fn credit_allocation(
            &self,
            _org_id: &str,
            _now: DateTime<Utc>,
        ) -> Result<Option<CreditAllocation>, Error> {
            std::future::pending().await
        }

        async fn deduct_credits(
            &self,
            org_id: &str,
            user_id: &str,
            amount: i64,
            idempotency_key: &str,
            now: DateTime<Utc>,
        ) -> Result<DeductOutcome, Error> {
            self.inner
                .deduct_credits(org_id, user_id, amount, idempotency_key, now)
                .await
        }

        async fn reset_quota(
            &self,
            identity: &str,
            org_id: Option<&str>,
            now: DateTime<Utc>,
        ) -> Result<(), Error> {
            self.inner.reset_quota(identity, org_id, now).await
        }

        async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
            self.inner.purge_events_before(cutoff).await
        }
    }

    #[tokio::test]
    async fn test_allocation_timeout_surfaces_as_ledger_timeout() {
        let ledger = Arc::new(StalledAllocationLedger {
            inner: MemoryLedger::new(),
        });
        let enforcer =
            QuotaEnforcer::new(ledger, Duration::from_millis(20), 100, Duration::from_secs(30));

        let err = enforcer
            .check_credits("org-1", "alice", 10, "req-1", march_10(12, 0, 0))
            .await
            .unwrap_err();
        // The timeout must keep its transient-infra identity through the
        // allocation cache: 503, not a generic 500.
        assert_eq!(err.status_code(), http::StatusCode::SERVICE_UNAVAILABLE);
        assert!(matches!(
            err.get_details(),
            ErrorDetails::LedgerTimeout { .. }
        ));
    }
}
