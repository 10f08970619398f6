use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::Error;
use crate::ledger::{CreditAllocation, DeductOutcome, Ledger, UsageEvent, WindowRow};
use crate::tier::UNLIMITED;
use crate::window::WindowKind;

#[derive(Debug, Default)]
struct State {
    windows: HashMap<(String, WindowKind, DateTime<Utc>), i64>,
    events: Vec<UsageEvent>,
    allocations: Vec<CreditAllocation>,
    deduction_keys: HashSet<String>,
}

/// In-process ledger for embedded deployments and tests.
///
/// A single mutex stands in for the database's row-level atomicity: the
/// conditional credit deduct holds the lock across check and update, which
/// gives the same one-winner guarantee as the SQL conditional UPDATE.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace an allocation row (the billing collaborator's
    /// side of the contract).
    pub async fn set_allocation(&self, allocation: CreditAllocation) {
        let mut state = self.state.lock().await;
        state
            .allocations
            .retain(|a| !(a.org_id == allocation.org_id && a.period_start == allocation.period_start));
        state.allocations.push(allocation);
    }

    /// Snapshot of the audit trail, oldest first.
    pub async fn events(&self) -> Vec<UsageEvent> {
        self.state.lock().await.events.clone()
    }

    pub async fn allocation(&self, org_id: &str, now: DateTime<Utc>) -> Option<CreditAllocation> {
        self.state
            .lock()
            .await
            .allocations
            .iter()
            .find(|a| a.org_id == org_id && a.period_start <= now && now < a.period_end)
            .cloned()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn upsert_window(
        &self,
        identity: &str,
        kind: WindowKind,
        window_start: DateTime<Utc>,
        delta: i64,
    ) -> Result<i64, Error> {
        let mut state = self.state.lock().await;
        let count = state
            .windows
            .entry((identity.to_string(), kind, window_start))
            .or_insert(0);
        *count += delta;
        Ok(*count)
    }

    async fn window_count(
        &self,
        identity: &str,
        kind: WindowKind,
        window_start: DateTime<Utc>,
    ) -> Result<i64, Error> {
        let state = self.state.lock().await;
        Ok(state
            .windows
            .get(&(identity.to_string(), kind, window_start))
            .copied()
            .unwrap_or(0))
    }

    async fn active_windows(&self, now: DateTime<Utc>) -> Result<Vec<WindowRow>, Error> {
        let state = self.state.lock().await;
        Ok(state
            .windows
            .iter()
            .filter(|((_, kind, start), _)| *start <= now && now < kind.end_of(*start))
            .map(|((identity, kind, start), count)| WindowRow {
                identity: identity.clone(),
                kind: *kind,
                window_start: *start,
                count: *count,
                expires_at: kind.end_of(*start),
            })
            .collect())
    }

    async fn record_event(&self, event: &UsageEvent) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.events.push(event.clone());
        Ok(())
    }

    async fn credit_allocation(
        &self,
        org_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CreditAllocation>, Error> {
        Ok(self.allocation(org_id, now).await)
    }

    async fn deduct_credits(
        &self,
        org_id: &str,
        user_id: &str,
        amount: i64,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> Result<DeductOutcome, Error> {
        let _ = user_id;
        let mut guard = self.state.lock().await;
        let State {
            allocations,
            deduction_keys,
            ..
        } = &mut *guard;

        let Some(allocation) = allocations
            .iter_mut()
            .find(|a| a.org_id == org_id && a.period_start <= now && now < a.period_end)
        else {
            return Ok(DeductOutcome::NoAllocation);
        };

        if allocation.allocated_credits == UNLIMITED {
            return Ok(DeductOutcome::Deducted { remaining: UNLIMITED });
        }

        let remaining = allocation.allocated_credits - allocation.used_credits;
        if deduction_keys.contains(idempotency_key) {
            // Replayed deduct: already applied, report without spending.
            return Ok(DeductOutcome::Deducted { remaining });
        }

        if allocation.used_credits + amount <= allocation.allocated_credits {
            allocation.used_credits += amount;
            let remaining = allocation.allocated_credits - allocation.used_credits;
            deduction_keys.insert(idempotency_key.to_string());
            Ok(DeductOutcome::Deducted { remaining })
        } else {
            Ok(DeductOutcome::InsufficientCredit { remaining })
        }
    }

    async fn reset_quota(
        &self,
        identity: &str,
        org_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().await;

        for kind in [WindowKind::Day, WindowKind::Month] {
            let start = kind.truncate(now);
            state.windows.remove(&(identity.to_string(), kind, start));
        }

        if let Some(org_id) = org_id {
            if let Some(allocation) = state
                .allocations
                .iter_mut()
                .find(|a| a.org_id == org_id && a.period_start <= now && now < a.period_end)
            {
                allocation.used_credits = 0;
            }
        }
        Ok(())
    }

    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let mut state = self.state.lock().await;
        let before = state.events.len();
        state.events.retain(|e| e.created_at >= cutoff);
        Ok((before - state.events.len()) as u64)
    }
}
