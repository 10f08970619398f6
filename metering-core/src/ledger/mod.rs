pub mod memory;
pub mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PostgresLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::tier::UNLIMITED;
use crate::window::WindowKind;

/// Durable counter row mirroring a fast-store window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRow {
    pub identity: String,
    pub kind: WindowKind,
    pub window_start: DateTime<Utc>,
    pub count: i64,
    pub expires_at: DateTime<Utc>,
}

/// Shared credit pool for an organization's billing period.
///
/// `allocated_credits` is written by the external billing collaborator;
/// `used_credits` is mutated only through [`Ledger::deduct_credits`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditAllocation {
    pub org_id: String,
    pub user_id: String,
    /// Minor units; -1 means unlimited.
    pub allocated_credits: i64,
    pub used_credits: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl CreditAllocation {
    pub fn remaining(&self) -> i64 {
        if self.allocated_credits == UNLIMITED {
            UNLIMITED
        } else {
            self.allocated_credits - self.used_credits
        }
    }
}

/// Event status recorded in the audit trail.
pub const EVENT_ADMITTED: &str = "admitted";
pub const EVENT_DENIED_CREDIT: &str = "denied:credit_exhausted";

/// Append-only audit record, one per admitted (or explicitly denied) call.
/// Never updated or deleted by normal operation; deletion only through the
/// retention purge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: Uuid,
    pub identity: String,
    pub org_id: Option<String>,
    pub endpoint: String,
    pub tokens_used: i64,
    pub cost_minor_units: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl UsageEvent {
    pub fn admitted(
        identity: &str,
        org_id: Option<&str>,
        endpoint: &str,
        tokens_used: i64,
        cost_minor_units: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self::with_status(
            identity,
            org_id,
            endpoint,
            tokens_used,
            cost_minor_units,
            EVENT_ADMITTED,
            created_at,
        )
    }

    pub fn with_status(
        identity: &str,
        org_id: Option<&str>,
        endpoint: &str,
        tokens_used: i64,
        cost_minor_units: i64,
        status: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        UsageEvent {
            id: Uuid::now_v7(),
            identity: identity.to_string(),
            org_id: org_id.map(str::to_string),
            endpoint: endpoint.to_string(),
            tokens_used,
            cost_minor_units,
            status: status.to_string(),
            created_at,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Result of an atomic credit deduction.
///
/// `InsufficientCredit` is a decision, distinct by construction from the
/// connectivity errors that surface as `Err(Error)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeductOutcome {
    Deducted { remaining: i64 },
    InsufficientCredit { remaining: i64 },
    /// The org has no allocation row for the period; credit accounting
    /// does not apply to it.
    NoAllocation,
}

/// Authoritative, crash-durable record of usage counters, audit events, and
/// credit pools. The correctness backstop when the fast store is degraded
/// and the ground truth for billing reconciliation.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Idempotent insert-or-increment of a window counter row. Concurrent
    /// callers racing to create the same window never produce duplicate
    /// rows or lost increments. Returns the post-update count.
    async fn upsert_window(
        &self,
        identity: &str,
        kind: WindowKind,
        window_start: DateTime<Utc>,
        delta: i64,
    ) -> Result<i64, Error>;

    /// Current durable count for a window; zero if the row does not exist.
    async fn window_count(
        &self,
        identity: &str,
        kind: WindowKind,
        window_start: DateTime<Utc>,
    ) -> Result<i64, Error>;

    /// Window rows still live at `now`, for the reconciliation sweep.
    async fn active_windows(&self, now: DateTime<Utc>) -> Result<Vec<WindowRow>, Error>;

    /// Append one audit row.
    async fn record_event(&self, event: &UsageEvent) -> Result<(), Error>;

    /// The allocation covering `now` for an org, if any.
    async fn credit_allocation(
        &self,
        org_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CreditAllocation>, Error>;

    /// Atomic conditional spend against the org's current-period pool:
    /// `used_credits += amount` only when the result stays within
    /// `allocated_credits` (or the allocation is unlimited). A replayed
    /// `idempotency_key` reports success without spending again.
    async fn deduct_credits(
        &self,
        org_id: &str,
        user_id: &str,
        amount: i64,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> Result<DeductOutcome, Error>;

    /// Zero the current period's counters for `identity` and, when given,
    /// the org's current-period `used_credits`. Historical UsageEvent rows
    /// are never touched.
    async fn reset_quota(
        &self,
        identity: &str,
        org_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Retention purge: delete audit rows older than `cutoff`. Returns the
    /// number of rows removed.
    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error>;
}
