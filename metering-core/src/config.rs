use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::tier::{LimitsTable, Tier, TierLimits};

/// Configuration for the metering core.
///
/// Timeout policy: the fast store gets tens of milliseconds and fails open
/// for rate checks; the durable store gets low hundreds and fails hard for
/// quota/credit checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeteringConfig {
    /// Timeout for fast-store (counter) operations in milliseconds
    #[serde(default = "default_fast_store_timeout_ms")]
    pub fast_store_timeout_ms: u64,

    /// Timeout for durable-store (ledger) operations in milliseconds
    #[serde(default = "default_durable_timeout_ms")]
    pub durable_timeout_ms: u64,

    /// TTL for cached credit-allocation metadata in milliseconds
    #[serde(default = "default_credit_cache_ttl_ms")]
    pub credit_cache_ttl_ms: u64,

    /// Maximum number of cached credit-allocation entries
    #[serde(default = "default_credit_cache_capacity")]
    pub credit_cache_capacity: u64,

    /// Capacity of the bounded durable-write retry queue
    #[serde(default = "default_retry_queue_capacity")]
    pub retry_queue_capacity: usize,

    /// Interval between retry-queue flush attempts in milliseconds
    #[serde(default = "default_retry_flush_interval_ms")]
    pub retry_flush_interval_ms: u64,

    /// Attempts per queued durable write before it is dropped with an error
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Interval between reconciliation sweeps in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Record a UsageEvent for credit-exhausted denials
    #[serde(default = "default_audit_credit_denials")]
    pub audit_credit_denials: bool,

    /// Record a UsageEvent for rate-limit denials (high volume; off by default)
    #[serde(default)]
    pub audit_rate_denials: bool,

    /// Per-tier limit overrides; tiers without an entry use the built-in table
    #[serde(default)]
    pub tier_overrides: HashMap<Tier, TierLimits>,
}

fn default_fast_store_timeout_ms() -> u64 {
    50
}

fn default_durable_timeout_ms() -> u64 {
    250
}

fn default_credit_cache_ttl_ms() -> u64 {
    30_000
}

fn default_credit_cache_capacity() -> u64 {
    10_000
}

fn default_retry_queue_capacity() -> usize {
    10_000
}

fn default_retry_flush_interval_ms() -> u64 {
    1_000
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_audit_credit_denials() -> bool {
    true
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            fast_store_timeout_ms: default_fast_store_timeout_ms(),
            durable_timeout_ms: default_durable_timeout_ms(),
            credit_cache_ttl_ms: default_credit_cache_ttl_ms(),
            credit_cache_capacity: default_credit_cache_capacity(),
            retry_queue_capacity: default_retry_queue_capacity(),
            retry_flush_interval_ms: default_retry_flush_interval_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            sweep_interval_secs: default_sweep_interval_secs(),
            audit_credit_denials: default_audit_credit_denials(),
            audit_rate_denials: false,
            tier_overrides: HashMap::new(),
        }
    }
}

impl MeteringConfig {
    pub fn fast_store_timeout(&self) -> Duration {
        Duration::from_millis(self.fast_store_timeout_ms)
    }

    pub fn durable_timeout(&self) -> Duration {
        Duration::from_millis(self.durable_timeout_ms)
    }

    pub fn credit_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.credit_cache_ttl_ms)
    }

    pub fn retry_flush_interval(&self) -> Duration {
        Duration::from_millis(self.retry_flush_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Validate the tier overrides and build the limits table.
    pub fn limits_table(&self) -> Result<LimitsTable, Error> {
        LimitsTable::new(self.tier_overrides.clone())
    }
}
