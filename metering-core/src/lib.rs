//! Usage metering core for API gateways.
//!
//! Composes three enforcement layers behind a single [`AdmissionGate`]:
//! fixed-window rate limits over a fast counter store, calendar quotas over
//! a durable ledger, and a shared per-org credit pool with an atomic
//! conditional deduct. A background [`ConsistencySync`] keeps the two
//! stores converged after outages.

pub mod admission; // admission pipeline and deny reasons
pub mod cache; // moka wrapper for cached lookups
pub mod config;
pub mod counter; // fast store window counters
pub mod error; // error handling
pub mod ledger; // durable usage ledger
pub mod quota; // calendar quotas and credit pool
pub mod rate_limit; // fixed-window rate limiting
pub mod sync; // dual-store consistency
pub mod tier; // tiers and their limits
pub mod window; // fixed window arithmetic

pub use admission::{AdmissionDecision, AdmissionGate, AdmissionRequest, DenyReason};
pub use config::MeteringConfig;
pub use counter::{CounterStore, WindowCounter};
pub use error::{Error, ErrorDetails};
pub use ledger::{DeductOutcome, Ledger, UsageEvent};
pub use quota::QuotaEnforcer;
pub use rate_limit::RateLimiter;
pub use sync::ConsistencySync;
pub use tier::{Tier, TierLimits, TierResolver, UNLIMITED};
pub use window::WindowKind;
