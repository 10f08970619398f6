use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::window::WindowKind;

/// Sentinel meaning "no cap" for any limit field.
pub const UNLIMITED: i64 = -1;

/// Plan tier supplied by the external identity provider.
///
/// The set is closed: an unknown tier string is a configuration error, never
/// a silent fallback to some default plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Trial,
    Starter,
    Professional,
    Enterprise,
    /// Manual operator override; behaves like enterprise but is
    /// distinguishable in audit rows.
    UnlimitedOverride,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Trial => "trial",
            Tier::Starter => "starter",
            Tier::Professional => "professional",
            Tier::Enterprise => "enterprise",
            Tier::UnlimitedOverride => "unlimited_override",
        }
    }

    /// Tiers that can never be blocked skip the quota ledger entirely.
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Tier::Enterprise | Tier::UnlimitedOverride)
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "trial" => Ok(Tier::Trial),
            "starter" => Ok(Tier::Starter),
            "professional" => Ok(Tier::Professional),
            "enterprise" => Ok(Tier::Enterprise),
            "unlimited_override" => Ok(Tier::UnlimitedOverride),
            other => Err(Error::new(ErrorDetails::InvalidTier {
                value: other.to_string(),
            })),
        }
    }
}

/// Caps carried by a tier. `-1` disables the corresponding check.
///
/// `per_*` fields bound rate windows; `daily`/`monthly` bound calendar
/// quotas read from the durable ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub per_minute: i64,
    pub per_hour: i64,
    pub per_day: i64,
    pub daily: i64,
    pub monthly: i64,
}

impl TierLimits {
    pub const fn unlimited() -> Self {
        TierLimits {
            per_minute: UNLIMITED,
            per_hour: UNLIMITED,
            per_day: UNLIMITED,
            daily: UNLIMITED,
            monthly: UNLIMITED,
        }
    }

    /// Cap for a rate window. `Month` has no per-window rate cap; callers
    /// iterate `WindowKind::RATE` so this arm is unreachable in practice.
    pub fn rate_limit_for(&self, kind: WindowKind) -> i64 {
        match kind {
            WindowKind::Minute => self.per_minute,
            WindowKind::Hour => self.per_hour,
            WindowKind::Day => self.per_day,
            WindowKind::Month => UNLIMITED,
        }
    }

    fn validate_field(name: &str, value: i64) -> Result<(), Error> {
        if value == 0 || value < UNLIMITED {
            return Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "Invalid tier limit {name}={value}: must be positive or -1 (unlimited)"
                ),
            }));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Error> {
        Self::validate_field("per_minute", self.per_minute)?;
        Self::validate_field("per_hour", self.per_hour)?;
        Self::validate_field("per_day", self.per_day)?;
        Self::validate_field("daily", self.daily)?;
        Self::validate_field("monthly", self.monthly)?;
        Ok(())
    }
}

const TRIAL_LIMITS: TierLimits = TierLimits {
    per_minute: 5,
    per_hour: 100,
    per_day: 500,
    daily: 500,
    monthly: 5_000,
};

const STARTER_LIMITS: TierLimits = TierLimits {
    per_minute: 60,
    per_hour: 1_000,
    per_day: 10_000,
    daily: 10_000,
    monthly: 100_000,
};

const PROFESSIONAL_LIMITS: TierLimits = TierLimits {
    per_minute: 600,
    per_hour: 10_000,
    per_day: 100_000,
    daily: 100_000,
    monthly: 2_000_000,
};

/// Per-tier limits, validated once at construction.
///
/// Overrides come from configuration; tiers without an override use the
/// built-in table. There is deliberately no entry for "unknown".
#[derive(Debug, Clone, Default)]
pub struct LimitsTable {
    overrides: HashMap<Tier, TierLimits>,
}

impl LimitsTable {
    pub fn new(overrides: HashMap<Tier, TierLimits>) -> Result<Self, Error> {
        for (tier, limits) in &overrides {
            limits.validate().map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Invalid limits override for tier {}: {e}", tier.as_str()),
                })
            })?;
        }
        Ok(LimitsTable { overrides })
    }

    pub fn limits_for(&self, tier: Tier) -> TierLimits {
        if let Some(limits) = self.overrides.get(&tier) {
            return *limits;
        }
        match tier {
            Tier::Trial => TRIAL_LIMITS,
            Tier::Starter => STARTER_LIMITS,
            Tier::Professional => PROFESSIONAL_LIMITS,
            Tier::Enterprise | Tier::UnlimitedOverride => TierLimits::unlimited(),
        }
    }
}

/// Seam to the external auth/session collaborator.
///
/// Called once per request; the result is not cached across requests
/// because a tier can change between them.
#[async_trait]
pub trait TierResolver: Send + Sync {
    async fn resolve_tier(&self, identity: &str) -> Result<Tier, Error>;
}

/// Fixed identity -> tier mapping for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticTierResolver {
    tiers: dashmap::DashMap<String, Tier>,
}

impl StaticTierResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tier(&self, identity: impl Into<String>, tier: Tier) {
        self.tiers.insert(identity.into(), tier);
    }
}

#[async_trait]
impl TierResolver for StaticTierResolver {
    async fn resolve_tier(&self, identity: &str) -> Result<Tier, Error> {
        self.tiers
            .get(identity)
            .map(|entry| *entry.value())
            .ok_or_else(|| {
                Error::new(ErrorDetails::TierResolution {
                    identity: identity.to_string(),
                    message: "identity not registered".to_string(),
                })
            })
    }
}
