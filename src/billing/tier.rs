//! Subscription tiers, billing periods and the price catalog.
//!
//! Tier policy is fixed in code: each tier maps to a per-period token
//! allowance. Only `pro` can be bought through checkout; `starter` and
//! `unlimited` are assigned by support or legacy plans.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::BillingError;

/// Sentinel token limit meaning "no quota".
pub const UNLIMITED_TOKENS: i64 = -1;

/// Length of the rolling usage window for accounts without a provider period.
pub const DEFAULT_PERIOD_SECONDS: u64 = 30 * crate::utils::SECONDS_PER_DAY;

/// Named subscription plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Starter,
    Pro,
    Unlimited,
}

impl Tier {
    /// Tokens granted per period. [`UNLIMITED_TOKENS`] for the unlimited tier.
    #[must_use]
    pub const fn token_limit(self) -> i64 {
        match self {
            Self::Free => 10_000,
            Self::Starter => 50_000,
            Self::Pro => 250_000,
            Self::Unlimited => UNLIMITED_TOKENS,
        }
    }

    /// Whether self-serve checkout may sell this tier.
    #[must_use]
    pub const fn is_purchasable(self) -> bool {
        matches!(self, Self::Pro)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::Unlimited => "unlimited",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            "unlimited" => Ok(Self::Unlimited),
            _ => Err(BillingError::InvalidTier {
                value: s.to_string(),
            }),
        }
    }
}

/// Billing cadence of a purchasable tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Monthly,
    Yearly,
}

impl BillingPeriod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingPeriod {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monthly" => Ok(Self::Monthly),
            "yearly" => Ok(Self::Yearly),
            _ => Err(BillingError::InvalidBillingPeriod {
                value: s.to_string(),
            }),
        }
    }
}

/// Mapping between Stripe price ids and tiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceCatalog {
    pro_monthly: Option<String>,
    pro_yearly: Option<String>,
}

impl PriceCatalog {
    #[must_use]
    pub fn new(pro_monthly: Option<String>, pro_yearly: Option<String>) -> Self {
        Self {
            pro_monthly,
            pro_yearly,
        }
    }

    #[must_use]
    pub fn from_config(config: &crate::config::BillingConfig) -> Self {
        Self::new(
            config.pro_monthly_price_id.clone(),
            config.pro_yearly_price_id.clone(),
        )
    }

    /// Configured price for a purchasable tier and period.
    #[must_use]
    pub fn price_for(&self, tier: Tier, period: BillingPeriod) -> Option<&str> {
        match (tier, period) {
            (Tier::Pro, BillingPeriod::Monthly) => self.pro_monthly.as_deref(),
            (Tier::Pro, BillingPeriod::Yearly) => self.pro_yearly.as_deref(),
            _ => None,
        }
    }

    /// Tier sold under a given price id, if the price is known.
    #[must_use]
    pub fn tier_for_price(&self, price_id: &str) -> Option<Tier> {
        let known = [self.pro_monthly.as_deref(), self.pro_yearly.as_deref()];
        known
            .into_iter()
            .flatten()
            .any(|p| p == price_id)
            .then_some(Tier::Pro)
    }
}
