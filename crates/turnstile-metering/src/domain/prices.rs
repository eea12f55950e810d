//! Price definitions: the rules mapping an aggregated quantity to an amount.

use crate::domain::types::{MeterId, PriceId};
use crate::error::{MeteringError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Billing period granularity for recurring prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Daily,
    Weekly,
    Monthly,
    Annual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingModel {
    Flat,
    Package,
    Tiered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierMode {
    /// The single tier covering the quantity prices every unit.
    Volume,
    /// The quantity is split across tiers; each slice is priced by its tier.
    Slab,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityScope {
    Plan,
    Addon,
    Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceStatus {
    Draft,
    Published,
    Archived,
}

/// One tier of a tiered price. `up_to` is inclusive; `None` marks the
/// unbounded final tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTier {
    pub up_to: Option<u64>,
    pub unit_amount: Decimal,
    #[serde(default)]
    pub flat_amount: Decimal,
}

impl PriceTier {
    /// Effective inclusive upper bound for comparisons.
    pub fn bound(&self) -> u64 {
        self.up_to.unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingDirection {
    Up,
    Down,
}

/// Pre-pricing quantity transform for PACKAGE prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageTransform {
    pub divide_by: u64,
    pub round: RoundingDirection,
}

/// Minimum-spend commitment with overage pricing beyond it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commitment {
    pub amount: Decimal,
    pub overage_factor: Decimal,
    #[serde(default)]
    pub true_up_enabled: bool,
}

/// A rule mapping quantity to an amount in a currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub id: PriceId,
    /// Per-unit (or per-package) amount in major currency units.
    pub amount: Decimal,
    pub currency: String,
    pub billing_period: BillingPeriod,
    pub billing_period_count: u32,
    pub billing_model: BillingModel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier_mode: Option<TierMode>,
    #[serde(default)]
    pub tiers: Vec<PriceTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<PackageTransform>,
    /// Set when the price is usage-based.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_id: Option<MeterId>,
    pub entity_scope: EntityScope,
    /// Subscription-scoped overrides point back at the price they replace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_price_id: Option<PriceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Only meaningful for recurring fixed prices.
    #[serde(default)]
    pub trial_days: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commitment: Option<Commitment>,
    pub status: PriceStatus,
}

impl Price {
    /// Reject malformed definitions before they can reach the calculator.
    ///
    /// Tier bounds must be strictly increasing and at most one tier may be
    /// unbounded, in final position.
    pub fn validate(&self) -> Result<()> {
        if self.billing_model == BillingModel::Tiered {
            if self.tier_mode.is_none() {
                return Err(self.invalid("tiered price without a tier mode"));
            }
            if self.tiers.is_empty() {
                return Err(self.invalid("tiered price without tiers"));
            }
            let mut prev: Option<u64> = None;
            for (idx, tier) in self.tiers.iter().enumerate() {
                match tier.up_to {
                    Some(bound) => {
                        if prev.is_some_and(|p| bound <= p) {
                            return Err(self.invalid("tier upper bounds must be strictly increasing"));
                        }
                        prev = Some(bound);
                    }
                    None => {
                        if idx != self.tiers.len() - 1 {
                            return Err(self.invalid("only the last tier may be unbounded"));
                        }
                    }
                }
            }
        }
        if self.billing_model == BillingModel::Package {
            match &self.transform {
                None => return Err(self.invalid("package price without a transform")),
                Some(t) if t.divide_by == 0 => {
                    return Err(self.invalid("package transform divides by zero"))
                }
                Some(_) => {}
            }
        }
        if let Some(commitment) = &self.commitment {
            if commitment.amount < Decimal::ZERO || commitment.overage_factor < Decimal::ZERO {
                return Err(self.invalid("commitment amount and overage factor must be non-negative"));
            }
        }
        Ok(())
    }

    /// A price is usable when published and inside its validity window.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        if self.status != PriceStatus::Published {
            return false;
        }
        if self.start_date.is_some_and(|start| now < start) {
            return false;
        }
        if self.end_date.is_some_and(|end| now >= end) {
            return false;
        }
        true
    }

    fn invalid(&self, reason: &str) -> MeteringError {
        MeteringError::InvalidPrice {
            price_id: self.id.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tiered(tiers: Vec<PriceTier>) -> Price {
        Price {
            id: PriceId::new("price_1"),
            amount: Decimal::ZERO,
            currency: "USD".to_string(),
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            billing_model: BillingModel::Tiered,
            tier_mode: Some(TierMode::Volume),
            tiers,
            transform: None,
            meter_id: Some(MeterId::new("m1")),
            entity_scope: EntityScope::Plan,
            parent_price_id: None,
            start_date: None,
            end_date: None,
            trial_days: 0,
            commitment: None,
            status: PriceStatus::Published,
        }
    }

    fn tier(up_to: Option<u64>, unit: Decimal) -> PriceTier {
        PriceTier {
            up_to,
            unit_amount: unit,
            flat_amount: Decimal::ZERO,
        }
    }

    #[test]
    fn test_valid_tier_list() {
        let price = tiered(vec![
            tier(Some(100), dec!(0.10)),
            tier(Some(1000), dec!(0.08)),
            tier(None, dec!(0.05)),
        ]);
        assert!(price.validate().is_ok());
    }

    #[test]
    fn test_non_monotonic_tiers_rejected() {
        let price = tiered(vec![
            tier(Some(1000), dec!(0.10)),
            tier(Some(100), dec!(0.08)),
        ]);
        assert!(price.validate().is_err());
    }

    #[test]
    fn test_equal_bounds_rejected() {
        let price = tiered(vec![
            tier(Some(100), dec!(0.10)),
            tier(Some(100), dec!(0.08)),
        ]);
        assert!(price.validate().is_err());
    }

    #[test]
    fn test_unbounded_tier_must_be_last() {
        let price = tiered(vec![tier(None, dec!(0.10)), tier(Some(100), dec!(0.08))]);
        assert!(price.validate().is_err());
    }

    #[test]
    fn test_validity_window() {
        let mut price = tiered(vec![tier(None, dec!(0.10))]);
        let now = Utc::now();
        assert!(price.is_usable(now));

        price.end_date = Some(now);
        assert!(!price.is_usable(now));

        price.end_date = None;
        price.status = PriceStatus::Draft;
        assert!(!price.is_usable(now));
    }
}
