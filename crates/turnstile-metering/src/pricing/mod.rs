//! Price calculator: quantity in, money out.
//!
//! All arithmetic is full-precision [`Decimal`]; currency rounding belongs to
//! [`currency::display_amount`] and never feeds back into a computation.

pub mod currency;

use crate::domain::prices::{BillingModel, Price, RoundingDirection, TierMode};
use crate::error::{MeteringError, Result};
use rust_decimal::Decimal;

pub use currency::{display_amount, precision};

/// How one charge decomposes: what was billed at base rates, what the
/// overage factor added beyond the commitment, and any commitment true-up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostBreakdown {
    pub base_charge: Decimal,
    pub overage_charge: Decimal,
    pub true_up: Decimal,
    pub total: Decimal,
}

/// The raw charge for `quantity` units under the price's billing model,
/// before commitment handling.
pub fn calculate_cost(price: &Price, quantity: Decimal) -> Result<Decimal> {
    price.validate()?;
    if quantity < Decimal::ZERO {
        return Err(MeteringError::ComputationError {
            message: format!("negative quantity {quantity} for price {}", price.id),
        });
    }

    match price.billing_model {
        BillingModel::Flat => Ok(price.amount * quantity),
        BillingModel::Package => {
            let transform =
                price
                    .transform
                    .as_ref()
                    .ok_or_else(|| MeteringError::InvalidPrice {
                        price_id: price.id.to_string(),
                        reason: "package price without a transform".to_string(),
                    })?;
            let packages = quantity / Decimal::from(transform.divide_by);
            let packages = match transform.round {
                RoundingDirection::Up => packages.ceil(),
                RoundingDirection::Down => packages.floor(),
            };
            Ok(price.amount * packages)
        }
        BillingModel::Tiered => match price.tier_mode {
            Some(TierMode::Volume) => volume_cost(price, quantity),
            Some(TierMode::Slab) => slab_cost(price, quantity),
            None => Err(MeteringError::InvalidPrice {
                price_id: price.id.to_string(),
                reason: "tiered price without a tier mode".to_string(),
            }),
        },
    }
}

/// The single tier whose inclusive upper bound covers the quantity prices
/// every unit; its flat amount applies once.
fn volume_cost(price: &Price, quantity: Decimal) -> Result<Decimal> {
    let tier = price
        .tiers
        .iter()
        .find(|tier| quantity <= Decimal::from(tier.bound()))
        .or_else(|| price.tiers.last())
        .ok_or_else(|| MeteringError::InvalidPrice {
            price_id: price.id.to_string(),
            reason: "no tier covers the quantity".to_string(),
        })?;
    Ok(tier.unit_amount * quantity + tier.flat_amount)
}

/// The quantity is split across tiers in order; each non-empty slice pays its
/// tier's unit rate plus that tier's flat amount once.
fn slab_cost(price: &Price, quantity: Decimal) -> Result<Decimal> {
    let mut total = Decimal::ZERO;
    let mut remaining = quantity;
    let mut prev_bound = Decimal::ZERO;

    for tier in &price.tiers {
        if remaining <= Decimal::ZERO {
            break;
        }
        let capacity = Decimal::from(tier.bound()) - prev_bound;
        let slice = remaining.min(capacity);
        if slice > Decimal::ZERO {
            total += tier.unit_amount * slice + tier.flat_amount;
            remaining -= slice;
        }
        prev_bound = Decimal::from(tier.bound());
    }

    if remaining > Decimal::ZERO {
        // validate() guarantees strictly increasing bounds, so leftover
        // quantity means the last tier was bounded.
        return Err(MeteringError::InvalidPrice {
            price_id: price.id.to_string(),
            reason: format!("quantity {quantity} exceeds the final tier bound"),
        });
    }
    Ok(total)
}

/// Full charge including the price's commitment rules.
///
/// Under the commitment the charge passes through unchanged; beyond it the
/// excess is re-rated by the overage factor. When true-up is enabled,
/// unconsumed commitment is billed as its own component.
pub fn charge(price: &Price, quantity: Decimal) -> Result<CostBreakdown> {
    let cost = calculate_cost(price, quantity)?;

    let Some(commitment) = &price.commitment else {
        return Ok(CostBreakdown {
            base_charge: cost,
            overage_charge: Decimal::ZERO,
            true_up: Decimal::ZERO,
            total: cost,
        });
    };

    if cost > commitment.amount {
        let overage = (cost - commitment.amount) * commitment.overage_factor;
        Ok(CostBreakdown {
            base_charge: commitment.amount,
            overage_charge: overage,
            true_up: Decimal::ZERO,
            total: commitment.amount + overage,
        })
    } else {
        let true_up = if commitment.true_up_enabled {
            commitment.amount - cost
        } else {
            Decimal::ZERO
        };
        Ok(CostBreakdown {
            base_charge: cost,
            overage_charge: Decimal::ZERO,
            true_up,
            total: cost + true_up,
        })
    }
}
