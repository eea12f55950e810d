//! Display precision per ISO 4217 currency.
//!
//! Rounding happens only at the display boundary; every intermediate
//! computation keeps full precision.

use rust_decimal::{Decimal, RoundingStrategy};

/// Minor-unit digits for a currency code.
pub fn precision(currency: &str) -> u32 {
    match currency.to_ascii_uppercase().as_str() {
        "BIF" | "CLP" | "DJF" | "GNF" | "JPY" | "KMF" | "KRW" | "MGA" | "PYG" | "RWF" | "UGX"
        | "VND" | "VUV" | "XAF" | "XOF" | "XPF" => 0,
        "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 3,
        _ => 2,
    }
}

/// Round for display in the currency's minor units.
pub fn display_amount(amount: Decimal, currency: &str) -> Decimal {
    amount.round_dp_with_strategy(precision(currency), RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_precision_by_currency() {
        assert_eq!(precision("USD"), 2);
        assert_eq!(precision("jpy"), 0);
        assert_eq!(precision("KWD"), 3);
    }

    #[test]
    fn test_display_rounding_is_half_away_from_zero() {
        assert_eq!(display_amount(dec!(1.005), "USD"), dec!(1.01));
        assert_eq!(display_amount(dec!(1.004), "USD"), dec!(1.00));
        assert_eq!(display_amount(dec!(1.5), "JPY"), dec!(2));
    }
}
