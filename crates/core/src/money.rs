//! Currency precision and decimal rounding helpers.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::id::CurrencyId;

/// Currency as seen by the sales core: identity, code and rounding precision.
///
/// Exchange rates are not stored here; conversion belongs to the currency
/// collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency {
    pub id: CurrencyId,
    pub code: String,
    /// Number of decimal places amounts are rounded to (2 for EUR/USD, 0 for JPY).
    pub decimal_places: u32,
}

impl Currency {
    pub fn new(id: CurrencyId, code: impl Into<String>, decimal_places: u32) -> Self {
        Self {
            id,
            code: code.into(),
            decimal_places,
        }
    }

    /// Round an amount to this currency's precision (half away from zero).
    pub fn round(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.decimal_places, RoundingStrategy::MidpointAwayFromZero)
    }

    /// True when the amount rounds to zero in this currency.
    pub fn is_zero(&self, amount: Decimal) -> bool {
        self.round(amount).is_zero()
    }
}

/// Round `value` to a multiple of `step` (e.g. a unit of measure rounding of 0.01).
///
/// A non-positive step leaves the value untouched.
pub fn round_to_step(value: Decimal, step: Decimal, strategy: RoundingStrategy) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    let steps = (value / step).round_dp_with_strategy(0, strategy);
    (steps * step).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn eur() -> Currency {
        Currency::new(CurrencyId::new(), "EUR", 2)
    }

    #[test]
    fn currency_rounds_half_away_from_zero() {
        assert_eq!(eur().round(dec!(1.005)), dec!(1.01));
        assert_eq!(eur().round(dec!(-1.005)), dec!(-1.01));
        assert_eq!(eur().round(dec!(90)), dec!(90));
    }

    #[test]
    fn tiny_amount_is_zero_in_currency() {
        assert!(eur().is_zero(dec!(0.004)));
        assert!(!eur().is_zero(dec!(0.005)));
    }

    #[test]
    fn round_to_step_floors_to_granularity() {
        assert_eq!(round_to_step(dec!(2.567), dec!(0.01), RoundingStrategy::ToNegativeInfinity), dec!(2.56));
        assert_eq!(round_to_step(dec!(7), dec!(5), RoundingStrategy::ToNegativeInfinity), dec!(5));
        assert_eq!(round_to_step(dec!(3.3), Decimal::ZERO, RoundingStrategy::ToNegativeInfinity), dec!(3.3));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: rounding is idempotent.
            #[test]
            fn rounding_is_idempotent(cents in -1_000_000i64..1_000_000i64, extra in 0u32..10) {
                let amount = Decimal::new(cents * 10 + i64::from(extra), 3);
                let once = eur().round(amount);
                prop_assert_eq!(once, eur().round(once));
            }
        }
    }
}
