use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use saleflow_core::{Currency, CurrencyId};

/// Currency conversion collaborator.
///
/// The result is rounded to the target currency. `None` means no rate is known
/// for one of the currencies at `date`.
pub trait CurrencyConverter: Send + Sync {
    fn convert(&self, amount: Decimal, from: &Currency, to: &Currency, date: NaiveDate) -> Option<Decimal>;
}

/// Dated rates against a base currency (base rate = 1).
#[derive(Debug, Clone, Default)]
pub struct RateTable {
    rates: HashMap<CurrencyId, Vec<(NaiveDate, Decimal)>>,
}

impl RateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Units of `currency` per base unit, effective from `from`.
    pub fn set_rate(&mut self, currency: CurrencyId, from: NaiveDate, rate: Decimal) {
        let entries = self.rates.entry(currency).or_default();
        entries.retain(|(d, _)| *d != from);
        entries.push((from, rate));
        entries.sort_by_key(|(d, _)| *d);
    }

    fn rate_at(&self, currency: CurrencyId, date: NaiveDate) -> Option<Decimal> {
        self.rates
            .get(&currency)?
            .iter()
            .rev()
            .find(|(from, _)| *from <= date)
            .map(|(_, rate)| *rate)
            .filter(|rate| !rate.is_zero())
    }
}

impl CurrencyConverter for RateTable {
    fn convert(&self, amount: Decimal, from: &Currency, to: &Currency, date: NaiveDate) -> Option<Decimal> {
        if from.id == to.id {
            return Some(to.round(amount));
        }
        let from_rate = self.rate_at(from.id, date)?;
        let to_rate = self.rate_at(to.id, date)?;
        Some(to.round(amount / from_rate * to_rate))
    }
}
