//! Percentage taxes, price-inclusive handling and fiscal-position tax mapping.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use saleflow_core::{Currency, FiscalPositionId, PartnerId, TaxId};

use crate::Product;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// A percentage sales tax.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tax {
    pub id: TaxId,
    pub name: String,
    /// Rate in percent (21 for 21%).
    pub amount: Decimal,
    /// The tax is embedded in the unit price.
    pub price_include: bool,
}

impl Tax {
    pub fn percent(name: impl Into<String>, amount: Decimal) -> Self {
        Self {
            id: TaxId::new(),
            name: name.into(),
            amount,
            price_include: false,
        }
    }

    pub fn included(mut self) -> Self {
        self.price_include = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxAmount {
    pub tax_id: TaxId,
    pub name: String,
    pub amount: Decimal,
}

/// Result of applying a tax set to a price and quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxComputation {
    pub total_excluded: Decimal,
    pub total_included: Decimal,
    pub taxes: Vec<TaxAmount>,
}

impl TaxComputation {
    pub fn tax_total(&self) -> Decimal {
        self.taxes.iter().map(|t| t.amount).sum()
    }

    /// Compute amounts for `quantity` units at `price_unit`, rounded to `currency`.
    ///
    /// Inclusive taxes are extracted from the base first; any rounding drift on
    /// the inclusive part is booked on the last inclusive tax so that
    /// `total_included` equals the rounded base.
    pub fn compute(taxes: &[Tax], price_unit: Decimal, quantity: Decimal, currency: &Currency) -> Self {
        let base = currency.round(price_unit * quantity);
        let incl_rate = included_rate(taxes);
        let total_excluded = if incl_rate.is_zero() {
            base
        } else {
            currency.round(base / (Decimal::ONE + incl_rate / HUNDRED))
        };

        let mut amounts: Vec<TaxAmount> = taxes
            .iter()
            .map(|tax| TaxAmount {
                tax_id: tax.id,
                name: tax.name.clone(),
                amount: currency.round(total_excluded * tax.amount / HUNDRED),
            })
            .collect();

        if let Some(last_incl) = taxes.iter().rposition(|t| t.price_include) {
            let booked: Decimal = taxes
                .iter()
                .zip(&amounts)
                .filter(|(t, _)| t.price_include)
                .map(|(_, a)| a.amount)
                .sum();
            amounts[last_incl].amount += base - total_excluded - booked;
        }

        let total_included = total_excluded + amounts.iter().map(|a| a.amount).sum::<Decimal>();
        Self {
            total_excluded,
            total_included,
            taxes: amounts,
        }
    }
}

/// Sum of the rates of the price-inclusive taxes in `taxes`.
pub fn included_rate(taxes: &[Tax]) -> Decimal {
    taxes.iter().filter(|t| t.price_include).map(|t| t.amount).sum()
}

/// Rescale a unit price after the tax set changed from `source` to `resolved`.
///
/// Inclusive taxes dropped by the mapping are stripped from the price, inclusive
/// taxes introduced by it are added, so the tax-exclusive amount is preserved.
pub fn fix_tax_included_price(price: Decimal, source: &[Tax], resolved: &[Tax], currency: &Currency) -> Decimal {
    let removed: Vec<Tax> = source
        .iter()
        .filter(|t| t.price_include && !resolved.iter().any(|r| r.id == t.id))
        .cloned()
        .collect();
    let added: Vec<Tax> = resolved
        .iter()
        .filter(|t| t.price_include && !source.iter().any(|s| s.id == t.id))
        .cloned()
        .collect();
    if removed.is_empty() && added.is_empty() {
        return price;
    }

    let stripped = price / (Decimal::ONE + included_rate(&removed) / HUNDRED);
    currency.round(stripped * (Decimal::ONE + included_rate(&added) / HUNDRED))
}

/// Tax mapping collaborator.
///
/// Returns `None` when the mapping cannot be resolved (unknown fiscal position);
/// callers keep their previous taxes in that case.
pub trait TaxMapper: Send + Sync {
    fn map_taxes(
        &self,
        fiscal_position: Option<FiscalPositionId>,
        taxes: &[Tax],
        product: &Product,
        partner: PartnerId,
    ) -> Option<Vec<Tax>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxMapping {
    pub source: TaxId,
    /// `None` removes the source tax.
    pub destination: Option<Tax>,
}

/// A per-partner substitution table from one tax to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalPosition {
    pub id: FiscalPositionId,
    pub name: String,
    pub mappings: Vec<TaxMapping>,
}

impl FiscalPosition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: FiscalPositionId::new(),
            name: name.into(),
            mappings: Vec::new(),
        }
    }

    pub fn with_mapping(mut self, source: &Tax, destination: Option<Tax>) -> Self {
        self.mappings.push(TaxMapping {
            source: source.id,
            destination,
        });
        self
    }

    pub fn map(&self, taxes: &[Tax]) -> Vec<Tax> {
        let mut result: Vec<Tax> = Vec::with_capacity(taxes.len());
        for tax in taxes {
            let mut mapped = self.mappings.iter().filter(|m| m.source == tax.id).peekable();
            if mapped.peek().is_none() {
                push_unique(&mut result, tax.clone());
                continue;
            }
            for dest in mapped.filter_map(|m| m.destination.clone()) {
                push_unique(&mut result, dest);
            }
        }
        result
    }
}

fn push_unique(taxes: &mut Vec<Tax>, tax: Tax) {
    if !taxes.iter().any(|t| t.id == tax.id) {
        taxes.push(tax);
    }
}

/// In-memory fiscal positions with optional per-partner defaults.
#[derive(Debug, Clone, Default)]
pub struct FiscalPositionBook {
    positions: HashMap<FiscalPositionId, FiscalPosition>,
    partner_defaults: HashMap<PartnerId, FiscalPositionId>,
}

impl FiscalPositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, position: FiscalPosition) -> FiscalPositionId {
        let id = position.id;
        self.positions.insert(id, position);
        id
    }

    /// Position applied when the order carries none.
    pub fn set_partner_default(&mut self, partner: PartnerId, position: FiscalPositionId) {
        self.partner_defaults.insert(partner, position);
    }
}

impl TaxMapper for FiscalPositionBook {
    fn map_taxes(
        &self,
        fiscal_position: Option<FiscalPositionId>,
        taxes: &[Tax],
        _product: &Product,
        partner: PartnerId,
    ) -> Option<Vec<Tax>> {
        match fiscal_position.or_else(|| self.partner_defaults.get(&partner).copied()) {
            None => Some(taxes.to_vec()),
            Some(id) => self.positions.get(&id).map(|fp| fp.map(taxes)),
        }
    }
}
