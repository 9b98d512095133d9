//! Units of measure and conversion between units of the same category.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use saleflow_core::{round_to_step, UomCategoryId, UomId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UomError {
    #[error("cannot convert between '{from}' and '{to}': different categories")]
    CategoryMismatch { from: String, to: String },

    #[error("unit '{unit}' has a non-positive factor {factor}")]
    InvalidFactor { unit: String, factor: Decimal },

    #[error("converting {value} from '{from}' to '{to}' overflows")]
    Overflow { value: Decimal, from: String, to: String },
}

/// A unit of measure.
///
/// `factor` is how many of this unit make one reference unit of the category:
/// the reference unit has factor 1, a "10 Units" pack has factor 0.1, a "Dozen"
/// has factor 1/12.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uom {
    pub id: UomId,
    pub name: String,
    pub category: UomCategoryId,
    pub factor: Decimal,
    /// Quantities in this unit are rounded to a multiple of this step.
    pub rounding: Decimal,
}

impl Uom {
    pub fn reference(category: UomCategoryId, name: impl Into<String>) -> Self {
        Self {
            id: UomId::new(),
            name: name.into(),
            category,
            factor: Decimal::ONE,
            rounding: Decimal::new(1, 2),
        }
    }

    /// A unit worth `ratio` reference units (e.g. a 10-unit pack).
    ///
    /// A zero ratio yields a zero factor, which every conversion rejects.
    pub fn bigger(category: UomCategoryId, name: impl Into<String>, ratio: Decimal) -> Self {
        Self {
            factor: Decimal::ONE.checked_div(ratio).unwrap_or(Decimal::ZERO),
            ..Self::reference(category, name)
        }
    }

    /// A unit `ratio` of which make one reference unit (e.g. grams for a kg reference).
    pub fn smaller(category: UomCategoryId, name: impl Into<String>, ratio: Decimal) -> Self {
        Self {
            factor: ratio,
            ..Self::reference(category, name)
        }
    }

    pub fn with_rounding(mut self, rounding: Decimal) -> Self {
        self.rounding = rounding;
        self
    }

    pub fn same_category(&self, other: &Uom) -> bool {
        self.category == other.category
    }

    /// Convert a quantity expressed in `self` into `to`.
    pub fn compute_quantity(&self, qty: Decimal, to: &Uom, round: bool) -> Result<Decimal, UomError> {
        self.ensure_category(to)?;
        if self.id == to.id {
            return Ok(qty);
        }
        let converted = qty
            .checked_div(self.factor)
            .and_then(|reference| reference.checked_mul(to.factor))
            .ok_or_else(|| self.overflow(qty, to))?;
        if round {
            Ok(round_to_step(converted, to.rounding, RoundingStrategy::MidpointAwayFromZero))
        } else {
            Ok(converted)
        }
    }

    /// Convert a price per `self` into a price per `to`.
    pub fn compute_price(&self, price: Decimal, to: &Uom) -> Result<Decimal, UomError> {
        self.ensure_category(to)?;
        if self.id == to.id {
            return Ok(price);
        }
        price
            .checked_mul(self.factor)
            .and_then(|reference| reference.checked_div(to.factor))
            .ok_or_else(|| self.overflow(price, to))
    }

    fn ensure_category(&self, to: &Uom) -> Result<(), UomError> {
        if !self.same_category(to) {
            return Err(UomError::CategoryMismatch {
                from: self.name.clone(),
                to: to.name.clone(),
            });
        }
        for unit in [self, to] {
            if unit.factor <= Decimal::ZERO {
                return Err(UomError::InvalidFactor {
                    unit: unit.name.clone(),
                    factor: unit.factor,
                });
            }
        }
        Ok(())
    }

    fn overflow(&self, value: Decimal, to: &Uom) -> UomError {
        UomError::Overflow {
            value,
            from: self.name.clone(),
            to: to.name.clone(),
        }
    }
}

/// Unit-of-measure conversion collaborator.
pub trait UomConverter: Send + Sync {
    fn convert_quantity(&self, qty: Decimal, from: &Uom, to: &Uom) -> Result<Decimal, UomError>;
    fn convert_price(&self, price: Decimal, from: &Uom, to: &Uom) -> Result<Decimal, UomError>;
}

/// Factor-based conversion (the standard reference-unit model).
#[derive(Debug, Default, Clone, Copy)]
pub struct FactorUomConverter;

impl UomConverter for FactorUomConverter {
    fn convert_quantity(&self, qty: Decimal, from: &Uom, to: &Uom) -> Result<Decimal, UomError> {
        from.compute_quantity(qty, to, true)
    }

    fn convert_price(&self, price: Decimal, from: &Uom, to: &Uom) -> Result<Decimal, UomError> {
        from.compute_price(price, to)
    }
}
