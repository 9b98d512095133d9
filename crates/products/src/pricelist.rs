//! Pricelist resolution.

use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use saleflow_core::{PartnerId, PricelistId, ProductId};

use crate::{Product, Uom};

/// Inputs of a price lookup.
#[derive(Debug, Clone, Copy)]
pub struct PriceRequest<'a> {
    pub pricelist: PricelistId,
    pub product: &'a Product,
    pub partner: PartnerId,
    /// Quantity expressed in `uom`.
    pub quantity: Decimal,
    pub uom: &'a Uom,
    pub date: NaiveDate,
}

/// Unit price (per requested unit) and the discount to show on the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub price_unit: Decimal,
    pub discount: Decimal,
}

/// Pricelist collaborator. `None` means the pricelist could not be evaluated.
pub trait PricelistResolver: Send + Sync {
    fn resolve(&self, request: &PriceRequest<'_>) -> Option<PriceQuote>;
}

/// How a rule reduction is presented on the order line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountPolicy {
    /// The reduction is folded into the unit price.
    #[default]
    WithDiscount,
    /// The list price is kept and the reduction shows as a line discount.
    WithoutDiscount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum PriceComputation {
    Fixed(Decimal),
    /// Percentage off the list price.
    Percentage(Decimal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliesTo {
    Global,
    Product(ProductId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricelistItem {
    pub applies_to: AppliesTo,
    /// Minimum quantity, in the product's unit.
    pub min_quantity: Decimal,
    pub date_start: Option<NaiveDate>,
    /// Inclusive.
    pub date_end: Option<NaiveDate>,
    pub compute: PriceComputation,
}

impl PricelistItem {
    pub fn global(compute: PriceComputation) -> Self {
        Self {
            applies_to: AppliesTo::Global,
            min_quantity: Decimal::ZERO,
            date_start: None,
            date_end: None,
            compute,
        }
    }

    pub fn for_product(product: ProductId, compute: PriceComputation) -> Self {
        Self {
            applies_to: AppliesTo::Product(product),
            ..Self::global(compute)
        }
    }

    pub fn between(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.date_start = Some(start);
        self.date_end = Some(end);
        self
    }

    pub fn from_quantity(mut self, min_quantity: Decimal) -> Self {
        self.min_quantity = min_quantity;
        self
    }

    fn matches(&self, product: ProductId, quantity: Decimal, date: NaiveDate) -> bool {
        let product_ok = match self.applies_to {
            AppliesTo::Global => true,
            AppliesTo::Product(id) => id == product,
        };
        product_ok
            && quantity >= self.min_quantity
            && self.date_start.is_none_or(|start| date >= start)
            && self.date_end.is_none_or(|end| date <= end)
    }

    fn price(&self, list_price: Decimal) -> Decimal {
        match self.compute {
            PriceComputation::Fixed(price) => price,
            PriceComputation::Percentage(pct) => list_price * (Decimal::ONE - pct / Decimal::ONE_HUNDRED),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricelist {
    pub id: PricelistId,
    pub name: String,
    pub discount_policy: DiscountPolicy,
    pub items: Vec<PricelistItem>,
}

impl Pricelist {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: PricelistId::new(),
            name: name.into(),
            discount_policy: DiscountPolicy::default(),
            items: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: DiscountPolicy) -> Self {
        self.discount_policy = policy;
        self
    }

    pub fn with_item(mut self, item: PricelistItem) -> Self {
        self.items.push(item);
        self
    }

    /// Product-specific rules win over global ones; within a level the first
    /// matching rule in insertion order applies.
    fn rule_for(&self, product: ProductId, quantity: Decimal, date: NaiveDate) -> Option<&PricelistItem> {
        let specific = self
            .items
            .iter()
            .filter(|i| matches!(i.applies_to, AppliesTo::Product(_)));
        let global = self.items.iter().filter(|i| i.applies_to == AppliesTo::Global);
        specific.chain(global).find(|i| i.matches(product, quantity, date))
    }

    pub fn quote(&self, product: &Product, quantity: Decimal, uom: &Uom, date: NaiveDate) -> PriceQuote {
        let qty_in_product_uom = uom
            .compute_quantity(quantity, &product.uom, false)
            .unwrap_or(quantity);
        let to_request_uom = |price: Decimal| product.uom.compute_price(price, uom).unwrap_or(price);

        let list_price = product.list_price;
        let Some(rule) = self.rule_for(product.id, qty_in_product_uom, date) else {
            return PriceQuote {
                price_unit: to_request_uom(list_price),
                discount: Decimal::ZERO,
            };
        };
        let rule_price = rule.price(list_price);

        match self.discount_policy {
            DiscountPolicy::WithoutDiscount if list_price > rule_price && !list_price.is_zero() => {
                let discount = ((list_price - rule_price) / list_price * Decimal::ONE_HUNDRED).round_dp(2);
                PriceQuote {
                    price_unit: to_request_uom(list_price),
                    discount: discount.normalize(),
                }
            }
            _ => PriceQuote {
                price_unit: to_request_uom(rule_price),
                discount: Decimal::ZERO,
            },
        }
    }
}

/// In-memory set of pricelists.
#[derive(Debug, Clone, Default)]
pub struct PricelistBook {
    pricelists: HashMap<PricelistId, Pricelist>,
}

impl PricelistBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pricelist: Pricelist) -> PricelistId {
        let id = pricelist.id;
        self.pricelists.insert(id, pricelist);
        id
    }
}

impl PricelistResolver for PricelistBook {
    fn resolve(&self, request: &PriceRequest<'_>) -> Option<PriceQuote> {
        let pricelist = self.pricelists.get(&request.pricelist)?;
        Some(pricelist.quote(request.product, request.quantity, request.uom, request.date))
    }
}
