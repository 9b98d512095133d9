use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use saleflow_core::{round_to_step, Currency, OrderLineId, ProductId};
use saleflow_products::{InvoicePolicy, Product, Tax, TaxComputation, Uom};

use crate::invoice_status::{line_invoice_status, InvoiceStatus};

/// Layout-only lines carry a label and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayType {
    Section,
    Note,
}

/// Order line: product, quantities, pricing inputs and computed amounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub id: OrderLineId,
    pub sequence: i64,
    pub name: String,
    pub display_type: Option<DisplayType>,
    pub product_id: Option<ProductId>,
    pub product_uom: Option<Uom>,
    pub product_uom_qty: Decimal,
    pub price_unit: Decimal,
    /// Percent, 0..=100.
    pub discount: Decimal,
    /// The discount was set by hand and is kept by later price recomputations.
    pub manual_discount: bool,
    pub taxes: Vec<Tax>,
    /// Copied from the product when the line is created; never changes afterwards.
    pub invoice_policy: InvoicePolicy,
    pub qty_delivered: Decimal,
    pub qty_invoiced: Decimal,
    pub price_subtotal: Decimal,
    pub price_tax: Decimal,
    pub price_total: Decimal,
}

impl OrderLine {
    fn blank(name: impl Into<String>) -> Self {
        Self {
            id: OrderLineId::new(),
            sequence: 10,
            name: name.into(),
            display_type: None,
            product_id: None,
            product_uom: None,
            product_uom_qty: Decimal::ZERO,
            price_unit: Decimal::ZERO,
            discount: Decimal::ZERO,
            manual_discount: false,
            taxes: Vec::new(),
            invoice_policy: InvoicePolicy::default(),
            qty_delivered: Decimal::ZERO,
            qty_invoiced: Decimal::ZERO,
            price_subtotal: Decimal::ZERO,
            price_tax: Decimal::ZERO,
            price_total: Decimal::ZERO,
        }
    }

    /// A product line priced at the product's list price with its default taxes.
    ///
    /// Amounts are zero until [`OrderLine::recompute_amounts`] runs; the pricing
    /// engine refines price, discount and taxes from the order context.
    pub fn for_product(product: &Product, quantity: Decimal) -> Self {
        Self {
            product_id: Some(product.id),
            product_uom: Some(product.uom.clone()),
            product_uom_qty: quantity,
            price_unit: product.list_price,
            taxes: product.taxes.clone(),
            invoice_policy: product.invoice_policy,
            ..Self::blank(product.name.clone())
        }
    }

    pub fn section(name: impl Into<String>) -> Self {
        Self {
            display_type: Some(DisplayType::Section),
            ..Self::blank(name)
        }
    }

    pub fn note(name: impl Into<String>) -> Self {
        Self {
            display_type: Some(DisplayType::Note),
            ..Self::blank(name)
        }
    }

    pub fn with_sequence(mut self, sequence: i64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn is_product_line(&self) -> bool {
        self.display_type.is_none()
    }

    /// Unit price after discount.
    pub fn price_reduce(&self) -> Decimal {
        self.price_unit * (Decimal::ONE - self.discount / Decimal::ONE_HUNDRED)
    }

    pub fn recompute_amounts(&mut self, currency: &Currency) {
        if !self.is_product_line() {
            self.price_subtotal = Decimal::ZERO;
            self.price_tax = Decimal::ZERO;
            self.price_total = Decimal::ZERO;
            return;
        }
        let computed = TaxComputation::compute(&self.taxes, self.price_reduce(), self.product_uom_qty, currency);
        self.price_subtotal = computed.total_excluded;
        self.price_tax = computed.tax_total();
        self.price_total = computed.total_included;
    }

    /// Quantity the invoicing policy bills on.
    pub fn invoice_basis_qty(&self) -> Decimal {
        match self.invoice_policy {
            InvoicePolicy::Order => self.product_uom_qty,
            InvoicePolicy::Delivery => self.qty_delivered,
        }
    }

    /// Remaining quantity to invoice, truncated to the unit's rounding.
    ///
    /// Negative when more was invoiced than the policy quantity (refund due).
    pub fn qty_to_invoice(&self) -> Decimal {
        if !self.is_product_line() {
            return Decimal::ZERO;
        }
        let raw = self.invoice_basis_qty() - self.qty_invoiced;
        let step = self.product_uom.as_ref().map(|u| u.rounding).unwrap_or(Decimal::ZERO);
        round_to_step(raw, step, RoundingStrategy::ToZero)
    }

    pub fn invoice_status(&self) -> InvoiceStatus {
        line_invoice_status(self)
    }

    /// Same pricing and quantity, fresh identity, nothing delivered or invoiced.
    pub fn duplicate(&self) -> Self {
        Self {
            id: OrderLineId::new(),
            qty_delivered: Decimal::ZERO,
            qty_invoiced: Decimal::ZERO,
            ..self.clone()
        }
    }
}
