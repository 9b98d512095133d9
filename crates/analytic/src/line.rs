use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use saleflow_core::{AnalyticAccountId, AnalyticLineId, Currency, OrderLineId, ProductId};
use saleflow_products::Uom;

/// A cost or time fact posted against an analytic account.
///
/// `amount` is expressed in the company currency and is negative for costs.
/// `amount_currency` is the same amount in `currency` when the source document
/// was in a foreign currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticLine {
    pub id: AnalyticLineId,
    pub name: String,
    pub date: NaiveDate,
    pub account_id: Option<AnalyticAccountId>,
    pub product_id: Option<ProductId>,
    pub unit_amount: Decimal,
    pub product_uom: Option<Uom>,
    pub amount: Decimal,
    pub amount_currency: Decimal,
    pub currency: Option<Currency>,
    pub company_currency: Currency,
    /// Sale order line this cost is reinvoiced through.
    pub so_line: Option<OrderLineId>,
}

impl AnalyticLine {
    pub fn new(name: impl Into<String>, amount: Decimal, company_currency: Currency, date: NaiveDate) -> Self {
        Self {
            id: AnalyticLineId::new(),
            name: name.into(),
            date,
            account_id: None,
            product_id: None,
            unit_amount: Decimal::ZERO,
            product_uom: None,
            amount,
            amount_currency: Decimal::ZERO,
            currency: None,
            company_currency,
            so_line: None,
        }
    }

    pub fn on_account(mut self, account_id: AnalyticAccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn for_product(mut self, product_id: ProductId, unit_amount: Decimal, uom: Uom) -> Self {
        self.product_id = Some(product_id);
        self.unit_amount = unit_amount;
        self.product_uom = Some(uom);
        self
    }

    pub fn in_currency(mut self, currency: Currency, amount_currency: Decimal) -> Self {
        self.currency = Some(currency);
        self.amount_currency = amount_currency;
        self
    }

    pub fn linked_to(mut self, so_line: OrderLineId) -> Self {
        self.so_line = Some(so_line);
        self
    }

    /// Costs count towards delivered quantities; revenue lines do not.
    pub fn is_cost(&self) -> bool {
        self.amount <= Decimal::ZERO
    }
}
