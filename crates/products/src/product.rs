use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use saleflow_core::ProductId;

use crate::{Tax, Uom};

/// Bill on ordered or on delivered quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoicePolicy {
    #[default]
    Order,
    Delivery,
}

/// Whether posted costs for the product are re-invoiced to the customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpensePolicy {
    #[default]
    No,
    /// Re-invoice at the posted cost.
    Cost,
    /// Re-invoice at the product's sale price.
    SalesPrice,
}

/// Product master fields read by the sales core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub list_price: Decimal,
    pub standard_price: Decimal,
    pub uom: Uom,
    pub taxes: Vec<Tax>,
    pub invoice_policy: InvoicePolicy,
    pub expense_policy: ExpensePolicy,
}

impl Product {
    pub fn new(name: impl Into<String>, list_price: Decimal, uom: Uom) -> Self {
        Self {
            id: ProductId::new(),
            name: name.into(),
            list_price,
            standard_price: Decimal::ZERO,
            uom,
            taxes: Vec::new(),
            invoice_policy: InvoicePolicy::default(),
            expense_policy: ExpensePolicy::default(),
        }
    }

    pub fn with_taxes(mut self, taxes: Vec<Tax>) -> Self {
        self.taxes = taxes;
        self
    }

    pub fn with_invoice_policy(mut self, policy: InvoicePolicy) -> Self {
        self.invoice_policy = policy;
        self
    }

    pub fn with_expense_policy(mut self, policy: ExpensePolicy) -> Self {
        self.expense_policy = policy;
        self
    }

    pub fn with_cost(mut self, standard_price: Decimal) -> Self {
        self.standard_price = standard_price;
        self
    }
}

/// Product lookup collaborator.
pub trait ProductCatalog: Send + Sync {
    fn product(&self, id: ProductId) -> Option<Product>;
}

#[derive(Debug, Clone, Default)]
pub struct ProductBook {
    products: HashMap<ProductId, Product>,
}

impl ProductBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, product: Product) -> ProductId {
        let id = product.id;
        self.products.insert(id, product);
        id
    }
}

impl ProductCatalog for ProductBook {
    fn product(&self, id: ProductId) -> Option<Product> {
        self.products.get(&id).cloned()
    }
}
