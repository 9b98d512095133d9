//! Product master data and the pricing collaborators consumed by the sales core.
//!
//! The sales core only *consumes* pricelist resolution, tax mapping, currency and
//! unit-of-measure conversion. Each concern is a trait here, together with a small
//! in-memory implementation used by tests and embedded deployments.

pub mod currency;
pub mod pricelist;
pub mod product;
pub mod tax;
pub mod uom;

pub use currency::{CurrencyConverter, RateTable};
pub use pricelist::{
    AppliesTo, DiscountPolicy, PriceComputation, PriceQuote, PriceRequest, Pricelist, PricelistBook,
    PricelistItem, PricelistResolver,
};
pub use product::{ExpensePolicy, InvoicePolicy, Product, ProductBook, ProductCatalog};
pub use tax::{
    fix_tax_included_price, included_rate, FiscalPosition, FiscalPositionBook, Tax, TaxAmount,
    TaxComputation, TaxMapper, TaxMapping,
};
pub use uom::{FactorUomConverter, Uom, UomConverter, UomError};
