//! `saleflow-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! aggregate traits, the shared error model, typed identifiers and money helpers.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod money;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{
    AnalyticAccountId, AnalyticLineId, CurrencyId, FiscalPositionId, OrderId, OrderLineId,
    PartnerId, PricelistId, ProductId, TaxId, TeamId, UomCategoryId, UomId,
};
pub use money::{round_to_step, Currency};
