//! Sales order domain (event-sourced).
//!
//! Business rules for orders and their lines, implemented as deterministic domain
//! logic: the order aggregate and its lifecycle, invoice status derivation, the
//! line pricing engine and the order repository seam.

pub mod engine;
pub mod invoice_status;
pub mod line;
pub mod order;
pub mod repository;

pub use engine::{
    on_discount_change, on_uom_change, resolve_price_and_tax, EngineWarning, LineProposal,
    PricingContext,
};
pub use invoice_status::{line_invoice_status, order_invoice_status, InvoiceStatus};
pub use line::{DisplayType, OrderLine};
pub use order::{
    AddLine, AnalyticAccountAssigned, AssignAnalyticAccount, CancelOrder, ConfirmOrder,
    CreateOrder, DeleteOrder, DeliveredQuantitiesSet, InvoiceRegistered, LineAdded, LineRemoved,
    LineUpdated, MarkDone, OrderCancelled, OrderConfirmed, OrderCreated, OrderDeleted, OrderDone,
    OrderHeader, OrderState, QuotationSent, QuotationUpdated, RegisterInvoice, RemoveLine,
    SalesOrder, SalesOrderCommand, SalesOrderEvent, SendQuotation, SetDeliveredQuantities,
    UpdateLine, UpdateQuotation,
};
pub use repository::{InMemoryOrderRepository, OrderRepository};
