//! Invoicing boundary of the sales core.
//!
//! Builds invoice draft payloads from what orders have left to invoice. Drafts are
//! pure values: nothing is persisted here, and invoiced quantities only move when
//! the validated invoice is registered back on the order.

pub mod draft;

pub use draft::{
    build_grouped_drafts, build_invoice_draft, InvoiceDraft, InvoiceGroupKey, InvoiceLineDraft, InvoicingError,
};
