//! Line-level and order-level invoice status derivation.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use saleflow_products::InvoicePolicy;

use crate::{OrderLine, OrderState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Nothing to invoice.
    #[default]
    No,
    ToInvoice,
    /// Fully invoiced.
    Invoiced,
    /// Invoiced beyond the ordered quantity on an order-policy line.
    Upselling,
}

/// Status of a single line. Section and note lines are always `No`.
pub fn line_invoice_status(line: &OrderLine) -> InvoiceStatus {
    if !line.is_product_line() {
        return InvoiceStatus::No;
    }
    if line.invoice_policy == InvoicePolicy::Order && line.qty_invoiced > line.product_uom_qty {
        return InvoiceStatus::Upselling;
    }
    if line.qty_to_invoice() > Decimal::ZERO {
        return InvoiceStatus::ToInvoice;
    }
    if line.invoice_basis_qty().is_zero() && line.qty_invoiced.is_zero() {
        return InvoiceStatus::No;
    }
    InvoiceStatus::Invoiced
}

/// Status of the order as a whole.
///
/// Outside `sale`/`done` the order is always `No`. Otherwise `ToInvoice` wins over
/// `Upselling`, and `Invoiced` requires every product line to be invoiced; an order
/// with a line that is still waiting for delivery stays `No`.
pub fn order_invoice_status(state: OrderState, lines: &[OrderLine]) -> InvoiceStatus {
    if !matches!(state, OrderState::Sale | OrderState::Done) {
        return InvoiceStatus::No;
    }

    let statuses: Vec<InvoiceStatus> = lines
        .iter()
        .filter(|l| l.is_product_line())
        .map(line_invoice_status)
        .collect();

    if statuses.contains(&InvoiceStatus::ToInvoice) {
        InvoiceStatus::ToInvoice
    } else if statuses.contains(&InvoiceStatus::Upselling) {
        InvoiceStatus::Upselling
    } else if !statuses.is_empty() && statuses.iter().all(|s| *s == InvoiceStatus::Invoiced) {
        InvoiceStatus::Invoiced
    } else {
        InvoiceStatus::No
    }
}
