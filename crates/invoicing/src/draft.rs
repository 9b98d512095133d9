use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use saleflow_core::{Currency, CurrencyId, DomainError, OrderId, OrderLineId, PartnerId, ProductId};
use saleflow_products::{Tax, TaxComputation, Uom};
use saleflow_sales::{OrderLine, OrderState, SalesOrder};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvoicingError {
    #[error("there is no invoiceable line")]
    NothingToInvoice,

    #[error("order {order} in state '{state}' cannot be invoiced")]
    OrderNotInvoiceable { order: String, state: OrderState },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Orders sharing a key are invoiced together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InvoiceGroupKey {
    pub partner_invoice_id: PartnerId,
    pub currency_id: CurrencyId,
}

impl InvoiceGroupKey {
    pub fn of(order: &SalesOrder) -> Self {
        Self {
            partner_invoice_id: order.header().partner_invoice_id,
            currency_id: order.currency().id,
        }
    }
}

/// One invoice line per order line, for the quantity still to invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLineDraft {
    pub order_id: OrderId,
    pub order_line_id: OrderLineId,
    pub sequence: i64,
    pub name: String,
    pub product_id: ProductId,
    pub uom: Uom,
    pub quantity: Decimal,
    pub price_unit: Decimal,
    pub discount: Decimal,
    pub taxes: Vec<Tax>,
    pub price_subtotal: Decimal,
    pub price_tax: Decimal,
    pub price_total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDraft {
    pub key: InvoiceGroupKey,
    pub currency: Currency,
    /// Names of the source orders, comma separated.
    pub origin: String,
    pub note: String,
    pub lines: Vec<InvoiceLineDraft>,
}

impl InvoiceDraft {
    pub fn amount_untaxed(&self) -> Decimal {
        self.lines.iter().map(|l| l.price_subtotal).sum()
    }

    pub fn amount_tax(&self) -> Decimal {
        self.lines.iter().map(|l| l.price_tax).sum()
    }

    pub fn amount_total(&self) -> Decimal {
        self.amount_untaxed() + self.amount_tax()
    }

    /// Per-order quantities to register once the invoice is validated.
    pub fn quantities_by_order(&self) -> BTreeMap<OrderId, Vec<(OrderLineId, Decimal)>> {
        let mut out: BTreeMap<OrderId, Vec<(OrderLineId, Decimal)>> = BTreeMap::new();
        for line in &self.lines {
            out.entry(line.order_id)
                .or_default()
                .push((line.order_line_id, line.quantity));
        }
        out
    }
}

/// Draft invoice for what `order` has left to invoice.
///
/// Only product lines with a positive quantity to invoice are included, optionally
/// restricted to `selection`. Building twice from the same order yields the same
/// payload.
pub fn build_invoice_draft(
    order: &SalesOrder,
    selection: Option<&[OrderLineId]>,
) -> Result<InvoiceDraft, InvoicingError> {
    ensure_invoiceable(order)?;
    if let Some(selection) = selection {
        for line_id in selection {
            if order.line(*line_id).is_none() {
                return Err(DomainError::not_found(format!("order line {line_id} on {}", order.name())).into());
            }
        }
    }

    let lines = invoiceable_lines(order, selection);
    if lines.is_empty() {
        return Err(InvoicingError::NothingToInvoice);
    }
    Ok(InvoiceDraft {
        key: InvoiceGroupKey::of(order),
        currency: order.currency().clone(),
        origin: order.name().to_string(),
        note: order.header().note.clone(),
        lines,
    })
}

/// One draft per [`InvoiceGroupKey`] over several orders.
///
/// Orders with nothing left to invoice are skipped; every order must still be
/// invoiceable. Drafts come out in key order, lines in order then sequence order.
pub fn build_grouped_drafts(orders: &[SalesOrder]) -> Result<Vec<InvoiceDraft>, InvoicingError> {
    let mut groups: BTreeMap<InvoiceGroupKey, InvoiceDraft> = BTreeMap::new();
    for order in orders {
        ensure_invoiceable(order)?;
        let lines = invoiceable_lines(order, None);
        if lines.is_empty() {
            continue;
        }
        let key = InvoiceGroupKey::of(order);
        let draft = groups.entry(key).or_insert_with(|| InvoiceDraft {
            key,
            currency: order.currency().clone(),
            origin: String::new(),
            note: order.header().note.clone(),
            lines: Vec::new(),
        });
        if !draft.origin.is_empty() {
            draft.origin.push_str(", ");
        }
        draft.origin.push_str(order.name());
        draft.lines.extend(lines);
    }

    if groups.is_empty() {
        return Err(InvoicingError::NothingToInvoice);
    }
    Ok(groups.into_values().collect())
}

fn ensure_invoiceable(order: &SalesOrder) -> Result<(), InvoicingError> {
    if matches!(order.state(), OrderState::Sale | OrderState::Done) {
        Ok(())
    } else {
        Err(InvoicingError::OrderNotInvoiceable {
            order: order.name().to_string(),
            state: order.state(),
        })
    }
}

fn invoiceable_lines(order: &SalesOrder, selection: Option<&[OrderLineId]>) -> Vec<InvoiceLineDraft> {
    order
        .product_lines()
        .filter(|l| selection.is_none_or(|ids| ids.contains(&l.id)))
        .filter_map(|l| line_draft(order, l))
        .collect()
}

fn line_draft(order: &SalesOrder, line: &OrderLine) -> Option<InvoiceLineDraft> {
    let quantity = line.qty_to_invoice();
    if quantity <= Decimal::ZERO {
        return None;
    }
    let (product_id, uom) = (line.product_id?, line.product_uom.clone()?);
    let computed = TaxComputation::compute(&line.taxes, line.price_reduce(), quantity, order.currency());
    Some(InvoiceLineDraft {
        order_id: order.id_typed(),
        order_line_id: line.id,
        sequence: line.sequence,
        name: line.name.clone(),
        product_id,
        uom,
        quantity,
        price_unit: line.price_unit,
        discount: line.discount,
        taxes: line.taxes.clone(),
        price_subtotal: computed.total_excluded,
        price_tax: computed.tax_total(),
        price_total: computed.total_included,
    })
}
