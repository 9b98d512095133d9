use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use saleflow_auth::{Capability, CapabilityToken, PrincipalId};
use saleflow_core::{
    Aggregate, AggregateRoot, AnalyticAccountId, Currency, CurrencyId, DomainError, FiscalPositionId,
    OrderId, OrderLineId, PartnerId, PricelistId, ProductId, TeamId,
};
use saleflow_events::Event;

use crate::invoice_status::{order_invoice_status, InvoiceStatus};
use crate::OrderLine;

/// Sales order lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Draft,
    Sent,
    Sale,
    Done,
    Cancel,
}

impl OrderState {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderState::Draft => "draft",
            OrderState::Sent => "sent",
            OrderState::Sale => "sale",
            OrderState::Done => "done",
            OrderState::Cancel => "cancel",
        }
    }

    pub fn is_quotation(self) -> bool {
        matches!(self, OrderState::Draft | OrderState::Sent)
    }
}

impl core::fmt::Display for OrderState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commercial terms of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderHeader {
    pub partner_id: PartnerId,
    pub partner_invoice_id: PartnerId,
    pub partner_shipping_id: PartnerId,
    pub pricelist_id: PricelistId,
    pub fiscal_position_id: Option<FiscalPositionId>,
    pub currency: Currency,
    pub date_order: DateTime<Utc>,
    pub team_id: Option<TeamId>,
    pub note: String,
}

impl OrderHeader {
    /// Terms for `partner`, who is also the invoicing and shipping address.
    pub fn new(partner_id: PartnerId, pricelist_id: PricelistId, currency: Currency, date_order: DateTime<Utc>) -> Self {
        Self {
            partner_id,
            partner_invoice_id: partner_id,
            partner_shipping_id: partner_id,
            pricelist_id,
            fiscal_position_id: None,
            currency,
            date_order,
            team_id: None,
            note: String::new(),
        }
    }

    pub fn with_addresses(mut self, invoice: PartnerId, shipping: PartnerId) -> Self {
        self.partner_invoice_id = invoice;
        self.partner_shipping_id = shipping;
        self
    }

    pub fn with_fiscal_position(mut self, fiscal_position_id: FiscalPositionId) -> Self {
        self.fiscal_position_id = Some(fiscal_position_id);
        self
    }

    pub fn with_team(mut self, team_id: TeamId) -> Self {
        self.team_id = Some(team_id);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }
}

/// Aggregate root: SalesOrder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SalesOrder {
    id: OrderId,
    name: String,
    header: OrderHeader,
    analytic_account_id: Option<AnalyticAccountId>,
    state: OrderState,
    invoice_status: InvoiceStatus,
    lines: Vec<OrderLine>,
    invoice_refs: Vec<String>,
    version: u64,
    created: bool,
    deleted: bool,
}

impl SalesOrder {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            name: String::new(),
            header: OrderHeader::new(
                PartnerId::new(),
                PricelistId::new(),
                Currency::new(CurrencyId::new(), "", 2),
                DateTime::<Utc>::default(),
            ),
            analytic_account_id: None,
            state: OrderState::Draft,
            invoice_status: InvoiceStatus::No,
            lines: Vec::new(),
            invoice_refs: Vec::new(),
            version: 0,
            created: false,
            deleted: false,
        }
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &OrderHeader {
        &self.header
    }

    pub fn currency(&self) -> &Currency {
        &self.header.currency
    }

    pub fn analytic_account_id(&self) -> Option<AnalyticAccountId> {
        self.analytic_account_id
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    pub fn invoice_status(&self) -> InvoiceStatus {
        self.invoice_status
    }

    /// Lines ordered by sequence.
    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn line(&self, line_id: OrderLineId) -> Option<&OrderLine> {
        self.lines.iter().find(|l| l.id == line_id)
    }

    pub fn product_lines(&self) -> impl Iterator<Item = &OrderLine> {
        self.lines.iter().filter(|l| l.is_product_line())
    }

    /// First line selling `product_id` at exactly `price_unit`.
    pub fn line_for_product_price(&self, product_id: ProductId, price_unit: Decimal) -> Option<&OrderLine> {
        self.product_lines()
            .find(|l| l.product_id == Some(product_id) && l.price_unit == price_unit)
    }

    pub fn max_sequence(&self) -> Option<i64> {
        self.lines.iter().map(|l| l.sequence).max()
    }

    pub fn invoice_refs(&self) -> &[String] {
        &self.invoice_refs
    }

    pub fn amount_untaxed(&self) -> Decimal {
        self.product_lines().map(|l| l.price_subtotal).sum()
    }

    pub fn amount_tax(&self) -> Decimal {
        self.product_lines().map(|l| l.price_tax).sum()
    }

    pub fn amount_total(&self) -> Decimal {
        self.amount_untaxed() + self.amount_tax()
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

impl AggregateRoot for SalesOrder {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateOrder (new quotation in `draft`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
    pub order_id: OrderId,
    pub name: String,
    pub header: OrderHeader,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateQuotation. Replaces the commercial terms of a quotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateQuotation {
    pub order_id: OrderId,
    pub header: OrderHeader,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignAnalyticAccount {
    pub order_id: OrderId,
    pub account_id: AnalyticAccountId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddLine. The line is usually a pricing engine proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLine {
    pub order_id: OrderId,
    pub line: OrderLine,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateLine. Delivered and invoiced quantities of `line` are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLine {
    pub order_id: OrderId,
    pub line: OrderLine,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveLine {
    pub order_id: OrderId,
    pub line_id: OrderLineId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetDeliveredQuantities. Overwrites, never increments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDeliveredQuantities {
    pub order_id: OrderId,
    pub quantities: Vec<(OrderLineId, Decimal)>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RegisterInvoice. Adds validated invoice quantities (negative for refunds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterInvoice {
    pub order_id: OrderId,
    pub invoice_ref: String,
    pub quantities: Vec<(OrderLineId, Decimal)>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendQuotation {
    pub order_id: OrderId,
    pub token: CapabilityToken,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOrder {
    pub order_id: OrderId,
    pub token: CapabilityToken,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: OrderId,
    pub token: CapabilityToken,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkDone {
    pub order_id: OrderId,
    pub token: CapabilityToken,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeleteOrder. Requires the manager capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOrder {
    pub order_id: OrderId,
    pub token: CapabilityToken,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SalesOrderCommand {
    CreateOrder(CreateOrder),
    UpdateQuotation(UpdateQuotation),
    AssignAnalyticAccount(AssignAnalyticAccount),
    AddLine(AddLine),
    UpdateLine(UpdateLine),
    RemoveLine(RemoveLine),
    SetDeliveredQuantities(SetDeliveredQuantities),
    RegisterInvoice(RegisterInvoice),
    SendQuotation(SendQuotation),
    ConfirmOrder(ConfirmOrder),
    CancelOrder(CancelOrder),
    MarkDone(MarkDone),
    DeleteOrder(DeleteOrder),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub name: String,
    pub header: OrderHeader,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotationUpdated {
    pub order_id: OrderId,
    pub header: OrderHeader,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticAccountAssigned {
    pub order_id: OrderId,
    pub account_id: AnalyticAccountId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineAdded. Carries the line with its computed amounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineAdded {
    pub order_id: OrderId,
    pub line: OrderLine,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineUpdated {
    pub order_id: OrderId,
    pub line: OrderLine,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRemoved {
    pub order_id: OrderId,
    pub line_id: OrderLineId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: DeliveredQuantitiesSet. Only lines whose quantity actually changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredQuantitiesSet {
    pub order_id: OrderId,
    pub quantities: Vec<(OrderLineId, Decimal)>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRegistered {
    pub order_id: OrderId,
    pub invoice_ref: String,
    pub quantities: Vec<(OrderLineId, Decimal)>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotationSent {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDone {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDeleted {
    pub order_id: OrderId,
    pub deleted_by: PrincipalId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SalesOrderEvent {
    OrderCreated(OrderCreated),
    QuotationUpdated(QuotationUpdated),
    AnalyticAccountAssigned(AnalyticAccountAssigned),
    LineAdded(LineAdded),
    LineUpdated(LineUpdated),
    LineRemoved(LineRemoved),
    DeliveredQuantitiesSet(DeliveredQuantitiesSet),
    InvoiceRegistered(InvoiceRegistered),
    QuotationSent(QuotationSent),
    OrderConfirmed(OrderConfirmed),
    OrderCancelled(OrderCancelled),
    OrderDone(OrderDone),
    OrderDeleted(OrderDeleted),
}

impl Event for SalesOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SalesOrderEvent::OrderCreated(_) => "sales.order.created",
            SalesOrderEvent::QuotationUpdated(_) => "sales.order.quotation_updated",
            SalesOrderEvent::AnalyticAccountAssigned(_) => "sales.order.analytic_account_assigned",
            SalesOrderEvent::LineAdded(_) => "sales.order.line_added",
            SalesOrderEvent::LineUpdated(_) => "sales.order.line_updated",
            SalesOrderEvent::LineRemoved(_) => "sales.order.line_removed",
            SalesOrderEvent::DeliveredQuantitiesSet(_) => "sales.order.delivered_quantities_set",
            SalesOrderEvent::InvoiceRegistered(_) => "sales.order.invoice_registered",
            SalesOrderEvent::QuotationSent(_) => "sales.order.sent",
            SalesOrderEvent::OrderConfirmed(_) => "sales.order.confirmed",
            SalesOrderEvent::OrderCancelled(_) => "sales.order.cancelled",
            SalesOrderEvent::OrderDone(_) => "sales.order.done",
            SalesOrderEvent::OrderDeleted(_) => "sales.order.deleted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SalesOrderEvent::OrderCreated(e) => e.occurred_at,
            SalesOrderEvent::QuotationUpdated(e) => e.occurred_at,
            SalesOrderEvent::AnalyticAccountAssigned(e) => e.occurred_at,
            SalesOrderEvent::LineAdded(e) => e.occurred_at,
            SalesOrderEvent::LineUpdated(e) => e.occurred_at,
            SalesOrderEvent::LineRemoved(e) => e.occurred_at,
            SalesOrderEvent::DeliveredQuantitiesSet(e) => e.occurred_at,
            SalesOrderEvent::InvoiceRegistered(e) => e.occurred_at,
            SalesOrderEvent::QuotationSent(e) => e.occurred_at,
            SalesOrderEvent::OrderConfirmed(e) => e.occurred_at,
            SalesOrderEvent::OrderCancelled(e) => e.occurred_at,
            SalesOrderEvent::OrderDone(e) => e.occurred_at,
            SalesOrderEvent::OrderDeleted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for SalesOrder {
    type Command = SalesOrderCommand;
    type Event = SalesOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SalesOrderEvent::OrderCreated(e) => {
                self.id = e.order_id;
                self.name = e.name.clone();
                self.header = e.header.clone();
                self.state = OrderState::Draft;
                self.lines.clear();
                self.created = true;
            }
            SalesOrderEvent::QuotationUpdated(e) => {
                self.header = e.header.clone();
            }
            SalesOrderEvent::AnalyticAccountAssigned(e) => {
                self.analytic_account_id = Some(e.account_id);
            }
            SalesOrderEvent::LineAdded(e) => {
                self.lines.push(e.line.clone());
                self.lines.sort_by_key(|l| l.sequence);
            }
            SalesOrderEvent::LineUpdated(e) => {
                if let Some(line) = self.lines.iter_mut().find(|l| l.id == e.line.id) {
                    *line = e.line.clone();
                }
                self.lines.sort_by_key(|l| l.sequence);
            }
            SalesOrderEvent::LineRemoved(e) => {
                self.lines.retain(|l| l.id != e.line_id);
            }
            SalesOrderEvent::DeliveredQuantitiesSet(e) => {
                for (line_id, qty) in &e.quantities {
                    if let Some(line) = self.lines.iter_mut().find(|l| l.id == *line_id) {
                        line.qty_delivered = *qty;
                    }
                }
            }
            SalesOrderEvent::InvoiceRegistered(e) => {
                for (line_id, qty) in &e.quantities {
                    if let Some(line) = self.lines.iter_mut().find(|l| l.id == *line_id) {
                        line.qty_invoiced += *qty;
                    }
                }
                self.invoice_refs.push(e.invoice_ref.clone());
            }
            SalesOrderEvent::QuotationSent(_) => {
                self.state = OrderState::Sent;
            }
            SalesOrderEvent::OrderConfirmed(_) => {
                self.state = OrderState::Sale;
            }
            SalesOrderEvent::OrderCancelled(_) => {
                self.state = OrderState::Cancel;
            }
            SalesOrderEvent::OrderDone(_) => {
                self.state = OrderState::Done;
            }
            SalesOrderEvent::OrderDeleted(_) => {
                self.deleted = true;
            }
        }

        self.invoice_status = order_invoice_status(self.state, &self.lines);

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            SalesOrderCommand::CreateOrder(cmd) => self.handle_create(cmd),
            SalesOrderCommand::UpdateQuotation(cmd) => self.handle_update_quotation(cmd),
            SalesOrderCommand::AssignAnalyticAccount(cmd) => self.handle_assign_account(cmd),
            SalesOrderCommand::AddLine(cmd) => self.handle_add_line(cmd),
            SalesOrderCommand::UpdateLine(cmd) => self.handle_update_line(cmd),
            SalesOrderCommand::RemoveLine(cmd) => self.handle_remove_line(cmd),
            SalesOrderCommand::SetDeliveredQuantities(cmd) => self.handle_set_delivered(cmd),
            SalesOrderCommand::RegisterInvoice(cmd) => self.handle_register_invoice(cmd),
            SalesOrderCommand::SendQuotation(cmd) => self.handle_send(cmd),
            SalesOrderCommand::ConfirmOrder(cmd) => self.handle_confirm(cmd),
            SalesOrderCommand::CancelOrder(cmd) => self.handle_cancel(cmd),
            SalesOrderCommand::MarkDone(cmd) => self.handle_done(cmd),
            SalesOrderCommand::DeleteOrder(cmd) => self.handle_delete(cmd),
        }
    }
}

impl SalesOrder {
    fn ensure_live(&self, order_id: OrderId) -> Result<(), DomainError> {
        if !self.created || self.deleted {
            return Err(DomainError::not_found(format!("sales order {order_id}")));
        }
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn ensure_state(&self, allowed: &[OrderState], action: &str) -> Result<(), DomainError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(DomainError::transition(format!(
                "cannot {action} order {} in state '{}'",
                self.name, self.state
            )))
        }
    }

    fn ensure_capability(token: &CapabilityToken, capability: Capability, action: &str) -> Result<(), DomainError> {
        if token.has(capability) {
            Ok(())
        } else {
            Err(DomainError::unauthorized(format!(
                "principal {} may not {action} orders",
                token.principal_id()
            )))
        }
    }

    fn ensure_editable(&self) -> Result<(), DomainError> {
        if matches!(self.state, OrderState::Done | OrderState::Cancel) {
            return Err(DomainError::transition(format!(
                "order {} is '{}': lines are read-only",
                self.name, self.state
            )));
        }
        Ok(())
    }

    fn existing_line(&self, line_id: OrderLineId) -> Result<&OrderLine, DomainError> {
        self.line(line_id)
            .ok_or_else(|| DomainError::not_found(format!("order line {line_id} on {}", self.name)))
    }

    fn validate_line(line: &OrderLine) -> Result<(), DomainError> {
        if !line.is_product_line() {
            return Ok(());
        }
        if line.product_id.is_none() || line.product_uom.is_none() {
            return Err(DomainError::validation("product line requires a product and a unit of measure"));
        }
        if line.product_uom_qty < Decimal::ZERO {
            return Err(DomainError::validation("ordered quantity cannot be negative"));
        }
        if line.discount < Decimal::ZERO || line.discount > Decimal::ONE_HUNDRED {
            return Err(DomainError::validation("discount must be between 0 and 100"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateOrder) -> Result<Vec<SalesOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("sales order already exists"));
        }
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("order name cannot be empty"));
        }

        Ok(vec![SalesOrderEvent::OrderCreated(OrderCreated {
            order_id: cmd.order_id,
            name: cmd.name.clone(),
            header: cmd.header.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_quotation(&self, cmd: &UpdateQuotation) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_live(cmd.order_id)?;
        self.ensure_state(&[OrderState::Draft, OrderState::Sent], "update the terms of")?;
        if cmd.header.currency != self.header.currency && self.product_lines().next().is_some() {
            return Err(DomainError::invariant("currency cannot change once lines are priced"));
        }

        Ok(vec![SalesOrderEvent::QuotationUpdated(QuotationUpdated {
            order_id: cmd.order_id,
            header: cmd.header.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_assign_account(&self, cmd: &AssignAnalyticAccount) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_live(cmd.order_id)?;
        self.ensure_state(
            &[OrderState::Draft, OrderState::Sent, OrderState::Sale],
            "assign an analytic account to",
        )?;

        Ok(vec![SalesOrderEvent::AnalyticAccountAssigned(AnalyticAccountAssigned {
            order_id: cmd.order_id,
            account_id: cmd.account_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_line(&self, cmd: &AddLine) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_live(cmd.order_id)?;
        self.ensure_editable()?;
        if self.line(cmd.line.id).is_some() {
            return Err(DomainError::conflict(format!("order line {} already exists", cmd.line.id)));
        }
        Self::validate_line(&cmd.line)?;

        let mut line = cmd.line.clone();
        line.qty_invoiced = Decimal::ZERO;
        line.recompute_amounts(&self.header.currency);

        Ok(vec![SalesOrderEvent::LineAdded(LineAdded {
            order_id: cmd.order_id,
            line,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_line(&self, cmd: &UpdateLine) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_live(cmd.order_id)?;
        self.ensure_editable()?;
        let existing = self.existing_line(cmd.line.id)?;

        if cmd.line.display_type != existing.display_type {
            return Err(DomainError::invariant("line display type cannot change"));
        }
        if cmd.line.invoice_policy != existing.invoice_policy {
            return Err(DomainError::invariant("invoice policy of a line cannot change"));
        }
        if self.state == OrderState::Sale {
            let pricing_changed = cmd.line.product_id != existing.product_id
                || cmd.line.product_uom != existing.product_uom
                || cmd.line.price_unit != existing.price_unit
                || cmd.line.discount != existing.discount
                || cmd.line.taxes != existing.taxes;
            if pricing_changed {
                return Err(DomainError::invariant(format!(
                    "pricing of order {} is locked once confirmed",
                    self.name
                )));
            }
        }
        Self::validate_line(&cmd.line)?;

        let mut line = cmd.line.clone();
        line.qty_delivered = existing.qty_delivered;
        line.qty_invoiced = existing.qty_invoiced;
        line.recompute_amounts(&self.header.currency);
        if line == *existing {
            return Ok(vec![]);
        }

        Ok(vec![SalesOrderEvent::LineUpdated(LineUpdated {
            order_id: cmd.order_id,
            line,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_remove_line(&self, cmd: &RemoveLine) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_live(cmd.order_id)?;
        self.ensure_state(&[OrderState::Draft, OrderState::Sent], "remove lines from")?;
        self.existing_line(cmd.line_id)?;

        Ok(vec![SalesOrderEvent::LineRemoved(LineRemoved {
            order_id: cmd.order_id,
            line_id: cmd.line_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_delivered(&self, cmd: &SetDeliveredQuantities) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_live(cmd.order_id)?;

        let mut changed = Vec::new();
        for (line_id, qty) in &cmd.quantities {
            let line = self.existing_line(*line_id)?;
            if !line.is_product_line() {
                return Err(DomainError::validation("section and note lines have no delivered quantity"));
            }
            if line.qty_delivered != *qty {
                changed.push((*line_id, *qty));
            }
        }
        if changed.is_empty() {
            return Ok(vec![]);
        }

        Ok(vec![SalesOrderEvent::DeliveredQuantitiesSet(DeliveredQuantitiesSet {
            order_id: cmd.order_id,
            quantities: changed,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_register_invoice(&self, cmd: &RegisterInvoice) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_live(cmd.order_id)?;
        self.ensure_state(&[OrderState::Sale, OrderState::Done], "register an invoice on")?;
        if cmd.invoice_ref.trim().is_empty() {
            return Err(DomainError::validation("invoice reference cannot be empty"));
        }
        if self.invoice_refs.contains(&cmd.invoice_ref) {
            return Err(DomainError::conflict(format!(
                "invoice {} is already registered on {}",
                cmd.invoice_ref, self.name
            )));
        }
        for (line_id, _) in &cmd.quantities {
            if !self.existing_line(*line_id)?.is_product_line() {
                return Err(DomainError::validation("section and note lines cannot be invoiced"));
            }
        }

        Ok(vec![SalesOrderEvent::InvoiceRegistered(InvoiceRegistered {
            order_id: cmd.order_id,
            invoice_ref: cmd.invoice_ref.clone(),
            quantities: cmd.quantities.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_send(&self, cmd: &SendQuotation) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_live(cmd.order_id)?;
        self.ensure_state(&[OrderState::Draft, OrderState::Sent], "send")?;
        Self::ensure_capability(&cmd.token, Capability::EditOrders, "send")?;

        Ok(vec![SalesOrderEvent::QuotationSent(QuotationSent {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm(&self, cmd: &ConfirmOrder) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_live(cmd.order_id)?;
        self.ensure_state(&[OrderState::Draft, OrderState::Sent], "confirm")?;
        Self::ensure_capability(&cmd.token, Capability::EditOrders, "confirm")?;

        Ok(vec![SalesOrderEvent::OrderConfirmed(OrderConfirmed {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelOrder) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_live(cmd.order_id)?;
        self.ensure_state(&[OrderState::Draft, OrderState::Sent, OrderState::Sale], "cancel")?;
        Self::ensure_capability(&cmd.token, Capability::EditOrders, "cancel")?;

        Ok(vec![SalesOrderEvent::OrderCancelled(OrderCancelled {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_done(&self, cmd: &MarkDone) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_live(cmd.order_id)?;
        self.ensure_state(&[OrderState::Sale], "close")?;
        Self::ensure_capability(&cmd.token, Capability::EditOrders, "close")?;

        Ok(vec![SalesOrderEvent::OrderDone(OrderDone {
            order_id: cmd.order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_delete(&self, cmd: &DeleteOrder) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_live(cmd.order_id)?;
        self.ensure_state(&[OrderState::Draft, OrderState::Cancel], "delete")?;
        Self::ensure_capability(&cmd.token, Capability::ManageOrders, "delete")?;

        Ok(vec![SalesOrderEvent::OrderDeleted(OrderDeleted {
            order_id: cmd.order_id,
            deleted_by: cmd.token.principal_id(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
