//! Sales service facade.
//!
//! Wires the order aggregate, the pricing engine, the analytic reconciler and the
//! invoicing boundary to their stores. Every order mutation is load, execute,
//! compare-and-set save; a lost race is retried on fresh state up to the
//! configured budget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;

use saleflow_analytic::{
    AnalyticError, AnalyticLine, AnalyticLineStore, AnalyticReconciler, InMemoryAnalyticLineStore, ReconcileContext,
};
use saleflow_auth::{Capability, CapabilityToken};
use saleflow_core::{
    AggregateRoot, AnalyticAccountId, AnalyticLineId, DomainError, ExpectedVersion, OrderId, OrderLineId, ProductId,
};
use saleflow_events::{execute, EventEnvelope};
use saleflow_invoicing::{build_grouped_drafts, build_invoice_draft, InvoiceDraft, InvoicingError};
use saleflow_products::{
    CurrencyConverter, FactorUomConverter, FiscalPositionBook, PricelistBook, PricelistResolver, Product,
    ProductBook, ProductCatalog, RateTable, TaxMapper, Uom, UomConverter,
};
use saleflow_sales::{
    on_discount_change, on_uom_change, resolve_price_and_tax, AddLine, AssignAnalyticAccount, CancelOrder,
    ConfirmOrder, CreateOrder, DeleteOrder, InMemoryOrderRepository, LineProposal, MarkDone, OrderHeader, OrderLine,
    OrderRepository, PricingContext, RegisterInvoice, RemoveLine, SalesOrder, SalesOrderCommand, SalesOrderEvent,
    SendQuotation, SetDeliveredQuantities, UpdateLine, UpdateQuotation,
};

use crate::config::SalesConfig;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Analytic(#[from] AnalyticError),

    #[error(transparent)]
    Invoicing(#[from] InvoicingError),

    #[error("product {0} is not in the catalog")]
    UnknownProduct(ProductId),
}

impl ServiceError {
    /// State or capability guard rejections; never worth retrying.
    pub fn is_guard_violation(&self) -> bool {
        match self {
            ServiceError::Domain(err) | ServiceError::Analytic(AnalyticError::Domain(err)) => err.is_guard_violation(),
            ServiceError::Invoicing(InvoicingError::Domain(err)) => err.is_guard_violation(),
            _ => false,
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Master data and conversion services the sales core consults.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn ProductCatalog>,
    pub pricelists: Arc<dyn PricelistResolver>,
    pub taxes: Arc<dyn TaxMapper>,
    pub uoms: Arc<dyn UomConverter>,
    pub currencies: Arc<dyn CurrencyConverter>,
}

impl Collaborators {
    /// In-memory master data with factor-based unit conversion.
    pub fn in_memory(
        catalog: ProductBook,
        pricelists: PricelistBook,
        fiscal_positions: FiscalPositionBook,
        rates: RateTable,
    ) -> Self {
        Self {
            catalog: Arc::new(catalog),
            pricelists: Arc::new(pricelists),
            taxes: Arc::new(fiscal_positions),
            uoms: Arc::new(FactorUomConverter),
            currencies: Arc::new(rates),
        }
    }
}

pub struct SalesService {
    config: SalesConfig,
    orders: Arc<dyn OrderRepository>,
    analytic: Arc<dyn AnalyticLineStore>,
    collaborators: Collaborators,
    order_counter: AtomicU64,
}

impl SalesService {
    pub fn new(
        config: SalesConfig,
        orders: Arc<dyn OrderRepository>,
        analytic: Arc<dyn AnalyticLineStore>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            config,
            orders,
            analytic,
            collaborators,
            order_counter: AtomicU64::new(0),
        }
    }

    /// Service over empty in-memory order and analytic stores.
    pub fn in_memory(config: SalesConfig, collaborators: Collaborators) -> Self {
        Self::new(
            config,
            Arc::new(InMemoryOrderRepository::new()),
            Arc::new(InMemoryAnalyticLineStore::new()),
            collaborators,
        )
    }

    pub fn config(&self) -> &SalesConfig {
        &self.config
    }

    pub fn orders(&self) -> &dyn OrderRepository {
        self.orders.as_ref()
    }

    pub fn order(&self, order_id: OrderId) -> ServiceResult<SalesOrder> {
        self.orders
            .load(order_id)?
            .ok_or_else(|| DomainError::not_found(format!("sales order {order_id}")).into())
    }

    pub fn history(&self, order_id: OrderId) -> ServiceResult<Vec<EventEnvelope<SalesOrderEvent>>> {
        Ok(self.orders.history(order_id)?)
    }

    // -- quotations ---------------------------------------------------------

    /// New draft quotation with a generated name.
    pub fn create_quotation(&self, mut header: OrderHeader) -> ServiceResult<SalesOrder> {
        if header.note.is_empty() {
            header.note = self.config.default_note.clone();
        }
        let order_id = OrderId::new();
        let mut order = SalesOrder::empty(order_id);
        let events = execute(
            &mut order,
            &SalesOrderCommand::CreateOrder(CreateOrder {
                order_id,
                name: self.next_name(),
                header,
                occurred_at: Utc::now(),
            }),
        )?;
        self.orders.save(&order, ExpectedVersion::Exact(0), &events)?;
        tracing::info!(order_id = %order_id, order = order.name(), "quotation created");
        Ok(order)
    }

    pub fn update_quotation(&self, order_id: OrderId, header: OrderHeader) -> ServiceResult<SalesOrder> {
        self.run(order_id, |_| {
            SalesOrderCommand::UpdateQuotation(UpdateQuotation {
                order_id,
                header: header.clone(),
                occurred_at: Utc::now(),
            })
        })
    }

    pub fn assign_analytic_account(&self, order_id: OrderId, account_id: AnalyticAccountId) -> ServiceResult<SalesOrder> {
        self.run(order_id, |_| {
            SalesOrderCommand::AssignAnalyticAccount(AssignAnalyticAccount {
                order_id,
                account_id,
                occurred_at: Utc::now(),
            })
        })
    }

    /// New draft with the same terms and lines; nothing delivered or invoiced.
    pub fn copy_order(&self, order_id: OrderId) -> ServiceResult<SalesOrder> {
        let source = self.order(order_id)?;
        let copy_id = OrderId::new();
        let mut header = source.header().clone();
        header.date_order = Utc::now();

        let mut copy = SalesOrder::empty(copy_id);
        let mut events = execute(
            &mut copy,
            &SalesOrderCommand::CreateOrder(CreateOrder {
                order_id: copy_id,
                name: self.next_name(),
                header,
                occurred_at: Utc::now(),
            }),
        )?;
        for line in source.lines() {
            events.extend(execute(
                &mut copy,
                &SalesOrderCommand::AddLine(AddLine {
                    order_id: copy_id,
                    line: line.duplicate(),
                    occurred_at: Utc::now(),
                }),
            )?);
        }
        self.orders.save(&copy, ExpectedVersion::Exact(0), &events)?;
        tracing::info!(source = source.name(), order = copy.name(), "order copied");
        Ok(copy)
    }

    // -- lines --------------------------------------------------------------

    /// Priced line for `product_id`: a new line, or `line_id` with a new product or quantity.
    pub fn propose_line(
        &self,
        order_id: OrderId,
        product_id: ProductId,
        quantity: Decimal,
        line_id: Option<OrderLineId>,
    ) -> ServiceResult<LineProposal> {
        let order = self.order(order_id)?;
        let product = self.product(product_id)?;
        let line = match line_id {
            Some(line_id) => {
                let mut line = self.existing_line(&order, line_id)?.clone();
                line.product_uom_qty = quantity;
                line
            }
            None => OrderLine::for_product(&product, quantity).with_sequence(self.next_sequence(&order)),
        };
        Ok(resolve_price_and_tax(self.pricing(), &order, &product, &line))
    }

    pub fn propose_uom_change(&self, order_id: OrderId, line_id: OrderLineId, uom: &Uom) -> ServiceResult<LineProposal> {
        let order = self.order(order_id)?;
        let line = self.existing_line(&order, line_id)?;
        Ok(on_uom_change(self.pricing(), &order, line, uom))
    }

    pub fn propose_discount(
        &self,
        order_id: OrderId,
        line_id: OrderLineId,
        discount: Decimal,
        token: &CapabilityToken,
    ) -> ServiceResult<LineProposal> {
        let order = self.order(order_id)?;
        let line = self.existing_line(&order, line_id)?;
        Ok(on_discount_change(&order, line, discount, token)?)
    }

    pub fn add_line(&self, order_id: OrderId, line: OrderLine) -> ServiceResult<SalesOrder> {
        self.run(order_id, |_| {
            SalesOrderCommand::AddLine(AddLine {
                order_id,
                line: line.clone(),
                occurred_at: Utc::now(),
            })
        })
    }

    /// Price a new line for `product_id` and add it, returning the engine warnings.
    pub fn add_product(
        &self,
        order_id: OrderId,
        product_id: ProductId,
        quantity: Decimal,
    ) -> ServiceResult<(SalesOrder, LineProposal)> {
        let proposal = self.propose_line(order_id, product_id, quantity, None)?;
        for warning in &proposal.warnings {
            tracing::warn!(order_id = %order_id, product_id = %product_id, %warning, "line added with fallback pricing");
        }
        let order = self.add_line(order_id, proposal.line.clone())?;
        Ok((order, proposal))
    }

    pub fn update_line(&self, order_id: OrderId, line: OrderLine) -> ServiceResult<SalesOrder> {
        self.run(order_id, |_| {
            SalesOrderCommand::UpdateLine(UpdateLine {
                order_id,
                line: line.clone(),
                occurred_at: Utc::now(),
            })
        })
    }

    pub fn remove_line(&self, order_id: OrderId, line_id: OrderLineId) -> ServiceResult<SalesOrder> {
        self.run(order_id, |_| {
            SalesOrderCommand::RemoveLine(RemoveLine {
                order_id,
                line_id,
                occurred_at: Utc::now(),
            })
        })
    }

    /// Record delivered quantities by hand (overwrite).
    pub fn set_delivered_quantities(
        &self,
        order_id: OrderId,
        quantities: Vec<(OrderLineId, Decimal)>,
    ) -> ServiceResult<SalesOrder> {
        self.run(order_id, |_| {
            SalesOrderCommand::SetDeliveredQuantities(SetDeliveredQuantities {
                order_id,
                quantities: quantities.clone(),
                occurred_at: Utc::now(),
            })
        })
    }

    // -- lifecycle ----------------------------------------------------------

    pub fn send(&self, order_id: OrderId, token: &CapabilityToken) -> ServiceResult<SalesOrder> {
        let order = self.run(order_id, |_| {
            SalesOrderCommand::SendQuotation(SendQuotation {
                order_id,
                token: token.clone(),
                occurred_at: Utc::now(),
            })
        })?;
        tracing::info!(order = order.name(), principal = %token.principal_id(), "quotation sent");
        Ok(order)
    }

    pub fn confirm(&self, order_id: OrderId, token: &CapabilityToken) -> ServiceResult<SalesOrder> {
        let order = self.run(order_id, |_| {
            SalesOrderCommand::ConfirmOrder(ConfirmOrder {
                order_id,
                token: token.clone(),
                occurred_at: Utc::now(),
            })
        })?;
        tracing::info!(
            order = order.name(),
            principal = %token.principal_id(),
            invoice_status = ?order.invoice_status(),
            "order confirmed"
        );
        Ok(order)
    }

    pub fn cancel(&self, order_id: OrderId, token: &CapabilityToken) -> ServiceResult<SalesOrder> {
        let order = self.run(order_id, |_| {
            SalesOrderCommand::CancelOrder(CancelOrder {
                order_id,
                token: token.clone(),
                occurred_at: Utc::now(),
            })
        })?;
        tracing::info!(order = order.name(), principal = %token.principal_id(), "order cancelled");
        Ok(order)
    }

    pub fn mark_done(&self, order_id: OrderId, token: &CapabilityToken) -> ServiceResult<SalesOrder> {
        let order = self.run(order_id, |_| {
            SalesOrderCommand::MarkDone(MarkDone {
                order_id,
                token: token.clone(),
                occurred_at: Utc::now(),
            })
        })?;
        tracing::info!(order = order.name(), principal = %token.principal_id(), "order done");
        Ok(order)
    }

    pub fn delete(&self, order_id: OrderId, token: &CapabilityToken) -> ServiceResult<()> {
        let order = self.run(order_id, |_| {
            SalesOrderCommand::DeleteOrder(DeleteOrder {
                order_id,
                token: token.clone(),
                occurred_at: Utc::now(),
            })
        })?;
        tracing::info!(order = order.name(), principal = %token.principal_id(), "order deleted");
        Ok(())
    }

    // -- invoicing ----------------------------------------------------------

    pub fn invoice_draft(
        &self,
        order_id: OrderId,
        selection: Option<&[OrderLineId]>,
        token: &CapabilityToken,
    ) -> ServiceResult<InvoiceDraft> {
        ensure_can_invoice(token)?;
        let order = self.order(order_id)?;
        Ok(build_invoice_draft(&order, selection)?)
    }

    pub fn grouped_invoice_drafts(
        &self,
        order_ids: &[OrderId],
        token: &CapabilityToken,
    ) -> ServiceResult<Vec<InvoiceDraft>> {
        ensure_can_invoice(token)?;
        let orders = order_ids
            .iter()
            .map(|id| self.order(*id))
            .collect::<ServiceResult<Vec<_>>>()?;
        Ok(build_grouped_drafts(&orders)?)
    }

    /// Book a validated invoice against one order.
    pub fn register_invoice(
        &self,
        order_id: OrderId,
        invoice_ref: &str,
        quantities: Vec<(OrderLineId, Decimal)>,
        token: &CapabilityToken,
    ) -> ServiceResult<SalesOrder> {
        ensure_can_invoice(token)?;
        let order = self.run(order_id, |_| {
            SalesOrderCommand::RegisterInvoice(RegisterInvoice {
                order_id,
                invoice_ref: invoice_ref.to_string(),
                quantities: quantities.clone(),
                occurred_at: Utc::now(),
            })
        })?;
        tracing::info!(
            order = order.name(),
            invoice_ref,
            invoice_status = ?order.invoice_status(),
            "invoice registered"
        );
        Ok(order)
    }

    /// Book a validated draft against every order it was built from.
    ///
    /// Every order is checked before any is written: a rejected registration leaves
    /// all of them untouched.
    pub fn validate_invoice(
        &self,
        draft: &InvoiceDraft,
        invoice_ref: &str,
        token: &CapabilityToken,
    ) -> ServiceResult<Vec<SalesOrder>> {
        ensure_can_invoice(token)?;
        let mut staged = Vec::new();
        for (order_id, quantities) in draft.quantities_by_order() {
            let mut order = self.order(order_id)?;
            let expected = ExpectedVersion::Exact(order.version());
            let events = execute(
                &mut order,
                &SalesOrderCommand::RegisterInvoice(RegisterInvoice {
                    order_id,
                    invoice_ref: invoice_ref.to_string(),
                    quantities: quantities.clone(),
                    occurred_at: Utc::now(),
                }),
            )?;
            staged.push((order, expected, events, quantities));
        }

        let mut booked = Vec::with_capacity(staged.len());
        for (order, expected, events, quantities) in staged {
            match self.orders.save(&order, expected, &events) {
                Ok(()) => {
                    tracing::info!(
                        order = order.name(),
                        invoice_ref,
                        invoice_status = ?order.invoice_status(),
                        "invoice registered"
                    );
                    booked.push(order);
                }
                Err(DomainError::Conflict(reason)) => {
                    tracing::warn!(order = order.name(), %reason, "order changed while validating; re-deciding");
                    booked.push(self.register_invoice(order.id_typed(), invoice_ref, quantities, token)?);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(booked)
    }

    // -- analytic costs -----------------------------------------------------

    pub fn post_analytic_lines(&self, lines: Vec<AnalyticLine>) -> ServiceResult<Vec<AnalyticLine>> {
        Ok(self.reconciler().on_create(lines)?)
    }

    pub fn update_analytic_lines(&self, lines: Vec<AnalyticLine>) -> ServiceResult<Vec<AnalyticLine>> {
        Ok(self.reconciler().on_write(lines)?)
    }

    pub fn delete_analytic_lines(&self, ids: &[AnalyticLineId]) -> ServiceResult<()> {
        Ok(self.reconciler().on_unlink(ids)?)
    }

    pub fn analytic_line(&self, id: AnalyticLineId) -> ServiceResult<Option<AnalyticLine>> {
        Ok(self.analytic.get(id)?)
    }

    // -- internals ----------------------------------------------------------

    fn pricing(&self) -> PricingContext<'_> {
        PricingContext {
            pricelists: self.collaborators.pricelists.as_ref(),
            taxes: self.collaborators.taxes.as_ref(),
            uoms: self.collaborators.uoms.as_ref(),
        }
    }

    fn reconciler(&self) -> AnalyticReconciler<'_> {
        AnalyticReconciler::new(
            ReconcileContext {
                orders: self.orders.as_ref(),
                store: self.analytic.as_ref(),
                catalog: self.collaborators.catalog.as_ref(),
                pricelists: self.collaborators.pricelists.as_ref(),
                taxes: self.collaborators.taxes.as_ref(),
                uoms: self.collaborators.uoms.as_ref(),
                currencies: self.collaborators.currencies.as_ref(),
            },
            self.config.reconcile_settings(),
        )
    }

    fn product(&self, product_id: ProductId) -> ServiceResult<Product> {
        self.collaborators
            .catalog
            .product(product_id)
            .ok_or(ServiceError::UnknownProduct(product_id))
    }

    fn existing_line<'o>(&self, order: &'o SalesOrder, line_id: OrderLineId) -> ServiceResult<&'o OrderLine> {
        order
            .line(line_id)
            .ok_or_else(|| DomainError::not_found(format!("order line {line_id} on {}", order.name())).into())
    }

    fn next_name(&self) -> String {
        let counter = self.order_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.config.order_name(counter)
    }

    fn next_sequence(&self, order: &SalesOrder) -> i64 {
        let step = self.config.line_sequence_step;
        order.max_sequence().map_or(step, |last| last + step)
    }

    /// Load, decide, execute and save with compare-and-set.
    fn run(&self, order_id: OrderId, command: impl Fn(&SalesOrder) -> SalesOrderCommand) -> ServiceResult<SalesOrder> {
        let mut attempt = 0u32;
        loop {
            let mut order = self.order(order_id)?;
            let expected = ExpectedVersion::Exact(order.version());
            let cmd = command(&order);
            let events = execute(&mut order, &cmd)?;
            match self.orders.save(&order, expected, &events) {
                Ok(()) => return Ok(order),
                Err(DomainError::Conflict(reason)) if attempt < self.config.cas_retries => {
                    attempt += 1;
                    tracing::warn!(order_id = %order_id, attempt, %reason, "order changed concurrently; retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn ensure_can_invoice(token: &CapabilityToken) -> Result<(), DomainError> {
    if token.has(Capability::CreateInvoices) {
        Ok(())
    } else {
        Err(DomainError::unauthorized(format!(
            "principal {} may not invoice orders",
            token.principal_id()
        )))
    }
}
