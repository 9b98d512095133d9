//! Reinvoicing of analytic costs through sale order lines.
//!
//! Two entry points, always called in this order by the hooks:
//! [`AnalyticReconciler::reconcile_one`] decides which order line a cost funds
//! (creating it if needed), then [`AnalyticReconciler::aggregate_delivered_quantity`]
//! re-derives the delivered quantity of every touched line from scratch.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;

use saleflow_core::{
    AggregateRoot, AnalyticAccountId, AnalyticLineId, DomainError, DomainResult, ExpectedVersion, OrderId,
    OrderLineId, UomId,
};
use saleflow_events::execute;
use saleflow_products::{
    CurrencyConverter, ExpensePolicy, PriceRequest, PricelistResolver, Product, ProductCatalog, TaxMapper, Uom,
    UomConverter,
};
use saleflow_sales::{
    AddLine, OrderLine, OrderRepository, OrderState, SalesOrder, SalesOrderCommand, SetDeliveredQuantities,
};

use crate::{AnalyticLine, AnalyticLineStore};

/// Why a single analytic line could not be attached to an order.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("sale order {order} linked to the analytic account must be confirmed before registering expenses (state '{state}')")]
    OrderNotConfirmed { order: String, state: OrderState },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnalyticError {
    /// The analytic line is persisted but stays unlinked.
    #[error("analytic line {line_id} could not be reconciled: {source}")]
    Reconciliation {
        line_id: AnalyticLineId,
        source: ReconcileError,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Sequence of the first reinvoiced line on an order without lines.
    pub reinvoice_sequence: i64,
    /// Extra attempts when an order save loses a compare-and-set race.
    pub cas_retries: u32,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            reinvoice_sequence: 100,
            cas_retries: 3,
        }
    }
}

/// Stores and collaborators the reconciler works against.
#[derive(Clone, Copy)]
pub struct ReconcileContext<'a> {
    pub orders: &'a dyn OrderRepository,
    pub store: &'a dyn AnalyticLineStore,
    pub catalog: &'a dyn ProductCatalog,
    pub pricelists: &'a dyn PricelistResolver,
    pub taxes: &'a dyn TaxMapper,
    pub uoms: &'a dyn UomConverter,
    pub currencies: &'a dyn CurrencyConverter,
}

pub struct AnalyticReconciler<'a> {
    ctx: ReconcileContext<'a>,
    settings: ReconcileSettings,
}

impl<'a> AnalyticReconciler<'a> {
    pub fn new(ctx: ReconcileContext<'a>, settings: ReconcileSettings) -> Self {
        Self { ctx, settings }
    }

    /// Persist new analytic lines, link them to order lines and refresh delivered quantities.
    pub fn on_create(&self, lines: Vec<AnalyticLine>) -> Result<Vec<AnalyticLine>, AnalyticError> {
        for line in &lines {
            self.ctx.store.upsert(line.clone())?;
        }
        self.link_and_aggregate(lines, &[])
    }

    /// Persist updated analytic lines.
    ///
    /// An order line that loses its last cost through the write drops back to zero.
    pub fn on_write(&self, lines: Vec<AnalyticLine>) -> Result<Vec<AnalyticLine>, AnalyticError> {
        let mut released = Vec::new();
        for line in &lines {
            let before = self.ctx.store.get(line.id)?.and_then(|l| l.so_line);
            released.extend(before.filter(|b| line.so_line != Some(*b)));
            self.ctx.store.upsert(line.clone())?;
        }
        dedup(&mut released);
        self.link_and_aggregate(lines, &released)
    }

    /// Delete analytic lines and re-aggregate the order lines they funded.
    pub fn on_unlink(&self, ids: &[AnalyticLineId]) -> Result<(), AnalyticError> {
        let mut referenced = Vec::new();
        for id in ids {
            if let Some(removed) = self.ctx.store.remove(*id)? {
                referenced.extend(removed.so_line);
            }
        }
        dedup(&mut referenced);
        self.aggregate_delivered_quantity(&referenced, None, &referenced)?;
        Ok(())
    }

    fn link_and_aggregate(
        &self,
        lines: Vec<AnalyticLine>,
        released: &[OrderLineId],
    ) -> Result<Vec<AnalyticLine>, AnalyticError> {
        let mut failure = None;
        let mut linked = Vec::with_capacity(lines.len());
        for mut line in lines {
            match self.reconcile_one(&line) {
                Ok(Some(so_line)) => {
                    self.ctx.store.set_so_line(line.id, so_line)?;
                    line.so_line = Some(so_line);
                }
                Ok(None) => {}
                Err(source) => {
                    tracing::warn!(analytic_line_id = %line.id, error = %source, "analytic line left unlinked");
                    if failure.is_none() {
                        failure = Some(AnalyticError::Reconciliation {
                            line_id: line.id,
                            source,
                        });
                    }
                }
            }
            linked.push(line);
        }

        let mut targets: Vec<OrderLineId> = linked
            .iter()
            .filter_map(|l| l.so_line)
            .chain(released.iter().copied())
            .collect();
        dedup(&mut targets);
        self.aggregate_delivered_quantity(&targets, None, released)?;

        match failure {
            Some(err) => Err(err),
            None => Ok(linked),
        }
    }

    /// Order line an analytic line should be reinvoiced through.
    ///
    /// `Ok(None)` leaves the line as it is: already linked, nothing to reinvoice,
    /// or no order on the account.
    pub fn reconcile_one(&self, line: &AnalyticLine) -> Result<Option<OrderLineId>, ReconcileError> {
        if line.so_line.is_some() {
            return Ok(None);
        }
        let (Some(account_id), Some(product_id)) = (line.account_id, line.product_id) else {
            return Ok(None);
        };
        let Some(product) = self.ctx.catalog.product(product_id) else {
            tracing::debug!(analytic_line_id = %line.id, product_id = %product_id, "unknown product; not reinvoiced");
            return Ok(None);
        };
        if product.expense_policy == ExpensePolicy::No {
            return Ok(None);
        }
        let Some(order) = self.candidate_order(account_id)? else {
            tracing::debug!(analytic_line_id = %line.id, account_id = %account_id, "no order on analytic account");
            return Ok(None);
        };

        let price = self.price_for_invoicing(line, &product, &order);
        if let Some(existing) = order.line_for_product_price(product.id, price) {
            tracing::debug!(
                analytic_line_id = %line.id,
                order = order.name(),
                so_line = %existing.id,
                "reusing reinvoice line"
            );
            return Ok(Some(existing.id));
        }
        if order.state() != OrderState::Sale {
            return Err(ReconcileError::OrderNotConfirmed {
                order: order.name().to_string(),
                state: order.state(),
            });
        }

        let order_id = order.id_typed();
        let committed = self.commit(order_id, |current| {
            if current.line_for_product_price(product.id, price).is_some() {
                return None;
            }
            Some(SalesOrderCommand::AddLine(AddLine {
                order_id,
                line: self.sale_order_line_vals(line, &product, current, price),
                occurred_at: Utc::now(),
            }))
        })?;
        let so_line = committed
            .line_for_product_price(product.id, price)
            .map(|l| l.id)
            .ok_or_else(|| DomainError::invariant(format!("reinvoice line missing on {}", committed.name())))?;

        tracing::info!(
            analytic_line_id = %line.id,
            order = committed.name(),
            so_line = %so_line,
            price_unit = %price,
            "reinvoice line created"
        );
        Ok(Some(so_line))
    }

    /// Unit price a cost is reinvoiced at, in the order currency.
    pub fn price_for_invoicing(&self, line: &AnalyticLine, product: &Product, order: &SalesOrder) -> Decimal {
        let header = order.header();
        if product.expense_policy == ExpensePolicy::SalesPrice {
            let uom = line.product_uom.as_ref().unwrap_or(&product.uom);
            let request = PriceRequest {
                pricelist: header.pricelist_id,
                product,
                partner: header.partner_id,
                quantity: Decimal::ONE,
                uom,
                date: header.date_order.date_naive(),
            };
            return match self.ctx.pricelists.resolve(&request) {
                Some(quote) => quote.price_unit * (Decimal::ONE - quote.discount / Decimal::ONE_HUNDRED),
                None => {
                    tracing::warn!(pricelist_id = %header.pricelist_id, "pricelist unavailable; reinvoicing at list price");
                    product.uom.compute_price(product.list_price, uom).unwrap_or(product.list_price)
                }
            };
        }

        if line.unit_amount.is_zero() {
            return Decimal::ZERO;
        }
        let order_currency = order.currency();
        if let Some(currency) = &line.currency {
            if currency.id == order_currency.id && !line.amount_currency.is_zero() {
                return (line.amount_currency / line.unit_amount).abs();
            }
        }

        let price = (line.amount / line.unit_amount).abs();
        if line.company_currency.id == order_currency.id {
            return price;
        }
        match self
            .ctx
            .currencies
            .convert(price, &line.company_currency, order_currency, line.date)
        {
            Some(converted) => converted,
            None => {
                tracing::warn!(
                    from = %line.company_currency.code,
                    to = %order_currency.code,
                    "no exchange rate; reinvoicing at company currency price"
                );
                price
            }
        }
    }

    /// Line values for reinvoicing `line` on `order` at `price`.
    pub fn sale_order_line_vals(
        &self,
        line: &AnalyticLine,
        product: &Product,
        order: &SalesOrder,
        price: Decimal,
    ) -> OrderLine {
        let header = order.header();
        let sequence = order
            .max_sequence()
            .map_or(self.settings.reinvoice_sequence, |last| last + 1);

        let mut so_line = OrderLine::for_product(product, Decimal::ZERO).with_sequence(sequence);
        so_line.name = line.name.clone();
        so_line.price_unit = price;
        so_line.discount = Decimal::ZERO;
        if let Some(uom) = &line.product_uom {
            so_line.product_uom = Some(uom.clone());
        }
        so_line.qty_delivered = line.unit_amount;
        so_line.taxes = match self.ctx.taxes.map_taxes(
            header.fiscal_position_id,
            &product.taxes,
            product,
            header.partner_id,
        ) {
            Some(taxes) => taxes,
            None => {
                tracing::warn!(order = order.name(), "tax mapping unavailable; keeping product taxes");
                product.taxes.clone()
            }
        };
        so_line.recompute_amounts(order.currency());
        so_line
    }

    /// Recompute delivered quantities from the analytic lines.
    ///
    /// Without a condition, costs referencing one of `targets` are summed per order
    /// line, converted into the line's unit when the categories match, and written
    /// over the stored quantity. `forced` lines start from zero so they can drop to
    /// nothing once their last cost is gone. Returns the quantities written.
    ///
    /// Losing a compare-and-set race restarts from the analytic lines, so the totals
    /// written always cover the costs linked at the time of the winning save.
    pub fn aggregate_delivered_quantity(
        &self,
        targets: &[OrderLineId],
        condition: Option<&dyn Fn(&AnalyticLine) -> bool>,
        forced: &[OrderLineId],
    ) -> DomainResult<BTreeMap<OrderLineId, Decimal>> {
        if condition.is_none() && targets.is_empty() && forced.is_empty() {
            return Ok(BTreeMap::new());
        }
        let default_condition =
            |l: &AnalyticLine| l.so_line.is_some_and(|so_line| targets.contains(&so_line)) && l.is_cost();
        let condition: &dyn Fn(&AnalyticLine) -> bool = match condition {
            Some(condition) => condition,
            None => &default_condition,
        };

        let mut attempt = 0u32;
        loop {
            let totals = self.delivered_totals(condition, forced)?;
            match self.write_delivered(&totals)? {
                Saved::Committed(()) => {
                    return Ok(totals.into_iter().map(|(so_line, (_, qty))| (so_line, qty)).collect());
                }
                Saved::Lost(reason) if attempt < self.settings.cas_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, %reason, "delivered quantities changed concurrently; re-aggregating");
                }
                Saved::Lost(reason) => return Err(DomainError::Conflict(reason)),
            }
        }
    }

    /// Per order line delivered totals from the analytic lines accepted by `condition`.
    fn delivered_totals(
        &self,
        condition: &dyn Fn(&AnalyticLine) -> bool,
        forced: &[OrderLineId],
    ) -> DomainResult<BTreeMap<OrderLineId, (OrderId, Decimal)>> {
        let mut groups: BTreeMap<(OrderLineId, Option<UomId>), (Option<Uom>, Decimal)> = BTreeMap::new();
        for l in self.ctx.store.matching(condition)? {
            let Some(so_line) = l.so_line else {
                continue;
            };
            let key = (so_line, l.product_uom.as_ref().map(|u| u.id));
            let entry = groups.entry(key).or_insert_with(|| (l.product_uom.clone(), Decimal::ZERO));
            entry.1 += l.unit_amount;
        }

        let mut loaded: HashMap<OrderId, SalesOrder> = HashMap::new();
        let mut totals: BTreeMap<OrderLineId, (OrderId, Decimal)> = BTreeMap::new();
        for so_line in forced {
            if let Some(order_id) = self.ctx.orders.order_of_line(*so_line)? {
                totals.insert(*so_line, (order_id, Decimal::ZERO));
            }
        }
        for ((so_line, _), (uom, qty)) in groups {
            let Some(order_id) = self.ctx.orders.order_of_line(so_line)? else {
                tracing::debug!(so_line = %so_line, "analytic lines reference a removed order line");
                continue;
            };
            if !loaded.contains_key(&order_id) {
                if let Some(order) = self.ctx.orders.load(order_id)? {
                    loaded.insert(order_id, order);
                }
            }
            let line_uom = loaded
                .get(&order_id)
                .and_then(|o| o.line(so_line))
                .and_then(|l| l.product_uom.as_ref());
            let qty = match (uom.as_ref(), line_uom) {
                (Some(from), Some(to)) if from.same_category(to) => {
                    self.ctx.uoms.convert_quantity(qty, from, to).unwrap_or(qty)
                }
                _ => qty,
            };
            totals.entry(so_line).or_insert((order_id, Decimal::ZERO)).1 += qty;
        }
        Ok(totals)
    }

    /// One save per order; stops at the first lost race.
    fn write_delivered(&self, totals: &BTreeMap<OrderLineId, (OrderId, Decimal)>) -> DomainResult<Saved<()>> {
        let mut per_order: BTreeMap<OrderId, Vec<(OrderLineId, Decimal)>> = BTreeMap::new();
        for (so_line, (order_id, qty)) in totals {
            per_order.entry(*order_id).or_default().push((*so_line, *qty));
        }
        for (order_id, quantities) in per_order {
            let count = quantities.len();
            let command = SalesOrderCommand::SetDeliveredQuantities(SetDeliveredQuantities {
                order_id,
                quantities,
                occurred_at: Utc::now(),
            });
            if let Saved::Lost(reason) = self.try_commit(order_id, &mut |_| Some(command.clone()))? {
                return Ok(Saved::Lost(reason));
            }
            tracing::info!(order_id = %order_id, lines = count, "delivered quantities re-aggregated");
        }
        Ok(Saved::Committed(()))
    }

    /// The account's confirmed order, else its first order of any state.
    fn candidate_order(&self, account_id: AnalyticAccountId) -> DomainResult<Option<SalesOrder>> {
        let mut orders = self.ctx.orders.find_by_analytic_account(account_id)?;
        if let Some(i) = orders.iter().position(|o| o.state() == OrderState::Sale) {
            return Ok(Some(orders.swap_remove(i)));
        }
        Ok(orders.into_iter().next())
    }

    /// Load, decide, execute and save with compare-and-set, retrying lost races.
    fn commit(
        &self,
        order_id: OrderId,
        mut decide: impl FnMut(&SalesOrder) -> Option<SalesOrderCommand>,
    ) -> DomainResult<SalesOrder> {
        let mut attempt = 0u32;
        loop {
            match self.try_commit(order_id, &mut decide)? {
                Saved::Committed(order) => return Ok(order),
                Saved::Lost(reason) if attempt < self.settings.cas_retries => {
                    attempt += 1;
                    tracing::warn!(order_id = %order_id, attempt, %reason, "order changed concurrently; retrying");
                }
                Saved::Lost(reason) => return Err(DomainError::Conflict(reason)),
            }
        }
    }

    /// A single load, decide, execute and compare-and-set save.
    fn try_commit(
        &self,
        order_id: OrderId,
        decide: &mut dyn FnMut(&SalesOrder) -> Option<SalesOrderCommand>,
    ) -> DomainResult<Saved<SalesOrder>> {
        let mut order = self
            .ctx
            .orders
            .load(order_id)?
            .ok_or_else(|| DomainError::not_found(format!("sales order {order_id}")))?;
        let Some(command) = decide(&order) else {
            return Ok(Saved::Committed(order));
        };
        let expected = ExpectedVersion::Exact(order.version());
        let events = execute(&mut order, &command)?;
        match self.ctx.orders.save(&order, expected, &events) {
            Ok(()) => Ok(Saved::Committed(order)),
            Err(DomainError::Conflict(reason)) => Ok(Saved::Lost(reason)),
            Err(err) => Err(err),
        }
    }
}

/// Outcome of one compare-and-set attempt.
enum Saved<T> {
    Committed(T),
    Lost(String),
}

fn dedup(ids: &mut Vec<OrderLineId>) {
    ids.sort();
    ids.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use saleflow_auth::{CapabilityToken, PrincipalId};
    use saleflow_core::{Currency, CurrencyId, PartnerId, UomCategoryId};
    use saleflow_products::{
        FactorUomConverter, FiscalPositionBook, InvoicePolicy, PriceComputation, Pricelist, PricelistBook,
        PricelistItem, ProductBook, RateTable,
    };
    use saleflow_sales::{
        AssignAnalyticAccount, ConfirmOrder, CreateOrder, InMemoryOrderRepository, OrderHeader,
    };

    use crate::InMemoryAnalyticLineStore;

    struct Fixture {
        orders: InMemoryOrderRepository,
        store: InMemoryAnalyticLineStore,
        catalog: ProductBook,
        pricelists: PricelistBook,
        fiscal: FiscalPositionBook,
        rates: RateTable,
        usd: Currency,
        unit: Uom,
        account: AnalyticAccountId,
        order_id: OrderId,
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2017, 6, 1).unwrap()
    }

    impl Fixture {
        /// An order on a fresh analytic account, confirmed when `confirmed` is set.
        fn new(confirmed: bool) -> Self {
            Self::with_pricelist(confirmed, Pricelist::new("Public Pricelist"))
        }

        fn with_pricelist(confirmed: bool, pricelist: Pricelist) -> Self {
            let usd = Currency::new(CurrencyId::new(), "USD", 2);
            let mut pricelists = PricelistBook::new();
            let pricelist_id = pricelists.insert(pricelist);
            let account = AnalyticAccountId::new();
            let order_id = OrderId::new();

            let mut order = SalesOrder::empty(order_id);
            let header = OrderHeader::new(PartnerId::new(), pricelist_id, usd.clone(), Utc::now());
            let token = CapabilityToken::system(PrincipalId::new());
            let mut commands = vec![
                SalesOrderCommand::CreateOrder(CreateOrder {
                    order_id,
                    name: "SO001".to_string(),
                    header,
                    occurred_at: Utc::now(),
                }),
                SalesOrderCommand::AssignAnalyticAccount(AssignAnalyticAccount {
                    order_id,
                    account_id: account,
                    occurred_at: Utc::now(),
                }),
            ];
            if confirmed {
                commands.push(SalesOrderCommand::ConfirmOrder(ConfirmOrder {
                    order_id,
                    token,
                    occurred_at: Utc::now(),
                }));
            }
            let mut events = Vec::new();
            for command in &commands {
                events.extend(execute(&mut order, command).unwrap());
            }
            let orders = InMemoryOrderRepository::new();
            orders.save(&order, ExpectedVersion::Exact(0), &events).unwrap();

            Self {
                orders,
                store: InMemoryAnalyticLineStore::new(),
                catalog: ProductBook::new(),
                pricelists,
                fiscal: FiscalPositionBook::new(),
                rates: RateTable::new(),
                usd,
                unit: Uom::reference(UomCategoryId::new(), "Unit(s)"),
                account,
                order_id,
            }
        }

        fn reconciler(&self) -> AnalyticReconciler<'_> {
            AnalyticReconciler::new(
                ReconcileContext {
                    orders: &self.orders,
                    store: &self.store,
                    catalog: &self.catalog,
                    pricelists: &self.pricelists,
                    taxes: &self.fiscal,
                    uoms: &FactorUomConverter,
                    currencies: &self.rates,
                },
                ReconcileSettings::default(),
            )
        }

        fn travel(&mut self, policy: ExpensePolicy) -> Product {
            let product = Product::new("Travel", dec!(200), self.unit.clone())
                .with_cost(dec!(160))
                .with_invoice_policy(InvoicePolicy::Delivery)
                .with_expense_policy(policy);
            self.catalog.insert(product.clone());
            product
        }

        fn cost(&self, product: &Product, qty: Decimal, amount: Decimal) -> AnalyticLine {
            AnalyticLine::new("Vendor bill: travel", amount, self.usd.clone(), date())
                .on_account(self.account)
                .for_product(product.id, qty, product.uom.clone())
        }

        fn order(&self) -> SalesOrder {
            self.orders.load(self.order_id).unwrap().unwrap()
        }
    }

    #[test]
    fn vendor_bill_at_cost_creates_a_delivered_reinvoice_line() {
        let mut fx = Fixture::new(true);
        let product = fx.travel(ExpensePolicy::Cost);

        let linked = fx
            .reconciler()
            .on_create(vec![fx.cost(&product, dec!(2), dec!(-320))])
            .unwrap();
        let so_line_id = linked[0].so_line.unwrap();

        let order = fx.order();
        let so_line = order.line(so_line_id).unwrap();
        assert_eq!(so_line.price_unit, dec!(160));
        assert_eq!(so_line.qty_delivered, dec!(2));
        assert_eq!(so_line.product_uom_qty, Decimal::ZERO);
        assert_eq!(so_line.qty_invoiced, Decimal::ZERO);
        assert_eq!(so_line.sequence, 100);
        assert_eq!(fx.store.get(linked[0].id).unwrap().unwrap().so_line, Some(so_line_id));
    }

    #[test]
    fn same_product_and_price_reuses_the_line_and_sums_quantities() {
        let mut fx = Fixture::new(true);
        let product = fx.travel(ExpensePolicy::Cost);
        let reconciler = fx.reconciler();

        let first = reconciler.on_create(vec![fx.cost(&product, dec!(2), dec!(-320))]).unwrap();
        let second = reconciler.on_create(vec![fx.cost(&product, dec!(1), dec!(-160))]).unwrap();
        assert_eq!(first[0].so_line, second[0].so_line);

        let order = fx.order();
        assert_eq!(order.product_lines().count(), 1);
        assert_eq!(order.line(first[0].so_line.unwrap()).unwrap().qty_delivered, dec!(3));
    }

    #[test]
    fn different_price_gets_its_own_line_after_the_last_sequence() {
        let mut fx = Fixture::new(true);
        let product = fx.travel(ExpensePolicy::Cost);
        let reconciler = fx.reconciler();

        reconciler.on_create(vec![fx.cost(&product, dec!(2), dec!(-320))]).unwrap();
        let pricier = reconciler.on_create(vec![fx.cost(&product, dec!(1), dec!(-170))]).unwrap();

        let order = fx.order();
        assert_eq!(order.product_lines().count(), 2);
        assert_eq!(order.line(pricier[0].so_line.unwrap()).unwrap().sequence, 101);
    }

    #[test]
    fn unconfirmed_order_rejects_new_line_but_keeps_the_cost() {
        let mut fx = Fixture::new(false);
        let product = fx.travel(ExpensePolicy::Cost);
        let cost = fx.cost(&product, dec!(2), dec!(-320));
        let cost_id = cost.id;

        let err = fx.reconciler().on_create(vec![cost]).unwrap_err();
        assert!(matches!(
            err,
            AnalyticError::Reconciliation {
                source: ReconcileError::OrderNotConfirmed { state: OrderState::Draft, .. },
                ..
            }
        ));
        let stored = fx.store.get(cost_id).unwrap().unwrap();
        assert_eq!(stored.so_line, None);
        assert_eq!(fx.order().product_lines().count(), 0);
    }

    #[test]
    fn products_without_expense_policy_are_not_reinvoiced() {
        let mut fx = Fixture::new(true);
        let product = fx.travel(ExpensePolicy::No);
        let linked = fx
            .reconciler()
            .on_create(vec![fx.cost(&product, dec!(2), dec!(-320))])
            .unwrap();
        assert_eq!(linked[0].so_line, None);
        assert_eq!(fx.order().product_lines().count(), 0);
    }

    #[test]
    fn sales_price_policy_uses_the_pricelist() {
        let mut fx = Fixture::new(true);
        let product = fx.travel(ExpensePolicy::SalesPrice);
        let cost = fx.cost(&product, dec!(2), dec!(-320));
        assert_eq!(fx.reconciler().price_for_invoicing(&cost, &product, &fx.order()), dec!(200));

        let discounted =
            Pricelist::new("Discounted").with_item(PricelistItem::global(PriceComputation::Percentage(dec!(25))));
        let mut fx = Fixture::with_pricelist(true, discounted);
        let product = fx.travel(ExpensePolicy::SalesPrice);
        let cost = fx.cost(&product, dec!(2), dec!(-320));
        assert_eq!(fx.reconciler().price_for_invoicing(&cost, &product, &fx.order()), dec!(150));
    }

    #[test]
    fn zero_quantity_costs_are_priced_at_zero() {
        let mut fx = Fixture::new(true);
        let product = fx.travel(ExpensePolicy::Cost);
        let cost = fx.cost(&product, Decimal::ZERO, dec!(-320));
        assert_eq!(fx.reconciler().price_for_invoicing(&cost, &product, &fx.order()), Decimal::ZERO);
    }

    #[test]
    fn foreign_costs_prefer_amount_in_order_currency_then_convert() {
        let mut fx = Fixture::new(true);
        let product = fx.travel(ExpensePolicy::Cost);
        let eur = Currency::new(CurrencyId::new(), "EUR", 2);
        let order = fx.order();

        let in_order_currency = AnalyticLine::new("Hotel", dec!(-300), eur.clone(), date())
            .for_product(product.id, dec!(2), product.uom.clone())
            .in_currency(fx.usd.clone(), dec!(-330));
        assert_eq!(fx.reconciler().price_for_invoicing(&in_order_currency, &product, &order), dec!(165));

        fx.rates.set_rate(eur.id, date(), dec!(1));
        fx.rates.set_rate(fx.usd.id, date(), dec!(1.2));
        let in_company_currency = AnalyticLine::new("Hotel", dec!(-300), eur, date())
            .for_product(product.id, dec!(2), product.uom.clone());
        assert_eq!(fx.reconciler().price_for_invoicing(&in_company_currency, &product, &order), dec!(180));
    }

    #[test]
    fn quantities_in_other_units_are_converted_into_the_line_unit() {
        let mut fx = Fixture::new(true);
        let product = fx.travel(ExpensePolicy::Cost);
        let dozen = Uom::bigger(fx.unit.category, "Dozen(s)", dec!(12));
        let reconciler = fx.reconciler();

        let by_dozen = AnalyticLine::new("Supplies", dec!(-120), fx.usd.clone(), date())
            .on_account(fx.account)
            .for_product(product.id, dec!(1), dozen);
        let so_line = reconciler.on_create(vec![by_dozen]).unwrap()[0].so_line.unwrap();

        let by_unit = AnalyticLine::new("Supplies", dec!(-60), fx.usd.clone(), date())
            .on_account(fx.account)
            .for_product(product.id, dec!(6), fx.unit.clone())
            .linked_to(so_line);
        reconciler.on_create(vec![by_unit]).unwrap();

        assert_eq!(fx.order().line(so_line).unwrap().qty_delivered, dec!(1.5));
    }

    #[test]
    fn unlinking_the_last_cost_drops_delivered_to_zero() {
        let mut fx = Fixture::new(true);
        let product = fx.travel(ExpensePolicy::Cost);
        let reconciler = fx.reconciler();

        let a = reconciler.on_create(vec![fx.cost(&product, dec!(2), dec!(-320))]).unwrap();
        let b = reconciler.on_create(vec![fx.cost(&product, dec!(1), dec!(-160))]).unwrap();
        let so_line = a[0].so_line.unwrap();

        reconciler.on_unlink(&[a[0].id]).unwrap();
        assert_eq!(fx.order().line(so_line).unwrap().qty_delivered, dec!(1));
        reconciler.on_unlink(&[b[0].id]).unwrap();
        assert_eq!(fx.order().line(so_line).unwrap().qty_delivered, Decimal::ZERO);
    }

    #[test]
    fn moving_a_cost_to_another_line_releases_the_old_one() {
        let mut fx = Fixture::new(true);
        let product = fx.travel(ExpensePolicy::Cost);
        let reconciler = fx.reconciler();

        let a = reconciler.on_create(vec![fx.cost(&product, dec!(2), dec!(-320))]).unwrap();
        let b = reconciler.on_create(vec![fx.cost(&product, dec!(1), dec!(-170))]).unwrap();
        let (old_line, new_line) = (a[0].so_line.unwrap(), b[0].so_line.unwrap());

        let mut moved = a[0].clone();
        moved.so_line = Some(new_line);
        reconciler.on_write(vec![moved]).unwrap();

        let order = fx.order();
        assert_eq!(order.line(old_line).unwrap().qty_delivered, Decimal::ZERO);
        assert_eq!(order.line(new_line).unwrap().qty_delivered, dec!(3));
    }

    #[test]
    fn revenue_lines_do_not_count_as_delivered() {
        let mut fx = Fixture::new(true);
        let product = fx.travel(ExpensePolicy::Cost);
        let reconciler = fx.reconciler();
        let so_line = reconciler.on_create(vec![fx.cost(&product, dec!(2), dec!(-320))]).unwrap()[0]
            .so_line
            .unwrap();

        let revenue = AnalyticLine::new("Rebate", dec!(50), fx.usd.clone(), date())
            .for_product(product.id, dec!(5), fx.unit.clone())
            .linked_to(so_line);
        reconciler.on_create(vec![revenue]).unwrap();
        assert_eq!(fx.order().line(so_line).unwrap().qty_delivered, dec!(2));
    }

    #[test]
    fn nothing_to_aggregate_is_a_no_op() {
        let fx = Fixture::new(true);
        let before = fx.orders.history(fx.order_id).unwrap().len();
        let written = fx.reconciler().aggregate_delivered_quantity(&[], None, &[]).unwrap();
        assert!(written.is_empty());
        assert_eq!(fx.orders.history(fx.order_id).unwrap().len(), before);
    }

    #[test]
    fn explicit_condition_replaces_the_default_filter() {
        let mut fx = Fixture::new(true);
        let product = fx.travel(ExpensePolicy::Cost);
        let reconciler = fx.reconciler();
        let so_line = reconciler.on_create(vec![fx.cost(&product, dec!(2), dec!(-320))]).unwrap()[0]
            .so_line
            .unwrap();

        let only_big: &dyn Fn(&AnalyticLine) -> bool = &|l: &AnalyticLine| l.unit_amount > dec!(5);
        let written = reconciler.aggregate_delivered_quantity(&[], Some(only_big), &[so_line]).unwrap();
        assert_eq!(written.get(&so_line), Some(&Decimal::ZERO));
    }

    /// Order repository whose first save loses a race against another cost posting.
    struct RacingOrders<'a> {
        inner: &'a InMemoryOrderRepository,
        store: &'a InMemoryAnalyticLineStore,
        so_line: OrderLineId,
        concurrent: std::sync::Mutex<Option<AnalyticLine>>,
    }

    impl RacingOrders<'_> {
        /// The other writer: link its cost and store the full re-aggregate.
        fn interleave(&self, cost: AnalyticLine) -> DomainResult<()> {
            self.store.upsert(cost)?;
            let so_line = self.so_line;
            let delivered: Decimal = self
                .store
                .matching(&|l: &AnalyticLine| l.so_line == Some(so_line) && l.is_cost())?
                .iter()
                .map(|l| l.unit_amount)
                .sum();
            let order_id = self.inner.order_of_line(so_line)?.ok_or_else(|| DomainError::not_found("line"))?;
            let mut order = self.inner.load(order_id)?.ok_or_else(|| DomainError::not_found("order"))?;
            let expected = ExpectedVersion::Exact(order.version());
            let events = execute(
                &mut order,
                &SalesOrderCommand::SetDeliveredQuantities(SetDeliveredQuantities {
                    order_id,
                    quantities: vec![(so_line, delivered)],
                    occurred_at: Utc::now(),
                }),
            )?;
            self.inner.save(&order, expected, &events)
        }
    }

    impl OrderRepository for RacingOrders<'_> {
        fn load(&self, id: OrderId) -> DomainResult<Option<SalesOrder>> {
            self.inner.load(id)
        }

        fn save(
            &self,
            order: &SalesOrder,
            expected: ExpectedVersion,
            events: &[saleflow_sales::SalesOrderEvent],
        ) -> DomainResult<()> {
            let pending = self.concurrent.lock().unwrap().take();
            if let Some(cost) = pending {
                self.interleave(cost)?;
            }
            self.inner.save(order, expected, events)
        }

        fn history(
            &self,
            id: OrderId,
        ) -> DomainResult<Vec<saleflow_events::EventEnvelope<saleflow_sales::SalesOrderEvent>>> {
            self.inner.history(id)
        }

        fn find_by_analytic_account(&self, account: AnalyticAccountId) -> DomainResult<Vec<SalesOrder>> {
            self.inner.find_by_analytic_account(account)
        }

        fn order_of_line(&self, line_id: OrderLineId) -> DomainResult<Option<OrderId>> {
            self.inner.order_of_line(line_id)
        }

        fn list(&self) -> DomainResult<Vec<SalesOrder>> {
            self.inner.list()
        }
    }

    #[test]
    fn lost_race_re_aggregates_from_the_current_costs() {
        let mut fx = Fixture::new(true);
        let product = fx.travel(ExpensePolicy::Cost);
        let so_line = fx.reconciler().on_create(vec![fx.cost(&product, dec!(5), dec!(-800))]).unwrap()[0]
            .so_line
            .unwrap();
        fx.store
            .upsert(fx.cost(&product, dec!(1), dec!(-160)).linked_to(so_line))
            .unwrap();

        let racing = RacingOrders {
            inner: &fx.orders,
            store: &fx.store,
            so_line,
            concurrent: std::sync::Mutex::new(Some(fx.cost(&product, dec!(4), dec!(-640)).linked_to(so_line))),
        };
        let reconciler = AnalyticReconciler::new(
            ReconcileContext {
                orders: &racing,
                store: &fx.store,
                catalog: &fx.catalog,
                pricelists: &fx.pricelists,
                taxes: &fx.fiscal,
                uoms: &FactorUomConverter,
                currencies: &fx.rates,
            },
            ReconcileSettings::default(),
        );

        let written = reconciler.aggregate_delivered_quantity(&[so_line], None, &[]).unwrap();
        assert_eq!(written.get(&so_line), Some(&dec!(10)));
        assert_eq!(fx.order().line(so_line).unwrap().qty_delivered, dec!(10));
    }

    #[test]
    fn exhausted_retries_surface_the_conflict() {
        let mut fx = Fixture::new(true);
        let product = fx.travel(ExpensePolicy::Cost);
        let so_line = fx.reconciler().on_create(vec![fx.cost(&product, dec!(5), dec!(-800))]).unwrap()[0]
            .so_line
            .unwrap();
        fx.store
            .upsert(fx.cost(&product, dec!(1), dec!(-160)).linked_to(so_line))
            .unwrap();

        let racing = RacingOrders {
            inner: &fx.orders,
            store: &fx.store,
            so_line,
            concurrent: std::sync::Mutex::new(Some(fx.cost(&product, dec!(4), dec!(-640)).linked_to(so_line))),
        };
        let reconciler = AnalyticReconciler::new(
            ReconcileContext {
                orders: &racing,
                store: &fx.store,
                catalog: &fx.catalog,
                pricelists: &fx.pricelists,
                taxes: &fx.fiscal,
                uoms: &FactorUomConverter,
                currencies: &fx.rates,
            },
            ReconcileSettings {
                cas_retries: 0,
                ..ReconcileSettings::default()
            },
        );

        let err = reconciler.aggregate_delivered_quantity(&[so_line], None, &[]).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(fx.order().line(so_line).unwrap().qty_delivered, dec!(10));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: re-aggregating without new costs changes nothing.
            #[test]
            fn aggregation_is_idempotent(quantities in proptest::collection::vec(1i64..50, 1..6)) {
                let mut fx = Fixture::new(true);
                let product = fx.travel(ExpensePolicy::Cost);
                let reconciler = fx.reconciler();

                let mut so_line = None;
                for qty in &quantities {
                    let cost = fx.cost(&product, Decimal::from(*qty), Decimal::from(-160 * qty));
                    so_line = reconciler.on_create(vec![cost]).unwrap()[0].so_line;
                }
                let so_line = so_line.unwrap();
                let before = fx.orders.history(fx.order_id).unwrap().len();

                let first = reconciler.aggregate_delivered_quantity(&[so_line], None, &[]).unwrap();
                let second = reconciler.aggregate_delivered_quantity(&[so_line], None, &[]).unwrap();

                prop_assert_eq!(&first, &second);
                prop_assert_eq!(first.get(&so_line).copied(), Some(Decimal::from(quantities.iter().sum::<i64>())));
                prop_assert_eq!(fx.orders.history(fx.order_id).unwrap().len(), before);
            }
        }
    }
}
