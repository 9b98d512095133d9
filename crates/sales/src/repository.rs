use std::collections::HashMap;
use std::sync::RwLock;

use saleflow_core::{
    AggregateRoot, AnalyticAccountId, DomainError, DomainResult, ExpectedVersion, OrderId, OrderLineId,
};
use saleflow_events::EventEnvelope;

use crate::{SalesOrder, SalesOrderEvent};

pub const AGGREGATE_TYPE: &str = "sales.order";

/// Order persistence seam.
///
/// `save` is a compare-and-set: it succeeds only when the stored version still
/// equals `expected`, the version the caller loaded before executing commands.
pub trait OrderRepository: Send + Sync {
    fn load(&self, id: OrderId) -> DomainResult<Option<SalesOrder>>;

    fn save(&self, order: &SalesOrder, expected: ExpectedVersion, events: &[SalesOrderEvent]) -> DomainResult<()>;

    /// Applied events of an order, oldest first. Kept after deletion.
    fn history(&self, id: OrderId) -> DomainResult<Vec<EventEnvelope<SalesOrderEvent>>>;

    /// Orders linked to an analytic account, oldest first.
    fn find_by_analytic_account(&self, account: AnalyticAccountId) -> DomainResult<Vec<SalesOrder>>;

    fn order_of_line(&self, line_id: OrderLineId) -> DomainResult<Option<OrderId>>;

    /// Every live order, oldest first.
    fn list(&self) -> DomainResult<Vec<SalesOrder>>;
}

#[derive(Debug, Default)]
struct Inner {
    orders: HashMap<OrderId, SalesOrder>,
    history: HashMap<OrderId, Vec<EventEnvelope<SalesOrderEvent>>>,
    line_index: HashMap<OrderLineId, OrderId>,
}

/// In-memory order repository.
///
/// Intended for tests/dev and embedded use. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryOrderRepository {
    inner: RwLock<Inner>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> DomainError {
        DomainError::conflict("order repository lock poisoned")
    }

    fn sorted(mut orders: Vec<SalesOrder>) -> Vec<SalesOrder> {
        orders.sort_by_key(|o| o.id_typed());
        orders
    }
}

impl OrderRepository for InMemoryOrderRepository {
    fn load(&self, id: OrderId) -> DomainResult<Option<SalesOrder>> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner.orders.get(&id).cloned())
    }

    fn save(&self, order: &SalesOrder, expected: ExpectedVersion, events: &[SalesOrderEvent]) -> DomainResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let order_id = order.id_typed();
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;

        let stream = inner.history.entry(order_id).or_default();
        let current = stream.last().map(|e| e.sequence_number()).unwrap_or(0);
        expected.check(current)?;

        let mut next = current;
        for event in events {
            next += 1;
            stream.push(EventEnvelope::wrap(order_id, AGGREGATE_TYPE, next, event.clone()));
        }
        if next != order.version() {
            tracing::warn!(
                order_id = %order_id,
                stored = next,
                aggregate = order.version(),
                "saved events do not account for the aggregate version"
            );
        }

        inner.line_index.retain(|_, owner| *owner != order_id);
        if order.is_deleted() {
            inner.orders.remove(&order_id);
        } else {
            for line in order.lines() {
                inner.line_index.insert(line.id, order_id);
            }
            inner.orders.insert(order_id, order.clone());
        }
        Ok(())
    }

    fn history(&self, id: OrderId) -> DomainResult<Vec<EventEnvelope<SalesOrderEvent>>> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner.history.get(&id).cloned().unwrap_or_default())
    }

    fn find_by_analytic_account(&self, account: AnalyticAccountId) -> DomainResult<Vec<SalesOrder>> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        let orders = inner
            .orders
            .values()
            .filter(|o| o.analytic_account_id() == Some(account))
            .cloned()
            .collect();
        Ok(Self::sorted(orders))
    }

    fn order_of_line(&self, line_id: OrderLineId) -> DomainResult<Option<OrderId>> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner.line_index.get(&line_id).copied())
    }

    fn list(&self) -> DomainResult<Vec<SalesOrder>> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(Self::sorted(inner.orders.values().cloned().collect()))
    }
}
