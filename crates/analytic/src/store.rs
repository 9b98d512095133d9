use std::collections::BTreeMap;
use std::sync::RwLock;

use saleflow_core::{AnalyticLineId, DomainError, DomainResult, OrderLineId};

use crate::AnalyticLine;

/// Persistence for analytic lines.
///
/// Plain storage: none of these methods reconcile. The create/write/unlink hooks
/// live on [`crate::AnalyticReconciler`].
pub trait AnalyticLineStore: Send + Sync {
    fn get(&self, id: AnalyticLineId) -> DomainResult<Option<AnalyticLine>>;

    fn upsert(&self, line: AnalyticLine) -> DomainResult<()>;

    fn remove(&self, id: AnalyticLineId) -> DomainResult<Option<AnalyticLine>>;

    /// Record the order line a cost is reinvoiced through.
    fn set_so_line(&self, id: AnalyticLineId, so_line: OrderLineId) -> DomainResult<()>;

    /// Lines accepted by `filter`, in id order.
    fn matching(&self, filter: &dyn Fn(&AnalyticLine) -> bool) -> DomainResult<Vec<AnalyticLine>>;
}

#[derive(Debug, Default)]
pub struct InMemoryAnalyticLineStore {
    lines: RwLock<BTreeMap<AnalyticLineId, AnalyticLine>>,
}

impl InMemoryAnalyticLineStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> DomainError {
        DomainError::conflict("analytic line store lock poisoned")
    }
}

impl AnalyticLineStore for InMemoryAnalyticLineStore {
    fn get(&self, id: AnalyticLineId) -> DomainResult<Option<AnalyticLine>> {
        let lines = self.lines.read().map_err(|_| Self::poisoned())?;
        Ok(lines.get(&id).cloned())
    }

    fn upsert(&self, line: AnalyticLine) -> DomainResult<()> {
        let mut lines = self.lines.write().map_err(|_| Self::poisoned())?;
        lines.insert(line.id, line);
        Ok(())
    }

    fn remove(&self, id: AnalyticLineId) -> DomainResult<Option<AnalyticLine>> {
        let mut lines = self.lines.write().map_err(|_| Self::poisoned())?;
        Ok(lines.remove(&id))
    }

    fn set_so_line(&self, id: AnalyticLineId, so_line: OrderLineId) -> DomainResult<()> {
        let mut lines = self.lines.write().map_err(|_| Self::poisoned())?;
        let line = lines
            .get_mut(&id)
            .ok_or_else(|| DomainError::not_found(format!("analytic line {id}")))?;
        line.so_line = Some(so_line);
        Ok(())
    }

    fn matching(&self, filter: &dyn Fn(&AnalyticLine) -> bool) -> DomainResult<Vec<AnalyticLine>> {
        let lines = self.lines.read().map_err(|_| Self::poisoned())?;
        Ok(lines.values().filter(|l| filter(l)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use saleflow_core::{Currency, CurrencyId};

    fn line(amount: rust_decimal::Decimal) -> AnalyticLine {
        AnalyticLine::new(
            "Travel",
            amount,
            Currency::new(CurrencyId::new(), "USD", 2),
            NaiveDate::from_ymd_opt(2017, 6, 1).unwrap(),
        )
    }

    #[test]
    fn set_so_line_only_touches_the_linkage() {
        let store = InMemoryAnalyticLineStore::new();
        let l = line(dec!(-10));
        let id = l.id;
        store.upsert(l.clone()).unwrap();

        let so_line = OrderLineId::new();
        store.set_so_line(id, so_line).unwrap();
        let stored = store.get(id).unwrap().unwrap();
        assert_eq!(stored.so_line, Some(so_line));
        assert_eq!(stored.amount, l.amount);
    }

    #[test]
    fn set_so_line_on_missing_line_is_not_found() {
        let store = InMemoryAnalyticLineStore::new();
        let err = store.set_so_line(AnalyticLineId::new(), OrderLineId::new()).unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
    }

    #[test]
    fn matching_filters_and_remove_deletes() {
        let store = InMemoryAnalyticLineStore::new();
        let cost = line(dec!(-10));
        let revenue = line(dec!(10));
        store.upsert(cost.clone()).unwrap();
        store.upsert(revenue).unwrap();

        let costs = store.matching(&|l: &AnalyticLine| l.is_cost()).unwrap();
        assert_eq!(costs, vec![cost.clone()]);

        assert_eq!(store.remove(cost.id).unwrap(), Some(cost.clone()));
        assert!(store.get(cost.id).unwrap().is_none());
    }
}
