//! Sales reporting read models.
//!
//! Computed on demand from an order repository snapshot; nothing here is persisted
//! except the per-team invoicing targets.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{Datelike, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

use saleflow_core::{DomainError, DomainResult, PartnerId, ProductId, TeamId};
use saleflow_sales::{InvoiceStatus, OrderRepository, OrderState, SalesOrder, SalesOrderEvent};

/// Per-team totals shown on the sales team dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamSummary {
    pub team_id: TeamId,
    /// Σ total of the team's orders waiting for an invoice.
    pub amount_to_invoice: Decimal,
    /// Untaxed amount invoiced since the first of the month; refunds count negative.
    pub invoiced: Decimal,
    pub invoiced_target: Option<Decimal>,
}

pub struct SalesReporting<'a> {
    orders: &'a dyn OrderRepository,
    targets: &'a TeamTargets,
}

impl<'a> SalesReporting<'a> {
    pub fn new(orders: &'a dyn OrderRepository, targets: &'a TeamTargets) -> Self {
        Self { orders, targets }
    }

    pub fn team_summary(&self, team_id: TeamId) -> DomainResult<TeamSummary> {
        self.team_summary_on(team_id, Utc::now().date_naive())
    }

    /// Summary as seen on `today`.
    pub fn team_summary_on(&self, team_id: TeamId, today: NaiveDate) -> DomainResult<TeamSummary> {
        let orders = self.orders.list()?;
        Ok(TeamSummary {
            team_id,
            amount_to_invoice: amount_to_invoice(&orders, team_id),
            invoiced: self.invoiced_in_month(&orders, team_id, today)?,
            invoiced_target: self.targets.get(team_id)?,
        })
    }

    /// Untaxed value of the invoices registered on the team's orders from the first
    /// of `today`'s month up to `today`, priced at the current line terms.
    fn invoiced_in_month(&self, orders: &[SalesOrder], team_id: TeamId, today: NaiveDate) -> DomainResult<Decimal> {
        let first_of_month = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today);
        let mut invoiced = Decimal::ZERO;
        for order in orders.iter().filter(|o| o.header().team_id == Some(team_id)) {
            for envelope in self.orders.history(order.id_typed())? {
                let SalesOrderEvent::InvoiceRegistered(registered) = envelope.payload() else {
                    continue;
                };
                let day = registered.occurred_at.date_naive();
                if day < first_of_month || day > today {
                    continue;
                }
                for (line_id, qty) in &registered.quantities {
                    if let Some(line) = order.line(*line_id) {
                        invoiced += order.currency().round(line.price_reduce() * *qty);
                    }
                }
            }
        }
        Ok(invoiced)
    }

    pub fn partner_order_count(&self, partner_id: PartnerId) -> DomainResult<usize> {
        Ok(partner_order_count(&self.orders.list()?, partner_id))
    }

    pub fn product_sales_count(&self, product_id: ProductId) -> DomainResult<usize> {
        Ok(product_sales_count(&self.orders.list()?, product_id))
    }
}

pub fn amount_to_invoice(orders: &[SalesOrder], team_id: TeamId) -> Decimal {
    orders
        .iter()
        .filter(|o| o.header().team_id == Some(team_id))
        .filter(|o| o.invoice_status() == InvoiceStatus::ToInvoice)
        .map(SalesOrder::amount_total)
        .sum()
}

pub fn partner_order_count(orders: &[SalesOrder], partner_id: PartnerId) -> usize {
    orders.iter().filter(|o| o.header().partner_id == partner_id).count()
}

/// Confirmed or done orders with at least one line for `product_id`.
pub fn product_sales_count(orders: &[SalesOrder], product_id: ProductId) -> usize {
    orders
        .iter()
        .filter(|o| matches!(o.state(), OrderState::Sale | OrderState::Done))
        .filter(|o| o.product_lines().any(|l| l.product_id == Some(product_id)))
        .count()
}

/// Monthly invoicing targets per sales team.
#[derive(Debug, Default)]
pub struct TeamTargets {
    targets: RwLock<BTreeMap<TeamId, Decimal>>,
}

impl TeamTargets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` rounded to one decimal; returns the stored value.
    pub fn update_invoiced_target(&self, team_id: TeamId, value: Decimal) -> DomainResult<Decimal> {
        let rounded = value.round_dp_with_strategy(1, RoundingStrategy::MidpointAwayFromZero);
        let mut targets = self
            .targets
            .write()
            .map_err(|_| DomainError::conflict("team target lock poisoned"))?;
        targets.insert(team_id, rounded);
        Ok(rounded)
    }

    pub fn get(&self, team_id: TeamId) -> DomainResult<Option<Decimal>> {
        let targets = self
            .targets
            .read()
            .map_err(|_| DomainError::conflict("team target lock poisoned"))?;
        Ok(targets.get(&team_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn targets_round_to_one_decimal() {
        let targets = TeamTargets::new();
        let team = TeamId::new();
        assert_eq!(targets.update_invoiced_target(team, dec!(1234.56)).unwrap(), dec!(1234.6));
        assert_eq!(targets.update_invoiced_target(team, dec!(10.05)).unwrap(), dec!(10.1));
        assert_eq!(targets.get(team).unwrap(), Some(dec!(10.1)));
        assert_eq!(targets.get(TeamId::new()).unwrap(), None);
    }

    #[test]
    fn empty_order_book_reports_zero() {
        assert_eq!(amount_to_invoice(&[], TeamId::new()), Decimal::ZERO);
        assert_eq!(partner_order_count(&[], PartnerId::new()), 0);
        assert_eq!(product_sales_count(&[], ProductId::new()), 0);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn stored_target_has_at_most_one_decimal(cents in -10_000_000i64..10_000_000i64) {
                let targets = TeamTargets::new();
                let stored = targets
                    .update_invoiced_target(TeamId::new(), Decimal::new(cents, 2))
                    .unwrap();
                prop_assert!(stored.scale() <= 1);
                prop_assert!((stored - Decimal::new(cents, 2)).abs() <= dec!(0.05));
            }
        }
    }
}
