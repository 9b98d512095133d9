//! Order line pricing engine.
//!
//! Onchange-style recomputation entry points. Each returns a [`LineProposal`]: a
//! proposed line snapshot plus non-fatal warnings. Nothing here mutates or persists
//! the line; the caller decides whether to apply the proposal through the order.
//!
//! When a collaborator cannot answer (unknown pricelist, unmapped fiscal position,
//! incompatible units) the previous values are kept and a warning is returned.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use saleflow_auth::{Capability, CapabilityToken};
use saleflow_core::{DomainError, DomainResult};
use saleflow_products::{
    fix_tax_included_price, PriceRequest, PricelistResolver, Product, TaxMapper, Uom, UomConverter,
};

use crate::{OrderLine, SalesOrder};

/// The pricing collaborators a recomputation may consult.
#[derive(Clone, Copy)]
pub struct PricingContext<'a> {
    pub pricelists: &'a dyn PricelistResolver,
    pub taxes: &'a dyn TaxMapper,
    pub uoms: &'a dyn UomConverter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EngineWarning {
    PricelistUnavailable,
    TaxMappingUnavailable,
    UomCategoryMismatch { from: String, to: String },
    DiscountNotAllowed,
}

impl core::fmt::Display for EngineWarning {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EngineWarning::PricelistUnavailable => f.write_str("pricelist could not price the product; price kept"),
            EngineWarning::TaxMappingUnavailable => f.write_str("taxes could not be mapped; taxes kept"),
            EngineWarning::UomCategoryMismatch { from, to } => write!(
                f,
                "'{from}' and '{to}' are not in the same category; price kept"
            ),
            EngineWarning::DiscountNotAllowed => f.write_str("manual discounts are not allowed for this user"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineProposal {
    pub line: OrderLine,
    pub warnings: Vec<EngineWarning>,
}

impl LineProposal {
    fn unchanged(line: &OrderLine, warning: EngineWarning) -> Self {
        Self {
            line: line.clone(),
            warnings: vec![warning],
        }
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Resolve price, discount and taxes of `line` for `product` in the order context.
///
/// The pricelist is asked for the product's price in the line's unit; fiscal
/// position mapping is applied to the product taxes; a price quoted with
/// inclusive taxes that the mapping dropped (or added) is rescaled so the
/// tax-exclusive amount is preserved. A manual discount is kept.
pub fn resolve_price_and_tax(
    ctx: PricingContext<'_>,
    order: &SalesOrder,
    product: &Product,
    line: &OrderLine,
) -> LineProposal {
    let header = order.header();
    let mut proposed = line.clone();
    let mut warnings = Vec::new();

    if order.line(line.id).is_none() {
        proposed.invoice_policy = product.invoice_policy;
    }
    if proposed.name.trim().is_empty() || proposed.product_id != Some(product.id) {
        proposed.name = product.name.clone();
    }
    proposed.product_id = Some(product.id);
    let uom = match &proposed.product_uom {
        Some(uom) if uom.same_category(&product.uom) => uom.clone(),
        _ => product.uom.clone(),
    };
    proposed.product_uom = Some(uom.clone());

    let mapped = ctx
        .taxes
        .map_taxes(header.fiscal_position_id, &product.taxes, product, header.partner_id);
    match &mapped {
        Some(taxes) => proposed.taxes = taxes.clone(),
        None => {
            tracing::warn!(order = %order.name(), product = %product.id, "tax mapping unavailable");
            warnings.push(EngineWarning::TaxMappingUnavailable);
        }
    }

    let request = PriceRequest {
        pricelist: header.pricelist_id,
        product,
        partner: header.partner_id,
        quantity: proposed.product_uom_qty,
        uom: &uom,
        date: header.date_order.date_naive(),
    };
    match ctx.pricelists.resolve(&request) {
        Some(quote) => {
            proposed.price_unit = match &mapped {
                Some(taxes) => fix_tax_included_price(quote.price_unit, &product.taxes, taxes, &header.currency),
                None => quote.price_unit,
            };
            if !proposed.manual_discount {
                proposed.discount = quote.discount;
            }
        }
        None => {
            tracing::warn!(order = %order.name(), pricelist = %header.pricelist_id, "pricelist unavailable");
            warnings.push(EngineWarning::PricelistUnavailable);
        }
    }

    proposed.recompute_amounts(&header.currency);
    LineProposal {
        line: proposed,
        warnings,
    }
}

/// Re-express the line price in `new_uom`.
///
/// Within one category the price is converted; otherwise the unit is applied but
/// the price is kept and a warning returned.
pub fn on_uom_change(ctx: PricingContext<'_>, order: &SalesOrder, line: &OrderLine, new_uom: &Uom) -> LineProposal {
    let mut proposed = line.clone();
    let mut warnings = Vec::new();

    if let Some(old) = &line.product_uom {
        match ctx.uoms.convert_price(line.price_unit, old, new_uom) {
            Ok(price) => proposed.price_unit = price.normalize(),
            Err(_) => warnings.push(EngineWarning::UomCategoryMismatch {
                from: old.name.clone(),
                to: new_uom.name.clone(),
            }),
        }
    }
    proposed.product_uom = Some(new_uom.clone());

    proposed.recompute_amounts(order.currency());
    LineProposal {
        line: proposed,
        warnings,
    }
}

/// Apply a manual discount.
///
/// Without the discount capability the line is returned unchanged with a warning.
pub fn on_discount_change(
    order: &SalesOrder,
    line: &OrderLine,
    discount: Decimal,
    token: &CapabilityToken,
) -> DomainResult<LineProposal> {
    if discount < Decimal::ZERO || discount > Decimal::ONE_HUNDRED {
        return Err(DomainError::validation("discount must be between 0 and 100"));
    }
    if !token.has(Capability::EditLineDiscount) {
        return Ok(LineProposal::unchanged(line, EngineWarning::DiscountNotAllowed));
    }

    let mut proposed = line.clone();
    proposed.discount = discount;
    proposed.manual_discount = true;
    proposed.recompute_amounts(order.currency());
    Ok(LineProposal {
        line: proposed,
        warnings: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, NaiveDate, Utc};
    use rust_decimal_macros::dec;
    use saleflow_auth::{Principal, PrincipalId, Role};
    use saleflow_core::{Currency, CurrencyId, FiscalPositionId, OrderId, PartnerId, PricelistId, UomCategoryId};
    use saleflow_events::execute;
    use saleflow_products::{
        DiscountPolicy, FactorUomConverter, FiscalPosition, FiscalPositionBook, PriceComputation, Pricelist,
        PricelistBook, PricelistItem, Tax,
    };

    use crate::{CreateOrder, OrderHeader, SalesOrderCommand};

    struct Fixture {
        pricelists: PricelistBook,
        taxes: FiscalPositionBook,
        uoms: FactorUomConverter,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                pricelists: PricelistBook::new(),
                taxes: FiscalPositionBook::new(),
                uoms: FactorUomConverter,
            }
        }

        fn ctx(&self) -> PricingContext<'_> {
            PricingContext {
                pricelists: &self.pricelists,
                taxes: &self.taxes,
                uoms: &self.uoms,
            }
        }
    }

    fn at(date: &str) -> DateTime<Utc> {
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc()
    }

    fn order(header: OrderHeader) -> SalesOrder {
        let order_id = OrderId::new();
        let mut order = SalesOrder::empty(order_id);
        execute(
            &mut order,
            &SalesOrderCommand::CreateOrder(CreateOrder {
                order_id,
                name: "SO001".to_string(),
                header,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        order
    }

    fn eur() -> Currency {
        Currency::new(CurrencyId::new(), "EUR", 2)
    }

    fn discount_token() -> CapabilityToken {
        CapabilityToken::issue(&Principal::new(PrincipalId::new(), vec![Role::SALE_MANAGER]))
    }

    #[test]
    fn inclusive_tax_mapped_to_zero_rescales_price() {
        let mut fx = Fixture::new();
        let unit = Uom::reference(UomCategoryId::new(), "Unit(s)");
        let incl = Tax::percent("Include tax", dec!(21)).included();
        let excl = Tax::percent("Exclude tax", dec!(0));
        let product = Product::new("Voiture", dec!(121), unit).with_taxes(vec![incl.clone()]);
        let fp_id = fx.taxes.insert(FiscalPosition::new("fiscal position").with_mapping(&incl, Some(excl.clone())));
        let pl_id = fx.pricelists.insert(Pricelist::new("Public Pricelist"));

        let header = OrderHeader::new(PartnerId::new(), pl_id, eur(), Utc::now()).with_fiscal_position(fp_id);
        let order = order(header);
        let mut line = OrderLine::for_product(&product, dec!(1));
        line.price_unit = dec!(121);

        let proposal = resolve_price_and_tax(fx.ctx(), &order, &product, &line);
        assert!(proposal.is_clean());
        assert_eq!(proposal.line.price_unit, dec!(100));
        assert_eq!(proposal.line.taxes, vec![excl]);
        assert_eq!(proposal.line.price_subtotal, dec!(100));
    }

    #[test]
    fn pricelist_window_follows_order_date() {
        let mut fx = Fixture::new();
        let unit = Uom::reference(UomCategoryId::new(), "Unit(s)");
        let product = Product::new("Support", dec!(100), unit);
        let day = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        let pl_id = fx.pricelists.insert(
            Pricelist::new("Christmas pricelist")
                .with_item(
                    PricelistItem::global(PriceComputation::Percentage(dec!(20)))
                        .between(day("2017-12-01"), day("2017-12-24")),
                )
                .with_item(
                    PricelistItem::global(PriceComputation::Percentage(dec!(50)))
                        .between(day("2017-12-25"), day("2017-12-31")),
                ),
        );
        let line = OrderLine::for_product(&product, dec!(1));

        let early = order(OrderHeader::new(PartnerId::new(), pl_id, eur(), at("2017-12-20")));
        assert_eq!(resolve_price_and_tax(fx.ctx(), &early, &product, &line).line.price_unit, dec!(80));

        let late = order(OrderHeader::new(PartnerId::new(), pl_id, eur(), at("2017-12-30")));
        assert_eq!(resolve_price_and_tax(fx.ctx(), &late, &product, &line).line.price_unit, dec!(50));
    }

    #[test]
    fn unit_change_scales_price_and_keeps_discount() {
        let mut fx = Fixture::new();
        let categ = UomCategoryId::new();
        let unit = Uom::reference(categ, "Unit(s)");
        let pack = Uom::bigger(categ, "10 Units", dec!(10)).with_rounding(dec!(1));
        let product = Product::new("Computer case", dec!(100), unit);
        let day = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        let pl_id = fx.pricelists.insert(
            Pricelist::new("Christmas pricelist")
                .with_policy(DiscountPolicy::WithoutDiscount)
                .with_item(
                    PricelistItem::global(PriceComputation::Percentage(dec!(10)))
                        .between(day("2017-12-01"), day("2017-12-30")),
                ),
        );
        let order = order(OrderHeader::new(PartnerId::new(), pl_id, eur(), at("2017-12-20")));
        let line = OrderLine::for_product(&product, dec!(1));

        let priced = resolve_price_and_tax(fx.ctx(), &order, &product, &line).line;
        let discounted = on_discount_change(&order, &priced, priced.discount, &discount_token())
            .unwrap()
            .line;
        assert_eq!(discounted.price_subtotal, dec!(90));
        assert_eq!(discounted.discount, dec!(10));

        let repacked = on_uom_change(fx.ctx(), &order, &discounted, &pack);
        assert!(repacked.is_clean());
        assert_eq!(repacked.line.price_unit, dec!(1000));
        assert_eq!(repacked.line.price_subtotal, dec!(900));
        assert_eq!(repacked.line.discount, dec!(10));
    }

    #[test]
    fn unit_from_other_category_keeps_price_with_warning() {
        let fx = Fixture::new();
        let unit = Uom::reference(UomCategoryId::new(), "Unit(s)");
        let hours = Uom::reference(UomCategoryId::new(), "Hour(s)");
        let product = Product::new("Desk", dec!(100), unit);
        let order = order(OrderHeader::new(PartnerId::new(), PricelistId::new(), eur(), Utc::now()));
        let line = OrderLine::for_product(&product, dec!(2));

        let proposal = on_uom_change(fx.ctx(), &order, &line, &hours);
        assert_eq!(proposal.line.price_unit, dec!(100));
        assert!(matches!(proposal.warnings[0], EngineWarning::UomCategoryMismatch { .. }));
    }

    #[test]
    fn unavailable_collaborators_keep_prior_values() {
        let fx = Fixture::new();
        let unit = Uom::reference(UomCategoryId::new(), "Unit(s)");
        let product = Product::new("Desk", dec!(100), unit).with_taxes(vec![Tax::percent("VAT", dec!(21))]);
        let header = OrderHeader::new(PartnerId::new(), PricelistId::new(), eur(), Utc::now())
            .with_fiscal_position(FiscalPositionId::new());
        let order = order(header);
        let mut line = OrderLine::for_product(&product, dec!(1));
        line.price_unit = dec!(77);
        line.taxes = vec![];

        let proposal = resolve_price_and_tax(fx.ctx(), &order, &product, &line);
        assert_eq!(proposal.line.price_unit, dec!(77));
        assert!(proposal.line.taxes.is_empty());
        assert_eq!(
            proposal.warnings,
            vec![EngineWarning::TaxMappingUnavailable, EngineWarning::PricelistUnavailable]
        );
    }

    #[test]
    fn manual_discount_survives_price_recomputation() {
        let mut fx = Fixture::new();
        let unit = Uom::reference(UomCategoryId::new(), "Unit(s)");
        let product = Product::new("Desk", dec!(100), unit);
        let pl_id = fx.pricelists.insert(Pricelist::new("Public"));
        let order = order(OrderHeader::new(PartnerId::new(), pl_id, eur(), Utc::now()));
        let line = OrderLine::for_product(&product, dec!(1));

        let discounted = on_discount_change(&order, &line, dec!(15), &discount_token()).unwrap().line;
        let mut more = discounted.clone();
        more.product_uom_qty = dec!(2);
        let repriced = resolve_price_and_tax(fx.ctx(), &order, &product, &more).line;
        assert_eq!(repriced.discount, dec!(15));
        assert_eq!(repriced.price_subtotal, dec!(170));
    }

    #[test]
    fn discount_without_capability_is_a_no_op() {
        let unit = Uom::reference(UomCategoryId::new(), "Unit(s)");
        let product = Product::new("Desk", dec!(100), unit);
        let order = order(OrderHeader::new(PartnerId::new(), PricelistId::new(), eur(), Utc::now()));
        let line = OrderLine::for_product(&product, dec!(1));
        let salesman = CapabilityToken::issue(&Principal::new(PrincipalId::new(), vec![Role::SALESMAN]));

        let proposal = on_discount_change(&order, &line, dec!(30), &salesman).unwrap();
        assert_eq!(proposal.line, line);
        assert_eq!(proposal.warnings, vec![EngineWarning::DiscountNotAllowed]);

        let err = on_discount_change(&order, &line, dec!(101), &discount_token()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
