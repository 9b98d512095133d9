use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Permission identifier.
///
/// Permissions are opaque strings (e.g. "sale.order.manage"). The wildcard `"*"`
/// grants everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    /// Create, edit and send quotations; confirm and cancel orders.
    pub const ORDER_WRITE: Permission = Permission::from_static("sale.order.write");
    /// Delete quotations and cancelled orders, close orders.
    pub const ORDER_MANAGE: Permission = Permission::from_static("sale.order.manage");
    /// Set a manual discount on order lines.
    pub const LINE_DISCOUNT: Permission = Permission::from_static("sale.line.discount");
    /// Build invoice drafts and register validated invoices.
    pub const INVOICE_CREATE: Permission = Permission::from_static("sale.invoice.create");
    pub const WILDCARD: Permission = Permission::from_static("*");

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
