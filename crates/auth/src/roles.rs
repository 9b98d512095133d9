use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::Permission;

/// Role identifier used for RBAC.
///
/// The built-in sales roles map to a fixed permission set; unknown roles grant
/// nothing and rely on explicit permissions on the principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub const SALESMAN: Role = Role(Cow::Borrowed("sale.salesman"));
    pub const SALE_MANAGER: Role = Role(Cow::Borrowed("sale.manager"));
    pub const INVOICING: Role = Role(Cow::Borrowed("account.invoice"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Permissions granted by this role.
    pub fn granted_permissions(&self) -> Vec<Permission> {
        match self.as_str() {
            "sale.salesman" => vec![Permission::ORDER_WRITE],
            "sale.manager" => vec![
                Permission::ORDER_WRITE,
                Permission::ORDER_MANAGE,
                Permission::LINE_DISCOUNT,
                Permission::INVOICE_CREATE,
            ],
            "account.invoice" => vec![Permission::ORDER_WRITE, Permission::INVOICE_CREATE],
            _ => Vec::new(),
        }
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
