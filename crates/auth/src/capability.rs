//! Capability tokens passed explicitly into guarded sales operations.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{authorize, Permission, Principal, PrincipalId};

/// A coarse capability checked by the sales core.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Edit quotations and drive the normal order lifecycle.
    EditOrders,
    /// Elevated (manager) capability: deletion of orders.
    ManageOrders,
    /// Manual discounts on order lines.
    EditLineDiscount,
    /// Build invoice drafts and register validated invoices.
    CreateInvoices,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::EditOrders,
        Capability::ManageOrders,
        Capability::EditLineDiscount,
        Capability::CreateInvoices,
    ];

    fn permission(self) -> Permission {
        match self {
            Capability::EditOrders => Permission::ORDER_WRITE,
            Capability::ManageOrders => Permission::ORDER_MANAGE,
            Capability::EditLineDiscount => Permission::LINE_DISCOUNT,
            Capability::CreateInvoices => Permission::INVOICE_CREATE,
        }
    }
}

/// The capabilities a principal holds for one request.
///
/// Issued once at the boundary from a [`Principal`]; domain code only asks
/// `has(...)` and never looks at roles or permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityToken {
    principal_id: PrincipalId,
    capabilities: BTreeSet<Capability>,
}

impl CapabilityToken {
    pub fn issue(principal: &Principal) -> Self {
        let capabilities: BTreeSet<Capability> = Capability::ALL
            .into_iter()
            .filter(|cap| authorize(principal, &cap.permission()).is_ok())
            .collect();

        tracing::debug!(
            principal_id = %principal.principal_id,
            capabilities = ?capabilities,
            "issued capability token"
        );

        Self {
            principal_id: principal.principal_id,
            capabilities,
        }
    }

    /// Token with every capability, for trusted internal callers (cost posting hooks).
    pub fn system(principal_id: PrincipalId) -> Self {
        Self {
            principal_id,
            capabilities: Capability::ALL.into_iter().collect(),
        }
    }

    pub fn principal_id(&self) -> PrincipalId {
        self.principal_id
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn is_manager(&self) -> bool {
        self.has(Capability::ManageOrders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;

    #[test]
    fn salesman_token_has_no_elevated_capability() {
        let principal = Principal::new(PrincipalId::new(), vec![Role::SALESMAN]);
        let token = CapabilityToken::issue(&principal);
        assert!(token.has(Capability::EditOrders));
        assert!(!token.is_manager());
        assert!(!token.has(Capability::EditLineDiscount));
    }

    #[test]
    fn manager_token_can_delete_and_discount() {
        let principal = Principal::new(PrincipalId::new(), vec![Role::SALE_MANAGER]);
        let token = CapabilityToken::issue(&principal);
        assert!(token.is_manager());
        assert!(token.has(Capability::EditLineDiscount));
    }

    #[test]
    fn discount_group_can_be_granted_on_its_own() {
        let principal = Principal::new(PrincipalId::new(), vec![Role::SALESMAN])
            .with_permission(Permission::LINE_DISCOUNT);
        let token = CapabilityToken::issue(&principal);
        assert!(token.has(Capability::EditLineDiscount));
        assert!(!token.is_manager());
    }
}
