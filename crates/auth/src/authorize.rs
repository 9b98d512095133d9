use std::collections::BTreeSet;

use thiserror::Error;

use crate::{Permission, PrincipalId, Role};

/// A fully resolved principal for authorization decisions.
///
/// Construction is decoupled from storage and transport: the surrounding system
/// derives roles and explicit permissions from its own user administration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: PrincipalId,
    pub roles: Vec<Role>,
    pub permissions: Vec<Permission>,
}

impl Principal {
    pub fn new(principal_id: PrincipalId, roles: Vec<Role>) -> Self {
        Self {
            principal_id,
            roles,
            permissions: Vec::new(),
        }
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),
}

/// Union of role-granted and explicit permissions.
pub fn effective_permissions(principal: &Principal) -> BTreeSet<Permission> {
    principal
        .roles
        .iter()
        .flat_map(Role::granted_permissions)
        .chain(principal.permissions.iter().cloned())
        .collect()
}

/// Authorize a principal for a single permission.
///
/// - No IO
/// - No panics
/// - No business logic (pure policy check)
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    let perms = effective_permissions(principal);
    if perms.contains(&Permission::WILDCARD) || perms.contains(required) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}
