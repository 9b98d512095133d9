//! `saleflow-auth`: principals, roles, permissions and capability tokens.
//!
//! Sales operations never consult ambient session state: callers resolve a
//! [`Principal`] once and pass a [`CapabilityToken`] into every guarded operation.

pub mod authorize;
pub mod capability;
pub mod permissions;
pub mod principal;
pub mod roles;

pub use authorize::{authorize, effective_permissions, AuthzError, Principal};
pub use capability::{Capability, CapabilityToken};
pub use permissions::Permission;
pub use principal::PrincipalId;
pub use roles::Role;
