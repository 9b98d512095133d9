//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $t:ident, $name:literal) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(Uuid);

        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

uuid_newtype!(
    /// Identifier of a sales order.
    OrderId, "OrderId"
);
uuid_newtype!(
    /// Identifier of a sales order line (unique across orders).
    OrderLineId, "OrderLineId"
);
uuid_newtype!(ProductId, "ProductId");
uuid_newtype!(
    /// Customer, invoicing or shipping partner.
    PartnerId, "PartnerId"
);
uuid_newtype!(PricelistId, "PricelistId");
uuid_newtype!(FiscalPositionId, "FiscalPositionId");
uuid_newtype!(TaxId, "TaxId");
uuid_newtype!(CurrencyId, "CurrencyId");
uuid_newtype!(UomId, "UomId");
uuid_newtype!(UomCategoryId, "UomCategoryId");
uuid_newtype!(
    /// Analytic account (project) costs are posted against.
    AnalyticAccountId, "AnalyticAccountId"
);
uuid_newtype!(AnalyticLineId, "AnalyticLineId");
uuid_newtype!(
    /// Sales team an order is booked under.
    TeamId, "TeamId"
);
