//! Strongly typed identifiers.
//!
//! Every persisted entity is keyed by a database-generated `BIGINT`. Wrapping
//! each one in its own type keeps a product id from ever being passed where a
//! variant id is expected, which matters for the lock ordering on
//! `(ProductId, Option<VariantId>)`.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw database id
            #[must_use]
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Get the raw database id
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Identifier of a storefront (a seller's shop)
    StorefrontId
);
define_id!(
    /// Identifier of a platform user (buyer or seller)
    UserId
);
define_id!(
    /// Identifier of a storefront product (listing)
    ProductId
);
define_id!(
    /// Identifier of a product variant (size, colour, ...)
    VariantId
);
define_id!(
    /// Identifier of a shopping cart
    CartId
);
define_id!(
    /// Identifier of a shopping cart line
    CartItemId
);
define_id!(
    /// Identifier of an order
    OrderId
);
define_id!(
    /// Identifier of an order line
    OrderItemId
);
define_id!(
    /// Identifier of an inventory reservation
    ReservationId
);
define_id!(
    /// Identifier of a warehouse that ships goods
    WarehouseId
);

/// Stock keeping unit key: a product, optionally narrowed to one variant.
///
/// Ordering is by product first, then variant (`None` sorts before any
/// variant). Row locks are always taken in this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockKey {
    /// Product
    pub product_id: ProductId,
    /// Variant, when stock is tracked per variant
    pub variant_id: Option<VariantId>,
}

impl StockKey {
    /// Create a stock key
    #[must_use]
    pub const fn new(product_id: ProductId, variant_id: Option<VariantId>) -> Self {
        Self {
            product_id,
            variant_id,
        }
    }
}

impl fmt::Display for StockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.variant_id {
            Some(variant) => write!(f, "{}/{}", self.product_id, variant),
            None => write!(f, "{}", self.product_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_keys_sort_by_product_then_variant() {
        let mut keys = vec![
            StockKey::new(ProductId::new(2), Some(VariantId::new(1))),
            StockKey::new(ProductId::new(1), Some(VariantId::new(7))),
            StockKey::new(ProductId::new(2), None),
            StockKey::new(ProductId::new(1), Some(VariantId::new(3))),
        ];
        keys.sort();

        assert_eq!(
            keys,
            vec![
                StockKey::new(ProductId::new(1), Some(VariantId::new(3))),
                StockKey::new(ProductId::new(1), Some(VariantId::new(7))),
                StockKey::new(ProductId::new(2), None),
                StockKey::new(ProductId::new(2), Some(VariantId::new(1))),
            ]
        );
    }

    #[test]
    fn ids_serialize_as_plain_numbers() {
        let json = serde_json::to_string(&OrderId::new(42)).unwrap_or_default();
        assert_eq!(json, "42");
    }
}
