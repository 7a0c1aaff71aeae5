//! Storefront and product snapshots.
//!
//! Storefronts and products are owned by the catalog outside this engine.
//! The engine only ever sees them as values read from the store, either
//! under a shared lock (storefront) or an exclusive lock (product/variant).

use crate::ids::{ProductId, StockKey, StorefrontId, UserId, VariantId, WarehouseId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Storefront
// ============================================================================

/// Seller subscription plan. Drives commission and escrow length.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPlan {
    /// Entry plan
    Starter,
    /// Mid plan
    Professional,
    /// Upper plan
    Business,
    /// Top plan
    Enterprise,
    /// A plan name this engine does not know about
    #[serde(untagged)]
    Unknown(String),
}

impl SubscriptionPlan {
    /// Parse a stored plan name. Matching is case-insensitive and never fails.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "starter" => Self::Starter,
            "professional" => Self::Professional,
            "business" => Self::Business,
            "enterprise" => Self::Enterprise,
            _ => Self::Unknown(value.to_string()),
        }
    }

    /// Stored representation
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Starter => "starter",
            Self::Professional => "professional",
            Self::Business => "business",
            Self::Enterprise => "enterprise",
            Self::Unknown(other) => other,
        }
    }
}

impl fmt::Display for SubscriptionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storefront as seen by the order engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Storefront {
    /// Storefront id
    pub id: StorefrontId,
    /// Seller who owns the storefront
    pub owner_id: UserId,
    /// Display name
    pub name: String,
    /// Whether the storefront accepts orders
    pub is_active: bool,
    /// Subscription plan
    pub subscription_plan: SubscriptionPlan,
    /// Pickup/return address, if configured
    pub address: Option<Address>,
}

// ============================================================================
// Product
// ============================================================================

/// Product or variant row as read under an exclusive lock.
///
/// When `variant_id` is set, `price`, `stock_quantity`, `sku` and
/// `is_active` come from the variant and the product must be active too.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    /// Product
    pub product_id: ProductId,
    /// Variant, if the line targets one
    pub variant_id: Option<VariantId>,
    /// Storefront that sells it
    pub storefront_id: StorefrontId,
    /// Product name
    pub name: String,
    /// Stock keeping unit code
    pub sku: Option<String>,
    /// Current unit price
    pub price: Decimal,
    /// Units on hand (already net of in-transaction order holds)
    pub stock_quantity: i32,
    /// Product and variant are both active
    pub is_active: bool,
    /// Typed attributes (variant attributes override product ones)
    pub attributes: ProductAttributes,
    /// Warehouse that ships it, if assigned
    pub warehouse_id: Option<WarehouseId>,
}

impl ProductSnapshot {
    /// Lock/stock key of this row
    #[must_use]
    pub const fn key(&self) -> StockKey {
        StockKey::new(self.product_id, self.variant_id)
    }
}

/// A single product attribute value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    /// Free text ("red", "cotton")
    Text(String),
    /// Numeric measure (weight, size)
    Number(Decimal),
    /// Yes/no flag
    Flag(bool),
    /// Several options at once
    List(Vec<String>),
}

/// Attribute bag keyed by attribute code.
pub type ProductAttributes = BTreeMap<String, AttributeValue>;

// ============================================================================
// Addresses
// ============================================================================

/// Postal address used for shipping, billing and pickup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Recipient name
    pub recipient: String,
    /// Street and house number
    pub street: String,
    /// City
    pub city: String,
    /// Postal code
    pub postal_code: String,
    /// ISO country code
    pub country: String,
    /// Contact phone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl Address {
    /// Names of the required fields that are blank.
    #[must_use]
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("recipient", &self.recipient),
            ("street", &self.street),
            ("city", &self.city),
            ("postal_code", &self.postal_code),
            ("country", &self.country),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect()
    }
}
