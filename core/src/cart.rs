//! Shopping carts.

use crate::ids::{CartId, CartItemId, ProductId, StockKey, StorefrontId, UserId, VariantId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who a cart belongs to: a signed-in user or an anonymous session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CartOwner {
    /// Authenticated buyer
    User(UserId),
    /// Anonymous session token
    Session(String),
}

impl CartOwner {
    /// Whether `buyer` (optionally carrying `session_token`) may use this cart.
    #[must_use]
    pub fn is_owned_by(&self, buyer: UserId, session_token: Option<&str>) -> bool {
        match self {
            Self::User(user) => *user == buyer,
            Self::Session(token) => session_token.is_some_and(|candidate| candidate == token),
        }
    }

    /// User id, if this is a user cart
    #[must_use]
    pub const fn user_id(&self) -> Option<UserId> {
        match self {
            Self::User(user) => Some(*user),
            Self::Session(_) => None,
        }
    }

    /// Session token, if this is an anonymous cart
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::User(_) => None,
            Self::Session(token) => Some(token),
        }
    }
}

impl fmt::Display for CartOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(user) => write!(f, "user:{user}"),
            Self::Session(_) => f.write_str("session"),
        }
    }
}

/// One product line in a cart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    /// Line id
    pub id: CartItemId,
    /// Owning cart
    pub cart_id: CartId,
    /// Product
    pub product_id: ProductId,
    /// Variant, if any
    pub variant_id: Option<VariantId>,
    /// Units, always positive
    pub quantity: i32,
    /// Unit price captured from the product row
    pub price_per_unit: Decimal,
    /// `price_per_unit × quantity`
    pub total_price: Decimal,
    /// Line creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl CartItem {
    /// Stock key of the line
    #[must_use]
    pub const fn key(&self) -> StockKey {
        StockKey::new(self.product_id, self.variant_id)
    }

    /// Set the quantity and recompute the line total.
    pub fn set_quantity(&mut self, quantity: i32, now: DateTime<Utc>) {
        self.quantity = quantity;
        self.recompute(now);
    }

    /// Set the unit price and recompute the line total.
    pub fn set_price(&mut self, price: Decimal, now: DateTime<Utc>) {
        self.price_per_unit = price;
        self.recompute(now);
    }

    fn recompute(&mut self, now: DateTime<Utc>) {
        self.total_price = line_total(self.price_per_unit, self.quantity);
        self.updated_at = now;
    }
}

/// Values for a cart line that does not exist yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewCartItem {
    /// Product
    pub product_id: ProductId,
    /// Variant, if any
    pub variant_id: Option<VariantId>,
    /// Units, always positive
    pub quantity: i32,
    /// Unit price from the product row
    pub price_per_unit: Decimal,
}

impl NewCartItem {
    /// Line total derived from price and quantity
    #[must_use]
    pub fn total_price(&self) -> Decimal {
        line_total(self.price_per_unit, self.quantity)
    }
}

/// A buyer's working set for one storefront.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShoppingCart {
    /// Cart id
    pub id: CartId,
    /// Owner (user xor session)
    pub owner: CartOwner,
    /// Storefront this cart buys from
    pub storefront_id: StorefrontId,
    /// Lines
    pub items: Vec<CartItem>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl ShoppingCart {
    /// Sum of line totals
    #[must_use]
    pub fn total_amount(&self) -> Decimal {
        self.items.iter().map(|item| item.total_price).sum()
    }

    /// Sum of line quantities
    #[must_use]
    pub fn item_count(&self) -> i64 {
        self.items.iter().map(|item| i64::from(item.quantity)).sum()
    }

    /// Whether the cart has no lines
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Line for a product/variant, if present
    #[must_use]
    pub fn find_item(&self, key: StockKey) -> Option<&CartItem> {
        self.items.iter().find(|item| item.key() == key)
    }
}

/// Unit price change detected while recalculating a cart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceChange {
    /// Affected line
    pub item_id: CartItemId,
    /// Product
    pub product_id: ProductId,
    /// Variant, if any
    pub variant_id: Option<VariantId>,
    /// Price stored on the line
    pub old_price: Decimal,
    /// Current product price, `None` when the product is no longer sold
    pub new_price: Option<Decimal>,
}

/// `price × quantity`
#[must_use]
pub fn line_total(price: Decimal, quantity: i32) -> Decimal {
    price * Decimal::from(quantity)
}
