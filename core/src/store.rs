//! Transactional store traits.
//!
//! The engine runs every operation inside one [`StoreTransaction`] obtained
//! from a [`Database`]. The transaction is the unit of atomicity: nothing
//! written through it is visible to others until [`StoreTransaction::commit`],
//! and dropping it without committing rolls everything back.
//!
//! # Locking contract
//!
//! | Method | Lock |
//! |---|---|
//! | [`CatalogStore::lock_storefront_shared`] | shared (`FOR SHARE`) |
//! | [`CatalogStore::lock_product`] | exclusive on the stock row; a variant also shares its product row |
//! | [`CartStore::lock_cart`], [`CartStore::lock_owner_cart`] | exclusive on the cart |
//! | [`OrderStore::lock_order`] | exclusive on the order |
//! | [`ReservationStore::lock_reservation`], [`ReservationStore::lock_order_reservations`] | exclusive |
//! | [`ReservationStore::lock_expired_reservations`] | exclusive, skipping rows locked by others |
//!
//! Callers that lock several products must do so in ascending
//! [`StockKey`] order. A variant lock takes the product row before the
//! variant row, so keys of one product always meet on the product row
//! first. Lock waits that time out surface as [`StoreError::Conflict`].

use crate::cart::{CartItem, CartOwner, NewCartItem, ShoppingCart};
use crate::catalog::{ProductSnapshot, Storefront};
use crate::error::StoreError;
use crate::ids::{
    CartId, CartItemId, OrderId, ProductId, ReservationId, StockKey, StorefrontId, UserId,
    VariantId,
};
use crate::order::{NewOrder, NewOrderItem, Order, OrderFilter, OrderItem, OrderPage, OrderStats};
use crate::pricing::OrderTotals;
use crate::reservation::{InventoryReservation, NewReservation, ReservationStatus};
use chrono::{DateTime, Utc};
use std::future::Future;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storefront and product rows owned by the catalog.
pub trait CatalogStore: Send {
    /// Read a storefront under a shared lock.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if it does not exist.
    fn lock_storefront_shared(
        &mut self,
        id: StorefrontId,
    ) -> impl Future<Output = StoreResult<Storefront>> + Send;

    /// Read a storefront without locking.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if it does not exist.
    fn get_storefront(
        &mut self,
        id: StorefrontId,
    ) -> impl Future<Output = StoreResult<Storefront>> + Send;

    /// Read a product (and variant) under an exclusive lock.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the product or variant does not exist.
    fn lock_product(
        &mut self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> impl Future<Output = StoreResult<ProductSnapshot>> + Send;

    /// Read a product (and variant) without locking.
    ///
    /// Never used for stock or price decisions inside an order transaction.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the product or variant does not exist.
    fn get_product(
        &mut self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> impl Future<Output = StoreResult<ProductSnapshot>> + Send;

    /// Add `delta` (may be negative) to the stock of a locked row and return
    /// the new quantity.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the row does not exist.
    fn adjust_stock(
        &mut self,
        key: StockKey,
        delta: i32,
    ) -> impl Future<Output = StoreResult<i32>> + Send;
}

/// Shopping carts and their lines.
pub trait CartStore: Send {
    /// Read a cart with its lines under an exclusive lock.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if it does not exist.
    fn lock_cart(&mut self, id: CartId) -> impl Future<Output = StoreResult<ShoppingCart>> + Send;

    /// Find and lock the cart of `owner` in `storefront`.
    ///
    /// # Errors
    ///
    /// Store failures only; a missing cart is `Ok(None)`.
    fn lock_owner_cart(
        &mut self,
        owner: &CartOwner,
        storefront_id: StorefrontId,
    ) -> impl Future<Output = StoreResult<Option<ShoppingCart>>> + Send;

    /// Create an empty cart.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if a cart for this owner and storefront already exists.
    fn insert_cart(
        &mut self,
        owner: &CartOwner,
        storefront_id: StorefrontId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = StoreResult<ShoppingCart>> + Send;

    /// Add a line to a cart.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the cart does not exist.
    fn insert_cart_item(
        &mut self,
        cart_id: CartId,
        item: &NewCartItem,
        now: DateTime<Utc>,
    ) -> impl Future<Output = StoreResult<CartItem>> + Send;

    /// Overwrite quantity, price and totals of an existing line.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the line does not exist.
    fn update_cart_item(&mut self, item: &CartItem) -> impl Future<Output = StoreResult<()>> + Send;

    /// Delete one line. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Store failures only.
    fn delete_cart_item(
        &mut self,
        cart_id: CartId,
        item_id: CartItemId,
    ) -> impl Future<Output = StoreResult<bool>> + Send;

    /// Delete every line of a cart. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Store failures only.
    fn clear_cart(&mut self, cart_id: CartId) -> impl Future<Output = StoreResult<u64>> + Send;

    /// Delete a cart and its lines.
    ///
    /// # Errors
    ///
    /// Store failures only.
    fn delete_cart(&mut self, cart_id: CartId) -> impl Future<Output = StoreResult<()>> + Send;

    /// All carts of a user across storefronts.
    ///
    /// # Errors
    ///
    /// Store failures only.
    fn list_user_carts(
        &mut self,
        user_id: UserId,
    ) -> impl Future<Output = StoreResult<Vec<ShoppingCart>>> + Send;
}

/// Orders and order lines.
pub trait OrderStore: Send {
    /// Insert an order header in `pending` with zeroed money fields.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if the order number is taken.
    fn insert_order(&mut self, order: &NewOrder) -> impl Future<Output = StoreResult<Order>> + Send;

    /// Insert one order line.
    ///
    /// # Errors
    ///
    /// Store failures only.
    fn insert_order_item(
        &mut self,
        item: &NewOrderItem,
    ) -> impl Future<Output = StoreResult<OrderItem>> + Send;

    /// Persist computed money fields.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the order does not exist.
    fn update_order_totals(
        &mut self,
        order_id: OrderId,
        totals: &OrderTotals,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Read an order with its lines under an exclusive lock.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if it does not exist.
    fn lock_order(&mut self, id: OrderId) -> impl Future<Output = StoreResult<Order>> + Send;

    /// Read an order with its lines.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if it does not exist.
    fn get_order(&mut self, id: OrderId) -> impl Future<Output = StoreResult<Order>> + Send;

    /// Persist status, payment fields, timestamps, tracking and notes.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if it does not exist.
    fn save_order_state(&mut self, order: &Order) -> impl Future<Output = StoreResult<()>> + Send;

    /// Filtered, paginated listing, newest first.
    ///
    /// # Errors
    ///
    /// Store failures only.
    fn list_orders(
        &mut self,
        filter: &OrderFilter,
        max_limit: i64,
    ) -> impl Future<Output = StoreResult<OrderPage>> + Send;

    /// Aggregate figures over all orders matching `filter` (paging ignored).
    ///
    /// # Errors
    ///
    /// Store failures only.
    fn order_stats(
        &mut self,
        filter: &OrderFilter,
    ) -> impl Future<Output = StoreResult<OrderStats>> + Send;

    /// Pending orders created before `created_before` that have reservations
    /// but none of them active.
    ///
    /// # Errors
    ///
    /// Store failures only.
    fn find_unbacked_pending_orders(
        &mut self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> impl Future<Output = StoreResult<Vec<OrderId>>> + Send;
}

/// Reservation rows.
pub trait ReservationStore: Send {
    /// Insert an `active` reservation.
    ///
    /// # Errors
    ///
    /// Store failures only.
    fn insert_reservation(
        &mut self,
        reservation: &NewReservation,
    ) -> impl Future<Output = StoreResult<InventoryReservation>> + Send;

    /// Read one reservation under an exclusive lock.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if it does not exist.
    fn lock_reservation(
        &mut self,
        id: ReservationId,
    ) -> impl Future<Output = StoreResult<InventoryReservation>> + Send;

    /// Read every reservation of an order under an exclusive lock, ordered by
    /// stock key.
    ///
    /// # Errors
    ///
    /// Store failures only.
    fn lock_order_reservations(
        &mut self,
        order_id: OrderId,
    ) -> impl Future<Output = StoreResult<Vec<InventoryReservation>>> + Send;

    /// Active reservations with `expires_at < now`, locked, skipping rows
    /// another transaction holds.
    ///
    /// # Errors
    ///
    /// Store failures only.
    fn lock_expired_reservations(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> impl Future<Output = StoreResult<Vec<InventoryReservation>>> + Send;

    /// Change the status of a locked reservation.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if it does not exist.
    fn set_reservation_status(
        &mut self,
        id: ReservationId,
        status: ReservationStatus,
        now: DateTime<Utc>,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Units held by active, unexpired soft holds on `key`.
    ///
    /// # Errors
    ///
    /// Store failures only.
    fn soft_held_quantity(
        &mut self,
        key: StockKey,
        now: DateTime<Utc>,
    ) -> impl Future<Output = StoreResult<i64>> + Send;
}

/// One database transaction spanning every store.
pub trait StoreTransaction: CatalogStore + CartStore + OrderStore + ReservationStore {
    /// Make every write durable and visible.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] on serialization failure, otherwise
    /// [`StoreError::Database`].
    fn commit(self) -> impl Future<Output = StoreResult<()>> + Send;

    /// Discard every write.
    ///
    /// # Errors
    ///
    /// Store failures only.
    fn rollback(self) -> impl Future<Output = StoreResult<()>> + Send;
}

/// Source of transactions.
pub trait Database: Send + Sync + 'static {
    /// Transaction type
    type Tx: StoreTransaction + 'static;

    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if no connection could be acquired in time.
    fn begin(&self) -> impl Future<Output = StoreResult<Self::Tx>> + Send;
}
