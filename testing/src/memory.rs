//! In-memory transactional store.
//!
//! Transactions are fully serialised: [`InMemoryDatabase::begin`] takes a
//! database-wide lock that is held until commit or rollback. Each
//! transaction works on a private copy of the state which replaces the shared
//! state on commit and is thrown away otherwise. This is stricter than the
//! row locks a real database takes, so any interleaving the engine survives
//! here it also survives there, minus deadlocks.

#![allow(clippy::missing_panics_doc)] // Test utilities

use chrono::{DateTime, Utc};
use fulfillment_core::cart::{CartItem, CartOwner, NewCartItem, ShoppingCart};
use fulfillment_core::catalog::{
    AttributeValue, ProductAttributes, ProductSnapshot, Storefront, SubscriptionPlan,
};
use fulfillment_core::error::StoreError;
use fulfillment_core::ids::{
    CartId, CartItemId, OrderId, OrderItemId, ProductId, ReservationId, StockKey, StorefrontId,
    UserId, VariantId, WarehouseId,
};
use fulfillment_core::order::{
    NewOrder, NewOrderItem, Order, OrderFilter, OrderItem, OrderPage, OrderStats, OrderStatus,
};
use fulfillment_core::pricing::OrderTotals;
use fulfillment_core::reservation::{InventoryReservation, NewReservation, ReservationStatus};
use fulfillment_core::store::{
    CartStore, CatalogStore, Database, OrderStore, ReservationStore, StoreResult, StoreTransaction,
};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

// ============================================================================
// Fault injection
// ============================================================================

/// Store operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    /// [`CatalogStore::lock_storefront_shared`]
    LockStorefront,
    /// [`CatalogStore::lock_product`]
    LockProduct,
    /// [`CatalogStore::adjust_stock`]
    AdjustStock,
    /// [`CartStore::lock_cart`]
    LockCart,
    /// [`CartStore::clear_cart`]
    ClearCart,
    /// [`OrderStore::insert_order`]
    InsertOrder,
    /// [`OrderStore::insert_order_item`]
    InsertOrderItem,
    /// [`OrderStore::save_order_state`]
    SaveOrderState,
    /// [`ReservationStore::insert_reservation`]
    InsertReservation,
    /// [`ReservationStore::set_reservation_status`]
    SetReservationStatus,
    /// [`StoreTransaction::commit`]
    Commit,
}

#[derive(Debug)]
struct FailPoint {
    op: StoreOp,
    skip: usize,
    error: StoreError,
}

type FailPoints = Arc<StdMutex<Vec<FailPoint>>>;

fn trip(faults: &FailPoints, op: StoreOp) -> StoreResult<()> {
    let mut points = faults.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(index) = points.iter().position(|point| point.op == op) else {
        return Ok(());
    };
    if points[index].skip > 0 {
        points[index].skip -= 1;
        return Ok(());
    }
    Err(points.remove(index).error)
}

// ============================================================================
// Fixtures
// ============================================================================

/// Product to seed into the catalog.
#[derive(Clone, Debug)]
pub struct ProductSeed {
    name: String,
    price: Decimal,
    stock: i32,
    sku: Option<String>,
    active: bool,
    warehouse: Option<WarehouseId>,
    attributes: ProductAttributes,
}

impl ProductSeed {
    /// Active product with `stock` units at `price`
    #[must_use]
    pub fn new(name: impl Into<String>, price: Decimal, stock: i32) -> Self {
        Self {
            name: name.into(),
            price,
            stock,
            sku: None,
            active: true,
            warehouse: None,
            attributes: ProductAttributes::new(),
        }
    }

    /// Set the SKU
    #[must_use]
    pub fn sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = Some(sku.into());
        self
    }

    /// Mark the product as not for sale
    #[must_use]
    pub const fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Ship from this warehouse
    #[must_use]
    pub const fn warehouse(mut self, warehouse: WarehouseId) -> Self {
        self.warehouse = Some(warehouse);
        self
    }

    /// Add an attribute
    #[must_use]
    pub fn attribute(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Variant to seed under a product.
#[derive(Clone, Debug)]
pub struct VariantSeed {
    sku: Option<String>,
    price: Option<Decimal>,
    stock: i32,
    active: bool,
    attributes: ProductAttributes,
}

impl VariantSeed {
    /// Active variant with `stock` units at the product's price
    #[must_use]
    pub fn new(stock: i32) -> Self {
        Self {
            sku: None,
            price: None,
            stock,
            active: true,
            attributes: ProductAttributes::new(),
        }
    }

    /// Override the product price
    #[must_use]
    pub const fn price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    /// Set the SKU
    #[must_use]
    pub fn sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = Some(sku.into());
        self
    }

    /// Mark the variant as not for sale
    #[must_use]
    pub const fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Add an attribute
    #[must_use]
    pub fn attribute(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Clone, Debug)]
struct ProductRow {
    storefront_id: StorefrontId,
    seed: ProductSeed,
}

#[derive(Clone, Debug)]
struct VariantRow {
    product_id: ProductId,
    seed: VariantSeed,
}

#[derive(Clone, Debug, Default)]
struct MemoryState {
    storefronts: BTreeMap<StorefrontId, Storefront>,
    products: BTreeMap<ProductId, ProductRow>,
    variants: BTreeMap<VariantId, VariantRow>,
    carts: BTreeMap<CartId, ShoppingCart>,
    orders: BTreeMap<OrderId, Order>,
    reservations: BTreeMap<ReservationId, InventoryReservation>,
}

/// Shared id sequence. It lives outside [`MemoryState`] so a rollback never
/// hands the same id out twice.
#[derive(Debug, Default)]
struct Sequence(AtomicI64);

impl Sequence {
    fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl MemoryState {
    fn storefront(&self, id: StorefrontId) -> StoreResult<Storefront> {
        self.storefronts
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("storefront", id))
    }

    fn snapshot(&self, key: StockKey) -> StoreResult<ProductSnapshot> {
        let product = self
            .products
            .get(&key.product_id)
            .ok_or_else(|| StoreError::not_found("product", key.product_id))?;
        let seed = &product.seed;

        let Some(variant_id) = key.variant_id else {
            return Ok(ProductSnapshot {
                product_id: key.product_id,
                variant_id: None,
                storefront_id: product.storefront_id,
                name: seed.name.clone(),
                sku: seed.sku.clone(),
                price: seed.price,
                stock_quantity: seed.stock,
                is_active: seed.active,
                attributes: seed.attributes.clone(),
                warehouse_id: seed.warehouse,
            });
        };

        let variant = self
            .variants
            .get(&variant_id)
            .filter(|variant| variant.product_id == key.product_id)
            .ok_or_else(|| StoreError::not_found("variant", variant_id))?;
        let mut attributes = seed.attributes.clone();
        attributes.extend(variant.seed.attributes.clone());

        Ok(ProductSnapshot {
            product_id: key.product_id,
            variant_id: Some(variant_id),
            storefront_id: product.storefront_id,
            name: seed.name.clone(),
            sku: variant.seed.sku.clone().or_else(|| seed.sku.clone()),
            price: variant.seed.price.unwrap_or(seed.price),
            stock_quantity: variant.seed.stock,
            is_active: seed.active && variant.seed.active,
            attributes,
            warehouse_id: seed.warehouse,
        })
    }

    fn stock_mut(&mut self, key: StockKey) -> StoreResult<&mut i32> {
        match key.variant_id {
            Some(variant_id) => self
                .variants
                .get_mut(&variant_id)
                .filter(|variant| variant.product_id == key.product_id)
                .map(|variant| &mut variant.seed.stock)
                .ok_or_else(|| StoreError::not_found("variant", variant_id)),
            None => self
                .products
                .get_mut(&key.product_id)
                .map(|product| &mut product.seed.stock)
                .ok_or_else(|| StoreError::not_found("product", key.product_id)),
        }
    }

    fn matches(&self, order: &Order, filter: &OrderFilter) -> bool {
        let seller = self
            .storefronts
            .get(&order.storefront_id)
            .map(|storefront| storefront.owner_id);

        filter.storefront_id.is_none_or(|id| order.storefront_id == id)
            && filter.customer_id.is_none_or(|id| order.customer_id == id)
            && filter.seller_id.is_none_or(|id| seller == Some(id))
            && filter.status.is_none_or(|status| order.status == status)
            && filter.created_from.is_none_or(|from| order.created_at >= from)
            && filter.created_to.is_none_or(|to| order.created_at < to)
            && filter.min_total.is_none_or(|min| order.totals.total >= min)
            && filter.max_total.is_none_or(|max| order.totals.total <= max)
            && filter
                .order_number
                .as_ref()
                .is_none_or(|number| &order.order_number == number)
            && filter
                .tracking_number
                .as_ref()
                .is_none_or(|tracking| order.tracking_number.as_ref() == Some(tracking))
    }
}

// ============================================================================
// Database
// ============================================================================

/// In-memory [`Database`] for tests.
#[derive(Clone, Debug)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
    sequence: Arc<Sequence>,
    faults: FailPoints,
    lock_timeout: Duration,
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDatabase {
    /// Empty database with a 5 second lock wait timeout
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            sequence: Arc::new(Sequence::default()),
            faults: Arc::new(StdMutex::new(Vec::new())),
            lock_timeout: Duration::from_secs(5),
        }
    }

    /// Change how long [`Database::begin`] waits before reporting a conflict
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Make the call to `op` after `skip` successful ones fail with a database error
    pub fn fail_on(&self, op: StoreOp, skip: usize) {
        self.fail_on_with(op, skip, StoreError::Database("injected failure".to_string()));
    }

    /// Make the call to `op` after `skip` successful ones fail with `error`
    pub fn fail_on_with(&self, op: StoreOp, skip: usize, error: StoreError) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(FailPoint { op, skip, error });
    }

    /// Seed a storefront
    pub async fn add_storefront(&self, owner: UserId, plan: SubscriptionPlan) -> StorefrontId {
        let mut state = self.state.lock().await;
        let id = StorefrontId::new(self.sequence.next());
        state.storefronts.insert(
            id,
            Storefront {
                id,
                owner_id: owner,
                name: format!("Storefront {id}"),
                is_active: true,
                subscription_plan: plan,
                address: None,
            },
        );
        id
    }

    /// Toggle whether a storefront accepts orders
    pub async fn set_storefront_active(&self, id: StorefrontId, active: bool) {
        if let Some(storefront) = self.state.lock().await.storefronts.get_mut(&id) {
            storefront.is_active = active;
        }
    }

    /// Seed a product
    pub async fn add_product(&self, storefront_id: StorefrontId, seed: ProductSeed) -> ProductId {
        let mut state = self.state.lock().await;
        let id = ProductId::new(self.sequence.next());
        state
            .products
            .insert(id, ProductRow { storefront_id, seed });
        id
    }

    /// Seed a variant under `product_id`
    pub async fn add_variant(&self, product_id: ProductId, seed: VariantSeed) -> VariantId {
        let mut state = self.state.lock().await;
        let id = VariantId::new(self.sequence.next());
        state.variants.insert(id, VariantRow { product_id, seed });
        id
    }

    /// Toggle whether a product is for sale
    pub async fn set_product_active(&self, id: ProductId, active: bool) {
        if let Some(product) = self.state.lock().await.products.get_mut(&id) {
            product.seed.active = active;
        }
    }

    /// Change a product or variant price
    pub async fn set_price(&self, key: StockKey, price: Decimal) {
        let mut state = self.state.lock().await;
        match key.variant_id {
            Some(variant_id) => {
                if let Some(variant) = state.variants.get_mut(&variant_id) {
                    variant.seed.price = Some(price);
                }
            }
            None => {
                if let Some(product) = state.products.get_mut(&key.product_id) {
                    product.seed.price = price;
                }
            }
        }
    }

    /// Current stock of a product or variant (0 if unknown)
    pub async fn stock(&self, key: StockKey) -> i32 {
        self.state
            .lock()
            .await
            .snapshot(key)
            .map_or(0, |snapshot| snapshot.stock_quantity)
    }

    /// Committed order
    pub async fn order(&self, id: OrderId) -> Option<Order> {
        self.state.lock().await.orders.get(&id).cloned()
    }

    /// Number of committed orders
    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    /// Committed reservations of an order
    pub async fn reservations_for(&self, order_id: OrderId) -> Vec<InventoryReservation> {
        self.state
            .lock()
            .await
            .reservations
            .values()
            .filter(|reservation| reservation.order_id == order_id)
            .cloned()
            .collect()
    }

    /// One committed reservation
    pub async fn reservation(&self, id: ReservationId) -> Option<InventoryReservation> {
        self.state.lock().await.reservations.get(&id).cloned()
    }

    /// Committed cart
    pub async fn cart(&self, id: CartId) -> Option<ShoppingCart> {
        self.state.lock().await.carts.get(&id).cloned()
    }
}

impl Database for InMemoryDatabase {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> StoreResult<MemoryTransaction> {
        let guard = tokio::time::timeout(self.lock_timeout, Arc::clone(&self.state).lock_owned())
            .await
            .map_err(|_| StoreError::Conflict("lock wait timeout".to_string()))?;
        let working = guard.clone();
        Ok(MemoryTransaction {
            guard,
            working,
            sequence: Arc::clone(&self.sequence),
            faults: Arc::clone(&self.faults),
        })
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// Open transaction on an [`InMemoryDatabase`].
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    sequence: Arc<Sequence>,
    faults: FailPoints,
}

impl MemoryTransaction {
    fn check(&self, op: StoreOp) -> StoreResult<()> {
        trip(&self.faults, op)
    }

    fn order_mut(&mut self, id: OrderId) -> StoreResult<&mut Order> {
        self.working
            .orders
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("order", id))
    }
}

impl CatalogStore for MemoryTransaction {
    async fn lock_storefront_shared(&mut self, id: StorefrontId) -> StoreResult<Storefront> {
        self.check(StoreOp::LockStorefront)?;
        self.working.storefront(id)
    }

    async fn get_storefront(&mut self, id: StorefrontId) -> StoreResult<Storefront> {
        self.working.storefront(id)
    }

    async fn lock_product(
        &mut self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> StoreResult<ProductSnapshot> {
        self.check(StoreOp::LockProduct)?;
        self.working.snapshot(StockKey::new(product_id, variant_id))
    }

    async fn get_product(
        &mut self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> StoreResult<ProductSnapshot> {
        self.working.snapshot(StockKey::new(product_id, variant_id))
    }

    async fn adjust_stock(&mut self, key: StockKey, delta: i32) -> StoreResult<i32> {
        self.check(StoreOp::AdjustStock)?;
        let stock = self.working.stock_mut(key)?;
        *stock += delta;
        Ok(*stock)
    }
}

impl CartStore for MemoryTransaction {
    async fn lock_cart(&mut self, id: CartId) -> StoreResult<ShoppingCart> {
        self.check(StoreOp::LockCart)?;
        self.working
            .carts
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("cart", id))
    }

    async fn lock_owner_cart(
        &mut self,
        owner: &CartOwner,
        storefront_id: StorefrontId,
    ) -> StoreResult<Option<ShoppingCart>> {
        Ok(self
            .working
            .carts
            .values()
            .find(|cart| &cart.owner == owner && cart.storefront_id == storefront_id)
            .cloned())
    }

    async fn insert_cart(
        &mut self,
        owner: &CartOwner,
        storefront_id: StorefrontId,
        now: DateTime<Utc>,
    ) -> StoreResult<ShoppingCart> {
        let taken = self
            .working
            .carts
            .values()
            .any(|cart| &cart.owner == owner && cart.storefront_id == storefront_id);
        if taken {
            return Err(StoreError::Conflict(
                "duplicate key value violates unique constraint \"shopping_carts_owner_storefront\""
                    .to_string(),
            ));
        }

        let cart = ShoppingCart {
            id: CartId::new(self.sequence.next()),
            owner: owner.clone(),
            storefront_id,
            items: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.working.carts.insert(cart.id, cart.clone());
        Ok(cart)
    }

    async fn insert_cart_item(
        &mut self,
        cart_id: CartId,
        item: &NewCartItem,
        now: DateTime<Utc>,
    ) -> StoreResult<CartItem> {
        let id = CartItemId::new(self.sequence.next());
        let cart = self
            .working
            .carts
            .get_mut(&cart_id)
            .ok_or_else(|| StoreError::not_found("cart", cart_id))?;
        let line = CartItem {
            id,
            cart_id,
            product_id: item.product_id,
            variant_id: item.variant_id,
            quantity: item.quantity,
            price_per_unit: item.price_per_unit,
            total_price: item.total_price(),
            created_at: now,
            updated_at: now,
        };
        cart.items.push(line.clone());
        cart.updated_at = now;
        Ok(line)
    }

    async fn update_cart_item(&mut self, item: &CartItem) -> StoreResult<()> {
        let line = self
            .working
            .carts
            .get_mut(&item.cart_id)
            .and_then(|cart| cart.items.iter_mut().find(|line| line.id == item.id))
            .ok_or_else(|| StoreError::not_found("cart item", item.id))?;
        *line = item.clone();
        Ok(())
    }

    async fn delete_cart_item(
        &mut self,
        cart_id: CartId,
        item_id: CartItemId,
    ) -> StoreResult<bool> {
        let Some(cart) = self.working.carts.get_mut(&cart_id) else {
            return Ok(false);
        };
        let before = cart.items.len();
        cart.items.retain(|line| line.id != item_id);
        Ok(cart.items.len() != before)
    }

    async fn clear_cart(&mut self, cart_id: CartId) -> StoreResult<u64> {
        self.check(StoreOp::ClearCart)?;
        let Some(cart) = self.working.carts.get_mut(&cart_id) else {
            return Ok(0);
        };
        let removed = cart.items.len() as u64;
        cart.items.clear();
        Ok(removed)
    }

    async fn delete_cart(&mut self, cart_id: CartId) -> StoreResult<()> {
        self.working.carts.remove(&cart_id);
        Ok(())
    }

    async fn list_user_carts(&mut self, user_id: UserId) -> StoreResult<Vec<ShoppingCart>> {
        Ok(self
            .working
            .carts
            .values()
            .filter(|cart| cart.owner == CartOwner::User(user_id))
            .cloned()
            .collect())
    }
}

impl OrderStore for MemoryTransaction {
    async fn insert_order(&mut self, order: &NewOrder) -> StoreResult<Order> {
        self.check(StoreOp::InsertOrder)?;
        let taken = self
            .working
            .orders
            .values()
            .any(|existing| existing.order_number == order.order_number);
        if taken {
            return Err(StoreError::Conflict(format!(
                "order number {} already exists",
                order.order_number
            )));
        }

        let stored = Order {
            id: OrderId::new(self.sequence.next()),
            order_number: order.order_number.clone(),
            storefront_id: order.storefront_id,
            customer_id: order.customer_id,
            status: OrderStatus::Pending,
            payment_status: order.payment_method.initial_status(),
            payment_method: order.payment_method,
            payment_transaction_id: None,
            totals: OrderTotals::default(),
            currency: order.currency.clone(),
            escrow_days: order.escrow_days,
            escrow_release_date: None,
            shipping_address: order.shipping_address.clone(),
            billing_address: order.billing_address.clone(),
            pickup_address: order.pickup_address.clone(),
            shipping_method: order.shipping_method.clone(),
            tracking_number: None,
            customer_notes: order.customer_notes.clone(),
            seller_notes: None,
            cancellation_reason: None,
            created_at: order.created_at,
            updated_at: order.created_at,
            confirmed_at: None,
            shipped_at: None,
            delivered_at: None,
            cancelled_at: None,
            refunded_at: None,
            payment_completed_at: None,
            items: Vec::new(),
        };
        self.working.orders.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn insert_order_item(&mut self, item: &NewOrderItem) -> StoreResult<OrderItem> {
        self.check(StoreOp::InsertOrderItem)?;
        let id = OrderItemId::new(self.sequence.next());
        let order = self.order_mut(item.order_id)?;
        let line = OrderItem {
            id,
            order_id: item.order_id,
            product_id: item.product_id,
            variant_id: item.variant_id,
            product_name: item.product_name.clone(),
            product_sku: item.product_sku.clone(),
            attributes: item.attributes.clone(),
            quantity: item.quantity,
            price_per_unit: item.price_per_unit,
            total_price: item.total_price,
            warehouse_id: item.warehouse_id,
            created_at: item.created_at,
        };
        order.items.push(line.clone());
        Ok(line)
    }

    async fn update_order_totals(
        &mut self,
        order_id: OrderId,
        totals: &OrderTotals,
    ) -> StoreResult<()> {
        self.order_mut(order_id)?.totals = *totals;
        Ok(())
    }

    async fn lock_order(&mut self, id: OrderId) -> StoreResult<Order> {
        self.order_mut(id).map(|order| order.clone())
    }

    async fn get_order(&mut self, id: OrderId) -> StoreResult<Order> {
        self.order_mut(id).map(|order| order.clone())
    }

    async fn save_order_state(&mut self, order: &Order) -> StoreResult<()> {
        self.check(StoreOp::SaveOrderState)?;
        let stored = self.order_mut(order.id)?;
        let items = std::mem::take(&mut stored.items);
        *stored = order.clone();
        stored.items = items;
        Ok(())
    }

    async fn list_orders(
        &mut self,
        filter: &OrderFilter,
        max_limit: i64,
    ) -> StoreResult<OrderPage> {
        let mut matches: Vec<&Order> = self
            .working
            .orders
            .values()
            .filter(|order| self.working.matches(order, filter))
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = i64::try_from(matches.len()).unwrap_or(i64::MAX);
        let offset = usize::try_from(filter.page_offset()).unwrap_or(usize::MAX);
        let limit = usize::try_from(filter.page_limit(max_limit)).unwrap_or(usize::MAX);
        let orders = matches
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok(OrderPage { orders, total })
    }

    async fn order_stats(&mut self, filter: &OrderFilter) -> StoreResult<OrderStats> {
        let mut stats = OrderStats::default();
        for order in self.working.orders.values() {
            if self.working.matches(order, filter) {
                stats.record(order.status, &order.totals);
            }
        }
        Ok(stats)
    }

    async fn find_unbacked_pending_orders(
        &mut self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<OrderId>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .working
            .orders
            .values()
            .filter(|order| {
                order.status == OrderStatus::Pending && order.created_at < created_before
            })
            .filter(|order| {
                let mut holds = self
                    .working
                    .reservations
                    .values()
                    .filter(|reservation| reservation.order_id == order.id)
                    .peekable();
                holds.peek().is_some()
                    && holds.all(|reservation| reservation.status != ReservationStatus::Active)
            })
            .map(|order| order.id)
            .take(limit)
            .collect())
    }
}

impl ReservationStore for MemoryTransaction {
    async fn insert_reservation(
        &mut self,
        reservation: &NewReservation,
    ) -> StoreResult<InventoryReservation> {
        self.check(StoreOp::InsertReservation)?;
        let stored = InventoryReservation {
            id: ReservationId::new(self.sequence.next()),
            product_id: reservation.product_id,
            variant_id: reservation.variant_id,
            order_id: reservation.order_id,
            quantity: reservation.quantity,
            status: ReservationStatus::Active,
            stock_deducted: reservation.stock_deducted,
            expires_at: reservation.expires_at,
            created_at: reservation.created_at,
            updated_at: reservation.created_at,
        };
        self.working.reservations.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn lock_reservation(&mut self, id: ReservationId) -> StoreResult<InventoryReservation> {
        self.working
            .reservations
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("reservation", id))
    }

    async fn lock_order_reservations(
        &mut self,
        order_id: OrderId,
    ) -> StoreResult<Vec<InventoryReservation>> {
        let mut holds: Vec<InventoryReservation> = self
            .working
            .reservations
            .values()
            .filter(|reservation| reservation.order_id == order_id)
            .cloned()
            .collect();
        holds.sort_by_key(|reservation| (reservation.key(), reservation.id));
        Ok(holds)
    }

    async fn lock_expired_reservations(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<InventoryReservation>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .working
            .reservations
            .values()
            .filter(|reservation| reservation.is_expired_at(now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn set_reservation_status(
        &mut self,
        id: ReservationId,
        status: ReservationStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check(StoreOp::SetReservationStatus)?;
        let reservation = self
            .working
            .reservations
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("reservation", id))?;
        reservation.status = status;
        reservation.updated_at = now;
        Ok(())
    }

    async fn soft_held_quantity(&mut self, key: StockKey, now: DateTime<Utc>) -> StoreResult<i64> {
        Ok(self
            .working
            .reservations
            .values()
            .filter(|reservation| {
                reservation.key() == key
                    && reservation.status == ReservationStatus::Active
                    && !reservation.stock_deducted
                    && reservation.expires_at > now
            })
            .map(|reservation| i64::from(reservation.quantity))
            .sum())
    }
}

impl StoreTransaction for MemoryTransaction {
    async fn commit(self) -> StoreResult<()> {
        self.check(StoreOp::Commit)?;
        let Self {
            mut guard, working, ..
        } = self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn rollback_discards_writes() {
        let db = InMemoryDatabase::new();
        let shop = db.add_storefront(UserId::new(1), SubscriptionPlan::Starter).await;
        let product = db.add_product(shop, ProductSeed::new("Mug", dec!(5), 3)).await;
        let key = StockKey::new(product, None);

        let mut tx = db.begin().await.unwrap();
        tx.adjust_stock(key, -2).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(db.stock(key).await, 3);

        let mut tx = db.begin().await.unwrap();
        tx.adjust_stock(key, -2).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(db.stock(key).await, 1);
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_rollback() {
        let db = InMemoryDatabase::new();
        let shop = db.add_storefront(UserId::new(1), SubscriptionPlan::Starter).await;
        let product = db.add_product(shop, ProductSeed::new("Mug", dec!(5), 3)).await;
        let hold = |order_id| NewReservation {
            product_id: product,
            variant_id: None,
            order_id,
            quantity: 1,
            stock_deducted: true,
            expires_at: Utc::now(),
            created_at: Utc::now(),
        };

        let mut tx = db.begin().await.unwrap();
        let discarded = tx.insert_reservation(&hold(OrderId::new(90))).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = db.begin().await.unwrap();
        let kept = tx.insert_reservation(&hold(OrderId::new(91))).await.unwrap();
        tx.commit().await.unwrap();

        assert_ne!(discarded.id, kept.id);
        assert!(db.reservation(discarded.id).await.is_none());
    }

    #[tokio::test]
    async fn second_transaction_times_out_as_conflict() {
        let db = InMemoryDatabase::new().with_lock_timeout(Duration::from_millis(20));
        let _held = db.begin().await.unwrap();
        let result = db.begin().await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn fail_points_fire_once_after_skips() {
        let db = InMemoryDatabase::new();
        let shop = db.add_storefront(UserId::new(1), SubscriptionPlan::Starter).await;
        let product = db.add_product(shop, ProductSeed::new("Mug", dec!(5), 3)).await;
        db.fail_on(StoreOp::LockProduct, 1);

        let mut tx = db.begin().await.unwrap();
        assert!(tx.lock_product(product, None).await.is_ok());
        assert!(tx.lock_product(product, None).await.is_err());
        assert!(tx.lock_product(product, None).await.is_ok());
    }

    #[tokio::test]
    async fn variant_inherits_product_fields() {
        let db = InMemoryDatabase::new();
        let shop = db.add_storefront(UserId::new(1), SubscriptionPlan::Starter).await;
        let product = db
            .add_product(
                shop,
                ProductSeed::new("Shirt", dec!(20), 0)
                    .sku("SHIRT")
                    .attribute("material", AttributeValue::Text("cotton".into())),
            )
            .await;
        let variant = db
            .add_variant(
                product,
                VariantSeed::new(4).attribute("size", AttributeValue::Text("M".into())),
            )
            .await;

        let mut tx = db.begin().await.unwrap();
        let snapshot = tx.get_product(product, Some(variant)).await.unwrap();
        assert_eq!(snapshot.price, dec!(20));
        assert_eq!(snapshot.stock_quantity, 4);
        assert_eq!(snapshot.sku.as_deref(), Some("SHIRT"));
        assert_eq!(snapshot.attributes.len(), 2);
    }
}
