//! Cart service.
//!
//! Carts are created lazily, one per (owner, storefront). Unit prices always
//! come from the product row and line totals are recomputed on every change.
//! Quantities are checked against available stock when added or changed, but
//! nothing is reserved until the cart becomes an order.

use crate::inventory::available_in;
use crate::transaction::{discard, finish};
use chrono::{DateTime, Utc};
use fulfillment_core::cart::{CartItem, CartOwner, NewCartItem, PriceChange, ShoppingCart};
use fulfillment_core::catalog::ProductSnapshot;
use fulfillment_core::environment::Clock;
use fulfillment_core::error::StoreResultExt;
use fulfillment_core::ids::{CartItemId, ProductId, StockKey, StorefrontId, UserId, VariantId};
use fulfillment_core::store::{CartStore, CatalogStore, Database, ReservationStore};
use fulfillment_core::{OrderError, Result, StoreError};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Cart operations for buyers and anonymous sessions.
pub struct CartService<D: Database> {
    db: D,
    clock: Arc<dyn Clock>,
    max_line_quantity: i32,
}

impl<D: Database> CartService<D> {
    /// Create a service allowing up to 10 000 units per line.
    #[must_use]
    pub fn new(db: D, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            max_line_quantity: 10_000,
        }
    }

    /// Change the per-line quantity limit.
    #[must_use]
    pub const fn with_max_line_quantity(mut self, max: i32) -> Self {
        self.max_line_quantity = max;
        self
    }

    /// The owner's cart for `storefront_id`, created if missing.
    ///
    /// # Errors
    ///
    /// [`OrderError::Conflict`] if a concurrent call created it first; retry.
    pub async fn get_or_create_cart(
        &self,
        owner: &CartOwner,
        storefront_id: StorefrontId,
    ) -> Result<ShoppingCart> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await.context("begin cart")?;
        let result = cart_for(&mut tx, owner, storefront_id, now).await;
        finish(tx, result, "commit cart").await
    }

    /// The owner's cart for `storefront_id`, if any.
    ///
    /// # Errors
    ///
    /// Store errors only.
    pub async fn get_cart(
        &self,
        owner: &CartOwner,
        storefront_id: StorefrontId,
    ) -> Result<Option<ShoppingCart>> {
        let mut tx = self.db.begin().await.context("begin cart")?;
        let result = tx
            .lock_owner_cart(owner, storefront_id)
            .await
            .context("read cart");
        discard(tx).await;
        result
    }

    /// Every cart of a signed-in user, across storefronts.
    ///
    /// # Errors
    ///
    /// Store errors only.
    pub async fn list_user_carts(&self, user_id: UserId) -> Result<Vec<ShoppingCart>> {
        let mut tx = self.db.begin().await.context("begin cart")?;
        let result = tx.list_user_carts(user_id).await.context("list carts");
        discard(tx).await;
        result
    }

    /// Add units of a product to the cart, merging with an existing line.
    ///
    /// # Errors
    ///
    /// - [`OrderError::Validation`] for a non-positive or oversize quantity, or
    ///   a product of another storefront
    /// - [`OrderError::StorefrontInactive`] / [`OrderError::ProductInactive`]
    /// - [`OrderError::InsufficientStock`] if the line would exceed available stock
    #[tracing::instrument(skip(self, owner), fields(owner = %owner))]
    pub async fn add_item(
        &self,
        owner: &CartOwner,
        storefront_id: StorefrontId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        quantity: i32,
    ) -> Result<ShoppingCart> {
        self.check_quantity(quantity)?;
        let now = self.clock.now();
        let mut tx = self.db.begin().await.context("begin cart")?;
        let key = StockKey::new(product_id, variant_id);
        let result = self
            .add_in(&mut tx, owner, storefront_id, key, quantity, now)
            .await;
        finish(tx, result, "commit cart").await
    }

    async fn add_in(
        &self,
        tx: &mut D::Tx,
        owner: &CartOwner,
        storefront_id: StorefrontId,
        key: StockKey,
        quantity: i32,
        now: DateTime<Utc>,
    ) -> Result<ShoppingCart> {
        let storefront = tx
            .lock_storefront_shared(storefront_id)
            .await
            .context("lock storefront")?;
        if !storefront.is_active {
            return Err(OrderError::StorefrontInactive(storefront_id));
        }

        let cart = cart_for(tx, owner, storefront_id, now).await?;
        let product = sellable_product(tx, storefront_id, key).await?;

        let existing = cart.find_item(key).cloned();
        let wanted = existing
            .as_ref()
            .map_or(quantity, |line| line.quantity.saturating_add(quantity));
        self.check_quantity(wanted)?;
        check_stock(tx, &product, wanted, now).await?;

        match existing {
            Some(mut line) => {
                line.set_quantity(wanted, now);
                line.set_price(product.price, now);
                tx.update_cart_item(&line).await.context("update cart item")?;
            }
            None => {
                tx.insert_cart_item(
                    cart.id,
                    &NewCartItem {
                        product_id: key.product_id,
                        variant_id: key.variant_id,
                        quantity,
                        price_per_unit: product.price,
                    },
                    now,
                )
                .await
                .context("insert cart item")?;
            }
        }
        tx.lock_cart(cart.id).await.context("reload cart")
    }

    /// Set the quantity of one line. Use [`Self::remove_item`] to drop it.
    ///
    /// # Errors
    ///
    /// - [`OrderError::Validation`] for a non-positive or oversize quantity
    /// - [`OrderError::NotFound`] if the cart or line does not exist
    /// - [`OrderError::ProductInactive`] / [`OrderError::InsufficientStock`]
    pub async fn update_item_quantity(
        &self,
        owner: &CartOwner,
        storefront_id: StorefrontId,
        item_id: CartItemId,
        quantity: i32,
    ) -> Result<ShoppingCart> {
        self.check_quantity(quantity)?;
        let now = self.clock.now();
        let mut tx = self.db.begin().await.context("begin cart")?;
        let result: Result<ShoppingCart> = async {
            let (cart, mut line) = existing_line(&mut tx, owner, storefront_id, item_id).await?;
            let product = sellable_product(&mut tx, storefront_id, line.key()).await?;
            check_stock(&mut tx, &product, quantity, now).await?;

            line.set_quantity(quantity, now);
            line.set_price(product.price, now);
            tx.update_cart_item(&line).await.context("update cart item")?;
            tx.lock_cart(cart.id).await.context("reload cart")
        }
        .await;
        finish(tx, result, "commit cart").await
    }

    /// Remove one line.
    ///
    /// # Errors
    ///
    /// [`OrderError::NotFound`] if the cart or line does not exist.
    pub async fn remove_item(
        &self,
        owner: &CartOwner,
        storefront_id: StorefrontId,
        item_id: CartItemId,
    ) -> Result<ShoppingCart> {
        let mut tx = self.db.begin().await.context("begin cart")?;
        let result: Result<ShoppingCart> = async {
            let (cart, _) = existing_line(&mut tx, owner, storefront_id, item_id).await?;
            tx.delete_cart_item(cart.id, item_id)
                .await
                .context("delete cart item")?;
            tx.lock_cart(cart.id).await.context("reload cart")
        }
        .await;
        finish(tx, result, "commit cart").await
    }

    /// Remove every line. Returns how many were removed; a missing cart
    /// counts as empty.
    ///
    /// # Errors
    ///
    /// Store errors only.
    pub async fn clear_cart(&self, owner: &CartOwner, storefront_id: StorefrontId) -> Result<u64> {
        let mut tx = self.db.begin().await.context("begin cart")?;
        let result: Result<u64> = async {
            match tx
                .lock_owner_cart(owner, storefront_id)
                .await
                .context("lock cart")?
            {
                Some(cart) => tx.clear_cart(cart.id).await.context("clear cart"),
                None => Ok(0),
            }
        }
        .await;
        finish(tx, result, "commit cart").await
    }

    /// Move an anonymous session's cart into the user's cart after sign-in.
    ///
    /// Quantities of lines present in both carts are summed (capped at the
    /// per-line limit) and the session cart is deleted.
    ///
    /// # Errors
    ///
    /// Store errors only.
    #[tracing::instrument(skip(self, session_token))]
    pub async fn merge_session_cart(
        &self,
        session_token: &str,
        user_id: UserId,
        storefront_id: StorefrontId,
    ) -> Result<ShoppingCart> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await.context("begin cart merge")?;
        let result = self
            .merge_in(&mut tx, session_token, user_id, storefront_id, now)
            .await;
        finish(tx, result, "commit cart merge").await
    }

    async fn merge_in(
        &self,
        tx: &mut D::Tx,
        session_token: &str,
        user_id: UserId,
        storefront_id: StorefrontId,
        now: DateTime<Utc>,
    ) -> Result<ShoppingCart> {
        let user_cart = cart_for(tx, &CartOwner::User(user_id), storefront_id, now).await?;
        let Some(session_cart) = tx
            .lock_owner_cart(&CartOwner::Session(session_token.to_string()), storefront_id)
            .await
            .context("lock session cart")?
        else {
            return Ok(user_cart);
        };

        for line in &session_cart.items {
            match user_cart.find_item(line.key()) {
                Some(existing) => {
                    let mut merged = existing.clone();
                    let quantity = existing
                        .quantity
                        .saturating_add(line.quantity)
                        .min(self.max_line_quantity);
                    merged.set_quantity(quantity, now);
                    tx.update_cart_item(&merged).await.context("update cart item")?;
                }
                None => {
                    tx.insert_cart_item(
                        user_cart.id,
                        &NewCartItem {
                            product_id: line.product_id,
                            variant_id: line.variant_id,
                            quantity: line.quantity,
                            price_per_unit: line.price_per_unit,
                        },
                        now,
                    )
                    .await
                    .context("insert cart item")?;
                }
            }
        }
        tx.delete_cart(session_cart.id)
            .await
            .context("delete session cart")?;

        tracing::info!(
            moved = session_cart.items.len(),
            cart_id = %user_cart.id,
            "Session cart merged"
        );
        tx.lock_cart(user_cart.id).await.context("reload cart")
    }

    /// Refresh unit prices from the catalog.
    ///
    /// Lines whose product disappeared or is no longer active are dropped and
    /// reported with `new_price: None`.
    ///
    /// # Errors
    ///
    /// [`OrderError::NotFound`] if the owner has no cart in `storefront_id`.
    pub async fn recalculate_cart(
        &self,
        owner: &CartOwner,
        storefront_id: StorefrontId,
    ) -> Result<(ShoppingCart, Vec<PriceChange>)> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await.context("begin cart")?;
        let result = self.recalculate_in(&mut tx, owner, storefront_id, now).await;
        finish(tx, result, "commit cart").await
    }

    async fn recalculate_in(
        &self,
        tx: &mut D::Tx,
        owner: &CartOwner,
        storefront_id: StorefrontId,
        now: DateTime<Utc>,
    ) -> Result<(ShoppingCart, Vec<PriceChange>)> {
        let cart = tx
            .lock_owner_cart(owner, storefront_id)
            .await
            .context("lock cart")?
            .ok_or_else(|| OrderError::not_found("cart", owner))?;

        let mut lines = cart.items.clone();
        lines.sort_by_key(CartItem::key);

        let mut changes = Vec::new();
        for mut line in lines {
            let current = match tx.get_product(line.product_id, line.variant_id).await {
                Ok(product) if product.is_active => Some(product.price),
                Ok(_) | Err(StoreError::NotFound { .. }) => None,
                Err(error) => return Err(OrderError::from_store("read product", error)),
            };

            match current {
                Some(price) if price == line.price_per_unit => {}
                Some(price) => {
                    changes.push(price_change(&line, Some(price)));
                    line.set_price(price, now);
                    tx.update_cart_item(&line).await.context("update cart item")?;
                }
                None => {
                    changes.push(price_change(&line, None));
                    tx.delete_cart_item(cart.id, line.id)
                        .await
                        .context("delete cart item")?;
                }
            }
        }

        let cart = tx.lock_cart(cart.id).await.context("reload cart")?;
        Ok((cart, changes))
    }

    fn check_quantity(&self, quantity: i32) -> Result<()> {
        if (1..=self.max_line_quantity).contains(&quantity) {
            Ok(())
        } else {
            Err(OrderError::Validation(format!(
                "quantity must be between 1 and {}, got {quantity}",
                self.max_line_quantity
            )))
        }
    }
}

async fn cart_for<Tx: CartStore>(
    tx: &mut Tx,
    owner: &CartOwner,
    storefront_id: StorefrontId,
    now: DateTime<Utc>,
) -> Result<ShoppingCart> {
    if let Some(cart) = tx
        .lock_owner_cart(owner, storefront_id)
        .await
        .context("lock cart")?
    {
        return Ok(cart);
    }
    let cart = tx
        .insert_cart(owner, storefront_id, now)
        .await
        .context("create cart")?;
    tracing::debug!(cart_id = %cart.id, owner = %owner, "Cart created");
    Ok(cart)
}

async fn existing_line<Tx: CartStore>(
    tx: &mut Tx,
    owner: &CartOwner,
    storefront_id: StorefrontId,
    item_id: CartItemId,
) -> Result<(ShoppingCart, CartItem)> {
    let cart = tx
        .lock_owner_cart(owner, storefront_id)
        .await
        .context("lock cart")?
        .ok_or_else(|| OrderError::not_found("cart", owner))?;
    let line = cart
        .items
        .iter()
        .find(|line| line.id == item_id)
        .cloned()
        .ok_or_else(|| OrderError::not_found("cart item", item_id))?;
    Ok((cart, line))
}

async fn sellable_product<Tx: CatalogStore>(
    tx: &mut Tx,
    storefront_id: StorefrontId,
    key: StockKey,
) -> Result<ProductSnapshot> {
    let product = tx
        .lock_product(key.product_id, key.variant_id)
        .await
        .context("lock product")?;
    if product.storefront_id != storefront_id {
        return Err(OrderError::Validation(format!(
            "product {key} does not belong to storefront {storefront_id}"
        )));
    }
    if !product.is_active {
        return Err(OrderError::ProductInactive {
            product_id: key.product_id,
            variant_id: key.variant_id,
        });
    }
    Ok(product)
}

async fn check_stock<Tx: ReservationStore>(
    tx: &mut Tx,
    product: &ProductSnapshot,
    wanted: i32,
    now: DateTime<Utc>,
) -> Result<()> {
    let available = available_in(tx, product, now).await?;
    if available < i64::from(wanted) {
        return Err(OrderError::InsufficientStock {
            product_id: product.product_id,
            variant_id: product.variant_id,
            requested: wanted,
            available,
        });
    }
    Ok(())
}

fn price_change(line: &CartItem, new_price: Option<Decimal>) -> PriceChange {
    PriceChange {
        item_id: line.id,
        product_id: line.product_id,
        variant_id: line.variant_id,
        old_price: line.price_per_unit,
        new_price,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fulfillment_core::catalog::SubscriptionPlan;
    use fulfillment_testing::{InMemoryDatabase, ProductSeed, test_clock};
    use rust_decimal_macros::dec;

    struct Fixture {
        db: InMemoryDatabase,
        carts: CartService<InMemoryDatabase>,
        shop: StorefrontId,
        mug: ProductId,
    }

    async fn fixture() -> Fixture {
        let db = InMemoryDatabase::new();
        let shop = db.add_storefront(UserId::new(1), SubscriptionPlan::Starter).await;
        let mug = db.add_product(shop, ProductSeed::new("Mug", dec!(9.90), 5)).await;
        let carts = CartService::new(db.clone(), Arc::new(test_clock()));
        Fixture {
            db,
            carts,
            shop,
            mug,
        }
    }

    #[tokio::test]
    async fn adding_twice_merges_the_line() {
        let f = fixture().await;
        let owner = CartOwner::User(UserId::new(7));

        f.carts.add_item(&owner, f.shop, f.mug, None, 2).await.unwrap();
        let cart = f.carts.add_item(&owner, f.shop, f.mug, None, 1).await.unwrap();

        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].quantity, 3);
        assert_eq!(cart.total_amount(), dec!(29.70));
        assert_eq!(cart.item_count(), 3);
    }

    #[tokio::test]
    async fn cannot_add_more_than_available() {
        let f = fixture().await;
        let owner = CartOwner::User(UserId::new(7));
        f.carts.add_item(&owner, f.shop, f.mug, None, 4).await.unwrap();

        let err = f.carts.add_item(&owner, f.shop, f.mug, None, 2).await.unwrap_err();
        assert_eq!(
            err,
            OrderError::InsufficientStock {
                product_id: f.mug,
                variant_id: None,
                requested: 6,
                available: 5,
            }
        );
    }

    #[tokio::test]
    async fn zero_quantity_update_is_rejected() {
        let f = fixture().await;
        let owner = CartOwner::User(UserId::new(7));
        let cart = f.carts.add_item(&owner, f.shop, f.mug, None, 1).await.unwrap();

        let err = f
            .carts
            .update_item_quantity(&owner, f.shop, cart.items[0].id, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::Validation(_)));

        let cart = f
            .carts
            .update_item_quantity(&owner, f.shop, cart.items[0].id, 4)
            .await
            .unwrap();
        assert_eq!(cart.total_amount(), dec!(39.60));
    }

    #[tokio::test]
    async fn session_cart_merges_into_user_cart() {
        let f = fixture().await;
        let session = CartOwner::Session("anon-123".into());
        let user = CartOwner::User(UserId::new(7));
        let lamp = f.db.add_product(f.shop, ProductSeed::new("Lamp", dec!(30), 2)).await;

        f.carts.add_item(&session, f.shop, f.mug, None, 2).await.unwrap();
        f.carts.add_item(&session, f.shop, lamp, None, 1).await.unwrap();
        f.carts.add_item(&user, f.shop, f.mug, None, 1).await.unwrap();

        let merged = f
            .carts
            .merge_session_cart("anon-123", UserId::new(7), f.shop)
            .await
            .unwrap();
        let mug = merged.find_item(StockKey::new(f.mug, None)).unwrap();
        assert_eq!(mug.quantity, 3);
        assert!(merged.find_item(StockKey::new(lamp, None)).is_some());
        assert!(f.carts.get_cart(&session, f.shop).await.unwrap().is_none());
        assert_eq!(f.carts.list_user_carts(UserId::new(7)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recalculation_reports_price_changes_and_drops_inactive_lines() {
        let f = fixture().await;
        let owner = CartOwner::User(UserId::new(7));
        let lamp = f.db.add_product(f.shop, ProductSeed::new("Lamp", dec!(30), 2)).await;
        f.carts.add_item(&owner, f.shop, f.mug, None, 1).await.unwrap();
        f.carts.add_item(&owner, f.shop, lamp, None, 1).await.unwrap();

        f.db.set_price(StockKey::new(f.mug, None), dec!(11.00)).await;
        f.db.set_product_active(lamp, false).await;

        let (cart, changes) = f.carts.recalculate_cart(&owner, f.shop).await.unwrap();
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.total_amount(), dec!(11.00));
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().any(|c| c.product_id == f.mug && c.new_price == Some(dec!(11.00))));
        assert!(changes.iter().any(|c| c.product_id == lamp && c.new_price.is_none()));
    }

    #[tokio::test]
    async fn products_of_other_storefronts_are_rejected() {
        let f = fixture().await;
        let other = f.db.add_storefront(UserId::new(2), SubscriptionPlan::Business).await;
        let foreign = f.db.add_product(other, ProductSeed::new("Vase", dec!(12), 3)).await;

        let err = f
            .carts
            .add_item(&CartOwner::User(UserId::new(7)), f.shop, foreign, None, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::Validation(_)));
    }
}
