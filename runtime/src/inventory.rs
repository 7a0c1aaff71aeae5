//! Inventory manager.
//!
//! Owns every change to reservation status and the stock movements tied to
//! it. The order engine reuses the transaction-level helpers in this module so
//! that a hold is confirmed, released or expired the same way everywhere.
//!
//! `available = stock_quantity − Σ(active, unexpired, soft holds)`. Holds
//! created by the order transaction have already been taken out of
//! `stock_quantity` and are therefore not subtracted again.

use crate::metrics::{RESERVATIONS_EXPIRED, RESERVATIONS_RELEASED, counter};
use crate::transaction::{discard, finish};
use chrono::{DateTime, Duration, Utc};
use fulfillment_core::catalog::ProductSnapshot;
use fulfillment_core::environment::Clock;
use fulfillment_core::error::StoreResultExt;
use fulfillment_core::ids::{OrderId, ProductId, ReservationId, StockKey, VariantId};
use fulfillment_core::reservation::{
    InventoryReservation, MANUAL_HOLD_TTL, NewReservation, ReservationStatus,
};
use fulfillment_core::store::{CatalogStore, Database, ReservationStore, StoreTransaction};
use fulfillment_core::{OrderError, Result, StoreError};
use std::sync::Arc;

// ============================================================================
// Transaction-level helpers
// ============================================================================

/// Units of a locked product that can still be promised.
pub(crate) async fn available_in<Tx>(
    tx: &mut Tx,
    product: &ProductSnapshot,
    now: DateTime<Utc>,
) -> Result<i64>
where
    Tx: ReservationStore,
{
    let held = tx
        .soft_held_quantity(product.key(), now)
        .await
        .context("sum soft holds")?;
    Ok(i64::from(product.stock_quantity) - held)
}

/// Confirm one locked hold.
///
/// Soft holds take their quantity out of stock here, under the product lock.
/// Holds already confirmed are left alone; released, expired or lapsed holds
/// fail with [`OrderError::ReservationLapsed`].
pub(crate) async fn confirm_hold<Tx>(
    tx: &mut Tx,
    hold: &InventoryReservation,
    now: DateTime<Utc>,
) -> Result<bool>
where
    Tx: StoreTransaction,
{
    match hold.status {
        ReservationStatus::Confirmed => return Ok(false),
        ReservationStatus::Active if hold.expires_at < now => {
            return Err(OrderError::ReservationLapsed {
                reservation_id: hold.id,
                status: ReservationStatus::Expired,
            });
        }
        ReservationStatus::Active => {}
        status @ (ReservationStatus::Released | ReservationStatus::Expired) => {
            return Err(OrderError::ReservationLapsed {
                reservation_id: hold.id,
                status,
            });
        }
    }

    if !hold.stock_deducted {
        let product = tx
            .lock_product(hold.product_id, hold.variant_id)
            .await
            .context("lock product")?;
        if product.stock_quantity < hold.quantity {
            return Err(OrderError::InsufficientStock {
                product_id: hold.product_id,
                variant_id: hold.variant_id,
                requested: hold.quantity,
                available: i64::from(product.stock_quantity),
            });
        }
        tx.adjust_stock(hold.key(), -hold.quantity)
            .await
            .context("decrement stock")?;
    }

    tx.set_reservation_status(hold.id, ReservationStatus::Confirmed, now)
        .await
        .context("confirm reservation")?;
    Ok(true)
}

/// Confirm every hold in `holds`, which must be sorted by stock key.
pub(crate) async fn confirm_holds<Tx>(
    tx: &mut Tx,
    holds: &[InventoryReservation],
    now: DateTime<Utc>,
) -> Result<usize>
where
    Tx: StoreTransaction,
{
    let mut confirmed = 0;
    for hold in holds {
        if confirm_hold(tx, hold, now).await? {
            confirmed += 1;
        }
    }
    Ok(confirmed)
}

/// End one locked hold as `released` or `expired`, returning deducted stock.
///
/// Returns `false` (and changes nothing) if the hold is no longer active.
pub(crate) async fn end_hold<Tx>(
    tx: &mut Tx,
    hold: &InventoryReservation,
    outcome: ReservationStatus,
    now: DateTime<Utc>,
) -> Result<bool>
where
    Tx: StoreTransaction,
{
    if !hold.status.can_transition_to(outcome) || outcome == ReservationStatus::Confirmed {
        return Ok(false);
    }

    if hold.stock_deducted {
        tx.lock_product(hold.product_id, hold.variant_id)
            .await
            .context("lock product")?;
        tx.adjust_stock(hold.key(), hold.quantity)
            .await
            .context("restore stock")?;
    }
    tx.set_reservation_status(hold.id, outcome, now)
        .await
        .context("end reservation")?;
    Ok(true)
}

/// Release every active hold of an order. Returns the keys whose stock
/// changed.
pub(crate) async fn release_order_holds_in<Tx>(
    tx: &mut Tx,
    order_id: OrderId,
    now: DateTime<Utc>,
) -> Result<Vec<StockKey>>
where
    Tx: StoreTransaction,
{
    let holds = tx
        .lock_order_reservations(order_id)
        .await
        .context("lock order reservations")?;

    let mut restocked = Vec::new();
    let mut released = 0_u64;
    for hold in &holds {
        if end_hold(tx, hold, ReservationStatus::Released, now).await? {
            released += 1;
            if hold.stock_deducted {
                restocked.push(hold.key());
            }
        }
    }
    counter!(RESERVATIONS_RELEASED).increment(released);
    Ok(restocked)
}

/// Release every active hold of an order in a transaction of its own.
///
/// Used after a confirmation failed and its transaction was rolled back.
pub(crate) async fn release_order_holds<D>(
    db: &D,
    order_id: OrderId,
    now: DateTime<Utc>,
) -> Result<Vec<StockKey>>
where
    D: Database,
{
    let mut tx = db.begin().await.context("begin release")?;
    let result = release_order_holds_in(&mut tx, order_id, now).await;
    finish(tx, result, "commit release").await
}

/// Best-effort release of holds recorded by a failed order transaction.
///
/// The rollback has normally discarded them already, so missing rows are
/// expected and skipped, as are rows that now belong to another order.
/// Failures are logged, never returned.
pub(crate) async fn release_orphaned_holds<D>(
    db: &D,
    order_id: OrderId,
    ids: &[ReservationId],
    now: DateTime<Utc>,
) where
    D: Database,
{
    if ids.is_empty() {
        return;
    }

    let mut tx = match db.begin().await {
        Ok(tx) => tx,
        Err(error) => {
            tracing::warn!(
                order_id = %order_id,
                error = %error,
                count = ids.len(),
                "Could not open transaction to release orphaned holds"
            );
            return;
        }
    };

    let mut released = 0_u64;
    for id in ids {
        let hold = match tx.lock_reservation(*id).await {
            Ok(hold) => hold,
            Err(StoreError::NotFound { .. }) => continue,
            Err(error) => {
                tracing::warn!(
                    reservation_id = %id,
                    error = %error,
                    "Could not lock orphaned hold"
                );
                discard(tx).await;
                return;
            }
        };
        if hold.order_id != order_id {
            tracing::warn!(
                reservation_id = %id,
                order_id = %order_id,
                owner_order_id = %hold.order_id,
                "Skipping hold owned by another order"
            );
            continue;
        }
        match end_hold(&mut tx, &hold, ReservationStatus::Released, now).await {
            Ok(true) => released += 1,
            Ok(false) => {}
            Err(error) => {
                tracing::warn!(
                    reservation_id = %id,
                    error = %error,
                    "Could not release orphaned hold"
                );
                discard(tx).await;
                return;
            }
        }
    }

    if let Err(error) = tx.commit().await {
        tracing::warn!(error = %error, "Could not commit orphaned hold release");
        return;
    }
    if released > 0 {
        counter!(RESERVATIONS_RELEASED).increment(released);
        tracing::warn!(
            order_id = %order_id,
            released,
            "Released holds left behind by a failed order transaction"
        );
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Reserve, confirm, release and expire stock holds.
pub struct InventoryManager<D: Database> {
    db: D,
    clock: Arc<dyn Clock>,
    manual_hold_ttl: Duration,
}

impl<D: Database> InventoryManager<D> {
    /// Create a manager whose manual holds last two hours.
    #[must_use]
    pub fn new(db: D, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            manual_hold_ttl: MANUAL_HOLD_TTL,
        }
    }

    /// Change how long manual holds last.
    #[must_use]
    pub const fn with_manual_hold_ttl(mut self, ttl: Duration) -> Self {
        self.manual_hold_ttl = ttl;
        self
    }

    /// Place a manual hold outside the order transaction.
    ///
    /// Stock is not decremented until the hold is confirmed; until then the
    /// hold only reduces the available quantity.
    ///
    /// # Errors
    ///
    /// - [`OrderError::Validation`] if `quantity` is not positive
    /// - [`OrderError::ProductInactive`] if the product or variant is not for sale
    /// - [`OrderError::InsufficientStock`] if fewer than `quantity` units are available
    /// - [`OrderError::NotFound`] / [`OrderError::Conflict`] from the store
    #[tracing::instrument(skip(self))]
    pub async fn reserve_stock(
        &self,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        quantity: i32,
        order_id: OrderId,
    ) -> Result<InventoryReservation> {
        if quantity <= 0 {
            return Err(OrderError::Validation(format!(
                "quantity must be positive, got {quantity}"
            )));
        }

        let now = self.clock.now();
        let mut tx = self.db.begin().await.context("begin reserve")?;
        let result = self
            .reserve_in(&mut tx, product_id, variant_id, quantity, order_id, now)
            .await;
        let hold = finish(tx, result, "commit reserve").await?;

        tracing::info!(
            reservation_id = %hold.id,
            order_id = %order_id,
            quantity,
            expires_at = %hold.expires_at,
            "Manual hold placed"
        );
        Ok(hold)
    }

    async fn reserve_in(
        &self,
        tx: &mut D::Tx,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        quantity: i32,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<InventoryReservation> {
        let product = tx
            .lock_product(product_id, variant_id)
            .await
            .context("lock product")?;
        if !product.is_active {
            return Err(OrderError::ProductInactive {
                product_id,
                variant_id,
            });
        }

        let available = available_in(tx, &product, now).await?;
        if available < i64::from(quantity) {
            return Err(OrderError::InsufficientStock {
                product_id,
                variant_id,
                requested: quantity,
                available,
            });
        }

        tx.insert_reservation(&NewReservation {
            product_id,
            variant_id,
            order_id,
            quantity,
            stock_deducted: false,
            expires_at: now + self.manual_hold_ttl,
            created_at: now,
        })
        .await
        .context("insert reservation")
    }

    /// Units of a product/variant that can still be promised.
    ///
    /// # Errors
    ///
    /// [`OrderError::NotFound`] if the product does not exist, store errors otherwise.
    pub async fn available_quantity(&self, key: StockKey) -> Result<i64> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await.context("begin availability")?;
        let result: Result<i64> = async {
            let product = tx
                .get_product(key.product_id, key.variant_id)
                .await
                .context("read product")?;
            available_in(&mut tx, &product, now).await
        }
        .await;
        discard(tx).await;
        result
    }

    /// Confirm one hold: stock is permanently consumed.
    ///
    /// # Errors
    ///
    /// - [`OrderError::ReservationLapsed`] if the hold is released, expired or past its expiry
    /// - [`OrderError::InsufficientStock`] if a soft hold can no longer be covered
    /// - [`OrderError::NotFound`] if the hold does not exist
    pub async fn commit_reservation(&self, id: ReservationId) -> Result<InventoryReservation> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await.context("begin commit")?;
        let result: Result<InventoryReservation> = async {
            let hold = tx.lock_reservation(id).await.context("lock reservation")?;
            confirm_hold(&mut tx, &hold, now).await?;
            Ok(InventoryReservation {
                status: ReservationStatus::Confirmed,
                updated_at: now,
                ..hold
            })
        }
        .await;
        finish(tx, result, "commit reservation").await
    }

    /// Confirm every hold of an order, all or nothing.
    ///
    /// If any hold cannot be confirmed, the transaction is rolled back, every
    /// active hold of the order is released and the error is returned.
    ///
    /// # Errors
    ///
    /// As for [`Self::commit_reservation`].
    #[tracing::instrument(skip(self))]
    pub async fn commit_order_reservations(&self, order_id: OrderId) -> Result<usize> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await.context("begin commit")?;
        let result: Result<usize> = async {
            let holds = tx
                .lock_order_reservations(order_id)
                .await
                .context("lock order reservations")?;
            confirm_holds(&mut tx, &holds, now).await
        }
        .await;

        match result {
            Ok(confirmed) => {
                tx.commit().await.context("commit order reservations")?;
                tracing::info!(confirmed, "Order reservations confirmed");
                Ok(confirmed)
            }
            Err(error) => {
                discard(tx).await;
                tracing::warn!(error = %error, "Confirmation failed, releasing order holds");
                if let Err(release) = release_order_holds(&self.db, order_id, now).await {
                    tracing::error!(
                        error = %release,
                        "Could not release holds after failed confirmation"
                    );
                }
                Err(error)
            }
        }
    }

    /// Release one hold. Releasing a hold that is no longer active is a no-op.
    ///
    /// Returns whether the hold was released by this call.
    ///
    /// # Errors
    ///
    /// [`OrderError::NotFound`] if the hold does not exist, store errors otherwise.
    pub async fn release_reservation(&self, id: ReservationId) -> Result<bool> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await.context("begin release")?;
        let result: Result<bool> = async {
            let hold = tx.lock_reservation(id).await.context("lock reservation")?;
            end_hold(&mut tx, &hold, ReservationStatus::Released, now).await
        }
        .await;
        let released = finish(tx, result, "commit release").await?;
        if released {
            counter!(RESERVATIONS_RELEASED).increment(1);
            tracing::info!(reservation_id = %id, "Reservation released");
        } else {
            tracing::debug!(reservation_id = %id, "Reservation already ended, release skipped");
        }
        Ok(released)
    }

    /// Release every active hold of an order. Returns how many stock rows
    /// were restored.
    ///
    /// # Errors
    ///
    /// Store errors only.
    pub async fn release_order_reservations(&self, order_id: OrderId) -> Result<usize> {
        let restocked = release_order_holds(&self.db, order_id, self.clock.now()).await?;
        Ok(restocked.len())
    }

    /// Expire one batch of active holds past their expiry, in one
    /// transaction. Rows locked by other transactions are skipped and picked
    /// up by a later sweep. Returns how many holds were expired.
    ///
    /// # Errors
    ///
    /// Store errors; the batch is rolled back as a whole.
    pub async fn cleanup_expired_reservations(&self, batch_size: i64) -> Result<usize> {
        let now = self.clock.now();
        let mut tx = self.db.begin().await.context("begin sweep")?;
        let result: Result<usize> = async {
            let mut holds = tx
                .lock_expired_reservations(now, batch_size)
                .await
                .context("lock expired reservations")?;
            holds.sort_by_key(|hold| (hold.key(), hold.id));

            let mut expired = 0;
            for hold in &holds {
                if end_hold(&mut tx, hold, ReservationStatus::Expired, now).await? {
                    expired += 1;
                }
            }
            Ok(expired)
        }
        .await;

        let expired = finish(tx, result, "commit sweep").await?;
        if expired > 0 {
            counter!(RESERVATIONS_EXPIRED).increment(expired as u64);
            tracing::info!(expired, "Expired reservations swept");
        }
        Ok(expired)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fulfillment_core::catalog::SubscriptionPlan;
    use fulfillment_core::ids::UserId;
    use fulfillment_core::reservation::ORDER_RESERVATION_TTL;
    use fulfillment_testing::{FixedClock, InMemoryDatabase, ProductSeed, VariantSeed, test_clock};
    use rust_decimal_macros::dec;

    async fn setup(stock: i32) -> (InMemoryDatabase, FixedClock, StockKey) {
        let db = InMemoryDatabase::new();
        let shop = db.add_storefront(UserId::new(1), SubscriptionPlan::Starter).await;
        let product = db.add_product(shop, ProductSeed::new("Kettle", dec!(45), stock)).await;
        (db, test_clock(), StockKey::new(product, None))
    }

    fn manager(db: &InMemoryDatabase, clock: &FixedClock) -> InventoryManager<InMemoryDatabase> {
        InventoryManager::new(db.clone(), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn manual_hold_reduces_availability_not_stock() {
        let (db, clock, key) = setup(5).await;
        let inventory = manager(&db, &clock);

        let hold = inventory
            .reserve_stock(key.product_id, None, 3, OrderId::new(100))
            .await
            .unwrap();
        assert!(!hold.stock_deducted);
        assert_eq!(hold.expires_at - clock.now(), Duration::hours(2));
        assert_eq!(db.stock(key).await, 5);
        assert_eq!(inventory.available_quantity(key).await.unwrap(), 2);

        let err = inventory
            .reserve_stock(key.product_id, None, 3, OrderId::new(101))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            OrderError::InsufficientStock {
                product_id: key.product_id,
                variant_id: None,
                requested: 3,
                available: 2,
            }
        );
    }

    #[tokio::test]
    async fn committing_a_soft_hold_takes_stock() {
        let (db, clock, key) = setup(5).await;
        let inventory = manager(&db, &clock);
        let hold = inventory
            .reserve_stock(key.product_id, None, 2, OrderId::new(100))
            .await
            .unwrap();

        let committed = inventory.commit_reservation(hold.id).await.unwrap();
        assert_eq!(committed.status, ReservationStatus::Confirmed);
        assert_eq!(db.stock(key).await, 3);
        assert_eq!(inventory.available_quantity(key).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (db, clock, key) = setup(5).await;
        let inventory = manager(&db, &clock);
        let hold = inventory
            .reserve_stock(key.product_id, None, 2, OrderId::new(100))
            .await
            .unwrap();

        assert!(inventory.release_reservation(hold.id).await.unwrap());
        assert!(!inventory.release_reservation(hold.id).await.unwrap());
        assert_eq!(
            db.reservation(hold.id).await.unwrap().status,
            ReservationStatus::Released
        );
        assert_eq!(inventory.available_quantity(key).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn lapsed_hold_cannot_be_committed() {
        let (db, clock, key) = setup(5).await;
        let inventory = manager(&db, &clock);
        let hold = inventory
            .reserve_stock(key.product_id, None, 2, OrderId::new(100))
            .await
            .unwrap();
        inventory.release_reservation(hold.id).await.unwrap();

        let err = inventory.commit_reservation(hold.id).await.unwrap_err();
        assert_eq!(
            err,
            OrderError::ReservationLapsed {
                reservation_id: hold.id,
                status: ReservationStatus::Released,
            }
        );
    }

    #[tokio::test]
    async fn failed_order_commit_releases_every_hold() {
        let (db, clock, key) = setup(5).await;
        let shop = db.add_storefront(UserId::new(2), SubscriptionPlan::Starter).await;
        let other = db.add_product(shop, ProductSeed::new("Cup", dec!(3), 1)).await;
        let variant = db.add_variant(other, VariantSeed::new(1)).await;
        let inventory = manager(&db, &clock);
        let order = OrderId::new(100);

        let first = inventory.reserve_stock(key.product_id, None, 2, order).await.unwrap();
        let second = inventory
            .reserve_stock(other, Some(variant), 1, order)
            .await
            .unwrap();
        // Someone else sells the last unit of the variant before payment.
        {
            let mut tx = db.begin().await.unwrap();
            tx.adjust_stock(StockKey::new(other, Some(variant)), -1).await.unwrap();
            tx.commit().await.unwrap();
        }

        let err = inventory.commit_order_reservations(order).await.unwrap_err();
        assert!(matches!(err, OrderError::InsufficientStock { .. }));
        assert_eq!(db.reservation(first.id).await.unwrap().status, ReservationStatus::Released);
        assert_eq!(db.reservation(second.id).await.unwrap().status, ReservationStatus::Released);
        assert_eq!(db.stock(key).await, 5);
    }

    #[tokio::test]
    async fn inactive_product_or_variant_cannot_be_held() {
        let (db, clock, key) = setup(5).await;
        let variant = db.add_variant(key.product_id, VariantSeed::new(3).inactive()).await;
        let inventory = manager(&db, &clock);

        let err = inventory
            .reserve_stock(key.product_id, Some(variant), 1, OrderId::new(100))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            OrderError::ProductInactive {
                product_id: key.product_id,
                variant_id: Some(variant),
            }
        );

        db.set_product_active(key.product_id, false).await;
        let err = inventory
            .reserve_stock(key.product_id, None, 1, OrderId::new(100))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::ProductInactive { variant_id: None, .. }));
        assert_eq!(inventory.available_quantity(key).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn orphan_release_leaves_other_orders_holds_alone() {
        let (db, clock, key) = setup(5).await;
        let owner = OrderId::new(200);
        let hold = {
            let mut tx = db.begin().await.unwrap();
            let hold = tx
                .insert_reservation(&NewReservation {
                    product_id: key.product_id,
                    variant_id: None,
                    order_id: owner,
                    quantity: 2,
                    stock_deducted: true,
                    expires_at: clock.now() + ORDER_RESERVATION_TTL,
                    created_at: clock.now(),
                })
                .await
                .unwrap();
            tx.adjust_stock(key, -2).await.unwrap();
            tx.commit().await.unwrap();
            hold
        };

        release_orphaned_holds(&db, OrderId::new(199), &[hold.id], clock.now()).await;
        assert_eq!(db.reservation(hold.id).await.unwrap().status, ReservationStatus::Active);
        assert_eq!(db.stock(key).await, 3);

        release_orphaned_holds(&db, owner, &[hold.id], clock.now()).await;
        assert_eq!(db.reservation(hold.id).await.unwrap().status, ReservationStatus::Released);
        assert_eq!(db.stock(key).await, 5);
    }

    #[tokio::test]
    async fn sweep_expires_only_lapsed_holds() {
        let (db, clock, key) = setup(10).await;
        let inventory = manager(&db, &clock).with_manual_hold_ttl(Duration::minutes(10));
        let early = inventory
            .reserve_stock(key.product_id, None, 4, OrderId::new(1))
            .await
            .unwrap();
        clock.advance(Duration::minutes(5));
        let late = inventory
            .reserve_stock(key.product_id, None, 4, OrderId::new(2))
            .await
            .unwrap();

        clock.advance(Duration::minutes(6));
        assert_eq!(inventory.cleanup_expired_reservations(100).await.unwrap(), 1);
        assert_eq!(db.reservation(early.id).await.unwrap().status, ReservationStatus::Expired);
        assert_eq!(db.reservation(late.id).await.unwrap().status, ReservationStatus::Active);
        assert_eq!(inventory.available_quantity(key).await.unwrap(), 6);
        assert_eq!(inventory.cleanup_expired_reservations(100).await.unwrap(), 0);
    }
}
