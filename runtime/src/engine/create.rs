//! Order creation.

use super::{CreateOrderRequest, LineRequest, OrderEngine, log_failure};
use crate::inventory::{available_in, release_orphaned_holds};
use crate::metrics::{ORDER_CREATE_DURATION, ORDER_FAILURES, ORDERS_CREATED, counter, histogram};
use crate::tasks::PostCommitTask;
use crate::transaction::discard;
use chrono::{DateTime, Utc};
use fulfillment_core::cart::line_total;
use fulfillment_core::catalog::{Address, Storefront};
use fulfillment_core::error::StoreResultExt;
use fulfillment_core::ids::{CartId, ReservationId, StockKey, StorefrontId, UserId};
use fulfillment_core::order::{NewOrder, NewOrderItem, Order};
use fulfillment_core::pricing::calculate_totals;
use fulfillment_core::reservation::{InventoryReservation, NewReservation};
use fulfillment_core::store::{
    CartStore, CatalogStore, Database, OrderStore, ReservationStore, StoreTransaction,
};
use fulfillment_core::{OrderError, Result};
use std::collections::BTreeMap;
use std::time::Instant;

/// What the order transaction produced, for the post-commit step.
struct Placed {
    order: Order,
    touched: Vec<StockKey>,
    deferred_cart_cleanup: Option<CartId>,
}

impl<D: Database> OrderEngine<D> {
    /// Create an order from a cart or an explicit item list.
    ///
    /// Runs as one transaction. Products are locked in ascending
    /// (product, variant) order, stock is decremented and a 30-minute hold is
    /// written for every line. The order starts `pending`; stock is only
    /// permanently consumed when the order is confirmed.
    ///
    /// # Errors
    ///
    /// - [`OrderError::Validation`] for malformed requests, a cart from another
    ///   storefront or a product of another storefront
    /// - [`OrderError::EmptyOrder`] if no lines resolve
    /// - [`OrderError::StorefrontInactive`] / [`OrderError::ProductInactive`]
    /// - [`OrderError::InsufficientStock`] naming the product and what is available
    /// - [`OrderError::AccessDenied`] if the cart belongs to someone else
    /// - [`OrderError::Conflict`] on lock timeout; retry with backoff
    /// - [`OrderError::Internal`] for anything else
    #[tracing::instrument(
        skip(self, request),
        fields(storefront_id = %request.storefront_id, buyer_id = %request.buyer_id)
    )]
    pub async fn create_order(&self, request: CreateOrderRequest) -> Result<Order> {
        let started = Instant::now();
        let result = self.place_order(request).await;
        histogram!(ORDER_CREATE_DURATION).record(started.elapsed().as_secs_f64());

        match &result {
            Ok(order) => {
                counter!(ORDERS_CREATED).increment(1);
                tracing::info!(
                    order_id = %order.id,
                    order_number = %order.order_number,
                    total = %order.totals.total,
                    items = order.items.len(),
                    "Order created"
                );
            }
            Err(error) => {
                counter!(ORDER_FAILURES, "reason" => error.code()).increment(1);
                log_failure("create_order", error);
            }
        }
        result
    }

    async fn place_order(&self, request: CreateOrderRequest) -> Result<Order> {
        self.validate_request(&request)?;

        let now = self.clock.now();
        let mut holds = Vec::new();
        let mut tx = self.db.begin().await.context("begin order transaction")?;

        let placed = match self.place_in(&mut tx, &request, now, &mut holds).await {
            Ok(placed) => placed,
            Err(error) => {
                discard(tx).await;
                self.release_orphans(&holds, now).await;
                return Err(error);
            }
        };
        if let Err(error) = tx.commit().await {
            self.release_orphans(&holds, now).await;
            return Err(OrderError::from_store("commit order", error));
        }

        for key in placed.touched {
            self.queue.enqueue(PostCommitTask::RefreshStock {
                storefront_id: request.storefront_id,
                key,
            });
        }
        if let Some(cart_id) = placed.deferred_cart_cleanup {
            self.queue.enqueue(PostCommitTask::ClearCart { cart_id });
        }
        Ok(placed.order)
    }

    async fn release_orphans(&self, holds: &[InventoryReservation], now: DateTime<Utc>) {
        let Some(order_id) = holds.first().map(|hold| hold.order_id) else {
            return;
        };
        let ids: Vec<ReservationId> = holds.iter().map(|hold| hold.id).collect();
        release_orphaned_holds(&self.db, order_id, &ids, now).await;
    }

    fn validate_request(&self, request: &CreateOrderRequest) -> Result<()> {
        check_address("shipping address", &request.shipping_address)?;
        if let Some(billing) = &request.billing_address {
            check_address("billing address", billing)?;
        }
        self.check_notes("customer notes", request.customer_notes.as_deref())?;
        if request.cart_id.is_none() {
            for line in &request.items {
                self.check_quantity(line.quantity)?;
            }
        }
        Ok(())
    }

    fn check_quantity(&self, quantity: i32) -> Result<()> {
        if (1..=self.config.max_line_quantity).contains(&quantity) {
            Ok(())
        } else {
            Err(OrderError::Validation(format!(
                "quantity must be between 1 and {}, got {quantity}",
                self.config.max_line_quantity
            )))
        }
    }

    async fn place_in(
        &self,
        tx: &mut D::Tx,
        request: &CreateOrderRequest,
        now: DateTime<Utc>,
        holds: &mut Vec<InventoryReservation>,
    ) -> Result<Placed> {
        let storefront = tx
            .lock_storefront_shared(request.storefront_id)
            .await
            .context("lock storefront")?;
        if !storefront.is_active {
            return Err(OrderError::StorefrontInactive(storefront.id));
        }

        let (lines, cart_id) = self.resolve_lines(tx, request).await?;
        if lines.is_empty() {
            return Err(OrderError::EmptyOrder);
        }
        for quantity in lines.values() {
            self.check_quantity(*quantity)?;
        }

        let mut order = tx
            .insert_order(&self.new_order(&storefront, request, now))
            .await
            .context("insert order")?;
        let expires_at = now + self.config.reservation_ttl;

        // BTreeMap iteration is ascending by stock key: the lock order.
        for (&key, &quantity) in &lines {
            let product = tx
                .lock_product(key.product_id, key.variant_id)
                .await
                .context("lock product")?;
            if product.storefront_id != storefront.id {
                return Err(OrderError::Validation(format!(
                    "product {key} does not belong to storefront {}",
                    storefront.id
                )));
            }
            if !product.is_active {
                return Err(OrderError::ProductInactive {
                    product_id: key.product_id,
                    variant_id: key.variant_id,
                });
            }

            let available = available_in(tx, &product, now).await?;
            if available < i64::from(quantity) {
                return Err(OrderError::InsufficientStock {
                    product_id: key.product_id,
                    variant_id: key.variant_id,
                    requested: quantity,
                    available,
                });
            }

            let hold = tx
                .insert_reservation(&NewReservation {
                    product_id: key.product_id,
                    variant_id: key.variant_id,
                    order_id: order.id,
                    quantity,
                    stock_deducted: true,
                    expires_at,
                    created_at: now,
                })
                .await
                .context("insert reservation")?;
            holds.push(hold);

            tx.adjust_stock(key, -quantity)
                .await
                .context("decrement stock")?;

            let item = tx
                .insert_order_item(&NewOrderItem {
                    order_id: order.id,
                    product_id: key.product_id,
                    variant_id: key.variant_id,
                    product_name: product.name,
                    product_sku: product.sku,
                    attributes: product.attributes,
                    quantity,
                    price_per_unit: product.price,
                    total_price: line_total(product.price, quantity),
                    warehouse_id: product.warehouse_id,
                    created_at: now,
                })
                .await
                .context("insert order item")?;
            order.items.push(item);
        }

        let totals = calculate_totals(
            order.items.iter().map(|item| item.total_price),
            &storefront.subscription_plan,
            self.charges.as_ref(),
        );
        tx.update_order_totals(order.id, &totals)
            .await
            .context("update order totals")?;
        order.totals = totals;

        let mut deferred_cart_cleanup = None;
        if let Some(cart_id) = cart_id {
            if let Err(error) = tx.clear_cart(cart_id).await {
                tracing::warn!(
                    cart_id = %cart_id,
                    error = %error,
                    "Cart cleanup failed inside the order transaction, deferring"
                );
                deferred_cart_cleanup = Some(cart_id);
            }
        }

        Ok(Placed {
            order,
            touched: lines.into_keys().collect(),
            deferred_cart_cleanup,
        })
    }

    async fn resolve_lines(
        &self,
        tx: &mut D::Tx,
        request: &CreateOrderRequest,
    ) -> Result<(BTreeMap<StockKey, i32>, Option<CartId>)> {
        let Some(cart_id) = request.cart_id else {
            return Ok((merge_lines(request.items.iter().cloned()), None));
        };

        let cart = tx.lock_cart(cart_id).await.context("lock cart")?;
        if !cart
            .owner
            .is_owned_by(request.buyer_id, request.session_token.as_deref())
        {
            return Err(OrderError::AccessDenied);
        }
        if cart.storefront_id != request.storefront_id {
            return Err(OrderError::Validation(format!(
                "cart {cart_id} belongs to another storefront"
            )));
        }

        let lines = merge_lines(cart.items.iter().map(|item| LineRequest {
            product_id: item.product_id,
            variant_id: item.variant_id,
            quantity: item.quantity,
        }));
        Ok((lines, Some(cart_id)))
    }

    fn new_order(
        &self,
        storefront: &Storefront,
        request: &CreateOrderRequest,
        now: DateTime<Utc>,
    ) -> NewOrder {
        NewOrder {
            order_number: order_number(storefront.id, request.buyer_id, now),
            storefront_id: storefront.id,
            customer_id: request.buyer_id,
            payment_method: request.payment_method,
            currency: self.config.default_currency.clone(),
            escrow_days: storefront.subscription_plan.escrow_days(),
            shipping_address: request.shipping_address.clone(),
            billing_address: request
                .billing_address
                .clone()
                .unwrap_or_else(|| request.shipping_address.clone()),
            pickup_address: storefront.address.clone(),
            shipping_method: request.shipping_method.clone(),
            customer_notes: request.customer_notes.clone(),
            created_at: now,
        }
    }
}

/// Merge duplicate (product, variant) lines, summing quantities.
fn merge_lines(lines: impl IntoIterator<Item = LineRequest>) -> BTreeMap<StockKey, i32> {
    let mut merged = BTreeMap::new();
    for line in lines {
        let quantity = merged
            .entry(StockKey::new(line.product_id, line.variant_id))
            .or_insert(0_i32);
        *quantity = quantity.saturating_add(line.quantity);
    }
    merged
}

/// `ORD-{storefront}-{buyer}-{unix millis}-{8 hex digits}`
fn order_number(storefront_id: StorefrontId, buyer_id: UserId, now: DateTime<Utc>) -> String {
    format!(
        "ORD-{storefront_id}-{buyer_id}-{}-{:08x}",
        now.timestamp_millis(),
        rand::random::<u32>()
    )
}

fn check_address(field: &str, address: &Address) -> Result<()> {
    let missing = address.missing_fields();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(OrderError::Validation(format!(
            "{field} is missing {}",
            missing.join(", ")
        )))
    }
}
