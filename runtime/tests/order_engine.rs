//! Integration tests for the order transaction engine
//!
//! Drives `OrderEngine`, `CartService`, the post-commit worker and the
//! reservation sweeper together against the in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use chrono::Duration;
use fulfillment_core::cart::CartOwner;
use fulfillment_core::catalog::{Address, SubscriptionPlan};
use fulfillment_core::environment::Clock;
use fulfillment_core::events::OrderEvent;
use fulfillment_core::ids::{
    OrderId, ProductId, StockKey, StorefrontId, UserId, VariantId, WarehouseId,
};
use fulfillment_core::order::{OrderStatus, PaymentMethod, PaymentStatus};
use fulfillment_core::reservation::ReservationStatus;
use fulfillment_core::OrderError;
use fulfillment_core::store::{Database, StoreTransaction};
use fulfillment_runtime::{
    CartService, CreateOrderRequest, EngineConfig, InventoryManager, LineRequest, OrderEngine,
    PostCommitQueue, PostCommitWorker, ReservationSweeper, RetryPolicy, StockLevelCache,
    UpdateStatusRequest,
};
use fulfillment_testing::{
    FixedClock, InMemoryDatabase, ProductSeed, RecordingPublisher, StoreOp, VariantSeed, test_clock,
};
use rust_decimal_macros::dec;
use std::sync::Arc;

// ============================================================================
// Test Fixtures
// ============================================================================

const SELLER: UserId = UserId::new(1);
const BUYER: UserId = UserId::new(50);

struct Marketplace {
    db: InMemoryDatabase,
    clock: FixedClock,
    engine: Arc<OrderEngine<InMemoryDatabase>>,
    worker: PostCommitWorker<InMemoryDatabase>,
    publisher: RecordingPublisher,
    shop: StorefrontId,
}

impl Marketplace {
    async fn new() -> Self {
        let db = InMemoryDatabase::new();
        let clock = test_clock();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let shop = db.add_storefront(SELLER, SubscriptionPlan::Professional).await;

        let (queue, receiver) = PostCommitQueue::channel();
        let publisher = RecordingPublisher::new();
        let cache = Arc::new(StockLevelCache::new(
            Duration::minutes(5),
            Arc::clone(&shared_clock),
        ));
        let worker = PostCommitWorker::new(
            receiver,
            db.clone(),
            Arc::new(publisher.clone()),
            cache,
            Arc::clone(&shared_clock),
        )
        .with_retry_policy(
            RetryPolicy::builder()
                .max_retries(1)
                .initial_delay(std::time::Duration::from_millis(1))
                .build(),
        );
        let engine = OrderEngine::new(db.clone(), shared_clock, queue, EngineConfig::default());

        Self {
            db,
            clock,
            engine: Arc::new(engine),
            worker,
            publisher,
            shop,
        }
    }

    async fn product(&self, name: &str, stock: i32) -> ProductId {
        self.db
            .add_product(self.shop, ProductSeed::new(name, dec!(100), stock))
            .await
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    async fn set_status(&self, order_id: OrderId, status: OrderStatus) -> Result<(), OrderError> {
        self.engine
            .update_order_status(UpdateStatusRequest {
                order_id,
                storefront_id: self.shop,
                requester_id: SELLER,
                status,
                tracking_number: Some("TRK-1".to_string()),
                notes: None,
            })
            .await
            .map(|_| ())
    }
}

fn address() -> Address {
    Address {
        recipient: "Marko Petrović".into(),
        street: "Bulevar oslobođenja 12".into(),
        city: "Novi Sad".into(),
        postal_code: "21000".into(),
        country: "RS".into(),
        phone: Some("+381601234567".into()),
    }
}

fn order_for(shop: StorefrontId, lines: &[(ProductId, i32)]) -> CreateOrderRequest {
    CreateOrderRequest {
        storefront_id: shop,
        buyer_id: BUYER,
        session_token: None,
        cart_id: None,
        items: lines
            .iter()
            .map(|&(product_id, quantity)| LineRequest {
                product_id,
                variant_id: None,
                quantity,
            })
            .collect(),
        shipping_address: address(),
        billing_address: None,
        shipping_method: Some("standard".into()),
        payment_method: PaymentMethod::Card,
        customer_notes: None,
    }
}

fn with_variants(
    mut request: CreateOrderRequest,
    variants: &[Option<VariantId>],
) -> CreateOrderRequest {
    for (line, variant_id) in request.items.iter_mut().zip(variants) {
        line.variant_id = *variant_id;
    }
    request
}

fn key(product: ProductId) -> StockKey {
    StockKey::new(product, None)
}

// ============================================================================
// Stock safety
// ============================================================================

#[tokio::test]
async fn sequential_orders_never_oversell() {
    let m = Marketplace::new().await;
    let chair = m.product("Chair", 5).await;

    let mut accepted = 0;
    let mut rejected = 0;
    for _ in 0..7 {
        match m.engine.create_order(order_for(m.shop, &[(chair, 1)])).await {
            Ok(_) => accepted += 1,
            Err(OrderError::InsufficientStock { available, .. }) => {
                assert_eq!(available, 0);
                rejected += 1;
            }
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    assert_eq!((accepted, rejected), (5, 2));
    assert_eq!(m.db.stock(key(chair)).await, 0);
}

#[tokio::test]
async fn concurrent_orders_accept_exactly_the_available_stock() {
    let m = Marketplace::new().await;
    let stock = 6;
    let desk = m.product("Desk", stock).await;

    let attempts = (0..stock * 2).map(|_| {
        let engine = Arc::clone(&m.engine);
        let request = order_for(m.shop, &[(desk, 1)]);
        tokio::spawn(async move { engine.create_order(request).await })
    });
    let results = futures::future::join_all(attempts).await;

    let accepted = results.iter().filter(|joined| matches!(joined, Ok(Ok(_)))).count();
    let oversold = results
        .iter()
        .filter(|joined| matches!(joined, Ok(Err(OrderError::InsufficientStock { .. }))))
        .count();
    assert_eq!(accepted, 6);
    assert_eq!(oversold, 6);
    assert_eq!(m.db.stock(key(desk)).await, 0);
}

#[tokio::test]
async fn failed_line_leaves_no_trace() {
    let m = Marketplace::new().await;
    let a = m.product("A", 5).await;
    let b = m.product("B", 5).await;
    let c = m.product("C", 5).await;
    m.db.fail_on(StoreOp::InsertOrderItem, 2);

    let err = m
        .engine
        .create_order(order_for(m.shop, &[(a, 1), (b, 2), (c, 3)]))
        .await
        .unwrap_err();

    assert!(matches!(err, OrderError::Internal { .. }), "got {err:?}");
    assert_eq!(m.db.order_count().await, 0);
    for product in [a, b, c] {
        assert_eq!(m.db.stock(key(product)).await, 5);
    }
}

#[tokio::test]
async fn cleanup_after_a_failed_order_spares_the_next_orders_holds() {
    let m = Marketplace::new().await;
    let lamp = m.product("Lamp", 5).await;
    m.db.fail_on(StoreOp::InsertOrderItem, 0);

    // Hold the store so both orders queue up: the failing one first.
    let blocker = m.db.begin().await.unwrap();
    let failing = {
        let engine = Arc::clone(&m.engine);
        let request = order_for(m.shop, &[(lamp, 1)]);
        tokio::spawn(async move { engine.create_order(request).await })
    };
    tokio::task::yield_now().await;
    let succeeding = {
        let engine = Arc::clone(&m.engine);
        let request = order_for(m.shop, &[(lamp, 1)]);
        tokio::spawn(async move { engine.create_order(request).await })
    };
    tokio::task::yield_now().await;
    blocker.rollback().await.unwrap();

    let err = failing.await.unwrap().unwrap_err();
    assert!(matches!(err, OrderError::Internal { .. }), "got {err:?}");
    let order = succeeding.await.unwrap().unwrap();

    assert_eq!(m.db.order(order.id).await.unwrap().status, OrderStatus::Pending);
    let holds = m.db.reservations_for(order.id).await;
    assert_eq!(holds.len(), 1);
    assert_eq!(holds[0].status, ReservationStatus::Active);
    assert_eq!(m.db.stock(key(lamp)).await, 4);
}

#[tokio::test]
async fn insufficient_stock_names_the_product_and_rolls_back() {
    let m = Marketplace::new().await;
    let plenty = m.product("Plenty", 10).await;
    let scarce = m.product("Scarce", 1).await;

    let err = m
        .engine
        .create_order(order_for(m.shop, &[(plenty, 3), (scarce, 2)]))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        OrderError::InsufficientStock {
            product_id: scarce,
            variant_id: None,
            requested: 2,
            available: 1,
        }
    );
    assert_eq!(m.db.stock(key(plenty)).await, 10);
    assert_eq!(m.db.order_count().await, 0);
}

#[tokio::test]
async fn duplicate_lines_are_merged_into_one_item() {
    let m = Marketplace::new().await;
    let lamp = m.product("Lamp", 10).await;

    let order = m
        .engine
        .create_order(order_for(m.shop, &[(lamp, 2), (lamp, 3)]))
        .await
        .unwrap();

    assert_eq!(order.items.len(), 1);
    assert_eq!(order.items[0].quantity, 5);
    assert_eq!(order.totals.subtotal, dec!(500));
    assert_eq!(m.db.reservations_for(order.id).await.len(), 1);
    assert_eq!(m.db.stock(key(lamp)).await, 5);
}

// ============================================================================
// Reservations
// ============================================================================

#[tokio::test]
async fn cancelling_twice_restocks_once() {
    let m = Marketplace::new().await;
    let sofa = m.product("Sofa", 4).await;
    let order = m.engine.create_order(order_for(m.shop, &[(sofa, 3)])).await.unwrap();
    assert_eq!(m.db.stock(key(sofa)).await, 1);

    let cancelled = m.engine.cancel_order(order.id, BUYER, None).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("cancelled_by_customer"));
    assert_eq!(m.db.stock(key(sofa)).await, 4);

    let again = m.engine.cancel_order(order.id, BUYER, None).await.unwrap_err();
    assert!(matches!(again, OrderError::InvalidStatusTransition { .. }));
    assert_eq!(m.db.stock(key(sofa)).await, 4);
}

#[tokio::test]
async fn releasing_a_reservation_twice_is_a_no_op() {
    let m = Marketplace::new().await;
    let rug = m.product("Rug", 3).await;
    let order = m.engine.create_order(order_for(m.shop, &[(rug, 2)])).await.unwrap();
    let inventory = InventoryManager::new(m.db.clone(), m.clock());
    let hold = m.db.reservations_for(order.id).await[0].id;

    assert!(inventory.release_reservation(hold).await.unwrap());
    assert!(!inventory.release_reservation(hold).await.unwrap());
    assert_eq!(m.db.stock(key(rug)).await, 3);
}

#[tokio::test]
async fn lapsed_holds_are_swept_and_cannot_be_confirmed() {
    let m = Marketplace::new().await;
    let vase = m.product("Vase", 10).await;
    let order = m.engine.create_order(order_for(m.shop, &[(vase, 3)])).await.unwrap();
    assert_eq!(m.db.stock(key(vase)).await, 7);

    m.clock.advance(Duration::minutes(31));
    let sweeper = ReservationSweeper::new(InventoryManager::new(m.db.clone(), m.clock()));
    assert_eq!(sweeper.run_once().await.unwrap(), 1);
    assert_eq!(m.db.stock(key(vase)).await, 10);

    let err = m
        .engine
        .confirm_payment(order.id, "txn-late".into())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrderError::ReservationLapsed {
            status: ReservationStatus::Expired,
            ..
        }
    ));
    assert_eq!(m.db.order(order.id).await.unwrap().status, OrderStatus::Pending);
    assert_eq!(m.db.stock(key(vase)).await, 10);
}

#[tokio::test]
async fn failed_confirmation_releases_every_hold() {
    let m = Marketplace::new().await;
    let a = m.product("A", 5).await;
    let b = m.product("B", 5).await;
    let order = m.engine.create_order(order_for(m.shop, &[(a, 2), (b, 2)])).await.unwrap();
    m.db.fail_on(StoreOp::SetReservationStatus, 1);

    let err = m.engine.confirm_payment(order.id, "txn-1".into()).await.unwrap_err();
    assert!(matches!(err, OrderError::Internal { .. }), "got {err:?}");

    assert_eq!(m.db.order(order.id).await.unwrap().status, OrderStatus::Pending);
    for hold in m.db.reservations_for(order.id).await {
        assert_eq!(hold.status, ReservationStatus::Released);
    }
    assert_eq!(m.db.stock(key(a)).await, 5);
    assert_eq!(m.db.stock(key(b)).await, 5);
}

// ============================================================================
// State machine
// ============================================================================

/// Statuses to walk through, starting from `pending`, to reach `status`.
fn path_to(status: OrderStatus) -> &'static [OrderStatus] {
    use OrderStatus::{Cancelled, Confirmed, Delivered, Pending, Processing, Refunded, Shipped};
    match status {
        Pending => &[],
        Confirmed => &[Confirmed],
        Processing => &[Confirmed, Processing],
        Shipped => &[Confirmed, Processing, Shipped],
        Delivered => &[Confirmed, Processing, Shipped, Delivered],
        Cancelled => &[Cancelled],
        Refunded => &[Confirmed, Processing, Shipped, Refunded],
    }
}

#[tokio::test]
async fn every_transition_pair_follows_the_state_machine() {
    let m = Marketplace::new().await;
    let stool = m.product("Stool", 100).await;

    for from in OrderStatus::ALL {
        for to in OrderStatus::ALL {
            let order = m.engine.create_order(order_for(m.shop, &[(stool, 1)])).await.unwrap();
            for step in path_to(from) {
                m.set_status(order.id, *step).await.unwrap();
            }

            let result = m.set_status(order.id, to).await;
            let status = m.db.order(order.id).await.unwrap().status;
            if from.can_transition_to(to) {
                assert!(result.is_ok(), "{from} -> {to} rejected: {result:?}");
                assert_eq!(status, to);
            } else {
                assert_eq!(
                    result,
                    Err(OrderError::InvalidStatusTransition { from, to }),
                    "{from} -> {to}"
                );
                assert_eq!(status, from);
            }
        }
    }
}

#[tokio::test]
async fn shipping_requires_a_tracking_number() {
    let m = Marketplace::new().await;
    let box_ = m.product("Box", 5).await;
    let order = m.engine.create_order(order_for(m.shop, &[(box_, 1)])).await.unwrap();
    m.set_status(order.id, OrderStatus::Confirmed).await.unwrap();
    m.set_status(order.id, OrderStatus::Processing).await.unwrap();

    let err = m
        .engine
        .update_order_status(UpdateStatusRequest {
            order_id: order.id,
            storefront_id: m.shop,
            requester_id: SELLER,
            status: OrderStatus::Shipped,
            tracking_number: Some("   ".into()),
            notes: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OrderError::Validation(_)));
    assert_eq!(m.db.order(order.id).await.unwrap().status, OrderStatus::Processing);
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn confirmation_publishes_exactly_one_event_with_default_warehouse() {
    let mut m = Marketplace::new().await;
    let local = m.product("Local", 5).await;
    let remote = m
        .db
        .add_product(
            m.shop,
            ProductSeed::new("Remote", dec!(40), 5).warehouse(WarehouseId::new(7)),
        )
        .await;
    let order = m
        .engine
        .create_order(order_for(m.shop, &[(local, 1), (remote, 2)]))
        .await
        .unwrap();

    let paid = m.engine.confirm_payment(order.id, "txn-42".into()).await.unwrap();
    assert_eq!(paid.status, OrderStatus::Confirmed);
    assert_eq!(paid.payment_status, PaymentStatus::Completed);

    let repeat = m.engine.confirm_payment(order.id, "txn-42".into()).await.unwrap();
    assert_eq!(repeat, paid);
    m.worker.drain().await;

    let confirmed = m.publisher.events_of_type("order.confirmed");
    assert_eq!(confirmed.len(), 1);
    let OrderEvent::Confirmed(event) = &confirmed[0] else {
        panic!("expected order.confirmed");
    };
    assert_eq!(event.order_id, order.id);
    let mut warehouses: Vec<_> = event
        .items
        .iter()
        .map(|line| (line.listing_id, line.quantity, line.warehouse_id))
        .collect();
    warehouses.sort();
    assert_eq!(
        warehouses,
        vec![(local, 1, WarehouseId::new(1)), (remote, 2, WarehouseId::new(7))]
    );

    for hold in m.db.reservations_for(order.id).await {
        assert_eq!(hold.status, ReservationStatus::Confirmed);
    }
    assert_eq!(m.db.stock(key(local)).await, 4);
    assert_eq!(m.db.stock(key(remote)).await, 3);
}

#[tokio::test]
async fn seller_cancellation_publishes_the_reason() {
    let mut m = Marketplace::new().await;
    let kettle = m.product("Kettle", 2).await;
    let order = m.engine.create_order(order_for(m.shop, &[(kettle, 2)])).await.unwrap();

    m.engine
        .update_order_status(UpdateStatusRequest {
            order_id: order.id,
            storefront_id: m.shop,
            requester_id: SELLER,
            status: OrderStatus::Cancelled,
            tracking_number: None,
            notes: Some("out of season".into()),
        })
        .await
        .unwrap();
    m.worker.drain().await;

    let cancelled = m.publisher.events_of_type("order.cancelled");
    assert_eq!(cancelled.len(), 1);
    let OrderEvent::Cancelled(event) = &cancelled[0] else {
        panic!("expected order.cancelled");
    };
    assert_eq!(event.reason, "out of season");
    assert_eq!(m.db.stock(key(kettle)).await, 2);
}

// ============================================================================
// Access control
// ============================================================================

#[tokio::test]
async fn only_buyer_and_seller_can_see_an_order() {
    let m = Marketplace::new().await;
    let mug = m.product("Mug", 5).await;
    let order = m.engine.create_order(order_for(m.shop, &[(mug, 1)])).await.unwrap();

    assert_eq!(m.engine.get_order(order.id, BUYER).await.unwrap().id, order.id);
    assert_eq!(m.engine.get_order(order.id, SELLER).await.unwrap().id, order.id);
    assert_eq!(
        m.engine.get_order(order.id, UserId::new(999)).await,
        Err(OrderError::AccessDenied)
    );
    assert_eq!(
        m.engine.cancel_order(order.id, SELLER, None).await,
        Err(OrderError::AccessDenied)
    );
}

#[tokio::test]
async fn status_updates_are_limited_to_the_storefront_owner() {
    let m = Marketplace::new().await;
    let mug = m.product("Mug", 5).await;
    let other_shop = m.db.add_storefront(UserId::new(2), SubscriptionPlan::Starter).await;
    let order = m.engine.create_order(order_for(m.shop, &[(mug, 1)])).await.unwrap();

    let stranger = m
        .engine
        .update_order_status(UpdateStatusRequest {
            order_id: order.id,
            storefront_id: m.shop,
            requester_id: UserId::new(2),
            status: OrderStatus::Confirmed,
            tracking_number: None,
            notes: None,
        })
        .await;
    assert_eq!(stranger, Err(OrderError::AccessDenied));

    let wrong_shop = m
        .engine
        .update_order_status(UpdateStatusRequest {
            order_id: order.id,
            storefront_id: other_shop,
            requester_id: UserId::new(2),
            status: OrderStatus::Confirmed,
            tracking_number: None,
            notes: None,
        })
        .await;
    assert_eq!(wrong_shop, Err(OrderError::AccessDenied));
    assert_eq!(m.db.order(order.id).await.unwrap().status, OrderStatus::Pending);
}

#[tokio::test]
async fn inactive_storefront_rejects_orders() {
    let m = Marketplace::new().await;
    let mug = m.product("Mug", 5).await;
    m.db.set_storefront_active(m.shop, false).await;

    let err = m.engine.create_order(order_for(m.shop, &[(mug, 1)])).await.unwrap_err();
    assert_eq!(err, OrderError::StorefrontInactive(m.shop));
    assert_eq!(m.db.stock(key(mug)).await, 5);
}

#[tokio::test]
async fn inactive_product_rejects_orders() {
    let m = Marketplace::new().await;
    let vase = m.product("Vase", 5).await;
    let mug = m.product("Mug", 5).await;
    m.db.set_product_active(vase, false).await;

    let err = m
        .engine
        .create_order(order_for(m.shop, &[(mug, 1), (vase, 1)]))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        OrderError::ProductInactive {
            product_id: vase,
            variant_id: None,
        }
    );
    assert_eq!(m.db.stock(key(vase)).await, 5);
    assert_eq!(m.db.stock(key(mug)).await, 5);
    assert_eq!(m.db.order_count().await, 0);
}

#[tokio::test]
async fn inactive_variant_of_an_active_product_rejects_orders() {
    let m = Marketplace::new().await;
    let shirt = m.product("Shirt", 5).await;
    let small = m.db.add_variant(shirt, VariantSeed::new(4).inactive()).await;

    let err = m
        .engine
        .create_order(with_variants(order_for(m.shop, &[(shirt, 1)]), &[Some(small)]))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        OrderError::ProductInactive {
            product_id: shirt,
            variant_id: Some(small),
        }
    );
    assert_eq!(m.db.stock(StockKey::new(shirt, Some(small))).await, 4);
    assert_eq!(m.db.order_count().await, 0);
}

#[tokio::test]
async fn variant_lines_draw_on_variant_stock() {
    let m = Marketplace::new().await;
    let shirt = m.product("Shirt", 10).await;
    let small = m
        .db
        .add_variant(shirt, VariantSeed::new(3).price(dec!(80)).sku("SHIRT-S"))
        .await;
    let large = m.db.add_variant(shirt, VariantSeed::new(2)).await;

    let request = with_variants(
        order_for(m.shop, &[(shirt, 1), (shirt, 2), (shirt, 1)]),
        &[None, Some(small), Some(large)],
    );
    let order = m.engine.create_order(request).await.unwrap();

    assert_eq!(order.items.len(), 3);
    assert_eq!(order.totals.subtotal, dec!(360));
    assert_eq!(m.db.stock(key(shirt)).await, 9);
    assert_eq!(m.db.stock(StockKey::new(shirt, Some(small))).await, 1);
    assert_eq!(m.db.stock(StockKey::new(shirt, Some(large))).await, 1);

    let small_item = order
        .items
        .iter()
        .find(|item| item.variant_id == Some(small))
        .unwrap();
    assert_eq!(small_item.product_sku.as_deref(), Some("SHIRT-S"));
    assert_eq!(small_item.price_per_unit, dec!(80));

    let mut held: Vec<_> = m
        .db
        .reservations_for(order.id)
        .await
        .iter()
        .map(|hold| (hold.variant_id, hold.quantity))
        .collect();
    held.sort();
    assert_eq!(held, vec![(None, 1), (Some(small), 2), (Some(large), 1)]);
}

#[tokio::test]
async fn inactive_product_cannot_be_added_to_a_cart() {
    let m = Marketplace::new().await;
    let vase = m.product("Vase", 5).await;
    m.db.set_product_active(vase, false).await;
    let carts = CartService::new(m.db.clone(), m.clock());

    let err = carts
        .add_item(&CartOwner::User(BUYER), m.shop, vase, None, 1)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        OrderError::ProductInactive {
            product_id: vase,
            variant_id: None,
        }
    );
}

// ============================================================================
// Carts
// ============================================================================

#[tokio::test]
async fn ordering_a_cart_empties_it() {
    let m = Marketplace::new().await;
    let pen = m.product("Pen", 10).await;
    let carts = CartService::new(m.db.clone(), m.clock());
    let cart = carts
        .add_item(&CartOwner::User(BUYER), m.shop, pen, None, 3)
        .await
        .unwrap();

    let mut request = order_for(m.shop, &[]);
    request.cart_id = Some(cart.id);
    let order = m.engine.create_order(request).await.unwrap();

    assert_eq!(order.items.len(), 1);
    assert_eq!(order.items[0].quantity, 3);
    assert!(m.db.cart(cart.id).await.unwrap().items.is_empty());
    assert_eq!(m.db.stock(key(pen)).await, 7);
}

#[tokio::test]
async fn someone_elses_cart_is_rejected() {
    let m = Marketplace::new().await;
    let pen = m.product("Pen", 10).await;
    let carts = CartService::new(m.db.clone(), m.clock());
    let cart = carts
        .add_item(&CartOwner::User(UserId::new(77)), m.shop, pen, None, 1)
        .await
        .unwrap();

    let mut request = order_for(m.shop, &[]);
    request.cart_id = Some(cart.id);
    assert_eq!(m.engine.create_order(request).await, Err(OrderError::AccessDenied));
    assert_eq!(m.db.cart(cart.id).await.unwrap().items.len(), 1);
}

#[tokio::test]
async fn empty_cart_is_rejected() {
    let m = Marketplace::new().await;
    let carts = CartService::new(m.db.clone(), m.clock());
    let cart = carts
        .get_or_create_cart(&CartOwner::User(BUYER), m.shop)
        .await
        .unwrap();

    let mut request = order_for(m.shop, &[]);
    request.cart_id = Some(cart.id);
    assert_eq!(m.engine.create_order(request).await, Err(OrderError::EmptyOrder));
}

#[tokio::test]
async fn failed_cart_cleanup_is_deferred_to_the_worker() {
    let mut m = Marketplace::new().await;
    let pen = m.product("Pen", 10).await;
    let carts = CartService::new(m.db.clone(), m.clock());
    let cart = carts
        .add_item(&CartOwner::User(BUYER), m.shop, pen, None, 2)
        .await
        .unwrap();
    m.db.fail_on(StoreOp::ClearCart, 0);

    let mut request = order_for(m.shop, &[]);
    request.cart_id = Some(cart.id);
    let order = m.engine.create_order(request).await.unwrap();

    assert!(m.db.order(order.id).await.is_some());
    assert_eq!(m.db.cart(cart.id).await.unwrap().items.len(), 1);

    m.worker.drain().await;
    assert!(m.db.cart(cart.id).await.unwrap().items.is_empty());
}
