//! Background jobs.
//!
//! - [`ReservationSweeper`] expires holds past their expiry and returns
//!   deducted stock.
//! - [`PendingOrderReconciler`] cancels `pending` orders that no longer have
//!   an active hold behind them.
//!
//! Both run on a fixed interval until a shared `watch` shutdown signal flips
//! to `true`. A failed tick is logged and the next tick tries again.

use crate::inventory::InventoryManager;
use crate::metrics::{ORDERS_RECONCILED, counter};
use crate::tasks::{PostCommitQueue, PostCommitTask};
use crate::transaction::{discard, finish};
use chrono::{DateTime, Duration, Utc};
use fulfillment_core::environment::Clock;
use fulfillment_core::error::StoreResultExt;
use fulfillment_core::events::OrderEvent;
use fulfillment_core::ids::OrderId;
use fulfillment_core::order::{Order, OrderStatus, TransitionDetails};
use fulfillment_core::reservation::{ORDER_RESERVATION_TTL, ReservationStatus};
use fulfillment_core::store::{Database, OrderStore, ReservationStore};
use fulfillment_core::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Cancellation reason stamped by the reconciler.
pub const RESERVATION_EXPIRED_REASON: &str = "reservation_expired";

/// Periodically expires lapsed reservations.
pub struct ReservationSweeper<D: Database> {
    inventory: InventoryManager<D>,
    interval: std::time::Duration,
    batch_size: i64,
}

impl<D: Database> ReservationSweeper<D> {
    /// Sweep every minute in batches of 500.
    #[must_use]
    pub const fn new(inventory: InventoryManager<D>) -> Self {
        Self {
            inventory,
            interval: std::time::Duration::from_secs(60),
            batch_size: 500,
        }
    }

    /// Time between sweeps.
    #[must_use]
    pub const fn with_interval(mut self, interval: std::time::Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Holds expired per transaction.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Expire batches until one comes back short. Returns the total.
    ///
    /// # Errors
    ///
    /// The first store error; batches committed before it stay committed.
    pub async fn run_once(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let expired = self
                .inventory
                .cleanup_expired_reservations(self.batch_size)
                .await?;
            total += expired;
            if expired == 0 || i64::try_from(expired).unwrap_or(i64::MAX) < self.batch_size {
                return Ok(total);
            }
        }
    }

    /// Sweep on every tick until shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Reservation sweeper started");
        let this = &self;
        run_every(self.interval, shutdown, move || async move {
            if let Err(error) = this.run_once().await {
                tracing::warn!(error = %error, "Reservation sweep failed");
            }
        })
        .await;
        tracing::info!("Reservation sweeper stopped");
    }
}

/// Cancels pending orders whose reservations have all lapsed.
///
/// An order qualifies when it is `pending`, has at least one reservation,
/// none of them `active`, and was created more than `reservation_ttl + grace`
/// ago. Each order is cancelled in its own transaction with reason
/// `reservation_expired`, and `order.cancelled` is published.
pub struct PendingOrderReconciler<D: Database> {
    db: D,
    clock: Arc<dyn Clock>,
    queue: PostCommitQueue,
    reservation_ttl: Duration,
    grace: Duration,
    interval: std::time::Duration,
    batch_size: i64,
}

impl<D: Database> PendingOrderReconciler<D> {
    /// Reconcile every five minutes with a five minute grace period.
    #[must_use]
    pub fn new(db: D, clock: Arc<dyn Clock>, queue: PostCommitQueue) -> Self {
        Self {
            db,
            clock,
            queue,
            reservation_ttl: ORDER_RESERVATION_TTL,
            grace: Duration::minutes(5),
            interval: std::time::Duration::from_secs(300),
            batch_size: 100,
        }
    }

    /// Lifetime of order holds; should match the engine's.
    #[must_use]
    pub const fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl = ttl;
        self
    }

    /// Extra time after the TTL before an order is considered abandoned.
    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Time between runs.
    #[must_use]
    pub const fn with_interval(mut self, interval: std::time::Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Orders examined per run.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Cancel one batch of abandoned orders. Returns how many were cancelled.
    ///
    /// An order that fails is logged and skipped.
    ///
    /// # Errors
    ///
    /// Store errors while looking for candidates.
    pub async fn run_once(&self) -> Result<usize> {
        let now = self.clock.now();
        let cutoff = now - self.reservation_ttl - self.grace;

        let mut tx = self.db.begin().await.context("begin reconcile scan")?;
        let candidates = tx
            .find_unbacked_pending_orders(cutoff, self.batch_size)
            .await
            .context("find unbacked orders");
        discard(tx).await;

        let mut cancelled = 0;
        for order_id in candidates? {
            match self.reconcile(order_id, now).await {
                Ok(Some(order)) => {
                    cancelled += 1;
                    counter!(ORDERS_RECONCILED).increment(1);
                    tracing::info!(
                        order_id = %order.id,
                        order_number = %order.order_number,
                        "Pending order cancelled, reservations expired"
                    );
                    self.queue.enqueue(PostCommitTask::Publish(OrderEvent::cancelled(
                        order.id,
                        RESERVATION_EXPIRED_REASON,
                        now,
                    )));
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(
                        order_id = %order_id,
                        error = %error,
                        "Could not reconcile order"
                    );
                }
            }
        }
        Ok(cancelled)
    }

    /// Re-check one candidate under lock and cancel it if it still qualifies.
    async fn reconcile(&self, order_id: OrderId, now: DateTime<Utc>) -> Result<Option<Order>> {
        let mut tx = self.db.begin().await.context("begin reconcile")?;
        let result: Result<Option<Order>> = async {
            let mut order = tx.lock_order(order_id).await.context("lock order")?;
            if order.status != OrderStatus::Pending {
                return Ok(None);
            }
            let holds = tx
                .lock_order_reservations(order_id)
                .await
                .context("lock order reservations")?;
            if holds.is_empty()
                || holds
                    .iter()
                    .any(|hold| hold.status == ReservationStatus::Active)
            {
                return Ok(None);
            }

            order.transition(
                OrderStatus::Cancelled,
                TransitionDetails {
                    reason: Some(RESERVATION_EXPIRED_REASON.to_string()),
                    ..TransitionDetails::default()
                },
                now,
            )?;
            tx.save_order_state(&order).await.context("save order state")?;
            Ok(Some(order))
        }
        .await;
        finish(tx, result, "commit reconcile").await
    }

    /// Reconcile on every tick until shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Pending order reconciler started");
        let this = &self;
        run_every(self.interval, shutdown, move || async move {
            if let Err(error) = this.run_once().await {
                tracing::warn!(error = %error, "Order reconciliation failed");
            }
        })
        .await;
        tracing::info!("Pending order reconciler stopped");
    }
}

/// Call `tick` on a fixed interval until `shutdown` becomes `true` or its
/// sender is dropped. The first tick fires immediately.
async fn run_every<F, Fut>(
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => tick().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
