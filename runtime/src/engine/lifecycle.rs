//! Status transitions: cancellation, seller updates and payment capture.

use super::{OrderEngine, UpdateStatusRequest, log_failure};
use crate::inventory::{confirm_holds, release_order_holds, release_order_holds_in};
use crate::metrics::{ORDER_TRANSITIONS, counter};
use crate::tasks::PostCommitTask;
use crate::transaction::discard;
use chrono::{DateTime, Utc};
use fulfillment_core::error::StoreResultExt;
use fulfillment_core::events::OrderEvent;
use fulfillment_core::ids::{OrderId, StockKey, UserId};
use fulfillment_core::order::{Order, OrderStatus, TransitionDetails};
use fulfillment_core::store::{
    CatalogStore, Database, OrderStore, ReservationStore, StoreTransaction,
};
use fulfillment_core::{OrderError, Result};

const CUSTOMER_CANCEL_REASON: &str = "cancelled_by_customer";
const SELLER_CANCEL_REASON: &str = "cancelled_by_seller";

/// Why a transition transaction was abandoned.
struct Aborted {
    error: OrderError,
    /// Hold confirmation failed: every hold of the order must be released
    /// once the transaction is rolled back.
    release_holds: bool,
}

impl From<OrderError> for Aborted {
    fn from(error: OrderError) -> Self {
        Self {
            error,
            release_holds: false,
        }
    }
}

/// What a committed transition leaves for the post-commit queue.
struct Transitioned {
    order: Order,
    restocked: Vec<StockKey>,
    unchanged: bool,
}

impl<D: Database> OrderEngine<D> {
    /// Cancel an order on behalf of its buyer.
    ///
    /// Active holds are released and their stock restored. Holds already
    /// confirmed stay consumed. Publishes `order.cancelled`.
    ///
    /// # Errors
    ///
    /// - [`OrderError::AccessDenied`] if `requester_id` is not the buyer
    /// - [`OrderError::InvalidStatusTransition`] if the order can no longer be cancelled
    /// - [`OrderError::Validation`] if the reason is too long
    /// - [`OrderError::NotFound`] / [`OrderError::Conflict`] from the store
    #[tracing::instrument(skip(self, reason))]
    pub async fn cancel_order(
        &self,
        order_id: OrderId,
        requester_id: UserId,
        reason: Option<String>,
    ) -> Result<Order> {
        let result = self.cancel(order_id, requester_id, reason).await;
        if let Err(error) = &result {
            log_failure("cancel_order", error);
        }
        result
    }

    async fn cancel(
        &self,
        order_id: OrderId,
        requester_id: UserId,
        reason: Option<String>,
    ) -> Result<Order> {
        let reason = reason
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| CUSTOMER_CANCEL_REASON.to_string());
        self.check_notes("cancellation reason", Some(&reason))?;

        let now = self.clock.now();
        let mut tx = self.db.begin().await.context("begin cancellation")?;
        let result = self.cancel_in(&mut tx, order_id, requester_id, reason, now).await;
        self.settle(tx, order_id, result, now).await
    }

    async fn cancel_in(
        &self,
        tx: &mut D::Tx,
        order_id: OrderId,
        requester_id: UserId,
        reason: String,
        now: DateTime<Utc>,
    ) -> std::result::Result<Transitioned, Aborted> {
        let mut order = tx.lock_order(order_id).await.context("lock order")?;
        if order.customer_id != requester_id {
            return Err(OrderError::AccessDenied.into());
        }

        let from = order.status;
        order.transition(
            OrderStatus::Cancelled,
            TransitionDetails {
                reason: Some(reason),
                ..TransitionDetails::default()
            },
            now,
        )?;
        let restocked = self.settle_holds(tx, &order, now).await?;
        tx.save_order_state(&order).await.context("save order state")?;
        tracing::info!(from = %from, restocked = restocked.len(), "Order cancelled by buyer");
        Ok(Transitioned {
            order,
            restocked,
            unchanged: false,
        })
    }

    /// Advance an order on behalf of the storefront owner.
    ///
    /// - `confirmed` confirms every hold of the order (all or nothing) and
    ///   publishes `order.confirmed`; if a hold cannot be confirmed, every
    ///   hold is released and the error returned
    /// - `cancelled` releases active holds and publishes `order.cancelled`
    /// - `shipped` requires a tracking number
    ///
    /// # Errors
    ///
    /// - [`OrderError::AccessDenied`] if the order is not in `storefront_id`
    ///   or the requester does not own the storefront
    /// - [`OrderError::InvalidStatusTransition`] for transitions outside the state machine
    /// - [`OrderError::Validation`] for a missing tracking number or oversize notes
    /// - [`OrderError::ReservationLapsed`] / [`OrderError::InsufficientStock`] when confirming
    /// - [`OrderError::NotFound`] / [`OrderError::Conflict`] from the store
    #[tracing::instrument(
        skip(self, request),
        fields(order_id = %request.order_id, status = %request.status)
    )]
    pub async fn update_order_status(&self, request: UpdateStatusRequest) -> Result<Order> {
        let result = self.update_status(request).await;
        if let Err(error) = &result {
            log_failure("update_order_status", error);
        }
        result
    }

    async fn update_status(&self, request: UpdateStatusRequest) -> Result<Order> {
        self.check_notes("seller notes", request.notes.as_deref())?;

        let now = self.clock.now();
        let mut tx = self.db.begin().await.context("begin status update")?;
        let result = self.update_status_in(&mut tx, &request, now).await;
        self.settle(tx, request.order_id, result, now).await
    }

    async fn update_status_in(
        &self,
        tx: &mut D::Tx,
        request: &UpdateStatusRequest,
        now: DateTime<Utc>,
    ) -> std::result::Result<Transitioned, Aborted> {
        let mut order = tx.lock_order(request.order_id).await.context("lock order")?;
        if order.storefront_id != request.storefront_id {
            return Err(OrderError::AccessDenied.into());
        }
        let storefront = tx
            .get_storefront(order.storefront_id)
            .await
            .context("read storefront")?;
        if storefront.owner_id != request.requester_id {
            return Err(OrderError::AccessDenied.into());
        }

        let from = order.status;
        let reason = (request.status == OrderStatus::Cancelled).then(|| {
            request
                .notes
                .clone()
                .unwrap_or_else(|| SELLER_CANCEL_REASON.to_string())
        });
        order.transition(
            request.status,
            TransitionDetails {
                tracking_number: request.tracking_number.clone(),
                notes: request.notes.clone(),
                reason,
            },
            now,
        )?;

        let restocked = self.settle_holds(tx, &order, now).await?;
        tx.save_order_state(&order).await.context("save order state")?;
        tracing::info!(from = %from, to = %order.status, "Order status updated");
        Ok(Transitioned {
            order,
            restocked,
            unchanged: false,
        })
    }

    /// Record a captured payment and confirm the order.
    ///
    /// Calling it again for an order already confirmed with the same
    /// transaction id returns the order unchanged.
    ///
    /// # Errors
    ///
    /// - [`OrderError::Validation`] if `transaction_id` is blank
    /// - [`OrderError::InvalidStatusTransition`] if the order is not `pending`
    /// - [`OrderError::ReservationLapsed`] / [`OrderError::InsufficientStock`] if
    ///   the holds can no longer be confirmed (they are then released)
    /// - [`OrderError::NotFound`] / [`OrderError::Conflict`] from the store
    #[tracing::instrument(skip(self, transaction_id))]
    pub async fn confirm_payment(
        &self,
        order_id: OrderId,
        transaction_id: String,
    ) -> Result<Order> {
        let result = self.capture(order_id, transaction_id).await;
        if let Err(error) = &result {
            log_failure("confirm_payment", error);
        }
        result
    }

    async fn capture(&self, order_id: OrderId, transaction_id: String) -> Result<Order> {
        let transaction_id = transaction_id.trim().to_string();
        if transaction_id.is_empty() {
            return Err(OrderError::Validation(
                "payment transaction id is required".to_string(),
            ));
        }

        let now = self.clock.now();
        let mut tx = self.db.begin().await.context("begin payment capture")?;
        let result = self.capture_in(&mut tx, order_id, transaction_id, now).await;
        self.settle(tx, order_id, result, now).await
    }

    async fn capture_in(
        &self,
        tx: &mut D::Tx,
        order_id: OrderId,
        transaction_id: String,
        now: DateTime<Utc>,
    ) -> std::result::Result<Transitioned, Aborted> {
        let mut order = tx.lock_order(order_id).await.context("lock order")?;
        if order.status == OrderStatus::Confirmed
            && order.payment_transaction_id.as_deref() == Some(transaction_id.as_str())
        {
            tracing::debug!("Payment already recorded");
            return Ok(Transitioned {
                order,
                restocked: Vec::new(),
                unchanged: true,
            });
        }

        order.transition(OrderStatus::Confirmed, TransitionDetails::default(), now)?;
        order.mark_paid(transaction_id, now);

        let restocked = self.settle_holds(tx, &order, now).await?;
        tx.save_order_state(&order).await.context("save order state")?;
        tracing::info!("Payment captured, order confirmed");
        Ok(Transitioned {
            order,
            restocked,
            unchanged: false,
        })
    }

    /// Apply the reservation side of a transition that was just made.
    async fn settle_holds(
        &self,
        tx: &mut D::Tx,
        order: &Order,
        now: DateTime<Utc>,
    ) -> std::result::Result<Vec<StockKey>, Aborted> {
        match order.status {
            OrderStatus::Confirmed => {
                let holds = tx
                    .lock_order_reservations(order.id)
                    .await
                    .context("lock order reservations")?;
                confirm_holds(tx, &holds, now)
                    .await
                    .map_err(|error| Aborted {
                        error,
                        release_holds: true,
                    })?;
                Ok(Vec::new())
            }
            OrderStatus::Cancelled => Ok(release_order_holds_in(tx, order.id, now).await?),
            _ => Ok(Vec::new()),
        }
    }

    /// Commit or roll back a transition and run its post-commit work.
    async fn settle(
        &self,
        tx: D::Tx,
        order_id: OrderId,
        result: std::result::Result<Transitioned, Aborted>,
        now: DateTime<Utc>,
    ) -> Result<Order> {
        let done = match result {
            Ok(done) => done,
            Err(Aborted {
                error,
                release_holds,
            }) => {
                discard(tx).await;
                if release_holds {
                    tracing::warn!(
                        order_id = %order_id,
                        error = %error,
                        "Hold confirmation failed, releasing order holds"
                    );
                    if let Err(release) = release_order_holds(&self.db, order_id, now).await {
                        tracing::error!(
                            order_id = %order_id,
                            error = %release,
                            "Could not release holds after failed confirmation"
                        );
                    }
                }
                return Err(error);
            }
        };

        if done.unchanged {
            discard(tx).await;
            return Ok(done.order);
        }
        tx.commit().await.context("commit status change")?;

        let order = done.order;
        counter!(ORDER_TRANSITIONS, "to" => order.status.as_str()).increment(1);
        match order.status {
            OrderStatus::Confirmed => {
                let event = OrderEvent::confirmed(&order, self.config.default_warehouse, now);
                self.queue.enqueue(PostCommitTask::Publish(event));
            }
            OrderStatus::Cancelled => {
                let reason = order.cancellation_reason.clone().unwrap_or_default();
                let event = OrderEvent::cancelled(order.id, reason, now);
                self.queue.enqueue(PostCommitTask::Publish(event));
            }
            _ => {}
        }
        for key in done.restocked {
            self.queue.enqueue(PostCommitTask::RefreshStock {
                storefront_id: order.storefront_id,
                key,
            });
        }
        Ok(order)
    }
}
