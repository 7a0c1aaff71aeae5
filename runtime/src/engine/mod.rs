//! Order transaction engine.
//!
//! [`OrderEngine::create_order`] turns a cart or an explicit item list into an
//! order in a single store transaction: storefront, cart and every product row
//! are locked, stock is decremented, reservations and order items are written
//! and totals computed, or none of it happens.
//!
//! After creation the order only changes through the status state machine
//! ([`OrderEngine::cancel_order`], [`OrderEngine::update_order_status`],
//! [`OrderEngine::confirm_payment`]), each of which also settles the order's
//! reservations and publishes the matching event once committed.
//!
//! The engine never retries. Lock-wait timeouts and serialization failures
//! surface as [`OrderError::Conflict`](fulfillment_core::OrderError::Conflict);
//! see [`crate::retry::retry_order_operation`].

mod create;
mod lifecycle;
mod query;

use crate::tasks::PostCommitQueue;
use chrono::Duration;
use fulfillment_core::catalog::Address;
use fulfillment_core::environment::Clock;
use fulfillment_core::ids::{
    CartId, OrderId, ProductId, StorefrontId, UserId, VariantId, WarehouseId,
};
use fulfillment_core::order::{OrderStatus, PaymentMethod};
use fulfillment_core::pricing::{ChargeCalculator, NoCharges};
use fulfillment_core::reservation::ORDER_RESERVATION_TTL;
use fulfillment_core::store::Database;
use fulfillment_core::OrderError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Engine settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Lifetime of the holds created with an order
    pub reservation_ttl: Duration,
    /// Warehouse named in `order.confirmed` for items without one
    pub default_warehouse: WarehouseId,
    /// Currency stamped on new orders
    pub default_currency: String,
    /// Upper bound for a listing page
    pub list_max_limit: i64,
    /// Upper bound for one line's quantity
    pub max_line_quantity: i32,
    /// Upper bound for customer/seller notes, in characters
    pub max_notes_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: ORDER_RESERVATION_TTL,
            default_warehouse: WarehouseId::new(1),
            default_currency: "RSD".to_string(),
            list_max_limit: 100,
            max_line_quantity: 10_000,
            max_notes_len: 1000,
        }
    }
}

/// One explicit line of an order request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRequest {
    /// Product
    pub product_id: ProductId,
    /// Variant, if any
    #[serde(default)]
    pub variant_id: Option<VariantId>,
    /// Units
    pub quantity: i32,
}

/// Input of [`OrderEngine::create_order`].
///
/// When `cart_id` is set the cart's lines are used and `items` is ignored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    /// Storefront to buy from
    pub storefront_id: StorefrontId,
    /// Buyer
    pub buyer_id: UserId,
    /// Anonymous session, for carts created before sign-in
    #[serde(default)]
    pub session_token: Option<String>,
    /// Cart to convert
    #[serde(default)]
    pub cart_id: Option<CartId>,
    /// Explicit lines, used when no cart is given
    #[serde(default)]
    pub items: Vec<LineRequest>,
    /// Where to ship
    pub shipping_address: Address,
    /// Where to bill; defaults to the shipping address
    #[serde(default)]
    pub billing_address: Option<Address>,
    /// Carrier/service code
    #[serde(default)]
    pub shipping_method: Option<String>,
    /// How the buyer pays
    pub payment_method: PaymentMethod,
    /// Notes for the seller
    #[serde(default)]
    pub customer_notes: Option<String>,
}

/// Input of [`OrderEngine::update_order_status`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatusRequest {
    /// Order
    pub order_id: OrderId,
    /// Storefront the seller acts for
    pub storefront_id: StorefrontId,
    /// Seller
    pub requester_id: UserId,
    /// Target status
    pub status: OrderStatus,
    /// Required when shipping
    #[serde(default)]
    pub tracking_number: Option<String>,
    /// Seller notes
    #[serde(default)]
    pub notes: Option<String>,
}

/// The order transaction engine.
pub struct OrderEngine<D: Database> {
    db: D,
    clock: Arc<dyn Clock>,
    queue: PostCommitQueue,
    charges: Arc<dyn ChargeCalculator>,
    config: EngineConfig,
}

impl<D: Database> OrderEngine<D> {
    /// Create an engine with zero shipping and tax.
    #[must_use]
    pub fn new(db: D, clock: Arc<dyn Clock>, queue: PostCommitQueue, config: EngineConfig) -> Self {
        Self {
            db,
            clock,
            queue,
            charges: Arc::new(NoCharges),
            config,
        }
    }

    /// Use a different shipping/tax calculator.
    #[must_use]
    pub fn with_charge_calculator(mut self, charges: Arc<dyn ChargeCalculator>) -> Self {
        self.charges = charges;
        self
    }

    /// Engine settings
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn check_notes(&self, field: &str, notes: Option<&str>) -> Result<(), OrderError> {
        match notes {
            Some(text) if text.chars().count() > self.config.max_notes_len => {
                Err(OrderError::Validation(format!(
                    "{field} must be at most {} characters",
                    self.config.max_notes_len
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Log a failed engine call once, at the boundary.
fn log_failure(operation: &str, error: &OrderError) {
    match error {
        OrderError::Internal {
            correlation_id,
            context,
            message,
        } => tracing::error!(
            operation,
            %correlation_id,
            context = %context,
            message = %message,
            "Order operation failed"
        ),
        OrderError::Conflict { context, reason } => tracing::warn!(
            operation,
            context = %context,
            reason = %reason,
            "Order operation hit a lock conflict"
        ),
        other => tracing::info!(
            operation,
            code = other.code(),
            error = %other,
            "Order operation rejected"
        ),
    }
}
