//! Notifications for the warehouse/fulfillment service.
//!
//! Two events leave this engine, both on a single named stream:
//!
//! - `order.confirmed` once an order's stock is permanently consumed
//! - `order.cancelled` once an order is cancelled
//!
//! Delivery is at-least-once. Events are published after the transaction
//! that caused them commits, so a crash in between can drop or repeat one;
//! consumers must be idempotent on `order_id`.

use crate::ids::{OrderId, ProductId, StorefrontId, WarehouseId};
use crate::order::Order;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// One line the warehouse has to pick.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentLine {
    /// Product (listing) to ship
    pub listing_id: ProductId,
    /// Units
    pub quantity: i32,
    /// Warehouse to ship from
    pub warehouse_id: WarehouseId,
}

/// Payload of `order.confirmed`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    /// Order
    pub order_id: OrderId,
    /// Selling storefront
    pub storefront_id: StorefrontId,
    /// Lines to ship
    pub items: Vec<FulfillmentLine>,
    /// When the order was confirmed
    pub timestamp: DateTime<Utc>,
}

/// Payload of `order.cancelled`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    /// Order
    pub order_id: OrderId,
    /// Why
    pub reason: String,
    /// When the order was cancelled
    pub timestamp: DateTime<Utc>,
}

/// Event published to the order stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum OrderEvent {
    /// Stock consumed, ready to ship
    #[serde(rename = "order.confirmed")]
    Confirmed(OrderConfirmed),
    /// Order will not ship
    #[serde(rename = "order.cancelled")]
    Cancelled(OrderCancelled),
}

impl OrderEvent {
    /// Build `order.confirmed` for `order`, shipping unassigned lines from
    /// `default_warehouse`.
    #[must_use]
    pub fn confirmed(
        order: &Order,
        default_warehouse: WarehouseId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::Confirmed(OrderConfirmed {
            order_id: order.id,
            storefront_id: order.storefront_id,
            items: order
                .items
                .iter()
                .map(|item| FulfillmentLine {
                    listing_id: item.product_id,
                    quantity: item.quantity,
                    warehouse_id: item.warehouse_id.unwrap_or(default_warehouse),
                })
                .collect(),
            timestamp,
        })
    }

    /// Build `order.cancelled`.
    #[must_use]
    pub fn cancelled(
        order_id: OrderId,
        reason: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::Cancelled(OrderCancelled {
            order_id,
            reason: reason.into(),
            timestamp,
        })
    }

    /// Stream-level event name
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Confirmed(_) => "order.confirmed",
            Self::Cancelled(_) => "order.cancelled",
        }
    }

    /// Order the event is about; used as the partition key
    #[must_use]
    pub const fn order_id(&self) -> OrderId {
        match self {
            Self::Confirmed(event) => event.order_id,
            Self::Cancelled(event) => event.order_id,
        }
    }
}

/// Errors that can occur while publishing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Could not reach the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Broker rejected or timed out the record
    #[error("Publish failed for stream '{stream}': {reason}")]
    PublishFailed {
        /// Stream name
        stream: String,
        /// Broker message
        reason: String,
    },

    /// Event could not be encoded
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
}

/// Appends order events to the external stream.
///
/// Uses boxed futures so it can live behind `Arc<dyn EventPublisher>`.
pub trait EventPublisher: Send + Sync {
    /// Append one event. Returns once the broker acknowledged the write.
    ///
    /// # Errors
    ///
    /// [`PublishError`] if the event could not be encoded or written.
    fn publish<'a>(
        &'a self,
        event: &'a OrderEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>>;
}
