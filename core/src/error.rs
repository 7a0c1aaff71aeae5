//! Error types for the store layer and the order engine.

use crate::ids::{ProductId, ReservationId, StockKey, StorefrontId, VariantId};
use crate::order::OrderStatus;
use crate::reservation::ReservationStatus;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, OrderError>;

/// Errors raised by store implementations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Row does not exist
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind ("order", "cart", ...)
        entity: &'static str,
        /// Id that was looked up
        id: String,
    },

    /// Lock wait timeout, serialization failure, deadlock or unique clash
    #[error("Store conflict: {0}")]
    Conflict(String),

    /// Any other database failure
    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Shorthand for [`StoreError::NotFound`].
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Comprehensive error taxonomy for order engine operations.
///
/// Client errors (4xx-equivalent) carry enough detail to act on. Internal
/// errors carry a correlation id and hide their message from `Display`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrderError {
    // ═══════════════════════════════════════════════════════════
    // Request Errors
    // ═══════════════════════════════════════════════════════════

    /// Malformed request
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Neither the cart nor the item list yielded any lines
    #[error("Order has no items")]
    EmptyOrder,

    // ═══════════════════════════════════════════════════════════
    // Business Rule Errors
    // ═══════════════════════════════════════════════════════════

    /// Not enough stock for a line
    #[error("Insufficient stock for product {}: requested {requested}, available {available}", stock_label(.product_id, .variant_id))]
    InsufficientStock {
        /// Product lacking stock
        product_id: ProductId,
        /// Variant lacking stock
        variant_id: Option<VariantId>,
        /// Units requested
        requested: i32,
        /// Units available
        available: i64,
    },

    /// Product or variant is not for sale
    #[error("Product {} is not active", stock_label(.product_id, .variant_id))]
    ProductInactive {
        /// Product
        product_id: ProductId,
        /// Variant
        variant_id: Option<VariantId>,
    },

    /// Storefront does not accept orders
    #[error("Storefront {0} is not active")]
    StorefrontInactive(StorefrontId),

    /// A reservation left `active` before it could be confirmed
    #[error("Reservation {reservation_id} is {status}, not active")]
    ReservationLapsed {
        /// Reservation
        reservation_id: ReservationId,
        /// Status found
        status: ReservationStatus,
    },

    // ═══════════════════════════════════════════════════════════
    // Authorization and State Errors
    // ═══════════════════════════════════════════════════════════

    /// Requester may not see or change this resource
    #[error("Access denied")]
    AccessDenied,

    /// Status change not allowed by the state machine
    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition {
        /// Current status
        from: OrderStatus,
        /// Requested status
        to: OrderStatus,
    },

    /// Order, cart, product or reservation missing
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind
        entity: &'static str,
        /// Id looked up
        id: String,
    },

    // ═══════════════════════════════════════════════════════════
    // Infrastructure Errors
    // ═══════════════════════════════════════════════════════════

    /// Lock timeout or serialization failure; safe to retry with backoff
    #[error("Conflict during {context}: {reason}")]
    Conflict {
        /// Step that failed
        context: String,
        /// Store message
        reason: String,
    },

    /// Anything unexpected
    #[error("Internal error (correlation id {correlation_id})")]
    Internal {
        /// Id to quote when reporting the failure
        correlation_id: Uuid,
        /// Step that failed
        context: String,
        /// Underlying message, for logs only
        message: String,
    },
}

impl OrderError {
    /// Build an [`OrderError::Internal`] with a fresh correlation id.
    #[must_use]
    pub fn internal(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Internal {
            correlation_id: Uuid::new_v4(),
            context: context.into(),
            message: message.into(),
        }
    }

    /// Wrap a store error with the step that produced it.
    #[must_use]
    pub fn from_store(context: &str, error: StoreError) -> Self {
        match error {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::Conflict(reason) => Self::Conflict {
                context: context.to_string(),
                reason,
            },
            StoreError::Database(message) => Self::internal(context, message),
        }
    }

    /// Shorthand for [`OrderError::NotFound`].
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Returns `true` if the caller may retry the same request with backoff.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns `true` for errors caused by the request (4xx-equivalent).
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        !matches!(self, Self::Conflict { .. } | Self::Internal { .. })
    }

    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::EmptyOrder => "empty_order",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::ProductInactive { .. } => "product_inactive",
            Self::StorefrontInactive(_) => "storefront_inactive",
            Self::ReservationLapsed { .. } => "reservation_lapsed",
            Self::AccessDenied => "access_denied",
            Self::InvalidStatusTransition { .. } => "invalid_status_transition",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::Internal { .. } => "internal_error",
        }
    }
}

fn stock_label(product_id: &ProductId, variant_id: &Option<VariantId>) -> StockKey {
    StockKey::new(*product_id, *variant_id)
}

/// Attach step context to store results.
pub trait StoreResultExt<T> {
    /// Convert a store error into an [`OrderError`] tagged with `context`.
    ///
    /// # Errors
    ///
    /// Returns the mapped error when `self` is `Err`.
    fn context(self, context: &str) -> Result<T>;
}

impl<T> StoreResultExt<T> for std::result::Result<T, StoreError> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|error| OrderError::from_store(context, error))
    }
}
