//! # Fulfillment Core
//!
//! Domain types and contracts for the marketplace order fulfillment engine.
//!
//! This crate has no I/O. It defines what an order, a cart and a stock
//! reservation are, which order status changes are legal, how money is
//! derived from line items, and the store/publisher traits that the runtime
//! engine drives inside a single database transaction.
//!
//! ## Modules
//!
//! - [`ids`]: Strongly typed identifiers
//! - [`catalog`]: Storefront and product snapshots read under row locks
//! - [`cart`]: Shopping carts and their owners
//! - [`order`]: Orders, order items and the status state machine
//! - [`reservation`]: Inventory reservations (stock holds)
//! - [`pricing`]: Totals, commission and escrow by subscription plan
//! - [`error`]: Store and engine error taxonomy
//! - [`store`]: Transactional store traits
//! - [`events`]: Downstream notifications and the publisher trait
//! - [`cache`]: TTL cache with scoped invalidation
//! - [`environment`]: Injected dependencies (clock)

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use rust_decimal::Decimal;

pub mod cache;
pub mod cart;
pub mod catalog;
pub mod error;
pub mod events;
pub mod ids;
pub mod order;
pub mod pricing;
pub mod reservation;
pub mod store;

pub use error::{OrderError, Result, StoreError};

/// Environment module - dependencies injected into the engine
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Reservation expiry, order numbers and status timestamps are all
    /// derived from this clock, never from `Utc::now()` directly.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
