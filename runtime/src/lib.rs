//! # Fulfillment Runtime
//!
//! The order transaction engine and the components that run around it.
//!
//! ## Core Components
//!
//! - [`OrderEngine`]: creates orders atomically and drives the order status
//!   state machine (cancel, status updates, payment confirmation)
//! - [`InventoryManager`]: manual holds, commit/release of reservations and the
//!   expired-reservation sweep
//! - [`CartService`]: cart mutations on top of the cart store
//! - [`PostCommitQueue`] / [`PostCommitWorker`]: best-effort side effects that
//!   run after a transaction commits (cache refresh, cart cleanup, events)
//! - [`jobs`]: the reservation sweeper and the pending-order reconciler
//!
//! Everything is generic over [`fulfillment_core::store::Database`]; the
//! Postgres implementation lives in `fulfillment-postgres` and an in-memory
//! one in `fulfillment-testing`.
//!
//! ## Example
//!
//! ```ignore
//! use fulfillment_runtime::{EngineConfig, OrderEngine, PostCommitQueue};
//!
//! let (queue, tasks) = PostCommitQueue::channel();
//! let engine = OrderEngine::new(db.clone(), clock, queue, EngineConfig::default());
//!
//! let order = engine.create_order(request).await?;
//! ```

/// Cart service
pub mod cart;

/// Order transaction engine
pub mod engine;

/// Inventory manager
pub mod inventory;

/// Background jobs
pub mod jobs;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// Post-commit task queue
pub mod tasks;

mod transaction;

pub use cart::CartService;
pub use engine::{
    CreateOrderRequest, EngineConfig, LineRequest, OrderEngine, UpdateStatusRequest,
};
pub use inventory::InventoryManager;
pub use jobs::{PendingOrderReconciler, ReservationSweeper};
pub use retry::RetryPolicy;
pub use tasks::{
    DeadLetter, DeadLetterQueue, PostCommitQueue, PostCommitTask, PostCommitWorker,
    StockCacheKey, StockLevelCache,
};
