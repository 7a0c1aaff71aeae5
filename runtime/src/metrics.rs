//! Prometheus metrics for the fulfillment engine.
//!
//! Metric names emitted by the engine and its background jobs:
//!
//! | Name | Kind | Labels |
//! |---|---|---|
//! | `fulfillment_orders_created_total` | counter | |
//! | `fulfillment_order_failures_total` | counter | `reason` |
//! | `fulfillment_order_create_duration_seconds` | histogram | |
//! | `fulfillment_order_transitions_total` | counter | `to` |
//! | `fulfillment_reservations_released_total` | counter | |
//! | `fulfillment_reservations_expired_total` | counter | |
//! | `fulfillment_orders_reconciled_total` | counter | |
//! | `fulfillment_events_published_total` | counter | `event_type` |
//! | `fulfillment_post_commit_failures_total` | counter | `task` |
//!
//! # Example
//!
//! ```rust,no_run
//! use fulfillment_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Scrape http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

pub(crate) const ORDERS_CREATED: &str = "fulfillment_orders_created_total";
pub(crate) const ORDER_FAILURES: &str = "fulfillment_order_failures_total";
pub(crate) const ORDER_CREATE_DURATION: &str = "fulfillment_order_create_duration_seconds";
pub(crate) const ORDER_TRANSITIONS: &str = "fulfillment_order_transitions_total";
pub(crate) const RESERVATIONS_RELEASED: &str = "fulfillment_reservations_released_total";
pub(crate) const RESERVATIONS_EXPIRED: &str = "fulfillment_reservations_expired_total";
pub(crate) const ORDERS_RECONCILED: &str = "fulfillment_orders_reconciled_total";
pub(crate) const EVENTS_PUBLISHED: &str = "fulfillment_events_published_total";
pub(crate) const POST_COMMIT_FAILURES: &str = "fulfillment_post_commit_failures_total";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build or install the exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus exporter with its own HTTP listener.
#[derive(Debug, Clone, Copy)]
pub struct MetricsServer {
    addr: SocketAddr,
}

impl MetricsServer {
    /// Create a server that will listen on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Register metric descriptions, install the global recorder and start
    /// serving `/metrics`.
    ///
    /// Must be called from within a Tokio runtime, once per process.
    ///
    /// # Errors
    ///
    /// [`MetricsError::Install`] if a recorder is already installed or the
    /// listener cannot be set up.
    pub fn start(&self) -> Result<(), MetricsError> {
        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Install(e.to_string()))?
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        register_metrics();
        tracing::info!(addr = %self.addr, "Metrics exporter listening");
        Ok(())
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(ORDERS_CREATED, "Orders committed by the order transaction");
    describe_counter!(
        ORDER_FAILURES,
        "Order creations that failed, by error code"
    );
    describe_histogram!(
        ORDER_CREATE_DURATION,
        "Time spent in the order creation transaction"
    );
    describe_counter!(ORDER_TRANSITIONS, "Order status transitions, by target status");
    describe_counter!(
        RESERVATIONS_RELEASED,
        "Reservations released by cancellation or explicit release"
    );
    describe_counter!(
        RESERVATIONS_EXPIRED,
        "Reservations expired by the cleanup sweep"
    );
    describe_counter!(
        ORDERS_RECONCILED,
        "Pending orders cancelled because no reservation backs them any more"
    );
    describe_counter!(EVENTS_PUBLISHED, "Order events appended to the event stream");
    describe_counter!(
        POST_COMMIT_FAILURES,
        "Post-commit tasks that failed after all retries"
    );
}
