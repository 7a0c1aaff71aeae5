//! # Fulfillment Testing
//!
//! Testing utilities for the fulfillment engine.
//!
//! This crate provides:
//! - [`mocks::FixedClock`]: deterministic, manually advanced time
//! - [`mocks::RecordingPublisher`]: captures published events, can fail on demand
//! - [`InMemoryDatabase`]: a transactional store with commit/rollback,
//!   serialised transactions and fault injection
//! - [`ProductSeed`]: catalog fixtures
//!
//! ## Example
//!
//! ```ignore
//! use fulfillment_testing::{test_clock, InMemoryDatabase, ProductSeed};
//!
//! #[tokio::test]
//! async fn places_an_order() {
//!     let db = InMemoryDatabase::new();
//!     let shop = db.add_storefront(UserId::new(1), SubscriptionPlan::Starter).await;
//!     let product = db.add_product(shop, ProductSeed::new("Mug", dec!(9.90), 5)).await;
//!     let engine = OrderEngine::new(db.clone(), Arc::new(test_clock()), queue, config);
//!     // ...
//! }
//! ```

mod memory;

pub use memory::{InMemoryDatabase, MemoryTransaction, ProductSeed, StoreOp, VariantSeed};

/// Mock implementations of environment traits.
pub mod mocks {
    use chrono::{DateTime, Duration, Utc};
    use fulfillment_core::environment::Clock;
    use fulfillment_core::events::{EventPublisher, OrderEvent, PublishError};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Clock for deterministic tests
    ///
    /// Returns the same time until advanced. Clones share the same time, so a
    /// test can keep one handle and move time forward under the engine.
    ///
    /// # Example
    ///
    /// ```
    /// use fulfillment_testing::mocks::FixedClock;
    /// use fulfillment_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let start = clock.now();
    /// clock.advance(Duration::minutes(31));
    /// assert_eq!(clock.now() - start, Duration::minutes(31));
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new clock stopped at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move time forward
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to `time`
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }

    /// Publisher that records every event it is given.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingPublisher {
        events: Arc<Mutex<Vec<OrderEvent>>>,
        failures: Arc<AtomicUsize>,
    }

    impl RecordingPublisher {
        /// Create an empty recorder
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Reject the next `count` publish calls
        pub fn fail_next(&self, count: usize) {
            self.failures.store(count, Ordering::SeqCst);
        }

        /// Events published so far, in order
        #[must_use]
        pub fn events(&self) -> Vec<OrderEvent> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Events of one type (`"order.confirmed"`, `"order.cancelled"`)
        #[must_use]
        pub fn events_of_type(&self, event_type: &str) -> Vec<OrderEvent> {
            self.events()
                .into_iter()
                .filter(|event| event.event_type() == event_type)
                .collect()
        }
    }

    impl EventPublisher for RecordingPublisher {
        fn publish<'a>(
            &'a self,
            event: &'a OrderEvent,
        ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>> {
            Box::pin(async move {
                let injected = self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if injected {
                    return Err(PublishError::PublishFailed {
                        stream: "memory".to_string(),
                        reason: "injected failure".to_string(),
                    });
                }
                self.events
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(event.clone());
                Ok(())
            })
        }
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, RecordingPublisher, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fulfillment_core::environment::Clock;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
        assert_eq!(time1.to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn clones_share_time() {
        let clock = test_clock();
        let handle = clock.clone();
        handle.advance(Duration::seconds(90));
        assert_eq!(clock.now(), handle.now());
    }
}
