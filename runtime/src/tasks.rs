//! Post-commit task queue.
//!
//! Side effects that must not influence the outcome of a committed
//! transaction (stock cache refresh, deferred cart cleanup, event publishing)
//! are enqueued here and executed by a [`PostCommitWorker`]. Each task is
//! retried with exponential backoff; tasks that still fail are logged,
//! counted and parked in a [`DeadLetterQueue`].

use crate::metrics::{EVENTS_PUBLISHED, POST_COMMIT_FAILURES, counter};
use crate::retry::{RetryPolicy, retry_with_backoff};
use chrono::{DateTime, Utc};
use fulfillment_core::StoreError;
use fulfillment_core::cache::{Scoped, TtlCache};
use fulfillment_core::environment::Clock;
use fulfillment_core::events::{EventPublisher, OrderEvent, PublishError};
use fulfillment_core::ids::{CartId, StockKey, StorefrontId};
use fulfillment_core::store::{CartStore, CatalogStore, Database, StoreTransaction};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

// ============================================================================
// Tasks
// ============================================================================

/// Work to do after a transaction committed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PostCommitTask {
    /// Re-read the stock level of a product and store it in the cache
    RefreshStock {
        /// Storefront the product belongs to (cache scope)
        storefront_id: StorefrontId,
        /// Product/variant
        key: StockKey,
    },
    /// Delete the lines of a cart converted into an order
    ClearCart {
        /// Cart
        cart_id: CartId,
    },
    /// Append an event to the order stream
    Publish(OrderEvent),
}

impl PostCommitTask {
    /// Label used in logs and metrics
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RefreshStock { .. } => "refresh_stock",
            Self::ClearCart { .. } => "clear_cart",
            Self::Publish(_) => "publish",
        }
    }
}

/// Errors from executing a task.
#[derive(Error, Debug)]
pub enum TaskError {
    /// Store access failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Event publishing failed
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),
}

// ============================================================================
// Stock cache
// ============================================================================

/// Cache key for stock levels, scoped by storefront.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StockCacheKey {
    /// Storefront
    pub storefront_id: StorefrontId,
    /// Product/variant
    pub key: StockKey,
}

impl Scoped for StockCacheKey {
    type Scope = StorefrontId;

    fn scope(&self) -> StorefrontId {
        self.storefront_id
    }
}

/// Stock levels shown on listing pages. Never read by the order engine.
pub type StockLevelCache = TtlCache<StockCacheKey, i32>;

// ============================================================================
// Dead letters
// ============================================================================

/// A task that failed after exhausting retries.
#[derive(Clone, Debug)]
pub struct DeadLetter<T> {
    /// The failed payload
    pub payload: T,
    /// Last error message
    pub error_message: String,
    /// Retries attempted
    pub retry_count: usize,
    /// When the task was given up on
    pub failed_at: DateTime<Utc>,
}

/// Bounded store for tasks that failed after retries.
///
/// FIFO; when full the oldest entry is dropped. Clones share the same queue.
#[derive(Debug)]
pub struct DeadLetterQueue<T> {
    queue: Arc<Mutex<VecDeque<DeadLetter<T>>>>,
    max_size: usize,
}

impl<T> Clone for DeadLetterQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            max_size: self.max_size,
        }
    }
}

impl<T> DeadLetterQueue<T> {
    /// Create a queue holding at most `max_size` entries.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size,
        }
    }

    /// Park a payload that failed at `failed_at`, dropping the oldest entry
    /// when full.
    pub fn push(
        &self,
        payload: T,
        error_message: String,
        retry_count: usize,
        failed_at: DateTime<Utc>,
    ) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.len() >= self.max_size {
            queue.pop_front();
            tracing::warn!(
                max_size = self.max_size,
                "Dead letter queue full, dropping oldest entry"
            );
        }
        queue.push_back(DeadLetter {
            payload,
            error_message,
            retry_count,
            failed_at,
        });
    }

    /// Current number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every entry, oldest first.
    pub fn drain(&self) -> Vec<DeadLetter<T>> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let entries: Vec<_> = queue.drain(..).collect();
        tracing::info!(count = entries.len(), "Drained dead letter queue");
        entries
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Sending half of the post-commit queue. Cheap to clone.
#[derive(Clone, Debug)]
pub struct PostCommitQueue {
    sender: mpsc::UnboundedSender<PostCommitTask>,
}

impl PostCommitQueue {
    /// Create a queue and the receiver to hand to a [`PostCommitWorker`].
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PostCommitTask>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Enqueue a task. If the worker is gone the task is logged and dropped.
    pub fn enqueue(&self, task: PostCommitTask) {
        let kind = task.kind();
        if self.sender.send(task).is_err() {
            counter!(POST_COMMIT_FAILURES, "task" => kind).increment(1);
            tracing::warn!(task = kind, "Post-commit worker stopped, task dropped");
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Executes post-commit tasks.
pub struct PostCommitWorker<D: Database> {
    receiver: mpsc::UnboundedReceiver<PostCommitTask>,
    db: D,
    publisher: Arc<dyn EventPublisher>,
    stock_cache: Arc<StockLevelCache>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    dead_letters: DeadLetterQueue<PostCommitTask>,
}

impl<D: Database> PostCommitWorker<D> {
    /// Create a worker with the default retry policy and a dead letter queue
    /// of 1000 entries.
    #[must_use]
    pub fn new(
        receiver: mpsc::UnboundedReceiver<PostCommitTask>,
        db: D,
        publisher: Arc<dyn EventPublisher>,
        stock_cache: Arc<StockLevelCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            receiver,
            db,
            publisher,
            stock_cache,
            clock,
            retry: RetryPolicy::default(),
            dead_letters: DeadLetterQueue::new(1000),
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Handle to the tasks that failed after all retries.
    #[must_use]
    pub fn dead_letters(&self) -> DeadLetterQueue<PostCommitTask> {
        self.dead_letters.clone()
    }

    /// Process tasks until the queue closes or shutdown is signalled. Tasks
    /// already queued at shutdown are still processed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Post-commit worker started");
        loop {
            tokio::select! {
                task = self.receiver.recv() => match task {
                    Some(task) => self.process(task).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let remaining = self.drain().await;
                        tracing::info!(remaining, "Post-commit worker draining before shutdown");
                        break;
                    }
                }
            }
        }
        tracing::info!("Post-commit worker stopped");
    }

    /// Process every task currently queued and return how many ran.
    pub async fn drain(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(task) = self.receiver.try_recv() {
            self.process(task).await;
            processed += 1;
        }
        processed
    }

    async fn process(&self, task: PostCommitTask) {
        let kind = task.kind();
        match retry_with_backoff(&self.retry, || self.execute(&task)).await {
            Ok(()) => tracing::debug!(task = kind, "Post-commit task done"),
            Err(error) => {
                counter!(POST_COMMIT_FAILURES, "task" => kind).increment(1);
                tracing::error!(
                    task = kind,
                    error = %error,
                    retries = self.retry.max_retries,
                    "Post-commit task failed after retries"
                );
                self.dead_letters.push(
                    task,
                    error.to_string(),
                    self.retry.max_retries,
                    self.clock.now(),
                );
            }
        }
    }

    async fn execute(&self, task: &PostCommitTask) -> Result<(), TaskError> {
        match task {
            PostCommitTask::RefreshStock { storefront_id, key } => {
                let mut tx = self.db.begin().await?;
                let product = tx.get_product(key.product_id, key.variant_id).await;
                tx.rollback().await?;

                let cache_key = StockCacheKey {
                    storefront_id: *storefront_id,
                    key: *key,
                };
                match product {
                    Ok(product) => self.stock_cache.insert(cache_key, product.stock_quantity),
                    Err(StoreError::NotFound { .. }) => {
                        self.stock_cache.invalidate(&cache_key);
                    }
                    Err(error) => return Err(error.into()),
                }
                Ok(())
            }
            PostCommitTask::ClearCart { cart_id } => {
                let mut tx = self.db.begin().await?;
                let removed = tx.clear_cart(*cart_id).await?;
                tx.commit().await?;
                tracing::info!(cart_id = %cart_id, removed, "Deferred cart cleanup done");
                Ok(())
            }
            PostCommitTask::Publish(event) => {
                self.publisher.publish(event).await?;
                counter!(EVENTS_PUBLISHED, "event_type" => event.event_type()).increment(1);
                tracing::info!(
                    event_type = event.event_type(),
                    order_id = %event.order_id(),
                    "Order event published"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fulfillment_core::catalog::SubscriptionPlan;
    use fulfillment_core::ids::{OrderId, UserId};
    use fulfillment_testing::{InMemoryDatabase, ProductSeed, RecordingPublisher, test_clock};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(2)
            .initial_delay(Duration::from_millis(1))
            .build()
    }

    fn worker(
        db: &InMemoryDatabase,
        publisher: &RecordingPublisher,
    ) -> (PostCommitQueue, PostCommitWorker<InMemoryDatabase>, Arc<StockLevelCache>) {
        let clock: Arc<dyn Clock> = Arc::new(test_clock());
        let cache = Arc::new(StockLevelCache::new(
            chrono::Duration::minutes(5),
            Arc::clone(&clock),
        ));
        let (queue, receiver) = PostCommitQueue::channel();
        let worker = PostCommitWorker::new(
            receiver,
            db.clone(),
            Arc::new(publisher.clone()),
            Arc::clone(&cache),
            clock,
        )
        .with_retry_policy(fast_retry());
        (queue, worker, cache)
    }

    #[tokio::test]
    async fn refresh_stock_fills_the_cache() {
        let db = InMemoryDatabase::new();
        let shop = db.add_storefront(UserId::new(1), SubscriptionPlan::Starter).await;
        let product = db.add_product(shop, ProductSeed::new("Lamp", dec!(30), 4)).await;
        let publisher = RecordingPublisher::new();
        let (queue, mut worker, cache) = worker(&db, &publisher);

        let key = StockKey::new(product, None);
        queue.enqueue(PostCommitTask::RefreshStock {
            storefront_id: shop,
            key,
        });
        assert_eq!(worker.drain().await, 1);

        let cache_key = StockCacheKey {
            storefront_id: shop,
            key,
        };
        assert_eq!(cache.get(&cache_key), Some(4));
        assert_eq!(cache.invalidate_scope(&shop), 1);
    }

    #[tokio::test]
    async fn publish_retries_then_succeeds() {
        let db = InMemoryDatabase::new();
        let publisher = RecordingPublisher::new();
        publisher.fail_next(2);
        let (queue, mut worker, _) = worker(&db, &publisher);

        let event = OrderEvent::cancelled(OrderId::new(5), "buyer request", test_clock().now());
        queue.enqueue(PostCommitTask::Publish(event.clone()));
        worker.drain().await;

        assert_eq!(publisher.events(), vec![event]);
        assert!(worker.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn exhausted_tasks_become_dead_letters() {
        let db = InMemoryDatabase::new();
        let publisher = RecordingPublisher::new();
        publisher.fail_next(10);
        let (queue, mut worker, _) = worker(&db, &publisher);

        queue.enqueue(PostCommitTask::Publish(OrderEvent::cancelled(
            OrderId::new(9),
            "timeout",
            test_clock().now(),
        )));
        worker.drain().await;

        let dead = worker.dead_letters().drain();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload.kind(), "publish");
        assert_eq!(dead[0].failed_at, test_clock().now());
        assert!(publisher.events().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_after_draining() {
        let db = InMemoryDatabase::new();
        let publisher = RecordingPublisher::new();
        let (queue, worker, _) = worker(&db, &publisher);
        let (stop, shutdown) = watch::channel(false);

        let handle = tokio::spawn(worker.run(shutdown));
        queue.enqueue(PostCommitTask::Publish(OrderEvent::cancelled(
            OrderId::new(1),
            "x",
            test_clock().now(),
        )));
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(publisher.events().len(), 1);
    }

    #[test]
    fn dead_letter_queue_drops_oldest_when_full() {
        let queue = DeadLetterQueue::new(2);
        let now = test_clock().now();
        queue.push(1, "a".into(), 3, now);
        queue.push(2, "b".into(), 3, now);
        queue.push(3, "c".into(), 3, now);

        let entries = queue.drain();
        assert_eq!(entries.iter().map(|e| e.payload).collect::<Vec<_>>(), vec![2, 3]);
        assert!(queue.is_empty());
    }
}
