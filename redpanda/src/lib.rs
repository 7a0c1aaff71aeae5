//! Redpanda publisher for order fulfillment events.
//!
//! [`RedpandaEventPublisher`] implements [`EventPublisher`] with an rdkafka
//! `FutureProducer`. Every record goes to one topic:
//!
//! - **payload**: the [`OrderEvent`] as JSON, tagged with `event_type`
//! - **key**: the order id, so all events of one order land on one partition
//! - **header** `event_type`: `order.confirmed` or `order.cancelled`
//!
//! Delivery is at-least-once; consumers deduplicate on `order_id`.
//!
//! # Example
//!
//! ```no_run
//! use fulfillment_redpanda::RedpandaEventPublisher;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let publisher = RedpandaEventPublisher::builder()
//!     .brokers("localhost:9092")
//!     .topic("marketplace.orders")
//!     .producer_acks("all")
//!     .compression("lz4")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use fulfillment_core::events::{EventPublisher, OrderEvent, PublishError};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Topic used when none is configured.
pub const DEFAULT_TOPIC: &str = "marketplace.orders";

/// Publishes [`OrderEvent`]s to a Redpanda (or any Kafka-compatible) topic.
pub struct RedpandaEventPublisher {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl RedpandaEventPublisher {
    /// Publisher with default settings for `brokers`.
    ///
    /// # Errors
    ///
    /// [`PublishError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, PublishError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start configuring a publisher.
    #[must_use]
    pub fn builder() -> RedpandaEventPublisherBuilder {
        RedpandaEventPublisherBuilder::default()
    }

    /// Topic records are written to
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl std::fmt::Debug for RedpandaEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaEventPublisher")
            .field("topic", &self.topic)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`RedpandaEventPublisher`].
#[derive(Default, Debug)]
pub struct RedpandaEventPublisherBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
}

impl RedpandaEventPublisherBuilder {
    /// Comma-separated bootstrap servers, e.g. `localhost:9092`.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Topic name. Default: [`DEFAULT_TOPIC`]
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `none`, `gzip`, `snappy`, `lz4` or `zstd`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// How long a send may wait for the broker. Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the publisher.
    ///
    /// # Errors
    ///
    /// [`PublishError::ConnectionFailed`] if brokers are missing or the
    /// producer configuration is rejected.
    pub fn build(self) -> Result<RedpandaEventPublisher, PublishError> {
        let brokers = self
            .brokers
            .ok_or_else(|| PublishError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                PublishError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let topic = self.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string());
        tracing::info!(
            brokers = %brokers,
            topic = %topic,
            acks,
            compression,
            "Redpanda publisher created"
        );

        Ok(RedpandaEventPublisher {
            producer,
            topic,
            timeout,
        })
    }
}

/// JSON payload and partition key for `event`.
fn encode(event: &OrderEvent) -> Result<(Vec<u8>, String), PublishError> {
    let payload =
        serde_json::to_vec(event).map_err(|e| PublishError::SerializationFailed(e.to_string()))?;
    Ok((payload, event.order_id().to_string()))
}

impl EventPublisher for RedpandaEventPublisher {
    fn publish<'a>(
        &'a self,
        event: &'a OrderEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), PublishError>> + Send + 'a>> {
        Box::pin(async move {
            let (payload, key) = encode(event)?;
            let event_type = event.event_type();
            let headers = OwnedHeaders::new().insert(Header {
                key: "event_type",
                value: Some(event_type),
            });
            let record = FutureRecord::to(&self.topic)
                .payload(&payload)
                .key(&key)
                .headers(headers);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %self.topic,
                        partition,
                        offset,
                        event_type,
                        order_id = %key,
                        "Event published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %self.topic,
                        event_type,
                        order_id = %key,
                        error = %kafka_error,
                        "Failed to publish event"
                    );
                    Err(PublishError::PublishFailed {
                        stream: self.topic.clone(),
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }
}
