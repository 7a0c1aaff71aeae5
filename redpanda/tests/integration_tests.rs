//! Integration tests for [`RedpandaEventPublisher`] against a real broker.
//!
//! Ignored by default: they need Docker and take 15-60 seconds to start Kafka.
//!
//! ```bash
//! cargo test -p fulfillment-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use fulfillment_core::environment::Clock;
use fulfillment_core::events::{EventPublisher, OrderEvent};
use fulfillment_core::ids::OrderId;
use fulfillment_redpanda::RedpandaEventPublisher;
use fulfillment_testing::test_clock;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use std::time::Duration;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

const TOPIC: &str = "marketplace.orders.test";

/// Publish until the broker accepts a record, creating the topic on the way.
async fn wait_until_writable(publisher: &RedpandaEventPublisher) {
    let warmup = OrderEvent::cancelled(OrderId::new(0), "warmup", test_clock().now());
    for attempt in 1..=60 {
        if publisher.publish(&warmup).await.is_ok() {
            tokio::time::sleep(Duration::from_secs(1)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt != 60, "Kafka failed to become ready");
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn records_carry_json_payload_order_key_and_type_header() {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");
    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");

    let publisher = RedpandaEventPublisher::builder()
        .brokers(&brokers)
        .topic(TOPIC)
        .producer_acks("all")
        .build()
        .expect("Failed to create publisher");
    wait_until_writable(&publisher).await;

    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &brokers)
        .set("group.id", "fulfillment-test")
        .set("auto.offset.reset", "earliest")
        .create()
        .expect("Failed to create consumer");
    consumer.subscribe(&[TOPIC]).expect("Failed to subscribe");

    let event = OrderEvent::cancelled(OrderId::new(77), "customer_request", test_clock().now());
    publisher.publish(&event).await.expect("Failed to publish");

    let received = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let message = consumer.recv().await.expect("Failed to receive");
            if message.key() == Some(b"77".as_slice()) {
                return message.detach();
            }
        }
    })
    .await
    .expect("Timeout waiting for event");

    let payload = received.payload().expect("payload");
    let decoded: OrderEvent = serde_json::from_slice(payload).expect("valid JSON");
    assert_eq!(decoded, event);

    let headers = received.headers().expect("headers");
    let header = headers.iter().find(|h| h.key == "event_type").expect("event_type header");
    assert_eq!(header.value, Some(b"order.cancelled".as_slice()));
}
