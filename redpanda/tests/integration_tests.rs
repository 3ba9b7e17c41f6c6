//! Integration tests for [`RedpandaMessageBus`] with a real Kafka instance.
//!
//! These tests use testcontainers to spin up Kafka and validate:
//! - Publish/subscribe with keys and headers
//! - Redelivery of a message whose handler failed
//! - Committed offsets surviving a restart of the subscription
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//!
//! To run explicitly:
//! ```bash
//! cargo test -p library-events-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use library_events_core::message::{Headers, InboundMessage, OutboundMessage, RETRY_COUNT_HEADER};
use library_events_core::message_bus::{BusError, HandlerError, MessageBus, MessageHandler};
use library_events_redpanda::RedpandaMessageBus;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

/// Records every message it sees; fails the first `failures` calls.
struct Recorder {
    seen: Mutex<Vec<InboundMessage>>,
    failures: AtomicUsize,
}

impl Recorder {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(failures),
        })
    }

    fn seen(&self) -> Vec<InboundMessage> {
        self.seen.lock().unwrap().clone()
    }

    async fn wait_for(&self, count: usize) -> Vec<InboundMessage> {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                let seen = self.seen();
                if seen.len() >= count {
                    return seen;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("Timeout waiting for messages")
    }
}

impl MessageHandler for Recorder {
    fn handle<'a>(
        &'a self,
        message: &'a InboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            self.seen.lock().unwrap().push(message.clone());
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                Err(HandlerError::Routing(BusError::TransportError("induced".to_string())))
            } else {
                Ok(())
            }
        })
    }
}

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
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
    (kafka, format!("{host}:{port}"))
}

fn build_bus(brokers: &str) -> RedpandaMessageBus {
    RedpandaMessageBus::builder()
        .brokers(brokers)
        .auto_offset_reset("earliest")
        .redelivery_backoff(Duration::from_millis(100))
        .build()
        .expect("Failed to create message bus")
}

/// Publish until the broker accepts, which also auto-creates the topic.
async fn wait_for_topic(bus: &RedpandaMessageBus, topic: &str, message: &OutboundMessage) {
    for attempt in 1..=60 {
        if bus.publish(topic, message).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(attempt != 60, "Failed to publish to {topic}");
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn test_publish_and_subscribe_preserves_key_and_headers() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = build_bus(&brokers);

    let message = OutboundMessage::new(b"payload".to_vec())
        .with_key("42")
        .with_headers(Headers::new().with(RETRY_COUNT_HEADER, "1"));
    wait_for_topic(&bus, "library-events-roundtrip", &message).await;

    let recorder = Recorder::new(0);
    let subscription = bus
        .subscribe("library-events-roundtrip", "roundtrip-group", recorder.clone())
        .await
        .expect("Failed to subscribe");

    let seen = recorder.wait_for(1).await;
    assert_eq!(seen[0].payload, b"payload");
    assert_eq!(seen[0].key_str(), Some("42"));
    assert_eq!(seen[0].retry_count(), 1);

    subscription.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn test_failed_handler_receives_same_message_again() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = build_bus(&brokers);

    let message = OutboundMessage::new(b"flaky".to_vec()).with_key("7");
    wait_for_topic(&bus, "library-events-redelivery", &message).await;

    let recorder = Recorder::new(2);
    let subscription = bus
        .subscribe("library-events-redelivery", "redelivery-group", recorder.clone())
        .await
        .expect("Failed to subscribe");

    let seen = recorder.wait_for(3).await;
    assert!(seen.iter().all(|m| m.offset == seen[0].offset));

    subscription.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn test_committed_offsets_survive_resubscribe() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = build_bus(&brokers);
    let topic = "library-events-commit";

    let first = OutboundMessage::new(b"first".to_vec()).with_key("1");
    wait_for_topic(&bus, topic, &first).await;

    let recorder = Recorder::new(0);
    let subscription = bus
        .subscribe(topic, "commit-group", recorder.clone())
        .await
        .expect("Failed to subscribe");
    recorder.wait_for(1).await;

    // Let the async commit reach the broker
    tokio::time::sleep(Duration::from_secs(2)).await;
    subscription.stop().await;

    bus.publish(topic, &OutboundMessage::new(b"second".to_vec()).with_key("1"))
        .await
        .expect("Failed to publish");

    let recorder = Recorder::new(0);
    let subscription = bus
        .subscribe(topic, "commit-group", recorder.clone())
        .await
        .expect("Failed to resubscribe");

    let seen = recorder.wait_for(1).await;
    assert_eq!(seen[0].payload, b"second");

    subscription.stop().await;
}
