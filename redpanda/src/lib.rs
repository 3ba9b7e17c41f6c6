//! Redpanda message bus implementation for the library events consumer.
//!
//! This crate provides a Redpanda-based message bus that implements the
//! [`MessageBus`] trait from `library-events-core`. It uses rdkafka for
//! Kafka-compatible streaming, so it works against Redpanda, Apache Kafka, or
//! any other broker speaking the Kafka protocol.
//!
//! # Architecture
//!
//! ```text
//!                    ┌───────────────────┐
//!                    │   StreamConsumer  │  one per subscription
//!                    └─────────┬─────────┘
//!                              │ owned InboundMessage
//!            ┌─────────────────┼─────────────────┐
//!            ▼                 ▼                 ▼
//!     ┌─────────────┐   ┌─────────────┐   ┌─────────────┐
//!     │ partition 0 │   │ partition 1 │   │ partition n │  paused while behind
//!     │   worker    │   │   worker    │   │   worker    │
//!     └──────┬──────┘   └──────┬──────┘   └──────┬──────┘
//!            │ handler Ok      │                 │
//!            ▼                 ▼                 ▼
//!      commit offset+1   commit offset+1   commit offset+1
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Offsets are committed AFTER the handler returns `Ok`
//! - A failed handler gets the same message again after the redelivery back-off
//! - If the process crashes before commit, messages will be redelivered
//! - Ordering is guaranteed within a partition (same message key)
//! - A revoked partition finishes its in-flight message before it is
//!   released; its queued messages are left for the next owner
//!
//! # Example
//!
//! ```no_run
//! use library_events_redpanda::RedpandaMessageBus;
//! use library_events_core::message::OutboundMessage;
//! use library_events_core::message_bus::MessageBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaMessageBus::new("localhost:9092")?;
//!
//! let message = OutboundMessage::new(br#"{"libraryEventType":"NEW"}"#.to_vec());
//! bus.publish("library-events", &message).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod consumer;
mod rebalance;

use consumer::{LeasedConsumer, PartitionDispatch};
use library_events_core::message::{Headers, OutboundMessage};
use library_events_core::message_bus::{BusError, MessageBus, MessageHandler, Subscription};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::Consumer;
use rdkafka::message::{Header, Headers as KafkaHeaders, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rebalance::{PartitionLeases, RebalanceContext};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const DEFAULT_BUFFER_SIZE: usize = 1000;
const DEFAULT_AUTO_OFFSET_RESET: &str = "earliest";

/// Redpanda message bus implementation.
///
/// Publishing goes through a shared [`FutureProducer`]. Every call to
/// [`subscribe`](MessageBus::subscribe) creates its own consumer in the given
/// consumer group, so the ingest and retry listeners rebalance independently.
///
/// # Configuration
///
/// - **Broker addresses**: Bootstrap servers (required)
/// - **Producer settings**: Acks, compression, timeout
/// - **Buffer size**: Per-partition buffer capacity (default: 1000)
/// - **Offset reset**: Where new groups start reading (default: "earliest")
/// - **Redelivery back-off**: Pause before a failed message is handed over again (default: 1s)
///
/// # Example
///
/// ```no_run
/// use library_events_redpanda::RedpandaMessageBus;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedpandaMessageBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")  // Wait for all replicas
///     .compression("lz4")
///     .redelivery_backoff(Duration::from_millis(500))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaMessageBus {
    /// Kafka producer for publishing messages
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer timeout
    timeout: Duration,
    /// Message buffer size per partition worker
    buffer_size: usize,
    /// Auto offset reset policy
    auto_offset_reset: String,
    /// Pause between handler attempts on the same message
    redelivery_backoff: Duration,
}

impl RedpandaMessageBus {
    /// Create a new Redpanda message bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the message bus.
    #[must_use]
    pub fn builder() -> RedpandaMessageBusBuilder {
        RedpandaMessageBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    fn create_consumer(
        &self,
        group_id: &str,
        leases: Arc<PartitionLeases>,
    ) -> Result<LeasedConsumer, rdkafka::error::KafkaError> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false") // Manual commit for at-least-once
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create_with_context(RebalanceContext::new(leases))
    }
}

/// Builder for configuring a [`RedpandaMessageBus`].
#[derive(Default)]
pub struct RedpandaMessageBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
    redelivery_backoff: Option<Duration>,
}

impl RedpandaMessageBusBuilder {
    /// Set the broker addresses.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode.
    ///
    /// - `acks`: "0" (no acks), "1" (leader ack), "all" (all replicas ack)
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the number of messages buffered per partition between the Kafka
    /// consumer and the handler. Values below 1 are raised to 1.
    ///
    /// A partition whose backlog reaches this size is paused until the
    /// worker has worked through half of it.
    ///
    /// Buffered messages are not committed, so a stop or crash simply
    /// redelivers them.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Set the auto offset reset policy for new consumer groups
    /// (`"earliest"`, `"latest"` or `"error"`).
    ///
    /// Default: "earliest"
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the pause before a message whose handler failed is handed over again.
    ///
    /// Default: 1 second
    #[must_use]
    pub const fn redelivery_backoff(mut self, backoff: Duration) -> Self {
        self.redelivery_backoff = Some(backoff);
        self
    }

    /// Build the [`RedpandaMessageBus`].
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if:
    /// - Brokers not set
    /// - Cannot create producer
    pub fn build(self) -> Result<RedpandaMessageBus, BusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BusError::ConnectionFailed("Brokers not configured".to_string()))?;

        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| BusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| DEFAULT_AUTO_OFFSET_RESET.to_string());
        let redelivery_backoff = self.redelivery_backoff.unwrap_or(Duration::from_secs(1));

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            redelivery_backoff_ms = u64::try_from(redelivery_backoff.as_millis()).unwrap_or(u64::MAX),
            "RedpandaMessageBus created successfully"
        );

        Ok(RedpandaMessageBus {
            producer,
            brokers,
            timeout,
            buffer_size,
            auto_offset_reset,
            redelivery_backoff,
        })
    }
}

/// Copy bus headers into Kafka record headers.
fn to_kafka_headers(headers: &Headers) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key,
                value: Some(value),
            })
        })
}

/// Read Kafka record headers as text. Non-UTF-8 bytes are replaced and
/// valueless headers read as empty strings.
fn from_kafka_headers<H: KafkaHeaders>(headers: &H) -> Headers {
    headers
        .iter()
        .map(|header| {
            let value = header
                .value
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            (header.key.to_string(), value)
        })
        .collect()
}

impl MessageBus for RedpandaMessageBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + 'a>> {
        Box::pin(async move {
            let mut record = FutureRecord::<[u8], [u8]>::to(topic)
                .payload(message.payload.as_slice())
                .headers(to_kafka_headers(&message.headers));

            // The key selects the partition, which keeps per-key ordering
            if let Some(key) = message.key.as_deref() {
                record = record.key(key);
            }

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        "Message published successfully"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %topic,
                        error = %kafka_error,
                        "Failed to publish message"
                    );
                    Err(BusError::PublishFailed {
                        topic: topic.to_string(),
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        group_id: &'a str,
        handler: Arc<dyn MessageHandler>,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, BusError>> + Send + 'a>> {
        Box::pin(async move {
            let leases = Arc::new(PartitionLeases::default());
            let consumer = self.create_consumer(group_id, Arc::clone(&leases)).map_err(|e| {
                BusError::SubscriptionFailed {
                    topic: topic.to_string(),
                    reason: format!("Failed to create consumer: {e}"),
                }
            })?;

            consumer
                .subscribe(&[topic])
                .map_err(|e| BusError::SubscriptionFailed {
                    topic: topic.to_string(),
                    reason: format!("Failed to subscribe to topic: {e}"),
                })?;

            tracing::info!(
                topic = %topic,
                consumer_group = %group_id,
                buffer_size = self.buffer_size,
                auto_offset_reset = %self.auto_offset_reset,
                manual_commit = true,
                "Subscribed to topic"
            );

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let dispatch = PartitionDispatch {
                consumer: Arc::new(consumer),
                leases,
                handler,
                buffer_size: self.buffer_size,
                redelivery_backoff: self.redelivery_backoff,
                shutdown: shutdown_rx,
            };
            let task = tokio::spawn(dispatch.run());

            Ok(Subscription::new(topic, group_id, shutdown_tx, task))
        })
    }
}
