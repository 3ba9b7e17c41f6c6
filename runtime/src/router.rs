//! Retry and dead-letter routing of failed messages.
//!
//! ```text
//!                   ┌─ Retryable, retry_count < max_retries ──► retry topic  (retryCount + 1)
//! failed message ───┤
//!                   └─ otherwise ─────────────────────────────► dead-letter topic (retryCount,
//!                                                                errorClass, errorMessage)
//! ```
//!
//! Key and payload are forwarded byte for byte. Inbound headers are carried
//! over; the first reroute of a message also stamps where it originally came
//! from, and later hops keep that stamp.

use crate::error::{Classification, ProcessingError};
use crate::metrics::ProcessorMetrics;
use library_events_core::message::{
    ERROR_CLASS_HEADER, ERROR_MESSAGE_HEADER, Headers, InboundMessage, ORIGINAL_OFFSET_HEADER,
    ORIGINAL_PARTITION_HEADER, ORIGINAL_TOPIC_HEADER, OutboundMessage, RETRY_COUNT_HEADER,
};
use library_events_core::message_bus::{BusError, MessageBus};
use std::sync::Arc;

/// Destinations and retry budget of an [`ErrorRouter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Topic consumed by the retry dispatcher
    pub retry_topic: String,
    /// Topic for messages that will not be retried
    pub dead_letter_topic: String,
    /// Number of trips through the retry topic before dead-lettering
    pub max_retries: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            retry_topic: "library-events.RETRY".to_string(),
            dead_letter_topic: "library-events.DLT".to_string(),
            max_retries: 3,
        }
    }
}

/// Where a failed message went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Published to the retry topic carrying `retry_count`.
    Requeue {
        /// Incremented count written to the retry message
        retry_count: u32,
    },
    /// Published to the dead-letter topic carrying `retry_count`.
    DeadLetter {
        /// Inbound count, unchanged
        retry_count: u32,
    },
}

impl RouteDecision {
    /// Decide the destination of a failure seen on a message that already
    /// went through the retry topic `retry_count` times.
    #[must_use]
    pub const fn decide(classification: Classification, retry_count: u32, max_retries: u32) -> Self {
        match classification {
            Classification::Retryable if retry_count < max_retries => Self::Requeue {
                retry_count: retry_count.saturating_add(1),
            },
            Classification::Retryable | Classification::NonRetryable => {
                Self::DeadLetter { retry_count }
            },
        }
    }
}

/// Publishes failed messages to the retry or dead-letter topic.
#[derive(Clone)]
pub struct ErrorRouter {
    bus: Arc<dyn MessageBus>,
    config: RouterConfig,
}

impl ErrorRouter {
    /// Create a router publishing through `bus`.
    #[must_use]
    pub const fn new(bus: Arc<dyn MessageBus>, config: RouterConfig) -> Self {
        Self { bus, config }
    }

    /// Router configuration.
    #[must_use]
    pub const fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Publish `message` to the destination its failure calls for.
    ///
    /// Performs exactly one publish. Acknowledging `message` is left to the
    /// caller and must only happen once this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns the [`BusError`] of the failed publish.
    pub async fn route(
        &self,
        message: &InboundMessage,
        error: &ProcessingError,
        retry_count: u32,
    ) -> Result<RouteDecision, BusError> {
        let error_class = error.error_class();
        let decision =
            RouteDecision::decide(error.classification(), retry_count, self.config.max_retries);

        let mut headers = rerouted_headers(message);
        let topic = match decision {
            RouteDecision::Requeue { retry_count } => {
                headers.insert(RETRY_COUNT_HEADER, retry_count.to_string());
                &self.config.retry_topic
            },
            RouteDecision::DeadLetter { retry_count } => {
                headers.insert(RETRY_COUNT_HEADER, retry_count.to_string());
                headers.insert(ERROR_CLASS_HEADER, error_class);
                headers.insert(ERROR_MESSAGE_HEADER, error.to_string());
                &self.config.dead_letter_topic
            },
        };

        let outbound = OutboundMessage {
            key: message.key.clone(),
            payload: message.payload.clone(),
            headers,
        };

        if let Err(e) = self.bus.publish(topic, &outbound).await {
            tracing::error!(
                topic = %topic,
                source_topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Failed to route message, it will not be acknowledged"
            );
            return Err(e);
        }

        match decision {
            RouteDecision::Requeue { retry_count } => {
                ProcessorMetrics::record_requeued(error_class);
                tracing::warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    retry_count,
                    error_class,
                    error = %error,
                    "Library event requeued for retry"
                );
            },
            RouteDecision::DeadLetter { retry_count } => {
                ProcessorMetrics::record_dead_lettered(error_class);
                tracing::error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    retry_count,
                    error_class,
                    error = %error,
                    "Library event dead-lettered"
                );
            },
        }

        Ok(decision)
    }
}

/// Inbound headers plus the origin stamp of the retry chain.
fn rerouted_headers(message: &InboundMessage) -> Headers {
    let mut headers = message.headers.clone();
    if !headers.contains(ORIGINAL_TOPIC_HEADER) {
        headers.insert(ORIGINAL_TOPIC_HEADER, message.topic.clone());
        headers.insert(ORIGINAL_PARTITION_HEADER, message.partition.to_string());
        headers.insert(ORIGINAL_OFFSET_HEADER, message.offset.to_string());
    }
    headers
}
