//! Per-message processing: decode, validate, persist, or route the failure.
//!
//! ```text
//! Received ──► Decoded ──► Validated ──► Persisted                 (ack)
//!    │            │            │
//!    └── DecodeFailed / ValidationFailed / PersistFailed
//!                      │
//!                      ▼
//!                 Classified ──► Requeued | DeadLettered           (ack)
//! ```
//!
//! Every processing failure ends in a routing decision. The only error
//! surfaced to the bus is a failed route, which leaves the message
//! unacknowledged so it is handed over again.

use crate::error::ProcessingError;
use crate::metrics::ProcessorMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use crate::router::{ErrorRouter, RouteDecision};
use library_events_core::codec;
use library_events_core::event::{PersistedEvent, ValidationError};
use library_events_core::message::InboundMessage;
use library_events_core::message_bus::{HandlerError, MessageHandler};
use library_events_core::repository::{EventRepository, StoreError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

/// Terminal state of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// The event was written to the repository.
    Persisted(PersistedEvent),
    /// The message was published to the retry topic.
    Requeued {
        /// Count carried by the retry message
        retry_count: u32,
    },
    /// The message was published to the dead-letter topic.
    DeadLettered {
        /// Count carried by the dead-letter message
        retry_count: u32,
        /// Taxonomy name of the failure
        error_class: &'static str,
    },
}

/// Turns inbound messages into persisted events.
///
/// Implements [`MessageHandler`], so one instance can serve both the ingest
/// and the retry subscription.
///
/// # Example
///
/// ```ignore
/// let processor = EventProcessor::new(repository, ErrorRouter::new(bus, RouterConfig::default()))
///     .with_persist_policy(RetryPolicy::none());
///
/// match processor.process(&message).await? {
///     ProcessingOutcome::Persisted(event) => println!("stored {}", event.id),
///     other => println!("routed: {other:?}"),
/// }
/// ```
pub struct EventProcessor {
    repository: Arc<dyn EventRepository>,
    router: ErrorRouter,
    persist_policy: RetryPolicy,
}

impl EventProcessor {
    /// Create a processor with the default in-process persistence retry policy.
    #[must_use]
    pub fn new(repository: Arc<dyn EventRepository>, router: ErrorRouter) -> Self {
        Self {
            repository,
            router,
            persist_policy: RetryPolicy::default(),
        }
    }

    /// Replace the policy for in-process retries of transient store failures.
    #[must_use]
    pub fn with_persist_policy(mut self, policy: RetryPolicy) -> Self {
        self.persist_policy = policy;
        self
    }

    /// Drive one message to a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Routing`] if a failed message could not be
    /// published to the retry or dead-letter topic. The message has then not
    /// reached a terminal state and must not be acknowledged.
    pub async fn process(&self, message: &InboundMessage) -> Result<ProcessingOutcome, HandlerError> {
        let start = Instant::now();
        let retry_count = message.retry_count();

        ProcessorMetrics::record_received(&message.topic);
        tracing::debug!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            key = message.key_str(),
            retry_count,
            headers = %message.headers,
            "Received library event"
        );

        let outcome = match self.persist(message).await {
            Ok(persisted) => {
                ProcessorMetrics::record_persisted(persisted.event_type.as_str());
                tracing::info!(
                    topic = %message.topic,
                    offset = message.offset,
                    library_event_id = persisted.id,
                    event_type = %persisted.event_type,
                    "Library event persisted"
                );
                ProcessingOutcome::Persisted(persisted)
            },
            Err(error) => match self.router.route(message, &error, retry_count).await? {
                RouteDecision::Requeue { retry_count } => ProcessingOutcome::Requeued { retry_count },
                RouteDecision::DeadLetter { retry_count } => ProcessingOutcome::DeadLettered {
                    retry_count,
                    error_class: error.error_class(),
                },
            },
        };

        ProcessorMetrics::record_duration(start.elapsed());
        Ok(outcome)
    }

    async fn persist(&self, message: &InboundMessage) -> Result<PersistedEvent, ProcessingError> {
        let event = codec::decode(&message.payload)?;
        event.validate()?;

        let mut attempts = 0_u32;
        let result = retry_with_predicate(
            &self.persist_policy,
            || {
                attempts += 1;
                self.repository.upsert(&event)
            },
            StoreError::is_transient,
        )
        .await;
        ProcessorMetrics::record_persist_retries(attempts.saturating_sub(1));

        result.map_err(|e| match e {
            StoreError::NotFound(id) => ValidationError::UnknownEvent(id).into(),
            other => other.into(),
        })
    }
}

impl MessageHandler for EventProcessor {
    fn handle<'a>(
        &'a self,
        message: &'a InboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move { self.process(message).await.map(|_| ()) })
    }
}
