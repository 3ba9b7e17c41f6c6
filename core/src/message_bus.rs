//! Message bus abstraction for consuming and republishing library events.
//!
//! This module provides the [`MessageBus`] trait: keyed publish with headers,
//! and handler-driven subscription with at-least-once acknowledgement.
//!
//! # Delivery Contract
//!
//! ```text
//! ┌──────────────┐   InboundMessage    ┌──────────────────┐
//! │  partition   │ ──────────────────► │  MessageHandler  │
//! │   worker     │                     │   (processor)    │
//! └──────┬───────┘ ◄────────────────── └──────────────────┘
//!        │              Ok / Err
//!        ▼
//!   Ok  → commit offset + 1, take next message
//!   Err → back off, hand the SAME message over again
//! ```
//!
//! - **One worker per partition**: messages of a partition are handled strictly
//!   in order; partitions are handled concurrently
//! - **Acknowledge after terminal state**: the offset is committed only after
//!   the handler returns `Ok`
//! - **At-least-once**: a crash before commit redelivers the message, so
//!   handlers must be idempotent
//! - **Graceful stop**: [`Subscription::stop`] lets in-flight messages finish
//!
//! # Implementations
//!
//! - `InMemoryMessageBus` (in `library-events-testing`): one partition per topic
//! - `RedpandaMessageBus` (in `library-events-redpanda`): Kafka-compatible
//!
//! # Example
//!
//! ```rust,ignore
//! use library_events_core::message_bus::MessageBus;
//! use library_events_core::message::OutboundMessage;
//!
//! async fn example(bus: &dyn MessageBus, handler: Arc<dyn MessageHandler>) -> Result<(), BusError> {
//!     bus.publish("library-events", &OutboundMessage::new(payload)).await?;
//!
//!     let subscription = bus
//!         .subscribe("library-events", "library-events-listener-group", handler)
//!         .await?;
//!
//!     // ... later
//!     subscription.stop().await;
//!     Ok(())
//! }
//! ```

use crate::message::{InboundMessage, OutboundMessage};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Errors that can occur during message bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Failed to connect to the message bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a topic
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed to subscribe
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Generic error for other failures
    #[error("Message bus error: {0}")]
    Other(String),
}

/// A handler could not bring a message to a terminal state.
///
/// The bus must not acknowledge the message and will hand it over again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Republishing to the retry or dead-letter topic failed.
    #[error("Failed to route message: {0}")]
    Routing(#[from] BusError),
}

/// Per-message callback invoked by a subscription.
///
/// Returning `Ok` acknowledges the message. Returning `Err` leaves it
/// unacknowledged and the bus will invoke the handler again with the same
/// message after a back-off.
pub trait MessageHandler: Send + Sync {
    /// Handle one message.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] if the message did not reach a terminal state.
    fn handle<'a>(
        &'a self,
        message: &'a InboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;
}

/// Trait for message bus implementations.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn MessageBus>`), which the router and
/// dispatchers rely on.
pub trait MessageBus: Send + Sync {
    /// Publish a message to a topic.
    ///
    /// Key, payload and headers are written unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if the broker does not accept the
    /// message.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + 'a>>;

    /// Subscribe `handler` to `topic` as a member of consumer group `group_id`.
    ///
    /// Messages start flowing as soon as this returns. Dropping the returned
    /// [`Subscription`] stops consumption after the in-flight message without
    /// waiting for it; call [`Subscription::stop`] to wait.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if the consumer cannot be
    /// created or subscribed.
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        group_id: &'a str,
        handler: Arc<dyn MessageHandler>,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, BusError>> + Send + 'a>>;
}

/// Handle to a running subscription.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    group_id: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Wrap a consumer task.
    ///
    /// The task must watch the receiving side of `shutdown` and return once it
    /// flips to `true` and its in-flight messages are done.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        group_id: impl Into<String>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            shutdown,
            task,
        }
    }

    /// Subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer group.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Whether the consumer task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop consuming and wait for in-flight messages to finish.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);

        if let Err(e) = self.task.await {
            tracing::error!(
                topic = %self.topic,
                group_id = %self.group_id,
                error = %e,
                "Consumer task terminated abnormally"
            );
        } else {
            tracing::info!(
                topic = %self.topic,
                group_id = %self.group_id,
                "Subscription stopped"
            );
        }
    }
}
