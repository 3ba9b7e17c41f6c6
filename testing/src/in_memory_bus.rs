//! In-memory message bus.
//!
//! Every topic is a single partition: an append-only log of
//! [`InboundMessage`]s. Each consumer group keeps a committed offset per topic.
//! Subscribing replays the log from the group's committed offset, then
//! receives new publishes as they happen, mirroring a Kafka consumer group
//! with `auto.offset.reset = earliest`.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only happens after a test already panicked

use library_events_core::message::{InboundMessage, OutboundMessage};
use library_events_core::message_bus::{BusError, MessageBus, MessageHandler, Subscription};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// In-memory message bus for fast, deterministic testing.
///
/// # Example
///
/// ```
/// use library_events_core::message::OutboundMessage;
/// use library_events_core::message_bus::MessageBus;
/// use library_events_testing::InMemoryMessageBus;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryMessageBus::new();
/// bus.publish("library-events", &OutboundMessage::new(b"{}".to_vec())).await?;
///
/// let log = bus.published("library-events");
/// assert_eq!(log.len(), 1);
/// assert_eq!(log[0].offset, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryMessageBus {
    state: Arc<Mutex<BusState>>,
    redelivery_backoff: Duration,
}

#[derive(Debug, Default)]
struct BusState {
    logs: HashMap<String, Vec<InboundMessage>>,
    committed: HashMap<(String, String), i64>,
    subscribers: Vec<Subscriber>,
    publish_failures: VecDeque<BusError>,
}

#[derive(Debug)]
struct Subscriber {
    topic: String,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

impl InMemoryMessageBus {
    /// Create an empty bus with a 10ms redelivery back-off.
    #[must_use]
    pub fn new() -> Self {
        Self::with_redelivery_backoff(Duration::from_millis(10))
    }

    /// Create an empty bus with a custom redelivery back-off.
    #[must_use]
    pub fn with_redelivery_backoff(redelivery_backoff: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            redelivery_backoff,
        }
    }

    /// Make the next `times` publishes fail with `error`.
    pub fn fail_next_publish(&self, times: usize, error: BusError) {
        self.state
            .lock()
            .unwrap()
            .publish_failures
            .extend(std::iter::repeat_n(error, times));
    }

    /// Every message published to `topic`, in offset order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<InboundMessage> {
        self.state
            .lock()
            .unwrap()
            .logs
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Next offset `group_id` will consume from `topic`, if it committed any.
    #[must_use]
    pub fn committed_offset(&self, topic: &str, group_id: &str) -> Option<i64> {
        self.state
            .lock()
            .unwrap()
            .committed
            .get(&(topic.to_string(), group_id.to_string()))
            .copied()
    }

    /// Wait until `topic` holds at least `count` messages.
    ///
    /// Returns the log as soon as it is long enough, or whatever it holds
    /// when `timeout` expires.
    pub async fn wait_for_published(
        &self,
        topic: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<InboundMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let log = self.published(topic);
            if log.len() >= count || tokio::time::Instant::now() >= deadline {
                return log;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until `group_id` has committed `offset` on `topic`.
    ///
    /// Returns whether the offset was reached before `timeout`.
    pub async fn wait_for_commit(
        &self,
        topic: &str,
        group_id: &str,
        offset: i64,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self
                .committed_offset(topic, group_id)
                .is_some_and(|committed| committed >= offset)
            {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn commit(&self, topic: &str, group_id: &str, next_offset: i64) {
        let mut state = self.state.lock().unwrap();
        let committed = state
            .committed
            .entry((topic.to_string(), group_id.to_string()))
            .or_insert(0);
        *committed = (*committed).max(next_offset);
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

impl MessageBus for InMemoryMessageBus {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();

            if let Some(error) = state.publish_failures.pop_front() {
                return Err(error);
            }

            let log = state.logs.entry(topic.to_string()).or_default();
            #[allow(clippy::cast_possible_wrap)] // Test logs never reach i64::MAX
            let inbound = InboundMessage {
                topic: topic.to_string(),
                partition: 0,
                offset: log.len() as i64,
                key: message.key.clone(),
                payload: message.payload.clone(),
                headers: message.headers.clone(),
            };
            log.push(inbound.clone());

            state.subscribers.retain(|s| !s.sender.is_closed());
            for subscriber in state.subscribers.iter().filter(|s| s.topic == topic) {
                let _ = subscriber.sender.send(inbound.clone());
            }

            tracing::trace!(topic, offset = inbound.offset, "Message published");
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        group_id: &'a str,
        handler: Arc<dyn MessageHandler>,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, BusError>> + Send + 'a>> {
        Box::pin(async move {
            let (sender, mut receiver) = mpsc::unbounded_channel();

            // Replay and registration happen under one lock so no publish is
            // lost or duplicated in between.
            {
                let mut state = self.state.lock().unwrap();
                let from = state
                    .committed
                    .get(&(topic.to_string(), group_id.to_string()))
                    .copied()
                    .unwrap_or(0);
                if let Some(log) = state.logs.get(topic) {
                    for message in log.iter().filter(|m| m.offset >= from) {
                        let _ = sender.send(message.clone());
                    }
                }
                state.subscribers.push(Subscriber {
                    topic: topic.to_string(),
                    sender,
                });
            }

            let (shutdown_tx, mut shutdown) = watch::channel(false);
            let bus = self.clone();
            let task_topic = topic.to_string();
            let task_group = group_id.to_string();

            let task = tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        next = receiver.recv() => match next {
                            Some(message) => message,
                            None => break,
                        },
                    };

                    loop {
                        match handler.handle(&message).await {
                            Ok(()) => {
                                bus.commit(&task_topic, &task_group, message.offset + 1);
                                break;
                            },
                            Err(e) => {
                                tracing::warn!(
                                    topic = %task_topic,
                                    offset = message.offset,
                                    error = %e,
                                    "Handler failed, message will be redelivered"
                                );
                                if stopping(&shutdown) {
                                    return;
                                }
                                tokio::time::sleep(bus.redelivery_backoff).await;
                            },
                        }
                    }

                    if stopping(&shutdown) {
                        break;
                    }
                }
            });

            tracing::debug!(topic, group_id, "Subscribed to in-memory topic");
            Ok(Subscription::new(topic, group_id, shutdown_tx, task))
        })
    }
}
