//! Subscriptions of the event processor to the ingest and retry topics.

use library_events_core::message_bus::{BusError, MessageBus, MessageHandler, Subscription};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Topic and consumer group of one dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Topic to consume
    pub topic: String,
    /// Consumer group to join
    pub group_id: String,
}

impl DispatcherConfig {
    /// Create a dispatcher configuration.
    #[must_use]
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
        }
    }
}

/// A handler bound to one topic, startable and stoppable at runtime.
struct Dispatcher {
    name: &'static str,
    bus: Arc<dyn MessageBus>,
    handler: Arc<dyn MessageHandler>,
    config: DispatcherConfig,
    subscription: Mutex<Option<Subscription>>,
}

impl Dispatcher {
    fn new(
        name: &'static str,
        bus: Arc<dyn MessageBus>,
        handler: Arc<dyn MessageHandler>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            name,
            bus,
            handler,
            config,
            subscription: Mutex::new(None),
        }
    }

    async fn start(&self) -> Result<(), BusError> {
        let mut subscription = self.subscription.lock().await;
        if subscription.as_ref().is_some_and(|s| !s.is_finished()) {
            tracing::debug!(dispatcher = self.name, "Dispatcher already running");
            return Ok(());
        }

        let started = self
            .bus
            .subscribe(&self.config.topic, &self.config.group_id, Arc::clone(&self.handler))
            .await?;
        *subscription = Some(started);

        tracing::info!(
            dispatcher = self.name,
            topic = %self.config.topic,
            group_id = %self.config.group_id,
            "Dispatcher started"
        );
        Ok(())
    }

    async fn stop(&self) {
        let Some(subscription) = self.subscription.lock().await.take() else {
            return;
        };

        subscription.stop().await;
        tracing::info!(
            dispatcher = self.name,
            topic = %self.config.topic,
            "Dispatcher stopped"
        );
    }

    async fn is_running(&self) -> bool {
        self.subscription
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.is_finished())
    }
}

/// Consumes the main library events topic.
pub struct IngestDispatcher {
    inner: Dispatcher,
}

impl IngestDispatcher {
    /// Bind `handler` to the main topic.
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        handler: Arc<dyn MessageHandler>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            inner: Dispatcher::new("ingest", bus, handler, config),
        }
    }

    /// Subscribe to the main topic. Does nothing if already running.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if the subscription fails.
    pub async fn start(&self) -> Result<(), BusError> {
        self.inner.start().await
    }

    /// Stop consuming after in-flight messages finish.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Whether the subscription is active.
    pub async fn is_running(&self) -> bool {
        self.inner.is_running().await
    }
}

/// Consumes the retry topic.
///
/// Retry processing can be paused and resumed without touching ingestion.
/// Whether it starts with the service is decided by the autostart flag.
pub struct RetryDispatcher {
    inner: Dispatcher,
    autostart: bool,
}

impl RetryDispatcher {
    /// Bind `handler` to the retry topic.
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        handler: Arc<dyn MessageHandler>,
        config: DispatcherConfig,
        autostart: bool,
    ) -> Self {
        Self {
            inner: Dispatcher::new("retry", bus, handler, config),
            autostart,
        }
    }

    /// Whether [`start_if_enabled`](Self::start_if_enabled) starts the dispatcher.
    #[must_use]
    pub const fn autostart(&self) -> bool {
        self.autostart
    }

    /// Subscribe to the retry topic. Does nothing if already running.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if the subscription fails.
    pub async fn start(&self) -> Result<(), BusError> {
        self.inner.start().await
    }

    /// Start only when autostart is enabled. Returns whether it is running.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if the subscription fails.
    pub async fn start_if_enabled(&self) -> Result<bool, BusError> {
        if !self.autostart {
            tracing::info!(
                topic = %self.inner.config.topic,
                "Retry dispatcher autostart disabled"
            );
            return Ok(false);
        }
        self.start().await?;
        Ok(true)
    }

    /// Pause retry processing after in-flight messages finish.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Whether the subscription is active.
    pub async fn is_running(&self) -> bool {
        self.inner.is_running().await
    }
}
