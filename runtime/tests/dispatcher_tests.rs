//! Ingest and retry dispatchers driving the processor over the in-memory bus.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use library_events_core::message::{InboundMessage, OutboundMessage, RETRY_COUNT_HEADER};
use library_events_core::message_bus::{BusError, HandlerError, MessageBus, MessageHandler};
use library_events_core::repository::StoreError;
use library_events_runtime::retry::RetryPolicy;
use library_events_runtime::{
    DispatcherConfig, ErrorRouter, EventProcessor, IngestDispatcher, RetryDispatcher, RouterConfig,
};
use library_events_testing::{InMemoryEventRepository, InMemoryMessageBus, init_test_tracing};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MAIN: &str = "library-events";
const RETRY: &str = "library-events.RETRY";
const DLT: &str = "library-events.DLT";
const MAIN_GROUP: &str = "library-events-listener-group";
const RETRY_GROUP: &str = "retry-listener-group";
const WAIT: Duration = Duration::from_secs(5);

const NEW_BOOK: &str = r#"{"libraryEventId":null,"libraryEventType":"NEW","book":{"bookId":123,"bookName":"Kafka Using Spring Boot","bookAuthor":"Dilip"}}"#;
const UPDATE_WITHOUT_ID: &str = r#"{"libraryEventId":null,"libraryEventType":"UPDATE","book":{"bookId":123,"bookName":"Kafka Using Spring Boot","bookAuthor":"Dilip"}}"#;

struct Service {
    repository: InMemoryEventRepository,
    bus: InMemoryMessageBus,
    ingest: IngestDispatcher,
    retry: RetryDispatcher,
}

fn service(retry_autostart: bool) -> Service {
    init_test_tracing();
    let repository = InMemoryEventRepository::new();
    let bus = InMemoryMessageBus::new();
    let shared_bus: Arc<dyn MessageBus> = Arc::new(bus.clone());

    let router = ErrorRouter::new(Arc::clone(&shared_bus), RouterConfig::default());
    let processor: Arc<dyn MessageHandler> = Arc::new(
        EventProcessor::new(Arc::new(repository.clone()), router)
            .with_persist_policy(RetryPolicy::none()),
    );

    let ingest = IngestDispatcher::new(
        Arc::clone(&shared_bus),
        Arc::clone(&processor),
        DispatcherConfig::new(MAIN, MAIN_GROUP),
    );
    let retry = RetryDispatcher::new(
        shared_bus,
        processor,
        DispatcherConfig::new(RETRY, RETRY_GROUP),
        retry_autostart,
    );

    Service {
        repository,
        bus,
        ingest,
        retry,
    }
}

/// Takes `delay` before handing each message to the processor.
struct SlowProcessor {
    inner: EventProcessor,
    delay: Duration,
    started: AtomicUsize,
}

impl MessageHandler for SlowProcessor {
    fn handle<'a>(
        &'a self,
        message: &'a InboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.inner.handle(message).await
        })
    }
}

async fn publish(bus: &InMemoryMessageBus, payload: &str) {
    bus.publish(MAIN, &OutboundMessage::new(payload.as_bytes().to_vec()))
        .await
        .unwrap();
}

#[tokio::test]
async fn ingest_persists_and_commits_each_message() {
    let s = service(false);
    s.ingest.start().await.unwrap();

    publish(&s.bus, NEW_BOOK).await;
    publish(&s.bus, NEW_BOOK).await;

    assert!(s.bus.wait_for_commit(MAIN, MAIN_GROUP, 2, WAIT).await);
    assert_eq!(s.repository.len(), 2);

    s.ingest.stop().await;
}

#[tokio::test]
async fn invalid_event_is_dead_lettered_and_committed() {
    let s = service(false);
    s.ingest.start().await.unwrap();

    publish(&s.bus, UPDATE_WITHOUT_ID).await;

    assert!(s.bus.wait_for_commit(MAIN, MAIN_GROUP, 1, WAIT).await);
    assert_eq!(s.bus.published(DLT).len(), 1);
    assert!(s.bus.published(RETRY).is_empty());
    assert_eq!(s.repository.upsert_calls(), 0);

    s.ingest.stop().await;
}

#[tokio::test]
async fn retry_dispatcher_does_not_autostart_by_default() {
    let s = service(false);
    s.repository.fail_next(1, StoreError::Transient("timeout".to_string()));

    s.ingest.start().await.unwrap();
    assert!(!s.retry.start_if_enabled().await.unwrap());
    assert!(!s.retry.is_running().await);

    publish(&s.bus, NEW_BOOK).await;
    assert_eq!(s.bus.wait_for_published(RETRY, 1, WAIT).await.len(), 1);
    assert!(s.bus.wait_for_commit(MAIN, MAIN_GROUP, 1, WAIT).await);

    // Nothing consumes the retry topic yet
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(s.repository.is_empty());
    assert_eq!(s.bus.committed_offset(RETRY, RETRY_GROUP), None);

    // Turning retry processing on picks up the backlog
    s.retry.start().await.unwrap();
    assert!(s.retry.is_running().await);
    assert!(s.bus.wait_for_commit(RETRY, RETRY_GROUP, 1, WAIT).await);
    assert_eq!(s.repository.len(), 1);

    s.retry.stop().await;
    s.ingest.stop().await;
}

#[tokio::test]
async fn persistent_transient_failure_ends_in_dead_letter_after_max_retries() {
    let s = service(true);
    s.repository.fail_next(4, StoreError::Transient("database unavailable".to_string()));

    s.ingest.start().await.unwrap();
    assert!(s.retry.start_if_enabled().await.unwrap());

    publish(&s.bus, NEW_BOOK).await;

    let dead = s.bus.wait_for_published(DLT, 1, WAIT).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].headers.get(RETRY_COUNT_HEADER), Some("3"));

    assert!(s.bus.wait_for_commit(RETRY, RETRY_GROUP, 3, WAIT).await);
    let retried = s.bus.published(RETRY);
    let counts: Vec<_> = retried.iter().map(|m| m.retry_count()).collect();
    assert_eq!(counts, vec![1, 2, 3]);
    assert!(s.repository.is_empty());

    s.retry.stop().await;
    s.ingest.stop().await;
}

#[tokio::test]
async fn failed_route_is_redelivered_before_commit() {
    let s = service(false);
    publish(&s.bus, UPDATE_WITHOUT_ID).await;
    s.bus
        .fail_next_publish(1, BusError::TransportError("broker down".to_string()));

    s.ingest.start().await.unwrap();

    assert!(s.bus.wait_for_commit(MAIN, MAIN_GROUP, 1, WAIT).await);
    assert_eq!(s.bus.published(DLT).len(), 1);

    s.ingest.stop().await;
}

#[tokio::test]
async fn start_is_idempotent_and_stop_halts_consumption() {
    let s = service(false);

    s.ingest.start().await.unwrap();
    s.ingest.start().await.unwrap();
    assert!(s.ingest.is_running().await);

    publish(&s.bus, NEW_BOOK).await;
    assert!(s.bus.wait_for_commit(MAIN, MAIN_GROUP, 1, WAIT).await);
    assert_eq!(s.repository.len(), 1, "a second start must not add a second consumer");

    s.ingest.stop().await;
    assert!(!s.ingest.is_running().await);

    publish(&s.bus, NEW_BOOK).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(s.repository.len(), 1);
    assert_eq!(s.bus.committed_offset(MAIN, MAIN_GROUP), Some(1));

    // Restarting resumes from the committed offset
    s.ingest.start().await.unwrap();
    assert!(s.bus.wait_for_commit(MAIN, MAIN_GROUP, 2, WAIT).await);
    assert_eq!(s.repository.len(), 2);

    s.ingest.stop().await;
}

#[tokio::test]
async fn stop_completes_the_in_flight_message_only() {
    init_test_tracing();
    let repository = InMemoryEventRepository::new();
    let bus = InMemoryMessageBus::new();
    let shared_bus: Arc<dyn MessageBus> = Arc::new(bus.clone());

    let router = ErrorRouter::new(Arc::clone(&shared_bus), RouterConfig::default());
    let slow = Arc::new(SlowProcessor {
        inner: EventProcessor::new(Arc::new(repository.clone()), router)
            .with_persist_policy(RetryPolicy::none()),
        delay: Duration::from_millis(300),
        started: AtomicUsize::new(0),
    });
    let handler: Arc<dyn MessageHandler> = slow.clone();
    let ingest = IngestDispatcher::new(
        shared_bus,
        handler,
        DispatcherConfig::new(MAIN, MAIN_GROUP),
    );

    for _ in 0..3 {
        publish(&bus, NEW_BOOK).await;
    }
    ingest.start().await.unwrap();
    while slow.started.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    ingest.stop().await;

    assert_eq!(slow.started.load(Ordering::SeqCst), 1);
    assert_eq!(repository.len(), 1, "the in-flight message is persisted");
    assert_eq!(bus.committed_offset(MAIN, MAIN_GROUP), Some(1));
    assert!(!ingest.is_running().await);
}
