//! Processor and router behaviour over in-memory doubles.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use library_events_core::codec;
use library_events_core::event::{Event, EventType, Item, PersistedEvent};
use library_events_core::message::{
    ERROR_CLASS_HEADER, ERROR_MESSAGE_HEADER, Headers, InboundMessage, RETRY_COUNT_HEADER,
};
use library_events_core::message_bus::{BusError, HandlerError};
use library_events_core::repository::StoreError;
use library_events_runtime::retry::RetryPolicy;
use library_events_runtime::{ErrorRouter, EventProcessor, ProcessingOutcome, RouterConfig};
use library_events_testing::{InMemoryEventRepository, InMemoryMessageBus, init_test_tracing};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const MAIN: &str = "library-events";
const RETRY: &str = "library-events.RETRY";
const DLT: &str = "library-events.DLT";

const NEW_BOOK: &str = r#"{"libraryEventId":null,"libraryEventType":"NEW","book":{"bookId":123,"bookName":"Kafka Using Spring Boot","bookAuthor":"Dilip"}}"#;
const UPDATE_WITHOUT_ID: &str = r#"{"libraryEventId":null,"libraryEventType":"UPDATE","book":{"bookId":123,"bookName":"Kafka Using Spring Boot","bookAuthor":"Dilip"}}"#;

struct Fixture {
    repository: InMemoryEventRepository,
    bus: InMemoryMessageBus,
    processor: EventProcessor,
}

fn fixture(persist_policy: RetryPolicy) -> Fixture {
    init_test_tracing();
    let repository = InMemoryEventRepository::new();
    let bus = InMemoryMessageBus::new();
    let router = ErrorRouter::new(Arc::new(bus.clone()), RouterConfig::default());
    let processor = EventProcessor::new(Arc::new(repository.clone()), router)
        .with_persist_policy(persist_policy);
    Fixture {
        repository,
        bus,
        processor,
    }
}

fn inbound(payload: &[u8], headers: Headers) -> InboundMessage {
    InboundMessage {
        topic: MAIN.to_string(),
        partition: 0,
        offset: 0,
        key: None,
        payload: payload.to_vec(),
        headers,
    }
}

fn transient() -> StoreError {
    StoreError::Transient("connection refused".to_string())
}

#[tokio::test]
async fn new_event_is_persisted_with_generated_id() {
    let f = fixture(RetryPolicy::none());

    let outcome = f
        .processor
        .process(&inbound(NEW_BOOK.as_bytes(), Headers::new()))
        .await
        .unwrap();

    let ProcessingOutcome::Persisted(persisted) = outcome else {
        panic!("expected persisted, got {outcome:?}");
    };
    assert!(persisted.id > 0);
    assert_eq!(persisted.event_type, EventType::Create);
    assert_eq!(persisted.item.item_id, 123);
    assert_eq!(persisted.item.name, "Kafka Using Spring Boot");
    assert_eq!(f.repository.len(), 1);
    assert!(f.bus.published(RETRY).is_empty());
    assert!(f.bus.published(DLT).is_empty());
}

#[tokio::test]
async fn update_without_id_is_dead_lettered_without_persisting() {
    let f = fixture(RetryPolicy::none());

    let outcome = f
        .processor
        .process(&inbound(UPDATE_WITHOUT_ID.as_bytes(), Headers::new()))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ProcessingOutcome::DeadLettered {
            retry_count: 0,
            error_class: "ValidationError"
        }
    );
    assert_eq!(f.repository.upsert_calls(), 0);
    assert!(f.bus.published(RETRY).is_empty());

    let dead = f.bus.published(DLT);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload, UPDATE_WITHOUT_ID.as_bytes());
    assert_eq!(dead[0].headers.get(ERROR_CLASS_HEADER), Some("ValidationError"));
    assert!(dead[0].headers.get(ERROR_MESSAGE_HEADER).is_some());
}

#[tokio::test]
async fn transient_failures_walk_the_retry_chain_then_dead_letter() {
    let f = fixture(RetryPolicy::none());
    f.repository.fail_next(4, transient());

    let mut message = inbound(NEW_BOOK.as_bytes(), Headers::new());
    for expected in 1..=3 {
        let outcome = f.processor.process(&message).await.unwrap();
        assert_eq!(outcome, ProcessingOutcome::Requeued { retry_count: expected });

        let retried = f.bus.published(RETRY);
        message = retried.last().cloned().unwrap();
        assert_eq!(message.retry_count(), expected);
        assert_eq!(message.payload, NEW_BOOK.as_bytes());
    }

    let outcome = f.processor.process(&message).await.unwrap();
    assert_eq!(
        outcome,
        ProcessingOutcome::DeadLettered {
            retry_count: 3,
            error_class: "TransientStoreError"
        }
    );

    assert_eq!(f.bus.published(RETRY).len(), 3);
    let dead = f.bus.published(DLT);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].headers.get(RETRY_COUNT_HEADER), Some("3"));
    assert!(f.repository.is_empty());
}

#[tokio::test]
async fn retry_topic_message_that_succeeds_is_persisted() {
    let f = fixture(RetryPolicy::none());

    let mut message = inbound(NEW_BOOK.as_bytes(), Headers::new().with(RETRY_COUNT_HEADER, "2"));
    message.topic = RETRY.to_string();

    let outcome = f.processor.process(&message).await.unwrap();

    assert!(matches!(outcome, ProcessingOutcome::Persisted(_)));
    assert!(f.bus.published(DLT).is_empty());
}

#[tokio::test]
async fn replayed_update_leaves_the_same_state() {
    let f = fixture(RetryPolicy::none());
    f.repository.seed(PersistedEvent {
        id: 7,
        event_type: EventType::Create,
        item: Item::new(123, "Kafka Using Spring Boot", "Dilip"),
    });

    let update = Event::update(7, Item::new(123, "Kafka Using Spring Boot 2.x", "Dilip"));
    let message = inbound(&codec::encode(&update).unwrap(), Headers::new());

    f.processor.process(&message).await.unwrap();
    let after_first = f.repository.all();
    f.processor.process(&message).await.unwrap();
    let after_second = f.repository.all();

    assert_eq!(after_first, after_second);
    assert_eq!(after_second.len(), 1);
    assert_eq!(after_second[0].item.name, "Kafka Using Spring Boot 2.x");
}

#[tokio::test]
async fn update_of_unknown_event_is_dead_lettered() {
    let f = fixture(RetryPolicy::none());

    let update = Event::update(404, Item::new(1, "Ghost", "Nobody"));
    let outcome = f
        .processor
        .process(&inbound(&codec::encode(&update).unwrap(), Headers::new()))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ProcessingOutcome::DeadLettered {
            retry_count: 0,
            error_class: "ValidationError"
        }
    );
    assert!(f.bus.published(RETRY).is_empty());
}

#[tokio::test]
async fn malformed_payload_is_dead_lettered() {
    let f = fixture(RetryPolicy::none());

    let payloads: [&[u8]; 3] = [b"", b"not json", br#"{"libraryEventType":"NEW"}"#];
    for payload in payloads {
        let outcome = f.processor.process(&inbound(payload, Headers::new())).await.unwrap();
        assert!(
            matches!(
                outcome,
                ProcessingOutcome::DeadLettered {
                    error_class: "DecodeError",
                    ..
                }
            ),
            "{outcome:?}"
        );
    }

    assert_eq!(f.bus.published(DLT).len(), 3);
    assert_eq!(f.repository.upsert_calls(), 0);
}

#[tokio::test]
async fn integrity_violation_is_dead_lettered_immediately() {
    let f = fixture(
        RetryPolicy::builder()
            .max_retries(2)
            .initial_delay(Duration::from_millis(1))
            .build(),
    );
    f.repository
        .fail_next(1, StoreError::Integrity("duplicate key".to_string()));

    let outcome = f
        .processor
        .process(&inbound(NEW_BOOK.as_bytes(), Headers::new()))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ProcessingOutcome::DeadLettered {
            retry_count: 0,
            error_class: "IntegrityError"
        }
    );
    assert_eq!(f.repository.upsert_calls(), 1, "integrity errors are not retried in-process");
    assert!(f.bus.published(RETRY).is_empty());
}

#[tokio::test]
async fn unclassified_store_failure_is_requeued() {
    let f = fixture(RetryPolicy::none());
    f.repository
        .fail_next(1, StoreError::Other("driver panicked".to_string()));

    let outcome = f
        .processor
        .process(&inbound(NEW_BOOK.as_bytes(), Headers::new()))
        .await
        .unwrap();

    assert_eq!(outcome, ProcessingOutcome::Requeued { retry_count: 1 });
    assert_eq!(f.repository.upsert_calls(), 1);
}

#[tokio::test]
async fn short_outage_is_absorbed_in_process() {
    let f = fixture(
        RetryPolicy::builder()
            .max_retries(2)
            .initial_delay(Duration::from_millis(1))
            .build(),
    );
    f.repository.fail_next(2, transient());

    let outcome = f
        .processor
        .process(&inbound(NEW_BOOK.as_bytes(), Headers::new()))
        .await
        .unwrap();

    assert!(matches!(outcome, ProcessingOutcome::Persisted(_)));
    assert_eq!(f.repository.upsert_calls(), 3);
    assert!(f.bus.published(RETRY).is_empty());
}

#[tokio::test]
async fn longer_outage_falls_through_to_the_retry_topic() {
    let f = fixture(
        RetryPolicy::builder()
            .max_retries(2)
            .initial_delay(Duration::from_millis(1))
            .build(),
    );
    f.repository.fail_next(3, transient());

    let outcome = f
        .processor
        .process(&inbound(NEW_BOOK.as_bytes(), Headers::new()))
        .await
        .unwrap();

    assert_eq!(outcome, ProcessingOutcome::Requeued { retry_count: 1 });
    assert_eq!(f.repository.upsert_calls(), 3);
}

#[tokio::test]
async fn failed_route_is_returned_to_the_bus() {
    let f = fixture(RetryPolicy::none());
    f.bus
        .fail_next_publish(1, BusError::TransportError("broker down".to_string()));

    let result = f
        .processor
        .process(&inbound(UPDATE_WITHOUT_ID.as_bytes(), Headers::new()))
        .await;

    assert_eq!(
        result,
        Err(HandlerError::Routing(BusError::TransportError("broker down".to_string())))
    );
    assert!(f.bus.published(DLT).is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn update_without_id_never_reaches_the_repository(
        retry_count in 0u32..10,
        book_id in any::<i64>(),
        name in "[a-zA-Z ]{1,20}",
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let f = fixture(RetryPolicy::none());
        let event = Event { id: None, ..Event::update(1, Item::new(book_id, name, "Author")) };
        let message = inbound(
            &codec::encode(&event).unwrap(),
            Headers::new().with(RETRY_COUNT_HEADER, retry_count.to_string()),
        );

        let outcome = runtime.block_on(f.processor.process(&message)).unwrap();

        let is_dead_lettered = matches!(outcome, ProcessingOutcome::DeadLettered { .. });
        prop_assert!(is_dead_lettered);
        prop_assert_eq!(f.repository.upsert_calls(), 0);
        prop_assert!(f.bus.published(RETRY).is_empty());
    }

    #[test]
    fn create_without_id_persists_exactly_one_matching_event(
        book_id in any::<i64>(),
        name in "\\PC{1,40}",
        author in "\\PC{1,40}",
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let f = fixture(RetryPolicy::none());
        let item = Item::new(book_id, name, author);
        let message = inbound(&codec::encode(&Event::create(item.clone())).unwrap(), Headers::new());

        let outcome = runtime.block_on(f.processor.process(&message)).unwrap();

        let stored = f.repository.all();
        prop_assert_eq!(stored.len(), 1);
        prop_assert_eq!(&stored[0].item, &item);
        prop_assert_eq!(stored[0].event_type, EventType::Create);
        prop_assert_eq!(outcome, ProcessingOutcome::Persisted(stored[0].clone()));
        prop_assert!(f.bus.published(DLT).is_empty());
    }
}
