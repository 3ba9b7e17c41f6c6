//! In-memory event repository with failure injection.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only happens after a test already panicked

use library_events_core::event::{Event, PersistedEvent};
use library_events_core::repository::{EventRepository, StoreError};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// In-memory repository for fast, deterministic testing.
///
/// Ids are assigned sequentially from 1. Failures queued with
/// [`fail_next`](Self::fail_next) are returned by the next `upsert` calls, in
/// order, before any write happens.
///
/// # Example
///
/// ```
/// use library_events_core::event::{Event, Item};
/// use library_events_core::repository::{EventRepository, StoreError};
/// use library_events_testing::InMemoryEventRepository;
///
/// # async fn example() {
/// let repository = InMemoryEventRepository::new();
/// repository.fail_next(1, StoreError::Transient("connection reset".to_string()));
///
/// let event = Event::create(Item::new(123, "Kafka Using Spring Boot", "Dilip"));
/// assert!(repository.upsert(&event).await.is_err());
/// assert_eq!(repository.upsert(&event).await.unwrap().id, 1);
/// assert_eq!(repository.upsert_calls(), 2);
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventRepository {
    state: Arc<Mutex<RepositoryState>>,
}

#[derive(Debug, Default)]
struct RepositoryState {
    events: BTreeMap<i64, PersistedEvent>,
    last_id: i64,
    failures: VecDeque<StoreError>,
    upsert_calls: usize,
}

impl InMemoryEventRepository {
    /// Create a new empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` upserts fail with `error`.
    pub fn fail_next(&self, times: usize, error: StoreError) {
        let mut state = self.state.lock().unwrap();
        state
            .failures
            .extend(std::iter::repeat_n(error, times));
    }

    /// Store a persisted event directly, bypassing `upsert`.
    pub fn seed(&self, event: PersistedEvent) {
        let mut state = self.state.lock().unwrap();
        state.last_id = state.last_id.max(event.id);
        state.events.insert(event.id, event);
    }

    /// Number of `upsert` calls, failed ones included.
    #[must_use]
    pub fn upsert_calls(&self) -> usize {
        self.state.lock().unwrap().upsert_calls
    }

    /// Snapshot of a stored event.
    #[must_use]
    pub fn get(&self, id: i64) -> Option<PersistedEvent> {
        self.state.lock().unwrap().events.get(&id).cloned()
    }

    /// All stored events in id order.
    #[must_use]
    pub fn all(&self) -> Vec<PersistedEvent> {
        self.state.lock().unwrap().events.values().cloned().collect()
    }

    /// Number of stored events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().events.len()
    }

    /// Whether no events are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().events.is_empty()
    }
}

impl EventRepository for InMemoryEventRepository {
    fn upsert<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<PersistedEvent, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.upsert_calls += 1;

            if let Some(error) = state.failures.pop_front() {
                return Err(error);
            }

            let id = match event.id {
                Some(id) if state.events.contains_key(&id) => id,
                Some(id) => return Err(StoreError::NotFound(id)),
                None => {
                    state.last_id += 1;
                    state.last_id
                },
            };

            let persisted = PersistedEvent::from_event(id, event);
            state.events.insert(id, persisted.clone());
            Ok(persisted)
        })
    }

    fn find_by_id(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Option<PersistedEvent>, StoreError>> + Send + '_>> {
        Box::pin(async move { Ok(self.get(id)) })
    }
}
