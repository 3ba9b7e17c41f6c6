//! Persistence boundary for library events.
//!
//! The [`EventRepository`] trait is the only way the pipeline reaches durable
//! storage. It has two operations:
//!
//! - `upsert`: insert a CREATE (store assigns the id) or apply an UPDATE, event
//!   and nested item in one unit of work
//! - `find_by_id`: read back a persisted event
//!
//! # Failure Kinds
//!
//! Implementations must sort backend failures into [`StoreError`] variants.
//! The processor decides whether to retry from the variant alone:
//!
//! | Variant     | Meaning                                 | Retried |
//! |-------------|-----------------------------------------|---------|
//! | `Transient` | connectivity, timeout, deadlock         | yes     |
//! | `Integrity` | constraint violation                    | no      |
//! | `NotFound`  | UPDATE of an id that was never created  | no      |
//! | `Other`     | anything the backend could not classify | yes     |
//!
//! # Implementations
//!
//! - `PostgresEventRepository` (in `library-events-postgres`): production
//! - `InMemoryEventRepository` (in `library-events-testing`): tests

use crate::event::{Event, PersistedEvent};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during repository operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store is temporarily unavailable (connection, timeout, deadlock).
    #[error("Transient store error: {0}")]
    Transient(String),

    /// A constraint of the store was violated.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// No persisted event has this id.
    #[error("Library event {0} not found")]
    NotFound(i64),

    /// Unclassified backend failure.
    #[error("Store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Whether the failure is known to be temporary.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Repository of persisted library events.
///
/// # Idempotence
///
/// Applying the same UPDATE twice must leave the store in the same state as
/// applying it once, so redelivered messages are harmless.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the repository can be shared as
/// `Arc<dyn EventRepository>` between partition workers.
pub trait EventRepository: Send + Sync {
    /// Insert or update an event and its item atomically.
    ///
    /// - `event.id == None`: insert, assigning a new id
    /// - `event.id == Some(id)`: overwrite the event with that id
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if an update targets an unknown id
    /// - [`StoreError::Transient`], [`StoreError::Integrity`] or
    ///   [`StoreError::Other`] for backend failures; nothing is written
    fn upsert<'a>(
        &'a self,
        event: &'a Event,
    ) -> Pin<Box<dyn Future<Output = Result<PersistedEvent, StoreError>> + Send + 'a>>;

    /// Load a persisted event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn find_by_id(
        &self,
        id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Option<PersistedEvent>, StoreError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_transient() {
        assert!(StoreError::Transient("timeout".into()).is_transient());
        assert!(!StoreError::Integrity("unique".into()).is_transient());
        assert!(!StoreError::NotFound(1).is_transient());
        assert!(!StoreError::Other("?".into()).is_transient());
    }
}
