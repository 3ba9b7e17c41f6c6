//! Library event domain model.
//!
//! An [`Event`] is the transient, per-message view of a catalog change. A
//! [`PersistedEvent`] is its durable counterpart and the only entity with an
//! identity that spans messages.
//!
//! # Id Invariant
//!
//! | Type     | `id`    |
//! |----------|---------|
//! | `Create` | absent  |
//! | `Update` | present |
//!
//! Breaking the invariant is a permanent failure: the same bytes will fail the
//! same way on every redelivery, so such events are dead-lettered rather than
//! retried.
//!
//! # Example
//!
//! ```
//! use library_events_core::event::{Event, Item, ValidationError};
//!
//! let item = Item::new(123, "Kafka Using Spring Boot", "Dilip");
//!
//! assert!(Event::create(item.clone()).validate().is_ok());
//! assert_eq!(
//!     Event { id: None, ..Event::update(1, item) }.validate(),
//!     Err(ValidationError::MissingId),
//! );
//! ```

use std::fmt;
use thiserror::Error;

/// Kind of catalog change carried by an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// A new catalog entry. The store assigns the identity.
    Create,
    /// A change to an existing catalog entry identified by `Event::id`.
    Update,
}

impl EventType {
    /// Wire and database representation.
    ///
    /// `Create` is written as `"NEW"`, the name used by the producer.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "NEW",
            Self::Update => "UPDATE",
        }
    }

    /// Parse the wire/database representation.
    ///
    /// Accepts `"CREATE"` as an alias of `"NEW"`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" | "CREATE" => Some(Self::Create),
            "UPDATE" => Some(Self::Update),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The catalog record nested in every event. Owned by its parent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Catalog identifier of the item
    pub item_id: i64,
    /// Display name
    pub name: String,
    /// Author
    pub author: String,
}

impl Item {
    /// Create a new item.
    #[must_use]
    pub fn new(item_id: i64, name: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            item_id,
            name: name.into(),
            author: author.into(),
        }
    }
}

/// A decoded library event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Identity of the persisted event (absent for creates)
    pub id: Option<i64>,
    /// Kind of change
    pub event_type: EventType,
    /// Nested catalog record
    pub item: Item,
}

impl Event {
    /// Build a `Create` event. The store assigns the id on insert.
    #[must_use]
    pub const fn create(item: Item) -> Self {
        Self {
            id: None,
            event_type: EventType::Create,
            item,
        }
    }

    /// Build an `Update` event for an existing persisted event.
    #[must_use]
    pub const fn update(id: i64, item: Item) -> Self {
        Self {
            id: Some(id),
            event_type: EventType::Update,
            item,
        }
    }

    /// Check the CREATE/UPDATE id invariant.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::UnexpectedId`] for a `Create` carrying an id
    /// - [`ValidationError::MissingId`] for an `Update` without one
    pub const fn validate(&self) -> Result<(), ValidationError> {
        match (self.event_type, self.id) {
            (EventType::Create, None) | (EventType::Update, Some(_)) => Ok(()),
            (EventType::Create, Some(id)) => Err(ValidationError::UnexpectedId(id)),
            (EventType::Update, None) => Err(ValidationError::MissingId),
        }
    }

    /// Message key used on the bus: the id as text, absent for creates.
    #[must_use]
    pub fn key(&self) -> Option<String> {
        self.id.map(|id| id.to_string())
    }
}

/// Durable counterpart of an [`Event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedEvent {
    /// Store-assigned identity
    pub id: i64,
    /// Type of the last applied event
    pub event_type: EventType,
    /// Current state of the nested record
    pub item: Item,
}

impl PersistedEvent {
    /// Durable state after applying `event` under identity `id`.
    #[must_use]
    pub fn from_event(id: i64, event: &Event) -> Self {
        Self {
            id,
            event_type: event.event_type,
            item: event.item.clone(),
        }
    }
}

/// A schema-valid event that is logically invalid.
///
/// Every variant is permanent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// `Update` without an id.
    #[error("Library event id is missing for an UPDATE event")]
    MissingId,

    /// `Create` carrying an id.
    #[error("Library event id {0} must be absent for a NEW event")]
    UnexpectedId(i64),

    /// `Update` targeting an id that was never persisted.
    #[error("Not a valid library event: no event with id {0}")]
    UnknownEvent(i64),
}
