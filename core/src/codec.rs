//! JSON wire format of library events.
//!
//! ```json
//! {
//!   "libraryEventId": null,
//!   "libraryEventType": "NEW",
//!   "book": { "bookId": 123, "bookName": "Kafka Using Spring Boot", "bookAuthor": "Dilip" }
//! }
//! ```
//!
//! Decoding is pure and checks the schema only. The CREATE/UPDATE id invariant
//! is a separate step ([`Event::validate`]) so that malformed and logically
//! invalid payloads can be told apart in dead-letter headers.

use crate::event::{Event, EventType, Item};
use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use thiserror::Error;

/// The payload does not match the library event schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Zero-length payload.
    #[error("Empty payload")]
    Empty,

    /// Not JSON, or truncated JSON.
    #[error("Malformed JSON payload: {0}")]
    Syntax(String),

    /// Valid JSON with missing required fields or wrong types.
    #[error("Payload does not match the library event schema: {0}")]
    Schema(String),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    library_event_id: Option<i64>,
    library_event_type: WireEventType,
    book: WireBook,
}

#[derive(Serialize, Deserialize, Clone, Copy)]
enum WireEventType {
    #[serde(rename = "NEW", alias = "CREATE")]
    New,
    #[serde(rename = "UPDATE")]
    Update,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBook {
    book_id: i64,
    book_name: String,
    book_author: String,
}

impl From<WireEvent> for Event {
    fn from(wire: WireEvent) -> Self {
        Self {
            id: wire.library_event_id,
            event_type: match wire.library_event_type {
                WireEventType::New => EventType::Create,
                WireEventType::Update => EventType::Update,
            },
            item: Item {
                item_id: wire.book.book_id,
                name: wire.book.book_name,
                author: wire.book.book_author,
            },
        }
    }
}

impl From<&Event> for WireEvent {
    fn from(event: &Event) -> Self {
        Self {
            library_event_id: event.id,
            library_event_type: match event.event_type {
                EventType::Create => WireEventType::New,
                EventType::Update => WireEventType::Update,
            },
            book: WireBook {
                book_id: event.item.item_id,
                book_name: event.item.name.clone(),
                book_author: event.item.author.clone(),
            },
        }
    }
}

/// Decode a wire payload into an [`Event`].
///
/// Unknown fields are ignored; a missing or `null` `libraryEventId` decodes as
/// an absent id.
///
/// # Errors
///
/// Returns [`DecodeError`] if the payload is empty, not JSON, or does not match
/// the schema.
pub fn decode(bytes: &[u8]) -> Result<Event, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    serde_json::from_slice::<WireEvent>(bytes)
        .map(Event::from)
        .map_err(|e| match e.classify() {
            Category::Data => DecodeError::Schema(e.to_string()),
            Category::Syntax | Category::Eof | Category::Io => DecodeError::Syntax(e.to_string()),
        })
}

/// Encode an [`Event`] into its wire payload.
///
/// # Errors
///
/// Returns the underlying `serde_json` error if serialization fails.
pub fn encode(event: &Event) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&WireEvent::from(event))
}
