//! # Library Events Core
//!
//! Core types and traits for the library events consumer.
//!
//! This crate holds everything the processing pipeline shares and nothing that
//! talks to a real backend:
//!
//! - [`event`]: the domain model (`Event`, `Item`, `PersistedEvent`) and the
//!   CREATE/UPDATE id invariant
//! - [`codec`]: the JSON wire format of library events
//! - [`message`]: owned bus messages and their headers
//! - [`message_bus`]: the publish/subscribe abstraction and the handler trait
//! - [`repository`]: the persistence boundary
//!
//! Backends live in sibling crates (`library-events-postgres`,
//! `library-events-redpanda`) and in-memory doubles in `library-events-testing`.
//!
//! ## Message Flow
//!
//! ```text
//! message bus ──► Dispatcher ──► EventProcessor ──┬──► EventRepository (success)
//!                                                 └──► ErrorRouter ──► retry / dead-letter topic
//! ```

pub mod codec;
pub mod event;
pub mod message;
pub mod message_bus;
pub mod repository;

pub use codec::{DecodeError, decode, encode};
pub use event::{Event, EventType, Item, PersistedEvent, ValidationError};
pub use message::{Headers, InboundMessage, OutboundMessage};
pub use message_bus::{BusError, HandlerError, MessageBus, MessageHandler, Subscription};
pub use repository::{EventRepository, StoreError};
