//! # Library Events Testing
//!
//! In-memory test doubles for the library events consumer.
//!
//! This crate provides:
//! - [`InMemoryEventRepository`]: `HashMap`-style event storage with scripted failures
//! - [`InMemoryMessageBus`]: single-partition topics that record every publish
//!   and deliver to subscribers with the same acknowledgement rules as the
//!   production bus
//! - [`init_test_tracing`]: opt-in log output for tests
//!
//! ## Example
//!
//! ```ignore
//! use library_events_testing::{InMemoryEventRepository, InMemoryMessageBus};
//!
//! #[tokio::test]
//! async fn test_dead_letter() {
//!     let repository = Arc::new(InMemoryEventRepository::new());
//!     let bus = Arc::new(InMemoryMessageBus::new());
//!
//!     // ... run the processor
//!
//!     assert_eq!(bus.published("library-events.DLT").len(), 1);
//!     assert_eq!(repository.upsert_calls(), 0);
//! }
//! ```

mod in_memory_bus;
mod in_memory_repository;

pub use in_memory_bus::InMemoryMessageBus;
pub use in_memory_repository::InMemoryEventRepository;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, once per process.
///
/// Safe to call from every test; later calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
