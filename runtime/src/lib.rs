//! # Library Events Runtime
//!
//! Processing runtime of the library events consumer.
//!
//! ## Core Components
//!
//! - **`EventProcessor`**: decodes, validates and persists each message, and
//!   converts every failure into a routing decision
//! - **`ErrorRouter`**: publishes failed messages to the retry or dead-letter
//!   topic with `retryCount`, `errorClass` and `errorMessage` headers
//! - **`IngestDispatcher` / `RetryDispatcher`**: bind the processor to the
//!   main and retry topics; the retry dispatcher can be paused at runtime
//!
//! ## Example
//!
//! ```ignore
//! use library_events_runtime::{
//!     DispatcherConfig, ErrorRouter, EventProcessor, IngestDispatcher, RouterConfig,
//! };
//!
//! let router = ErrorRouter::new(bus.clone(), RouterConfig::default());
//! let processor = Arc::new(EventProcessor::new(repository, router));
//!
//! let ingest = IngestDispatcher::new(
//!     bus,
//!     processor,
//!     DispatcherConfig::new("library-events", "library-events-listener-group"),
//! );
//! ingest.start().await?;
//! ```

/// Subscriptions to the ingest and retry topics
pub mod dispatcher;

/// Failure taxonomy and retry classification
pub mod error;

/// Prometheus metrics for observability
pub mod metrics;

/// Per-message processing state machine
pub mod processor;

/// Retry logic with exponential backoff
pub mod retry;

/// Retry and dead-letter routing
pub mod router;

pub use dispatcher::{DispatcherConfig, IngestDispatcher, RetryDispatcher};
pub use error::{Classification, ProcessingError};
pub use processor::{EventProcessor, ProcessingOutcome};
pub use retry::RetryPolicy;
pub use router::{ErrorRouter, RouteDecision, RouterConfig};
