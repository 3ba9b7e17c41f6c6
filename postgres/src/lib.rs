//! `PostgreSQL` event repository for the library events consumer.
//!
//! This crate provides a production-ready PostgreSQL-based repository that
//! implements the `EventRepository` trait from `library-events-core`. It uses
//! sqlx and supports:
//!
//! - Atomic upsert of an event and its book in one transaction
//! - SQLSTATE-based classification of failures into transient and permanent
//! - Connection pooling
//! - Embedded migrations
//!
//! # Example
//!
//! ```ignore
//! use library_events_postgres::PostgresEventRepository;
//! use std::time::Duration;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let repository = PostgresEventRepository::connect(
//!         "postgres://localhost/library_events",
//!         10,
//!         Duration::from_secs(30),
//!     )
//!     .await?;
//!     repository.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod repository;

pub use error::classify_sqlx_error;
pub use repository::PostgresEventRepository;
