//! Library events consumer service.
//!
//! The binary wires the Postgres repository, the Redpanda bus and the
//! processing runtime together. This library half only exposes the
//! configuration so it can be tested without brokers or databases.

/// Environment-driven service configuration
pub mod config;
