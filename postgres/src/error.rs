//! Mapping of sqlx failures onto [`StoreError`].

use library_events_core::repository::StoreError;

/// Sort a sqlx error into transient, integrity, or unclassified.
///
/// | Source                                             | Result      |
/// |----------------------------------------------------|-------------|
/// | I/O, TLS, pool timeout/closed, worker crash, protocol | `Transient` |
/// | SQLSTATE `08xxx` connection exception              | `Transient` |
/// | SQLSTATE `40xxx` serialization failure, deadlock   | `Transient` |
/// | SQLSTATE `53xxx` insufficient resources            | `Transient` |
/// | SQLSTATE `57P0x` admin/crash shutdown              | `Transient` |
/// | SQLSTATE `23xxx` integrity constraint violation    | `Integrity` |
/// | anything else                                      | `Other`     |
#[must_use]
pub fn classify_sqlx_error(error: &sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_) => StoreError::Transient(error.to_string()),
        sqlx::Error::Database(db) => classify_sqlstate(db.code().as_deref(), error.to_string()),
        _ => StoreError::Other(error.to_string()),
    }
}

fn classify_sqlstate(code: Option<&str>, message: String) -> StoreError {
    let Some(code) = code else {
        return StoreError::Other(message);
    };

    if code.starts_with("23") {
        StoreError::Integrity(message)
    } else if ["08", "40", "53", "57P"].iter().any(|class| code.starts_with(class)) {
        StoreError::Transient(message)
    } else {
        StoreError::Other(message)
    }
}
