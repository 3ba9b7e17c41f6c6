//! Failure taxonomy of message processing.

use library_events_core::codec::DecodeError;
use library_events_core::event::ValidationError;
use library_events_core::repository::StoreError;
use thiserror::Error;

/// Whether retrying a failed message can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// The failure may clear up; send the message through the retry topic.
    Retryable,
    /// The same bytes will fail the same way; dead-letter the message.
    NonRetryable,
}

/// Why a message could not be persisted.
///
/// | Variant                        | `error_class`         | Classification |
/// |--------------------------------|-----------------------|----------------|
/// | `Decode`                       | `DecodeError`         | non-retryable  |
/// | `Validation`                   | `ValidationError`     | non-retryable  |
/// | `Store(Transient)`             | `TransientStoreError` | retryable      |
/// | `Store(Integrity)`             | `IntegrityError`      | non-retryable  |
/// | `Store(NotFound)`              | `ValidationError`     | non-retryable  |
/// | `Store(Other)`                 | `UnclassifiedError`   | retryable      |
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// The payload is not a library event.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The event breaks the CREATE/UPDATE id rules.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The repository rejected or failed the upsert.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProcessingError {
    /// Retry decision for this failure.
    ///
    /// Unclassified store failures are retried: losing an event silently is
    /// worse than a bounded number of extra attempts.
    #[must_use]
    pub const fn classification(&self) -> Classification {
        match self {
            Self::Decode(_)
            | Self::Validation(_)
            | Self::Store(StoreError::Integrity(_) | StoreError::NotFound(_)) => {
                Classification::NonRetryable
            },
            Self::Store(StoreError::Transient(_) | StoreError::Other(_)) => {
                Classification::Retryable
            },
        }
    }

    /// Name written to the `errorClass` header and used as a metrics label.
    #[must_use]
    pub const fn error_class(&self) -> &'static str {
        match self {
            Self::Decode(_) => "DecodeError",
            Self::Validation(_) | Self::Store(StoreError::NotFound(_)) => "ValidationError",
            Self::Store(StoreError::Transient(_)) => "TransientStoreError",
            Self::Store(StoreError::Integrity(_)) => "IntegrityError",
            Self::Store(StoreError::Other(_)) => "UnclassifiedError",
        }
    }
}
