//! Owned bus messages.
//!
//! Backends convert their native records into [`InboundMessage`] before handing
//! them to a [`MessageHandler`](crate::message_bus::MessageHandler), so the
//! processing pipeline never borrows from a client library.

use std::collections::BTreeMap;
use std::fmt;

/// Header carrying the number of prior retryable failures.
pub const RETRY_COUNT_HEADER: &str = "retryCount";
/// Header carrying the taxonomy name of the failure (dead-letter only).
pub const ERROR_CLASS_HEADER: &str = "errorClass";
/// Header carrying the failure text (dead-letter only).
pub const ERROR_MESSAGE_HEADER: &str = "errorMessage";
/// Topic of the first message in a retry chain.
pub const ORIGINAL_TOPIC_HEADER: &str = "originalTopic";
/// Partition of the first message in a retry chain.
pub const ORIGINAL_PARTITION_HEADER: &str = "originalPartition";
/// Offset of the first message in a retry chain.
pub const ORIGINAL_OFFSET_HEADER: &str = "originalOffset";

/// Message headers as UTF-8 text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    /// Empty header set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Set a header, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Value of a header.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether a header is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterate over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Retry count carried by the message.
    ///
    /// Absent or unparsable values read as 0.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        match self.get(RETRY_COUNT_HEADER) {
            None => 0,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(value = raw, "Ignoring non-numeric retryCount header");
                0
            }),
        }
    }
}

/// Renders as `{key=value, ...}` for log fields.
impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str("}")
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A message received from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Source topic
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Message key, if any
    pub key: Option<Vec<u8>>,
    /// Raw payload bytes (empty if the record had none)
    pub payload: Vec<u8>,
    /// Message headers
    pub headers: Headers,
}

impl InboundMessage {
    /// Key as UTF-8 text, for logging.
    #[must_use]
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }

    /// Retry count carried by this message (0 on first delivery).
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.headers.retry_count()
    }
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Message key, if any
    pub key: Option<Vec<u8>>,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Message headers
    pub headers: Headers,
}

impl OutboundMessage {
    /// Message with the given payload and no key or headers.
    #[must_use]
    pub const fn new(payload: Vec<u8>) -> Self {
        Self {
            key: None,
            payload,
            headers: Headers::new(),
        }
    }

    /// Set the key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the headers.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}
