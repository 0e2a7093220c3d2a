//! Message is what the transport hands to the dedup layer, one partition at a time. The dedup layer
//! never changes it: an accepted [Message] is forwarded as-is to the processing pipeline, and a
//! rejected one is wrapped in a [Rejection] together with the reason.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The message as read from the transport.
/// NOTE: It is cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Transport offset, only used for logging.
    pub offset: String,
    /// Business fields the dedup key is derived from (e.g., transaction id and type).
    pub fields: Arc<HashMap<String, String>>,
    /// Opaque payload for the processing pipeline.
    pub value: Bytes,
    /// Event time of the message, staleness is judged against this.
    pub event_time: DateTime<Utc>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            offset: String::new(),
            fields: Arc::new(HashMap::new()),
            value: Bytes::new(),
            event_time: Utc::now(),
        }
    }
}

impl Message {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// DedupKey identifies a logical message. Two deliveries with equal keys are the same business
/// action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(Arc<str>);

impl DedupKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        DedupKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DedupKey {
    fn from(value: &str) -> Self {
        DedupKey::new(value)
    }
}

impl From<String> for DedupKey {
    fn from(value: String) -> Self {
        DedupKey::new(value)
    }
}

/// Why a message was routed to the rejection path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// Event time is outside the retention window, its history can no longer be verified.
    Stale,
    /// The key was already recorded within the retention window.
    Duplicate,
    /// No key could be derived from the message.
    Malformed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Stale => write!(f, "STALE"),
            RejectReason::Duplicate => write!(f, "DUPLICATE"),
            RejectReason::Malformed => write!(f, "MALFORMED"),
        }
    }
}

/// A rejected message, routed to the rejection/duplicate feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub original_message: Message,
    pub reason: RejectReason,
    /// The key, when one could be derived.
    pub key: Option<DedupKey>,
}
