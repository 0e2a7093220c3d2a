//! Newline-delimited JSON messages, one per line:
//! ```json
//! {"offset":"17","fields":{"txn_id":"42","txn_type":"debit"},"eventTime":"2026-01-01T10:00:00Z","value":"..."}
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dedup_core::message::Message;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputMessage {
    #[serde(default)]
    offset: Option<String>,
    #[serde(default)]
    fields: HashMap<String, String>,
    event_time: DateTime<Utc>,
    #[serde(default)]
    value: String,
}

/// Parses one input line. `line_number` is used as the offset when the line carries none.
pub(crate) fn parse_line(line: &str, line_number: u64) -> serde_json::Result<Message> {
    let input: InputMessage = serde_json::from_str(line)?;
    Ok(Message {
        offset: input.offset.unwrap_or_else(|| line_number.to_string()),
        fields: Arc::new(input.fields),
        value: Bytes::from(input.value),
        event_time: input.event_time,
    })
}

/// Wraps a line that is not a valid message, so it can still be routed to the rejection path with
/// the raw line as its payload.
pub(crate) fn undecodable(line: String, line_number: u64, received_at: DateTime<Utc>) -> Message {
    Message {
        offset: line_number.to_string(),
        fields: Arc::new(HashMap::new()),
        value: Bytes::from(line),
        event_time: received_at,
    }
}
