use dedup_core::Result;
use dedup_core::forwarder::{Processor, RejectionSink};
use dedup_core::message::{Message, Rejection};

fn fields(message: &Message) -> String {
    let mut fields: Vec<_> = message.fields.iter().collect();
    fields.sort();
    fields
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Processing pipeline that logs every accepted message.
pub(crate) struct LogProcessor;

impl Processor for LogProcessor {
    async fn process(&self, message: &Message) -> Result<()> {
        let log_line = format!(
            "Payload - {} Fields - {} EventTime - {} Offset - {}",
            &String::from_utf8_lossy(&message.value),
            fields(message),
            message.event_time.timestamp_millis(),
            message.offset,
        );
        tracing::info!("{}", log_line);
        Ok(())
    }
}

/// Rejection feed that logs every rejected message with its reason.
pub(crate) struct LogRejectionSink;

impl RejectionSink for LogRejectionSink {
    async fn reject(&self, rejection: Rejection) -> Result<()> {
        tracing::warn!(
            reason = %rejection.reason,
            key = rejection.key.as_ref().map(|k| k.as_str()),
            offset = %rejection.original_message.offset,
            fields = %fields(&rejection.original_message),
            "Rejected message"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use dedup_core::message::{DedupKey, RejectReason};

    use super::*;

    fn message() -> Message {
        Message {
            offset: "1".to_string(),
            fields: Arc::new(HashMap::from([
                ("txn_type".to_string(), "debit".to_string()),
                ("txn_id".to_string(), "42".to_string()),
            ])),
            value: b"Hello, World!".to_vec().into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_fields_are_sorted() {
        assert_eq!(fields(&message()), "txn_id=42,txn_type=debit");
    }

    #[tokio::test]
    async fn test_log_processor_and_sink_accept_everything() {
        LogProcessor.process(&message()).await.unwrap();
        LogRejectionSink
            .reject(Rejection {
                original_message: message(),
                reason: RejectReason::Duplicate,
                key: Some(DedupKey::from("42:debit")),
            })
            .await
            .unwrap();
    }
}
