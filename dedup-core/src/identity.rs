//! Derives the [DedupKey] from the business-identifying fields of a message. The key must be equal
//! for true duplicates and distinct for distinct business actions; the stores trust it blindly.

use crate::Error;
use crate::Result;
use crate::message::{DedupKey, Message};

const KEY_SEPARATOR: char = ':';

/// Pure and deterministic, no side effects.
pub trait IdentityExtractor: Send + Sync {
    fn extract(&self, message: &Message) -> Result<DedupKey>;
}

/// Builds the key by joining the values of an ordered list of fields, e.g. `txn_id` and
/// `txn_type` give `42:debit`.
#[derive(Debug, Clone)]
pub struct FieldExtractor {
    fields: Vec<String>,
}

impl FieldExtractor {
    pub fn new(fields: Vec<String>) -> Result<Self> {
        if fields.is_empty() {
            return Err(Error::Config(
                "at least one key field is required".to_string(),
            ));
        }
        Ok(Self { fields })
    }
}

impl IdentityExtractor for FieldExtractor {
    fn extract(&self, message: &Message) -> Result<DedupKey> {
        let mut key = String::new();
        for (idx, name) in self.fields.iter().enumerate() {
            let value = match message.field(name) {
                Some(v) if !v.is_empty() => v,
                _ => {
                    return Err(Error::MalformedMessage(format!(
                        "required field {name} is missing or empty (offset={})",
                        message.offset
                    )));
                }
            };
            if idx > 0 {
                key.push(KEY_SEPARATOR);
            }
            key.push_str(value);
        }
        Ok(DedupKey::from(key))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;

    fn message(fields: &[(&str, &str)]) -> Message {
        let fields: HashMap<String, String> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Message {
            offset: "0-1".to_string(),
            fields: Arc::new(fields),
            ..Default::default()
        }
    }

    #[test]
    fn test_extract_joins_fields_in_order() {
        let extractor =
            FieldExtractor::new(vec!["txn_id".to_string(), "txn_type".to_string()]).unwrap();
        let msg = message(&[("txn_type", "debit"), ("txn_id", "42"), ("amount", "10")]);
        assert_eq!(extractor.extract(&msg).unwrap(), DedupKey::from("42:debit"));

        // extra fields do not influence the key
        let msg = message(&[("txn_type", "debit"), ("txn_id", "42"), ("amount", "99")]);
        assert_eq!(extractor.extract(&msg).unwrap(), DedupKey::from("42:debit"));
    }

    #[test]
    fn test_extract_missing_field_is_malformed() {
        let extractor =
            FieldExtractor::new(vec!["txn_id".to_string(), "txn_type".to_string()]).unwrap();

        let result = extractor.extract(&message(&[("txn_id", "42")]));
        assert!(matches!(result, Err(Error::MalformedMessage(msg)) if msg.contains("txn_type")));

        let result = extractor.extract(&message(&[("txn_id", ""), ("txn_type", "debit")]));
        assert!(matches!(result, Err(Error::MalformedMessage(_))));
    }

    #[test]
    fn test_extractor_requires_fields() {
        assert!(matches!(FieldExtractor::new(vec![]), Err(Error::Config(_))));
    }
}
