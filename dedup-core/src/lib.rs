//! Exactly-once effect for an at-least-once stream. Every message is run through the
//! [forwarder::DedupForwarder] which rejects stale, duplicate and malformed messages, hands the
//! rest to the processing pipeline, and only then records the message's key.
//!
//! Keys are held in two places:
//! - the [primary] store, local to the processing node and authoritative for inline decisions;
//! - the [secondary] store, in an independent failure domain, fed asynchronously by the
//!   [witness] and consulted when the primary store lost its history.
//!
//! Expiry of the secondary store is handled by [retention], in whole generations.

mod error;

pub use error::Error;
pub use error::Result;

pub mod clock;

/// Settings, loaded from JSON.
pub mod config;

pub mod forwarder;

/// Dedup key derivation from business fields.
pub mod identity;

pub mod message;

pub mod primary;

/// Records a key after the processing pipeline succeeded.
pub mod recorder;

pub mod retention;

pub mod secondary;

mod shared;

pub mod staleness;

pub mod witness;
