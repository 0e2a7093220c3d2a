//! Secondary Durable Store. An external key repository in a failure domain independent of the
//! processing node. It is written only by the witness and read only on recovery paths (after the
//! primary store came back without history), never as a hot-path dependency.
//!
//! [SecondaryStore] is the storage contract, organised by [GenerationId]. [Secondary] pairs a store
//! with the [GenerationSchedule] so callers can ask `exists(key)` over the live generations without
//! knowing about generations at all.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::Error;
use crate::Result;
use crate::clock::Clock;
use crate::message::DedupKey;
use crate::retention::{GenerationId, GenerationSchedule};

/// In-process store with fault injection.
pub mod in_memory_store;

/// Outage, failure and latency injection for [in_memory_store::InMemoryStore].
pub mod fault_injector;

/// Redis backed store, one set per generation.
pub mod redis_store;

/// Storage contract of the secondary store. `put` has to be idempotent and commutative since every
/// node's witness writes into the same store concurrently and delivery is at-least-once.
#[trait_variant::make(Send)]
pub trait SecondaryStore: Clone + Sync + 'static {
    async fn put(&self, key: &DedupKey, generation: GenerationId) -> Result<()>;

    /// Whether `key` is present in any of `generations`.
    async fn exists_in(&self, key: &DedupKey, generations: &[GenerationId]) -> Result<bool>;

    /// Generations currently holding data.
    async fn generations(&self) -> Result<Vec<GenerationId>>;

    /// Deletes a whole generation, cost is independent of the number of keys in it.
    async fn drop_generation(&self, generation: GenerationId) -> Result<()>;
}

/// What happened to a witnessed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Written(Vec<GenerationId>),
    /// Every target generation is already retired, the key is past the retention window.
    Expired,
}

/// Generation-aware handle over a [SecondaryStore]. Every call is bounded by `timeout`.
#[derive(Clone)]
pub struct Secondary<S> {
    store: S,
    schedule: GenerationSchedule,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl<S: SecondaryStore> Secondary<S> {
    pub fn new(
        store: S,
        schedule: GenerationSchedule,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            schedule,
            clock,
            timeout,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn schedule(&self) -> &GenerationSchedule {
        &self.schedule
    }

    /// Whether `key` is present in any currently-live generation, or in a later one when the
    /// message's `event_time` is ahead of the clock.
    pub async fn exists(&self, key: &DedupKey, event_time: DateTime<Utc>) -> Result<bool> {
        let generations = self
            .schedule
            .lookup_generations(self.clock.now(), event_time);
        match tokio::time::timeout(self.timeout, self.store.exists_in(key, &generations)).await {
            Ok(result) => result,
            Err(_) => Err(Error::SecondaryStoreUnavailable(format!(
                "exists({key}) did not complete within {:?}",
                self.timeout
            ))),
        }
    }

    /// Writes `key` into the generations it belongs to, skipping generations that are already
    /// retired so a late delivery never resurrects a deleted generation.
    pub async fn put(&self, key: &DedupKey, recorded_at: DateTime<Utc>) -> Result<PutOutcome> {
        let now = self.clock.now();
        let targets: Vec<GenerationId> = self
            .schedule
            .write_targets(recorded_at)
            .into_iter()
            .filter(|generation| !self.schedule.is_retired(*generation, now))
            .collect();

        if targets.is_empty() {
            debug!(%key, %recorded_at, "Key is past retention, not writing to secondary");
            return Ok(PutOutcome::Expired);
        }

        for generation in &targets {
            match tokio::time::timeout(self.timeout, self.store.put(key, *generation)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::SecondaryStoreUnavailable(format!(
                        "put({key}, {generation}) did not complete within {:?}",
                        self.timeout
                    )));
                }
            }
        }
        Ok(PutOutcome::Written(targets))
    }
}
