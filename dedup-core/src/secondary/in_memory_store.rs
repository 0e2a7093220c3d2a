//! In-memory implementation of [SecondaryStore] for single-process deployments and tests. It lives
//! in the node's memory, so unlike a real secondary it does not survive the node; pair it with
//! [FaultInjector] to simulate an unavailable secondary.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::Error;
use crate::Result;
use crate::message::DedupKey;
use crate::retention::GenerationId;
use crate::secondary::SecondaryStore;
use crate::secondary::fault_injector::FaultInjector;

#[derive(Clone, Default)]
pub struct InMemoryStore {
    generations: Arc<RwLock<BTreeMap<GenerationId, HashSet<DedupKey>>>>,
    fault_injector: Arc<FaultInjector>,
    /// Successful puts, duplicates included.
    puts: Arc<AtomicUsize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fault_injector(&self) -> &Arc<FaultInjector> {
        &self.fault_injector
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::Relaxed)
    }

    /// Number of distinct keys in a generation.
    pub fn generation_len(&self, generation: GenerationId) -> usize {
        self.generations
            .read()
            .get(&generation)
            .map_or(0, HashSet::len)
    }

    /// Whether `key` is stored in any generation, live or not.
    pub fn contains(&self, key: &DedupKey) -> bool {
        self.generations
            .read()
            .values()
            .any(|keys| keys.contains(key))
    }
}

impl SecondaryStore for InMemoryStore {
    async fn put(&self, key: &DedupKey, generation: GenerationId) -> Result<()> {
        self.fault_injector.apply_put_latency().await;
        if self.fault_injector.should_fail_put() {
            return Err(Error::SecondaryStoreUnavailable(format!(
                "injected failure for put({key}, {generation})"
            )));
        }
        self.generations
            .write()
            .entry(generation)
            .or_default()
            .insert(key.clone());
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn exists_in(&self, key: &DedupKey, generations: &[GenerationId]) -> Result<bool> {
        self.fault_injector.apply_exists_latency().await;
        if self.fault_injector.should_fail_exists() {
            return Err(Error::SecondaryStoreUnavailable(format!(
                "injected failure for exists({key})"
            )));
        }
        let stored = self.generations.read();
        Ok(generations
            .iter()
            .filter_map(|generation| stored.get(generation))
            .any(|keys| keys.contains(key)))
    }

    async fn generations(&self) -> Result<Vec<GenerationId>> {
        if self.fault_injector.is_down() {
            return Err(Error::SecondaryStoreUnavailable(
                "injected outage for generations()".to_string(),
            ));
        }
        Ok(self.generations.read().keys().copied().collect())
    }

    async fn drop_generation(&self, generation: GenerationId) -> Result<()> {
        if self.fault_injector.is_down() {
            return Err(Error::SecondaryStoreUnavailable(format!(
                "injected outage for drop_generation({generation})"
            )));
        }
        self.generations.write().remove(&generation);
        Ok(())
    }
}
