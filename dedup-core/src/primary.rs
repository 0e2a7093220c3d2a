//! Primary Dedup Store. A windowed `key -> recorded_at` index owned by exactly one partition of one
//! processing node, and the only authority for inline accept/reject decisions.
//!
//! Entries are grouped into epoch-aligned time buckets. Each bucket is backed by its own changelog
//! segment, so eviction drops a whole bucket (and deletes one file) once the bucket has entirely
//! left the retention window. A key moves through
//! ```text
//!  Unseen --record--> Recorded --bucket leaves window--> Evicted (same as Unseen)
//! ```
//! Rejections are never stored.
//!
//! If the changelog is lost the store comes back empty and every key is `Unseen` again. That is
//! reported through [Rehydration::gap] and is mitigated by the secondary store, not here.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::Result;
use crate::message::DedupKey;
use crate::shared::{bucket_index, bucket_start, duration_millis, millis_to_utc};

mod changelog;

use changelog::{Changelog, ChangelogRecord};

/// Inline lookup contract of the primary store. Both calls have to be bounded in latency, the
/// caller wraps them in a hard timeout.
#[trait_variant::make(Send)]
pub trait WindowStore: Clone + Sync + 'static {
    /// Whether `key` was recorded at or after `window_start`.
    async fn lookup(
        &self,
        key: &DedupKey,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Records `key` as successfully processed. Must only be called once the business effect is
    /// guaranteed.
    async fn record(&self, key: &DedupKey, recorded_at: DateTime<Utc>) -> Result<()>;
}

/// An entry of the window index. Never mutated, a later record of the same key supersedes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowEntry {
    pub key: DedupKey,
    pub recorded_at: DateTime<Utc>,
    pub window_id: i64,
}

/// Outcome of rebuilding the index from the changelog at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rehydration {
    /// Entries restored into the index.
    pub restored: usize,
    /// Segments found on disk, including expired ones.
    pub segments: usize,
    /// True when there was no history at all to rebuild from.
    pub gap: bool,
}

#[derive(Debug, Clone)]
pub struct PrimaryStoreConfig {
    pub changelog_dir: PathBuf,
    /// Partition name, one store per partition.
    pub partition: String,
    pub retention_window: Duration,
    pub bucket_length: Duration,
    pub changelog_sync: bool,
}

struct WindowIndex {
    entries: HashMap<DedupKey, WindowEntry>,
    /// bucket -> keys recorded in it. A key can be listed under an older bucket after it was
    /// superseded, eviction checks the entry's current bucket before removing it.
    buckets: BTreeMap<i64, Vec<DedupKey>>,
    changelog: Changelog,
}

/// Changelog-backed [WindowStore]. Clones share the same index.
#[derive(Clone)]
pub struct LocalWindowStore {
    index: Arc<Mutex<WindowIndex>>,
    retention_window: Duration,
    bucket_length: Duration,
}

impl LocalWindowStore {
    /// Opens the store for a partition and rehydrates it from its changelog. Buckets that are
    /// already outside the window at `now` are not restored and their segments are deleted.
    pub async fn open(config: PrimaryStoreConfig, now: DateTime<Utc>) -> Result<(Self, Rehydration)> {
        let changelog = Changelog::open(
            config.changelog_dir.clone(),
            config.partition.clone(),
            config.changelog_sync,
        )
        .await?;

        let segments = changelog.replay().await?;
        let segment_count = segments.len();

        let mut index = WindowIndex {
            entries: HashMap::new(),
            buckets: BTreeMap::new(),
            changelog,
        };

        for segment in segments {
            for record in segment.records {
                // replay is in bucket order then append order, so a later record supersedes
                let entry = WindowEntry {
                    key: record.key.clone(),
                    recorded_at: millis_to_utc(record.recorded_at_ms),
                    window_id: segment.bucket,
                };
                index
                    .buckets
                    .entry(segment.bucket)
                    .or_default()
                    .push(record.key.clone());
                index.entries.insert(record.key, entry);
            }
        }

        let store = Self {
            index: Arc::new(Mutex::new(index)),
            retention_window: config.retention_window,
            bucket_length: config.bucket_length,
        };

        {
            let mut index = store.index.lock().await;
            store.evict_expired(&mut index, now).await?;
        }

        let restored = store.len().await;
        let rehydration = Rehydration {
            restored,
            segments: segment_count,
            gap: segment_count == 0,
        };

        if rehydration.gap {
            warn!(
                partition = %config.partition,
                dir = %config.changelog_dir.display(),
                "Primary store rehydrated without any history"
            );
        } else {
            info!(
                partition = %config.partition,
                restored,
                segments = segment_count,
                "Primary store rehydrated from changelog"
            );
        }

        Ok((store, rehydration))
    }

    /// Drops every bucket that ended at or before `now - retention_window`.
    async fn evict_expired(&self, index: &mut WindowIndex, now: DateTime<Utc>) -> Result<()> {
        let horizon = now.timestamp_millis() - duration_millis(self.retention_window);

        while let Some((&bucket, _)) = index.buckets.first_key_value() {
            let bucket_end = bucket_start(bucket.saturating_add(1), self.bucket_length);
            if bucket_end.timestamp_millis() > horizon {
                break;
            }
            // delete the segment first, if that fails the bucket stays and is retried next time
            index.changelog.remove_segment(bucket).await?;
            let keys = index.buckets.remove(&bucket).unwrap_or_default();
            let mut evicted = 0;
            for key in keys {
                if index
                    .entries
                    .get(&key)
                    .is_some_and(|entry| entry.window_id == bucket)
                {
                    index.entries.remove(&key);
                    evicted += 1;
                }
            }
            debug!(bucket, evicted, "Evicted expired bucket");
        }
        Ok(())
    }

    /// Number of keys currently retained.
    pub async fn len(&self) -> usize {
        self.index.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn entry(&self, key: &DedupKey) -> Option<WindowEntry> {
        self.index.lock().await.entries.get(key).cloned()
    }
}

impl WindowStore for LocalWindowStore {
    async fn lookup(
        &self,
        key: &DedupKey,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut index = self.index.lock().await;
        self.evict_expired(&mut index, now).await?;
        Ok(index
            .entries
            .get(key)
            .is_some_and(|entry| entry.recorded_at >= window_start))
    }

    /// `recorded_at` may be ahead of the clock, so eviction is left to `lookup` and `open`.
    async fn record(&self, key: &DedupKey, recorded_at: DateTime<Utc>) -> Result<()> {
        let mut index = self.index.lock().await;

        let bucket = bucket_index(recorded_at.timestamp_millis(), self.bucket_length);
        let record = ChangelogRecord {
            key: key.clone(),
            recorded_at_ms: recorded_at.timestamp_millis(),
        };
        // commit point, the index only changes once the record is in the changelog
        index.changelog.append(bucket, &record).await?;

        index.buckets.entry(bucket).or_default().push(key.clone());
        index.entries.insert(
            key.clone(),
            WindowEntry {
                key: key.clone(),
                recorded_at,
                window_id: bucket,
            },
        );
        Ok(())
    }
}
