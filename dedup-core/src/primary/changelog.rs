//! Append-only changelog backing the primary store. Every time bucket has its own segment file so
//! expiring a bucket is a single file delete. Each record is a little-endian `u64` length followed
//! by the JSON encoded [ChangelogRecord].

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::Result;
use crate::message::DedupKey;

const SEGMENT_EXTENSION: &str = "seg";
const LEN_PREFIX: usize = std::mem::size_of::<u64>();

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ChangelogRecord {
    pub(crate) key: DedupKey,
    pub(crate) recorded_at_ms: i64,
}

/// A segment as found on disk during replay.
#[derive(Debug)]
pub(crate) struct ReplayedSegment {
    pub(crate) bucket: i64,
    pub(crate) records: Vec<ChangelogRecord>,
}

/// An open segment. `committed_len` always ends on a record boundary.
struct Segment {
    file: File,
    committed_len: u64,
    /// Set while a record is being written. Still set when that write failed or was cancelled,
    /// the torn bytes past `committed_len` are cut off before the next append.
    dirty: bool,
}

pub(crate) struct Changelog {
    dir: PathBuf,
    /// Partition name, prefixes every segment file so several partitions can share a directory.
    prefix: String,
    /// fsync after every append.
    sync: bool,
    segments: BTreeMap<i64, Segment>,
}

impl Changelog {
    pub(crate) async fn open(dir: PathBuf, prefix: String, sync: bool) -> Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            prefix,
            sync,
            segments: BTreeMap::new(),
        })
    }

    fn segment_path(&self, bucket: i64) -> PathBuf {
        self.dir
            .join(format!("{}_{}.{}", self.prefix, bucket, SEGMENT_EXTENSION))
    }

    /// Appends and flushes a record. Once this returns the record survives a process restart (and
    /// a machine crash when `sync` is set).
    pub(crate) async fn append(&mut self, bucket: i64, record: &ChangelogRecord) -> Result<()> {
        let payload = serde_json::to_vec(record)?;
        let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
        frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        frame.extend_from_slice(&payload);

        if !self.segments.contains_key(&bucket) {
            let path = self.segment_path(bucket);
            debug!(path = %path.display(), "Opening changelog segment");
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            let committed_len = file.metadata().await?.len();
            self.segments.insert(
                bucket,
                Segment {
                    file,
                    committed_len,
                    dirty: false,
                },
            );
        }
        let Some(segment) = self.segments.get_mut(&bucket) else {
            return Err(crate::Error::Changelog(format!(
                "no segment for bucket {bucket}"
            )));
        };

        if segment.dirty {
            // waits for the torn write to land before cutting it off
            segment.file.set_len(segment.committed_len).await?;
            segment.dirty = false;
            warn!(
                bucket,
                committed_len = segment.committed_len,
                "Discarded a partially written changelog record"
            );
        }

        segment.dirty = true;
        segment.file.write_all(&frame).await?;
        segment.file.flush().await?;
        if self.sync {
            segment.file.sync_data().await?;
        }
        segment.committed_len += frame.len() as u64;
        segment.dirty = false;
        Ok(())
    }

    /// Deletes the segment of an expired bucket.
    pub(crate) async fn remove_segment(&mut self, bucket: i64) -> Result<()> {
        self.segments.remove(&bucket);
        let path = self.segment_path(bucket);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = %path.display(), bucket, "Deleted expired changelog segment");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads back every segment of this partition in bucket order. A torn trailing record is cut
    /// off so later appends start on a record boundary.
    pub(crate) async fn replay(&self) -> Result<Vec<ReplayedSegment>> {
        let mut buckets = list_segments(&self.dir, &self.prefix).await?;
        buckets.sort_by_key(|(bucket, _)| *bucket);

        let mut segments = Vec::with_capacity(buckets.len());
        for (bucket, path) in buckets {
            let data = tokio::fs::read(&path).await?;
            let (records, valid_len) = decode_records(&data);
            if valid_len < data.len() {
                warn!(
                    path = %path.display(),
                    valid_len,
                    file_len = data.len(),
                    "Discarding torn record at the end of changelog segment"
                );
                let file = OpenOptions::new().write(true).open(&path).await?;
                file.set_len(valid_len as u64).await?;
            }
            segments.push(ReplayedSegment { bucket, records });
        }
        Ok(segments)
    }
}

/// Decodes as many whole records as possible, returns them with the number of bytes consumed.
fn decode_records(data: &[u8]) -> (Vec<ChangelogRecord>, usize) {
    let mut records = Vec::new();
    let mut pos = 0;
    loop {
        let Some(len_bytes) = data.get(pos..pos + LEN_PREFIX) else {
            break;
        };
        let mut len_buf = [0u8; LEN_PREFIX];
        len_buf.copy_from_slice(len_bytes);
        let Ok(len) = usize::try_from(u64::from_le_bytes(len_buf)) else {
            break;
        };
        let start = pos + LEN_PREFIX;
        let Some(payload) = start.checked_add(len).and_then(|end| data.get(start..end)) else {
            break;
        };
        match serde_json::from_slice::<ChangelogRecord>(payload) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }
        pos = start + len;
    }
    (records, pos)
}

async fn list_segments(dir: &Path, prefix: &str) -> Result<Vec<(i64, PathBuf)>> {
    let mut segments = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != SEGMENT_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        // `{prefix}_{bucket}`, the bucket may be negative
        let Some(bucket) = stem
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('_'))
            .and_then(|b| b.parse::<i64>().ok())
        else {
            continue;
        };
        segments.push((bucket, path));
    }
    Ok(segments)
}
