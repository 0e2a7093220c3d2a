//! Witness mirrors successfully processed keys into the secondary store, off the inline path.
//!
//! ```text
//!  Recorder --enqueue (never blocks)--> queue --> Witness task --put w/ backoff--> Secondary
//!                                                     |  ^
//!                                          threshold  v  | redrive tick
//!                                                 dead letters
//! ```
//!
//! Enqueue never waits on the secondary. Under [OverflowPolicy::Buffer] the queue is unbounded,
//! under [OverflowPolicy::DropWithAlert] it is bounded and a full queue drops the record with an
//! error-level alert.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::message::DedupKey;
use crate::secondary::{PutOutcome, Secondary, SecondaryStore};

/// Exponential backoff between delivery attempts.
pub mod backoff;

use backoff::RetryBackoff;

/// A key queued for delivery to the secondary store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WitnessRecord {
    pub key: DedupKey,
    pub recorded_at: DateTime<Utc>,
}

/// What to do with a record when the witness queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Unbounded queue, memory grows and nothing is dropped.
    #[default]
    Buffer,
    /// Bounded queue, records that do not fit are dropped and alerted on.
    DropWithAlert,
}

#[derive(Debug, Clone)]
pub struct WitnessConfig {
    pub retry: RetryBackoff,
    /// Consecutive failed attempts after which a record is parked as a dead letter.
    pub dead_letter_threshold: u32,
    /// Only used by [OverflowPolicy::DropWithAlert].
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub redrive_interval: Duration,
}

impl Default for WitnessConfig {
    fn default() -> Self {
        Self {
            retry: RetryBackoff::default(),
            dead_letter_threshold: 5,
            queue_capacity: 10_000,
            overflow_policy: OverflowPolicy::Buffer,
            redrive_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
pub struct WitnessStats {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    expired: AtomicU64,
    failed_attempts: AtomicU64,
    dropped: AtomicU64,
    dead_lettered: AtomicU64,
    pending_dead_letters: AtomicU64,
}

/// Point in time copy of [WitnessStats].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WitnessStatsSnapshot {
    pub enqueued: u64,
    pub delivered: u64,
    /// Skipped because the key was already past retention.
    pub expired: u64,
    pub failed_attempts: u64,
    pub dropped: u64,
    pub dead_lettered: u64,
    pub pending_dead_letters: u64,
}

impl WitnessStats {
    pub fn snapshot(&self) -> WitnessStatsSnapshot {
        WitnessStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            pending_dead_letters: self.pending_dead_letters.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Clone)]
enum QueueSender {
    Unbounded(mpsc::UnboundedSender<WitnessRecord>),
    Bounded(mpsc::Sender<WitnessRecord>),
}

enum QueueReceiver {
    Unbounded(mpsc::UnboundedReceiver<WitnessRecord>),
    Bounded(mpsc::Receiver<WitnessRecord>),
}

impl QueueReceiver {
    async fn recv(&mut self) -> Option<WitnessRecord> {
        match self {
            QueueReceiver::Unbounded(rx) => rx.recv().await,
            QueueReceiver::Bounded(rx) => rx.recv().await,
        }
    }

    fn close(&mut self) {
        match self {
            QueueReceiver::Unbounded(rx) => rx.close(),
            QueueReceiver::Bounded(rx) => rx.close(),
        }
    }

    fn try_recv(&mut self) -> Option<WitnessRecord> {
        match self {
            QueueReceiver::Unbounded(rx) => rx.try_recv().ok(),
            QueueReceiver::Bounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// Enqueue side of the witness, held by the post-success recorder.
#[derive(Clone)]
pub struct WitnessHandle {
    tx: QueueSender,
    stats: Arc<WitnessStats>,
}

impl WitnessHandle {
    /// Queues a record without waiting. Returns false if the record was dropped, either because
    /// the bounded queue is full or because the witness has stopped.
    pub fn enqueue(&self, record: WitnessRecord) -> bool {
        let sent = match &self.tx {
            QueueSender::Unbounded(tx) => tx.send(record).map_err(|e| (e.0, "witness stopped")),
            QueueSender::Bounded(tx) => tx.try_send(record).map_err(|e| match e {
                TrySendError::Full(record) => (record, "witness queue full"),
                TrySendError::Closed(record) => (record, "witness stopped"),
            }),
        };

        match sent {
            Ok(()) => {
                WitnessStats::incr(&self.stats.enqueued);
                true
            }
            Err((record, cause)) => {
                let dropped = WitnessStats::incr(&self.stats.dropped);
                error!(
                    key = %record.key,
                    recorded_at = %record.recorded_at,
                    dropped,
                    cause,
                    "ALERT: dropped witness record, key will not reach the secondary store"
                );
                false
            }
        }
    }

    pub fn stats(&self) -> WitnessStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Consumer side, run with [Witness::run] on its own task.
pub struct Witness<S> {
    secondary: Secondary<S>,
    config: WitnessConfig,
    rx: QueueReceiver,
    dead_letters: VecDeque<WitnessRecord>,
    stats: Arc<WitnessStats>,
}

impl<S: SecondaryStore> Witness<S> {
    pub fn new(secondary: Secondary<S>, config: WitnessConfig) -> (Self, WitnessHandle) {
        let (tx, rx) = match config.overflow_policy {
            OverflowPolicy::Buffer => {
                let (tx, rx) = mpsc::unbounded_channel();
                (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
            }
            OverflowPolicy::DropWithAlert => {
                let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
                (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
            }
        };
        let stats = Arc::new(WitnessStats::default());
        let handle = WitnessHandle {
            tx,
            stats: Arc::clone(&stats),
        };
        let witness = Self {
            secondary,
            config,
            rx,
            dead_letters: VecDeque::new(),
            stats,
        };
        (witness, handle)
    }

    /// Delivers queued records until cancelled, redriving dead letters every `redrive_interval`.
    /// On cancellation the queue and the dead letters get one more attempt each.
    pub async fn run(mut self, cancel: CancellationToken) -> WitnessStatsSnapshot {
        let interval = self.config.redrive_interval.max(Duration::from_millis(1));
        let mut redrive = tokio::time::interval_at(Instant::now() + interval, interval);
        redrive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(record) = self.rx.recv() => {
                    self.deliver(record, &cancel).await;
                }
                _ = redrive.tick() => {
                    self.redrive().await;
                }
            }
        }

        self.drain().await;
        self.stats.snapshot()
    }

    /// Retries with backoff until delivered or until the dead-letter threshold parks the record.
    async fn deliver(&mut self, record: WitnessRecord, cancel: &CancellationToken) {
        let mut backoff = self.config.retry.strategy();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.attempt(&record).await {
                return;
            }

            if attempt >= self.config.dead_letter_threshold {
                error!(
                    key = %record.key,
                    recorded_at = %record.recorded_at,
                    attempts = attempt,
                    "ALERT: witness record crossed the dead-letter threshold, parking it for redrive"
                );
                WitnessStats::incr(&self.stats.dead_lettered);
                self.park(record);
                return;
            }

            let delay = backoff.next().unwrap_or(self.config.retry.max_interval);
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.park(record);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One put attempt. Expired records count as done.
    async fn attempt(&self, record: &WitnessRecord) -> bool {
        match self.secondary.put(&record.key, record.recorded_at).await {
            Ok(PutOutcome::Written(generations)) => {
                WitnessStats::incr(&self.stats.delivered);
                debug!(key = %record.key, ?generations, "Witnessed key");
                true
            }
            Ok(PutOutcome::Expired) => {
                WitnessStats::incr(&self.stats.expired);
                true
            }
            Err(e) => {
                WitnessStats::incr(&self.stats.failed_attempts);
                warn!(key = %record.key, error = ?e, "Failed to write witness record");
                false
            }
        }
    }

    fn park(&mut self, record: WitnessRecord) {
        self.dead_letters.push_back(record);
        self.sync_pending();
    }

    fn sync_pending(&self) {
        self.stats
            .pending_dead_letters
            .store(self.dead_letters.len() as u64, Ordering::Relaxed);
    }

    /// Gives every dead letter one attempt, oldest first. Stops at the first failure since the
    /// secondary is most likely still unavailable.
    async fn redrive(&mut self) {
        if self.dead_letters.is_empty() {
            return;
        }
        let pending = self.dead_letters.len();
        let mut redriven = 0usize;
        while let Some(record) = self.dead_letters.pop_front() {
            if !self.attempt(&record).await {
                self.dead_letters.push_front(record);
                break;
            }
            redriven += 1;
        }
        self.sync_pending();
        info!(
            redriven,
            remaining = self.dead_letters.len(),
            pending,
            "Redrove witness dead letters"
        );
    }

    async fn drain(&mut self) {
        self.rx.close();
        let mut undelivered = 0usize;
        while let Some(record) = self.rx.try_recv() {
            if !self.attempt(&record).await {
                undelivered += 1;
            }
        }

        let parked: Vec<WitnessRecord> = self.dead_letters.drain(..).collect();
        for record in parked {
            if !self.attempt(&record).await {
                undelivered += 1;
            }
        }
        self.sync_pending();

        if undelivered > 0 {
            error!(
                undelivered,
                "ALERT: witness stopped with records that never reached the secondary store"
            );
        } else {
            info!("Witness drained");
        }
    }
}
