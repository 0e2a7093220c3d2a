//! The inline dedup path, one [DedupForwarder] per partition.
//!
//! ```text
//!  message -> extract key -> staleness -> primary lookup -> process -> record -> witness
//!                 |              |              |              |
//!             MALFORMED        STALE        DUPLICATE     failed, nothing recorded
//! ```
//!
//! A key is recorded only after the processor succeeded. After the primary store came back
//! without history, keys not found in the primary are also checked against the secondary store
//! until a full retention window has passed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::Error;
use crate::Result;
use crate::clock::Clock;
use crate::identity::IdentityExtractor;
use crate::message::{DedupKey, Message, RejectReason, Rejection};
use crate::primary::WindowStore;
use crate::recorder::PostSuccessRecorder;
use crate::secondary::{Secondary, SecondaryStore};
use crate::shared::{window_end, window_start};
use crate::staleness::{Freshness, StalenessGuard};
use crate::witness::WitnessHandle;

/// Processing pipeline behind the forwarder. `process` returning `Ok` means the message's
/// business effect is committed.
#[trait_variant::make(Send)]
pub trait Processor: Send + Sync {
    async fn process(&self, message: &Message) -> Result<()>;
}

/// Receives every rejected message. Rejections are never dropped, a sink error fails the
/// message.
#[trait_variant::make(Send)]
pub trait RejectionSink: Send + Sync {
    async fn reject(&self, rejection: Rejection) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Forwarded,
    Rejected(RejectReason),
    /// The processor failed, the key was not recorded and the message may be resubmitted.
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ForwarderConfig {
    pub retention_window: Duration,
    pub clock_skew_tolerance: Duration,
    pub primary_timeout: Duration,
    /// How long to hold the first acceptance after a rehydration gap.
    pub propagation_delay: Duration,
}

/// Recovery mode after a rehydration gap.
#[derive(Debug)]
struct Recovery {
    /// After this the primary store holds a full window again.
    until: DateTime<Utc>,
    /// Cleared once the propagation delay has been waited out.
    ready_at: Option<Instant>,
}

pub struct DedupForwarder<P, S, X, R> {
    extractor: Arc<dyn IdentityExtractor>,
    guard: StalenessGuard,
    primary: P,
    recorder: PostSuccessRecorder<P>,
    secondary: Option<Secondary<S>>,
    processor: X,
    sink: R,
    clock: Arc<dyn Clock>,
    config: ForwarderConfig,
    recovery: Option<Recovery>,
}

impl<P, S, X, R> DedupForwarder<P, S, X, R>
where
    P: WindowStore,
    S: SecondaryStore,
    X: Processor,
    R: RejectionSink,
{
    pub fn new(
        config: ForwarderConfig,
        extractor: Arc<dyn IdentityExtractor>,
        primary: P,
        witness: WitnessHandle,
        processor: X,
        sink: R,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let recorder = PostSuccessRecorder::new(primary.clone(), witness, config.primary_timeout);
        Self {
            extractor,
            guard: StalenessGuard::new(config.retention_window, config.clock_skew_tolerance),
            primary,
            recorder,
            secondary: None,
            processor,
            sink,
            clock,
            config,
            recovery: None,
        }
    }

    /// Secondary store consulted while recovering from a rehydration gap.
    pub fn with_secondary(mut self, secondary: Secondary<S>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    /// Puts the forwarder into recovery mode, the primary store was rehydrated without history at
    /// `rehydrated_at`.
    pub fn recovering_from_gap(mut self, rehydrated_at: DateTime<Utc>) -> Self {
        let until = window_end(rehydrated_at, self.config.retention_window);
        info!(
            %rehydrated_at,
            %until,
            propagation_delay = ?self.config.propagation_delay,
            "Primary store has no history, consulting the secondary store until it covers a full window"
        );
        self.recovery = Some(Recovery {
            until,
            ready_at: Some(Instant::now() + self.config.propagation_delay),
        });
        self
    }

    pub fn is_recovering(&self) -> bool {
        self.recovery.is_some()
    }

    /// Runs one message through the dedup path. `Err` is fatal for the current batch: the primary
    /// store is unavailable, the secondary store could not be consulted during a rehydration gap,
    /// or a rejection could not be delivered.
    pub async fn handle(&mut self, message: Message) -> Result<Outcome> {
        let key = match self.extractor.extract(&message) {
            Ok(key) => key,
            Err(Error::MalformedMessage(cause)) => {
                debug!(offset = %message.offset, %cause, "Malformed message");
                return self.reject(message, RejectReason::Malformed, None).await;
            }
            Err(e) => return Err(e),
        };

        let now = self.clock.now();
        if let Freshness::Stale { age } = self.guard.check(&message, now) {
            debug!(%key, offset = %message.offset, age_ms = age.num_milliseconds(), "Stale message");
            return self.reject(message, RejectReason::Stale, Some(key)).await;
        }

        if self.seen(&key, message.event_time, now).await? {
            debug!(%key, offset = %message.offset, "Duplicate message");
            return self.reject(message, RejectReason::Duplicate, Some(key)).await;
        }

        if let Err(e) = self.processor.process(&message).await {
            warn!(%key, offset = %message.offset, error = ?e, "Processing failed, key not recorded");
            return Ok(Outcome::Failed(e.to_string()));
        }

        // the entry has to outlive the message's freshness, even with an event time ahead of the clock
        let recorded_at = self.clock.now().max(message.event_time);
        self.recorder.on_success(&key, recorded_at).await?;
        debug!(%key, offset = %message.offset, "Forwarded message");
        Ok(Outcome::Forwarded)
    }

    /// Routes a message that could not even be decoded to the rejection path. Its fields and event
    /// time are not looked at.
    pub async fn reject_malformed(&self, message: Message) -> Result<Outcome> {
        debug!(offset = %message.offset, "Undecodable message");
        self.reject(message, RejectReason::Malformed, None).await
    }

    async fn seen(
        &mut self,
        key: &DedupKey,
        event_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let oldest = window_start(now, self.config.retention_window);
        let lookup = self.primary.lookup(key, oldest, now);
        let found = match tokio::time::timeout(self.config.primary_timeout, lookup).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                return Err(Error::PrimaryStoreUnavailable(format!(
                    "lookup({key}) failed: {e}"
                )));
            }
            Err(_) => {
                return Err(Error::PrimaryStoreUnavailable(format!(
                    "lookup({key}) did not complete within {:?}",
                    self.config.primary_timeout
                )));
            }
        };
        if found {
            return Ok(true);
        }

        let Some(recovery) = self.recovery.as_mut() else {
            return Ok(false);
        };
        if now >= recovery.until {
            info!("Primary store covers a full window again, leaving recovery mode");
            self.recovery = None;
            return Ok(false);
        }
        if let Some(ready_at) = recovery.ready_at.take() {
            tokio::time::sleep_until(ready_at).await;
        }

        let Some(secondary) = self.secondary.as_ref() else {
            return Err(Error::RehydrationGap(
                "no secondary store to consult".to_string(),
            ));
        };
        secondary.exists(key, event_time).await.map_err(|e| {
            Error::RehydrationGap(format!("secondary lookup for {key} failed: {e}"))
        })
    }

    async fn reject(
        &self,
        message: Message,
        reason: RejectReason,
        key: Option<DedupKey>,
    ) -> Result<Outcome> {
        self.sink
            .reject(Rejection {
                original_message: message,
                reason,
                key,
            })
            .await?;
        Ok(Outcome::Rejected(reason))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::TimeZone;
    use parking_lot::Mutex;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::FieldExtractor;
    use crate::primary::{LocalWindowStore, PrimaryStoreConfig};
    use crate::retention::GenerationSchedule;
    use crate::secondary::in_memory_store::InMemoryStore;
    use crate::witness::{Witness, WitnessConfig};

    const HOUR: Duration = Duration::from_secs(3600);

    fn hours(h: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(h * 3_600_000).unwrap()
    }

    #[derive(Clone, Default)]
    struct Collect {
        processed: Arc<Mutex<Vec<String>>>,
        rejected: Arc<Mutex<Vec<RejectReason>>>,
        fail_processing: Arc<Mutex<bool>>,
    }

    impl Processor for Collect {
        async fn process(&self, message: &Message) -> Result<()> {
            if *self.fail_processing.lock() {
                return Err(Error::Processing("downstream rejected".to_string()));
            }
            self.processed.lock().push(message.offset.clone());
            Ok(())
        }
    }

    impl RejectionSink for Collect {
        async fn reject(&self, rejection: Rejection) -> Result<()> {
            self.rejected.lock().push(rejection.reason);
            Ok(())
        }
    }

    fn message(offset: &str, txn_id: Option<&str>, event_time: DateTime<Utc>) -> Message {
        let mut fields = HashMap::new();
        if let Some(txn_id) = txn_id {
            fields.insert("txn_id".to_string(), txn_id.to_string());
        }
        Message {
            offset: offset.to_string(),
            fields: Arc::new(fields),
            event_time,
            ..Default::default()
        }
    }

    struct Harness {
        _dir: TempDir,
        clock: ManualClock,
        collect: Collect,
        secondary: Secondary<InMemoryStore>,
        forwarder: DedupForwarder<LocalWindowStore, InMemoryStore, Collect, Collect>,
    }

    async fn harness() -> Harness {
        harness_with_delay(Duration::ZERO).await
    }

    async fn harness_with_delay(propagation_delay: Duration) -> Harness {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(hours(100));
        let config = ForwarderConfig {
            retention_window: 24 * HOUR,
            clock_skew_tolerance: Duration::from_secs(60),
            primary_timeout: HOUR,
            propagation_delay,
        };
        let (primary, rehydration) = LocalWindowStore::open(
            PrimaryStoreConfig {
                changelog_dir: dir.path().to_path_buf(),
                partition: "p0".to_string(),
                retention_window: 24 * HOUR,
                bucket_length: 6 * HOUR,
                changelog_sync: false,
            },
            clock.now(),
        )
        .await
        .unwrap();
        assert!(rehydration.gap);

        let schedule = GenerationSchedule::new(24 * HOUR, 3, Duration::from_secs(600)).unwrap();
        let secondary = Secondary::new(
            InMemoryStore::new(),
            schedule,
            Arc::new(clock.clone()),
            Duration::from_millis(100),
        );
        let (_witness, handle) = Witness::new(secondary.clone(), WitnessConfig::default());
        let collect = Collect::default();
        let extractor = FieldExtractor::new(vec!["txn_id".to_string()]).unwrap();
        let forwarder = DedupForwarder::new(
            config,
            Arc::new(extractor),
            primary,
            handle,
            collect.clone(),
            collect.clone(),
            Arc::new(clock.clone()),
        )
        .with_secondary(secondary.clone())
        .recovering_from_gap(clock.now());

        Harness {
            _dir: dir,
            clock,
            collect,
            secondary,
            forwarder,
        }
    }

    #[tokio::test]
    async fn test_malformed_is_rejected() {
        let mut h = harness().await;
        let outcome = h.forwarder.handle(message("0", None, hours(100))).await.unwrap();
        assert_eq!(outcome, Outcome::Rejected(RejectReason::Malformed));
        assert_eq!(*h.collect.rejected.lock(), vec![RejectReason::Malformed]);
        assert!(h.collect.processed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_message_is_rejected() {
        let h = harness().await;
        let outcome = h
            .forwarder
            .reject_malformed(message("7", Some("42"), DateTime::<Utc>::MIN_UTC))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Rejected(RejectReason::Malformed));
        assert_eq!(*h.collect.rejected.lock(), vec![RejectReason::Malformed]);
        assert!(h.collect.processed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_processing_is_not_recorded() {
        let mut h = harness().await;
        *h.collect.fail_processing.lock() = true;
        let outcome = h
            .forwarder
            .handle(message("0", Some("42"), hours(100)))
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Failed(_)));

        *h.collect.fail_processing.lock() = false;
        let outcome = h
            .forwarder
            .handle(message("1", Some("42"), hours(100)))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Forwarded);
        assert_eq!(*h.collect.processed.lock(), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn test_recovery_consults_secondary() {
        let mut h = harness().await;
        h.secondary
            .put(&DedupKey::from("7"), hours(99))
            .await
            .unwrap();

        let outcome = h
            .forwarder
            .handle(message("0", Some("7"), hours(99)))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Rejected(RejectReason::Duplicate));

        h.secondary.store().fault_injector().set_outage(true);
        let result = h.forwarder.handle(message("1", Some("8"), hours(100))).await;
        assert!(matches!(result, Err(Error::RehydrationGap(_))));
        assert!(h.collect.processed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_ends_after_a_full_window() {
        let mut h = harness().await;
        h.secondary.store().fault_injector().set_outage(true);
        assert!(h.forwarder.is_recovering());

        h.clock.advance(chrono::Duration::hours(24));
        let outcome = h
            .forwarder
            .handle(message("0", Some("9"), h.clock.now()))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Forwarded);
        assert!(!h.forwarder.is_recovering());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_recovery_lookup_waits_for_propagation_delay() {
        let mut h = harness_with_delay(Duration::from_secs(2)).await;

        let started = Instant::now();
        let outcome = h
            .forwarder
            .handle(message("0", Some("1"), hours(100)))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Forwarded);
        assert!(started.elapsed() >= Duration::from_secs(2));

        // waited out once, later lookups go straight to the secondary store
        let started = Instant::now();
        let outcome = h
            .forwarder
            .handle(message("1", Some("2"), hours(100)))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Forwarded);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(h.forwarder.is_recovering());
    }

    #[tokio::test]
    async fn test_event_time_ahead_of_clock_is_recorded_at_event_time() {
        let mut h = harness().await;
        let ahead = hours(101);
        let outcome = h
            .forwarder
            .handle(message("0", Some("5"), ahead))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Forwarded);

        // still fresh a second short of a window after its event time
        h.clock
            .set(ahead + chrono::Duration::hours(24) - chrono::Duration::seconds(1));
        let outcome = h
            .forwarder
            .handle(message("1", Some("5"), ahead))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Rejected(RejectReason::Duplicate));
        assert_eq!(*h.collect.processed.lock(), vec!["0".to_string()]);
    }
}
