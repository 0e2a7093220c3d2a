//! Rotating Retention Manager. Runs as its own task, on a fixed interval it promotes the generation
//! that `now` falls into to current and deletes every generation the schedule reports as retired.
//! Work per tick is proportional to the number of generations, never to the number of keys.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::clock::Clock;
use crate::retention::{GenerationId, GenerationSchedule};
use crate::secondary::SecondaryStore;

/// What a single rotation pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    pub current: GenerationId,
    /// Whether `current` changed during this pass.
    pub promoted: bool,
    pub dropped: Vec<GenerationId>,
}

pub struct RetentionManager<S> {
    store: S,
    schedule: GenerationSchedule,
    clock: Arc<dyn Clock>,
    check_interval: Duration,
    current: Option<GenerationId>,
}

impl<S: SecondaryStore> RetentionManager<S> {
    pub fn new(
        store: S,
        schedule: GenerationSchedule,
        clock: Arc<dyn Clock>,
        check_interval: Duration,
    ) -> Self {
        Self {
            store,
            schedule,
            clock,
            check_interval,
            current: None,
        }
    }

    pub fn current(&self) -> Option<GenerationId> {
        self.current
    }

    /// Promotes the current generation and deletes retired ones. A failure leaves the remaining
    /// retired generations in place for the next pass.
    pub async fn rotate(&mut self) -> Result<Rotation> {
        let now = self.clock.now();
        let current = self.schedule.generation_of(now);

        let promoted = self.current != Some(current);
        if promoted {
            info!(
                previous = ?self.current,
                %current,
                live = ?self.schedule.live_generations(now),
                "Promoted secondary generation"
            );
            self.current = Some(current);
        }

        let mut dropped = Vec::new();
        for generation in self.store.generations().await? {
            if !self.schedule.is_retired(generation, now) {
                continue;
            }
            self.store.drop_generation(generation).await?;
            info!(
                %generation,
                ended_at = %self.schedule.end_of(generation),
                "Deleted retired secondary generation"
            );
            dropped.push(generation);
        }

        Ok(Rotation {
            current,
            promoted,
            dropped,
        })
    }

    /// Rotates on every `check_interval` tick until cancelled. Secondary store errors are logged
    /// and retried on the next tick, they never stop the task.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Retention manager stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.rotate().await {
                        warn!(error = ?e, "Secondary generation rotation failed, retrying on next tick");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::clock::ManualClock;
    use crate::message::DedupKey;
    use crate::secondary::in_memory_store::InMemoryStore;

    const HOUR: Duration = Duration::from_secs(3600);

    fn hours(h: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(h * 3_600_000).unwrap()
    }

    fn manager(store: &InMemoryStore, clock: &ManualClock) -> RetentionManager<InMemoryStore> {
        let schedule = GenerationSchedule::new(24 * HOUR, 3, Duration::from_secs(600)).unwrap();
        RetentionManager::new(
            store.clone(),
            schedule,
            Arc::new(clock.clone()),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_rotation_drops_only_retired_generations() {
        let store = InMemoryStore::new();
        for g in 5..=9 {
            store
                .put(&DedupKey::from(format!("k{g}")), GenerationId(g))
                .await
                .unwrap();
        }

        // now = 110h, window start = 86h; generation 6 = [72h, 84h) is retired, 7 = [84h, 96h) is live
        let clock = ManualClock::new(hours(110));
        let mut manager = manager(&store, &clock);

        let rotation = manager.rotate().await.unwrap();
        assert_eq!(rotation.current, GenerationId(9));
        assert!(rotation.promoted);
        assert_eq!(rotation.dropped, vec![GenerationId(5), GenerationId(6)]);
        assert_eq!(
            store.generations().await.unwrap(),
            vec![GenerationId(7), GenerationId(8), GenerationId(9)]
        );

        // same generation, nothing new to drop
        clock.advance(chrono::Duration::hours(1));
        let rotation = manager.rotate().await.unwrap();
        assert!(!rotation.promoted);
        assert!(rotation.dropped.is_empty());

        // crossing 120h promotes generation 10; generation 7 needs now >= 96h + 10m + 24h
        clock.set(hours(120) + chrono::Duration::minutes(10));
        let rotation = manager.rotate().await.unwrap();
        assert_eq!(rotation.current, GenerationId(10));
        assert!(rotation.promoted);
        assert_eq!(rotation.dropped, vec![GenerationId(7)]);
    }

    #[tokio::test]
    async fn test_run_survives_outage() {
        let store = InMemoryStore::new();
        store.put(&DedupKey::from("old"), GenerationId(1)).await.unwrap();
        store.fault_injector().set_outage(true);

        let clock = ManualClock::new(hours(110));
        let manager = manager(&store, &clock);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(manager.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.fault_injector().set_outage(false);
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        handle.await.unwrap();
        assert!(store.generations().await.unwrap().is_empty());
    }
}
