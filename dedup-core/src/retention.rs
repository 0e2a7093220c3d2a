//! Deterministic expiry for the secondary store. Instead of sampling per-key TTLs, keys are written
//! into epoch-aligned generations of length `span = retention_window / (generations - 1)` and whole
//! generations are deleted once their entire span has left the retention window.
//!
//! ```text
//!   retention window W, generations = 3, span = W/2
//!
//!   |---- g-2 ----|---- g-1 ----|----- g -----|
//!          [ now - W ..................... now ]
//!   live: g-2, g-1, g           (g-2 is deleted once its end + margin <= now - W)
//! ```
//!
//! A key recorded within `overlap_margin` of the end of its generation is double-written into the
//! next generation as well, so a witness write racing a rotation is never lost.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::Result;
use crate::shared::{bucket_index, bucket_start, duration_millis, window_start};

/// Longest supported retention window, about a century.
pub const MAX_RETENTION_WINDOW: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Rotation task that promotes generations and deletes retired ones.
pub mod manager;

/// Index of a generation, `floor(event_time / span)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationId(pub i64);

impl GenerationId {
    pub fn next(self) -> Self {
        GenerationId(self.0.saturating_add(1))
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationSchedule {
    retention_window: Duration,
    span: Duration,
    overlap_margin: Duration,
}

impl GenerationSchedule {
    pub fn new(
        retention_window: Duration,
        generations: u32,
        overlap_margin: Duration,
    ) -> Result<Self> {
        if retention_window.is_zero() {
            return Err(Error::Config("retention window must be positive".to_string()));
        }
        if retention_window > MAX_RETENTION_WINDOW {
            return Err(Error::Config(format!(
                "retention window {retention_window:?} exceeds the maximum of {MAX_RETENTION_WINDOW:?}"
            )));
        }
        if generations < 2 {
            return Err(Error::Config(format!(
                "at least 2 secondary generations are required, got {generations}"
            )));
        }
        let span = retention_window / (generations - 1);
        if span.is_zero() {
            return Err(Error::Config(format!(
                "retention window {retention_window:?} is too short for {generations} generations"
            )));
        }
        if overlap_margin >= span {
            return Err(Error::Config(format!(
                "generation overlap margin {overlap_margin:?} must be shorter than the generation span {span:?}"
            )));
        }
        Ok(Self {
            retention_window,
            span,
            overlap_margin,
        })
    }

    /// Length of one generation, also the rotation interval.
    pub fn span(&self) -> Duration {
        self.span
    }

    pub fn retention_window(&self) -> Duration {
        self.retention_window
    }

    pub fn generation_of(&self, at: DateTime<Utc>) -> GenerationId {
        GenerationId(bucket_index(at.timestamp_millis(), self.span))
    }

    pub fn start_of(&self, generation: GenerationId) -> DateTime<Utc> {
        bucket_start(generation.0, self.span)
    }

    pub fn end_of(&self, generation: GenerationId) -> DateTime<Utc> {
        bucket_start(generation.0.saturating_add(1), self.span)
    }

    /// Generations a key recorded at `recorded_at` is written into: its own, plus the next one when
    /// it falls within the overlap margin of the rotation boundary.
    pub fn write_targets(&self, recorded_at: DateTime<Utc>) -> Vec<GenerationId> {
        let current = self.generation_of(recorded_at);
        let until_rotation = self.end_of(current).timestamp_millis() - recorded_at.timestamp_millis();
        if until_rotation <= duration_millis(self.overlap_margin) {
            vec![current, current.next()]
        } else {
            vec![current]
        }
    }

    /// Generations whose union covers `[now - retention_window, now]`, oldest first.
    pub fn live_generations(&self, now: DateTime<Utc>) -> Vec<GenerationId> {
        let oldest = self.generation_of(self.window_start(now));
        let newest = self.generation_of(now);
        (oldest.0..=newest.0).map(GenerationId).collect()
    }

    /// Generations that may hold a key whose message carries `event_time`: the live generations,
    /// extended up to the generation of `event_time` when it is ahead of `now`.
    pub fn lookup_generations(
        &self,
        now: DateTime<Utc>,
        event_time: DateTime<Utc>,
    ) -> Vec<GenerationId> {
        let oldest = self.generation_of(self.window_start(now));
        let newest = self.generation_of(now.max(event_time));
        (oldest.0..=newest.0).map(GenerationId).collect()
    }

    /// A generation may be deleted once its whole span, plus the overlap margin, is older than
    /// the retention window.
    pub fn is_retired(&self, generation: GenerationId, now: DateTime<Utc>) -> bool {
        let end = self.end_of(generation).timestamp_millis();
        end.saturating_add(duration_millis(self.overlap_margin))
            <= self.window_start(now).timestamp_millis()
    }

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        window_start(now, self.retention_window)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn hours(h: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(h * 3_600_000).unwrap()
    }

    fn schedule() -> GenerationSchedule {
        GenerationSchedule::new(24 * HOUR, 3, Duration::from_secs(600)).unwrap()
    }

    #[test]
    fn test_span_and_generation_of() {
        let schedule = schedule();
        assert_eq!(schedule.span(), 12 * HOUR);
        assert_eq!(schedule.generation_of(hours(0)), GenerationId(0));
        assert_eq!(schedule.generation_of(hours(11)), GenerationId(0));
        assert_eq!(schedule.generation_of(hours(12)), GenerationId(1));
        assert_eq!(schedule.start_of(GenerationId(2)), hours(24));
        assert_eq!(schedule.end_of(GenerationId(2)), hours(36));
    }

    #[test]
    fn test_write_targets_double_write_near_boundary() {
        let schedule = schedule();
        assert_eq!(schedule.write_targets(hours(100)), vec![GenerationId(8)]);

        // 5 minutes before the rotation at 108h
        let near = hours(108) - chrono::Duration::minutes(5);
        assert_eq!(
            schedule.write_targets(near),
            vec![GenerationId(8), GenerationId(9)]
        );

        // exactly on the boundary belongs to the next generation only
        assert_eq!(schedule.write_targets(hours(108)), vec![GenerationId(9)]);
    }

    #[test]
    fn test_live_generations_cover_window() {
        let schedule = schedule();
        // sweep across several rotations in 7 minute steps
        let mut now = hours(200);
        while now < hours(260) {
            let live = schedule.live_generations(now);
            assert!(live.len() >= 2 && live.len() <= 3, "{live:?} at {now}");

            let first = *live.first().unwrap();
            let last = *live.last().unwrap();
            assert!(schedule.start_of(first) <= now - chrono::Duration::hours(24));
            assert!(schedule.end_of(last) > now);
            // contiguous
            for pair in live.windows(2) {
                assert_eq!(pair[0].next(), pair[1]);
            }
            // nothing live is ever deletable
            for g in &live {
                assert!(!schedule.is_retired(*g, now));
            }
            now += chrono::Duration::minutes(7);
        }
    }

    #[test]
    fn test_is_retired_waits_for_span_and_margin() {
        let schedule = schedule();
        // generation 0 spans [0h, 12h), retired once 12h + 10m <= now - 24h
        assert!(!schedule.is_retired(GenerationId(0), hours(36)));
        assert!(!schedule.is_retired(
            GenerationId(0),
            hours(36) + chrono::Duration::minutes(9)
        ));
        assert!(schedule.is_retired(
            GenerationId(0),
            hours(36) + chrono::Duration::minutes(10)
        ));
    }

    #[test]
    fn test_two_generations() {
        let schedule = GenerationSchedule::new(24 * HOUR, 2, Duration::from_secs(60)).unwrap();
        assert_eq!(schedule.span(), 24 * HOUR);
        assert_eq!(
            schedule.live_generations(hours(30)),
            vec![GenerationId(0), GenerationId(1)]
        );
    }

    #[test]
    fn test_invalid_schedules() {
        assert!(GenerationSchedule::new(24 * HOUR, 1, Duration::ZERO).is_err());
        assert!(GenerationSchedule::new(Duration::ZERO, 3, Duration::ZERO).is_err());
        assert!(GenerationSchedule::new(24 * HOUR, 3, 12 * HOUR).is_err());
        assert!(
            GenerationSchedule::new(MAX_RETENTION_WINDOW + HOUR, 3, Duration::ZERO).is_err()
        );
    }

    #[test]
    fn test_lookup_generations_reach_future_event_time() {
        let schedule = schedule();
        // generation 8 is [96h, 108h)
        assert_eq!(
            schedule.lookup_generations(hours(107), hours(100)),
            schedule.live_generations(hours(107))
        );
        assert_eq!(
            schedule.lookup_generations(hours(107), hours(109)),
            vec![GenerationId(6), GenerationId(7), GenerationId(8), GenerationId(9)]
        );
    }
}
