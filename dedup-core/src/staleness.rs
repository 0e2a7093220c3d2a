//! Staleness Guard. A message older than the retention window may have had its history evicted
//! from both stores, so "not found" no longer means "not seen". Such messages are rejected
//! explicitly instead of being under-protected.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::message::Message;
use crate::shared::duration_millis;

/// Returns true iff `now - event_time > window`.
pub fn is_stale(event_time: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    (now - event_time).num_milliseconds() > duration_millis(window)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Older than the retention window.
    Stale { age: chrono::Duration },
    /// Event time is ahead of `now` by more than the clock skew tolerance. The message still passes.
    AheadOfClock { ahead: chrono::Duration },
}

#[derive(Debug, Clone, Copy)]
pub struct StalenessGuard {
    retention_window: Duration,
    clock_skew_tolerance: Duration,
}

impl StalenessGuard {
    pub fn new(retention_window: Duration, clock_skew_tolerance: Duration) -> Self {
        Self {
            retention_window,
            clock_skew_tolerance,
        }
    }

    pub fn retention_window(&self) -> Duration {
        self.retention_window
    }

    pub fn check(&self, message: &Message, now: DateTime<Utc>) -> Freshness {
        if is_stale(message.event_time, now, self.retention_window) {
            return Freshness::Stale {
                age: now - message.event_time,
            };
        }

        let ahead = message.event_time - now;
        if ahead.num_milliseconds() > duration_millis(self.clock_skew_tolerance) {
            warn!(
                offset = %message.offset,
                event_time = %message.event_time,
                %now,
                ahead_ms = ahead.num_milliseconds(),
                "Event time is beyond the clock skew tolerance, accepting"
            );
            return Freshness::AheadOfClock { ahead };
        }

        Freshness::Fresh
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn at(event_time: DateTime<Utc>) -> Message {
        Message {
            event_time,
            ..Default::default()
        }
    }

    #[test]
    fn test_is_stale_boundary() {
        let now = Utc.timestamp_millis_opt(100 * 3_600_000).unwrap();
        let window = 24 * HOUR;

        assert!(!is_stale(now, now, window));
        // exactly on the boundary is still inside the window
        assert!(!is_stale(now - chrono::Duration::hours(24), now, window));
        assert!(is_stale(
            now - chrono::Duration::hours(24) - chrono::Duration::milliseconds(1),
            now,
            window
        ));
        assert!(is_stale(now - chrono::Duration::hours(30), now, window));
    }

    #[test]
    fn test_guard_future_event_time() {
        let guard = StalenessGuard::new(24 * HOUR, Duration::from_secs(5));
        let now = Utc.timestamp_millis_opt(100 * 3_600_000).unwrap();

        // within tolerance
        assert_eq!(
            guard.check(&at(now + chrono::Duration::seconds(3)), now),
            Freshness::Fresh
        );

        // beyond tolerance is flagged, not rejected
        let checked = guard.check(&at(now + chrono::Duration::minutes(2)), now);
        assert_eq!(
            checked,
            Freshness::AheadOfClock {
                ahead: chrono::Duration::minutes(2)
            }
        );
    }

    #[test]
    fn test_guard_stale() {
        let guard = StalenessGuard::new(24 * HOUR, Duration::from_secs(5));
        let now = Utc.timestamp_millis_opt(100 * 3_600_000).unwrap();

        assert_eq!(
            guard.check(&at(now - chrono::Duration::hours(30)), now),
            Freshness::Stale {
                age: chrono::Duration::hours(30)
            }
        );
        assert_eq!(
            guard.check(&at(now - chrono::Duration::hours(1)), now),
            Freshness::Fresh
        );
    }
}
