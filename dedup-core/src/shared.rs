//! Small helpers shared by the stores and the retention schedule.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Milliseconds in a [Duration], saturating at `i64::MAX`.
pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Index of the bucket of `length` that contains `timestamp_millis`. Buckets are aligned to the
/// unix epoch so every node computes the same index for the same instant.
pub(crate) fn bucket_index(timestamp_millis: i64, length: Duration) -> i64 {
    let length = duration_millis(length).max(1);
    timestamp_millis.div_euclid(length)
}

/// Start of the bucket `index` of `length`.
pub(crate) fn bucket_start(index: i64, length: Duration) -> DateTime<Utc> {
    millis_to_utc(index.saturating_mul(duration_millis(length).max(1)))
}

/// `now - window`, saturating at the earliest representable instant.
pub(crate) fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `start + window`, saturating at the latest representable instant.
pub(crate) fn window_end(start: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| start.checked_add_signed(window))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// (De)serializes [Duration] as a human readable string such as `24h` or `250ms`.
pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Same as the parent module for optional durations, `null` or absent is `None`.
    pub(crate) mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub(crate) fn serialize<S>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index_is_epoch_aligned() {
        let hour = Duration::from_secs(3600);
        assert_eq!(bucket_index(0, hour), 0);
        assert_eq!(bucket_index(3_599_999, hour), 0);
        assert_eq!(bucket_index(3_600_000, hour), 1);
        // instants before the epoch still floor
        assert_eq!(bucket_index(-1, hour), -1);
        assert_eq!(bucket_start(2, hour).timestamp_millis(), 7_200_000);
    }

    #[test]
    fn test_window_bounds_saturate() {
        let now = millis_to_utc(10 * 3_600_000);
        let hour = Duration::from_secs(3600);
        assert_eq!(window_start(now, hour).timestamp_millis(), 9 * 3_600_000);
        assert_eq!(window_end(now, hour).timestamp_millis(), 11 * 3_600_000);

        let forever = Duration::from_secs(400_000 * 365 * 24 * 3600);
        assert_eq!(window_start(now, forever), DateTime::<Utc>::MIN_UTC);
        assert_eq!(window_end(now, forever), DateTime::<Utc>::MAX_UTC);
    }
}
