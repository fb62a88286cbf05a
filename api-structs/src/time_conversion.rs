use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::time::Duration;

pub const NANOS_IN_1_MICRO: u64 = 1_000;
pub const NANOS_IN_1_MS: u64 = 1_000_000;

pub fn time_from_unix_micros(micros: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(micros / 1_000_000).ok()?;
    let nanos = u32::try_from((micros % 1_000_000) * NANOS_IN_1_MICRO).ok()?;
    Utc.timestamp_opt(secs, nanos).single()
}

pub fn time_from_unix_millis(millis: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(millis / 1_000).ok()?;
    let nanos = u32::try_from((millis % 1_000) * NANOS_IN_1_MS).ok()?;
    Utc.timestamp_opt(secs, nanos).single()
}

/// Times before the epoch clamp to 0.
pub fn time_to_unix_micros(time: DateTime<Utc>) -> u64 {
    u64::try_from(time.timestamp_micros()).unwrap_or(0)
}

pub fn duration_to_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

pub fn duration_to_nanos_i64(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// `None` for negative input.
pub fn duration_from_nanos(nanos: i64) -> Option<Duration> {
    u64::try_from(nanos).ok().map(Duration::from_nanos)
}

/// RFC3339 with nanosecond precision, the form Flux accepts as a time literal.
pub fn to_rfc3339_nanos(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[test]
fn micros_round_trip() {
    let time = time_from_unix_micros(1_600_000_000_123_456).unwrap();
    assert_eq!(time_to_unix_micros(time), 1_600_000_000_123_456);
    assert_eq!(
        to_rfc3339_nanos(time),
        "2020-09-13T12:26:40.123456000Z"
    );
}

#[test]
fn negative_durations_are_rejected() {
    assert_eq!(duration_from_nanos(-1), None);
    assert_eq!(duration_from_nanos(1_500), Some(Duration::from_nanos(1_500)));
}
