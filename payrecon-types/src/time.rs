//! Saturating arithmetic between `chrono` timestamps and `std` durations.
//!
//! Configuration values are `std::time::Duration` while persisted timestamps
//! are `chrono::DateTime<Utc>`; these helpers bridge the two without panicking
//! on out-of-range values.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// `at + duration`, clamped to the latest representable timestamp.
pub fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - duration`, clamped to the earliest representable timestamp.
pub fn sub_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
