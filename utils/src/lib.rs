//! Shared plumbing: logging bootstrap, wall-clock helpers, test setup.

use time::OffsetDateTime;

pub mod logging;
pub mod test_utils;

/// Current wall-clock time as unix seconds.
///
/// All timelock arithmetic happens on unix seconds; callers that need
/// determinism take an explicit `now` instead.
pub fn now_unix() -> u64 {
    OffsetDateTime::now_utc().unix_timestamp().max(0) as u64
}

/// Unix nanoseconds, the granularity IBC timeout timestamps use.
pub fn now_unix_nanos() -> u64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos().max(0)) as u64
}
