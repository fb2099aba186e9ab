//! Time and timestamp helpers.

use chrono::{DateTime, Utc};

/// UTC timestamp used for cache stamps, session starts, and last-seen times.
pub type Timestamp = DateTime<Utc>;

/// Return the current UTC time.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now()
}

/// Format a second count as `MM:SS`.
///
/// Minutes are not wrapped into hours, so a four-hour countdown reads
/// `240:00`.
#[must_use]
pub fn format_mm_ss(total_seconds: u32) -> String {
    format!("{:02}:{:02}", total_seconds / 60, total_seconds % 60)
}
