//! Wall-clock source for all expiry math.

use chrono::Utc;

/// Current unix time in seconds.
pub fn timestamp() -> i64 {
    Utc::now().timestamp()
}
