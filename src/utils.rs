//! # Shared Utility Helpers
//!
//! Small helpers used across the endpoint, transport, and scheduler modules
//! that don't belong to any one of them specifically.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as nanoseconds since the Unix epoch, for log correlation and
/// diagnostic timestamps (monotonic scheduling uses `std::time::Instant`
/// instead; this is only for human-facing output).
///
/// Returns 0 if the system clock is set before the epoch rather than
/// panicking.
pub fn current_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_timestamp_ns_is_nonzero() {
        assert!(current_timestamp_ns() > 0);
    }
}
