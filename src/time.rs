//! Microsecond wall-clock timestamps.
//!
//! Record keys and in-flight bookkeeping use microseconds since the Unix
//! epoch, matching the resolution of the ack and node timeouts.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn microsecond_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_monotonic_enough() {
        let a = microsecond_timestamp();
        let b = microsecond_timestamp();
        assert!(b >= a);
        // Sanity: after 2020, before 2100.
        assert!(a > 1_577_836_800_000_000);
        assert!(a < 4_102_444_800_000_000);
    }
}
