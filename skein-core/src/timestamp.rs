//! Wall-clock timestamps carried by messages.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
///
/// Used for message creation time, server write time and the write-time high
/// watermark of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The Unix epoch; used as "no timestamp known".
    pub const ZERO: Self = Self(0);

    /// Creates a timestamp from milliseconds since the Unix epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the Unix epoch.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Returns the current time as a timestamp.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Millisecond timestamps fit in u64 for eons.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Returns how far `self` lies behind `later`, saturating at zero.
    #[must_use]
    pub const fn lag_behind(self, later: Self) -> Duration {
        Duration::from_millis(later.0.saturating_sub(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_after_epoch() {
        assert!(Timestamp::now() > Timestamp::ZERO);
    }

    #[test]
    fn test_lag_saturates() {
        let early = Timestamp::from_millis(1_000);
        let late = Timestamp::from_millis(1_500);
        assert_eq!(early.lag_behind(late), Duration::from_millis(500));
        assert_eq!(late.lag_behind(early), Duration::ZERO);
    }
}
