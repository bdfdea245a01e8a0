//! Client-wide limits and default budgets.
//!
//! Every buffer the client keeps has an explicit maximum: the writer's memory
//! and in-flight budgets, the reader's memory grant, and the timeouts that
//! bound every blocking wait.

use std::time::Duration;

/// System-wide limits for Skein sessions.
///
/// Session settings start from these values; each can be overridden per
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Writer budgets.
    /// Maximum bytes held by a writer: pending uncompressed plus in-flight compressed.
    pub max_memory_usage: u64,
    /// Maximum number of accepted but unacknowledged messages per writer.
    pub max_inflight_count: u64,
    /// Maximum number of continuation tokens outstanding at once.
    pub max_outstanding_tokens: u32,
    /// Ready bytes that make a batching writer send before its interval elapses.
    pub batch_flush_size_bytes: u64,

    // Reader budgets.
    /// Bytes the reader grants the service for unprocessed data.
    pub max_read_memory_usage: u64,

    // Timeouts.
    /// How long a session waits for its init response.
    pub connect_timeout: Duration,
    /// How long an idle elastic worker waits before exiting.
    pub elastic_idle_timeout: Duration,

    // Compression.
    /// Default compression level passed to codecs.
    pub compression_level: i32,
}

impl Limits {
    /// Creates limits with the client's defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Writer: 20MiB memory, 100k in flight, one token at a time.
            max_memory_usage: 20 * 1024 * 1024,
            max_inflight_count: 100_000,
            max_outstanding_tokens: 1,
            batch_flush_size_bytes: 8 * 1024 * 1024,

            // Reader: 100MiB granted to the service.
            max_read_memory_usage: 100 * 1024 * 1024,

            // Timeouts: 30s connect, 100s elastic idle.
            connect_timeout: Duration::from_secs(30),
            elastic_idle_timeout: Duration::from_secs(100),

            compression_level: 4,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limit is zero where a positive value is required.
    pub fn validate(&self) -> crate::Result<()> {
        require_positive("max_memory_usage", self.max_memory_usage)?;
        require_positive("max_inflight_count", self.max_inflight_count)?;
        require_positive("max_outstanding_tokens", u64::from(self.max_outstanding_tokens))?;
        require_positive("max_read_memory_usage", self.max_read_memory_usage)?;
        require_nonzero("connect_timeout", self.connect_timeout)?;
        require_nonzero("elastic_idle_timeout", self.elastic_idle_timeout)?;
        Ok(())
    }
}

/// Checks that a budget named `name` is positive.
///
/// # Errors
/// Returns `InvalidArgument` if `value` is zero.
pub const fn require_positive(name: &'static str, value: u64) -> crate::Result<()> {
    if value == 0 {
        return Err(crate::Error::InvalidArgument {
            name,
            reason: "must be positive",
        });
    }
    Ok(())
}

/// Checks that a timeout named `name` is not zero.
///
/// # Errors
/// Returns `InvalidArgument` if `value` is zero.
pub const fn require_nonzero(name: &'static str, value: Duration) -> crate::Result<()> {
    if value.is_zero() {
        return Err(crate::Error::InvalidArgument {
            name,
            reason: "must be positive",
        });
    }
    Ok(())
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_valid() {
        let limits = Limits::new();
        assert!(limits.validate().is_ok());
        assert_eq!(limits.max_memory_usage, 20 * 1024 * 1024);
        assert_eq!(limits.max_inflight_count, 100_000);
    }

    #[test]
    fn test_zero_inflight_rejected() {
        let mut limits = Limits::new();
        limits.max_inflight_count = 0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_zero_idle_timeout_rejected() {
        let mut limits = Limits::new();
        limits.elastic_idle_timeout = Duration::ZERO;
        assert_eq!(
            limits.validate(),
            Err(crate::Error::InvalidArgument {
                name: "elastic_idle_timeout",
                reason: "must be positive",
            })
        );
    }

    #[test]
    fn test_require_positive_names_argument() {
        assert!(require_positive("batch", 1).is_ok());
        let err = require_positive("batch", 0).unwrap_err();
        assert_eq!(err.to_string(), "invalid argument 'batch': must be positive");
        assert!(require_nonzero("timeout", Duration::ZERO).is_err());
    }
}
