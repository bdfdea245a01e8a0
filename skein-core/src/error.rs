//! Error types for Skein core operations.
//!
//! Core errors describe validation failures of limits and configuration.
//! Protocol-level failures live in the per-crate error enums built on top.

use std::fmt;

/// The result type for core Skein operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core Skein operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An invalid argument was provided.
    InvalidArgument {
        /// The name of the argument.
        name: &'static str,
        /// Why it was invalid.
        reason: &'static str,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { name, reason } => {
                write!(f, "invalid argument '{name}': {reason}")
            }
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_display() {
        let err = Error::InvalidArgument {
            name: "max_inflight_count",
            reason: "must be positive",
        };
        assert_eq!(
            format!("{err}"),
            "invalid argument 'max_inflight_count': must be positive"
        );
    }
}
