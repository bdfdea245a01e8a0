//! Strongly-typed identifiers for Skein entities.
//!
//! Explicit types prevent bugs from mixing up IDs. All IDs are 64-bit.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `PartitionId` with `PartitionSessionId`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

// Partition identification.
define_id!(PartitionId, "partition", "Identifier of a partition within a topic.");
define_id!(
    PartitionSessionId,
    "ps",
    "Identifier of a partition session, unique within one read session."
);

// Session identification (assigned by the service on init).
define_id!(ReadSessionId, "rs", "Server-assigned identifier of a read session.");
define_id!(WriteSessionId, "ws", "Server-assigned identifier of a write session.");

// Log positions.
define_id!(Offset, "off", "Position of a message within a partition's log.");

impl Offset {
    /// Returns the distance from `self` to `end`, or zero if `end` is not after `self`.
    #[inline]
    #[must_use]
    pub const fn distance_to(self, end: Self) -> u64 {
        end.0.saturating_sub(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_type_safety() {
        let partition = PartitionId::new(1);
        let session = PartitionSessionId::new(1);

        // Same raw value, different types.
        assert_eq!(partition.get(), session.get());
    }

    #[test]
    fn test_id_display() {
        let id = PartitionSessionId::new(42);
        assert_eq!(format!("{id}"), "ps-42");
        assert_eq!(format!("{id:?}"), "ps(42)");
    }

    #[test]
    fn test_offset_next_and_distance() {
        let start = Offset::new(10);
        assert_eq!(start.next().get(), 11);
        assert_eq!(start.distance_to(Offset::new(20)), 10);
        assert_eq!(Offset::new(20).distance_to(start), 0);
    }

    #[test]
    #[should_panic(expected = "ID overflow")]
    fn test_id_overflow_panics() {
        let id = Offset::new(u64::MAX);
        let _ = id.next();
    }
}
