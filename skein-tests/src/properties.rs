//! Property checkers for session scenarios.
//!
//! Checkers observe what a session delivered and report the first broken
//! invariant as a [`PropertyViolation`].

use std::collections::{HashMap, HashSet};

use skein_core::{Offset, PartitionSessionId};
use skein_session::{ReadSessionEvent, WriteAck};

// ============================================================================
// Property Violation Types
// ============================================================================

/// A broken session invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyViolation {
    /// A write was resolved out of submission order.
    AckOutOfOrder {
        /// Sequence number expected next.
        expected: u64,
        /// Sequence number resolved instead.
        actual: u64,
    },
    /// A write was never resolved.
    MissingAck {
        /// The unresolved sequence number.
        seq_no: u64,
    },
    /// A write was resolved more than once.
    ExtraAck {
        /// The sequence number resolved again.
        seq_no: u64,
    },
    /// Data arrived for a partition session the application had not confirmed.
    DataBeforeConfirm {
        /// The partition session.
        partition_session_id: PartitionSessionId,
    },
    /// Data arrived for a closed partition session.
    DataAfterClose {
        /// The partition session.
        partition_session_id: PartitionSessionId,
    },
    /// Offsets of a partition session did not strictly increase.
    OffsetRegression {
        /// The partition session.
        partition_session_id: PartitionSessionId,
        /// Highest offset seen before.
        previous: Offset,
        /// Offset that broke the order.
        offset: Offset,
    },
}

impl std::fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AckOutOfOrder { expected, actual } => {
                write!(f, "ack for seq_no {actual} while {expected} was next")
            }
            Self::MissingAck { seq_no } => write!(f, "seq_no {seq_no} never resolved"),
            Self::ExtraAck { seq_no } => write!(f, "seq_no {seq_no} resolved twice"),
            Self::DataBeforeConfirm {
                partition_session_id,
            } => write!(f, "data for {partition_session_id} before confirmation"),
            Self::DataAfterClose {
                partition_session_id,
            } => write!(f, "data for {partition_session_id} after close"),
            Self::OffsetRegression {
                partition_session_id,
                previous,
                offset,
            } => write!(
                f,
                "offset {offset} of {partition_session_id} after {previous}"
            ),
        }
    }
}

// ============================================================================
// Write Properties
// ============================================================================

/// Checks that `acks` resolve `submitted` exactly once each, in order.
///
/// # Errors
/// Returns the first violation found.
pub fn check_acks(submitted: &[u64], acks: &[WriteAck]) -> Result<(), PropertyViolation> {
    let mut expected = submitted.iter();
    for ack in acks {
        match expected.next() {
            Some(&seq_no) if seq_no == ack.seq_no => {}
            Some(&seq_no) => {
                return Err(PropertyViolation::AckOutOfOrder {
                    expected: seq_no,
                    actual: ack.seq_no,
                })
            }
            None => return Err(PropertyViolation::ExtraAck { seq_no: ack.seq_no }),
        }
    }
    match expected.next() {
        Some(&seq_no) => Err(PropertyViolation::MissingAck { seq_no }),
        None => Ok(()),
    }
}

// ============================================================================
// Read Properties
// ============================================================================

/// Watches read session events for ordering and confirmation violations.
#[derive(Debug, Default)]
pub struct ReadObserver {
    confirmed: HashSet<PartitionSessionId>,
    closed: HashSet<PartitionSessionId>,
    last_offset: HashMap<PartitionSessionId, Offset>,
    delivered: HashMap<PartitionSessionId, Vec<u64>>,
    violations: Vec<PropertyViolation>,
}

impl ReadObserver {
    /// Creates an observer that has seen nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the application confirmed `id`.
    pub fn mark_confirmed(&mut self, id: PartitionSessionId) {
        self.confirmed.insert(id);
    }

    /// Checks one event.
    pub fn observe(&mut self, event: &ReadSessionEvent) {
        match event {
            ReadSessionEvent::DataReceived(data) => {
                let id = data.partition_session().id();
                if !self.confirmed.contains(&id) {
                    self.violations.push(PropertyViolation::DataBeforeConfirm {
                        partition_session_id: id,
                    });
                }
                if self.closed.contains(&id) {
                    self.violations.push(PropertyViolation::DataAfterClose {
                        partition_session_id: id,
                    });
                }
                for message in data.messages() {
                    self.record_offset(id, message.offset());
                }
                for message in data.compressed_messages() {
                    self.record_offset(id, message.info.offset);
                }
            }
            ReadSessionEvent::PartitionSessionClosed(closed) => {
                self.closed.insert(closed.partition_session().id());
            }
            _ => {}
        }
    }

    fn record_offset(&mut self, id: PartitionSessionId, offset: Offset) {
        if let Some(&previous) = self.last_offset.get(&id) {
            if offset <= previous {
                self.violations.push(PropertyViolation::OffsetRegression {
                    partition_session_id: id,
                    previous,
                    offset,
                });
            }
        }
        self.last_offset.insert(id, offset);
        self.delivered.entry(id).or_default().push(offset.get());
    }

    /// Returns the offsets delivered for `id`, in delivery order.
    #[must_use]
    pub fn delivered(&self, id: PartitionSessionId) -> &[u64] {
        self.delivered.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Returns every violation seen.
    #[must_use]
    pub fn violations(&self) -> &[PropertyViolation] {
        &self.violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_session::WriteAckState;

    fn written(seq_no: u64) -> WriteAck {
        WriteAck {
            seq_no,
            state: WriteAckState::Discarded,
        }
    }

    #[test]
    fn test_check_acks_reports_first_violation() {
        assert_eq!(check_acks(&[1, 2], &[written(1), written(2)]), Ok(()));
        assert_eq!(
            check_acks(&[1, 2], &[written(2)]),
            Err(PropertyViolation::AckOutOfOrder {
                expected: 1,
                actual: 2
            })
        );
        assert_eq!(
            check_acks(&[1, 2], &[written(1)]),
            Err(PropertyViolation::MissingAck { seq_no: 2 })
        );
        assert_eq!(
            check_acks(&[1], &[written(1), written(1)]),
            Err(PropertyViolation::ExtraAck { seq_no: 1 })
        );
    }
}
