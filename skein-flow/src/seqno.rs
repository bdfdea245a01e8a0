//! Sequence number assignment and local deduplication.

use crate::{FlowError, FlowResult};

/// How a write session numbers its messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqNoMode {
    /// No message accepted yet.
    Unknown,
    /// The client assigns `last + 1` to each message.
    Auto,
    /// The application supplies every sequence number.
    Explicit,
}

impl SeqNoMode {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Auto => "automatic",
            Self::Explicit => "explicit",
        }
    }
}

/// Result of assigning a sequence number to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assigned {
    /// The message's sequence number.
    pub seq_no: u64,
    /// True if the number is not above every earlier one; the message is
    /// resolved locally as already written.
    pub duplicate: bool,
}

/// Tracks the highest accepted sequence number of a write session.
#[derive(Debug, Clone)]
pub struct SeqNoTracker {
    mode: SeqNoMode,
    last: Option<u64>,
    validate: bool,
}

impl SeqNoTracker {
    /// Creates a tracker. With `validate` off neither mixing nor duplicates
    /// are checked; the service deduplicates instead.
    #[must_use]
    pub const fn new(validate: bool) -> Self {
        Self {
            mode: SeqNoMode::Unknown,
            last: None,
            validate,
        }
    }

    /// Returns the numbering mode established so far.
    #[must_use]
    pub const fn mode(&self) -> SeqNoMode {
        self.mode
    }

    /// Returns the highest accepted sequence number.
    #[must_use]
    pub const fn last(&self) -> Option<u64> {
        self.last
    }

    /// Assigns a sequence number to the next message.
    ///
    /// # Errors
    /// Returns `MixedSeqNo` if validation is on and the message's numbering
    /// mode differs from earlier messages.
    pub fn assign(&mut self, explicit: Option<u64>) -> FlowResult<Assigned> {
        let attempted = if explicit.is_some() {
            SeqNoMode::Explicit
        } else {
            SeqNoMode::Auto
        };
        if self.validate && self.mode != SeqNoMode::Unknown && self.mode != attempted {
            return Err(FlowError::MixedSeqNo {
                established: self.mode.as_str(),
                attempted: attempted.as_str(),
            });
        }
        if self.mode == SeqNoMode::Unknown {
            self.mode = attempted;
        }

        match explicit {
            Some(seq_no) => {
                let duplicate = self.validate && self.last.is_some_and(|last| seq_no <= last);
                if !duplicate {
                    self.last = Some(self.last.map_or(seq_no, |last| last.max(seq_no)));
                }
                Ok(Assigned { seq_no, duplicate })
            }
            None => {
                let seq_no = self.last.map_or(1, |last| last + 1);
                self.last = Some(seq_no);
                Ok(Assigned {
                    seq_no,
                    duplicate: false,
                })
            }
        }
    }

    /// Records the last sequence number the service has seen, reported on init.
    pub fn observe_server_last(&mut self, last: u64) {
        self.last = Some(self.last.map_or(last, |current| current.max(last)));
    }

    /// Forces the highest accepted sequence number, used when renumbering.
    pub(crate) fn reset_last(&mut self, last: u64) {
        self.last = Some(last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_numbers_increase() {
        let mut tracker = SeqNoTracker::new(true);
        tracker.observe_server_last(41);
        assert_eq!(tracker.assign(None).unwrap().seq_no, 42);
        assert_eq!(tracker.assign(None).unwrap().seq_no, 43);
        assert_eq!(tracker.mode(), SeqNoMode::Auto);
    }

    #[test]
    fn test_explicit_duplicates_detected() {
        let mut tracker = SeqNoTracker::new(true);
        assert!(!tracker.assign(Some(1)).unwrap().duplicate);
        assert!(!tracker.assign(Some(5)).unwrap().duplicate);
        assert!(tracker.assign(Some(3)).unwrap().duplicate);
        assert!(tracker.assign(Some(5)).unwrap().duplicate);
        assert_eq!(tracker.last(), Some(5));
    }

    #[test]
    fn test_mixing_rejected_when_validating() {
        let mut tracker = SeqNoTracker::new(true);
        tracker.assign(Some(1)).unwrap();
        assert_eq!(
            tracker.assign(None),
            Err(FlowError::MixedSeqNo {
                established: "explicit",
                attempted: "automatic"
            })
        );
    }

    #[test]
    fn test_no_validation_allows_mixing_and_repeats() {
        let mut tracker = SeqNoTracker::new(false);
        tracker.assign(Some(10)).unwrap();
        assert!(!tracker.assign(Some(3)).unwrap().duplicate);
        assert_eq!(tracker.assign(None).unwrap().seq_no, 11);
    }
}
