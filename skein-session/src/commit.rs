//! Deferred commits: collect offset ranges, send them in one go.
//!
//! Nothing is sent until [`DeferredCommit::commit`]. Ranges are merged per
//! partition session and sent as one request per read session:
//!
//! ```text
//!   add [0,10)  add [10,20)  add [30,40)         commit()
//!   ───────────────────────────────────▶  CommitOffsetRequest { [0,20), [30,40) }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use skein_core::{Offset, PartitionSessionId};
use tracing::debug;

use crate::error::SessionResult;
use crate::partition_session::PartitionSession;
use crate::protocol::CommitRange;
use crate::read_event::{CompressedMessage, DataReceivedEvent, Message};

struct Pending {
    session: Arc<PartitionSession>,
    ranges: Vec<(Offset, Offset)>,
}

/// Accumulates commits until [`commit`](Self::commit) is called.
#[derive(Default)]
pub struct DeferredCommit {
    pending: HashMap<PartitionSessionId, Pending>,
}

impl DeferredCommit {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one message.
    pub fn add_message(&mut self, message: &Message) {
        self.add_offset(message.partition_session(), message.offset());
    }

    /// Adds one compressed message.
    pub fn add_compressed_message(&mut self, message: &CompressedMessage) {
        self.add_offset(message.partition_session(), message.info.offset);
    }

    /// Adds every message of a data event.
    pub fn add_event(&mut self, event: &DataReceivedEvent) {
        if let Some((start, end)) = event.offset_range() {
            self.add_range(event.partition_session(), start, end);
        }
    }

    /// Adds the single offset `offset`.
    pub fn add_offset(&mut self, session: &Arc<PartitionSession>, offset: Offset) {
        self.add_range(session, offset, offset.next());
    }

    /// Adds `[start, end)`. Empty ranges are ignored.
    pub fn add_range(&mut self, session: &Arc<PartitionSession>, start: Offset, end: Offset) {
        if end <= start {
            return;
        }
        self.pending
            .entry(session.id())
            .or_insert_with(|| Pending {
                session: Arc::clone(session),
                ranges: Vec::new(),
            })
            .ranges
            .push((start, end));
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns the number of ranges pending, before merging.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.values().map(|pending| pending.ranges.len()).sum()
    }

    /// Sends every pending range and clears the accumulator.
    ///
    /// Sessions that closed meanwhile are skipped.
    ///
    /// # Errors
    /// Returns `ContractViolation` if a partition session was never confirmed;
    /// nothing is sent and the pending ranges are kept. Otherwise returns the
    /// first transport error, after attempting every read session.
    pub fn commit(&mut self) -> SessionResult<()> {
        for pending in self.pending.values() {
            pending.session.ensure_committable()?;
        }

        let mut by_reader: BTreeMap<u64, (Arc<PartitionSession>, Vec<CommitRange>)> =
            BTreeMap::new();
        for (_, pending) in self.pending.drain() {
            let session = pending.session;
            for (start, end) in merge_ranges(pending.ranges) {
                let Some(range) = session.claim_range(start, end)? else {
                    continue;
                };
                by_reader
                    .entry(session.session_key())
                    .or_insert_with(|| (Arc::clone(&session), Vec::new()))
                    .1
                    .push(range);
            }
        }

        let mut first_error = None;
        for (_, (session, ranges)) in by_reader {
            let sent = session.control().and_then(|control| {
                debug!(ranges = ranges.len(), "Sending deferred commit");
                control.send_commit(ranges)
            });
            if let Err(e) = sent {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for DeferredCommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredCommit")
            .field("partition_sessions", &self.pending.len())
            .field("ranges", &self.len())
            .finish()
    }
}

/// Sorts and merges overlapping or adjacent ranges.
fn merge_ranges(mut ranges: Vec<(Offset, Offset)>) -> Vec<(Offset, Offset)> {
    ranges.sort_unstable();
    let mut merged: Vec<(Offset, Offset)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::partition_session::tests::{session_with, RecordingControl};

    fn off(n: u64) -> Offset {
        Offset::new(n)
    }

    #[test]
    fn test_merge_adjacent_and_overlapping() {
        let merged = merge_ranges(vec![
            (off(10), off(20)),
            (off(0), off(10)),
            (off(30), off(40)),
            (off(35), off(50)),
        ]);
        assert_eq!(merged, vec![(off(0), off(20)), (off(30), off(50))]);
    }

    #[test]
    fn test_commit_sends_one_merged_request() {
        let control = Arc::new(RecordingControl::default());
        let first = session_with(&control, 1);
        let second = session_with(&control, 2);
        first.activate(None, None).unwrap();
        second.activate(None, None).unwrap();

        let mut commit = DeferredCommit::new();
        commit.add_range(&first, off(0), off(10));
        commit.add_range(&first, off(10), off(20));
        commit.add_offset(&second, off(4));
        assert_eq!(commit.len(), 3);
        // Nothing leaves before commit().
        assert!(control.commits.lock().is_empty());

        commit.commit().unwrap();
        assert!(commit.is_empty());

        let commits = control.commits.lock();
        assert_eq!(commits.len(), 1);
        let mut ranges: Vec<_> = commits[0]
            .iter()
            .map(|r| (r.partition_session_id.get(), r.start.get(), r.end.get()))
            .collect();
        ranges.sort_unstable();
        assert_eq!(ranges, vec![(1, 0, 20), (2, 4, 5)]);
    }

    #[test]
    fn test_unconfirmed_session_keeps_pending() {
        let control = Arc::new(RecordingControl::default());
        let session = session_with(&control, 1);

        let mut commit = DeferredCommit::new();
        commit.add_offset(&session, off(1));
        assert!(matches!(
            commit.commit(),
            Err(SessionError::ContractViolation { .. })
        ));
        assert_eq!(commit.len(), 1);
        assert!(control.commits.lock().is_empty());
    }

    #[test]
    fn test_reusable_after_commit() {
        let control = Arc::new(RecordingControl::default());
        let session = session_with(&control, 1);
        session.activate(None, None).unwrap();

        let mut commit = DeferredCommit::new();
        commit.add_offset(&session, off(0));
        commit.commit().unwrap();
        commit.add_offset(&session, off(1));
        commit.commit().unwrap();
        // Empty commit sends nothing.
        commit.commit().unwrap();

        assert_eq!(control.commits.lock().len(), 2);
    }
}
