//! Partition session state machine.
//!
//! A partition session is one partition assigned to one read session. It is
//! shared as `Arc<PartitionSession>` by the read session and by every event
//! that concerns it.
//!
//! ```text
//!                 confirm()               server stop (graceful)
//!   Requested ──────────────▶ Active ──────────────────────▶ StopRequested
//!       │                       │                                  │
//!       │ lost / conn. lost     │ lost / conn. lost                │ confirm()
//!       ▼                       ▼                                  ▼
//!     Closed ◀──────────────────┴──────────────────────────────  Closed
//! ```
//!
//! Commits advance a per-session cursor: committing offset `o` commits
//! `[cursor, o + 1)` and moves the cursor to `o + 1`.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use skein_core::{Offset, PartitionId, PartitionSessionId, Timestamp};
use tracing::debug;

use crate::error::{SessionError, SessionResult};
use crate::protocol::{CommitRange, PartitionData};
use crate::read_event::ReadBudget;

/// Why a partition session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClosedReason {
    /// The application confirmed a graceful stop.
    StopConfirmedByUser,
    /// The service revoked the partition without waiting.
    Lost,
    /// The read session lost its connection.
    ConnectionLost,
}

/// Lifecycle state of a partition session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSessionState {
    /// Announced by the service, awaiting the application's confirmation.
    Requested,
    /// Confirmed; data flows.
    Active,
    /// The service asked for a graceful stop.
    StopRequested,
    /// Closed; no further events concern this session.
    Closed(ClosedReason),
}

impl PartitionSessionState {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Active => "active",
            Self::StopRequested => "stop-requested",
            Self::Closed(_) => "closed",
        }
    }
}

/// Operations a partition session needs from its read session.
pub(crate) trait ReadControl: Send + Sync {
    /// Identifies the read session, so commits can be grouped per session.
    fn session_key(&self) -> u64;

    fn confirm_start(
        &self,
        session: &Arc<PartitionSession>,
        read_offset: Option<Offset>,
        commit_offset: Option<Offset>,
    ) -> SessionResult<()>;

    fn confirm_stop(&self, session: &Arc<PartitionSession>) -> SessionResult<()>;

    fn send_commit(&self, ranges: Vec<CommitRange>) -> SessionResult<()>;

    fn request_status(&self, session: &PartitionSession) -> SessionResult<()>;

    /// Returns consumed bytes to the service's memory grant. Bytes granted
    /// on an earlier connection are not returned.
    fn release_bytes(&self, generation: u64, bytes: u64);
}

/// Data received before the session was confirmed.
pub(crate) struct BufferedData {
    pub data: PartitionData,
    pub budget: ReadBudget,
}

struct PartitionState {
    status: PartitionSessionState,
    committed_offset: Offset,
    end_offset: Offset,
    /// Next offset not yet delivered.
    read_offset: Offset,
    /// Next offset not yet committed by this client.
    commit_cursor: Offset,
    write_time_high_watermark: Timestamp,
    buffered: Vec<BufferedData>,
}

/// One partition assigned to a read session.
pub struct PartitionSession {
    id: PartitionSessionId,
    path: String,
    partition_id: PartitionId,
    control: Weak<dyn ReadControl>,
    session_key: u64,
    state: Mutex<PartitionState>,
}

impl PartitionSession {
    pub(crate) fn new(
        id: PartitionSessionId,
        path: String,
        partition_id: PartitionId,
        committed_offset: Offset,
        end_offset: Offset,
        control: Weak<dyn ReadControl>,
        session_key: u64,
    ) -> Self {
        Self {
            id,
            path,
            partition_id,
            control,
            session_key,
            state: Mutex::new(PartitionState {
                status: PartitionSessionState::Requested,
                committed_offset,
                end_offset,
                read_offset: committed_offset,
                commit_cursor: committed_offset,
                write_time_high_watermark: Timestamp::ZERO,
                buffered: Vec::new(),
            }),
        }
    }

    /// Returns the partition session id.
    #[must_use]
    pub const fn id(&self) -> PartitionSessionId {
        self.id
    }

    /// Returns the topic path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the partition id.
    #[must_use]
    pub const fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> PartitionSessionState {
        self.state.lock().status
    }

    /// Returns the last committed offset known to the client.
    #[must_use]
    pub fn committed_offset(&self) -> Offset {
        self.state.lock().committed_offset
    }

    /// Returns one past the last message known to be in the partition.
    #[must_use]
    pub fn end_offset(&self) -> Offset {
        self.state.lock().end_offset
    }

    /// Returns the next offset not yet delivered.
    #[must_use]
    pub fn read_offset(&self) -> Offset {
        self.state.lock().read_offset
    }

    /// Asks the service for this session's status; the answer arrives as a
    /// `PartitionSessionStatus` event.
    ///
    /// # Errors
    /// Returns `InvalidState` unless the session is active, or `Closed` if
    /// the read session is gone.
    pub fn request_status(&self) -> SessionResult<()> {
        let status = self.state();
        if status != PartitionSessionState::Active {
            return Err(SessionError::InvalidState {
                current: status.as_str(),
                required: "active",
            });
        }
        self.control()?.request_status(self)
    }

    pub(crate) const fn session_key(&self) -> u64 {
        self.session_key
    }

    pub(crate) fn control(&self) -> SessionResult<Arc<dyn ReadControl>> {
        self.control.upgrade().ok_or(SessionError::Closed)
    }

    // ---- Transitions ----

    /// `Requested → Active`. Returns data buffered before confirmation.
    pub(crate) fn activate(
        &self,
        read_offset: Option<Offset>,
        commit_offset: Option<Offset>,
    ) -> SessionResult<Vec<BufferedData>> {
        let mut state = self.state.lock();
        if state.status != PartitionSessionState::Requested {
            return Err(SessionError::InvalidState {
                current: state.status.as_str(),
                required: "requested",
            });
        }
        state.status = PartitionSessionState::Active;
        if let Some(offset) = read_offset {
            state.read_offset = offset;
        }
        if let Some(offset) = commit_offset {
            state.commit_cursor = state.commit_cursor.max(offset);
        }
        debug!(partition_session_id = %self.id, "Partition session confirmed");
        Ok(std::mem::take(&mut state.buffered))
    }

    /// `Active → StopRequested`. Returns false if the session was not active.
    pub(crate) fn begin_stop(&self, committed_offset: Offset) -> bool {
        let mut state = self.state.lock();
        state.committed_offset = state.committed_offset.max(committed_offset);
        if state.status != PartitionSessionState::Active {
            return false;
        }
        state.status = PartitionSessionState::StopRequested;
        true
    }

    /// Any state → `Closed(reason)`. Returns `None` if already closed.
    ///
    /// Otherwise returns the data buffered before confirmation. Dropping it
    /// returns its bytes to the grant, which sends a message, so callers drop
    /// it after releasing their locks.
    pub(crate) fn close(&self, reason: ClosedReason) -> Option<Vec<BufferedData>> {
        let buffered = {
            let mut state = self.state.lock();
            if matches!(state.status, PartitionSessionState::Closed(_)) {
                return None;
            }
            state.status = PartitionSessionState::Closed(reason);
            std::mem::take(&mut state.buffered)
        };
        debug!(partition_session_id = %self.id, reason = ?reason, "Partition session closed");
        Some(buffered)
    }

    /// Holds data until confirmation. Returns the data back if the session
    /// is no longer waiting for confirmation.
    pub(crate) fn buffer(&self, data: BufferedData) -> Option<BufferedData> {
        let mut state = self.state.lock();
        if state.status != PartitionSessionState::Requested {
            return Some(data);
        }
        state.buffered.push(data);
        None
    }

    /// Records delivery up to `next`, returning the offset deliveries must
    /// start from. Messages below it are stale and skipped.
    pub(crate) fn advance_read(&self, next: Offset) -> Offset {
        let mut state = self.state.lock();
        let from = state.read_offset;
        state.read_offset = state.read_offset.max(next);
        from
    }

    pub(crate) fn on_committed(&self, offset: Offset) {
        let mut state = self.state.lock();
        state.committed_offset = state.committed_offset.max(offset);
    }

    pub(crate) fn on_status(
        &self,
        committed_offset: Offset,
        end_offset: Offset,
        write_time_high_watermark: Timestamp,
    ) {
        let mut state = self.state.lock();
        state.committed_offset = state.committed_offset.max(committed_offset);
        state.end_offset = state.end_offset.max(end_offset);
        state.write_time_high_watermark = state
            .write_time_high_watermark
            .max(write_time_high_watermark);
    }

    // ---- Commits ----

    /// Returns whether commits on this session are sent.
    ///
    /// # Errors
    /// Returns `ContractViolation` before the session is confirmed.
    pub(crate) fn ensure_committable(&self) -> SessionResult<bool> {
        match self.state() {
            PartitionSessionState::Requested => Err(SessionError::ContractViolation {
                reason: format!("commit on {} before it was confirmed", self.id),
            }),
            PartitionSessionState::Closed(_) => Ok(false),
            PartitionSessionState::Active | PartitionSessionState::StopRequested => Ok(true),
        }
    }

    /// Claims `[start, end)` for commit, moving the cursor past it.
    ///
    /// Returns `Ok(None)` when there is nothing to send: the session is
    /// closed or the range is empty.
    ///
    /// # Errors
    /// Returns `ContractViolation` before the session is confirmed.
    pub(crate) fn claim_range(&self, start: Offset, end: Offset) -> SessionResult<Option<CommitRange>> {
        let mut state = self.state.lock();
        match state.status {
            PartitionSessionState::Requested => {
                return Err(SessionError::ContractViolation {
                    reason: format!("commit on {} before it was confirmed", self.id),
                });
            }
            PartitionSessionState::Closed(_) => {
                debug!(partition_session_id = %self.id, "Ignoring commit on closed partition session");
                return Ok(None);
            }
            PartitionSessionState::Active | PartitionSessionState::StopRequested => {}
        }
        if end <= start {
            return Ok(None);
        }
        state.commit_cursor = state.commit_cursor.max(end);
        Ok(Some(CommitRange {
            partition_session_id: self.id,
            start,
            end,
        }))
    }

    /// Commits every offset up to and including `offset`.
    ///
    /// # Errors
    /// Returns `ContractViolation` before confirmation, or a transport error.
    pub(crate) fn commit_through(&self, offset: Offset) -> SessionResult<()> {
        let start = self.state.lock().commit_cursor;
        let Some(range) = self.claim_range(start, offset.next())? else {
            return Ok(());
        };
        self.control()?.send_commit(vec![range])
    }
}

impl fmt::Debug for PartitionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionSession")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("partition_id", &self.partition_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Control that records commits and otherwise does nothing.
    #[derive(Default)]
    pub(crate) struct RecordingControl {
        pub commits: Mutex<Vec<Vec<CommitRange>>>,
        pub released: Mutex<u64>,
    }

    impl ReadControl for RecordingControl {
        fn session_key(&self) -> u64 {
            7
        }

        fn confirm_start(
            &self,
            session: &Arc<PartitionSession>,
            read_offset: Option<Offset>,
            commit_offset: Option<Offset>,
        ) -> SessionResult<()> {
            session.activate(read_offset, commit_offset).map(drop)
        }

        fn confirm_stop(&self, session: &Arc<PartitionSession>) -> SessionResult<()> {
            session.close(ClosedReason::StopConfirmedByUser);
            Ok(())
        }

        fn send_commit(&self, ranges: Vec<CommitRange>) -> SessionResult<()> {
            self.commits.lock().push(ranges);
            Ok(())
        }

        fn request_status(&self, _session: &PartitionSession) -> SessionResult<()> {
            Ok(())
        }

        fn release_bytes(&self, _generation: u64, bytes: u64) {
            *self.released.lock() += bytes;
        }
    }

    pub(crate) fn session_with(control: &Arc<RecordingControl>, id: u64) -> Arc<PartitionSession> {
        let weak: Weak<dyn ReadControl> = Arc::downgrade(control) as Weak<dyn ReadControl>;
        Arc::new(PartitionSession::new(
            PartitionSessionId::new(id),
            "/topic".to_string(),
            PartitionId::new(id),
            Offset::new(0),
            Offset::new(100),
            weak,
            control.session_key(),
        ))
    }

    #[test]
    fn test_commit_before_confirm_is_violation() {
        let control = Arc::new(RecordingControl::default());
        let session = session_with(&control, 1);
        let result = session.commit_through(Offset::new(5));
        assert!(matches!(result, Err(SessionError::ContractViolation { .. })));
        assert!(control.commits.lock().is_empty());
    }

    #[test]
    fn test_commit_cursor_advances() {
        let control = Arc::new(RecordingControl::default());
        let session = session_with(&control, 1);
        session.activate(None, None).unwrap();

        session.commit_through(Offset::new(4)).unwrap();
        session.commit_through(Offset::new(9)).unwrap();
        // Already covered.
        session.commit_through(Offset::new(2)).unwrap();

        let commits = control.commits.lock();
        assert_eq!(commits.len(), 2);
        assert_eq!((commits[0][0].start.get(), commits[0][0].end.get()), (0, 5));
        assert_eq!((commits[1][0].start.get(), commits[1][0].end.get()), (5, 10));
    }

    #[test]
    fn test_lifecycle_transitions() {
        let control = Arc::new(RecordingControl::default());
        let session = session_with(&control, 1);
        assert_eq!(session.state(), PartitionSessionState::Requested);
        assert!(!session.begin_stop(Offset::new(0)));

        session.activate(Some(Offset::new(10)), None).unwrap();
        assert_eq!(session.state(), PartitionSessionState::Active);
        assert_eq!(session.read_offset(), Offset::new(10));
        assert!(session.activate(None, None).is_err());

        assert!(session.begin_stop(Offset::new(3)));
        assert_eq!(session.state(), PartitionSessionState::StopRequested);
        assert_eq!(session.committed_offset(), Offset::new(3));

        assert!(session.close(ClosedReason::StopConfirmedByUser).is_some());
        assert!(session.close(ClosedReason::Lost).is_none());
        assert_eq!(
            session.state(),
            PartitionSessionState::Closed(ClosedReason::StopConfirmedByUser)
        );
    }

    #[test]
    fn test_status_request_requires_active() {
        let control = Arc::new(RecordingControl::default());
        let session = session_with(&control, 1);
        assert!(matches!(
            session.request_status(),
            Err(SessionError::InvalidState {
                current: "requested",
                ..
            })
        ));
        session.activate(None, None).unwrap();
        assert!(session.request_status().is_ok());
    }

    #[test]
    fn test_commit_on_closed_session_is_ignored() {
        let control = Arc::new(RecordingControl::default());
        let session = session_with(&control, 1);
        session.activate(None, None).unwrap();
        session.close(ClosedReason::Lost);
        assert!(session.commit_through(Offset::new(3)).is_ok());
        assert!(control.commits.lock().is_empty());
    }
}
