//! Events produced by a read session.

use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use skein_core::{Offset, Timestamp};

use crate::codec::CodecId;
use crate::error::SessionResult;
use crate::message::MessageMeta;
use crate::partition_session::{ClosedReason, PartitionSession, ReadControl};
use crate::pump::PumpEvent;
use crate::status::SessionClosedEvent;

/// A payload that could not be decompressed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot decompress message at offset {offset} with {codec}: {message}")]
pub struct DecompressionError {
    /// Offset of the message.
    pub offset: Offset,
    /// Codec of the payload.
    pub codec: CodecId,
    /// Codec's error message.
    pub message: String,
}

/// Bytes of the read memory grant held by undelivered or unreleased data.
///
/// Dropping the budget returns its bytes to the service.
pub struct ReadBudget {
    control: Weak<dyn ReadControl>,
    /// Connection the bytes were granted on.
    generation: u64,
    bytes: u64,
}

impl ReadBudget {
    pub(crate) fn new(control: Weak<dyn ReadControl>, generation: u64, bytes: u64) -> Self {
        Self {
            control,
            generation,
            bytes,
        }
    }

    /// Returns the number of bytes held.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for ReadBudget {
    fn drop(&mut self) {
        if self.bytes == 0 {
            return;
        }
        if let Some(control) = self.control.upgrade() {
            control.release_bytes(self.generation, self.bytes);
        }
    }
}

impl std::fmt::Debug for ReadBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBudget")
            .field("generation", &self.generation)
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// Fields common to decoded and compressed messages.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    /// Offset within the partition.
    pub offset: Offset,
    /// Writer's sequence number.
    pub seq_no: u64,
    /// Writer's creation time.
    pub created_at: Timestamp,
    /// Time the service wrote the message.
    pub written_at: Timestamp,
    /// Producer identity.
    pub producer_id: String,
    /// User metadata.
    pub meta: MessageMeta,
}

/// A received message.
#[derive(Debug, Clone)]
pub struct Message {
    data: Result<Bytes, DecompressionError>,
    info: MessageInfo,
    session: Arc<PartitionSession>,
}

impl Message {
    pub(crate) fn new(
        data: Result<Bytes, DecompressionError>,
        info: MessageInfo,
        session: Arc<PartitionSession>,
    ) -> Self {
        Self {
            data,
            info,
            session,
        }
    }

    /// Returns the decompressed payload.
    ///
    /// # Errors
    /// Returns the decompression failure recorded for this message.
    pub fn data(&self) -> Result<&Bytes, DecompressionError> {
        self.data.as_ref().map_err(Clone::clone)
    }

    /// Returns the message's offset.
    #[must_use]
    pub const fn offset(&self) -> Offset {
        self.info.offset
    }

    /// Returns the message's metadata.
    #[must_use]
    pub const fn info(&self) -> &MessageInfo {
        &self.info
    }

    /// Returns the partition session the message was read from.
    #[must_use]
    pub const fn partition_session(&self) -> &Arc<PartitionSession> {
        &self.session
    }

    /// Commits this message and every earlier one in its partition.
    ///
    /// # Errors
    /// Returns `ContractViolation` before the partition session was confirmed,
    /// or a transport error.
    pub fn commit(&self) -> SessionResult<()> {
        self.session.commit_through(self.info.offset)
    }
}

/// A received message left compressed.
#[derive(Debug, Clone)]
pub struct CompressedMessage {
    /// Codec of the payload.
    pub codec: CodecId,
    /// Compressed payload.
    pub data: Bytes,
    /// Payload size before compression.
    pub uncompressed_size: u64,
    /// Message fields.
    pub info: MessageInfo,
    session: Arc<PartitionSession>,
}

impl CompressedMessage {
    pub(crate) const fn new(
        codec: CodecId,
        data: Bytes,
        uncompressed_size: u64,
        info: MessageInfo,
        session: Arc<PartitionSession>,
    ) -> Self {
        Self {
            codec,
            data,
            uncompressed_size,
            info,
            session,
        }
    }

    /// Returns the partition session the message was read from.
    #[must_use]
    pub const fn partition_session(&self) -> &Arc<PartitionSession> {
        &self.session
    }

    /// Commits this message and every earlier one in its partition.
    ///
    /// # Errors
    /// Returns `ContractViolation` before the partition session was confirmed.
    pub fn commit(&self) -> SessionResult<()> {
        self.session.commit_through(self.info.offset)
    }
}

#[derive(Debug)]
pub(crate) enum DataPayload {
    Messages(Vec<Message>),
    Compressed(Vec<CompressedMessage>),
}

impl DataPayload {
    fn offsets(&self) -> Option<(Offset, Offset)> {
        match self {
            Self::Messages(messages) => Some((messages.first()?.offset(), messages.last()?.offset())),
            Self::Compressed(messages) => {
                Some((messages.first()?.info.offset, messages.last()?.info.offset))
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Messages(messages) => messages.len(),
            Self::Compressed(messages) => messages.len(),
        }
    }
}

/// Messages of one partition session, in increasing offset order.
///
/// Holds part of the read memory grant until dropped.
#[derive(Debug)]
pub struct DataReceivedEvent {
    session: Arc<PartitionSession>,
    payload: DataPayload,
    _budget: ReadBudget,
}

impl DataReceivedEvent {
    pub(crate) const fn new(
        session: Arc<PartitionSession>,
        payload: DataPayload,
        budget: ReadBudget,
    ) -> Self {
        Self {
            session,
            payload,
            _budget: budget,
        }
    }

    /// Returns decompressed messages; empty when decompression is off.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        match &self.payload {
            DataPayload::Messages(messages) => messages,
            DataPayload::Compressed(_) => &[],
        }
    }

    /// Returns compressed messages; empty when decompression is on.
    #[must_use]
    pub fn compressed_messages(&self) -> &[CompressedMessage] {
        match &self.payload {
            DataPayload::Compressed(messages) => messages,
            DataPayload::Messages(_) => &[],
        }
    }

    /// Returns the number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns true if the event holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.len() == 0
    }

    /// Returns `[first, last + 1)` over the event's offsets.
    #[must_use]
    pub fn offset_range(&self) -> Option<(Offset, Offset)> {
        self.payload
            .offsets()
            .map(|(first, last)| (first, last.next()))
    }

    /// Returns the partition session.
    #[must_use]
    pub const fn partition_session(&self) -> &Arc<PartitionSession> {
        &self.session
    }

    /// Commits every message in the event and all earlier ones.
    ///
    /// # Errors
    /// Returns `ContractViolation` before the partition session was confirmed.
    pub fn commit(&self) -> SessionResult<()> {
        match self.payload.offsets() {
            Some((_, last)) => self.session.commit_through(last),
            None => Ok(()),
        }
    }
}

/// The service assigned a partition; confirm to start reading it.
#[derive(Debug, Clone)]
pub struct StartPartitionSessionEvent {
    session: Arc<PartitionSession>,
    committed_offset: Offset,
    end_offset: Offset,
}

impl StartPartitionSessionEvent {
    pub(crate) const fn new(
        session: Arc<PartitionSession>,
        committed_offset: Offset,
        end_offset: Offset,
    ) -> Self {
        Self {
            session,
            committed_offset,
            end_offset,
        }
    }

    /// Returns the partition session.
    #[must_use]
    pub const fn partition_session(&self) -> &Arc<PartitionSession> {
        &self.session
    }

    /// Returns the consumer's committed offset.
    #[must_use]
    pub const fn committed_offset(&self) -> Offset {
        self.committed_offset
    }

    /// Returns one past the last message in the partition.
    #[must_use]
    pub const fn end_offset(&self) -> Offset {
        self.end_offset
    }

    /// Starts reading at the committed offset.
    ///
    /// # Errors
    /// Returns `InvalidState` if already confirmed, or a transport error.
    pub fn confirm(&self) -> SessionResult<()> {
        self.confirm_with(None, None)
    }

    /// Starts reading at `read_offset`, committing up to `commit_offset` first.
    ///
    /// # Errors
    /// Returns `InvalidState` if already confirmed, or a transport error.
    pub fn confirm_with(
        &self,
        read_offset: Option<Offset>,
        commit_offset: Option<Offset>,
    ) -> SessionResult<()> {
        self.session
            .control()?
            .confirm_start(&self.session, read_offset, commit_offset)
    }
}

/// The service is taking a partition away.
#[derive(Debug, Clone)]
pub struct StopPartitionSessionEvent {
    session: Arc<PartitionSession>,
    committed_offset: Offset,
}

impl StopPartitionSessionEvent {
    pub(crate) const fn new(session: Arc<PartitionSession>, committed_offset: Offset) -> Self {
        Self {
            session,
            committed_offset,
        }
    }

    /// Returns the partition session.
    #[must_use]
    pub const fn partition_session(&self) -> &Arc<PartitionSession> {
        &self.session
    }

    /// Returns the committed offset reported with the stop.
    #[must_use]
    pub const fn committed_offset(&self) -> Offset {
        self.committed_offset
    }

    /// Lets the partition go. A no-op once the session is closed.
    ///
    /// # Errors
    /// Returns a transport error if the confirmation cannot be sent.
    pub fn confirm(&self) -> SessionResult<()> {
        self.session.control()?.confirm_stop(&self.session)
    }
}

/// The service applied a commit.
#[derive(Debug, Clone)]
pub struct CommitOffsetAcknowledgementEvent {
    session: Arc<PartitionSession>,
    committed_offset: Offset,
}

impl CommitOffsetAcknowledgementEvent {
    pub(crate) const fn new(session: Arc<PartitionSession>, committed_offset: Offset) -> Self {
        Self {
            session,
            committed_offset,
        }
    }

    /// Returns the partition session.
    #[must_use]
    pub const fn partition_session(&self) -> &Arc<PartitionSession> {
        &self.session
    }

    /// Returns the new committed offset.
    #[must_use]
    pub const fn committed_offset(&self) -> Offset {
        self.committed_offset
    }
}

/// Status of a partition session, in answer to
/// [`PartitionSession::request_status`].
#[derive(Debug, Clone)]
pub struct PartitionSessionStatusEvent {
    /// The partition session.
    pub session: Arc<PartitionSession>,
    /// Consumer's committed offset.
    pub committed_offset: Offset,
    /// Next offset not yet delivered to this reader.
    pub read_offset: Offset,
    /// One past the last message in the partition.
    pub end_offset: Offset,
    /// Newest write time in the partition.
    pub write_time_high_watermark: Timestamp,
}

impl PartitionSessionStatusEvent {
    /// Messages in the partition not yet delivered to this reader.
    #[must_use]
    pub const fn unread_messages(&self) -> u64 {
        self.read_offset.distance_to(self.end_offset)
    }

    /// Messages delivered to this reader but not yet committed.
    #[must_use]
    pub const fn uncommitted_messages(&self) -> u64 {
        self.committed_offset.distance_to(self.read_offset)
    }

    /// How far the partition's newest write lies behind `now`.
    #[must_use]
    pub const fn write_lag(&self, now: Timestamp) -> Duration {
        self.write_time_high_watermark.lag_behind(now)
    }
}

/// A partition session closed; no further events concern it.
#[derive(Debug, Clone)]
pub struct PartitionSessionClosedEvent {
    session: Arc<PartitionSession>,
    reason: ClosedReason,
}

impl PartitionSessionClosedEvent {
    pub(crate) const fn new(session: Arc<PartitionSession>, reason: ClosedReason) -> Self {
        Self { session, reason }
    }

    /// Returns the partition session.
    #[must_use]
    pub const fn partition_session(&self) -> &Arc<PartitionSession> {
        &self.session
    }

    /// Returns why the session closed.
    #[must_use]
    pub const fn reason(&self) -> ClosedReason {
        self.reason
    }
}

/// Any event a read session produces.
#[derive(Debug)]
pub enum ReadSessionEvent {
    /// Messages arrived.
    DataReceived(DataReceivedEvent),
    /// A commit was applied.
    CommitOffsetAcknowledgement(CommitOffsetAcknowledgementEvent),
    /// A partition was assigned.
    StartPartitionSession(StartPartitionSessionEvent),
    /// A partition is being taken away.
    StopPartitionSession(StopPartitionSessionEvent),
    /// Status answer.
    PartitionSessionStatus(PartitionSessionStatusEvent),
    /// A partition session closed.
    PartitionSessionClosed(PartitionSessionClosedEvent),
    /// The read session closed.
    SessionClosed(SessionClosedEvent),
}

impl PumpEvent for ReadSessionEvent {
    fn queued_copy(&self) -> Option<Self> {
        match self {
            Self::SessionClosed(event) => Some(Self::SessionClosed(event.clone())),
            _ => None,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionClosed(_))
    }

    fn debug_string(&self) -> String {
        match self {
            Self::DataReceived(event) => format!(
                "DataReceived {{ partition_session_id: {}, messages: {}, range: {:?} }}",
                event.session.id(),
                event.len(),
                event.offset_range()
            ),
            Self::CommitOffsetAcknowledgement(event) => format!(
                "CommitOffsetAcknowledgement {{ partition_session_id: {}, committed_offset: {} }}",
                event.session.id(),
                event.committed_offset
            ),
            Self::StartPartitionSession(event) => format!(
                "StartPartitionSession {{ partition_session_id: {}, path: {}, partition_id: {} }}",
                event.session.id(),
                event.session.path(),
                event.session.partition_id()
            ),
            Self::StopPartitionSession(event) => format!(
                "StopPartitionSession {{ partition_session_id: {}, committed_offset: {} }}",
                event.session.id(),
                event.committed_offset
            ),
            Self::PartitionSessionStatus(event) => format!(
                "PartitionSessionStatus {{ partition_session_id: {}, committed_offset: {}, end_offset: {}, unread: {} }}",
                event.session.id(),
                event.committed_offset,
                event.end_offset,
                event.unread_messages()
            ),
            Self::PartitionSessionClosed(event) => format!(
                "PartitionSessionClosed {{ partition_session_id: {}, reason: {:?} }}",
                event.session.id(),
                event.reason
            ),
            Self::SessionClosed(event) => event.debug_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition_session::tests::{session_with, RecordingControl};

    fn info(offset: u64) -> MessageInfo {
        MessageInfo {
            offset: Offset::new(offset),
            seq_no: offset + 1,
            created_at: Timestamp::ZERO,
            written_at: Timestamp::ZERO,
            producer_id: "producer".to_string(),
            meta: MessageMeta::new(),
        }
    }

    #[test]
    fn test_decompression_error_surfaces_on_data() {
        let control = Arc::new(RecordingControl::default());
        let session = session_with(&control, 1);
        let failure = DecompressionError {
            offset: Offset::new(3),
            codec: CodecId::GZIP,
            message: "bad header".to_string(),
        };
        let message = Message::new(Err(failure.clone()), info(3), session);
        assert_eq!(message.data(), Err(failure));
    }

    #[test]
    fn test_dropping_event_releases_budget() {
        let control = Arc::new(RecordingControl::default());
        let session = session_with(&control, 1);
        let weak = Arc::downgrade(&control) as Weak<dyn ReadControl>;
        let event = DataReceivedEvent::new(
            Arc::clone(&session),
            DataPayload::Messages(vec![Message::new(
                Ok(Bytes::from_static(b"x")),
                info(0),
                session,
            )]),
            ReadBudget::new(weak, 0, 64),
        );
        assert_eq!(event.offset_range(), Some((Offset::new(0), Offset::new(1))));
        drop(event);
        assert_eq!(*control.released.lock(), 64);
    }

    #[test]
    fn test_event_commit_covers_last_offset() {
        let control = Arc::new(RecordingControl::default());
        let session = session_with(&control, 1);
        session.activate(None, None).unwrap();
        let messages = (0..3)
            .map(|offset| Message::new(Ok(Bytes::new()), info(offset), Arc::clone(&session)))
            .collect();
        let weak = Arc::downgrade(&control) as Weak<dyn ReadControl>;
        let event = DataReceivedEvent::new(
            Arc::clone(&session),
            DataPayload::Messages(messages),
            ReadBudget::new(weak, 0, 0),
        );
        event.commit().unwrap();

        let commits = control.commits.lock();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0][0].end, Offset::new(3));
    }

    #[test]
    fn test_only_session_closed_is_copied_to_queue() {
        let closed = ReadSessionEvent::SessionClosed(SessionClosedEvent {
            status: crate::status::SessionStatus::closed_by_client(),
        });
        assert!(closed.queued_copy().is_some());
        assert!(closed.is_terminal());
    }
}
