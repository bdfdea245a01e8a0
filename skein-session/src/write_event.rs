//! Events produced by a write session.

use skein_core::{Offset, PartitionId};
use skein_flow::ContinuationToken;

use crate::protocol::WriteStat;
use crate::pump::PumpEvent;
use crate::status::SessionClosedEvent;

/// How a write was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAckState {
    /// Stored by the service.
    Written {
        /// Offset within the partition.
        offset: Offset,
        /// Partition the message went to.
        partition_id: PartitionId,
        /// Server timings of the batch the message was written in.
        stat: Option<WriteStat>,
    },
    /// The sequence number was already written; the message was dropped.
    AlreadyWritten,
    /// The session closed before the write was resolved.
    Discarded,
}

/// Resolution of one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    /// Sequence number of the write.
    pub seq_no: u64,
    /// Outcome.
    pub state: WriteAckState,
}

/// Writes resolved since the previous acks event, in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcksEvent {
    /// The resolutions.
    pub acks: Vec<WriteAck>,
}

/// The session can take one more write.
#[derive(Debug)]
pub struct ReadyToAcceptEvent {
    /// Spend on [`WriteSession::write`](crate::WriteSession::write).
    pub token: ContinuationToken,
}

/// Any event a write session produces.
#[derive(Debug)]
pub enum WriteSessionEvent {
    /// Writes were resolved.
    Acks(AcksEvent),
    /// A token is available.
    ReadyToAccept(ReadyToAcceptEvent),
    /// The write session closed.
    SessionClosed(SessionClosedEvent),
}

impl PumpEvent for WriteSessionEvent {
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
            Self::Acks(event) => {
                let first = event.acks.first().map(|ack| ack.seq_no);
                let last = event.acks.last().map(|ack| ack.seq_no);
                format!(
                    "Acks {{ count: {}, first_seq_no: {first:?}, last_seq_no: {last:?} }}",
                    event.acks.len()
                )
            }
            Self::ReadyToAccept(_) => "ReadyToAccept".to_string(),
            Self::SessionClosed(event) => event.debug_string(),
        }
    }
}
