//! Typed messages exchanged with the topic service.
//!
//! These are the in-memory shapes the sessions build and consume. Encoding
//! them for the wire is the transport's concern.
//!
//! ```text
//!   writer                         service
//!     │── WriteInitRequest ──────────▶│
//!     │◀───────── WriteInitResponse ──│  session id, last seq_no
//!     │── WriteRequest ──────────────▶│
//!     │◀───────────── WriteResponse ──│  acks in submission order
//!
//!   reader                         service
//!     │── ReadInitRequest ───────────▶│
//!     │◀────────── ReadInitResponse ──│
//!     │── ReadRequest(bytes) ────────▶│  memory grant
//!     │◀─ StartPartitionSessionRequest│
//!     │── StartPartitionSessionResp. ▶│  after confirm
//!     │◀────────────── ReadResponse ──│  data, counted against the grant
//!     │── CommitOffsetRequest ───────▶│
//!     │◀──────── CommitOffsetResponse │
//! ```

use std::time::Duration;

use bytes::Bytes;
use skein_core::{
    Offset, PartitionId, PartitionSessionId, ReadSessionId, Timestamp, WriteSessionId,
};

use crate::codec::CodecId;
use crate::message::MessageMeta;

// ---- Client messages ----

/// A message from the client to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Opens a write session.
    WriteInit(WriteInitRequest),
    /// Carries messages to write.
    Write(WriteRequest),
    /// Opens a read session.
    ReadInit(ReadInitRequest),
    /// Grants the service more bytes to send.
    Read(ReadRequest),
    /// Confirms a partition session start.
    StartPartitionSessionResponse(StartPartitionSessionResponse),
    /// Confirms a graceful partition session stop.
    StopPartitionSessionResponse(StopPartitionSessionResponse),
    /// Commits offset ranges.
    CommitOffset(CommitOffsetRequest),
    /// Asks for a partition session's status.
    PartitionSessionStatus(PartitionSessionStatusRequest),
}

/// Opens a write session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteInitRequest {
    /// Topic path.
    pub path: String,
    /// Producer identity used for deduplication.
    pub producer_id: Option<String>,
    /// Message group; messages of one group keep their order.
    pub message_group_id: Option<String>,
    /// Partition the writer is pinned to.
    pub partition_id: Option<PartitionId>,
    /// Whether the service deduplicates by sequence number.
    pub deduplication_enabled: Option<bool>,
    /// Session metadata.
    pub session_meta: MessageMeta,
}

/// Messages to write, all compressed with one codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    /// Codec of every payload in the request.
    pub codec: CodecId,
    /// Messages in submission order.
    pub messages: Vec<WriteRequestMessage>,
}

/// One message inside a [`WriteRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequestMessage {
    /// Sequence number.
    pub seq_no: u64,
    /// Creation time.
    pub created_at: Timestamp,
    /// Payload, compressed with the request's codec.
    pub data: Bytes,
    /// Payload size before compression.
    pub uncompressed_size: u64,
    /// User metadata.
    pub meta: MessageMeta,
    /// Transaction id.
    pub tx_id: Option<String>,
}

/// Per-topic read options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicReadSettings {
    /// Topic path.
    pub path: String,
    /// Skip messages written before this time.
    pub read_from: Option<Timestamp>,
    /// Restrict reading to these partitions; empty reads all.
    pub partition_ids: Vec<PartitionId>,
    /// Skip messages older than this lag.
    pub max_lag: Option<Duration>,
}

impl TopicReadSettings {
    /// Reads every partition of `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            read_from: None,
            partition_ids: Vec::new(),
            max_lag: None,
        }
    }

    /// Restricts reading to `partition_ids`.
    #[must_use]
    pub fn with_partition_ids(mut self, partition_ids: Vec<PartitionId>) -> Self {
        self.partition_ids = partition_ids;
        self
    }

    /// Skips messages written before `read_from`.
    #[must_use]
    pub const fn with_read_from(mut self, read_from: Timestamp) -> Self {
        self.read_from = Some(read_from);
        self
    }

    /// Skips messages older than `max_lag`.
    #[must_use]
    pub const fn with_max_lag(mut self, max_lag: Duration) -> Self {
        self.max_lag = Some(max_lag);
        self
    }
}

/// Opens a read session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadInitRequest {
    /// Consumer name; `None` reads without a consumer.
    pub consumer: Option<String>,
    /// Topics to read.
    pub topics: Vec<TopicReadSettings>,
}

/// Grants the service `bytes_size` more bytes of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    /// Bytes granted.
    pub bytes_size: u64,
}

/// Confirms a partition session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPartitionSessionResponse {
    /// The partition session.
    pub partition_session_id: PartitionSessionId,
    /// Where to start reading, if not at the committed offset.
    pub read_offset: Option<Offset>,
    /// Offset to commit before reading, if any.
    pub commit_offset: Option<Offset>,
}

/// Confirms a graceful partition session stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPartitionSessionResponse {
    /// The partition session.
    pub partition_session_id: PartitionSessionId,
}

/// One committed range: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitRange {
    /// The partition session.
    pub partition_session_id: PartitionSessionId,
    /// First committed offset.
    pub start: Offset,
    /// One past the last committed offset.
    pub end: Offset,
}

/// Commits offset ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOffsetRequest {
    /// Ranges, merged per partition session.
    pub ranges: Vec<CommitRange>,
}

/// Asks for a partition session's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSessionStatusRequest {
    /// The partition session.
    pub partition_session_id: PartitionSessionId,
}

// ---- Server messages ----

/// A message from the service to a write session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteServerMessage {
    /// The session is open.
    InitResponse(WriteInitResponse),
    /// Acknowledgements.
    WriteResponse(WriteResponse),
}

/// The write session is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteInitResponse {
    /// Server-assigned session id.
    pub session_id: WriteSessionId,
    /// Last sequence number the service has seen from this producer.
    pub last_seq_no: u64,
    /// Partition the session writes to.
    pub partition_id: PartitionId,
}

/// Acknowledgements for written messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResponse {
    /// Partition the messages were written to.
    pub partition_id: PartitionId,
    /// Acknowledgements in submission order.
    pub acks: Vec<ServerWriteAck>,
    /// Server timings for the batch, when reported.
    pub stat: Option<WriteStat>,
}

/// Server-side timings of one acknowledged batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStat {
    /// Time spent persisting the batch.
    pub write_time: Duration,
    /// Shortest wait of a message in the partition queue.
    pub min_time_in_partition_queue: Duration,
    /// Longest wait of a message in the partition queue.
    pub max_time_in_partition_queue: Duration,
    /// Time spent waiting for partition write quota.
    pub partition_quoted_time: Duration,
    /// Time spent waiting for topic write quota.
    pub topic_quoted_time: Duration,
}

/// One message's acknowledgement as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerWriteAck {
    /// Sequence number.
    pub seq_no: u64,
    /// Outcome.
    pub outcome: ServerWriteOutcome,
}

/// Outcome of one write on the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerWriteOutcome {
    /// Written at `offset`.
    Written {
        /// Offset within the partition.
        offset: Offset,
    },
    /// The sequence number was already written.
    AlreadyWritten,
}

/// A message from the service to a read session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadServerMessage {
    /// The session is open.
    InitResponse(ReadInitResponse),
    /// A partition is assigned to this reader.
    StartPartitionSession(StartPartitionSessionRequest),
    /// A partition is being taken away.
    StopPartitionSession(StopPartitionSessionRequest),
    /// Data.
    Read(ReadResponse),
    /// Commits were applied.
    CommitOffset(CommitOffsetResponse),
    /// Status of a partition session.
    PartitionSessionStatus(PartitionSessionStatusResponse),
}

/// The read session is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadInitResponse {
    /// Server-assigned session id.
    pub session_id: ReadSessionId,
}

/// A partition assigned to this reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPartitionSessionRequest {
    /// The partition session id.
    pub partition_session_id: PartitionSessionId,
    /// Topic path.
    pub path: String,
    /// The partition.
    pub partition_id: PartitionId,
    /// Consumer's committed offset.
    pub committed_offset: Offset,
    /// One past the last message currently in the partition.
    pub end_offset: Offset,
}

/// A partition being taken away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopPartitionSessionRequest {
    /// The partition session.
    pub partition_session_id: PartitionSessionId,
    /// Graceful stops wait for the client's confirmation.
    pub graceful: bool,
    /// Consumer's committed offset.
    pub committed_offset: Offset,
}

/// Data for one or more partition sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    /// Bytes of the memory grant this response consumes.
    pub bytes_size: u64,
    /// Per-partition-session data.
    pub partition_data: Vec<PartitionData>,
}

/// Data for one partition session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionData {
    /// The partition session.
    pub partition_session_id: PartitionSessionId,
    /// Batches in offset order.
    pub batches: Vec<Batch>,
}

/// Messages from one producer written together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Producer identity.
    pub producer_id: String,
    /// Codec of every payload in the batch.
    pub codec: CodecId,
    /// Time the batch was written on the service.
    pub written_at: Timestamp,
    /// Messages in offset order.
    pub messages: Vec<MessageData>,
}

/// One message as delivered by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageData {
    /// Offset within the partition.
    pub offset: Offset,
    /// Writer's sequence number.
    pub seq_no: u64,
    /// Writer's creation time.
    pub created_at: Timestamp,
    /// Payload, compressed with the batch codec.
    pub data: Bytes,
    /// Payload size before compression.
    pub uncompressed_size: u64,
    /// User metadata.
    pub meta: MessageMeta,
}

/// Commits applied on the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOffsetResponse {
    /// Committed offset per partition session.
    pub committed: Vec<PartitionCommitted>,
}

/// A partition session's new committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionCommitted {
    /// The partition session.
    pub partition_session_id: PartitionSessionId,
    /// Committed offset.
    pub committed_offset: Offset,
}

/// Status of a partition session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSessionStatusResponse {
    /// The partition session.
    pub partition_session_id: PartitionSessionId,
    /// Consumer's committed offset.
    pub committed_offset: Offset,
    /// One past the last message in the partition.
    pub end_offset: Offset,
    /// Newest write time in the partition.
    pub write_time_high_watermark: Timestamp,
}
