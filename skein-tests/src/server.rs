//! Scripted service side.
//!
//! Builders for the messages a topic service sends, plus a write server
//! that acknowledges whatever the client sent through a [`MockTransport`].
//!
//! ```text
//!   session ──send──▶ MockTransport ──▶ ScriptedWriteServer::acks()
//!      ▲                                          │
//!      └──────── handle_server_message ◀──────────┘
//! ```

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use skein_core::{Offset, PartitionId, PartitionSessionId, ReadSessionId, Timestamp, WriteSessionId};
use skein_session::protocol::{
    Batch, CommitOffsetResponse, MessageData, PartitionCommitted, PartitionData,
    PartitionSessionStatusResponse, ReadInitResponse, ReadResponse, ServerWriteAck,
    ServerWriteOutcome, StartPartitionSessionRequest, StopPartitionSessionRequest,
    WriteInitResponse, WriteResponse,
};
use skein_session::{
    Codec, CodecError, CodecId, CodecMap, MessageMeta, ReadServerMessage, WriteServerMessage,
};

use crate::mock_transport::MockTransport;

/// Topic path used by every scenario.
pub const TOPIC: &str = "/scenario/topic";

/// Codec id of [`XorCodec`].
pub const XOR: CodecId = CodecId::custom(1001);

/// Toy codec: XORs every byte with a key.
#[derive(Debug, Clone, Copy)]
pub struct XorCodec {
    key: u8,
}

impl XorCodec {
    /// Creates the codec with `key`.
    #[must_use]
    pub const fn new(key: u8) -> Self {
        Self { key }
    }

    fn apply(self, data: &[u8]) -> Bytes {
        data.iter().map(|byte| byte ^ self.key).collect::<Vec<_>>().into()
    }
}

impl Codec for XorCodec {
    fn compress(&self, data: &[u8], _level: i32) -> Result<Bytes, CodecError> {
        Ok(self.apply(data))
    }

    fn decompress(&self, data: &[u8]) -> Result<Bytes, CodecError> {
        Ok(self.apply(data))
    }
}

/// Key used by [`codecs`].
pub const XOR_KEY: u8 = 0x5a;

/// The default codecs plus [`XorCodec`] under [`XOR`].
#[must_use]
pub fn codecs() -> CodecMap {
    let mut codecs = CodecMap::new();
    codecs.register(XOR, Arc::new(XorCodec::new(XOR_KEY)));
    codecs
}

/// Payload of the message at `offset`.
#[must_use]
pub fn payload(offset: u64) -> Bytes {
    Bytes::from(format!("message-{offset}"))
}

// ---- Write side ----

/// Acknowledges what a write session sent.
pub struct ScriptedWriteServer {
    transport: Arc<MockTransport>,
    partition_id: PartitionId,
    state: Mutex<WriteServerState>,
}

#[derive(Default)]
struct WriteServerState {
    /// Highest sequence number acknowledged.
    acked: u64,
    /// Sequence numbers up to this one are reported as already written.
    written_before: u64,
    next_offset: u64,
}

impl ScriptedWriteServer {
    /// Serves writes recorded by `transport` on partition 0.
    #[must_use]
    pub fn new(transport: Arc<MockTransport>) -> Self {
        Self {
            transport,
            partition_id: PartitionId::new(0),
            state: Mutex::new(WriteServerState::default()),
        }
    }

    /// Pretends the service already holds every sequence number up to
    /// `seq_no`.
    pub fn set_written_before(&self, seq_no: u64) {
        let mut state = self.state.lock();
        state.written_before = seq_no;
        state.acked = state.acked.max(seq_no);
    }

    /// Answers a write init request.
    #[must_use]
    pub fn init(&self, session_id: u64) -> WriteServerMessage {
        WriteServerMessage::InitResponse(WriteInitResponse {
            session_id: WriteSessionId::new(session_id),
            last_seq_no: self.state.lock().written_before,
            partition_id: self.partition_id,
        })
    }

    /// Acknowledges everything sent and not yet acknowledged, in send order.
    /// Returns `None` when there is nothing new.
    #[must_use]
    pub fn acks(&self) -> Option<WriteServerMessage> {
        let sent = self.transport.written_seq_nos();
        let mut state = self.state.lock();
        let mut acks = Vec::new();
        for seq_no in sent {
            if seq_no <= state.acked {
                continue;
            }
            state.acked = seq_no;
            let offset = Offset::new(state.next_offset);
            state.next_offset += 1;
            acks.push(ServerWriteAck {
                seq_no,
                outcome: ServerWriteOutcome::Written { offset },
            });
        }
        if acks.is_empty() {
            return None;
        }
        Some(WriteServerMessage::WriteResponse(WriteResponse {
            partition_id: self.partition_id,
            acks,
            stat: None,
        }))
    }
}

impl std::fmt::Debug for ScriptedWriteServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedWriteServer")
            .field("partition_id", &self.partition_id)
            .field("acked", &self.state.lock().acked)
            .finish_non_exhaustive()
    }
}

// ---- Read side ----

/// Answers a read init request.
#[must_use]
pub fn read_init(session_id: u64) -> ReadServerMessage {
    ReadServerMessage::InitResponse(ReadInitResponse {
        session_id: ReadSessionId::new(session_id),
    })
}

/// Assigns partition `id` (partition session `id` on partition `id`).
#[must_use]
pub fn start(id: u64, committed_offset: u64, end_offset: u64) -> ReadServerMessage {
    ReadServerMessage::StartPartitionSession(StartPartitionSessionRequest {
        partition_session_id: PartitionSessionId::new(id),
        path: TOPIC.to_string(),
        partition_id: PartitionId::new(id),
        committed_offset: Offset::new(committed_offset),
        end_offset: Offset::new(end_offset),
    })
}

/// Takes partition session `id` away.
#[must_use]
pub fn stop(id: u64, graceful: bool, committed_offset: u64) -> ReadServerMessage {
    ReadServerMessage::StopPartitionSession(StopPartitionSessionRequest {
        partition_session_id: PartitionSessionId::new(id),
        graceful,
        committed_offset: Offset::new(committed_offset),
    })
}

/// One batch holding `offsets` of partition session `id`, encoded with
/// `codec` (raw or [`XOR`]).
#[must_use]
pub fn partition_data(id: u64, offsets: std::ops::Range<u64>, codec: CodecId) -> PartitionData {
    let xor = XorCodec::new(XOR_KEY);
    PartitionData {
        partition_session_id: PartitionSessionId::new(id),
        batches: vec![Batch {
            producer_id: "scenario-producer".to_string(),
            codec,
            written_at: Timestamp::from_millis(1_000),
            messages: offsets
                .map(|offset| {
                    let plain = payload(offset);
                    let data = if codec == XOR { xor.apply(&plain) } else { plain.clone() };
                    MessageData {
                        offset: Offset::new(offset),
                        seq_no: offset + 1,
                        created_at: Timestamp::from_millis(offset),
                        data,
                        uncompressed_size: plain.len() as u64,
                        meta: MessageMeta::new(),
                    }
                })
                .collect(),
        }],
    }
}

/// Data for several partition sessions, charged at the payload size.
#[must_use]
pub fn read(partition_data: Vec<PartitionData>) -> ReadServerMessage {
    let bytes_size = partition_data
        .iter()
        .flat_map(|data| &data.batches)
        .flat_map(|batch| &batch.messages)
        .map(|message| message.data.len() as u64)
        .sum();
    ReadServerMessage::Read(ReadResponse {
        bytes_size,
        partition_data,
    })
}

/// Reports partition session `id` committed up to `offset`.
#[must_use]
pub fn committed(id: u64, offset: u64) -> ReadServerMessage {
    ReadServerMessage::CommitOffset(CommitOffsetResponse {
        committed: vec![PartitionCommitted {
            partition_session_id: PartitionSessionId::new(id),
            committed_offset: Offset::new(offset),
        }],
    })
}

/// Status of partition session `id`.
#[must_use]
pub fn status(id: u64, committed_offset: u64, end_offset: u64) -> ReadServerMessage {
    ReadServerMessage::PartitionSessionStatus(PartitionSessionStatusResponse {
        partition_session_id: PartitionSessionId::new(id),
        committed_offset: Offset::new(committed_offset),
        end_offset: Offset::new(end_offset),
        write_time_high_watermark: Timestamp::from_millis(end_offset),
    })
}
