//! Read and write sessions for the Skein topic client.
//!
//! A session speaks the topic protocol over a caller-provided [`Transport`]
//! and reports everything that happens as events:
//!
//! - [`WriteSession`]: flow-controlled writes, acknowledged in submission order
//! - [`SimpleBlockingWriteSession`]: one write at a time, waiting for headroom
//! - [`ReadSession`]: partition assignment, ordered data delivery, commits
//!
//! # Architecture
//!
//! ```text
//!   transport owner ──handle_server_message──▶ session ──▶ EventPump ──▶ handlers executor
//!         ▲                                       │             │
//!         └─────────── Transport::send ◀──────────┘             └──▶ pull queue
//! ```
//!
//! Handlers are registered per event type, with a common fallback. Events
//! without a handler are queued for [`WriteSession::get_event`] and
//! [`ReadSession::get_event`]; the session-closed event always reaches the
//! queue as well.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use skein_session::{
//!     ClientMessage, Transport, TransportResult, WriteMessage, WriteSession,
//!     WriteSessionEvent, WriteSessionSettings,
//! };
//!
//! struct Discard;
//!
//! impl Transport for Discard {
//!     fn send(&self, _message: ClientMessage) -> TransportResult<()> {
//!         Ok(())
//!     }
//!
//!     fn reconnect(&self, _delay: Duration) -> TransportResult<()> {
//!         Ok(())
//!     }
//! }
//!
//! let session = WriteSession::new(WriteSessionSettings::for_testing("/topic"), Arc::new(Discard)).unwrap();
//! let Some(WriteSessionEvent::ReadyToAccept(ready)) = session.get_event(true) else {
//!     panic!("expected a token");
//! };
//! session.write(ready.token, WriteMessage::new(&b"hello"[..])).unwrap();
//! assert!(!session.close(Duration::ZERO));
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod blocking;
mod codec;
mod commit;
mod counters;
mod error;
mod handlers;
mod message;
mod partition_session;
pub mod protocol;
mod pump;
mod read_event;
mod read_session;
mod retry;
mod settings;
mod status;
mod transport;
mod write_event;
mod write_session;

pub use blocking::SimpleBlockingWriteSession;
pub use codec::{Codec, CodecError, CodecId, CodecMap, RawCodec};
pub use commit::DeferredCommit;
pub use counters::{ReaderCounters, ReaderCountersSnapshot, WriterCounters, WriterCountersSnapshot};
pub use error::{SessionError, SessionResult};
pub use handlers::{Handler, ReadEventHandlers, WriteEventHandlers};
pub use message::{MessageMeta, Precompressed, WriteMessage};
pub use partition_session::{ClosedReason, PartitionSession, PartitionSessionState};
pub use protocol::{
    ClientMessage, ReadServerMessage, TopicReadSettings, WriteServerMessage, WriteStat,
};
pub use pump::{EventPump, EventRouter, PumpEvent};
pub use read_event::{
    CommitOffsetAcknowledgementEvent, CompressedMessage, DataReceivedEvent, DecompressionError,
    Message, MessageInfo, PartitionSessionClosedEvent, PartitionSessionStatusEvent, ReadBudget,
    ReadSessionEvent, StartPartitionSessionEvent, StopPartitionSessionEvent,
};
pub use read_session::ReadSession;
pub use retry::{ExponentialBackoffPolicy, NoRetryPolicy, RetryContext, RetryDecision, RetryPolicy};
pub use settings::{ReadSessionSettings, WriteSessionSettings};
pub use status::{SessionClosedEvent, SessionStatus, StatusCode};
pub use transport::{Transport, TransportError, TransportResult};
pub use write_event::{AcksEvent, ReadyToAcceptEvent, WriteAck, WriteAckState, WriteSessionEvent};
pub use write_session::WriteSession;
