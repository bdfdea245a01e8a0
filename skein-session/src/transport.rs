//! The streaming transport a session talks through.
//!
//! The session only pushes typed client messages out. Server messages and
//! connection loss are fed back by the transport owner through
//! `handle_server_message` and `handle_connection_lost` on the session.

use std::time::Duration;

use crate::protocol::ClientMessage;

/// Transport error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The stream is not connected.
    #[error("transport disconnected")]
    Disconnected,

    /// The transport refused the operation.
    #[error("transport rejected request: {message}")]
    Rejected {
        /// Error message.
        message: String,
    },
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Bidirectional stream to the topic service.
pub trait Transport: Send + Sync {
    /// Sends one client message on the current stream.
    ///
    /// # Errors
    /// Returns an error if the stream cannot take the message.
    fn send(&self, message: ClientMessage) -> TransportResult<()>;

    /// Opens a fresh stream after `delay`.
    ///
    /// # Errors
    /// Returns an error if no stream could be opened.
    fn reconnect(&self, delay: Duration) -> TransportResult<()>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    /// Transport that records every message and always succeeds.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        sent: Mutex<Vec<ClientMessage>>,
        reconnects: AtomicUsize,
    }

    impl RecordingTransport {
        pub(crate) fn sent(&self) -> Vec<ClientMessage> {
            self.sent.lock().clone()
        }

        pub(crate) fn reconnects(&self) -> usize {
            self.reconnects.load(Ordering::SeqCst)
        }

        pub(crate) fn init_count(&self) -> usize {
            self.sent
                .lock()
                .iter()
                .filter(|m| matches!(m, ClientMessage::WriteInit(_) | ClientMessage::ReadInit(_)))
                .count()
        }

        /// Sequence numbers of every written message, in send order.
        pub(crate) fn write_seq_nos(&self) -> Vec<u64> {
            self.sent
                .lock()
                .iter()
                .filter_map(|m| match m {
                    ClientMessage::Write(request) => Some(request.messages.iter().map(|m| m.seq_no)),
                    _ => None,
                })
                .flatten()
                .collect()
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, message: ClientMessage) -> TransportResult<()> {
            self.sent.lock().push(message);
            Ok(())
        }

        fn reconnect(&self, _delay: Duration) -> TransportResult<()> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
