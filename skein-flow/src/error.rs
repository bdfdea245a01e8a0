//! Flow control error types.

/// Flow control error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// The continuation token was already used or belongs to another writer.
    #[error("invalid continuation token: {reason}")]
    InvalidToken {
        /// Why the token was rejected.
        reason: &'static str,
    },

    /// Explicit and automatic sequence numbers were mixed in one session.
    #[error("sequence numbers mixed: session uses {established}, message uses {attempted}")]
    MixedSeqNo {
        /// Mode established by earlier messages.
        established: &'static str,
        /// Mode of the rejected message.
        attempted: &'static str,
    },

    /// An acknowledgement did not match the head of the in-flight queue.
    #[error("acknowledgement for seq_no {seq_no} out of order (expected {expected:?})")]
    AckOutOfOrder {
        /// Acknowledged sequence number.
        seq_no: u64,
        /// Sequence number at the head of the queue, if any.
        expected: Option<u64>,
    },

    /// The controller was closed.
    #[error("flow controller closed")]
    Closed,

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },
}

/// Result type for flow control operations.
pub type FlowResult<T> = Result<T, FlowError>;
