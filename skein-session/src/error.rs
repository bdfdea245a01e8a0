//! Session error types.

use skein_executor::ExecutorError;
use skein_flow::FlowError;

use crate::codec::CodecError;
use crate::transport::TransportError;

/// Session error type.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The application broke the session contract.
    #[error("contract violation: {reason}")]
    ContractViolation {
        /// What was violated.
        reason: String,
    },

    /// The operation is not permitted in the current state.
    #[error("invalid state: in {current}, need {required}")]
    InvalidState {
        /// The current state.
        current: &'static str,
        /// The required state.
        required: &'static str,
    },

    /// The session is closed.
    #[error("session closed")]
    Closed,

    /// A bounded wait elapsed.
    #[error("timed out waiting for {operation}")]
    Timeout {
        /// What was awaited.
        operation: &'static str,
    },

    /// Invalid settings.
    #[error("invalid settings: {message}")]
    InvalidSettings {
        /// Error message.
        message: String,
    },

    /// Flow control rejected a write.
    #[error(transparent)]
    Flow(#[from] FlowError),

    /// An executor rejected work.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A codec failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<skein_core::Error> for SessionError {
    fn from(err: skein_core::Error) -> Self {
        Self::InvalidSettings {
            message: err.to_string(),
        }
    }
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
