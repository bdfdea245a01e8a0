//! Session status codes and the terminal session-closed event.

use std::fmt;

/// Outcome classification reported when a session ends or a fault occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// The session ended normally.
    Success,
    /// The request was malformed.
    BadRequest,
    /// The caller lacks permission.
    Unauthorized,
    /// The topic or consumer does not exist.
    NotFound,
    /// The service failed internally.
    InternalError,
    /// The operation was aborted and may be retried.
    Aborted,
    /// The service is temporarily unavailable.
    Unavailable,
    /// The service is overloaded.
    Overloaded,
    /// The server-side session expired.
    SessionExpired,
    /// The connection to the service was lost.
    TransportUnavailable,
    /// A client-side deadline elapsed.
    ClientTimeout,
    /// The client closed the session.
    ClientCancelled,
}

impl StatusCode {
    /// Returns true if a retry policy may reconnect after this status.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Aborted
                | Self::Unavailable
                | Self::Overloaded
                | Self::SessionExpired
                | Self::TransportUnavailable
        )
    }

    /// Returns true for [`StatusCode::Success`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A status code with a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// Status classification.
    pub code: StatusCode,
    /// Description of what happened.
    pub message: String,
}

impl SessionStatus {
    /// Creates a status.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Status for a session closed by its owner.
    #[must_use]
    pub fn closed_by_client() -> Self {
        Self::new(StatusCode::Success, "session closed by client")
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Terminal event: the session will produce no further events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClosedEvent {
    /// Why the session closed.
    pub status: SessionStatus,
}

impl SessionClosedEvent {
    /// Returns a one-line description for logs.
    #[must_use]
    pub fn debug_string(&self) -> String {
        format!("SessionClosed {{ status: {} }}", self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_codes() {
        assert!(StatusCode::TransportUnavailable.is_retryable());
        assert!(StatusCode::Overloaded.is_retryable());
        assert!(!StatusCode::Unauthorized.is_retryable());
        assert!(!StatusCode::Success.is_retryable());
    }

    #[test]
    fn test_closed_event_description() {
        let event = SessionClosedEvent {
            status: SessionStatus::new(StatusCode::Unavailable, "node down"),
        };
        assert_eq!(
            event.debug_string(),
            "SessionClosed { status: Unavailable: node down }"
        );
    }
}
