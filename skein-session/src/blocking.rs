//! Blocking writer over a [`WriteSession`].
//!
//! Tokens delivered by the session are parked in a slot; `write` waits for
//! one, bounded by a timeout. Acknowledgements are consumed internally.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use skein_executor::inline_executor;
use skein_flow::ContinuationToken;
use tracing::{debug, warn};

use crate::error::SessionResult;
use crate::handlers::WriteEventHandlers;
use crate::message::WriteMessage;
use crate::protocol::WriteServerMessage;
use crate::settings::WriteSessionSettings;
use crate::status::SessionStatus;
use crate::transport::Transport;
use crate::write_session::WriteSession;

#[derive(Default)]
struct TokenSlot {
    tokens: Mutex<SlotState>,
    available: Condvar,
}

#[derive(Default)]
struct SlotState {
    tokens: VecDeque<ContinuationToken>,
    closed: bool,
}

impl TokenSlot {
    fn put(&self, token: ContinuationToken) {
        self.tokens.lock().tokens.push_back(token);
        self.available.notify_one();
    }

    fn close(&self) {
        let tokens = {
            let mut state = self.tokens.lock();
            state.closed = true;
            std::mem::take(&mut state.tokens)
        };
        // Dropped outside the lock: releasing a token may refill the slot.
        drop(tokens);
        self.available.notify_all();
    }

    fn take(&self, deadline: Instant) -> Option<ContinuationToken> {
        let mut state = self.tokens.lock();
        loop {
            if let Some(token) = state.tokens.pop_front() {
                return Some(token);
            }
            if state.closed {
                return None;
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return state.tokens.pop_front();
            }
        }
    }
}

/// Writes one message at a time, waiting for flow-control headroom.
pub struct SimpleBlockingWriteSession {
    session: WriteSession,
    slot: Arc<TokenSlot>,
}

impl SimpleBlockingWriteSession {
    /// Opens a session. Any handlers in `settings` are replaced.
    ///
    /// # Errors
    /// Returns an error if the underlying write session cannot be opened.
    pub fn new(settings: WriteSessionSettings, transport: Arc<dyn Transport>) -> SessionResult<Self> {
        let slot = Arc::new(TokenSlot::default());
        let ready = Arc::clone(&slot);
        let closed = Arc::clone(&slot);
        let handlers = WriteEventHandlers::new()
            .with_ready_to_accept_handler(move |event| ready.put(event.token))
            .with_acks_handler(|event| debug!(count = event.acks.len(), "Writes acknowledged"))
            .with_session_closed_handler(move |event| {
                debug!(status = %event.status, "Blocking writer closed");
                closed.close();
            })
            .with_executor(inline_executor());
        let session = WriteSession::new(settings.with_handlers(handlers), transport)?;
        Ok(Self { session, slot })
    }

    /// Writes `message`, waiting up to `timeout` for headroom.
    ///
    /// Returns false if no token became available in time, the session is
    /// closed, or the write was refused.
    pub fn write(&self, message: WriteMessage, timeout: Duration) -> bool {
        let Some(token) = self.slot.take(Instant::now() + timeout) else {
            return false;
        };
        match self.session.write(token, message) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Blocking write refused");
                false
            }
        }
    }

    /// Waits for outstanding acknowledgements, then closes.
    ///
    /// Returns true if nothing had to be discarded.
    pub fn close(&self, timeout: Duration) -> bool {
        let clean = self.session.close(timeout);
        self.slot.close();
        clean
    }

    /// Returns the last sequence number the service reported on init.
    ///
    /// # Errors
    /// Returns `Timeout` or `Closed` as [`WriteSession::init_seq_no`] does.
    pub fn init_seq_no(&self, timeout: Duration) -> SessionResult<u64> {
        self.session.init_seq_no(timeout)
    }

    /// Returns true while the session accepts writes.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.session.is_closed()
    }

    /// Feeds a message received from the service.
    pub fn handle_server_message(&self, message: WriteServerMessage) {
        self.session.handle_server_message(message);
    }

    /// Reports that the stream broke.
    pub fn handle_connection_lost(&self, status: SessionStatus) {
        self.session.handle_connection_lost(status);
    }

    /// Returns the underlying session.
    #[must_use]
    pub const fn session(&self) -> &WriteSession {
        &self.session
    }
}

impl std::fmt::Debug for SimpleBlockingWriteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleBlockingWriteSession")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
