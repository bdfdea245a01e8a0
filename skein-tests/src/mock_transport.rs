//! In-memory transport for scenario tests.
//!
//! Records every client message and lets a test script failures. Server
//! messages are fed to the session directly by the test (see
//! [`crate::server`]).

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use skein_session::protocol::{ClientMessage, CommitOffsetRequest, WriteRequest};
use skein_session::{Transport, TransportError, TransportResult};
use tracing::debug;

#[derive(Default)]
struct MockState {
    sent: Vec<ClientMessage>,
    fail_sends: usize,
    fail_reconnects: usize,
    reconnect_delays: Vec<Duration>,
}

/// Transport that records messages instead of sending them.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    changed: Condvar,
}

impl MockTransport {
    /// Creates a transport with no scripted failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` sends with `Disconnected`.
    pub fn fail_next_sends(&self, count: usize) {
        self.state.lock().fail_sends = count;
    }

    /// Fails the next `count` reconnects.
    pub fn fail_next_reconnects(&self, count: usize) {
        self.state.lock().fail_reconnects = count;
    }

    /// Returns every message sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.state.lock().sent.clone()
    }

    /// Returns the delays of every successful reconnect.
    #[must_use]
    pub fn reconnect_delays(&self) -> Vec<Duration> {
        self.state.lock().reconnect_delays.clone()
    }

    /// Counts sent messages matching `filter`.
    pub fn count(&self, filter: impl Fn(&ClientMessage) -> bool) -> usize {
        self.state.lock().sent.iter().filter(|m| filter(m)).count()
    }

    /// Returns every write request.
    #[must_use]
    pub fn write_requests(&self) -> Vec<WriteRequest> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|m| match m {
                ClientMessage::Write(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns every written sequence number, in send order.
    #[must_use]
    pub fn written_seq_nos(&self) -> Vec<u64> {
        self.write_requests()
            .iter()
            .flat_map(|request| request.messages.iter().map(|m| m.seq_no))
            .collect()
    }

    /// Returns every commit request.
    #[must_use]
    pub fn commit_requests(&self) -> Vec<CommitOffsetRequest> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|m| match m {
                ClientMessage::CommitOffset(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// Returns the byte counts of every read request, in send order.
    #[must_use]
    pub fn grants(&self) -> Vec<u64> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|m| match m {
                ClientMessage::Read(request) => Some(request.bytes_size),
                _ => None,
            })
            .collect()
    }

    /// Waits until the sent messages satisfy `ready`.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_for(&self, timeout: Duration, ready: impl Fn(&[ClientMessage]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !ready(&state.sent) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return ready(&state.sent);
            }
        }
        true
    }
}

impl Transport for MockTransport {
    fn send(&self, message: ClientMessage) -> TransportResult<()> {
        let mut state = self.state.lock();
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            debug!(remaining = state.fail_sends, "Failing scripted send");
            return Err(TransportError::Disconnected);
        }
        state.sent.push(message);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn reconnect(&self, delay: Duration) -> TransportResult<()> {
        let mut state = self.state.lock();
        if state.fail_reconnects > 0 {
            state.fail_reconnects -= 1;
            debug!(remaining = state.fail_reconnects, "Failing scripted reconnect");
            return Err(TransportError::Rejected {
                message: "scripted reconnect failure".to_string(),
            });
        }
        state.reconnect_delays.push(delay);
        Ok(())
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockTransport")
            .field("sent", &state.sent.len())
            .field("reconnects", &state.reconnect_delays.len())
            .finish_non_exhaustive()
    }
}
