//! Write session: flow-controlled, acknowledged writes to one topic.
//!
//! # Lifecycle
//!
//! ```text
//!   new() ──▶ Connecting ──init response──▶ Ready ──close()/fatal──▶ Closed
//!                 ▲                            │
//!                 └──── retryable loss ────────┘
//! ```
//!
//! Writes are accepted in every state but `Closed`. While connecting they
//! are buffered; on (re)connect everything unacknowledged is sent again.
//!
//! # Message pipeline
//!
//! ```text
//!   write(token, msg) ──▶ accepted ──compression executor──▶ ready ──▶ WriteRequest
//!                                                                        │
//!   Acks event ◀── acknowledge (submission order) ◀── WriteResponse ◀────┘
//! ```
//!
//! Messages are sent strictly in submission order: a message whose
//! compression finished early waits for every earlier one. With batching
//! configured, ready messages are held until enough bytes are ready or the
//! oldest has waited the flush interval.
//!
//! # Event order
//!
//! Acknowledgements and the closing event are queued on an outbox while the
//! state lock is held, and one thread at a time dispatches the outbox. Events
//! therefore reach handlers in the order the state changes happened, and
//! `close` returns only after the closing event was dispatched.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use skein_core::{PartitionId, Timestamp, WriteSessionId};
use skein_executor::{executor_for, Executor, ExecutorError};
use skein_flow::{ContinuationToken, FlowController, FlowError, FlowStats};
use tracing::{debug, error, info, warn};

use crate::codec::{CodecError, CodecId};
use crate::counters::WriterCounters;
use crate::error::{SessionError, SessionResult};
use crate::message::WriteMessage;
use crate::protocol::{
    ClientMessage, ServerWriteOutcome, WriteInitRequest, WriteInitResponse, WriteRequest,
    WriteRequestMessage, WriteResponse, WriteServerMessage,
};
use crate::pump::EventPump;
use crate::retry::{RetryDecision, RetryStreak};
use crate::settings::WriteSessionSettings;
use crate::status::{SessionClosedEvent, SessionStatus, StatusCode};
use crate::transport::Transport;
use crate::write_event::{AcksEvent, ReadyToAcceptEvent, WriteAck, WriteAckState, WriteSessionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Ready,
    Closed,
}

/// An accepted message, aligned one-to-one with the controller's queue.
struct Pending {
    /// Controller submission position.
    position: u64,
    seq_no: u64,
    duplicate: bool,
    sent: bool,
    codec: CodecId,
    uncompressed_size: u64,
    /// Payload in `codec`, once compression finished.
    payload: Option<Bytes>,
    created_at: Timestamp,
    message: WriteMessage,
}

struct WriteState {
    phase: Phase,
    messages: VecDeque<Pending>,
    session_id: Option<WriteSessionId>,
    partition_id: Option<PartitionId>,
    init_seq_no: Option<u64>,
    retry: RetryStreak,
    /// When the oldest held ready message started waiting for its batch.
    held_since: Option<Instant>,
    /// Send held messages without waiting for the batch to fill.
    flush_forced: bool,
}

/// Events waiting for dispatch, in the order they were produced.
struct Outbox {
    events: VecDeque<WriteSessionEvent>,
    /// Thread currently dispatching.
    emitter: Option<ThreadId>,
}

struct WriteCore {
    settings: WriteSessionSettings,
    controller: FlowController,
    pump: EventPump<WriteSessionEvent>,
    transport: Arc<dyn Transport>,
    compression: Arc<dyn Executor>,
    state: Mutex<WriteState>,
    /// Signalled on init, acknowledgement, batch hold and close.
    changed: Condvar,
    send_lock: Mutex<()>,
    flush_requested: AtomicBool,
    /// Locked after `state` when both are held.
    outbox: Mutex<Outbox>,
    /// Signalled when the outbox drains.
    drained: Condvar,
}

/// A write session.
///
/// Writes are submitted in exchange for tokens delivered by
/// `ReadyToAccept` events, and resolved by `Acks` events in submission
/// order.
pub struct WriteSession {
    core: Arc<WriteCore>,
}

impl WriteSession {
    /// Opens a write session over `transport` and sends the init request.
    ///
    /// # Errors
    /// Returns an error if the settings are invalid, or an executor or the
    /// batch timer thread cannot be created.
    pub fn new(settings: WriteSessionSettings, transport: Arc<dyn Transport>) -> SessionResult<Self> {
        settings.validate()?;
        let handlers_executor = match settings.handlers.executor() {
            Some(executor) => Arc::clone(executor),
            None => executor_for(1)?,
        };
        let compression = match &settings.compression_executor {
            Some(executor) => Arc::clone(executor),
            None => executor_for(2)?,
        };
        let controller = FlowController::new(settings.flow.clone())?;
        let pump = EventPump::new(
            format!("write:{}", settings.path),
            Box::new(settings.handlers.clone()),
            handlers_executor,
        );

        let core = Arc::new(WriteCore {
            settings,
            controller,
            pump,
            transport,
            compression,
            state: Mutex::new(WriteState {
                phase: Phase::Connecting,
                messages: VecDeque::new(),
                session_id: None,
                partition_id: None,
                init_seq_no: None,
                retry: RetryStreak::default(),
                held_since: None,
                flush_forced: false,
            }),
            changed: Condvar::new(),
            send_lock: Mutex::new(()),
            flush_requested: AtomicBool::new(false),
            outbox: Mutex::new(Outbox {
                events: VecDeque::new(),
                emitter: None,
            }),
            drained: Condvar::new(),
        });

        let weak: Weak<WriteCore> = Arc::downgrade(&core);
        core.controller.set_release_hook(Arc::new(move || {
            if let Some(core) = weak.upgrade() {
                core.refill_tokens();
            }
        }));

        if let Some(interval) = core.settings.batch_window() {
            spawn_batch_timer(&core, interval)?;
        }

        info!(
            path = %core.settings.path,
            producer_id = ?core.settings.producer_id,
            codec = %core.settings.codec,
            batch_interval_ms = ?core.settings.batch_window().map(|interval| interval.as_millis()),
            "Opening write session"
        );
        core.send_init();
        core.refill_tokens();
        Ok(Self { core })
    }

    /// Submits one message in exchange for `token`.
    ///
    /// The write is resolved later by an `Acks` event. An automatic sequence
    /// number is assigned unless the message carries one.
    ///
    /// # Errors
    /// - `Flow(InvalidToken)` if the token was used or belongs to another session
    /// - `Flow(MixedSeqNo)` if explicit and automatic numbering are mixed
    /// - `Closed` once the session closed
    pub fn write(&self, token: ContinuationToken, message: WriteMessage) -> SessionResult<()> {
        self.core.write(token, message)
    }

    /// Submits a message whose payload is already compressed.
    ///
    /// # Errors
    /// Returns `ContractViolation` if the message is not marked compressed or
    /// its codec is not registered, and otherwise the errors of
    /// [`write`](Self::write).
    pub fn write_encoded(&self, token: ContinuationToken, message: WriteMessage) -> SessionResult<()> {
        let Some(precompressed) = message.precompressed else {
            return Err(SessionError::ContractViolation {
                reason: "write_encoded needs a precompressed message".to_string(),
            });
        };
        if !self.core.settings.codecs.contains(precompressed.codec) {
            return Err(SessionError::ContractViolation {
                reason: format!("codec {} is not registered", precompressed.codec),
            });
        }
        self.core.write(token, message)
    }

    /// Feeds a message received from the service.
    pub fn handle_server_message(&self, message: WriteServerMessage) {
        match message {
            WriteServerMessage::InitResponse(response) => self.core.on_init(&response),
            WriteServerMessage::WriteResponse(response) => self.core.on_write_response(response),
        }
    }

    /// Reports that the stream broke.
    ///
    /// Retryable failures reconnect as the retry policy allows; anything else
    /// closes the session.
    pub fn handle_connection_lost(&self, status: SessionStatus) {
        self.core.on_connection_lost(status);
    }

    /// Sends messages held for batching without waiting for the batch to
    /// fill.
    pub fn flush(&self) {
        self.core.force_flush();
    }

    /// Sends anything held for batching, waits up to `timeout` for every
    /// accepted write to be acknowledged, then closes the session.
    ///
    /// Returns true if nothing had to be discarded. Writes still pending at
    /// the deadline are resolved as `Discarded`. Every acknowledgement and
    /// the closing event are dispatched before this returns, unless it is
    /// called from a handler that is itself being dispatched.
    pub fn close(&self, timeout: Duration) -> bool {
        self.core.close(timeout)
    }

    /// Returns the last sequence number the service reported on init.
    ///
    /// # Errors
    /// Returns `Timeout` if no init response arrived within `timeout`, or
    /// `Closed` if the session closed first.
    pub fn init_seq_no(&self, timeout: Duration) -> SessionResult<u64> {
        let deadline = Instant::now() + timeout;
        let mut state = self.core.state.lock();
        loop {
            if let Some(seq_no) = state.init_seq_no {
                return Ok(seq_no);
            }
            if state.phase == Phase::Closed {
                return Err(SessionError::Closed);
            }
            if self
                .core
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.init_seq_no.ok_or(SessionError::Timeout {
                    operation: "write init response",
                });
            }
        }
    }

    /// Returns the default wait for the init response.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.core.settings.connect_timeout
    }

    /// Takes the next queued event.
    pub fn get_event(&self, block: bool) -> Option<WriteSessionEvent> {
        self.core.pump.get_event(block)
    }

    /// Takes up to `max` queued events.
    pub fn get_events(&self, block: bool, max: Option<usize>) -> Vec<WriteSessionEvent> {
        self.core.pump.get_events(block, max)
    }

    /// Resolves once an event is queued or the session closed.
    pub async fn wait_event(&self) {
        self.core.pump.wait_event().await;
    }

    /// Returns the server-assigned session id, once connected.
    #[must_use]
    pub fn session_id(&self) -> Option<WriteSessionId> {
        self.core.state.lock().session_id
    }

    /// Returns the partition written to, once connected.
    #[must_use]
    pub fn partition_id(&self) -> Option<PartitionId> {
        self.core.state.lock().partition_id
    }

    /// Returns true once the session closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.state.lock().phase == Phase::Closed
    }

    /// Returns flow-control statistics.
    #[must_use]
    pub fn stats(&self) -> FlowStats {
        self.core.controller.stats()
    }

    /// Returns the session's counters.
    #[must_use]
    pub fn counters(&self) -> &Arc<WriterCounters> {
        &self.core.settings.counters
    }
}

impl Drop for WriteSession {
    fn drop(&mut self) {
        self.core.terminate(SessionStatus::closed_by_client());
    }
}

impl std::fmt::Debug for WriteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("WriteSession")
            .field("path", &self.core.settings.path)
            .field("phase", &state.phase)
            .field("session_id", &state.session_id)
            .field("pending", &state.messages.len())
            .finish_non_exhaustive()
    }
}

impl WriteCore {
    // ---- Submission ----

    fn write(self: &Arc<Self>, mut token: ContinuationToken, message: WriteMessage) -> SessionResult<()> {
        let uncompressed_size = message.uncompressed_size();
        let (accepted, compress, ready) = {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return Err(SessionError::Closed);
            }
            let accepted = match self.controller.accept(&mut token, message.seq_no, uncompressed_size) {
                Ok(accepted) => accepted,
                Err(FlowError::Closed) => return Err(SessionError::Closed),
                Err(e) => return Err(e.into()),
            };

            let (codec, payload) = match message.precompressed {
                Some(precompressed) => (precompressed.codec, Some(message.data.clone())),
                None if self.settings.codec == CodecId::RAW => {
                    (CodecId::RAW, Some(message.data.clone()))
                }
                None => (self.settings.codec, None),
            };
            if let Some(payload) = &payload {
                self.controller
                    .on_compressed(accepted.position, uncompressed_size, payload.len() as u64);
            }
            let compress = (payload.is_none() && !accepted.duplicate)
                .then(|| (message.data.clone(), codec));
            state.messages.push_back(Pending {
                position: accepted.position,
                seq_no: accepted.seq_no,
                duplicate: accepted.duplicate,
                sent: false,
                codec,
                uncompressed_size,
                payload,
                created_at: message.created_at.unwrap_or_else(Timestamp::now),
                message,
            });
            (accepted, compress, state.phase == Phase::Ready)
        };
        self.settings.counters.record_accepted(uncompressed_size);
        debug!(seq_no = accepted.seq_no, bytes = uncompressed_size, "Accepted write");

        if let Some((data, codec)) = compress {
            self.schedule_compression(accepted.position, data, codec);
        }
        if ready {
            if accepted.duplicate {
                self.resolve_duplicates();
            }
            self.flush();
        }
        self.refill_tokens();
        Ok(())
    }

    fn schedule_compression(self: &Arc<Self>, position: u64, data: Bytes, codec: CodecId) {
        let level = self.settings.compression_level;
        let weak = Arc::downgrade(self);
        let job_data = data.clone();
        let submitted = self.compression.submit(Box::new(move || {
            if let Some(core) = weak.upgrade() {
                let result = core.settings.codecs.compress(codec, &job_data, level);
                core.on_compressed(position, result);
            }
        }));
        if let Err(e) = submitted {
            warn!(
                executor = %self.compression.name(),
                error = %e,
                "Compression executor rejected job, compressing inline"
            );
            let result = self.settings.codecs.compress(codec, &data, level);
            self.on_compressed(position, result);
        }
    }

    fn on_compressed(&self, position: u64, result: Result<Bytes, CodecError>) {
        let failure = {
            let mut state = self.state.lock();
            let Some(front) = state.messages.front().map(|pending| pending.position) else {
                return;
            };
            let Some(index) = position
                .checked_sub(front)
                .and_then(|index| usize::try_from(index).ok())
            else {
                return;
            };
            let Some(pending) = state.messages.get_mut(index) else {
                return;
            };
            match result {
                Ok(payload) => {
                    self.controller.on_compressed(
                        pending.position,
                        pending.uncompressed_size,
                        payload.len() as u64,
                    );
                    pending.payload = Some(payload);
                    None
                }
                Err(e) => Some(e),
            }
        };
        match failure {
            None => self.flush(),
            Some(e) => {
                error!(error = %e, "Compression failed");
                self.settings.counters.record_error();
                self.terminate(SessionStatus::new(
                    StatusCode::InternalError,
                    format!("compression failed: {e}"),
                ));
            }
        }
    }

    // ---- Sending ----

    /// Sends every ready message in order. Reentrant: a call made while
    /// another thread is sending is picked up by that thread.
    fn flush(&self) {
        self.flush_requested.store(true, Ordering::Release);
        loop {
            let Some(guard) = self.send_lock.try_lock() else {
                return;
            };
            while self.flush_requested.swap(false, Ordering::AcqRel) {
                self.send_ready();
            }
            drop(guard);
            if !self.flush_requested.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn force_flush(&self) {
        self.state.lock().flush_forced = true;
        self.flush();
    }

    fn send_ready(&self) {
        let requests = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.phase != Phase::Ready || !self.batch_due(state) {
                return;
            }
            state.held_since = None;
            let mut requests: Vec<WriteRequest> = Vec::new();
            for pending in &mut state.messages {
                if pending.duplicate || pending.sent {
                    continue;
                }
                let Some(payload) = &pending.payload else {
                    break;
                };
                pending.sent = true;
                self.controller.on_sent(pending.position);
                let message = WriteRequestMessage {
                    seq_no: pending.seq_no,
                    created_at: pending.created_at,
                    data: payload.clone(),
                    uncompressed_size: pending.uncompressed_size,
                    meta: pending.message.meta.clone(),
                    tx_id: pending.message.tx_id.clone(),
                };
                match requests.last_mut() {
                    Some(request) if request.codec == pending.codec => {
                        request.messages.push(message);
                    }
                    _ => requests.push(WriteRequest {
                        codec: pending.codec,
                        messages: vec![message],
                    }),
                }
            }
            if all_sent(&state.messages) {
                state.flush_forced = false;
            }
            requests
        };

        for request in requests {
            let bytes: u64 = request.messages.iter().map(|m| m.data.len() as u64).sum();
            let count = request.messages.len();
            if let Err(e) = self.transport.send(ClientMessage::Write(request)) {
                // Nothing more goes out on this stream; unacknowledged messages
                // are resent in order after the next init.
                warn!(error = %e, count, "Failed to send write request");
                self.settings.counters.record_error();
                let mut state = self.state.lock();
                if state.phase == Phase::Ready {
                    state.phase = Phase::Connecting;
                }
                return;
            }
            self.settings.counters.record_sent(bytes);
            debug!(count, bytes, "Sent write request");
        }
    }

    /// Returns true if the ready messages go out now. A batching writer holds
    /// them until enough bytes are ready, the oldest waited a full interval,
    /// or a flush is forced.
    fn batch_due(&self, state: &mut WriteState) -> bool {
        let Some(interval) = self.settings.batch_window() else {
            return true;
        };
        let ready = ready_bytes(&state.messages);
        if ready == 0 {
            state.held_since = None;
            if all_sent(&state.messages) {
                state.flush_forced = false;
            }
            return false;
        }
        if state.flush_forced || ready >= self.settings.batch_flush_size_bytes {
            return true;
        }
        match state.held_since {
            Some(since) => since.elapsed() >= interval,
            None => {
                state.held_since = Some(Instant::now());
                debug!(bytes = ready, "Holding messages for batch");
                self.changed.notify_all();
                false
            }
        }
    }

    /// Blocks until a held batch is due and returns when it started waiting.
    /// The batch started at `fired` was already reported and is not
    /// reported again. Returns `None` once the session closed.
    fn await_batch_due(&self, interval: Duration, fired: Option<Instant>) -> Option<Instant> {
        let mut state = self.state.lock();
        loop {
            match (state.phase, state.held_since) {
                (Phase::Closed, _) => return None,
                (Phase::Ready, Some(since)) if fired != Some(since) => {
                    let due = since + interval;
                    if Instant::now() >= due {
                        return Some(since);
                    }
                    self.changed.wait_until(&mut state, due);
                }
                (Phase::Ready, Some(_)) => {
                    self.changed.wait_for(&mut state, interval);
                }
                _ => self.changed.wait(&mut state),
            }
        }
    }

    fn send_init(&self) {
        let settings = &self.settings;
        let request = WriteInitRequest {
            path: settings.path.clone(),
            producer_id: settings.producer_id.clone(),
            message_group_id: settings.message_group_id.clone(),
            partition_id: settings.partition_id,
            deduplication_enabled: settings.deduplication_enabled,
            session_meta: settings.session_meta.clone(),
        };
        if let Err(e) = self.transport.send(ClientMessage::WriteInit(request)) {
            warn!(error = %e, "Failed to send write init request");
            self.on_connection_lost(SessionStatus::new(
                StatusCode::TransportUnavailable,
                e.to_string(),
            ));
        }
    }

    // ---- Server messages ----

    fn on_init(&self, response: &WriteInitResponse) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.phase == Phase::Closed {
                return;
            }
            let assigned = self.controller.set_init_seq_no(response.last_seq_no);
            for (pending, assigned) in state.messages.iter_mut().zip(assigned) {
                pending.seq_no = assigned.seq_no;
                pending.duplicate = assigned.duplicate;
                pending.sent = false;
            }
            self.controller.mark_unsent();
            state.phase = Phase::Ready;
            state.held_since = None;
            state.flush_forced = true;
            state.session_id = Some(response.session_id);
            state.partition_id = Some(response.partition_id);
            state.init_seq_no.get_or_insert(response.last_seq_no);
            state.retry.reset();
            info!(
                session_id = %response.session_id,
                partition_id = %response.partition_id,
                last_seq_no = response.last_seq_no,
                pending = state.messages.len(),
                "Write session ready"
            );
        }
        self.changed.notify_all();
        self.resolve_duplicates();
        self.flush();
    }

    fn on_write_response(&self, response: WriteResponse) {
        {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                debug!(count = response.acks.len(), "Ignoring acks after close");
                return;
            }
            let mut acks = Vec::with_capacity(response.acks.len());
            self.drain_duplicates(&mut state, &mut acks);
            for ack in response.acks {
                if let Err(e) = self.controller.acknowledge(ack.seq_no) {
                    warn!(seq_no = ack.seq_no, error = %e, "Ignoring unexpected acknowledgement");
                    self.settings.counters.record_error();
                    continue;
                }
                state.messages.pop_front();
                let ack_state = match ack.outcome {
                    ServerWriteOutcome::Written { offset } => {
                        self.settings.counters.record_written();
                        WriteAckState::Written {
                            offset,
                            partition_id: response.partition_id,
                            stat: response.stat,
                        }
                    }
                    ServerWriteOutcome::AlreadyWritten => {
                        self.settings.counters.record_already_written();
                        WriteAckState::AlreadyWritten
                    }
                };
                acks.push(WriteAck {
                    seq_no: ack.seq_no,
                    state: ack_state,
                });
                self.drain_duplicates(&mut state, &mut acks);
            }
            self.queue_acks(acks);
        }
        self.changed.notify_all();
        self.emit();
        self.refill_tokens();
    }

    fn on_connection_lost(&self, status: SessionStatus) {
        let decision = {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Connecting;
            state
                .retry
                .on_failure(self.settings.retry_policy.as_ref(), &status)
        };

        match decision {
            RetryDecision::Retry(delay) => {
                info!(status = %status, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "Reconnecting write session");
                match self.transport.reconnect(delay) {
                    Ok(()) => self.send_init(),
                    Err(e) => self.on_connection_lost(SessionStatus::new(
                        StatusCode::TransportUnavailable,
                        e.to_string(),
                    )),
                }
            }
            RetryDecision::Stop => {
                self.settings.counters.record_error();
                self.terminate(status);
            }
        }
    }

    // ---- Resolution ----

    /// Moves leading local duplicates out of the queue as `AlreadyWritten`.
    fn drain_duplicates(&self, state: &mut WriteState, acks: &mut Vec<WriteAck>) {
        for seq_no in self.controller.drain_local_duplicates() {
            state.messages.pop_front();
            self.settings.counters.record_already_written();
            acks.push(WriteAck {
                seq_no,
                state: WriteAckState::AlreadyWritten,
            });
        }
    }

    fn resolve_duplicates(&self) {
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Ready {
                return;
            }
            let mut acks = Vec::new();
            self.drain_duplicates(&mut state, &mut acks);
            if acks.is_empty() {
                return;
            }
            self.queue_acks(acks);
        }
        self.changed.notify_all();
        self.emit();
        self.refill_tokens();
    }

    fn refill_tokens(&self) {
        let tokens = self.controller.mint_tokens();
        if tokens.is_empty() {
            return;
        }
        self.outbox.lock().events.extend(
            tokens
                .into_iter()
                .map(|token| WriteSessionEvent::ReadyToAccept(ReadyToAcceptEvent { token })),
        );
        self.emit();
    }

    // ---- Emission ----

    /// Queues acknowledgements for dispatch. Callers hold the state lock, so
    /// acks leave in the order the queue resolved them.
    fn queue_acks(&self, acks: Vec<WriteAck>) {
        if !acks.is_empty() {
            self.outbox
                .lock()
                .events
                .push_back(WriteSessionEvent::Acks(AcksEvent { acks }));
        }
    }

    /// Dispatches queued events in order. A call made while another thread
    /// is dispatching leaves the events to that thread, as does a handler
    /// that runs inline and produces more events.
    ///
    /// Must not be called while holding the state lock.
    fn emit(&self) {
        {
            let mut outbox = self.outbox.lock();
            if outbox.emitter.is_some() {
                return;
            }
            outbox.emitter = Some(thread::current().id());
        }
        loop {
            let event = {
                let mut outbox = self.outbox.lock();
                if let Some(event) = outbox.events.pop_front() {
                    event
                } else {
                    outbox.emitter = None;
                    drop(outbox);
                    self.drained.notify_all();
                    return;
                }
            };
            self.pump.dispatch(event);
        }
    }

    /// Waits until every queued event was dispatched, or `deadline` passes.
    /// Returns at once on the dispatching thread.
    fn wait_drained(&self, deadline: Instant) {
        let current = thread::current().id();
        let mut outbox = self.outbox.lock();
        while outbox.emitter.is_some() || !outbox.events.is_empty() {
            if outbox.emitter == Some(current)
                || self.drained.wait_until(&mut outbox, deadline).timed_out()
            {
                return;
            }
        }
    }

    // ---- Closing ----

    fn close(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.controller.close();
        self.force_flush();
        {
            let mut state = self.state.lock();
            while state.phase != Phase::Closed && !self.controller.is_idle() {
                if self.changed.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
        }
        self.terminate(SessionStatus::closed_by_client());
        self.wait_drained(deadline.max(Instant::now() + CLOSE_DISPATCH_GRACE));
        self.controller.stats().total_discarded == 0
    }

    /// Closes the session once, resolving every pending write. The discarded
    /// acks and the closing event queue behind acks already resolved.
    fn terminate(&self, status: SessionStatus) -> bool {
        {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return false;
            }
            state.phase = Phase::Closed;
            self.controller.close();
            let mut acks = Vec::new();
            self.drain_duplicates(&mut state, &mut acks);
            let discarded = self.controller.discard_all();
            self.settings
                .counters
                .record_discarded(discarded.len() as u64);
            acks.extend(discarded.into_iter().map(|seq_no| WriteAck {
                seq_no,
                state: WriteAckState::Discarded,
            }));
            state.messages.clear();
            state.held_since = None;
            info!(path = %self.settings.path, status = %status, "Write session closed");
            self.queue_acks(acks);
            self.outbox
                .lock()
                .events
                .push_back(WriteSessionEvent::SessionClosed(SessionClosedEvent { status }));
        }
        self.changed.notify_all();
        self.emit();
        true
    }
}

/// How long `close` waits for another thread to dispatch the closing event
/// once its own deadline passed.
const CLOSE_DISPATCH_GRACE: Duration = Duration::from_millis(100);

/// Bytes of the unsent messages that can go out now, in submission order.
fn ready_bytes(messages: &VecDeque<Pending>) -> u64 {
    let mut bytes = 0;
    for pending in messages.iter().filter(|pending| !pending.duplicate && !pending.sent) {
        match &pending.payload {
            Some(payload) => bytes += payload.len() as u64,
            None => break,
        }
    }
    bytes
}

fn all_sent(messages: &VecDeque<Pending>) -> bool {
    messages.iter().all(|pending| pending.duplicate || pending.sent)
}

fn spawn_batch_timer(core: &Arc<WriteCore>, interval: Duration) -> SessionResult<()> {
    let weak = Arc::downgrade(core);
    let name = format!("skein-batch:{}", core.settings.path);
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || run_batch_timer(&weak, interval))
        .map_err(|source| ExecutorError::Spawn { name, source })?;
    Ok(())
}

/// Sends held batches once their interval elapses. Exits when the session
/// closes.
fn run_batch_timer(weak: &Weak<WriteCore>, interval: Duration) {
    let mut fired = None;
    while let Some(core) = weak.upgrade() {
        let Some(since) = core.await_batch_due(interval, fired) else {
            return;
        };
        fired = Some(since);
        core.flush();
    }
}
