//! Read session: partition assignment, ordered delivery and commits.
//!
//! # Lifecycle
//!
//! ```text
//!   new() ──▶ Connecting ──init response──▶ Ready ──close()/fatal──▶ Closed
//!                 ▲                            │
//!                 └──── retryable loss ────────┘   (partition sessions close)
//! ```
//!
//! # Delivery
//!
//! Every event passes through one FIFO of slots. Data events reserve their
//! slot when the response arrives and fill it once decompressed, so events
//! leave in arrival order whatever order decompression finishes in:
//!
//! ```text
//!   ReadResponse ──▶ reserve slot ──decompression executor──▶ fill slot
//!   other message ──▶ push filled slot                            │
//!                                                                 ▼
//!                        front slots, while filled ──▶ pump ──▶ handlers / queue
//! ```
//!
//! Received bytes count against the memory grant sent with `ReadRequest`.
//! They are granted again when the data event that holds them is dropped,
//! unless the connection was replaced in between.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use skein_core::{Offset, PartitionSessionId, ReadSessionId};
use skein_executor::{executor_for, inline_executor, Executor};
use tracing::{debug, info, warn};

use crate::counters::ReaderCounters;
use crate::error::{SessionError, SessionResult};
use crate::partition_session::{
    BufferedData, ClosedReason, PartitionSession, PartitionSessionState, ReadControl,
};
use crate::protocol::{
    ClientMessage, CommitOffsetRequest, CommitOffsetResponse, CommitRange, PartitionData,
    PartitionSessionStatusRequest, PartitionSessionStatusResponse, ReadInitRequest,
    ReadInitResponse, ReadRequest, ReadResponse, ReadServerMessage, StartPartitionSessionRequest,
    StartPartitionSessionResponse, StopPartitionSessionRequest, StopPartitionSessionResponse,
};
use crate::pump::EventPump;
use crate::read_event::{
    CommitOffsetAcknowledgementEvent, CompressedMessage, DataPayload, DataReceivedEvent,
    DecompressionError, Message, MessageInfo, PartitionSessionClosedEvent,
    PartitionSessionStatusEvent, ReadBudget, ReadSessionEvent, StartPartitionSessionEvent,
    StopPartitionSessionEvent,
};
use crate::retry::{RetryDecision, RetryStreak};
use crate::settings::ReadSessionSettings;
use crate::status::{SessionClosedEvent, SessionStatus, StatusCode};
use crate::transport::Transport;

/// Distinguishes read sessions when commits are grouped.
static NEXT_SESSION_KEY: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Ready,
    Closed,
}

struct ReadState {
    phase: Phase,
    session_id: Option<ReadSessionId>,
    partition_sessions: HashMap<PartitionSessionId, Arc<PartitionSession>>,
    /// Highest commit end sent and not yet acknowledged, per partition session.
    outstanding_commits: HashMap<PartitionSessionId, Offset>,
    retry: RetryStreak,
}

// ---- Ordered emission ----

struct Slot {
    id: u64,
    filled: bool,
    /// `None` once filled means the slot produced nothing.
    event: Option<ReadSessionEvent>,
}

#[derive(Default)]
struct Emission {
    next_id: u64,
    slots: VecDeque<Slot>,
}

impl Emission {
    fn reserve(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.push_back(Slot {
            id,
            filled: false,
            event: None,
        });
        id
    }

    fn fill(&mut self, id: u64, event: Option<ReadSessionEvent>) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.id == id) {
            slot.filled = true;
            slot.event = event;
        }
    }

    fn push(&mut self, event: ReadSessionEvent) {
        let id = self.reserve();
        self.fill(id, Some(event));
    }

    /// Pops the front slot if it is filled.
    fn pop_filled(&mut self) -> Option<Option<ReadSessionEvent>> {
        if !self.slots.front()?.filled {
            return None;
        }
        self.slots.pop_front().map(|slot| slot.event)
    }
}

/// A reserved slot. Dropping it unfilled releases the slot empty, so that
/// decode work discarded by a stopping executor cannot stall delivery.
struct SlotTicket {
    core: Weak<ReadCore>,
    id: u64,
    filled: bool,
}

impl SlotTicket {
    fn fill(mut self, event: Option<ReadSessionEvent>) {
        self.filled = true;
        if let Some(core) = self.core.upgrade() {
            core.fill_slot(self.id, event);
        }
    }
}

impl Drop for SlotTicket {
    fn drop(&mut self) {
        if self.filled {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            core.fill_slot(self.id, None);
        }
    }
}

/// Data of one partition session waiting to be decoded into an event.
struct DecodeWork {
    ticket: SlotTicket,
    session: Arc<PartitionSession>,
    data: PartitionData,
    budget: ReadBudget,
    /// Messages below this offset were already delivered.
    from: Offset,
}

// ---- Session ----

struct ReadCore {
    key: u64,
    self_ref: Weak<ReadCore>,
    settings: ReadSessionSettings,
    pump: EventPump<ReadSessionEvent>,
    transport: Arc<dyn Transport>,
    decompression: Arc<dyn Executor>,
    state: Mutex<ReadState>,
    /// Signalled on init, commit acknowledgement and close.
    changed: Condvar,
    /// Bumped whenever the connection is replaced or closed.
    generation: AtomicU64,
    emission: Mutex<Emission>,
    emitting: Mutex<()>,
    emit_requested: AtomicBool,
}

/// A read session.
///
/// Partitions are assigned by the service and must be confirmed before data
/// flows. Data events of one partition arrive in increasing offset order.
pub struct ReadSession {
    core: Arc<ReadCore>,
}

impl ReadSession {
    /// Opens a read session over `transport` and sends the init request.
    ///
    /// # Errors
    /// Returns an error if the settings are invalid or an executor cannot be
    /// created.
    pub fn new(settings: ReadSessionSettings, transport: Arc<dyn Transport>) -> SessionResult<Self> {
        settings.validate()?;
        let handlers_executor = match settings.handlers.executor() {
            Some(executor) => Arc::clone(executor),
            None => executor_for(1)?,
        };
        let decompression = match &settings.decompression_executor {
            Some(executor) => Arc::clone(executor),
            None if settings.decompress => executor_for(2)?,
            None => inline_executor(),
        };
        let consumer = settings.consumer.as_deref().unwrap_or("<none>");
        let pump = EventPump::new(
            format!("read:{consumer}"),
            Box::new(settings.handlers.clone()),
            handlers_executor,
        );

        let core = Arc::new_cyclic(|self_ref| ReadCore {
            key: NEXT_SESSION_KEY.fetch_add(1, Ordering::Relaxed),
            self_ref: self_ref.clone(),
            settings,
            pump,
            transport,
            decompression,
            state: Mutex::new(ReadState {
                phase: Phase::Connecting,
                session_id: None,
                partition_sessions: HashMap::new(),
                outstanding_commits: HashMap::new(),
                retry: RetryStreak::default(),
            }),
            changed: Condvar::new(),
            generation: AtomicU64::new(0),
            emission: Mutex::new(Emission::default()),
            emitting: Mutex::new(()),
            emit_requested: AtomicBool::new(false),
        });

        info!(
            consumer = ?core.settings.consumer,
            topics = core.settings.topics.len(),
            max_memory_usage_bytes = core.settings.max_memory_usage_bytes,
            "Opening read session"
        );
        core.send_init();
        Ok(Self { core })
    }

    /// Feeds a message received from the service.
    pub fn handle_server_message(&self, message: ReadServerMessage) {
        match message {
            ReadServerMessage::InitResponse(response) => self.core.on_init(&response),
            ReadServerMessage::StartPartitionSession(request) => self.core.on_start(request),
            ReadServerMessage::StopPartitionSession(request) => self.core.on_stop(&request),
            ReadServerMessage::Read(response) => self.core.on_read(response),
            ReadServerMessage::CommitOffset(response) => self.core.on_commit_response(&response),
            ReadServerMessage::PartitionSessionStatus(response) => self.core.on_status(&response),
        }
    }

    /// Reports that the stream broke.
    ///
    /// Every partition session closes with `ConnectionLost`. Retryable
    /// failures reconnect as the retry policy allows; anything else closes
    /// the session.
    pub fn handle_connection_lost(&self, status: SessionStatus) {
        self.core.on_connection_lost(status);
    }

    /// Waits up to `timeout` for sent commits to be acknowledged, then closes
    /// the session.
    ///
    /// Returns true if every commit was acknowledged in time.
    pub fn close(&self, timeout: Duration) -> bool {
        self.core.close(timeout)
    }

    /// Takes the next queued event.
    pub fn get_event(&self, block: bool) -> Option<ReadSessionEvent> {
        self.core.pump.get_event(block)
    }

    /// Takes up to `max` queued events.
    pub fn get_events(&self, block: bool, max: Option<usize>) -> Vec<ReadSessionEvent> {
        self.core.pump.get_events(block, max)
    }

    /// Resolves once an event is queued or the session closed.
    pub async fn wait_event(&self) {
        self.core.pump.wait_event().await;
    }

    /// Returns the server-assigned session id, once connected.
    #[must_use]
    pub fn session_id(&self) -> Option<ReadSessionId> {
        self.core.state.lock().session_id
    }

    /// Returns true once the session closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.state.lock().phase == Phase::Closed
    }

    /// Returns the open partition sessions, ordered by id.
    #[must_use]
    pub fn partition_sessions(&self) -> Vec<Arc<PartitionSession>> {
        let mut sessions: Vec<_> = self
            .core
            .state
            .lock()
            .partition_sessions
            .values()
            .cloned()
            .collect();
        sessions.sort_by_key(|session| session.id());
        sessions
    }

    /// Returns the session's counters.
    #[must_use]
    pub fn counters(&self) -> &Arc<ReaderCounters> {
        &self.core.settings.counters
    }
}

impl Drop for ReadSession {
    fn drop(&mut self) {
        self.core.terminate(SessionStatus::closed_by_client());
    }
}

impl std::fmt::Debug for ReadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("ReadSession")
            .field("consumer", &self.core.settings.consumer)
            .field("phase", &state.phase)
            .field("session_id", &state.session_id)
            .field("partition_sessions", &state.partition_sessions.len())
            .finish_non_exhaustive()
    }
}

impl ReadCore {
    fn control(&self) -> Weak<dyn ReadControl> {
        self.self_ref.clone()
    }

    fn send(&self, message: ClientMessage) -> SessionResult<()> {
        self.transport.send(message).map_err(|e| {
            self.settings.counters.record_error();
            SessionError::from(e)
        })
    }

    fn send_init(&self) {
        let request = ReadInitRequest {
            consumer: self.settings.consumer.clone(),
            topics: self.settings.topics.clone(),
        };
        if let Err(e) = self.transport.send(ClientMessage::ReadInit(request)) {
            warn!(error = %e, "Failed to send read init request");
            self.on_connection_lost(SessionStatus::new(
                StatusCode::TransportUnavailable,
                e.to_string(),
            ));
        }
    }

    // ---- Server messages ----

    fn on_init(&self, response: &ReadInitResponse) {
        {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Ready;
            state.session_id = Some(response.session_id);
            state.retry.reset();
        }
        self.changed.notify_all();
        info!(session_id = %response.session_id, "Read session ready");

        let grant = ReadRequest {
            bytes_size: self.settings.max_memory_usage_bytes,
        };
        if let Err(e) = self.send(ClientMessage::Read(grant)) {
            warn!(error = %e, "Failed to send initial read request");
        }
    }

    fn on_start(&self, request: StartPartitionSessionRequest) {
        let session = Arc::new(PartitionSession::new(
            request.partition_session_id,
            request.path,
            request.partition_id,
            request.committed_offset,
            request.end_offset,
            self.control(),
            self.key,
        ));
        {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return;
            }
            if state.partition_sessions.contains_key(&session.id()) {
                warn!(partition_session_id = %session.id(), "Ignoring start of a known partition session");
                return;
            }
            state
                .partition_sessions
                .insert(session.id(), Arc::clone(&session));
            self.settings.counters.record_partition_started();
            debug!(
                partition_session_id = %session.id(),
                path = %session.path(),
                partition_id = %session.partition_id(),
                committed_offset = %request.committed_offset,
                "Partition session requested"
            );
            self.emission.lock().push(ReadSessionEvent::StartPartitionSession(
                StartPartitionSessionEvent::new(
                    session,
                    request.committed_offset,
                    request.end_offset,
                ),
            ));
        }
        self.emit();
    }

    fn on_stop(&self, request: &StopPartitionSessionRequest) {
        let mut released = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(session) = state
                .partition_sessions
                .get(&request.partition_session_id)
                .cloned()
            else {
                warn!(partition_session_id = %request.partition_session_id, "Stop for unknown partition session");
                return;
            };
            if request.graceful && session.begin_stop(request.committed_offset) {
                debug!(partition_session_id = %session.id(), "Partition session stop requested");
                self.emission.lock().push(ReadSessionEvent::StopPartitionSession(
                    StopPartitionSessionEvent::new(session, request.committed_offset),
                ));
            } else if request.graceful && session.state() != PartitionSessionState::Requested {
                debug!(partition_session_id = %session.id(), "Repeated stop request");
            } else {
                // Unconfirmed sessions cannot stop gracefully.
                session.on_committed(request.committed_offset);
                released = self.close_partition(&mut state, &session, ClosedReason::Lost);
            }
        }
        drop(released);
        self.emit();
    }

    fn on_read(&self, response: ReadResponse) {
        let weights: Vec<u64> = response
            .partition_data
            .iter()
            .map(|data| {
                data.batches
                    .iter()
                    .flat_map(|batch| &batch.messages)
                    .map(|message| message.data.len() as u64)
                    .sum()
            })
            .collect();
        let shares = split_bytes(response.bytes_size, &weights);
        let generation = self.generation.load(Ordering::Acquire);

        let mut works = Vec::new();
        let mut released = Vec::new();
        {
            let state = self.state.lock();
            if state.phase != Phase::Ready {
                debug!(bytes = response.bytes_size, "Ignoring data outside a live connection");
                return;
            }
            for (data, bytes) in response.partition_data.into_iter().zip(shares) {
                let budget = ReadBudget::new(self.control(), generation, bytes);
                let Some(session) = state.partition_sessions.get(&data.partition_session_id) else {
                    warn!(partition_session_id = %data.partition_session_id, "Data for unknown partition session");
                    released.push(budget);
                    continue;
                };
                let Some(data) = session.buffer(BufferedData { data, budget }) else {
                    debug!(partition_session_id = %session.id(), "Buffered data until confirmation");
                    continue;
                };
                match session.state() {
                    PartitionSessionState::Active | PartitionSessionState::StopRequested => {
                        match self.stage(session, data) {
                            Ok(work) => works.push(work),
                            Err(budget) => released.push(budget),
                        }
                    }
                    PartitionSessionState::Requested | PartitionSessionState::Closed(_) => {
                        released.push(data.budget);
                    }
                }
            }
        }
        drop(released);
        self.run_decodes(works);
    }

    fn on_commit_response(&self, response: &CommitOffsetResponse) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            for committed in &response.committed {
                let id = committed.partition_session_id;
                let Some(session) = state.partition_sessions.get(&id) else {
                    debug!(partition_session_id = %id, "Commit acknowledged for closed partition session");
                    continue;
                };
                session.on_committed(committed.committed_offset);
                if state
                    .outstanding_commits
                    .get(&id)
                    .is_some_and(|end| committed.committed_offset >= *end)
                {
                    state.outstanding_commits.remove(&id);
                }
                self.emission
                    .lock()
                    .push(ReadSessionEvent::CommitOffsetAcknowledgement(
                        CommitOffsetAcknowledgementEvent::new(
                            Arc::clone(session),
                            committed.committed_offset,
                        ),
                    ));
            }
        }
        self.changed.notify_all();
        self.emit();
    }

    fn on_status(&self, response: &PartitionSessionStatusResponse) {
        {
            let state = self.state.lock();
            let Some(session) = state.partition_sessions.get(&response.partition_session_id) else {
                debug!(partition_session_id = %response.partition_session_id, "Status for closed partition session");
                return;
            };
            session.on_status(
                response.committed_offset,
                response.end_offset,
                response.write_time_high_watermark,
            );
            self.emission.lock().push(ReadSessionEvent::PartitionSessionStatus(
                PartitionSessionStatusEvent {
                    session: Arc::clone(session),
                    committed_offset: session.committed_offset(),
                    read_offset: session.read_offset(),
                    end_offset: session.end_offset(),
                    write_time_high_watermark: response.write_time_high_watermark,
                },
            ));
        }
        self.emit();
    }

    fn on_connection_lost(&self, status: SessionStatus) {
        let (decision, released) = {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Connecting;
            self.generation.fetch_add(1, Ordering::AcqRel);
            let released = self.close_all(&mut state, ClosedReason::ConnectionLost);
            let decision = state
                .retry
                .on_failure(self.settings.retry_policy.as_ref(), &status);
            (decision, released)
        };
        drop(released);
        self.changed.notify_all();
        self.emit();

        match decision {
            RetryDecision::Retry(delay) => {
                info!(status = %status, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "Reconnecting read session");
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

    // ---- Partition sessions ----

    fn close_partition(
        &self,
        state: &mut ReadState,
        session: &Arc<PartitionSession>,
        reason: ClosedReason,
    ) -> Vec<BufferedData> {
        let Some(released) = session.close(reason) else {
            return Vec::new();
        };
        state.partition_sessions.remove(&session.id());
        state.outstanding_commits.remove(&session.id());
        self.settings.counters.record_partition_closed();
        self.emission.lock().push(ReadSessionEvent::PartitionSessionClosed(
            PartitionSessionClosedEvent::new(Arc::clone(session), reason),
        ));
        released
    }

    fn close_all(&self, state: &mut ReadState, reason: ClosedReason) -> Vec<BufferedData> {
        let mut sessions: Vec<_> = state.partition_sessions.values().cloned().collect();
        sessions.sort_by_key(|session| session.id());
        let mut released = Vec::new();
        for session in &sessions {
            released.extend(self.close_partition(state, session, reason));
        }
        state.outstanding_commits.clear();
        released
    }

    // ---- Delivery ----

    /// Reserves a slot for `buffered`. Called with the state lock held, so
    /// that slots of one partition are reserved in arrival order.
    ///
    /// Data without messages gives its budget back, for the caller to drop
    /// once the lock is released.
    fn stage(
        &self,
        session: &Arc<PartitionSession>,
        buffered: BufferedData,
    ) -> Result<DecodeWork, ReadBudget> {
        let BufferedData { data, budget } = buffered;
        let Some(last) = data
            .batches
            .iter()
            .filter_map(|batch| batch.messages.last())
            .map(|message| message.offset)
            .max()
        else {
            return Err(budget);
        };
        let from = session.advance_read(last.next());
        let id = self.emission.lock().reserve();
        Ok(DecodeWork {
            ticket: SlotTicket {
                core: self.self_ref.clone(),
                id,
                filled: false,
            },
            session: Arc::clone(session),
            data,
            budget,
            from,
        })
    }

    fn run_decodes(&self, works: Vec<DecodeWork>) {
        for work in works {
            let cell = Arc::new(Mutex::new(Some(work)));
            let job_cell = Arc::clone(&cell);
            let weak = self.self_ref.clone();
            let submitted = self.decompression.submit(Box::new(move || {
                let work = job_cell.lock().take();
                if let (Some(core), Some(work)) = (weak.upgrade(), work) {
                    core.decode(work);
                }
            }));
            if let Err(e) = submitted {
                warn!(
                    executor = %self.decompression.name(),
                    error = %e,
                    "Decompression executor rejected job, decoding inline"
                );
                let work = cell.lock().take();
                if let Some(work) = work {
                    self.decode(work);
                }
            }
        }
    }

    fn decode(&self, work: DecodeWork) {
        let DecodeWork {
            ticket,
            session,
            data,
            budget,
            from,
        } = work;
        let mut payload = if self.settings.decompress {
            DataPayload::Messages(Vec::new())
        } else {
            DataPayload::Compressed(Vec::new())
        };
        let mut bytes = 0_u64;

        for batch in data.batches {
            for message in batch.messages {
                if message.offset < from {
                    continue;
                }
                bytes += message.data.len() as u64;
                let info = MessageInfo {
                    offset: message.offset,
                    seq_no: message.seq_no,
                    created_at: message.created_at,
                    written_at: batch.written_at,
                    producer_id: batch.producer_id.clone(),
                    meta: message.meta,
                };
                match &mut payload {
                    DataPayload::Messages(messages) => {
                        let data = self
                            .settings
                            .codecs
                            .decompress(batch.codec, &message.data)
                            .map_err(|e| {
                                warn!(
                                    partition_session_id = %session.id(),
                                    offset = %message.offset,
                                    codec = %batch.codec,
                                    error = %e,
                                    "Decompression failed"
                                );
                                self.settings.counters.record_decompression_error();
                                DecompressionError {
                                    offset: message.offset,
                                    codec: batch.codec,
                                    message: e.to_string(),
                                }
                            });
                        messages.push(Message::new(data, info, Arc::clone(&session)));
                    }
                    DataPayload::Compressed(messages) => {
                        messages.push(CompressedMessage::new(
                            batch.codec,
                            message.data,
                            message.uncompressed_size,
                            info,
                            Arc::clone(&session),
                        ));
                    }
                }
            }
        }

        if payload.len() == 0 {
            debug!(partition_session_id = %session.id(), "Dropping already delivered data");
            ticket.fill(None);
            return;
        }
        self.settings
            .counters
            .record_read(payload.len() as u64, bytes);
        ticket.fill(Some(ReadSessionEvent::DataReceived(DataReceivedEvent::new(
            session, payload, budget,
        ))));
    }

    fn fill_slot(&self, id: u64, event: Option<ReadSessionEvent>) {
        self.emission.lock().fill(id, event);
        self.emit();
    }

    /// Dispatches filled slots from the front of the FIFO. Reentrant: a
    /// call made while another thread (or a handler) is emitting is picked
    /// up by that emitter.
    fn emit(&self) {
        self.emit_requested.store(true, Ordering::Release);
        loop {
            let Some(guard) = self.emitting.try_lock() else {
                return;
            };
            while self.emit_requested.swap(false, Ordering::AcqRel) {
                loop {
                    let next = self.emission.lock().pop_filled();
                    match next {
                        Some(Some(event)) => self.pump.dispatch(event),
                        Some(None) => {}
                        None => break,
                    }
                }
            }
            drop(guard);
            if !self.emit_requested.load(Ordering::Acquire) {
                return;
            }
        }
    }

    // ---- Closing ----

    fn close(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let clean = {
            let mut state = self.state.lock();
            while state.phase != Phase::Closed && !state.outstanding_commits.is_empty() {
                if self.changed.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            state.outstanding_commits.is_empty()
        };
        if !clean {
            warn!("Closing read session with unacknowledged commits");
        }
        self.terminate(SessionStatus::closed_by_client());
        clean
    }

    /// Closes the session once. Open partition sessions close with
    /// `ConnectionLost`; the session-closed event is emitted last.
    fn terminate(&self, status: SessionStatus) -> bool {
        let released = {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return false;
            }
            state.phase = Phase::Closed;
            self.generation.fetch_add(1, Ordering::AcqRel);
            let released = self.close_all(&mut state, ClosedReason::ConnectionLost);
            self.emission
                .lock()
                .push(ReadSessionEvent::SessionClosed(SessionClosedEvent {
                    status: status.clone(),
                }));
            released
        };
        drop(released);
        self.changed.notify_all();
        info!(consumer = ?self.settings.consumer, status = %status, "Read session closed");
        self.emit();
        true
    }
}

impl ReadControl for ReadCore {
    fn session_key(&self) -> u64 {
        self.key
    }

    fn confirm_start(
        &self,
        session: &Arc<PartitionSession>,
        read_offset: Option<Offset>,
        commit_offset: Option<Offset>,
    ) -> SessionResult<()> {
        let mut released = Vec::new();
        let works = {
            let state = self.state.lock();
            if state.phase == Phase::Closed {
                return Err(SessionError::Closed);
            }
            let buffered = session.activate(read_offset, commit_offset)?;
            let mut works = Vec::new();
            for data in buffered {
                match self.stage(session, data) {
                    Ok(work) => works.push(work),
                    Err(budget) => released.push(budget),
                }
            }
            works
        };
        drop(released);
        let response = StartPartitionSessionResponse {
            partition_session_id: session.id(),
            read_offset,
            commit_offset,
        };
        let sent = self.send(ClientMessage::StartPartitionSessionResponse(response));
        self.run_decodes(works);
        sent
    }

    fn confirm_stop(&self, session: &Arc<PartitionSession>) -> SessionResult<()> {
        match session.state() {
            PartitionSessionState::Closed(_) => return Ok(()),
            PartitionSessionState::StopRequested => {}
            current => {
                return Err(SessionError::InvalidState {
                    current: current.as_str(),
                    required: "stop-requested",
                });
            }
        }
        let response = StopPartitionSessionResponse {
            partition_session_id: session.id(),
        };
        self.send(ClientMessage::StopPartitionSessionResponse(response))?;
        let released = {
            let mut state = self.state.lock();
            self.close_partition(&mut state, session, ClosedReason::StopConfirmedByUser)
        };
        drop(released);
        self.emit();
        Ok(())
    }

    fn send_commit(&self, ranges: Vec<CommitRange>) -> SessionResult<()> {
        if self.settings.consumer.is_none() {
            return Err(SessionError::ContractViolation {
                reason: "commit on a session reading without a consumer".to_string(),
            });
        }
        {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return Err(SessionError::Closed);
            }
            for range in &ranges {
                let end = state
                    .outstanding_commits
                    .entry(range.partition_session_id)
                    .or_insert(range.end);
                *end = (*end).max(range.end);
            }
        }
        debug!(ranges = ranges.len(), "Sending commit");
        self.send(ClientMessage::CommitOffset(CommitOffsetRequest { ranges }))?;
        self.settings.counters.record_commit();
        Ok(())
    }

    fn request_status(&self, session: &PartitionSession) -> SessionResult<()> {
        let request = PartitionSessionStatusRequest {
            partition_session_id: session.id(),
        };
        self.send(ClientMessage::PartitionSessionStatus(request))
    }

    fn release_bytes(&self, generation: u64, bytes: u64) {
        if generation != self.generation.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.send(ClientMessage::Read(ReadRequest { bytes_size: bytes })) {
            warn!(bytes, error = %e, "Failed to return read budget");
        }
    }
}

/// Splits `total` in proportion to `weights`; the last share takes the
/// rounding remainder.
fn split_bytes(total: u64, weights: &[u64]) -> Vec<u64> {
    let sum: u128 = weights.iter().map(|w| u128::from(*w)).sum();
    let mut shares = Vec::with_capacity(weights.len());
    let mut assigned = 0_u64;
    for (index, weight) in weights.iter().enumerate() {
        let share = if index + 1 == weights.len() {
            total - assigned
        } else if sum == 0 {
            0
        } else {
            u64::try_from(u128::from(total) * u128::from(*weight) / sum).unwrap_or(total)
        };
        assigned += share;
        shares.push(share);
    }
    shares
}
