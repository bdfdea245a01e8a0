//! Write session scenario tests.
//!
//! A [`WriteSession`] talks to a [`MockTransport`]; a [`ScriptedWriteServer`]
//! reads what was sent and produces the acknowledgements fed back through
//! `handle_server_message`. Every scenario ends with [`check_acks`]: each
//! submitted write resolved exactly once, in submission order.

// Test-specific lint allowances.
#![allow(clippy::too_many_lines)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::cast_possible_truncation)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use skein_core::{Offset, PartitionId};
use skein_executor::{inline_executor, QueueExecutorConfig, TaskQueueExecutor};
use skein_flow::{FlowControllerConfig, FlowError};
use skein_session::protocol::{ServerWriteAck, ServerWriteOutcome, WriteResponse};
use skein_session::{
    AcksEvent, ClientMessage, Codec, ReadyToAcceptEvent, SessionError, SessionStatus,
    SimpleBlockingWriteSession, StatusCode, Transport, WriteAck, WriteAckState,
    WriteEventHandlers, WriteMessage, WriteServerMessage, WriteSession, WriteSessionEvent,
    WriteSessionSettings,
};

use crate::mock_transport::MockTransport;
use crate::properties::check_acks;
use crate::server::{self, ScriptedWriteServer, XorCodec, TOPIC, XOR, XOR_KEY};

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    session: WriteSession,
    transport: Arc<MockTransport>,
    server: ScriptedWriteServer,
    acks: Vec<WriteAck>,
    closed: bool,
}

impl Harness {
    fn open(settings: WriteSessionSettings) -> Self {
        crate::init_tracing();
        let transport = Arc::new(MockTransport::new());
        let session =
            WriteSession::new(settings, Arc::clone(&transport) as Arc<dyn Transport>).unwrap();
        let server = ScriptedWriteServer::new(Arc::clone(&transport));
        Self {
            session,
            transport,
            server,
            acks: Vec::new(),
            closed: false,
        }
    }

    fn init(&self) {
        self.session.handle_server_message(self.server.init(1));
    }

    /// Takes the next token, acknowledging outstanding writes whenever the
    /// writer runs out of headroom.
    fn token(&mut self) -> skein_flow::ContinuationToken {
        loop {
            match self.session.get_event(false) {
                Some(WriteSessionEvent::ReadyToAccept(event)) => return event.token,
                Some(event) => self.record(event),
                None => {
                    let acks = self
                        .server
                        .acks()
                        .expect("writer stalled with nothing left to acknowledge");
                    self.session.handle_server_message(acks);
                }
            }
        }
    }

    fn write(&mut self, message: WriteMessage) {
        let token = self.token();
        self.session.write(token, message).unwrap();
    }

    /// Acknowledges everything sent and collects the remaining events.
    fn settle(&mut self) {
        if let Some(acks) = self.server.acks() {
            self.session.handle_server_message(acks);
        }
        self.drain();
    }

    fn drain(&mut self) {
        for event in self.session.get_events(false, None) {
            self.record(event);
        }
    }

    fn record(&mut self, event: WriteSessionEvent) {
        match event {
            WriteSessionEvent::Acks(event) => self.acks.extend(event.acks),
            WriteSessionEvent::ReadyToAccept(_) => {}
            WriteSessionEvent::SessionClosed(_) => self.closed = true,
        }
    }
}

fn settings() -> WriteSessionSettings {
    WriteSessionSettings::for_testing(TOPIC).with_producer_id("scenario-producer")
}

fn flow(tokens: u32, inflight: u64) -> FlowControllerConfig {
    FlowControllerConfig::for_testing()
        .with_max_outstanding_tokens(tokens)
        .with_max_inflight_count(inflight)
}

// ============================================================================
// Acknowledgement Order
// ============================================================================

#[test]
fn test_write_acks_follow_submission_order() {
    let mut harness = Harness::open(settings().with_flow(flow(4, 8)));
    harness.init();

    for i in 0..40 {
        harness.write(WriteMessage::new(server::payload(i)));
    }
    harness.settle();

    let submitted: Vec<u64> = (1..=40).collect();
    assert_eq!(check_acks(&submitted, &harness.acks), Ok(()));
    assert!(harness
        .acks
        .iter()
        .all(|ack| matches!(ack.state, WriteAckState::Written { .. })));
    assert_eq!(harness.transport.written_seq_nos(), submitted);
    assert!(!harness.closed);
}

#[test]
fn test_write_before_init_renumbers_after_service_history() {
    let mut harness = Harness::open(settings().with_flow(flow(3, 8)));
    harness.server.set_written_before(20);

    for i in 0..3 {
        harness.write(WriteMessage::new(server::payload(i)));
    }
    assert!(harness.transport.written_seq_nos().is_empty());

    harness.init();
    assert_eq!(harness.session.init_seq_no(Duration::from_secs(1)).unwrap(), 20);
    harness.settle();
    assert_eq!(harness.transport.written_seq_nos(), vec![21, 22, 23]);
    assert_eq!(check_acks(&[21, 22, 23], &harness.acks), Ok(()));
}

#[test]
fn test_write_explicit_seq_nos_resolve_known_prefix_locally() {
    let mut harness = Harness::open(settings().with_flow(flow(5, 8)));
    harness.server.set_written_before(3);
    harness.init();

    for seq_no in 1..=5 {
        harness.write(WriteMessage::new(server::payload(seq_no)).with_seq_no(seq_no));
    }
    harness.settle();

    assert_eq!(harness.transport.written_seq_nos(), vec![4, 5]);
    assert_eq!(check_acks(&[1, 2, 3, 4, 5], &harness.acks), Ok(()));
    let states: Vec<_> = harness.acks.iter().map(|ack| ack.state).collect();
    assert!(states[..3]
        .iter()
        .all(|state| *state == WriteAckState::AlreadyWritten));
    assert!(states[3..]
        .iter()
        .all(|state| matches!(state, WriteAckState::Written { .. })));

    let counters = harness.session.counters().snapshot();
    assert_eq!(counters.acks_already_written, 3);
    assert_eq!(counters.acks_written, 2);
}

#[test]
fn test_write_mixed_numbering_is_rejected() {
    let mut harness = Harness::open(settings().with_flow(flow(2, 8)));
    harness.init();
    harness.write(WriteMessage::new(server::payload(0)));

    let token = harness.token();
    let result = harness
        .session
        .write(token, WriteMessage::new(server::payload(1)).with_seq_no(10));
    assert!(matches!(
        result,
        Err(SessionError::Flow(FlowError::MixedSeqNo { .. }))
    ));
}

// ============================================================================
// Continuation Tokens
// ============================================================================

#[test]
fn test_write_token_is_single_use() {
    let mut harness = Harness::open(settings().with_flow(flow(2, 8)));
    harness.init();

    let mut token = harness.token();
    let spent = token.take();
    assert!(!token.is_valid());
    harness
        .session
        .write(spent, WriteMessage::new(server::payload(0)))
        .unwrap();
    assert!(matches!(
        harness.session.write(token, WriteMessage::new(server::payload(1))),
        Err(SessionError::Flow(FlowError::InvalidToken { .. }))
    ));
}

#[test]
fn test_write_token_from_other_session_is_rejected() {
    let mut first = Harness::open(settings());
    let mut second = Harness::open(settings());
    first.init();
    second.init();

    let foreign = first.token();
    assert!(matches!(
        second.session.write(foreign, WriteMessage::new(server::payload(0))),
        Err(SessionError::Flow(FlowError::InvalidToken { .. }))
    ));
    assert!(second.transport.written_seq_nos().is_empty());
}

#[test]
fn test_write_dropped_token_returns_headroom() {
    let mut harness = Harness::open(settings().with_flow(flow(1, 1)));
    harness.init();

    // Dropping the only token mints a replacement.
    drop(harness.token());
    harness.write(WriteMessage::new(server::payload(0)));
    harness.settle();
    assert_eq!(check_acks(&[1], &harness.acks), Ok(()));
}

// ============================================================================
// Compression
// ============================================================================

#[test]
fn test_write_parallel_compression_keeps_send_order() {
    let pool = Arc::new(
        TaskQueueExecutor::started(
            QueueExecutorConfig::for_testing()
                .with_threads(4)
                .with_max_queue_size(64)
                .with_name("compression"),
        )
        .unwrap(),
    );
    let mut harness = Harness::open(
        settings()
            .with_flow(flow(32, 32))
            .with_codecs(server::codecs())
            .with_codec(XOR, 0)
            .with_compression_executor(pool),
    );
    harness.init();

    for i in 0..32 {
        harness.write(WriteMessage::new(server::payload(i)));
    }
    assert!(harness.transport.wait_for(Duration::from_secs(5), |sent| {
        sent.iter()
            .filter_map(|m| match m {
                ClientMessage::Write(request) => Some(request.messages.len()),
                _ => None,
            })
            .sum::<usize>()
            == 32
    }));

    let submitted: Vec<u64> = (1..=32).collect();
    assert_eq!(harness.transport.written_seq_nos(), submitted);

    let xor = XorCodec::new(XOR_KEY);
    let requests = harness.transport.write_requests();
    let messages = requests.iter().flat_map(|request| {
        assert_eq!(request.codec, XOR);
        request.messages.iter()
    });
    for (i, message) in messages.enumerate() {
        let plain = xor.decompress(&message.data).unwrap();
        assert_eq!(plain, server::payload(i as u64));
        assert_eq!(message.uncompressed_size, plain.len() as u64);
    }

    harness.settle();
    assert_eq!(check_acks(&submitted, &harness.acks), Ok(()));
    assert_eq!(harness.session.counters().snapshot().messages_written, 32);
}

#[test]
fn test_write_precompressed_skips_codec() {
    let mut harness = Harness::open(
        settings()
            .with_codecs(server::codecs())
            .with_codec(XOR, 0)
            .with_compression_executor(inline_executor()),
    );
    harness.init();

    let plain = server::payload(7);
    let encoded = XorCodec::new(XOR_KEY).compress(&plain, 0).unwrap();
    let token = harness.token();
    harness
        .session
        .write_encoded(
            token,
            WriteMessage::compressed(encoded.clone(), XOR, plain.len() as u64),
        )
        .unwrap();

    let requests = harness.transport.write_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].messages[0].data, encoded);
    assert_eq!(requests[0].messages[0].uncompressed_size, plain.len() as u64);
}

// ============================================================================
// Closing
// ============================================================================

#[test]
fn test_write_close_discards_unacknowledged_once() {
    let mut harness = Harness::open(settings().with_flow(flow(3, 8)));
    harness.init();
    for i in 0..3 {
        harness.write(WriteMessage::new(server::payload(i)));
    }
    // Only the first write is acknowledged before closing.
    harness
        .session
        .handle_server_message(WriteServerMessage::WriteResponse(WriteResponse {
            partition_id: PartitionId::new(0),
            acks: vec![ServerWriteAck {
                seq_no: 1,
                outcome: ServerWriteOutcome::Written {
                    offset: Offset::new(0),
                },
            }],
            stat: None,
        }));

    let session = &harness.session;
    let clean = thread::scope(|scope| {
        let racing = scope.spawn(|| session.close(Duration::from_millis(20)));
        let own = session.close(Duration::from_millis(20));
        own || racing.join().unwrap()
    });
    assert!(!clean);
    harness.drain();

    assert_eq!(check_acks(&[1, 2, 3], &harness.acks), Ok(()));
    let discarded: Vec<_> = harness
        .acks
        .iter()
        .filter(|ack| ack.state == WriteAckState::Discarded)
        .map(|ack| ack.seq_no)
        .collect();
    assert_eq!(discarded, vec![2, 3]);
    assert!(harness.closed);
    assert_eq!(harness.session.counters().snapshot().acks_discarded, 2);
}

#[test]
fn test_write_close_waits_for_late_acks() {
    let mut harness = Harness::open(settings().with_flow(flow(2, 8)));
    harness.init();
    harness.write(WriteMessage::new(server::payload(0)));
    harness.write(WriteMessage::new(server::payload(1)));

    let session = &harness.session;
    let server = &harness.server;
    let clean = thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(Duration::from_millis(20));
            if let Some(acks) = server.acks() {
                session.handle_server_message(acks);
            }
        });
        session.close(Duration::from_secs(5))
    });
    assert!(clean);
    harness.drain();
    assert_eq!(check_acks(&[1, 2], &harness.acks), Ok(()));
    assert!(harness.closed);
}

#[test]
fn test_write_acks_racing_close_are_delivered() {
    for round in 0..200 {
        let mut harness = Harness::open(settings().with_flow(flow(1, 8)));
        harness.init();
        harness.write(WriteMessage::new(server::payload(round)));

        let session = &harness.session;
        let scripted = &harness.server;
        let clean = thread::scope(|scope| {
            scope.spawn(|| {
                if let Some(acks) = scripted.acks() {
                    session.handle_server_message(acks);
                }
            });
            session.close(Duration::from_secs(5))
        });
        assert!(clean, "round {round}");

        // Close returned, so every event is already queued.
        harness.drain();
        assert_eq!(check_acks(&[1], &harness.acks), Ok(()), "round {round}");
        assert!(
            matches!(harness.acks[0].state, WriteAckState::Written { .. }),
            "round {round}: {:?}",
            harness.acks[0].state
        );
        assert!(harness.closed, "round {round}");
    }
}

// ============================================================================
// Concurrent Resolution
// ============================================================================

#[test]
fn test_write_acks_and_duplicates_resolved_from_two_threads() {
    let resolved = Arc::new(Mutex::new(Vec::new()));
    let (tokens_tx, tokens_rx) = mpsc::channel();
    let tokens_tx = Mutex::new(tokens_tx);
    let sink = Arc::clone(&resolved);
    let handlers = WriteEventHandlers::new()
        .with_executor(inline_executor())
        .with_acks_handler(move |event: AcksEvent| sink.lock().extend(event.acks))
        .with_ready_to_accept_handler(move |event: ReadyToAcceptEvent| {
            let _ = tokens_tx.lock().send(event.token);
        });
    let harness = Harness::open(settings().with_flow(flow(4, 8)).with_handlers(handlers));
    harness.init();

    // Every fourth write repeats a sequence number two back.
    let mut submitted = Vec::new();
    for seq_no in 1..=80 {
        submitted.push(seq_no);
        if seq_no % 4 == 0 {
            submitted.push(seq_no - 2);
        }
    }

    let session = &harness.session;
    let scripted = &harness.server;
    let done = AtomicBool::new(false);
    let clean = thread::scope(|scope| {
        scope.spawn(|| {
            while !done.load(Ordering::Acquire) {
                if let Some(acks) = scripted.acks() {
                    session.handle_server_message(acks);
                }
                thread::yield_now();
            }
        });
        let wrote = submitted.iter().all(|&seq_no| {
            tokens_rx
                .recv_timeout(Duration::from_secs(5))
                .is_ok_and(|token| {
                    session
                        .write(token, WriteMessage::new(server::payload(seq_no)).with_seq_no(seq_no))
                        .is_ok()
                })
        });
        let clean = wrote && session.close(Duration::from_secs(5));
        done.store(true, Ordering::Release);
        clean
    });
    assert!(clean);

    let resolved = resolved.lock();
    assert_eq!(check_acks(&submitted, &resolved), Ok(()));
    let already_written = resolved
        .iter()
        .filter(|ack| ack.state == WriteAckState::AlreadyWritten)
        .count();
    assert_eq!(already_written, 20);
    assert_eq!(harness.transport.written_seq_nos(), (1..=80).collect::<Vec<_>>());
}

// ============================================================================
// Reconnects
// ============================================================================

#[test]
fn test_write_reconnect_resends_unacknowledged_in_order() {
    let mut harness = Harness::open(settings().with_flow(flow(4, 8)));
    harness.init();
    for i in 0..4 {
        harness.write(WriteMessage::new(server::payload(i)));
    }
    assert_eq!(harness.transport.written_seq_nos(), vec![1, 2, 3, 4]);

    harness
        .session
        .handle_connection_lost(SessionStatus::new(StatusCode::Unavailable, "stream reset"));
    assert!(!harness.session.is_closed());
    assert_eq!(harness.transport.reconnect_delays().len(), 1);

    harness.init();
    assert_eq!(
        harness.transport.written_seq_nos(),
        vec![1, 2, 3, 4, 1, 2, 3, 4]
    );
    harness.settle();
    assert_eq!(check_acks(&[1, 2, 3, 4], &harness.acks), Ok(()));
}

#[test]
fn test_write_failed_send_holds_later_writes_until_reconnect() {
    let mut harness = Harness::open(settings().with_flow(flow(2, 8)));
    harness.init();
    harness.transport.fail_next_sends(1);
    harness.write(WriteMessage::new(server::payload(0)));
    harness.write(WriteMessage::new(server::payload(1)));
    assert!(harness.transport.written_seq_nos().is_empty());

    harness
        .session
        .handle_connection_lost(SessionStatus::new(StatusCode::Unavailable, "send failed"));
    harness.init();
    assert_eq!(harness.transport.written_seq_nos(), vec![1, 2]);
    harness.settle();
    assert_eq!(check_acks(&[1, 2], &harness.acks), Ok(()));
}

#[test]
fn test_write_failed_reconnect_is_retried() {
    let mut harness = Harness::open(settings().with_flow(flow(1, 8)));
    harness.init();
    harness.write(WriteMessage::new(server::payload(0)));

    harness.transport.fail_next_reconnects(1);
    harness
        .session
        .handle_connection_lost(SessionStatus::new(StatusCode::Unavailable, "stream reset"));
    assert!(!harness.session.is_closed());
    assert_eq!(harness.transport.reconnect_delays().len(), 1);

    harness.init();
    harness.settle();
    assert_eq!(check_acks(&[1], &harness.acks), Ok(()));
}

#[test]
fn test_write_exhausted_retries_close_session() {
    let mut harness = Harness::open(settings().with_flow(flow(2, 8)));
    harness.init();
    harness.write(WriteMessage::new(server::payload(0)));
    harness.write(WriteMessage::new(server::payload(1)));

    harness.transport.fail_next_reconnects(100);
    harness
        .session
        .handle_connection_lost(SessionStatus::new(StatusCode::Unavailable, "stream reset"));
    assert!(harness.session.is_closed());
    harness.drain();

    assert!(harness.closed);
    assert_eq!(check_acks(&[1, 2], &harness.acks), Ok(()));
    assert!(harness
        .acks
        .iter()
        .all(|ack| ack.state == WriteAckState::Discarded));
}

// ============================================================================
// Blocking Writer
// ============================================================================

#[test]
fn test_write_blocking_writer_paced_by_acks() {
    crate::init_tracing();
    let transport = Arc::new(MockTransport::new());
    let server = ScriptedWriteServer::new(Arc::clone(&transport));
    let writer = SimpleBlockingWriteSession::new(
        settings().with_flow(flow(1, 2)),
        Arc::clone(&transport) as Arc<dyn Transport>,
    )
    .unwrap();
    writer.handle_server_message(server.init(1));

    let done = std::sync::atomic::AtomicBool::new(false);
    thread::scope(|scope| {
        scope.spawn(|| {
            while !done.load(std::sync::atomic::Ordering::Acquire) {
                if let Some(acks) = server.acks() {
                    writer.handle_server_message(acks);
                }
                thread::sleep(Duration::from_millis(1));
            }
        });
        for i in 0..20 {
            assert!(writer.write(WriteMessage::new(server::payload(i)), Duration::from_secs(5)));
        }
        assert!(writer.close(Duration::from_secs(5)));
        done.store(true, std::sync::atomic::Ordering::Release);
    });

    assert_eq!(transport.written_seq_nos(), (1..=20).collect::<Vec<_>>());
    assert!(!writer.is_alive());
}
