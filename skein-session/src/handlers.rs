//! Event handler registration.
//!
//! Each event type may have its own handler. An event without one goes to
//! the common handler if set, and otherwise to the session's pull queue.

use std::sync::Arc;

use skein_executor::{Executor, Job};
use tracing::warn;

use crate::pump::{bind_handler, EventRouter};
use crate::read_event::{
    CommitOffsetAcknowledgementEvent, DataReceivedEvent, PartitionSessionClosedEvent,
    PartitionSessionStatusEvent, ReadSessionEvent, StartPartitionSessionEvent,
    StopPartitionSessionEvent,
};
use crate::status::SessionClosedEvent;
use crate::write_event::{AcksEvent, ReadyToAcceptEvent, WriteSessionEvent};

/// A shared event callback.
pub type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

fn describe<T>(handler: Option<&Handler<T>>) -> &'static str {
    if handler.is_some() {
        "set"
    } else {
        "unset"
    }
}

// ---- Write handlers ----

/// Handlers for write session events.
#[derive(Clone, Default)]
pub struct WriteEventHandlers {
    acks: Option<Handler<AcksEvent>>,
    ready_to_accept: Option<Handler<ReadyToAcceptEvent>>,
    session_closed: Option<Handler<SessionClosedEvent>>,
    common: Option<Handler<WriteSessionEvent>>,
    executor: Option<Arc<dyn Executor>>,
}

impl WriteEventHandlers {
    /// Creates an empty set: every event goes to the pull queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles acknowledgements.
    #[must_use]
    pub fn with_acks_handler(mut self, handler: impl Fn(AcksEvent) + Send + Sync + 'static) -> Self {
        self.acks = Some(Arc::new(handler));
        self
    }

    /// Handles token availability.
    #[must_use]
    pub fn with_ready_to_accept_handler(
        mut self,
        handler: impl Fn(ReadyToAcceptEvent) + Send + Sync + 'static,
    ) -> Self {
        self.ready_to_accept = Some(Arc::new(handler));
        self
    }

    /// Handles the session-closed event. The event is also queued.
    #[must_use]
    pub fn with_session_closed_handler(
        mut self,
        handler: impl Fn(SessionClosedEvent) + Send + Sync + 'static,
    ) -> Self {
        self.session_closed = Some(Arc::new(handler));
        self
    }

    /// Handles every event without a dedicated handler.
    #[must_use]
    pub fn with_common_handler(
        mut self,
        handler: impl Fn(WriteSessionEvent) + Send + Sync + 'static,
    ) -> Self {
        self.common = Some(Arc::new(handler));
        self
    }

    /// Runs handlers on `executor` instead of a dedicated single-thread pool.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Returns the configured handlers executor.
    #[must_use]
    pub fn executor(&self) -> Option<&Arc<dyn Executor>> {
        self.executor.as_ref()
    }
}

impl EventRouter<WriteSessionEvent> for WriteEventHandlers {
    fn bind(&self, event: WriteSessionEvent) -> Result<Job, WriteSessionEvent> {
        match event {
            WriteSessionEvent::Acks(event) => {
                bind_handler(self.acks.as_ref(), event).map_err(WriteSessionEvent::Acks)
            }
            WriteSessionEvent::ReadyToAccept(event) => {
                bind_handler(self.ready_to_accept.as_ref(), event)
                    .map_err(WriteSessionEvent::ReadyToAccept)
            }
            WriteSessionEvent::SessionClosed(event) => {
                bind_handler(self.session_closed.as_ref(), event)
                    .map_err(WriteSessionEvent::SessionClosed)
            }
        }
        .or_else(|event| bind_handler(self.common.as_ref(), event))
    }
}

impl std::fmt::Debug for WriteEventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteEventHandlers")
            .field("acks", &describe(self.acks.as_ref()))
            .field("ready_to_accept", &describe(self.ready_to_accept.as_ref()))
            .field("session_closed", &describe(self.session_closed.as_ref()))
            .field("common", &describe(self.common.as_ref()))
            .field("executor", &self.executor.as_ref().map(|e| e.name().to_string()))
            .finish()
    }
}

// ---- Read handlers ----

/// Handlers for read session events.
#[derive(Clone, Default)]
pub struct ReadEventHandlers {
    data_received: Option<Handler<DataReceivedEvent>>,
    commit_acknowledgement: Option<Handler<CommitOffsetAcknowledgementEvent>>,
    start_partition_session: Option<Handler<StartPartitionSessionEvent>>,
    stop_partition_session: Option<Handler<StopPartitionSessionEvent>>,
    partition_session_status: Option<Handler<PartitionSessionStatusEvent>>,
    partition_session_closed: Option<Handler<PartitionSessionClosedEvent>>,
    session_closed: Option<Handler<SessionClosedEvent>>,
    common: Option<Handler<ReadSessionEvent>>,
    executor: Option<Arc<dyn Executor>>,
}

impl ReadEventHandlers {
    /// Creates an empty set: every event goes to the pull queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers for the common case: partitions are confirmed automatically
    /// and `handler` sees every data event.
    ///
    /// With `commit_after_processing`, each data event is committed once
    /// `handler` returns.
    #[must_use]
    pub fn simple_data_handlers(
        handler: impl Fn(&DataReceivedEvent) + Send + Sync + 'static,
        commit_after_processing: bool,
    ) -> Self {
        Self::new()
            .with_data_received_handler(move |event| {
                handler(&event);
                if commit_after_processing {
                    if let Err(e) = event.commit() {
                        warn!(
                            partition_session_id = %event.partition_session().id(),
                            error = %e,
                            "Commit after processing failed"
                        );
                    }
                }
            })
            .with_start_partition_session_handler(|event| {
                if let Err(e) = event.confirm() {
                    warn!(
                        partition_session_id = %event.partition_session().id(),
                        error = %e,
                        "Automatic start confirmation failed"
                    );
                }
            })
            .with_stop_partition_session_handler(|event| {
                if let Err(e) = event.confirm() {
                    warn!(
                        partition_session_id = %event.partition_session().id(),
                        error = %e,
                        "Automatic stop confirmation failed"
                    );
                }
            })
    }

    /// Handles received data.
    #[must_use]
    pub fn with_data_received_handler(
        mut self,
        handler: impl Fn(DataReceivedEvent) + Send + Sync + 'static,
    ) -> Self {
        self.data_received = Some(Arc::new(handler));
        self
    }

    /// Handles commit acknowledgements.
    #[must_use]
    pub fn with_commit_acknowledgement_handler(
        mut self,
        handler: impl Fn(CommitOffsetAcknowledgementEvent) + Send + Sync + 'static,
    ) -> Self {
        self.commit_acknowledgement = Some(Arc::new(handler));
        self
    }

    /// Handles partition assignment.
    #[must_use]
    pub fn with_start_partition_session_handler(
        mut self,
        handler: impl Fn(StartPartitionSessionEvent) + Send + Sync + 'static,
    ) -> Self {
        self.start_partition_session = Some(Arc::new(handler));
        self
    }

    /// Handles graceful partition revocation.
    #[must_use]
    pub fn with_stop_partition_session_handler(
        mut self,
        handler: impl Fn(StopPartitionSessionEvent) + Send + Sync + 'static,
    ) -> Self {
        self.stop_partition_session = Some(Arc::new(handler));
        self
    }

    /// Handles status answers.
    #[must_use]
    pub fn with_partition_session_status_handler(
        mut self,
        handler: impl Fn(PartitionSessionStatusEvent) + Send + Sync + 'static,
    ) -> Self {
        self.partition_session_status = Some(Arc::new(handler));
        self
    }

    /// Handles partition session closure.
    #[must_use]
    pub fn with_partition_session_closed_handler(
        mut self,
        handler: impl Fn(PartitionSessionClosedEvent) + Send + Sync + 'static,
    ) -> Self {
        self.partition_session_closed = Some(Arc::new(handler));
        self
    }

    /// Handles the session-closed event. The event is also queued.
    #[must_use]
    pub fn with_session_closed_handler(
        mut self,
        handler: impl Fn(SessionClosedEvent) + Send + Sync + 'static,
    ) -> Self {
        self.session_closed = Some(Arc::new(handler));
        self
    }

    /// Handles every event without a dedicated handler.
    #[must_use]
    pub fn with_common_handler(
        mut self,
        handler: impl Fn(ReadSessionEvent) + Send + Sync + 'static,
    ) -> Self {
        self.common = Some(Arc::new(handler));
        self
    }

    /// Runs handlers on `executor` instead of a dedicated single-thread pool.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Returns the configured handlers executor.
    #[must_use]
    pub fn executor(&self) -> Option<&Arc<dyn Executor>> {
        self.executor.as_ref()
    }
}

impl EventRouter<ReadSessionEvent> for ReadEventHandlers {
    fn bind(&self, event: ReadSessionEvent) -> Result<Job, ReadSessionEvent> {
        use ReadSessionEvent as E;
        match event {
            E::DataReceived(event) => {
                bind_handler(self.data_received.as_ref(), event).map_err(E::DataReceived)
            }
            E::CommitOffsetAcknowledgement(event) => {
                bind_handler(self.commit_acknowledgement.as_ref(), event)
                    .map_err(E::CommitOffsetAcknowledgement)
            }
            E::StartPartitionSession(event) => {
                bind_handler(self.start_partition_session.as_ref(), event)
                    .map_err(E::StartPartitionSession)
            }
            E::StopPartitionSession(event) => {
                bind_handler(self.stop_partition_session.as_ref(), event)
                    .map_err(E::StopPartitionSession)
            }
            E::PartitionSessionStatus(event) => {
                bind_handler(self.partition_session_status.as_ref(), event)
                    .map_err(E::PartitionSessionStatus)
            }
            E::PartitionSessionClosed(event) => {
                bind_handler(self.partition_session_closed.as_ref(), event)
                    .map_err(E::PartitionSessionClosed)
            }
            E::SessionClosed(event) => {
                bind_handler(self.session_closed.as_ref(), event).map_err(E::SessionClosed)
            }
        }
        .or_else(|event| bind_handler(self.common.as_ref(), event))
    }
}

impl std::fmt::Debug for ReadEventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadEventHandlers")
            .field("data_received", &describe(self.data_received.as_ref()))
            .field(
                "commit_acknowledgement",
                &describe(self.commit_acknowledgement.as_ref()),
            )
            .field(
                "start_partition_session",
                &describe(self.start_partition_session.as_ref()),
            )
            .field(
                "stop_partition_session",
                &describe(self.stop_partition_session.as_ref()),
            )
            .field(
                "partition_session_status",
                &describe(self.partition_session_status.as_ref()),
            )
            .field(
                "partition_session_closed",
                &describe(self.partition_session_closed.as_ref()),
            )
            .field("session_closed", &describe(self.session_closed.as_ref()))
            .field("common", &describe(self.common.as_ref()))
            .field("executor", &self.executor.as_ref().map(|e| e.name().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::SessionStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn closed() -> SessionClosedEvent {
        SessionClosedEvent {
            status: SessionStatus::closed_by_client(),
        }
    }

    #[test]
    fn test_unhandled_write_event_is_returned() {
        let handlers = WriteEventHandlers::new();
        let result = handlers.bind(WriteSessionEvent::Acks(AcksEvent::default()));
        assert!(matches!(result, Err(WriteSessionEvent::Acks(_))));
    }

    #[test]
    fn test_dedicated_handler_wins_over_common() {
        let dedicated = Arc::new(AtomicUsize::new(0));
        let common = Arc::new(AtomicUsize::new(0));
        let (d, c) = (Arc::clone(&dedicated), Arc::clone(&common));
        let handlers = WriteEventHandlers::new()
            .with_session_closed_handler(move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            })
            .with_common_handler(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });

        handlers.bind(WriteSessionEvent::SessionClosed(closed())).unwrap()();
        handlers.bind(WriteSessionEvent::Acks(AcksEvent::default())).unwrap()();

        assert_eq!(dedicated.load(Ordering::SeqCst), 1);
        assert_eq!(common.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_simple_data_handlers_cover_partition_lifecycle() {
        let handlers = ReadEventHandlers::simple_data_handlers(|_| {}, true);
        assert!(handlers.data_received.is_some());
        assert!(handlers.start_partition_session.is_some());
        assert!(handlers.stop_partition_session.is_some());
        assert!(handlers.session_closed.is_none());
        let result = handlers.bind(ReadSessionEvent::SessionClosed(closed()));
        assert!(matches!(result, Err(ReadSessionEvent::SessionClosed(_))));
    }
}
