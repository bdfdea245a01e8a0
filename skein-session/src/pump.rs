//! Session event pump.
//!
//! Every event a session produces passes through its pump, which either
//! binds it to a registered handler and submits the call to the handlers
//! executor, or queues it for the application to pull:
//!
//! ```text
//!   event ──▶ router.bind(event) ──Ok(job)──▶ handlers executor
//!                    │
//!                    └──Err(event)──▶ queue ──▶ get_event / get_events / wait_event
//! ```
//!
//! A session-closed event goes to its handler and is also queued, so a
//! pulling consumer always observes the end of the session.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use skein_executor::{Executor, Job};
use tokio::sync::Notify;
use tracing::{debug, error};

/// An event that can pass through an [`EventPump`].
pub trait PumpEvent: Send + Sized + 'static {
    /// Returns a copy of the event if it must also reach the pull queue when
    /// a handler consumes it.
    fn queued_copy(&self) -> Option<Self>;

    /// Returns true if no event follows this one.
    fn is_terminal(&self) -> bool;

    /// Returns a one-line description for logs.
    fn debug_string(&self) -> String;
}

/// Binds events to handlers.
pub trait EventRouter<E>: Send + Sync {
    /// Returns the handler call for `event`, or gives the event back when no
    /// handler applies.
    ///
    /// # Errors
    /// Returns the event itself when it has no handler.
    fn bind(&self, event: E) -> Result<Job, E>;
}

/// Binds `payload` to `handler` if one is registered.
pub(crate) fn bind_handler<T: Send + 'static>(
    handler: Option<&Arc<dyn Fn(T) + Send + Sync>>,
    payload: T,
) -> Result<Job, T> {
    match handler {
        Some(handler) => {
            let handler = Arc::clone(handler);
            Ok(Box::new(move || handler(payload)))
        }
        None => Err(payload),
    }
}

struct PumpState<E> {
    queue: VecDeque<E>,
    closed: bool,
}

/// Routes session events to handlers or a pull queue.
pub struct EventPump<E: PumpEvent> {
    name: String,
    router: Box<dyn EventRouter<E>>,
    executor: Arc<dyn Executor>,
    state: Mutex<PumpState<E>>,
    available: Condvar,
    notify: Notify,
    rejected: AtomicU64,
}

impl<E: PumpEvent> EventPump<E> {
    /// Creates a pump dispatching handler calls on `executor`.
    pub fn new(
        name: impl Into<String>,
        router: Box<dyn EventRouter<E>>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            name: name.into(),
            router,
            executor,
            state: Mutex::new(PumpState {
                queue: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            notify: Notify::new(),
            rejected: AtomicU64::new(0),
        }
    }

    /// Delivers an event to its handler or the pull queue.
    ///
    /// Must not be called while holding session locks: an inline handlers
    /// executor runs the handler before this returns.
    pub fn dispatch(&self, event: E) {
        debug!(session = %self.name, event = %event.debug_string(), "Dispatching event");
        let copy = event.queued_copy();
        match self.router.bind(event) {
            Ok(job) => {
                if let Some(copy) = copy {
                    self.enqueue(copy);
                }
                if let Err(e) = self.executor.submit(job) {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    error!(
                        session = %self.name,
                        executor = %self.executor.name(),
                        error = %e,
                        "Handlers executor rejected event"
                    );
                }
            }
            Err(event) => self.enqueue(event),
        }
    }

    fn enqueue(&self, event: E) {
        let mut state = self.state.lock();
        if state.closed {
            debug!(session = %self.name, event = %event.debug_string(), "Dropping event after close");
            return;
        }
        if event.is_terminal() {
            state.closed = true;
        }
        state.queue.push_back(event);
        drop(state);
        self.available.notify_all();
        self.notify.notify_waiters();
    }

    /// Stops accepting events. Queued events stay available.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
        self.notify.notify_waiters();
    }

    /// Takes the next queued event.
    ///
    /// With `block`, waits until an event arrives or the pump is closed and
    /// drained.
    pub fn get_event(&self, block: bool) -> Option<E> {
        let mut state = self.state.lock();
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Some(event);
            }
            if !block || state.closed {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Takes up to `max` queued events (all of them when `None`).
    ///
    /// With `block`, waits for at least one event unless the pump is closed.
    pub fn get_events(&self, block: bool, max: Option<usize>) -> Vec<E> {
        let mut state = self.state.lock();
        while block && state.queue.is_empty() && !state.closed {
            self.available.wait(&mut state);
        }
        let take = max.map_or(state.queue.len(), |max| max.min(state.queue.len()));
        state.queue.drain(..take).collect()
    }

    /// Resolves once an event is queued or the pump is closed.
    pub async fn wait_event(&self) {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let state = self.state.lock();
                if !state.queue.is_empty() || state.closed {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Returns the number of queued events.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Returns true once the pump stopped accepting events.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns how many handler calls the executor refused.
    #[must_use]
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
