//! Flow controller for one write session.
//!
//! The controller owns the writer's budgets, its token ledger and the queue
//! of accepted messages in submission order:
//!
//! ```text
//!  head                                                         tail
//!  ┌──────────┬──────────┬───────────┬───────────┬─────────────┐
//!  │ sent     │ sent     │ compressed│ duplicate │ pending     │
//!  │ seq 7    │ seq 8    │ seq 9     │ seq 4     │ seq 10      │
//!  └──────────┴──────────┴───────────┴───────────┴─────────────┘
//!       ▲ acknowledge(7)                  ▲ resolved once it reaches the head
//! ```
//!
//! Byte accounting per entry: the uncompressed size is charged on accept,
//! swapped for the compressed size once compression finishes, and released
//! on acknowledgement.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use skein_core::Limits;
use tracing::{debug, info};

use crate::error::{FlowError, FlowResult};
use crate::seqno::SeqNoTracker;
use crate::token::{ContinuationToken, TokenLedger};

static NEXT_CONTROLLER_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration for the flow controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControllerConfig {
    /// Maximum bytes held: pending uncompressed plus in-flight compressed.
    pub max_memory_usage: u64,
    /// Maximum accepted but unacknowledged messages.
    pub max_inflight_count: u64,
    /// Maximum tokens outstanding at once.
    pub max_outstanding_tokens: u32,
    /// Check for mixed numbering modes and resolve repeated sequence numbers locally.
    pub validate_seq_no: bool,
}

impl FlowControllerConfig {
    /// Creates a configuration for testing with small budgets.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            max_memory_usage: 64 * 1024,
            max_inflight_count: 8,
            max_outstanding_tokens: 1,
            validate_seq_no: true,
        }
    }

    /// Creates a configuration from client-wide limits.
    #[must_use]
    pub const fn from_limits(limits: &Limits) -> Self {
        Self {
            max_memory_usage: limits.max_memory_usage,
            max_inflight_count: limits.max_inflight_count,
            max_outstanding_tokens: limits.max_outstanding_tokens,
            validate_seq_no: true,
        }
    }

    /// Sets the memory budget.
    #[must_use]
    pub const fn with_max_memory_usage(mut self, bytes: u64) -> Self {
        self.max_memory_usage = bytes;
        self
    }

    /// Sets the in-flight count budget.
    #[must_use]
    pub const fn with_max_inflight_count(mut self, count: u64) -> Self {
        self.max_inflight_count = count;
        self
    }

    /// Sets the maximum number of outstanding tokens.
    #[must_use]
    pub const fn with_max_outstanding_tokens(mut self, tokens: u32) -> Self {
        self.max_outstanding_tokens = tokens;
        self
    }

    /// Enables or disables sequence number validation.
    #[must_use]
    pub const fn with_validate_seq_no(mut self, validate: bool) -> Self {
        self.validate_seq_no = validate;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if any budget is zero.
    pub fn validate(&self) -> FlowResult<()> {
        if self.max_memory_usage == 0 {
            return Err(FlowError::InvalidConfig {
                message: "max_memory_usage must be positive".to_string(),
            });
        }
        if self.max_inflight_count == 0 {
            return Err(FlowError::InvalidConfig {
                message: "max_inflight_count must be positive".to_string(),
            });
        }
        if self.max_outstanding_tokens == 0 {
            return Err(FlowError::InvalidConfig {
                message: "max_outstanding_tokens must be positive".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for FlowControllerConfig {
    fn default() -> Self {
        Self::from_limits(&Limits::new())
    }
}

/// A write accepted in exchange for a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// The message's sequence number.
    pub seq_no: u64,
    /// True if the message will be resolved locally as already written.
    pub duplicate: bool,
    /// Submission position: zero for the controller's first accepted
    /// message, then one more per accept. Stays with the message until it is
    /// resolved, even when sequence numbers repeat or are renumbered on init.
    pub position: u64,
}

/// An entry removed from the head of the queue by an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckedEntry {
    /// The acknowledged sequence number.
    pub seq_no: u64,
    /// Bytes released from the memory budget.
    pub released_bytes: u64,
}

/// Snapshot of controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowStats {
    /// Bytes currently charged to the memory budget.
    pub memory_usage: u64,
    /// Accepted but unresolved messages.
    pub inflight_count: u64,
    /// Tokens minted and not yet used or dropped.
    pub outstanding_tokens: u64,
    /// Total messages accepted.
    pub total_accepted: u64,
    /// Total messages acknowledged by the service.
    pub total_acknowledged: u64,
    /// Total messages resolved locally as duplicates.
    pub total_duplicates: u64,
    /// Total messages discarded on close.
    pub total_discarded: u64,
}

#[derive(Debug)]
struct Entry {
    position: u64,
    seq_no: u64,
    charged_bytes: u64,
    compressed: bool,
    sent: bool,
    duplicate: bool,
}

struct FlowState {
    entries: VecDeque<Entry>,
    next_position: u64,
    seq_nos: SeqNoTracker,
    memory_usage: u64,
    init_seen: bool,
    closed: bool,
    total_accepted: u64,
    total_acknowledged: u64,
    total_duplicates: u64,
    total_discarded: u64,
}

impl FlowState {
    fn entry_at_mut(&mut self, position: u64) -> Option<&mut Entry> {
        let front = self.entries.front()?.position;
        let index = usize::try_from(position.checked_sub(front)?).ok()?;
        self.entries.get_mut(index)
    }

    fn release(&mut self, entry: &Entry) {
        self.memory_usage = self.memory_usage.saturating_sub(entry.charged_bytes);
    }
}

/// Write flow controller: budgets, tokens and in-order acknowledgement.
pub struct FlowController {
    id: u64,
    config: FlowControllerConfig,
    state: Mutex<FlowState>,
    ledger: Arc<TokenLedger>,
}

impl FlowController {
    /// Creates a new flow controller.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: FlowControllerConfig) -> FlowResult<Self> {
        config.validate()?;
        Ok(Self {
            id: NEXT_CONTROLLER_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(FlowState {
                entries: VecDeque::new(),
                next_position: 0,
                seq_nos: SeqNoTracker::new(config.validate_seq_no),
                memory_usage: 0,
                init_seen: false,
                closed: false,
                total_accepted: 0,
                total_acknowledged: 0,
                total_duplicates: 0,
                total_discarded: 0,
            }),
            config,
            ledger: Arc::new(TokenLedger::new()),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &FlowControllerConfig {
        &self.config
    }

    /// Installs a callback run whenever an unused token is dropped.
    pub fn set_release_hook(&self, hook: Arc<dyn Fn() + Send + Sync>) {
        self.ledger.set_release_hook(hook);
    }

    /// Mints as many tokens as the budgets and the outstanding limit allow.
    ///
    /// Returns an empty vector when the writer has no headroom or is closed.
    pub fn mint_tokens(&self) -> Vec<ContinuationToken> {
        let state = self.state.lock();
        if state.closed {
            return Vec::new();
        }
        let mut tokens = Vec::new();
        loop {
            let outstanding = self.ledger.outstanding() as u64;
            let count_headroom =
                (state.entries.len() as u64) + outstanding < self.config.max_inflight_count;
            let memory_headroom = state.memory_usage < self.config.max_memory_usage;
            if outstanding >= u64::from(self.config.max_outstanding_tokens)
                || !count_headroom
                || !memory_headroom
            {
                break;
            }
            tokens.push(ContinuationToken::mint(self.id, &self.ledger));
        }
        tokens
    }

    /// Exchanges a token for one accepted write.
    ///
    /// The token is invalidated only on success; a rejected write leaves it
    /// with the caller.
    ///
    /// # Errors
    /// - `InvalidToken` if the token was used or came from another controller
    /// - `MixedSeqNo` if explicit and automatic numbering are mixed
    /// - `Closed` once the controller is closed
    pub fn accept(
        &self,
        token: &mut ContinuationToken,
        seq_no: Option<u64>,
        uncompressed_bytes: u64,
    ) -> FlowResult<Accepted> {
        token.check(self.id)?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(FlowError::Closed);
        }
        let assigned = state.seq_nos.assign(seq_no)?;
        token.consume();

        let position = state.next_position;
        state.next_position += 1;
        state.entries.push_back(Entry {
            position,
            seq_no: assigned.seq_no,
            charged_bytes: uncompressed_bytes,
            compressed: false,
            sent: false,
            duplicate: assigned.duplicate,
        });
        state.memory_usage += uncompressed_bytes;
        state.total_accepted += 1;
        if assigned.duplicate {
            debug!(seq_no = assigned.seq_no, "Message resolved locally as duplicate");
        }
        Ok(Accepted {
            seq_no: assigned.seq_no,
            duplicate: assigned.duplicate,
            position,
        })
    }

    /// Swaps the charge of the message at `position` from its uncompressed
    /// to its compressed size.
    pub fn on_compressed(&self, position: u64, uncompressed_bytes: u64, compressed_bytes: u64) {
        let mut state = self.state.lock();
        let Some(entry) = state.entry_at_mut(position) else {
            return;
        };
        if entry.compressed {
            return;
        }
        debug_assert_eq!(entry.charged_bytes, uncompressed_bytes);
        entry.compressed = true;
        entry.charged_bytes = compressed_bytes;
        state.memory_usage = state.memory_usage - uncompressed_bytes.min(state.memory_usage)
            + compressed_bytes;
    }

    /// Marks the message at `position` as handed to the transport.
    pub fn on_sent(&self, position: u64) {
        if let Some(entry) = self.state.lock().entry_at_mut(position) {
            entry.sent = true;
        }
    }

    /// Marks every unacknowledged message as not yet sent, for a resend after reconnect.
    pub fn mark_unsent(&self) {
        for entry in &mut self.state.lock().entries {
            entry.sent = false;
        }
    }

    /// Resolves the head of the queue with a service acknowledgement.
    ///
    /// # Errors
    /// Returns `AckOutOfOrder` if `seq_no` is not the head's sequence number.
    pub fn acknowledge(&self, seq_no: u64) -> FlowResult<AckedEntry> {
        let mut state = self.state.lock();
        let expected = state
            .entries
            .front()
            .filter(|entry| !entry.duplicate)
            .map(|entry| entry.seq_no);
        if expected != Some(seq_no) {
            return Err(FlowError::AckOutOfOrder { seq_no, expected });
        }
        let Some(entry) = state.entries.pop_front() else {
            return Err(FlowError::AckOutOfOrder { seq_no, expected });
        };
        state.release(&entry);
        state.total_acknowledged += 1;
        Ok(AckedEntry {
            seq_no,
            released_bytes: entry.charged_bytes,
        })
    }

    /// Removes locally deduplicated messages from the head of the queue.
    ///
    /// Returns their sequence numbers in submission order.
    pub fn drain_local_duplicates(&self) -> Vec<u64> {
        let mut state = self.state.lock();
        let mut drained = Vec::new();
        while state.entries.front().is_some_and(|entry| entry.duplicate) {
            if let Some(entry) = state.entries.pop_front() {
                state.release(&entry);
                drained.push(entry.seq_no);
            }
        }
        state.total_duplicates += drained.len() as u64;
        drained
    }

    /// Removes every unresolved message. Each is returned exactly once.
    pub fn discard_all(&self) -> Vec<u64> {
        let mut state = self.state.lock();
        let discarded: Vec<u64> = state.entries.drain(..).map(|entry| entry.seq_no).collect();
        state.memory_usage = 0;
        state.total_discarded += discarded.len() as u64;
        if !discarded.is_empty() {
            info!(count = discarded.len(), "Discarded unacknowledged messages");
        }
        discarded
    }

    /// Applies the last sequence number reported by the service on init.
    ///
    /// On the first init, automatically numbered messages accepted before it
    /// are renumbered to follow `last`, and explicitly numbered ones at or
    /// below `last` become local duplicates. Later inits (reconnects) keep the
    /// existing numbers. Returns the number and duplicate flag of every queued
    /// message in submission order.
    pub fn set_init_seq_no(&self, last: u64) -> Vec<Accepted> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.init_seen {
            state.init_seen = true;
            match state.seq_nos.mode() {
                crate::SeqNoMode::Auto => {
                    let mut next = last;
                    for entry in &mut state.entries {
                        next += 1;
                        entry.seq_no = next;
                    }
                    state.seq_nos.reset_last(next);
                }
                crate::SeqNoMode::Explicit if self.config.validate_seq_no => {
                    for entry in &mut state.entries {
                        if entry.seq_no <= last {
                            entry.duplicate = true;
                        }
                    }
                    state.seq_nos.observe_server_last(last);
                }
                _ => state.seq_nos.observe_server_last(last),
            }
            debug!(last_seq_no = last, queued = state.entries.len(), "Applied init sequence number");
        }
        state
            .entries
            .iter()
            .map(|entry| Accepted {
                seq_no: entry.seq_no,
                duplicate: entry.duplicate,
                position: entry.position,
            })
            .collect()
    }

    /// Returns the sequence numbers of queued messages that are not duplicates
    /// and have not been sent, in submission order.
    #[must_use]
    pub fn unsent(&self) -> Vec<u64> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|entry| !entry.duplicate && !entry.sent)
            .map(|entry| entry.seq_no)
            .collect()
    }

    /// Returns true if the message was resolved locally as a duplicate.
    #[must_use]
    pub fn is_duplicate(&self, seq_no: u64) -> bool {
        self.state
            .lock()
            .entries
            .iter()
            .any(|entry| entry.seq_no == seq_no && entry.duplicate)
    }

    /// Returns the highest accepted sequence number.
    #[must_use]
    pub fn last_seq_no(&self) -> Option<u64> {
        self.state.lock().seq_nos.last()
    }

    /// Stops minting tokens and accepting writes.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    /// Returns true once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns true if no message is awaiting resolution.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Returns a snapshot of controller state.
    #[must_use]
    pub fn stats(&self) -> FlowStats {
        let state = self.state.lock();
        FlowStats {
            memory_usage: state.memory_usage,
            inflight_count: state.entries.len() as u64,
            outstanding_tokens: self.ledger.outstanding() as u64,
            total_accepted: state.total_accepted,
            total_acknowledged: state.total_acknowledged,
            total_duplicates: state.total_duplicates,
            total_discarded: state.total_discarded,
        }
    }
}

impl std::fmt::Debug for FlowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowController")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(config: FlowControllerConfig) -> FlowController {
        let controller = FlowController::new(config).unwrap();
        controller.set_init_seq_no(0);
        controller
    }

    fn one_token(controller: &FlowController) -> ContinuationToken {
        let mut tokens = controller.mint_tokens();
        assert_eq!(tokens.len(), 1);
        tokens.pop().unwrap()
    }

    #[test]
    fn test_one_outstanding_token_by_default() {
        let controller = controller(FlowControllerConfig::for_testing());
        let mut token = one_token(&controller);
        assert!(controller.mint_tokens().is_empty());

        controller.accept(&mut token, None, 10).unwrap();
        assert_eq!(controller.mint_tokens().len(), 1);
    }

    #[test]
    fn test_token_single_use() {
        let controller = controller(FlowControllerConfig::for_testing());
        let mut token = one_token(&controller);

        controller.accept(&mut token, None, 10).unwrap();
        assert!(!token.is_valid());
        let second = controller.accept(&mut token, None, 10);
        assert!(matches!(second, Err(FlowError::InvalidToken { .. })));
        assert_eq!(controller.stats().total_accepted, 1);
    }

    #[test]
    fn test_token_from_other_controller_rejected() {
        let first = controller(FlowControllerConfig::for_testing());
        let second = controller(FlowControllerConfig::for_testing());
        let mut token = one_token(&first);
        assert!(matches!(
            second.accept(&mut token, None, 10),
            Err(FlowError::InvalidToken { .. })
        ));
    }

    #[test]
    fn test_dropped_token_returns_slot() {
        let controller = controller(FlowControllerConfig::for_testing());
        drop(one_token(&controller));
        assert_eq!(controller.stats().outstanding_tokens, 0);
        assert_eq!(controller.mint_tokens().len(), 1);
    }

    #[test]
    fn test_count_budget_withholds_tokens() {
        let config = FlowControllerConfig::for_testing()
            .with_max_inflight_count(2)
            .with_max_outstanding_tokens(4);
        let controller = controller(config);

        let tokens = controller.mint_tokens();
        assert_eq!(tokens.len(), 2);
        for mut token in tokens {
            controller.accept(&mut token, None, 1).unwrap();
        }
        assert!(controller.mint_tokens().is_empty());

        controller.on_sent(0);
        controller.acknowledge(1).unwrap();
        assert_eq!(controller.mint_tokens().len(), 1);
    }

    #[test]
    fn test_memory_budget_follows_compression() {
        let config = FlowControllerConfig::for_testing()
            .with_max_memory_usage(100)
            .with_max_outstanding_tokens(1);
        let controller = controller(config);

        let accepted = controller.accept(&mut one_token(&controller), None, 100).unwrap();
        assert_eq!(controller.stats().memory_usage, 100);
        assert!(controller.mint_tokens().is_empty());

        controller.on_compressed(accepted.position, 100, 30);
        assert_eq!(controller.stats().memory_usage, 30);
        assert_eq!(controller.mint_tokens().len(), 1);

        let acked = controller.acknowledge(accepted.seq_no).unwrap();
        assert_eq!(acked.released_bytes, 30);
        assert_eq!(controller.stats().memory_usage, 0);
    }

    #[test]
    fn test_acks_must_follow_submission_order() {
        let config = FlowControllerConfig::for_testing().with_max_outstanding_tokens(2);
        let controller = controller(config);
        for mut token in controller.mint_tokens() {
            controller.accept(&mut token, None, 1).unwrap();
        }
        assert_eq!(
            controller.acknowledge(2),
            Err(FlowError::AckOutOfOrder {
                seq_no: 2,
                expected: Some(1)
            })
        );
        controller.acknowledge(1).unwrap();
        controller.acknowledge(2).unwrap();
        assert!(controller.is_idle());
    }

    #[test]
    fn test_repeated_explicit_seq_no_resolves_in_order() {
        let config = FlowControllerConfig::for_testing().with_max_outstanding_tokens(3);
        let controller = controller(config);
        let mut tokens = controller.mint_tokens();
        assert_eq!(tokens.len(), 3);

        let first = controller.accept(&mut tokens.remove(0), Some(1), 1).unwrap();
        let second = controller.accept(&mut tokens.remove(0), Some(2), 1).unwrap();
        let repeat = controller.accept(&mut tokens.remove(0), Some(1), 1).unwrap();
        assert!(!first.duplicate && !second.duplicate);
        assert!(repeat.duplicate);
        assert_eq!(controller.unsent(), vec![1, 2]);

        // The repeat waits behind the two real writes.
        assert!(controller.drain_local_duplicates().is_empty());
        controller.acknowledge(1).unwrap();
        controller.acknowledge(2).unwrap();
        assert_eq!(controller.drain_local_duplicates(), vec![1]);
        assert!(controller.is_idle());
        assert_eq!(controller.stats().total_duplicates, 1);
    }

    #[test]
    fn test_disabled_validation_sends_repeats() {
        let config = FlowControllerConfig::for_testing()
            .with_max_outstanding_tokens(2)
            .with_validate_seq_no(false);
        let controller = controller(config);
        let mut tokens = controller.mint_tokens();
        controller.accept(&mut tokens.remove(0), Some(5), 1).unwrap();
        let repeat = controller.accept(&mut tokens.remove(0), Some(5), 1).unwrap();
        assert!(!repeat.duplicate);
        assert_eq!(controller.unsent(), vec![5, 5]);
    }

    #[test]
    fn test_repeated_seq_no_accounting_follows_position() {
        let config = FlowControllerConfig::for_testing()
            .with_max_outstanding_tokens(2)
            .with_validate_seq_no(false);
        let controller = controller(config);
        let mut tokens = controller.mint_tokens();
        let first = controller.accept(&mut tokens.remove(0), Some(5), 100).unwrap();
        let repeat = controller.accept(&mut tokens.remove(0), Some(5), 100).unwrap();
        assert_eq!((first.position, repeat.position), (0, 1));

        // Only the second message finished compressing.
        controller.on_compressed(repeat.position, 100, 10);
        controller.on_sent(repeat.position);
        assert_eq!(controller.stats().memory_usage, 110);
        assert_eq!(controller.unsent(), vec![5]);

        let acked = controller.acknowledge(5).unwrap();
        assert_eq!(acked.released_bytes, 100);
        let acked = controller.acknowledge(5).unwrap();
        assert_eq!(acked.released_bytes, 10);
        assert_eq!(controller.stats().memory_usage, 0);
    }

    #[test]
    fn test_mixed_seq_no_rejected_and_slot_returned() {
        let config = FlowControllerConfig::for_testing().with_max_outstanding_tokens(2);
        let controller = controller(config);
        let mut tokens = controller.mint_tokens();
        controller.accept(&mut tokens.remove(0), Some(1), 1).unwrap();
        let mut rejected = tokens.remove(0);
        let mixed = controller.accept(&mut rejected, None, 1);
        assert!(matches!(mixed, Err(FlowError::MixedSeqNo { .. })));

        // The rejected token stays usable until dropped.
        assert!(rejected.is_valid());
        drop(rejected);
        assert_eq!(controller.stats().outstanding_tokens, 0);
    }

    #[test]
    fn test_init_renumbers_automatic_messages() {
        let controller =
            FlowController::new(FlowControllerConfig::for_testing().with_max_outstanding_tokens(2))
                .unwrap();
        for mut token in controller.mint_tokens() {
            controller.accept(&mut token, None, 1).unwrap();
        }
        let numbers = |accepted: Vec<Accepted>| -> Vec<u64> {
            accepted.into_iter().map(|a| a.seq_no).collect()
        };
        assert_eq!(numbers(controller.set_init_seq_no(41)), vec![42, 43]);
        assert_eq!(controller.last_seq_no(), Some(43));

        // A reconnect keeps the numbers.
        assert_eq!(numbers(controller.set_init_seq_no(42)), vec![42, 43]);
    }

    #[test]
    fn test_init_marks_explicit_messages_already_written() {
        let controller =
            FlowController::new(FlowControllerConfig::for_testing().with_max_outstanding_tokens(2))
                .unwrap();
        let mut tokens = controller.mint_tokens();
        controller.accept(&mut tokens.remove(0), Some(3), 1).unwrap();
        controller.accept(&mut tokens.remove(0), Some(8), 1).unwrap();

        let flags: Vec<bool> = controller
            .set_init_seq_no(5)
            .iter()
            .map(|a| a.duplicate)
            .collect();
        assert_eq!(flags, vec![true, false]);
        assert!(controller.is_duplicate(3));
        assert_eq!(controller.drain_local_duplicates(), vec![3]);
        assert_eq!(controller.unsent(), vec![8]);
    }

    #[test]
    fn test_discard_all_resolves_each_message_once() {
        let config = FlowControllerConfig::for_testing().with_max_outstanding_tokens(3);
        let controller = controller(config);
        for mut token in controller.mint_tokens() {
            controller.accept(&mut token, None, 5).unwrap();
        }
        controller.close();

        assert_eq!(controller.discard_all(), vec![1, 2, 3]);
        assert!(controller.discard_all().is_empty());
        assert_eq!(controller.stats().total_discarded, 3);
        assert_eq!(controller.stats().memory_usage, 0);
        assert!(controller.mint_tokens().is_empty());
    }

    #[test]
    fn test_closed_controller_rejects_writes() {
        let controller = controller(FlowControllerConfig::for_testing());
        let mut token = one_token(&controller);
        controller.close();
        assert_eq!(controller.accept(&mut token, None, 1), Err(FlowError::Closed));
    }

    #[test]
    fn test_zero_budget_rejected() {
        let config = FlowControllerConfig::for_testing().with_max_inflight_count(0);
        assert!(FlowController::new(config).is_err());
    }
}
