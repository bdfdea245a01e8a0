//! Diagnostic counters for readers and writers.
//!
//! Counters are shared as `Arc` so an application can pass the same object
//! to several sessions and read aggregated totals.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`WriterCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterCountersSnapshot {
    /// Messages accepted for writing.
    pub messages_written: u64,
    /// Uncompressed bytes accepted for writing.
    pub bytes_written: u64,
    /// Compressed bytes handed to the transport.
    pub bytes_written_compressed: u64,
    /// Messages acknowledged as written.
    pub acks_written: u64,
    /// Messages acknowledged as already written.
    pub acks_already_written: u64,
    /// Messages discarded on close.
    pub acks_discarded: u64,
    /// Connection losses and transport errors.
    pub errors: u64,
}

/// Write-side counters.
#[derive(Debug, Default)]
pub struct WriterCounters {
    messages_written: AtomicU64,
    bytes_written: AtomicU64,
    bytes_written_compressed: AtomicU64,
    acks_written: AtomicU64,
    acks_already_written: AtomicU64,
    acks_discarded: AtomicU64,
    errors: AtomicU64,
}

impl WriterCounters {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_accepted(&self, bytes: u64) {
        self.messages_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self, compressed_bytes: u64) {
        self.bytes_written_compressed
            .fetch_add(compressed_bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self) {
        self.acks_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_already_written(&self) {
        self.acks_already_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self, count: u64) {
        self.acks_discarded.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot.
    #[must_use]
    pub fn snapshot(&self) -> WriterCountersSnapshot {
        WriterCountersSnapshot {
            messages_written: self.messages_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_written_compressed: self.bytes_written_compressed.load(Ordering::Relaxed),
            acks_written: self.acks_written.load(Ordering::Relaxed),
            acks_already_written: self.acks_already_written.load(Ordering::Relaxed),
            acks_discarded: self.acks_discarded.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ReaderCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderCountersSnapshot {
    /// Messages delivered to the application.
    pub messages_read: u64,
    /// Bytes received from the service.
    pub bytes_read: u64,
    /// Messages whose payload failed to decompress.
    pub decompression_errors: u64,
    /// Commit requests sent.
    pub commits_sent: u64,
    /// Partition sessions started by the service.
    pub partition_sessions_started: u64,
    /// Partition sessions closed for any reason.
    pub partition_sessions_closed: u64,
    /// Connection losses and transport errors.
    pub errors: u64,
}

/// Read-side counters.
#[derive(Debug, Default)]
pub struct ReaderCounters {
    messages_read: AtomicU64,
    bytes_read: AtomicU64,
    decompression_errors: AtomicU64,
    commits_sent: AtomicU64,
    partition_sessions_started: AtomicU64,
    partition_sessions_closed: AtomicU64,
    errors: AtomicU64,
}

impl ReaderCounters {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read(&self, messages: u64, bytes: u64) {
        self.messages_read.fetch_add(messages, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_decompression_error(&self) {
        self.decompression_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_partition_started(&self) {
        self.partition_sessions_started
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_partition_closed(&self) {
        self.partition_sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ReaderCountersSnapshot {
        ReaderCountersSnapshot {
            messages_read: self.messages_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            decompression_errors: self.decompression_errors.load(Ordering::Relaxed),
            commits_sent: self.commits_sent.load(Ordering::Relaxed),
            partition_sessions_started: self.partition_sessions_started.load(Ordering::Relaxed),
            partition_sessions_closed: self.partition_sessions_closed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
