//! Write and read session settings.

use std::sync::Arc;
use std::time::Duration;

use skein_core::{require_nonzero, require_positive, Limits, PartitionId};
use skein_executor::Executor;
use skein_flow::FlowControllerConfig;

use crate::codec::{CodecId, CodecMap};
use crate::counters::{ReaderCounters, WriterCounters};
use crate::error::{SessionError, SessionResult};
use crate::handlers::{ReadEventHandlers, WriteEventHandlers};
use crate::message::MessageMeta;
use crate::protocol::TopicReadSettings;
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};

fn invalid(message: &str) -> SessionError {
    SessionError::InvalidSettings {
        message: message.to_string(),
    }
}

// ---- Write ----

/// Settings for a write session.
#[derive(Clone)]
pub struct WriteSessionSettings {
    /// Topic path.
    pub path: String,
    /// Producer identity; required for deduplication.
    pub producer_id: Option<String>,
    /// Message group; defaults to the producer id on the service.
    pub message_group_id: Option<String>,
    /// Pin writes to one partition.
    pub partition_id: Option<PartitionId>,
    /// Ask the service to deduplicate by sequence number.
    pub deduplication_enabled: Option<bool>,
    /// Metadata sent once with the init request.
    pub session_meta: MessageMeta,
    /// Codec applied to messages that are not already compressed.
    pub codec: CodecId,
    /// Level passed to the codec.
    pub compression_level: i32,
    /// Flow-control budgets.
    pub flow: FlowControllerConfig,
    /// How long [`init_seq_no`](crate::WriteSession::init_seq_no) callers
    /// wait by default.
    pub connect_timeout: Duration,
    /// Longest a ready message waits to be batched with later ones; `None`
    /// sends at once.
    pub batch_flush_interval: Option<Duration>,
    /// Ready bytes that end a batch before its interval elapses.
    pub batch_flush_size_bytes: u64,
    /// Event handlers.
    pub handlers: WriteEventHandlers,
    /// Executor for compression; a two-thread pool when `None`.
    pub compression_executor: Option<Arc<dyn Executor>>,
    /// Decides whether a lost stream is reopened.
    pub retry_policy: Arc<dyn RetryPolicy>,
    /// Available codecs.
    pub codecs: CodecMap,
    /// Diagnostic counters.
    pub counters: Arc<WriterCounters>,
}

impl WriteSessionSettings {
    /// Creates settings for writing to `path` with client defaults.
    pub fn new(path: impl Into<String>) -> Self {
        let limits = Limits::new();
        Self {
            path: path.into(),
            producer_id: None,
            message_group_id: None,
            partition_id: None,
            deduplication_enabled: None,
            session_meta: MessageMeta::new(),
            codec: CodecId::RAW,
            compression_level: limits.compression_level,
            flow: FlowControllerConfig::from_limits(&limits),
            connect_timeout: limits.connect_timeout,
            batch_flush_interval: None,
            batch_flush_size_bytes: limits.batch_flush_size_bytes,
            handlers: WriteEventHandlers::new(),
            compression_executor: None,
            retry_policy: Arc::new(ExponentialBackoffPolicy::default()),
            codecs: CodecMap::new(),
            counters: Arc::new(WriterCounters::new()),
        }
    }

    /// Creates settings for testing: small budgets, fast retries.
    pub fn for_testing(path: impl Into<String>) -> Self {
        Self {
            flow: FlowControllerConfig::for_testing(),
            connect_timeout: Duration::from_secs(5),
            retry_policy: Arc::new(ExponentialBackoffPolicy::for_testing()),
            ..Self::new(path)
        }
    }

    /// Sets the producer id.
    #[must_use]
    pub fn with_producer_id(mut self, producer_id: impl Into<String>) -> Self {
        self.producer_id = Some(producer_id.into());
        self
    }

    /// Sets the message group id.
    #[must_use]
    pub fn with_message_group_id(mut self, message_group_id: impl Into<String>) -> Self {
        self.message_group_id = Some(message_group_id.into());
        self
    }

    /// Pins writes to `partition_id`.
    #[must_use]
    pub const fn with_partition_id(mut self, partition_id: PartitionId) -> Self {
        self.partition_id = Some(partition_id);
        self
    }

    /// Enables or disables service-side deduplication.
    #[must_use]
    pub const fn with_deduplication(mut self, enabled: bool) -> Self {
        self.deduplication_enabled = Some(enabled);
        self
    }

    /// Sets session metadata.
    #[must_use]
    pub fn with_session_meta(mut self, meta: MessageMeta) -> Self {
        self.session_meta = meta;
        self
    }

    /// Sets the codec and compression level.
    #[must_use]
    pub const fn with_codec(mut self, codec: CodecId, level: i32) -> Self {
        self.codec = codec;
        self.compression_level = level;
        self
    }

    /// Sets flow-control budgets.
    #[must_use]
    pub const fn with_flow(mut self, flow: FlowControllerConfig) -> Self {
        self.flow = flow;
        self
    }

    /// Holds ready messages for up to `interval` so they go out together.
    ///
    /// A zero interval sends every message at once.
    #[must_use]
    pub const fn with_batch_flush_interval(mut self, interval: Duration) -> Self {
        self.batch_flush_interval = Some(interval);
        self
    }

    /// Sends a held batch as soon as `bytes` are ready.
    ///
    /// Zero sends every message at once.
    #[must_use]
    pub const fn with_batch_flush_size_bytes(mut self, bytes: u64) -> Self {
        self.batch_flush_size_bytes = bytes;
        self
    }

    /// Returns the batching interval, or `None` when messages go out at once.
    #[must_use]
    pub fn batch_window(&self) -> Option<Duration> {
        self.batch_flush_interval
            .filter(|interval| !interval.is_zero() && self.batch_flush_size_bytes > 0)
    }

    /// Sets event handlers.
    #[must_use]
    pub fn with_handlers(mut self, handlers: WriteEventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Sets the compression executor.
    #[must_use]
    pub fn with_compression_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.compression_executor = Some(executor);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets available codecs.
    #[must_use]
    pub fn with_codecs(mut self, codecs: CodecMap) -> Self {
        self.codecs = codecs;
        self
    }

    /// Shares `counters` with the session.
    #[must_use]
    pub fn with_counters(mut self, counters: Arc<WriterCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Validates the settings.
    ///
    /// # Errors
    /// Returns an error if the path is empty, the codec is not registered or
    /// a budget is zero.
    pub fn validate(&self) -> SessionResult<()> {
        if self.path.is_empty() {
            return Err(invalid("path must not be empty"));
        }
        if !self.codecs.contains(self.codec) {
            return Err(SessionError::InvalidSettings {
                message: format!("codec {} is not registered", self.codec),
            });
        }
        require_nonzero("connect_timeout", self.connect_timeout)?;
        self.flow.validate()?;
        Ok(())
    }
}

impl std::fmt::Debug for WriteSessionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSessionSettings")
            .field("path", &self.path)
            .field("producer_id", &self.producer_id)
            .field("message_group_id", &self.message_group_id)
            .field("partition_id", &self.partition_id)
            .field("codec", &self.codec)
            .field("flow", &self.flow)
            .field("batch_flush_interval", &self.batch_flush_interval)
            .field("batch_flush_size_bytes", &self.batch_flush_size_bytes)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

// ---- Read ----

/// Settings for a read session.
#[derive(Clone)]
pub struct ReadSessionSettings {
    /// Consumer name; `None` reads without committing.
    pub consumer: Option<String>,
    /// Topics to read.
    pub topics: Vec<TopicReadSettings>,
    /// Bytes granted to the service for unprocessed data.
    pub max_memory_usage_bytes: u64,
    /// Decompress payloads before delivery.
    pub decompress: bool,
    /// Event handlers.
    pub handlers: ReadEventHandlers,
    /// Executor for decompression; a two-thread pool when `None`.
    pub decompression_executor: Option<Arc<dyn Executor>>,
    /// Decides whether a lost stream is reopened.
    pub retry_policy: Arc<dyn RetryPolicy>,
    /// Available codecs.
    pub codecs: CodecMap,
    /// Diagnostic counters.
    pub counters: Arc<ReaderCounters>,
}

impl ReadSessionSettings {
    /// Creates settings for reading as `consumer` with client defaults.
    pub fn new(consumer: impl Into<String>) -> Self {
        Self {
            consumer: Some(consumer.into()),
            ..Self::without_consumer()
        }
    }

    /// Creates settings for reading without a consumer.
    #[must_use]
    pub fn without_consumer() -> Self {
        Self {
            consumer: None,
            topics: Vec::new(),
            max_memory_usage_bytes: Limits::new().max_read_memory_usage,
            decompress: true,
            handlers: ReadEventHandlers::new(),
            decompression_executor: None,
            retry_policy: Arc::new(ExponentialBackoffPolicy::default()),
            codecs: CodecMap::new(),
            counters: Arc::new(ReaderCounters::new()),
        }
    }

    /// Creates settings for testing: small grant, fast retries.
    pub fn for_testing(consumer: impl Into<String>) -> Self {
        Self {
            max_memory_usage_bytes: 64 * 1024,
            retry_policy: Arc::new(ExponentialBackoffPolicy::for_testing()),
            ..Self::new(consumer)
        }
    }

    /// Adds a topic.
    #[must_use]
    pub fn with_topic(mut self, topic: TopicReadSettings) -> Self {
        self.topics.push(topic);
        self
    }

    /// Sets the memory grant.
    #[must_use]
    pub const fn with_max_memory_usage_bytes(mut self, bytes: u64) -> Self {
        self.max_memory_usage_bytes = bytes;
        self
    }

    /// Enables or disables decompression.
    #[must_use]
    pub const fn with_decompress(mut self, decompress: bool) -> Self {
        self.decompress = decompress;
        self
    }

    /// Sets event handlers.
    #[must_use]
    pub fn with_handlers(mut self, handlers: ReadEventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Sets the decompression executor.
    #[must_use]
    pub fn with_decompression_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.decompression_executor = Some(executor);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets available codecs.
    #[must_use]
    pub fn with_codecs(mut self, codecs: CodecMap) -> Self {
        self.codecs = codecs;
        self
    }

    /// Shares `counters` with the session.
    #[must_use]
    pub fn with_counters(mut self, counters: Arc<ReaderCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Validates the settings.
    ///
    /// # Errors
    /// Returns an error if no topic is set, a topic path is empty or the
    /// memory grant is zero.
    pub fn validate(&self) -> SessionResult<()> {
        if self.topics.is_empty() {
            return Err(invalid("at least one topic is required"));
        }
        if self.topics.iter().any(|topic| topic.path.is_empty()) {
            return Err(invalid("topic path must not be empty"));
        }
        require_positive("max_memory_usage_bytes", self.max_memory_usage_bytes)?;
        Ok(())
    }
}

impl std::fmt::Debug for ReadSessionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSessionSettings")
            .field("consumer", &self.consumer)
            .field("topics", &self.topics)
            .field("max_memory_usage_bytes", &self.max_memory_usage_bytes)
            .field("decompress", &self.decompress)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_settings_defaults_follow_limits() {
        let settings = WriteSessionSettings::new("/topic");
        let limits = Limits::new();
        assert_eq!(settings.flow.max_memory_usage, limits.max_memory_usage);
        assert_eq!(settings.flow.max_outstanding_tokens, 1);
        assert_eq!(settings.codec, CodecId::RAW);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_unregistered_codec_rejected() {
        let settings = WriteSessionSettings::for_testing("/topic").with_codec(CodecId::ZSTD, 3);
        assert!(matches!(
            settings.validate(),
            Err(SessionError::InvalidSettings { .. })
        ));
    }

    #[test]
    fn test_zero_flow_budget_rejected() {
        let settings = WriteSessionSettings::for_testing("/topic")
            .with_flow(FlowControllerConfig::for_testing().with_max_inflight_count(0));
        assert!(matches!(settings.validate(), Err(SessionError::Flow(_))));
    }

    #[test]
    fn test_zero_connect_timeout_names_setting() {
        let mut settings = WriteSessionSettings::for_testing("/topic");
        settings.connect_timeout = Duration::ZERO;
        match settings.validate() {
            Err(SessionError::InvalidSettings { message }) => {
                assert_eq!(message, "invalid argument 'connect_timeout': must be positive");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_batching_needs_interval_and_size() {
        let settings = WriteSessionSettings::for_testing("/topic");
        assert_eq!(settings.batch_window(), None);

        let settings = settings.with_batch_flush_interval(Duration::from_millis(50));
        assert_eq!(settings.batch_window(), Some(Duration::from_millis(50)));
        assert_eq!(settings.clone().with_batch_flush_size_bytes(0).batch_window(), None);
        assert_eq!(settings.with_batch_flush_interval(Duration::ZERO).batch_window(), None);
    }

    #[test]
    fn test_zero_read_grant_rejected() {
        let settings = ReadSessionSettings::for_testing("consumer")
            .with_topic(TopicReadSettings::new("/topic"))
            .with_max_memory_usage_bytes(0);
        assert!(matches!(
            settings.validate(),
            Err(SessionError::InvalidSettings { message }) if message.contains("max_memory_usage_bytes")
        ));
    }

    #[test]
    fn test_read_settings_require_topic() {
        let settings = ReadSessionSettings::for_testing("consumer");
        assert!(settings.validate().is_err());
        let settings = settings.with_topic(TopicReadSettings::new("/topic"));
        assert!(settings.validate().is_ok());
        assert_eq!(settings.consumer.as_deref(), Some("consumer"));
    }
}
