//! Broker transport for encoded frames.
//!
//! This module contains:
//! - `PublishTransport`: hands encoded frames to a producer with bounded queueing
//! - `SubscribeTransport`: reads frames from one partition at a tracked offset
//! - Backend traits (`ProducerFactory`/`ProducerClient`, `ConsumerFactory`/`ConsumerClient`)
//! - Implementations: in-process memory broker, Kafka

use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConfigError, ConnectionConfig};
use crate::status::BrokerEvent;

// Implementation modules
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
mod publish;
mod subscribe;

// Re-exports
#[cfg(feature = "kafka")]
pub use kafka::KafkaBackend;
pub use memory::MemoryBroker;
pub use publish::PublishTransport;
pub use subscribe::SubscribeTransport;

/// Longest topic name a broker accepts.
pub const MAX_TOPIC_LEN: usize = 249;

/// Raw value of [`Offset::Beginning`].
pub const OFFSET_BEGINNING: i64 = -2;
/// Raw value of [`Offset::End`].
pub const OFFSET_END: i64 = -1;
/// Raw value of [`Offset::Stored`].
pub const OFFSET_STORED: i64 = -1000;

pub const MSG_CONNECTING: &str = "Connecting to topic.";
pub const MSG_RECONNECTING: &str = "Reconnecting.";
pub const MSG_FLUSH_TIMED_OUT: &str = "Timed out when waiting for msg flush.";
pub const MSG_FLUSH_FAILED: &str = "Unknown error when waiting for msg flush.";
pub const MSG_PRODUCER_FAILED: &str = "Unable to create producer.";
pub const MSG_CONSUMER_FAILED: &str = "Unable to create consumer.";
pub const MSG_TOPIC_FAILED: &str = "Unable to create topic.";
pub const MSG_ASSIGN_FAILED: &str = "Unable to assign partition.";
pub const MSG_GROUP_ID_FAILED: &str = "Unable to set group id.";
pub const MSG_MAX_SIZE_FAILED: &str = "Unable to set max message size.";
pub const MSG_INIT_FAILED: &str = "Unable to init kafka sub-system.";
pub const MSG_STARTING_POLLER: &str = "Starting status thread.";

// ============================================================================
// Errors
// ============================================================================

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised by backends and rebuild paths.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport is in a permanent error state")]
    PermanentError,

    #[error("Transport is not connected to a topic")]
    NotReady,
}

impl From<ConfigError> for TransportError {
    fn from(error: ConfigError) -> Self {
        TransportError::InvalidConfig(error.to_string())
    }
}

/// Failure to enqueue one message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProduceError {
    #[error("Producer queue is full")]
    QueueFull,

    #[error("Message of {size} bytes exceeds limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Broker error code {0}")]
    Broker(i32),
}

/// Failure to drain the producer queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlushError {
    #[error("Timed out waiting for queued messages")]
    TimedOut,

    #[error("Broker error code {0}")]
    Broker(i32),
}

/// Failure reported in place of a message by a consumer poll.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsumeError {
    #[error("Broker error code {0}")]
    Broker(i32),
}

// ============================================================================
// Offsets
// ============================================================================

/// Consumer read position within a partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Offset {
    Beginning,
    #[default]
    End,
    /// Position committed for the consumer group.
    Stored,
    At(i64),
}

impl Offset {
    /// Map a raw value (sentinel or non-negative) to an offset.
    pub fn from_raw(value: i64) -> Option<Self> {
        match value {
            OFFSET_BEGINNING => Some(Offset::Beginning),
            OFFSET_END => Some(Offset::End),
            OFFSET_STORED => Some(Offset::Stored),
            n if n >= 0 => Some(Offset::At(n)),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i64 {
        match self {
            Offset::Beginning => OFFSET_BEGINNING,
            Offset::End => OFFSET_END,
            Offset::Stored => OFFSET_STORED,
            Offset::At(n) => n,
        }
    }
}

impl TryFrom<i64> for Offset {
    type Error = TransportError;

    fn try_from(value: i64) -> Result<Self> {
        Offset::from_raw(value)
            .ok_or_else(|| TransportError::InvalidConfig(format!("invalid offset {}", value)))
    }
}

/// Where a subscriber starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSetting {
    Beginning,
    End,
    Stored,
    /// Explicit raw offset; sentinels are accepted too.
    Manual(i64),
}

impl OffsetSetting {
    pub fn to_offset(self) -> Option<Offset> {
        match self {
            OffsetSetting::Beginning => Some(Offset::Beginning),
            OffsetSetting::End => Some(Offset::End),
            OffsetSetting::Stored => Some(Offset::Stored),
            OffsetSetting::Manual(value) => Offset::from_raw(value),
        }
    }
}

// ============================================================================
// Backend traits
// ============================================================================

/// Callback a backend invokes for asynchronous broker events.
pub type EventCallback = Arc<dyn Fn(BrokerEvent) + Send + Sync>;

/// A message read by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub payload: Vec<u8>,
    pub offset: i64,
    pub partition: i32,
    pub topic: String,
}

/// Producer handle owned by a `PublishTransport`.
pub trait ProducerClient: Send {
    /// Enqueue a copy of `payload` without blocking.
    fn produce(&mut self, topic: &str, payload: &[u8]) -> std::result::Result<(), ProduceError>;

    /// Serve delivery reports and events.
    fn poll(&mut self, timeout: Duration);

    /// Wait up to `timeout` for queued messages to be delivered.
    fn flush(&mut self, timeout: Duration) -> std::result::Result<(), FlushError>;

    /// Messages enqueued but not yet acknowledged.
    fn in_flight_count(&self) -> usize;

    /// Messages the broker reported as undeliverable since creation.
    fn failed_deliveries(&self) -> u64;
}

/// Creates producers from a connection config.
pub trait ProducerFactory: Send + Sync + 'static {
    type Producer: ProducerClient + 'static;

    fn create_producer(
        &self,
        config: &ConnectionConfig,
        events: EventCallback,
    ) -> Result<Self::Producer>;
}

/// Consumer handle owned by a `SubscribeTransport`.
pub trait ConsumerClient: Send {
    fn assign(&mut self, topic: &str, partition: i32, offset: Offset) -> Result<()>;

    fn unassign(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn resume(&mut self) -> Result<()>;

    /// Wait up to `timeout` for the next message. `None` on timeout.
    fn poll(
        &mut self,
        timeout: Duration,
    ) -> Option<std::result::Result<ReceivedMessage, ConsumeError>>;
}

/// Creates consumers from a connection config.
pub trait ConsumerFactory: Send + Sync + 'static {
    type Consumer: ConsumerClient + 'static;

    fn create_consumer(
        &self,
        config: &ConnectionConfig,
        events: EventCallback,
    ) -> Result<Self::Consumer>;
}

/// Check a topic name against the broker's naming rules.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.len() > MAX_TOPIC_LEN || topic == "." || topic == ".." {
        return Err(TransportError::InvalidConfig(format!(
            "invalid topic name '{}'",
            topic
        )));
    }
    if let Some(c) = topic
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(TransportError::InvalidConfig(format!(
            "topic '{}' contains illegal character '{}'",
            topic, c
        )));
    }
    Ok(())
}
