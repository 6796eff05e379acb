//! Broker connection settings shared by both transport sides.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

/// Default maximum message size (1 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_000_000;
/// Hard ceiling for the maximum message size accepted by the broker client.
pub const MAX_MESSAGE_SIZE_CEILING: usize = 1_000_000_000;
/// Default producer buffer budget in KiB (1 GiB).
pub const DEFAULT_BUFFER_BUDGET_KB: usize = 1_048_576;
/// Default producer queue depth in messages.
pub const DEFAULT_QUEUE_DEPTH: usize = 10;
/// Default statistics interval in milliseconds.
pub const DEFAULT_STATS_INTERVAL_MS: u64 = 500;
/// Default bound on the flush performed before a producer teardown.
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 500;

/// Broker address, topic and tuning for one transport.
///
/// Mutated through the owning transport's setters; each change may rebuild
/// the broker client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Comma-joined `host:port` list. Empty means not configured.
    pub broker_address: String,
    /// Topic name. Empty means not configured.
    pub topic: String,
    /// Consumer group id (subscribe side only).
    pub group_id: Option<String>,
    /// Largest message the client will produce or fetch, in bytes.
    pub max_message_size: usize,
    /// Producer buffer budget in KiB.
    pub buffer_budget_kb: usize,
    /// Maximum number of messages queued in the producer.
    pub queue_depth: usize,
    /// Interval between broker statistics reports.
    pub stats_interval_ms: u64,
    /// Flush queued messages before tearing a producer down.
    pub flush_on_reconnect: bool,
    pub flush_timeout_ms: u64,
    /// Extra broker client properties, applied last and passed through verbatim.
    pub client_properties: BTreeMap<String, String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            broker_address: String::new(),
            topic: String::new(),
            group_id: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            buffer_budget_kb: DEFAULT_BUFFER_BUDGET_KB,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            stats_interval_ms: DEFAULT_STATS_INTERVAL_MS,
            flush_on_reconnect: true,
            flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT_MS,
            client_properties: BTreeMap::new(),
        }
    }
}

impl ConnectionConfig {
    /// Create config for publishing.
    pub fn publisher(broker_address: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            broker_address: broker_address.into(),
            topic: topic.into(),
            ..Self::default()
        }
    }

    /// Create config for subscribing with a consumer group.
    pub fn subscriber(
        broker_address: impl Into<String>,
        topic: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            broker_address: broker_address.into(),
            topic: topic.into(),
            group_id: Some(group_id.into()),
            ..Self::default()
        }
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn with_queue_depth(mut self, messages: usize) -> Self {
        self.queue_depth = messages;
        self
    }

    pub fn with_stats_interval_ms(mut self, ms: u64) -> Self {
        self.stats_interval_ms = ms;
        self
    }

    pub fn with_buffer_budget_kb(mut self, kb: usize) -> Self {
        self.buffer_budget_kb = kb;
        self
    }

    pub fn with_flush_on_reconnect(mut self, enabled: bool, timeout_ms: u64) -> Self {
        self.flush_on_reconnect = enabled;
        self.flush_timeout_ms = timeout_ms;
        self
    }

    /// Add a broker client property (e.g. `security.protocol`).
    pub fn with_client_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.client_properties.insert(key.into(), value.into());
        self
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Check the tuning values. Empty broker address and topic are allowed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size == 0 {
            return Err(invalid("max_message_size", "must be greater than zero"));
        }
        if self.max_message_size > MAX_MESSAGE_SIZE_CEILING {
            return Err(invalid(
                "max_message_size",
                format!("must not exceed {}", MAX_MESSAGE_SIZE_CEILING),
            ));
        }
        if self.buffer_budget_kb == 0 {
            return Err(invalid("buffer_budget_kb", "must be greater than zero"));
        }
        if self.queue_depth == 0 {
            return Err(invalid("queue_depth", "must be greater than zero"));
        }
        if self.stats_interval_ms == 0 {
            return Err(invalid("stats_interval_ms", "must be greater than zero"));
        }
        Ok(())
    }

    /// Broker client properties for a producer.
    pub fn producer_properties(&self) -> Vec<(String, String)> {
        let mut properties = vec![
            prop("bootstrap.servers", &self.broker_address),
            prop("message.max.bytes", self.max_message_size),
            prop("message.copy.max.bytes", self.max_message_size),
            prop("queue.buffering.max.messages", self.queue_depth),
            prop("queue.buffering.max.kbytes", self.buffer_budget_kb),
            prop("statistics.interval.ms", self.stats_interval_ms),
        ];
        self.append_client_properties(&mut properties);
        properties
    }

    /// Broker client properties for a consumer.
    pub fn consumer_properties(&self) -> Vec<(String, String)> {
        let mut properties = vec![prop("bootstrap.servers", &self.broker_address)];
        if let Some(ref group_id) = self.group_id {
            properties.push(prop("group.id", group_id));
        }
        properties.push(prop("fetch.message.max.bytes", self.max_message_size));
        properties.push(prop("statistics.interval.ms", self.stats_interval_ms));
        self.append_client_properties(&mut properties);
        properties
    }

    fn append_client_properties(&self, properties: &mut Vec<(String, String)>) {
        properties.extend(
            self.client_properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }
}

fn prop(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
