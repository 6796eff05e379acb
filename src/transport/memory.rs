//! In-process broker backend.
//!
//! `MemoryBroker` keeps one append-only log per topic with a single
//! partition. It can be switched down and up to model outages. Producers
//! hold messages in a bounded local queue until `poll` finds the broker
//! up; consumers block on a condition variable until a message arrives.
//! Both emit statistics JSON in the same shape as librdkafka.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, warn};

use super::{
    ConsumeError, ConsumerClient, ConsumerFactory, EventCallback, FlushError, Offset,
    ProduceError, ProducerClient, ProducerFactory, ReceivedMessage, Result, TransportError,
};
use crate::config::ConnectionConfig;
use crate::status::{BrokerError, BrokerEvent};
use crate::utils::lock;

#[derive(Default)]
struct BrokerState {
    down: bool,
    reject_connections: bool,
    reject_deliveries: bool,
    topics: HashMap<String, Vec<Vec<u8>>>,
    stored_offsets: HashMap<(String, String), i64>,
    producers_created: usize,
    consumers_created: usize,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    arrivals: Condvar,
}

/// In-process broker shared by any number of producers and consumers.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("MemoryBroker")
            .field("down", &state.down)
            .field("topics", &state.topics.len())
            .finish()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the broker up or take it down.
    pub fn set_available(&self, available: bool) {
        lock(&self.inner.state).down = !available;
        self.inner.arrivals.notify_all();
    }

    /// Make producers drop queued messages as failed deliveries.
    pub fn set_reject_deliveries(&self, reject: bool) {
        lock(&self.inner.state).reject_deliveries = reject;
    }

    pub fn is_available(&self) -> bool {
        !lock(&self.inner.state).down
    }

    /// Make new producer and consumer creation fail.
    pub fn set_reject_connections(&self, reject: bool) {
        lock(&self.inner.state).reject_connections = reject;
    }

    /// Append a message directly to a topic log and return its offset.
    pub fn append(&self, topic: &str, payload: Vec<u8>) -> i64 {
        let offset = {
            let mut state = lock(&self.inner.state);
            let log = state.topics.entry(topic.to_string()).or_default();
            log.push(payload);
            log.len() as i64 - 1
        };
        self.inner.arrivals.notify_all();
        offset
    }

    pub fn messages(&self, topic: &str) -> Vec<Vec<u8>> {
        lock(&self.inner.state)
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn message_count(&self, topic: &str) -> usize {
        lock(&self.inner.state).topics.get(topic).map_or(0, Vec::len)
    }

    pub fn producers_created(&self) -> usize {
        lock(&self.inner.state).producers_created
    }

    pub fn consumers_created(&self) -> usize {
        lock(&self.inner.state).consumers_created
    }

    /// Next offset to read for a consumer group, once the group has read anything.
    pub fn stored_offset(&self, group_id: &str, topic: &str) -> Option<i64> {
        lock(&self.inner.state)
            .stored_offsets
            .get(&(group_id.to_string(), topic.to_string()))
            .copied()
    }

    fn register(&self, kind: &str) -> Result<()> {
        let mut state = lock(&self.inner.state);
        if state.reject_connections {
            return Err(TransportError::Connection(format!(
                "memory broker refused {}",
                kind
            )));
        }
        match kind {
            "producer" => state.producers_created += 1,
            _ => state.consumers_created += 1,
        }
        Ok(())
    }

    fn stats_json(&self, kind: &str, msg_cnt: usize) -> String {
        let state = if self.is_available() { "UP" } else { "DOWN" };
        json!({
            "name": format!("memory#{}", kind),
            "type": kind,
            "brokers": [{ "name": "memory:0/0", "state": state }],
            "msg_cnt": msg_cnt,
        })
        .to_string()
    }
}

/// Emits statistics at a fixed interval.
struct StatsTimer {
    interval: Duration,
    last: Instant,
}

impl StatsTimer {
    fn new(interval_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            last: Instant::now(),
        }
    }

    fn due(&mut self) -> bool {
        if self.last.elapsed() >= self.interval {
            self.last = Instant::now();
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Producer
// ============================================================================

pub struct MemoryProducer {
    broker: MemoryBroker,
    events: EventCallback,
    max_message_size: usize,
    queue_depth: usize,
    queue: VecDeque<(String, Vec<u8>)>,
    stats: StatsTimer,
    reported_down: bool,
    failed_deliveries: u64,
}

impl MemoryProducer {
    /// Deliver everything queued if the broker is up.
    fn deliver(&mut self) -> bool {
        {
            let mut state = lock(&self.broker.inner.state);
            if state.down {
                return false;
            }
            if state.reject_deliveries {
                for (topic, _) in self.queue.drain(..) {
                    self.failed_deliveries += 1;
                    warn!(
                        failed = self.failed_deliveries,
                        topic = %topic,
                        "Frame delivery failed"
                    );
                }
                return true;
            }
            for (topic, payload) in self.queue.drain(..) {
                state.topics.entry(topic).or_default().push(payload);
            }
        }
        self.broker.inner.arrivals.notify_all();
        true
    }
}

impl ProducerFactory for MemoryBroker {
    type Producer = MemoryProducer;

    fn create_producer(
        &self,
        config: &ConnectionConfig,
        events: EventCallback,
    ) -> Result<MemoryProducer> {
        self.register("producer")?;
        debug!(queue_depth = config.queue_depth, "Created memory producer");
        Ok(MemoryProducer {
            broker: self.clone(),
            events,
            max_message_size: config.max_message_size,
            queue_depth: config.queue_depth,
            queue: VecDeque::with_capacity(config.queue_depth),
            stats: StatsTimer::new(config.stats_interval_ms),
            reported_down: false,
            failed_deliveries: 0,
        })
    }
}

impl ProducerClient for MemoryProducer {
    fn produce(&mut self, topic: &str, payload: &[u8]) -> std::result::Result<(), ProduceError> {
        if payload.len() > self.max_message_size {
            return Err(ProduceError::MessageTooLarge {
                size: payload.len(),
                max: self.max_message_size,
            });
        }
        if self.queue.len() >= self.queue_depth {
            return Err(ProduceError::QueueFull);
        }
        self.queue.push_back((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn poll(&mut self, _timeout: Duration) {
        let delivered = self.deliver();
        if !delivered && !self.reported_down {
            (self.events)(BrokerEvent::Error(BrokerError::AllBrokersDown));
        }
        self.reported_down = !delivered;

        if self.stats.due() {
            let json = self.broker.stats_json("producer", self.queue.len());
            (self.events)(BrokerEvent::Stats(json));
        }
    }

    /// Fails at once with `TimedOut` while the broker is down and messages are queued.
    fn flush(&mut self, _timeout: Duration) -> std::result::Result<(), FlushError> {
        if self.deliver() || self.queue.is_empty() {
            Ok(())
        } else {
            Err(FlushError::TimedOut)
        }
    }

    fn in_flight_count(&self) -> usize {
        self.queue.len()
    }

    fn failed_deliveries(&self) -> u64 {
        self.failed_deliveries
    }
}

// ============================================================================
// Consumer
// ============================================================================

pub struct MemoryConsumer {
    broker: MemoryBroker,
    events: EventCallback,
    group_id: Option<String>,
    assignment: Option<(String, i64)>,
    paused: bool,
    stats: StatsTimer,
}

impl ConsumerFactory for MemoryBroker {
    type Consumer = MemoryConsumer;

    fn create_consumer(
        &self,
        config: &ConnectionConfig,
        events: EventCallback,
    ) -> Result<MemoryConsumer> {
        self.register("consumer")?;
        debug!(group_id = ?config.group_id, "Created memory consumer");
        Ok(MemoryConsumer {
            broker: self.clone(),
            events,
            group_id: config.group_id.clone(),
            assignment: None,
            paused: false,
            stats: StatsTimer::new(config.stats_interval_ms),
        })
    }
}

impl ConsumerClient for MemoryConsumer {
    fn assign(&mut self, topic: &str, partition: i32, offset: Offset) -> Result<()> {
        if partition != 0 {
            return Err(TransportError::InvalidConfig(format!(
                "memory broker has no partition {}",
                partition
            )));
        }
        let state = lock(&self.broker.inner.state);
        let end = state.topics.get(topic).map_or(0, |log| log.len() as i64);
        let position = match offset {
            Offset::Beginning => 0,
            Offset::End => end,
            Offset::Stored => self
                .group_id
                .as_ref()
                .and_then(|group| {
                    state
                        .stored_offsets
                        .get(&(group.clone(), topic.to_string()))
                        .copied()
                })
                .unwrap_or(end),
            Offset::At(n) => n,
        };
        self.assignment = Some((topic.to_string(), position));
        self.paused = false;
        Ok(())
    }

    fn unassign(&mut self) -> Result<()> {
        self.assignment = None;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.paused = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.paused = false;
        Ok(())
    }

    fn poll(
        &mut self,
        timeout: Duration,
    ) -> Option<std::result::Result<ReceivedMessage, ConsumeError>> {
        if self.stats.due() {
            let json = self.broker.stats_json("consumer", 0);
            (self.events)(BrokerEvent::Stats(json));
        }

        let deadline = Instant::now() + timeout;
        let (topic, position) = self.assignment.clone()?;
        let mut state = lock(&self.broker.inner.state);
        loop {
            if !state.down && !self.paused {
                let next = usize::try_from(position)
                    .ok()
                    .and_then(|index| state.topics.get(&topic).and_then(|log| log.get(index)))
                    .cloned();
                if let Some(payload) = next {
                    if let Some(ref group) = self.group_id {
                        state
                            .stored_offsets
                            .insert((group.clone(), topic.clone()), position + 1);
                    }
                    self.assignment = Some((topic.clone(), position + 1));
                    return Some(Ok(ReceivedMessage {
                        payload,
                        offset: position,
                        partition: 0,
                        topic,
                    }));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state = self
                .broker
                .inner
                .arrivals
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}
