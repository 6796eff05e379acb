//! Connection status derivation.
//!
//! This module contains:
//! - `ConnectionState`: coarse link health pushed to observers
//! - `BrokerEvent`: events raised by a broker client (errors, stats, logs, throttling)
//! - `StatusMonitor`: turns broker events into state pushes
//! - `TransportObserver` trait plus logging and recording implementations

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, error, info, trace, warn, Level};

use crate::utils::lock;

/// Longest status message pushed to observers, in bytes.
pub const MAX_STATUS_MESSAGE_LEN: usize = 40;

pub const MSG_NO_ERRORS: &str = "No errors.";
pub const MSG_BROKERS_DOWN: &str = "Brokers down. Attempting reconnection.";
pub const MSG_BROKERS_DOWN_EVENT: &str = "Brokers down. Attempting to reconnect.";
pub const MSG_UNABLE_TO_PARSE: &str = "Status msg.: Unable to parse.";
pub const MSG_NO_BROKERS: &str = "Status msg.: No brokers.";

// ============================================================================
// State
// ============================================================================

/// Coarse connection state of one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ConnectionState {
    Connected = 0,
    Connecting = 1,
    Disconnected = 2,
    Error = 3,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Which side of the link a monitor reports for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSide {
    Publish,
    Subscribe,
}

/// Truncate to [`MAX_STATUS_MESSAGE_LEN`] bytes on a character boundary.
pub fn truncate_message(message: &str) -> String {
    if message.len() <= MAX_STATUS_MESSAGE_LEN {
        return message.to_string();
    }
    let mut end = MAX_STATUS_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

// ============================================================================
// Broker events
// ============================================================================

/// Error reported asynchronously by a broker client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    AllBrokersDown,
    Other { code: i32, reason: String },
}

/// Event raised by a broker client outside of any call.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Error(BrokerError),
    /// Raw statistics JSON.
    Stats(String),
    Log {
        level: Level,
        facility: String,
        message: String,
    },
    Throttle {
        broker: String,
        duration_ms: i64,
    },
}

// ============================================================================
// Observers
// ============================================================================

/// Receiver of status pushes.
///
/// Pushes are not de-duplicated; an observer that only cares about changes
/// must compare against what it last saw.
///
/// Transports never call an observer while holding their own locks, so a
/// callback may call back into the transport that raised it.
pub trait TransportObserver: Send + Sync {
    fn on_connection_state_changed(&self, state: ConnectionState, message: &str);

    fn on_queue_depth_changed(&self, _count: i64) {}

    fn on_offset_changed(&self, _offset: i64) {}

    fn on_max_message_size_changed(&self, _bytes: usize) {}
}

/// Observer that writes every push to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl TransportObserver for LogObserver {
    fn on_connection_state_changed(&self, state: ConnectionState, message: &str) {
        info!(state = %state, status = message, "Connection state");
    }

    fn on_queue_depth_changed(&self, count: i64) {
        trace!(count, "Queue depth");
    }

    fn on_offset_changed(&self, offset: i64) {
        trace!(offset, "Offset");
    }

    fn on_max_message_size_changed(&self, bytes: usize) {
        info!(bytes, "Max message size");
    }
}

/// One recorded observer call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedEvent {
    State(ConnectionState, String),
    QueueDepth(i64),
    Offset(i64),
    MaxMessageSize(usize),
}

/// Observer that records every call in order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        lock(&self.events).clone()
    }

    pub fn states(&self) -> Vec<(ConnectionState, String)> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                ObservedEvent::State(state, message) => Some((*state, message.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn last_state(&self) -> Option<(ConnectionState, String)> {
        self.states().pop()
    }

    pub fn queue_depths(&self) -> Vec<i64> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                ObservedEvent::QueueDepth(count) => Some(*count),
                _ => None,
            })
            .collect()
    }

    pub fn offsets(&self) -> Vec<i64> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                ObservedEvent::Offset(offset) => Some(*offset),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    fn record(&self, event: ObservedEvent) {
        lock(&self.events).push(event);
    }
}

impl TransportObserver for RecordingObserver {
    fn on_connection_state_changed(&self, state: ConnectionState, message: &str) {
        self.record(ObservedEvent::State(state, message.to_string()));
    }

    fn on_queue_depth_changed(&self, count: i64) {
        self.record(ObservedEvent::QueueDepth(count));
    }

    fn on_offset_changed(&self, offset: i64) {
        self.record(ObservedEvent::Offset(offset));
    }

    fn on_max_message_size_changed(&self, bytes: usize) {
        self.record(ObservedEvent::MaxMessageSize(bytes));
    }
}

// ============================================================================
// StatusMonitor
// ============================================================================

/// Derives connection state from broker events and pushes it to an observer.
///
/// Shared between a transport and the broker client callback, so every
/// method takes `&self`. While any [`PushHold`] is alive, pushes are queued
/// and delivered in order once the last hold is released.
pub struct StatusMonitor {
    side: TransportSide,
    observer: Arc<dyn TransportObserver>,
    last: Mutex<(ConnectionState, String)>,
    pending: Mutex<Vec<ObservedEvent>>,
    holds: AtomicUsize,
}

/// Defers observer pushes until dropped. See [`StatusMonitor::hold`].
#[must_use = "pushes are only deferred while the hold is alive"]
pub struct PushHold<'a> {
    monitor: &'a StatusMonitor,
}

impl Drop for PushHold<'_> {
    fn drop(&mut self) {
        if self.monitor.holds.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.monitor.flush();
        }
    }
}

impl fmt::Debug for StatusMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusMonitor")
            .field("side", &self.side)
            .field("last", &*lock(&self.last))
            .finish()
    }
}

impl StatusMonitor {
    pub fn new(side: TransportSide, observer: Arc<dyn TransportObserver>) -> Self {
        Self {
            side,
            observer,
            last: Mutex::new((ConnectionState::Disconnected, String::new())),
            pending: Mutex::new(Vec::new()),
            holds: AtomicUsize::new(0),
        }
    }

    /// Queue observer pushes until the returned hold is dropped.
    ///
    /// Take the hold before locking transport state so the lock guard is
    /// released first.
    pub fn hold(&self) -> PushHold<'_> {
        self.holds.fetch_add(1, Ordering::SeqCst);
        PushHold { monitor: self }
    }

    pub fn side(&self) -> TransportSide {
        self.side
    }

    /// Handle one broker event.
    pub fn on_event(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::Error(BrokerError::AllBrokersDown) => {
                self.set_connection_state(ConnectionState::Disconnected, MSG_BROKERS_DOWN_EVENT);
            }
            BrokerEvent::Error(BrokerError::Other { code, reason }) => {
                debug!(code, reason = %reason, "Broker error event");
                self.set_connection_state(
                    ConnectionState::Disconnected,
                    &format!("Event error received: {}", code),
                );
            }
            BrokerEvent::Stats(json) => self.parse_stats(&json),
            BrokerEvent::Log {
                level,
                facility,
                message,
            } => forward_log(level, &facility, &message),
            BrokerEvent::Throttle {
                broker,
                duration_ms,
            } => {
                debug!(broker = %broker, duration_ms, "Broker throttled client");
            }
        }
    }

    /// Derive state from a statistics JSON document.
    ///
    /// Any broker in state `UP` means connected. On the publish side the
    /// `msg_cnt` field is also pushed as the queue depth.
    pub fn parse_stats(&self, json: &str) {
        let root: Value = match serde_json::from_str(json) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "Unparsable broker statistics");
                self.set_connection_state(ConnectionState::Error, MSG_UNABLE_TO_PARSE);
                return;
            }
        };

        let states: Vec<&str> = match root.get("brokers") {
            Some(Value::Array(brokers)) => brokers.iter().map(broker_state).collect(),
            Some(Value::Object(brokers)) => brokers.values().map(broker_state).collect(),
            _ => Vec::new(),
        };

        if states.is_empty() {
            self.set_connection_state(ConnectionState::Error, MSG_NO_BROKERS);
        } else if states.iter().any(|s| *s == "UP") {
            self.set_connection_state(ConnectionState::Connected, MSG_NO_ERRORS);
        } else {
            self.set_connection_state(ConnectionState::Disconnected, MSG_BROKERS_DOWN);
        }

        if self.side == TransportSide::Publish {
            let count = root.get("msg_cnt").and_then(Value::as_i64).unwrap_or(0);
            self.set_queue_depth(count);
        }
    }

    /// Record and push a state. Always pushes, even if unchanged.
    pub fn set_connection_state(&self, state: ConnectionState, message: &str) {
        let message = truncate_message(message);
        match state {
            ConnectionState::Error | ConnectionState::Disconnected => {
                warn!(side = ?self.side, state = %state, status = %message, "Connection state");
            }
            _ => {
                debug!(side = ?self.side, state = %state, status = %message, "Connection state");
            }
        }
        *lock(&self.last) = (state, message.clone());
        self.push(ObservedEvent::State(state, message));
    }

    pub fn set_queue_depth(&self, count: i64) {
        self.push(ObservedEvent::QueueDepth(count));
    }

    pub fn report_offset(&self, offset: i64) {
        self.push(ObservedEvent::Offset(offset));
    }

    pub fn report_max_message_size(&self, bytes: usize) {
        self.push(ObservedEvent::MaxMessageSize(bytes));
    }

    fn push(&self, event: ObservedEvent) {
        lock(&self.pending).push(event);
        if self.holds.load(Ordering::SeqCst) == 0 {
            self.flush();
        }
    }

    /// Deliver queued pushes. The queue lock is released before any callback runs.
    fn flush(&self) {
        let events = std::mem::take(&mut *lock(&self.pending));
        for event in events {
            match event {
                ObservedEvent::State(state, message) => {
                    self.observer.on_connection_state_changed(state, &message)
                }
                ObservedEvent::QueueDepth(count) => self.observer.on_queue_depth_changed(count),
                ObservedEvent::Offset(offset) => self.observer.on_offset_changed(offset),
                ObservedEvent::MaxMessageSize(bytes) => {
                    self.observer.on_max_message_size_changed(bytes)
                }
            }
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.last).0
    }

    pub fn status_message(&self) -> String {
        lock(&self.last).1.clone()
    }
}

fn broker_state(broker: &Value) -> &str {
    broker.get("state").and_then(Value::as_str).unwrap_or("")
}

fn forward_log(level: Level, facility: &str, message: &str) {
    if level == Level::ERROR {
        error!(facility, "{}", message);
    } else if level == Level::WARN {
        warn!(facility, "{}", message);
    } else if level == Level::INFO {
        info!(facility, "{}", message);
    } else if level == Level::DEBUG {
        debug!(facility, "{}", message);
    } else {
        trace!(facility, "{}", message);
    }
}
