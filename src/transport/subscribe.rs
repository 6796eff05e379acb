//! Subscribe side of the broker link.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{
    validate_topic, ConsumerClient, ConsumerFactory, EventCallback, Offset, OffsetSetting,
    ReceivedMessage, MSG_ASSIGN_FAILED, MSG_CONNECTING, MSG_CONSUMER_FAILED, MSG_GROUP_ID_FAILED,
    MSG_RECONNECTING, MSG_TOPIC_FAILED,
};
use crate::config::{ConnectionConfig, MAX_MESSAGE_SIZE_CEILING};
use crate::status::{ConnectionState, StatusMonitor, TransportObserver, TransportSide};
use crate::utils::lock;

/// The only partition a subscriber reads.
const PARTITION: i32 = 0;

struct ConsumerConnection<C> {
    config: ConnectionConfig,
    consumer: Option<C>,
    offset: Offset,
    halted: bool,
    assigned: bool,
}

/// Reads encoded frames from partition 0 of one topic.
///
/// Runs no thread of its own; the caller drives it through
/// [`receive`](Self::receive). Consumption starts halted: the partition is
/// assigned but paused until [`start_consumption`](Self::start_consumption).
///
/// A broker outage is not visible in `receive`'s return value, which looks
/// the same as a timeout. Watch the observer for connection state.
pub struct SubscribeTransport<F: ConsumerFactory> {
    factory: F,
    monitor: Arc<StatusMonitor>,
    error_state: bool,
    inner: Mutex<ConsumerConnection<F::Consumer>>,
}

impl<F: ConsumerFactory> SubscribeTransport<F> {
    /// Create a transport and assign the topic if broker address and topic are set.
    ///
    /// A missing group id or an invalid config latches the permanent error state.
    pub fn new(factory: F, config: ConnectionConfig, observer: Arc<dyn TransportObserver>) -> Self {
        let monitor = Arc::new(StatusMonitor::new(TransportSide::Subscribe, observer));

        let failure = match config.validate() {
            Err(e) => Some(e.to_string()),
            Ok(()) if config.group_id.as_deref().map_or(true, str::is_empty) => {
                Some(MSG_GROUP_ID_FAILED.to_string())
            }
            Ok(()) => None,
        };
        if let Some(ref message) = failure {
            error!(reason = %message, "Invalid subscriber configuration");
            monitor.set_connection_state(ConnectionState::Error, message);
        }

        let transport = Self {
            factory,
            monitor,
            error_state: failure.is_some(),
            inner: Mutex::new(ConsumerConnection {
                config,
                consumer: None,
                offset: Offset::default(),
                halted: true,
                assigned: false,
            }),
        };
        if !transport.error_state {
            let _hold = transport.monitor.hold();
            let mut conn = lock(&transport.inner);
            transport.make_connection(&mut conn);
        }
        transport
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `None` immediately when no topic is assigned, and after the
    /// timeout when nothing arrives or the broker reports an error.
    pub fn receive(&self, timeout: Duration) -> Option<ReceivedMessage> {
        if self.error_state {
            return None;
        }
        let _hold = self.monitor.hold();
        let mut conn = lock(&self.inner);
        if !conn.assigned {
            return None;
        }
        let consumer = conn.consumer.as_mut()?;
        match consumer.poll(timeout)? {
            Ok(message) => {
                conn.offset = Offset::At(message.offset);
                self.monitor.report_offset(message.offset);
                Some(message)
            }
            Err(e) => {
                debug!(error = %e, "Consumer poll failed");
                None
            }
        }
    }

    /// Resume reading. Idempotent.
    pub fn start_consumption(&self) {
        let mut conn = lock(&self.inner);
        if !conn.halted {
            return;
        }
        conn.halted = false;
        if conn.assigned {
            if let Some(consumer) = conn.consumer.as_mut() {
                if let Err(e) = consumer.resume() {
                    warn!(error = %e, "Failed to resume consumption");
                }
            }
        }
        info!("Consumption started");
    }

    /// Pause reading without dropping the assignment. Idempotent.
    pub fn stop_consumption(&self) {
        let mut conn = lock(&self.inner);
        if conn.halted {
            return;
        }
        conn.halted = true;
        if conn.assigned {
            if let Some(consumer) = conn.consumer.as_mut() {
                if let Err(e) = consumer.pause() {
                    warn!(error = %e, "Failed to pause consumption");
                }
            }
        }
        info!("Consumption halted");
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// Set the read position and reassign.
    ///
    /// Accepts a non-negative offset or one of the sentinels `-2`
    /// (beginning), `-1` (end) and `-1000` (stored).
    pub fn set_offset(&self, value: i64) -> bool {
        match Offset::from_raw(value) {
            Some(offset) => self.apply_offset(offset),
            None => {
                debug!(value, "Rejected offset");
                false
            }
        }
    }

    pub fn apply_offset_setting(&self, setting: OffsetSetting) -> bool {
        match setting.to_offset() {
            Some(offset) => self.apply_offset(offset),
            None => false,
        }
    }

    fn apply_offset(&self, offset: Offset) -> bool {
        if self.error_state {
            return false;
        }
        let _hold = self.monitor.hold();
        let mut conn = lock(&self.inner);
        conn.offset = offset;
        self.monitor.report_offset(offset.as_raw());
        self.reassign_or_connect(&mut conn);
        true
    }

    /// Change the topic. The consumer is kept and reassigned.
    pub fn set_topic(&self, topic: &str) -> bool {
        if self.error_state || topic.is_empty() {
            return false;
        }
        let _hold = self.monitor.hold();
        let mut conn = lock(&self.inner);
        conn.config.topic = topic.to_string();
        self.reassign_or_connect(&mut conn);
        conn.consumer.is_none() || conn.assigned
    }

    pub fn set_broker_address(&self, address: &str) -> bool {
        self.reconfigure(!address.is_empty(), |config| {
            config.broker_address = address.to_string()
        })
    }

    pub fn set_group_id(&self, group_id: &str) -> bool {
        self.reconfigure(!group_id.is_empty(), |config| {
            config.group_id = Some(group_id.to_string())
        })
    }

    pub fn set_stats_interval_ms(&self, ms: u64) -> bool {
        self.reconfigure(ms > 0, |config| config.stats_interval_ms = ms)
    }

    pub fn set_max_message_size(&self, bytes: usize) -> bool {
        let valid = bytes > 0 && bytes <= MAX_MESSAGE_SIZE_CEILING;
        let changed = self.reconfigure(valid, |config| config.max_message_size = bytes);
        if changed {
            self.monitor.report_max_message_size(bytes);
        }
        changed
    }

    fn reconfigure(&self, valid: bool, apply: impl FnOnce(&mut ConnectionConfig)) -> bool {
        if self.error_state || !valid {
            return false;
        }
        let _hold = self.monitor.hold();
        let mut conn = lock(&self.inner);
        apply(&mut conn.config);
        self.teardown(&mut conn);
        self.make_connection(&mut conn);
        true
    }

    // ------------------------------------------------------------------------
    // Getters
    // ------------------------------------------------------------------------

    pub fn config(&self) -> ConnectionConfig {
        lock(&self.inner).config.clone()
    }

    pub fn broker_address(&self) -> String {
        lock(&self.inner).config.broker_address.clone()
    }

    pub fn topic(&self) -> String {
        lock(&self.inner).config.topic.clone()
    }

    pub fn group_id(&self) -> Option<String> {
        lock(&self.inner).config.group_id.clone()
    }

    pub fn max_message_size(&self) -> usize {
        lock(&self.inner).config.max_message_size
    }

    pub fn stats_interval_ms(&self) -> u64 {
        lock(&self.inner).config.stats_interval_ms
    }

    pub fn offset(&self) -> Offset {
        lock(&self.inner).offset
    }

    pub fn is_consuming(&self) -> bool {
        !lock(&self.inner).halted
    }

    pub fn is_assigned(&self) -> bool {
        lock(&self.inner).assigned
    }

    pub fn is_error_state(&self) -> bool {
        self.error_state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.monitor.connection_state()
    }

    pub fn status_message(&self) -> String {
        self.monitor.status_message()
    }

    // ------------------------------------------------------------------------
    // Connection management
    // ------------------------------------------------------------------------

    fn events(&self) -> EventCallback {
        let monitor = Arc::clone(&self.monitor);
        Arc::new(move |event| monitor.on_event(event))
    }

    fn reassign_or_connect(&self, conn: &mut ConsumerConnection<F::Consumer>) {
        if conn.consumer.is_some() {
            self.update_assignment(conn);
        } else {
            self.make_connection(conn);
        }
    }

    fn make_connection(&self, conn: &mut ConsumerConnection<F::Consumer>) {
        if conn.consumer.is_none() {
            if conn.config.broker_address.is_empty() {
                return;
            }
            match self.factory.create_consumer(&conn.config, self.events()) {
                Ok(consumer) => {
                    info!(
                        broker_address = %conn.config.broker_address,
                        group_id = ?conn.config.group_id,
                        "Created consumer"
                    );
                    conn.consumer = Some(consumer);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to create consumer");
                    self.monitor
                        .set_connection_state(ConnectionState::Error, MSG_CONSUMER_FAILED);
                    return;
                }
            }
        }
        self.update_assignment(conn);
    }

    /// Drop any assignment and assign partition 0 at the tracked offset.
    fn update_assignment(&self, conn: &mut ConsumerConnection<F::Consumer>) {
        let Some(consumer) = conn.consumer.as_mut() else {
            return;
        };
        if conn.assigned {
            if let Err(e) = consumer.unassign() {
                warn!(error = %e, "Failed to unassign partition");
            }
            conn.assigned = false;
        }
        if conn.config.topic.is_empty() {
            return;
        }
        if let Err(e) = validate_topic(&conn.config.topic) {
            warn!(error = %e, "Failed to create topic");
            self.monitor
                .set_connection_state(ConnectionState::Error, MSG_TOPIC_FAILED);
            return;
        }
        if let Err(e) = consumer.assign(&conn.config.topic, PARTITION, conn.offset) {
            warn!(error = %e, "Failed to assign partition");
            self.monitor
                .set_connection_state(ConnectionState::Error, MSG_ASSIGN_FAILED);
            return;
        }
        if conn.halted {
            if let Err(e) = consumer.pause() {
                warn!(error = %e, "Failed to pause new assignment");
            }
        }
        conn.assigned = true;
        info!(
            topic = %conn.config.topic,
            offset = conn.offset.as_raw(),
            halted = conn.halted,
            "Assigned partition"
        );
        self.monitor
            .set_connection_state(ConnectionState::Connecting, MSG_CONNECTING);
    }

    fn teardown(&self, conn: &mut ConsumerConnection<F::Consumer>) {
        let Some(mut consumer) = conn.consumer.take() else {
            return;
        };
        if conn.assigned {
            if let Err(e) = consumer.unassign() {
                warn!(error = %e, "Failed to unassign partition");
            }
            conn.assigned = false;
        }
        drop(consumer);
        self.monitor
            .set_connection_state(ConnectionState::Disconnected, MSG_RECONNECTING);
    }
}

impl<F: ConsumerFactory> Drop for SubscribeTransport<F> {
    fn drop(&mut self) {
        let mut conn = lock(&self.inner);
        if conn.assigned {
            if let Some(consumer) = conn.consumer.as_mut() {
                if let Err(e) = consumer.unassign() {
                    warn!(error = %e, "Failed to unassign partition on drop");
                }
            }
            conn.assigned = false;
        }
    }
}
