//! Publish side of the broker link.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{
    validate_topic, EventCallback, FlushError, ProduceError, ProducerClient, ProducerFactory,
    MSG_CONNECTING, MSG_FLUSH_FAILED, MSG_FLUSH_TIMED_OUT, MSG_INIT_FAILED, MSG_MAX_SIZE_FAILED,
    MSG_PRODUCER_FAILED, MSG_RECONNECTING, MSG_STARTING_POLLER, MSG_TOPIC_FAILED,
};
use crate::config::{ConnectionConfig, MAX_MESSAGE_SIZE_CEILING};
use crate::status::{ConnectionState, StatusMonitor, TransportObserver, TransportSide};
use crate::utils::lock;

/// Sleep between two polls of the background poller.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Producer and topic handles plus the config they were built from.
///
/// Handle states: no producer, producer only, producer and topic (ready).
struct ProducerConnection<P> {
    config: ConnectionConfig,
    producer: Option<P>,
    topic: Option<String>,
    last_in_flight: usize,
}

impl<P> ProducerConnection<P> {
    fn is_ready(&self) -> bool {
        self.producer.is_some() && self.topic.is_some()
    }
}

struct PublishShared<F: ProducerFactory> {
    factory: F,
    monitor: Arc<StatusMonitor>,
    connection: Mutex<ProducerConnection<F::Producer>>,
    error_state: AtomicBool,
    /// Failed deliveries of producers already torn down.
    retired_failures: AtomicU64,
}

struct Poller {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Hands encoded frames to a broker producer.
///
/// `send` never blocks: when the producer queue is full the frame is
/// rejected so the caller can count it as dropped. Every configuration
/// setter rebuilds the affected handles under the connection lock.
///
/// Call [`start`](Self::start) to run the background poller that serves
/// delivery reports and broker statistics.
pub struct PublishTransport<F: ProducerFactory> {
    shared: Arc<PublishShared<F>>,
    poller: Mutex<Option<Poller>>,
}

impl<F: ProducerFactory> PublishTransport<F> {
    /// Create a transport and connect if broker address and topic are set.
    ///
    /// An invalid config latches the permanent error state.
    pub fn new(factory: F, config: ConnectionConfig, observer: Arc<dyn TransportObserver>) -> Self {
        let monitor = Arc::new(StatusMonitor::new(TransportSide::Publish, observer));
        let invalid = config.validate().err();

        let shared = Arc::new(PublishShared {
            factory,
            monitor,
            connection: Mutex::new(ProducerConnection {
                config,
                producer: None,
                topic: None,
                last_in_flight: 0,
            }),
            error_state: AtomicBool::new(false),
            retired_failures: AtomicU64::new(0),
        });

        if let Some(e) = invalid {
            error!(error = %e, "Invalid publisher configuration");
            shared.error_state.store(true, Ordering::SeqCst);
            shared
                .monitor
                .set_connection_state(ConnectionState::Error, &e.to_string());
        } else {
            let _hold = shared.monitor.hold();
            let mut conn = lock(&shared.connection);
            shared
                .monitor
                .report_max_message_size(conn.config.max_message_size);
            shared.connect(&mut conn);
        }

        Self {
            shared,
            poller: Mutex::new(None),
        }
    }

    /// Enqueue one encoded frame.
    ///
    /// Returns false for an empty buffer, in the error state, when not
    /// connected to a topic, or when the producer rejects the message.
    /// A buffer above the max message size first raises the limit (which
    /// rebuilds the producer); failure to do so latches the error state.
    pub fn send(&self, buffer: &[u8]) -> bool {
        if self.is_error_state() || buffer.is_empty() {
            return false;
        }

        let _hold = self.shared.monitor.hold();
        let mut conn = lock(&self.shared.connection);
        if buffer.len() > conn.config.max_message_size
            && !self.shared.apply_max_message_size(&mut conn, buffer.len())
        {
            self.shared.error_state.store(true, Ordering::SeqCst);
            self.shared
                .monitor
                .set_connection_state(ConnectionState::Error, MSG_MAX_SIZE_FAILED);
            return false;
        }

        let ProducerConnection {
            producer,
            topic,
            last_in_flight,
            ..
        } = &mut *conn;
        let (Some(producer), Some(topic)) = (producer.as_mut(), topic.as_deref()) else {
            return false;
        };

        match producer.produce(topic, buffer) {
            Ok(()) => true,
            Err(ProduceError::QueueFull) => {
                let in_flight = producer.in_flight_count();
                debug!(in_flight, "Producer queue full, rejecting message");
                *last_in_flight = in_flight;
                self.shared.monitor.set_queue_depth(in_flight as i64);
                false
            }
            Err(ProduceError::Broker(code)) => {
                self.shared.monitor.set_connection_state(
                    ConnectionState::Error,
                    &format!("Producer failed with error code: {}", code),
                );
                false
            }
            Err(e @ ProduceError::MessageTooLarge { .. }) => {
                warn!(error = %e, "Producer rejected message");
                self.shared
                    .monitor
                    .set_connection_state(ConnectionState::Error, &e.to_string());
                false
            }
        }
    }

    /// Start the background poller.
    ///
    /// Refuses to start in the error state. Starting twice is a no-op.
    pub fn start(&self) -> bool {
        if self.is_error_state() {
            self.shared
                .monitor
                .set_connection_state(ConnectionState::Error, MSG_INIT_FAILED);
            return false;
        }

        let _hold = self.shared.monitor.hold();
        let mut poller = lock(&self.poller);
        if poller.is_some() {
            return true;
        }
        self.shared
            .monitor
            .set_connection_state(ConnectionState::Disconnected, MSG_STARTING_POLLER);

        let (stop, stopped) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("ndstream-publish-poll".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(POLL_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => shared.poll_once(),
                    _ => break,
                }
            });

        match spawned {
            Ok(handle) => {
                info!("Started publish poller");
                *poller = Some(Poller { stop, handle });
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to spawn publish poller");
                self.shared
                    .monitor
                    .set_connection_state(ConnectionState::Error, MSG_INIT_FAILED);
                false
            }
        }
    }

    /// Signal the poller to exit and wait for it.
    pub fn stop(&self) {
        let poller = lock(&self.poller).take();
        if let Some(poller) = poller {
            // A send error means the thread already exited.
            let _ = poller.stop.send(());
            if poller.handle.join().is_err() {
                error!("Publish poller panicked");
            }
            debug!("Stopped publish poller");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.poller).is_some()
    }

    /// Serve producer events once on the calling thread.
    pub fn poll(&self) {
        self.shared.poll_once();
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    pub fn set_max_message_size(&self, bytes: usize) -> bool {
        if self.is_error_state() || bytes == 0 {
            return false;
        }
        let _hold = self.shared.monitor.hold();
        let mut conn = lock(&self.shared.connection);
        self.shared.apply_max_message_size(&mut conn, bytes)
    }

    pub fn set_queue_length(&self, messages: usize) -> bool {
        self.reconfigure(messages > 0, |config| config.queue_depth = messages)
    }

    pub fn set_broker_address(&self, address: &str) -> bool {
        self.reconfigure(!address.is_empty(), |config| {
            config.broker_address = address.to_string()
        })
    }

    pub fn set_stats_interval_ms(&self, ms: u64) -> bool {
        self.reconfigure(ms > 0, |config| config.stats_interval_ms = ms)
    }

    pub fn set_buffer_budget_kb(&self, kb: usize) -> bool {
        self.reconfigure(kb > 0, |config| config.buffer_budget_kb = kb)
    }

    /// Change the topic. Only the topic handle is rebuilt.
    pub fn set_topic(&self, topic: &str) -> bool {
        if self.is_error_state() || topic.is_empty() {
            return false;
        }
        let _hold = self.shared.monitor.hold();
        let mut conn = lock(&self.shared.connection);
        conn.config.topic = topic.to_string();
        self.shared.teardown(&mut conn, false);
        self.shared.connect(&mut conn);
        conn.producer.is_none() || conn.topic.is_some()
    }

    /// Flush queued messages for up to `timeout_ms` before each teardown.
    pub fn set_flush_on_reconnect(&self, enabled: bool, timeout_ms: u64) {
        let mut conn = lock(&self.shared.connection);
        conn.config.flush_on_reconnect = enabled;
        conn.config.flush_timeout_ms = timeout_ms;
    }

    /// Apply a config change and rebuild both handles.
    fn reconfigure(&self, valid: bool, apply: impl FnOnce(&mut ConnectionConfig)) -> bool {
        if self.is_error_state() || !valid {
            return false;
        }
        let _hold = self.shared.monitor.hold();
        let mut conn = lock(&self.shared.connection);
        apply(&mut conn.config);
        self.shared.rebuild(&mut conn);
        true
    }

    // ------------------------------------------------------------------------
    // Getters
    // ------------------------------------------------------------------------

    pub fn config(&self) -> ConnectionConfig {
        lock(&self.shared.connection).config.clone()
    }

    pub fn broker_address(&self) -> String {
        lock(&self.shared.connection).config.broker_address.clone()
    }

    pub fn topic(&self) -> String {
        lock(&self.shared.connection).config.topic.clone()
    }

    pub fn max_message_size(&self) -> usize {
        lock(&self.shared.connection).config.max_message_size
    }

    pub fn queue_length(&self) -> usize {
        lock(&self.shared.connection).config.queue_depth
    }

    pub fn stats_interval_ms(&self) -> u64 {
        lock(&self.shared.connection).config.stats_interval_ms
    }

    /// Messages enqueued but not yet delivered.
    pub fn queued_messages(&self) -> usize {
        lock(&self.shared.connection)
            .producer
            .as_ref()
            .map_or(0, |p| p.in_flight_count())
    }

    /// Messages the broker failed to deliver, across producer rebuilds.
    pub fn failed_deliveries(&self) -> u64 {
        let current = lock(&self.shared.connection)
            .producer
            .as_ref()
            .map_or(0, |p| p.failed_deliveries());
        self.shared.retired_failures.load(Ordering::Relaxed) + current
    }

    pub fn is_ready(&self) -> bool {
        lock(&self.shared.connection).is_ready()
    }

    pub fn is_error_state(&self) -> bool {
        self.shared.error_state.load(Ordering::SeqCst)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.monitor.connection_state()
    }

    pub fn status_message(&self) -> String {
        self.shared.monitor.status_message()
    }
}

impl<F: ProducerFactory> Drop for PublishTransport<F> {
    fn drop(&mut self) {
        self.stop();
        let _hold = self.shared.monitor.hold();
        let mut conn = lock(&self.shared.connection);
        self.shared.teardown(&mut conn, true);
    }
}

impl<F: ProducerFactory> PublishShared<F> {
    fn events(&self) -> EventCallback {
        let monitor = Arc::clone(&self.monitor);
        Arc::new(move |event| monitor.on_event(event))
    }

    /// Move the handles towards ready as far as the config allows.
    fn connect(&self, conn: &mut ProducerConnection<F::Producer>) {
        if conn.producer.is_none() {
            if conn.config.broker_address.is_empty() {
                return;
            }
            match self.factory.create_producer(&conn.config, self.events()) {
                Ok(producer) => {
                    info!(
                        broker_address = %conn.config.broker_address,
                        "Created producer"
                    );
                    conn.producer = Some(producer);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to create producer");
                    self.monitor
                        .set_connection_state(ConnectionState::Error, MSG_PRODUCER_FAILED);
                    return;
                }
            }
        }

        if conn.topic.is_none() && !conn.config.topic.is_empty() {
            match validate_topic(&conn.config.topic) {
                Ok(()) => {
                    info!(topic = %conn.config.topic, "Connecting to topic");
                    conn.topic = Some(conn.config.topic.clone());
                    self.monitor
                        .set_connection_state(ConnectionState::Connecting, MSG_CONNECTING);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to create topic");
                    self.monitor
                        .set_connection_state(ConnectionState::Error, MSG_TOPIC_FAILED);
                }
            }
        }
    }

    /// Release the topic handle, and the producer too if `drop_producer`.
    ///
    /// Pushes one DISCONNECTED state if anything was released.
    fn teardown(&self, conn: &mut ProducerConnection<F::Producer>, drop_producer: bool) {
        let releases_producer = drop_producer && conn.producer.is_some();
        if conn.topic.is_none() && !releases_producer {
            return;
        }

        let mut message = MSG_RECONNECTING;
        if conn.topic.is_some() && conn.config.flush_on_reconnect {
            if let Some(producer) = conn.producer.as_mut() {
                match producer.flush(conn.config.flush_timeout()) {
                    Ok(()) => {}
                    Err(FlushError::TimedOut) => message = MSG_FLUSH_TIMED_OUT,
                    Err(FlushError::Broker(code)) => {
                        warn!(code, "Flush failed");
                        message = MSG_FLUSH_FAILED;
                    }
                }
            }
        }

        conn.topic = None;
        if drop_producer {
            if let Some(producer) = conn.producer.take() {
                self.retired_failures
                    .fetch_add(producer.failed_deliveries(), Ordering::Relaxed);
            }
            conn.last_in_flight = 0;
        }
        self.monitor
            .set_connection_state(ConnectionState::Disconnected, message);
    }

    fn rebuild(&self, conn: &mut ProducerConnection<F::Producer>) {
        self.teardown(conn, true);
        self.connect(conn);
    }

    fn apply_max_message_size(
        &self,
        conn: &mut ProducerConnection<F::Producer>,
        bytes: usize,
    ) -> bool {
        if bytes == 0 || bytes > MAX_MESSAGE_SIZE_CEILING {
            warn!(bytes, "Max message size out of range");
            return false;
        }
        conn.config.max_message_size = bytes;
        self.monitor.report_max_message_size(bytes);
        self.rebuild(conn);
        true
    }

    fn poll_once(&self) {
        let _hold = self.monitor.hold();
        let mut conn = lock(&self.connection);
        let Some(producer) = conn.producer.as_mut() else {
            return;
        };
        producer.poll(Duration::ZERO);
        let in_flight = producer.in_flight_count();
        if in_flight != conn.last_in_flight {
            conn.last_in_flight = in_flight;
            self.monitor.set_queue_depth(in_flight as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{ObservedEvent, RecordingObserver};
    use crate::transport::MemoryBroker;

    fn transport(
        config: ConnectionConfig,
    ) -> (PublishTransport<MemoryBroker>, MemoryBroker, Arc<RecordingObserver>) {
        let broker = MemoryBroker::new();
        let observer = Arc::new(RecordingObserver::new());
        let transport = PublishTransport::new(broker.clone(), config, observer.clone());
        (transport, broker, observer)
    }

    #[test]
    fn test_connects_when_configured() {
        let (transport, broker, observer) =
            transport(ConnectionConfig::publisher("memory:0", "frames"));

        assert!(transport.is_ready());
        assert_eq!(broker.producers_created(), 1);
        assert_eq!(
            observer.last_state(),
            Some((ConnectionState::Connecting, MSG_CONNECTING.to_string()))
        );
    }

    #[test]
    fn test_no_producer_without_broker_address() {
        let (transport, broker, _observer) = transport(ConnectionConfig::default());
        assert!(!transport.is_ready());
        assert_eq!(broker.producers_created(), 0);
        assert!(!transport.send(b"frame"));

        assert!(transport.set_broker_address("memory:0"));
        assert_eq!(broker.producers_created(), 1);
        assert!(!transport.is_ready());

        assert!(transport.set_topic("frames"));
        assert!(transport.is_ready());
        assert!(transport.send(b"frame"));
    }

    #[test]
    fn test_send_rejects_empty_buffer() {
        let (transport, _broker, _observer) =
            transport(ConnectionConfig::publisher("memory:0", "frames"));
        assert!(!transport.send(&[]));
    }

    #[test]
    fn test_send_delivers_on_poll() {
        let (transport, broker, _observer) =
            transport(ConnectionConfig::publisher("memory:0", "frames"));

        assert!(transport.send(b"one"));
        assert!(transport.send(b"two"));
        assert_eq!(transport.queued_messages(), 2);

        transport.poll();

        assert_eq!(transport.queued_messages(), 0);
        assert_eq!(broker.messages("frames"), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_oversized_buffer_raises_limit() {
        let (transport, broker, observer) = transport(
            ConnectionConfig::publisher("memory:0", "frames").with_max_message_size(4),
        );

        assert!(transport.send(b"longer than four"));

        assert_eq!(transport.max_message_size(), 16);
        assert_eq!(broker.producers_created(), 2);
        assert!(observer
            .events()
            .contains(&ObservedEvent::MaxMessageSize(16)));
    }

    #[test]
    fn test_failed_deliveries_are_counted() {
        let (transport, broker, _observer) =
            transport(ConnectionConfig::publisher("memory:0", "frames"));
        broker.set_reject_deliveries(true);

        assert!(transport.send(b"one"));
        assert!(transport.send(b"two"));
        transport.poll();

        assert_eq!(transport.failed_deliveries(), 2);
        assert_eq!(transport.queued_messages(), 0);
        assert_eq!(broker.message_count("frames"), 0);

        broker.set_reject_deliveries(false);
        assert!(transport.send(b"three"));
        transport.poll();
        assert_eq!(transport.failed_deliveries(), 2);
        assert_eq!(broker.message_count("frames"), 1);
    }

    #[test]
    fn test_failed_deliveries_survive_rebuild() {
        let (transport, broker, _observer) =
            transport(ConnectionConfig::publisher("memory:0", "frames"));
        broker.set_reject_deliveries(true);
        assert!(transport.send(b"lost"));
        transport.poll();

        assert!(transport.set_queue_length(20));

        assert_eq!(broker.producers_created(), 2);
        assert_eq!(transport.failed_deliveries(), 1);
    }

    #[test]
    fn test_setters_validate_input() {
        let (transport, broker, _observer) =
            transport(ConnectionConfig::publisher("memory:0", "frames"));

        assert!(!transport.set_max_message_size(0));
        assert!(!transport.set_max_message_size(MAX_MESSAGE_SIZE_CEILING + 1));
        assert!(!transport.set_queue_length(0));
        assert!(!transport.set_broker_address(""));
        assert!(!transport.set_topic(""));
        assert!(!transport.set_stats_interval_ms(0));
        assert!(!transport.set_buffer_budget_kb(0));

        assert_eq!(broker.producers_created(), 1);
        assert_eq!(transport.config(), ConnectionConfig::publisher("memory:0", "frames"));
    }

    #[test]
    fn test_invalid_config_latches_error() {
        let (transport, broker, observer) = transport(
            ConnectionConfig::publisher("memory:0", "frames").with_queue_depth(0),
        );

        assert!(transport.is_error_state());
        assert_eq!(broker.producers_created(), 0);
        assert_eq!(observer.last_state().map(|s| s.0), Some(ConnectionState::Error));
        assert!(!transport.send(b"frame"));
        assert!(!transport.set_queue_length(5));
        assert!(!transport.start());
        assert_eq!(
            observer.last_state(),
            Some((ConnectionState::Error, MSG_INIT_FAILED.to_string()))
        );
    }

    #[test]
    fn test_set_topic_keeps_producer() {
        let (transport, broker, observer) =
            transport(ConnectionConfig::publisher("memory:0", "frames"));
        observer.clear();

        assert!(transport.set_topic("other"));

        assert_eq!(broker.producers_created(), 1);
        assert_eq!(transport.topic(), "other");
        assert_eq!(
            observer.states(),
            vec![
                (ConnectionState::Disconnected, MSG_RECONNECTING.to_string()),
                (ConnectionState::Connecting, MSG_CONNECTING.to_string()),
            ]
        );
    }

    #[test]
    fn test_illegal_topic_reports_error() {
        let (transport, _broker, observer) =
            transport(ConnectionConfig::publisher("memory:0", "frames"));

        assert!(!transport.set_topic("bad topic"));
        assert!(!transport.is_ready());
        assert_eq!(
            observer.last_state(),
            Some((ConnectionState::Error, MSG_TOPIC_FAILED.to_string()))
        );
    }

    #[test]
    fn test_flush_timeout_is_reported_on_teardown() {
        let (transport, broker, observer) =
            transport(ConnectionConfig::publisher("memory:0", "frames"));
        broker.set_available(false);
        assert!(transport.send(b"stuck"));
        observer.clear();

        assert!(transport.set_queue_length(20));

        assert_eq!(
            observer.states().first(),
            Some(&(
                ConnectionState::Disconnected,
                MSG_FLUSH_TIMED_OUT.to_string()
            ))
        );
    }

    #[test]
    fn test_flush_can_be_disabled() {
        let (transport, broker, observer) =
            transport(ConnectionConfig::publisher("memory:0", "frames"));
        transport.set_flush_on_reconnect(false, 0);
        broker.set_available(false);
        assert!(transport.send(b"stuck"));
        observer.clear();

        assert!(transport.set_stats_interval_ms(1000));

        assert_eq!(
            observer.states().first(),
            Some(&(ConnectionState::Disconnected, MSG_RECONNECTING.to_string()))
        );
    }

    #[test]
    fn test_start_and_stop_poller() {
        let (transport, broker, observer) =
            transport(ConnectionConfig::publisher("memory:0", "frames"));

        assert!(transport.start());
        assert!(transport.start());
        assert!(transport.is_running());
        assert!(observer.states().contains(&(
            ConnectionState::Disconnected,
            MSG_STARTING_POLLER.to_string()
        )));

        assert!(transport.send(b"frame"));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while broker.message_count("frames") == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(broker.message_count("frames"), 1);

        transport.stop();
        assert!(!transport.is_running());
    }
}
