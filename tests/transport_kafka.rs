//! Kafka transport integration tests using testcontainers.
//!
//! Run with: cargo test --test transport_kafka --features kafka -- --nocapture
//!
//! Uses Redpanda in dev-container mode, which auto-creates topics.

#![cfg(feature = "kafka")]

use std::sync::Arc;
use std::time::{Duration, Instant};

use ndstream::array::{ArrayPayload, Attribute, AttributeValue, EpochTime};
use ndstream::config::ConnectionConfig;
use ndstream::pipeline::{FramePublisher, FrameSubscriber};
use ndstream::status::{ConnectionState, RecordingObserver};
use ndstream::transport::{KafkaBackend, PublishTransport, SubscribeTransport};
use testcontainers::{
    core::{ContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

/// Generates a unique port in the ephemeral range for testing.
fn generate_test_port() -> u16 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos()
        .hash(&mut hasher);

    29000 + (hasher.finish() % 1000) as u16
}

/// Start Redpanda with the advertised listener on a fixed host port.
///
/// Clients take broker addresses from metadata, so the advertised address
/// must match the port mapped on the host.
async fn start_kafka() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let host_port = generate_test_port();
    let container_port = 9092u16;
    let advertised_addr = format!("localhost:{}", host_port);

    // with_wait_for must be called before with_mapped_port due to type constraints
    let image = GenericImage::new("redpandadata/redpanda", "v24.1.1")
        .with_wait_for(WaitFor::message_on_stderr("Successfully started Redpanda"));

    let container = image
        .with_mapped_port(host_port, ContainerPort::Tcp(container_port))
        .with_cmd([
            "redpanda",
            "start",
            "--mode",
            "dev-container",
            "--smp",
            "1",
            "--memory",
            "512M",
            "--overprovisioned",
            "--kafka-addr",
            "0.0.0.0:9092",
            "--advertise-kafka-addr",
            &advertised_addr,
        ])
        .with_startup_timeout(Duration::from_secs(120))
        .start()
        .await
        .expect("Failed to start Redpanda container");

    tokio::time::sleep(Duration::from_secs(3)).await;

    let bootstrap_servers = format!("localhost:{}", host_port);
    println!("Kafka available at: {}", bootstrap_servers);

    (container, bootstrap_servers)
}

fn make_frame(unique_id: i32) -> ArrayPayload {
    let values: Vec<u16> = (0..64).map(|v| v * unique_id as u16).collect();
    ArrayPayload::from_elements(vec![8, 8], &values)
        .unwrap()
        .with_id(unique_id)
        .with_epoch(EpochTime::new(1_000_000, unique_id))
        .with_attribute(Attribute::new(
            "Temperature",
            "Sensor temperature",
            "cam1",
            AttributeValue::Float64(21.5),
        ))
}

/// Publish `count` frames and wait until the queue drains and statistics report the broker up.
fn publish_frames(bootstrap: &str, topic: &str, count: i32) -> Arc<RecordingObserver> {
    let observer = Arc::new(RecordingObserver::new());
    let transport = Arc::new(PublishTransport::new(
        KafkaBackend::new(),
        ConnectionConfig::publisher(bootstrap, topic).with_stats_interval_ms(100),
        observer.clone(),
    ));
    assert!(transport.start());

    let mut publisher = FramePublisher::new(Arc::clone(&transport));
    for unique_id in 1..=count {
        assert!(publisher.publish(&make_frame(unique_id)));
    }

    let deadline = Instant::now() + Duration::from_secs(30);
    while (transport.queued_messages() > 0
        || transport.connection_state() != ConnectionState::Connected)
        && Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(transport.queued_messages(), 0, "frames not delivered");
    transport.stop();
    observer
}

/// Read frames until `count` arrive or the deadline passes.
fn receive_frames(
    transport: Arc<SubscribeTransport<KafkaBackend>>,
    count: usize,
) -> Vec<ArrayPayload> {
    let mut subscriber = FrameSubscriber::new(transport);
    let mut frames = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(30);
    while frames.len() < count && Instant::now() < deadline {
        if let Some(frame) = subscriber
            .next_frame(Duration::from_millis(500))
            .expect("malformed frame")
        {
            frames.push(frame);
        }
    }
    frames
}

#[tokio::test]
async fn test_frames_roundtrip_through_kafka() {
    let (_container, bootstrap) = start_kafka().await;

    let frames = tokio::task::spawn_blocking(move || {
        let topic = "detector-frames";
        let observer = publish_frames(&bootstrap, topic, 5);
        assert!(observer
            .states()
            .iter()
            .any(|(state, _)| *state == ConnectionState::Connected));

        let subscriber = Arc::new(SubscribeTransport::new(
            KafkaBackend::new(),
            ConnectionConfig::subscriber(&bootstrap, topic, "roundtrip"),
            Arc::new(RecordingObserver::new()),
        ));
        assert!(subscriber.set_offset(-2));
        subscriber.start_consumption();
        receive_frames(subscriber, 5)
    })
    .await
    .unwrap();

    let expected: Vec<_> = (1..=5).map(make_frame).collect();
    assert_eq!(frames, expected);
}

#[tokio::test]
async fn test_subscriber_starts_at_explicit_offset() {
    let (_container, bootstrap) = start_kafka().await;

    let frames = tokio::task::spawn_blocking(move || {
        let topic = "detector-offsets";
        publish_frames(&bootstrap, topic, 4);

        let subscriber = Arc::new(SubscribeTransport::new(
            KafkaBackend::new(),
            ConnectionConfig::subscriber(&bootstrap, topic, "offsets"),
            Arc::new(RecordingObserver::new()),
        ));
        assert!(subscriber.set_offset(2));
        subscriber.start_consumption();
        receive_frames(subscriber, 2)
    })
    .await
    .unwrap();

    let ids: Vec<i32> = frames.iter().map(|f| f.unique_id).collect();
    assert_eq!(ids, vec![3, 4]);
}

#[tokio::test]
async fn test_halted_subscriber_receives_nothing() {
    let (_container, bootstrap) = start_kafka().await;

    let received = tokio::task::spawn_blocking(move || {
        let topic = "detector-halted";
        publish_frames(&bootstrap, topic, 2);

        let subscriber = SubscribeTransport::new(
            KafkaBackend::new(),
            ConnectionConfig::subscriber(&bootstrap, topic, "halted"),
            Arc::new(RecordingObserver::new()),
        );
        assert!(subscriber.set_offset(-2));
        subscriber.receive(Duration::from_secs(2))
    })
    .await
    .unwrap();

    assert!(received.is_none());
}
