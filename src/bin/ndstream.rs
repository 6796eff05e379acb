//! ndstream: demo publisher and subscriber
//!
//! Publishes synthetic ramp frames, subscribes and logs received frames,
//! or does both in one process.
//!
//! ## Usage
//! ```text
//! ndstream [publish|subscribe|loopback] [config.yaml]
//! ```
//!
//! ## Configuration
//! - ndstream.yaml / NDSTREAM_CONFIG: YAML config file
//! - NDSTREAM__<SECTION>__<KEY>: per-field overrides
//! - NDSTREAM_LOG: tracing filter (default: info)
//!
//! The memory backend only makes sense in `loopback` mode; `publish` alone
//! fills an in-process log nobody reads.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use ndstream::array::{ArrayError, ArrayPayload, Attribute, AttributeValue, EpochTime};
use ndstream::config::{Backend, Config, ConnectionConfig, DemoConfig};
use ndstream::pipeline::{FramePublisher, FrameSubscriber};
use ndstream::status::LogObserver;
use ndstream::transport::{
    ConsumerFactory, MemoryBroker, ProducerFactory, PublishTransport, SubscribeTransport,
};
use ndstream::utils::bootstrap::init_tracing;

const DEMO_TOPIC: &str = "ndstream";
const DEMO_GROUP: &str = "ndstream-demo";
const MEMORY_ADDRESS: &str = "memory";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Publish,
    Subscribe,
    Loopback,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publish" => Ok(Mode::Publish),
            "subscribe" => Ok(Mode::Subscribe),
            "loopback" => Ok(Mode::Loopback),
            other => Err(format!(
                "unknown mode '{}', expected publish, subscribe or loopback",
                other
            )),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let mode = args
        .next()
        .map(|m| m.parse::<Mode>())
        .transpose()?
        .unwrap_or(Mode::Loopback);
    let config_path = args.next();

    let mut config = Config::load(config_path.as_deref())?;
    apply_demo_defaults(&mut config.publisher);
    apply_demo_defaults(&mut config.subscriber);
    if config.subscriber.group_id.is_none() {
        config.subscriber.group_id = Some(DEMO_GROUP.to_string());
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    info!(?mode, backend = ?config.demo.backend, "ndstream started");

    match config.demo.backend {
        Backend::Memory => {
            if mode != Mode::Loopback {
                warn!("Memory backend is in-process; use loopback mode to see frames");
            }
            config.publisher.broker_address = MEMORY_ADDRESS.to_string();
            config.subscriber.broker_address = MEMORY_ADDRESS.to_string();
            run(MemoryBroker::new(), mode, config, stop).await
        }
        Backend::Kafka => run_kafka(mode, config, stop).await,
    }
}

#[cfg(feature = "kafka")]
async fn run_kafka(mode: Mode, config: Config, stop: Arc<AtomicBool>) -> Result<(), BoxError> {
    run(ndstream::transport::KafkaBackend::new(), mode, config, stop).await
}

#[cfg(not(feature = "kafka"))]
async fn run_kafka(_mode: Mode, _config: Config, _stop: Arc<AtomicBool>) -> Result<(), BoxError> {
    Err("ndstream was built without the kafka feature".into())
}

fn apply_demo_defaults(config: &mut ConnectionConfig) {
    if config.topic.is_empty() {
        config.topic = DEMO_TOPIC.to_string();
    }
}

async fn run<F>(
    factory: F,
    mode: Mode,
    config: Config,
    stop: Arc<AtomicBool>,
) -> Result<(), BoxError>
where
    F: ProducerFactory + ConsumerFactory + Clone,
{
    let published = Arc::new(AtomicBool::new(false));

    // Subscribe first so a loopback subscriber assigned at the log end sees every frame.
    let subscriber = if mode == Mode::Publish {
        None
    } else {
        let transport = Arc::new(SubscribeTransport::new(
            factory.clone(),
            config.subscriber.clone(),
            Arc::new(LogObserver),
        ));
        transport.start_consumption();
        let demo = config.demo.clone();
        let stop = Arc::clone(&stop);
        let published = Arc::clone(&published);
        Some(tokio::task::spawn_blocking(move || {
            subscribe_frames(FrameSubscriber::new(transport), &demo, &stop, &published)
        }))
    };

    if mode != Mode::Subscribe {
        let transport = Arc::new(PublishTransport::new(
            factory,
            config.publisher.clone(),
            Arc::new(LogObserver),
        ));
        let demo = config.demo.clone();
        let publish_stop = Arc::clone(&stop);
        let result = tokio::task::spawn_blocking(move || {
            publish_frames(FramePublisher::new(transport), &demo, &publish_stop)
        })
        .await?;
        published.store(true, Ordering::SeqCst);
        result?;
    }

    if let Some(handle) = subscriber {
        handle.await?;
    }
    info!("ndstream finished");
    Ok(())
}

fn publish_frames<F: ProducerFactory>(
    mut publisher: FramePublisher<F>,
    demo: &DemoConfig,
    stop: &AtomicBool,
) -> Result<(), ArrayError> {
    let transport = Arc::clone(publisher.transport());
    transport.start();

    let interval = Duration::from_millis(demo.frame_interval_ms);
    let mut unique_id: i32 = 0;
    while !stop.load(Ordering::SeqCst)
        && (demo.frames == 0 || publisher.sent() + publisher.dropped() < demo.frames)
    {
        unique_id = unique_id.wrapping_add(1);
        publisher.publish(&ramp_frame(demo, unique_id)?);
        std::thread::sleep(interval);
    }

    // Let the poller deliver what is still queued.
    std::thread::sleep(interval.max(Duration::from_millis(100)));
    transport.stop();
    transport.poll();

    info!(
        sent = publisher.sent(),
        dropped = publisher.dropped(),
        queued = transport.queued_messages(),
        "Publisher finished"
    );
    Ok(())
}

fn subscribe_frames<F: ConsumerFactory>(
    mut subscriber: FrameSubscriber<F>,
    demo: &DemoConfig,
    stop: &AtomicBool,
    published: &AtomicBool,
) {
    let timeout = Duration::from_millis(demo.receive_timeout_ms);
    while !stop.load(Ordering::SeqCst)
        && (demo.frames == 0 || subscriber.received() < demo.frames)
    {
        match subscriber.next_frame(timeout) {
            Ok(Some(array)) => info!(
                unique_id = array.unique_id,
                dims = ?array.dims(),
                element_type = ?array.element_type(),
                attributes = array.attributes.len(),
                "Received frame"
            ),
            Ok(None) if published.load(Ordering::SeqCst) => break,
            // Malformed frames are logged and counted by the subscriber.
            Ok(None) | Err(_) => {}
        }
    }

    info!(
        received = subscriber.received(),
        malformed = subscriber.malformed(),
        offset = subscriber.transport().offset().as_raw(),
        "Subscriber finished"
    );
}

/// Frame whose bytes ramp with the frame number.
fn ramp_frame(demo: &DemoConfig, unique_id: i32) -> Result<ArrayPayload, ArrayError> {
    let mut array = ArrayPayload::zeroed(demo.element_type, vec![demo.width, demo.height])?
        .with_id(unique_id)
        .with_epoch(EpochTime::now())
        .with_attribute(Attribute::new(
            "FrameNumber",
            "Frame counter",
            "ndstream",
            AttributeValue::Int32(unique_id),
        ))
        .with_attribute(Attribute::new(
            "Pattern",
            "Synthetic data pattern",
            "ndstream",
            AttributeValue::String("ramp".to_string()),
        ));
    for (i, byte) in array.data_mut().iter_mut().enumerate() {
        *byte = (i as u64).wrapping_add(unique_id as u64) as u8;
    }
    Ok(array)
}
