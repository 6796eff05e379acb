//! Frame-level publish and subscribe.
//!
//! `FramePublisher` encodes arrays and hands them to a [`PublishTransport`],
//! counting frames the transport refused. `FrameSubscriber` receives buffers
//! from a [`SubscribeTransport`] and decodes them, counting malformed ones.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::array::ArrayPayload;
use crate::codec::{self, ArrayCodec, CodecError};
use crate::transport::{
    ConsumerFactory, ProducerFactory, PublishTransport, SubscribeTransport,
};

/// Encodes arrays and sends them through a publish transport.
///
/// Owns its codec, so one publisher serves one thread.
pub struct FramePublisher<F: ProducerFactory> {
    codec: ArrayCodec,
    transport: Arc<PublishTransport<F>>,
    sent: u64,
    dropped: u64,
}

impl<F: ProducerFactory> FramePublisher<F> {
    pub fn new(transport: Arc<PublishTransport<F>>) -> Self {
        Self {
            codec: ArrayCodec::new(),
            transport,
            sent: 0,
            dropped: 0,
        }
    }

    /// Encode and send one array.
    ///
    /// Returns false and counts the array as dropped if it cannot be encoded
    /// or the transport refuses it.
    pub fn publish(&mut self, array: &ArrayPayload) -> bool {
        let accepted = match self.codec.encode(array) {
            Ok(bytes) => self.transport.send(bytes),
            Err(e) => {
                warn!(unique_id = array.unique_id, error = %e, "Failed to encode array");
                false
            }
        };

        if accepted {
            self.sent += 1;
        } else {
            self.dropped += 1;
            debug!(
                unique_id = array.unique_id,
                dropped = self.dropped,
                "Dropped array"
            );
        }
        accepted
    }

    pub fn transport(&self) -> &Arc<PublishTransport<F>> {
        &self.transport
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Receives buffers from a subscribe transport and decodes them.
pub struct FrameSubscriber<F: ConsumerFactory> {
    transport: Arc<SubscribeTransport<F>>,
    received: u64,
    malformed: u64,
}

impl<F: ConsumerFactory> FrameSubscriber<F> {
    pub fn new(transport: Arc<SubscribeTransport<F>>) -> Self {
        Self {
            transport,
            received: 0,
            malformed: 0,
        }
    }

    /// Wait up to `timeout` for the next frame.
    ///
    /// `Ok(None)` on timeout or broker outage. A buffer that fails
    /// verification is returned as an error and counted as malformed.
    pub fn next_frame(&mut self, timeout: Duration) -> Result<Option<ArrayPayload>, CodecError> {
        let Some(message) = self.transport.receive(timeout) else {
            return Ok(None);
        };

        match codec::decode(&message.payload) {
            Ok(array) => {
                self.received += 1;
                Ok(Some(array))
            }
            Err(e) => {
                self.malformed += 1;
                warn!(
                    offset = message.offset,
                    bytes = message.payload.len(),
                    error = %e,
                    "Discarding malformed frame"
                );
                Err(e)
            }
        }
    }

    pub fn transport(&self) -> &Arc<SubscribeTransport<F>> {
        &self.transport
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Attribute, AttributeValue, EpochTime};
    use crate::config::ConnectionConfig;
    use crate::status::RecordingObserver;
    use crate::transport::MemoryBroker;

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn frame(id: i32) -> ArrayPayload {
        ArrayPayload::from_elements(vec![2, 3], &[1u16, 2, 3, 4, 5, 6])
            .unwrap()
            .with_id(id)
            .with_epoch(EpochTime::new(1_000, 500))
            .with_attribute(Attribute::new(
                "exposure",
                "Exposure time",
                "cam1",
                AttributeValue::Float64(0.25),
            ))
    }

    fn pair(broker: &MemoryBroker) -> (FramePublisher<MemoryBroker>, FrameSubscriber<MemoryBroker>) {
        let subscriber = Arc::new(SubscribeTransport::new(
            broker.clone(),
            ConnectionConfig::subscriber("memory:0", "frames", "viewer"),
            Arc::new(RecordingObserver::new()),
        ));
        subscriber.start_consumption();
        let publisher = Arc::new(PublishTransport::new(
            broker.clone(),
            ConnectionConfig::publisher("memory:0", "frames"),
            Arc::new(RecordingObserver::new()),
        ));
        (FramePublisher::new(publisher), FrameSubscriber::new(subscriber))
    }

    #[test]
    fn test_frames_flow_end_to_end() {
        let broker = MemoryBroker::new();
        let (mut publisher, mut subscriber) = pair(&broker);

        assert!(publisher.publish(&frame(1)));
        assert!(publisher.publish(&frame(2)));
        publisher.transport().poll();

        assert_eq!(subscriber.next_frame(TIMEOUT).unwrap(), Some(frame(1)));
        assert_eq!(subscriber.next_frame(TIMEOUT).unwrap(), Some(frame(2)));
        assert_eq!(subscriber.next_frame(TIMEOUT).unwrap(), None);
        assert_eq!((publisher.sent(), publisher.dropped()), (2, 0));
        assert_eq!(subscriber.received(), 2);
    }

    #[test]
    fn test_refused_frames_are_counted_as_dropped() {
        let broker = MemoryBroker::new();
        let transport = Arc::new(PublishTransport::new(
            broker.clone(),
            ConnectionConfig::publisher("memory:0", "frames").with_queue_depth(1),
            Arc::new(RecordingObserver::new()),
        ));
        let mut publisher = FramePublisher::new(transport);

        assert!(publisher.publish(&frame(1)));
        assert!(!publisher.publish(&frame(2)));
        assert!(!publisher.publish(&frame(3)));
        assert_eq!((publisher.sent(), publisher.dropped()), (1, 2));
    }

    #[test]
    fn test_unencodable_frame_is_dropped() {
        let broker = MemoryBroker::new();
        let (mut publisher, _subscriber) = pair(&broker);
        let mut array = frame(1);
        array.attributes.push(array.attributes[0].clone());

        assert!(!publisher.publish(&array));
        assert_eq!(publisher.dropped(), 1);
        assert_eq!(publisher.transport().queued_messages(), 0);
    }

    #[test]
    fn test_malformed_frame_is_reported_not_returned() {
        let broker = MemoryBroker::new();
        let (mut publisher, mut subscriber) = pair(&broker);

        broker.append("frames", vec![0xde, 0xad, 0xbe, 0xef]);
        publisher.publish(&frame(7));
        publisher.transport().poll();

        assert!(matches!(
            subscriber.next_frame(TIMEOUT),
            Err(CodecError::MalformedBuffer(_))
        ));
        assert_eq!(subscriber.next_frame(TIMEOUT).unwrap(), Some(frame(7)));
        assert_eq!((subscriber.received(), subscriber.malformed()), (1, 1));
    }
}
