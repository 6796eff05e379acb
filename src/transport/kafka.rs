//! Kafka backend on librdkafka.
//!
//! Producer and consumer both run on the caller's thread (`BaseProducer`,
//! `BaseConsumer`). Client errors, statistics and log lines are forwarded to
//! the owning transport as [`BrokerEvent`]s through [`TransportContext`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rdkafka::client::ClientContext;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use rdkafka::{ClientConfig, Offset as KafkaOffset, TopicPartitionList};
use tracing::{debug, warn, Level};

use super::{
    ConsumeError, ConsumerClient, ConsumerFactory, EventCallback, FlushError, Offset,
    ProduceError, ProducerClient, ProducerFactory, ReceivedMessage, Result, TransportError,
};
use crate::config::ConnectionConfig;
use crate::status::{BrokerError, BrokerEvent};

/// Error code reported when librdkafka gives none.
const UNKNOWN_ERROR_CODE: i32 = -1;

/// Client context forwarding librdkafka callbacks to a transport.
pub struct TransportContext {
    events: EventCallback,
    failed_deliveries: AtomicU64,
}

impl TransportContext {
    fn new(events: EventCallback) -> Self {
        Self {
            events,
            failed_deliveries: AtomicU64::new(0),
        }
    }

    /// Delivery reports that came back with an error.
    pub fn failed_deliveries(&self) -> u64 {
        self.failed_deliveries.load(Ordering::Relaxed)
    }
}

impl ClientContext for TransportContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        (self.events)(BrokerEvent::Log {
            level: log_level(level),
            facility: fac.to_string(),
            message: log_message.to_string(),
        });
    }

    fn stats_raw(&self, statistics: &[u8]) {
        (self.events)(BrokerEvent::Stats(
            String::from_utf8_lossy(statistics).into_owned(),
        ));
    }

    fn error(&self, error: KafkaError, reason: &str) {
        let event = match error.rdkafka_error_code() {
            Some(RDKafkaErrorCode::AllBrokersDown) => BrokerError::AllBrokersDown,
            code => BrokerError::Other {
                code: code.map_or(UNKNOWN_ERROR_CODE, |c| c as i32),
                reason: reason.to_string(),
            },
        };
        (self.events)(BrokerEvent::Error(event));
    }
}

impl ProducerContext for TransportContext {
    type DeliveryOpaque = ();

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, _delivery_opaque: Self::DeliveryOpaque) {
        if let Err((error, message)) = delivery_result {
            let failed = self.failed_deliveries.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                failed,
                topic = message.topic(),
                error = %error,
                "Frame delivery failed"
            );
        }
    }
}

impl ConsumerContext for TransportContext {}

/// Factory for librdkafka producers and consumers.
#[derive(Debug, Clone, Copy, Default)]
pub struct KafkaBackend;

impl KafkaBackend {
    pub fn new() -> Self {
        Self
    }
}

fn client_config(properties: Vec<(String, String)>) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in properties {
        config.set(key, value);
    }
    config
}

impl ProducerFactory for KafkaBackend {
    type Producer = KafkaProducerClient;

    fn create_producer(
        &self,
        config: &ConnectionConfig,
        events: EventCallback,
    ) -> Result<KafkaProducerClient> {
        let producer: BaseProducer<TransportContext> =
            client_config(config.producer_properties())
                .create_with_context(TransportContext::new(events))
                .map_err(|e| TransportError::Connection(e.to_string()))?;

        debug!(brokers = %config.broker_address, "Created Kafka producer");
        Ok(KafkaProducerClient {
            producer,
            max_message_size: config.max_message_size,
        })
    }
}

impl ConsumerFactory for KafkaBackend {
    type Consumer = KafkaConsumerClient;

    fn create_consumer(
        &self,
        config: &ConnectionConfig,
        events: EventCallback,
    ) -> Result<KafkaConsumerClient> {
        let consumer: BaseConsumer<TransportContext> =
            client_config(config.consumer_properties())
                .create_with_context(TransportContext::new(events))
                .map_err(|e| TransportError::Connection(e.to_string()))?;

        debug!(
            brokers = %config.broker_address,
            group_id = ?config.group_id,
            "Created Kafka consumer"
        );
        Ok(KafkaConsumerClient { consumer })
    }
}

// ============================================================================
// Producer
// ============================================================================

pub struct KafkaProducerClient {
    producer: BaseProducer<TransportContext>,
    max_message_size: usize,
}

impl ProducerClient for KafkaProducerClient {
    fn produce(&mut self, topic: &str, payload: &[u8]) -> std::result::Result<(), ProduceError> {
        let record = BaseRecord::<'_, (), [u8]>::to(topic).payload(payload);
        self.producer
            .send(record)
            .map_err(|(error, _record)| produce_error(&error, payload.len(), self.max_message_size))
    }

    fn poll(&mut self, timeout: Duration) {
        self.producer.poll(timeout);
    }

    fn flush(&mut self, timeout: Duration) -> std::result::Result<(), FlushError> {
        self.producer.flush(timeout).map_err(|error| {
            match error.rdkafka_error_code() {
                Some(RDKafkaErrorCode::OperationTimedOut) => FlushError::TimedOut,
                code => FlushError::Broker(code.map_or(UNKNOWN_ERROR_CODE, |c| c as i32)),
            }
        })
    }

    fn in_flight_count(&self) -> usize {
        usize::try_from(self.producer.in_flight_count()).unwrap_or(0)
    }

    fn failed_deliveries(&self) -> u64 {
        self.producer.context().failed_deliveries()
    }
}

fn produce_error(error: &KafkaError, size: usize, max: usize) -> ProduceError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::QueueFull) => ProduceError::QueueFull,
        Some(RDKafkaErrorCode::MessageSizeTooLarge) => ProduceError::MessageTooLarge { size, max },
        code => ProduceError::Broker(code.map_or(UNKNOWN_ERROR_CODE, |c| c as i32)),
    }
}

// ============================================================================
// Consumer
// ============================================================================

pub struct KafkaConsumerClient {
    consumer: BaseConsumer<TransportContext>,
}

fn connection_error(error: KafkaError) -> TransportError {
    TransportError::Connection(error.to_string())
}

impl ConsumerClient for KafkaConsumerClient {
    fn assign(&mut self, topic: &str, partition: i32, offset: Offset) -> Result<()> {
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, partition, kafka_offset(offset))
            .map_err(connection_error)?;
        self.consumer.assign(&assignment).map_err(connection_error)
    }

    fn unassign(&mut self) -> Result<()> {
        self.consumer.unassign().map_err(connection_error)
    }

    fn pause(&mut self) -> Result<()> {
        let assignment = self.consumer.assignment().map_err(connection_error)?;
        self.consumer.pause(&assignment).map_err(connection_error)
    }

    fn resume(&mut self) -> Result<()> {
        let assignment = self.consumer.assignment().map_err(connection_error)?;
        self.consumer.resume(&assignment).map_err(connection_error)
    }

    fn poll(
        &mut self,
        timeout: Duration,
    ) -> Option<std::result::Result<ReceivedMessage, ConsumeError>> {
        let result = self.consumer.poll(timeout)?;
        Some(match result {
            Ok(message) => Ok(ReceivedMessage {
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                offset: message.offset(),
                partition: message.partition(),
                topic: message.topic().to_string(),
            }),
            Err(error) => Err(ConsumeError::Broker(
                error
                    .rdkafka_error_code()
                    .map_or(UNKNOWN_ERROR_CODE, |c| c as i32),
            )),
        })
    }
}

fn kafka_offset(offset: Offset) -> KafkaOffset {
    match offset {
        Offset::Beginning => KafkaOffset::Beginning,
        Offset::End => KafkaOffset::End,
        Offset::Stored => KafkaOffset::Stored,
        Offset::At(n) => KafkaOffset::Offset(n),
    }
}

fn log_level(level: RDKafkaLogLevel) -> Level {
    match level {
        RDKafkaLogLevel::Emerg
        | RDKafkaLogLevel::Alert
        | RDKafkaLogLevel::Critical
        | RDKafkaLogLevel::Error => Level::ERROR,
        RDKafkaLogLevel::Warning => Level::WARN,
        RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => Level::INFO,
        RDKafkaLogLevel::Debug => Level::DEBUG,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_mapping() {
        assert_eq!(kafka_offset(Offset::Beginning), KafkaOffset::Beginning);
        assert_eq!(kafka_offset(Offset::End), KafkaOffset::End);
        assert_eq!(kafka_offset(Offset::Stored), KafkaOffset::Stored);
        assert_eq!(kafka_offset(Offset::At(12)), KafkaOffset::Offset(12));
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(log_level(RDKafkaLogLevel::Critical), Level::ERROR);
        assert_eq!(log_level(RDKafkaLogLevel::Warning), Level::WARN);
        assert_eq!(log_level(RDKafkaLogLevel::Notice), Level::INFO);
        assert_eq!(log_level(RDKafkaLogLevel::Debug), Level::DEBUG);
    }

    #[test]
    fn test_produce_error_mapping() {
        let queue_full = KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull);
        assert_eq!(produce_error(&queue_full, 10, 4), ProduceError::QueueFull);

        let too_large = KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge);
        assert!(matches!(
            produce_error(&too_large, 10, 4),
            ProduceError::MessageTooLarge { size: 10, max: 4 }
        ));

        let other = KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopic);
        assert_eq!(
            produce_error(&other, 10, 4),
            ProduceError::Broker(RDKafkaErrorCode::UnknownTopic as i32)
        );
    }
}
