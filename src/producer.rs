//! Avro producer
//!
//! [`AvroProducer`] encodes response records against their registered schemas and
//! queues them for delivery. A background worker thread hands queued records to the
//! [`BrokerTransport`]; each outcome comes back twice: through the message's
//! [`DeliveryReceipt`], and as a [`DeliveryReport`] passed to the delivery callback
//! the next time the producer is polled or flushed.
//!
//! ## Lifecycle
//!
//! ```text
//! Open --publish/poll_once/flush--> Open --close--> Flushing --> Closed
//! ```
//!
//! Only a full queue is worth retrying. Encode failures return from `publish`;
//! transport failures arrive as failed delivery reports and are never retried here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use crate::codec::StructuredRecord;
use crate::config::HandlerConfig;
use crate::error::{Error, Result, TransportError};
use crate::registry::{RegistryClient, SchemaSerializer};
use crate::schema::{CodecRegistry, SchemaRole};
use crate::transport::{BrokerTransport, DeliveryMetadata, Headers, ProducedRecord};

/// Longest single wait inside `flush`, so reports keep draining while it blocks
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Producer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Open,
    Flushing,
    Closed,
}

/// Outcome of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReport {
    Delivered {
        sequence: u64,
        key: Vec<u8>,
        metadata: DeliveryMetadata,
    },
    Failed {
        sequence: u64,
        key: Vec<u8>,
        topic: String,
        error: TransportError,
    },
}

impl DeliveryReport {
    /// Producer-assigned sequence number of the message
    pub fn sequence(&self) -> u64 {
        match self {
            DeliveryReport::Delivered { sequence, .. } | DeliveryReport::Failed { sequence, .. } => *sequence,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryReport::Delivered { .. })
    }
}

/// Handle to the delivery outcome of one published message
#[derive(Debug)]
pub struct DeliveryReceipt {
    sequence: u64,
    outcome: Receiver<DeliveryReport>,
}

impl DeliveryReceipt {
    /// Sequence number assigned at publish
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Outcome if already known, without blocking
    pub fn try_outcome(&self) -> Option<DeliveryReport> {
        self.outcome.try_recv().ok()
    }

    /// Wait up to `timeout` for the outcome
    pub fn wait(&self, timeout: Duration) -> Option<DeliveryReport> {
        self.outcome.recv_timeout(timeout).ok()
    }
}

/// Callback receiving every delivery report; observability only
pub type DeliveryCallback = Box<dyn Fn(&DeliveryReport) + Send + Sync>;

struct QueuedMessage {
    sequence: u64,
    record: ProducedRecord,
    outcome: Sender<DeliveryReport>,
}

/// Messages queued or awaiting acknowledgment
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    settled: Condvar,
}

impl InFlight {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn settle(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        self.settled.notify_all();
    }

    fn get(&self) -> usize {
        *self.count.lock()
    }

    /// Wait until the count drops to zero or `timeout` passes
    fn wait_settled(&self, timeout: Duration) -> usize {
        let mut count = self.count.lock();
        if *count > 0 {
            self.settled.wait_for(&mut count, timeout);
        }
        *count
    }
}

/// Produces Avro-encoded responses through a delivery queue
pub struct AvroProducer {
    topic: String,
    key_serializer: SchemaSerializer,
    value_serializer: SchemaSerializer,
    queue: RwLock<Option<Sender<QueuedMessage>>>,
    capacity: usize,
    reports: Receiver<DeliveryReport>,
    in_flight: Arc<InFlight>,
    state: Mutex<ProducerState>,
    worker: Mutex<Option<JoinHandle<()>>>,
    transport: Arc<dyn BrokerTransport>,
    callback: DeliveryCallback,
    flush_timeout: Duration,
    next_sequence: AtomicU64,
}

impl AvroProducer {
    /// Bind serializers to registered schemas and start the delivery worker
    ///
    /// Fails if either outbound schema is not registered under its resolved subject.
    pub fn new(
        config: &HandlerConfig,
        schemas: Arc<CodecRegistry>,
        registry: &dyn RegistryClient,
        transport: Arc<dyn BrokerTransport>,
    ) -> Result<Self> {
        let topic = config.kafka.topic.clone();
        let key_serializer = SchemaSerializer::new(
            registry,
            schemas.clone(),
            SchemaRole::OutboundKey,
            &topic,
            config.schemas.key_subject.as_deref(),
        )?;
        let value_serializer = SchemaSerializer::new(
            registry,
            schemas,
            SchemaRole::OutboundValue,
            &topic,
            config.schemas.value_subject.as_deref(),
        )?;

        let capacity = config.producer.queue_capacity;
        let (queue_tx, queue_rx) = bounded::<QueuedMessage>(capacity);
        let (reports_tx, reports_rx) = unbounded();
        let in_flight = Arc::new(InFlight::default());

        let worker = {
            let transport = transport.clone();
            let in_flight = in_flight.clone();
            std::thread::Builder::new()
                .name("avro-producer-delivery".to_string())
                .spawn(move || deliver_loop(queue_rx, reports_tx, transport, in_flight))?
        };

        info!(topic = %topic, capacity, "Producer started");
        Ok(Self {
            topic,
            key_serializer,
            value_serializer,
            queue: RwLock::new(Some(queue_tx)),
            capacity,
            reports: reports_rx,
            in_flight,
            state: Mutex::new(ProducerState::Open),
            worker: Mutex::new(Some(worker)),
            transport,
            callback: Box::new(log_delivery),
            flush_timeout: config.producer.flush_timeout(),
            next_sequence: AtomicU64::new(0),
        })
    }

    /// Replace the default logging delivery callback
    pub fn with_delivery_callback(mut self, callback: impl Fn(&DeliveryReport) + Send + Sync + 'static) -> Self {
        self.callback = Box::new(callback);
        self
    }

    /// Topic every message is produced to
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Subjects the key and value serializers resolved
    pub fn subjects(&self) -> (&str, &str) {
        (self.key_serializer.subject(), self.value_serializer.subject())
    }

    pub fn state(&self) -> ProducerState {
        *self.state.lock()
    }

    /// Messages queued or awaiting acknowledgment
    pub fn in_flight(&self) -> usize {
        self.in_flight.get()
    }

    /// Encode and queue a message without waiting for delivery
    pub fn publish(
        &self,
        key: &StructuredRecord,
        value: &StructuredRecord,
        partition: Option<i32>,
        headers: Headers,
    ) -> Result<DeliveryReceipt> {
        if self.state() != ProducerState::Open {
            return Err(Error::ProducerClosed);
        }

        let record = ProducedRecord {
            topic: self.topic.clone(),
            partition,
            key: self.key_serializer.serialize(key)?,
            value: self.value_serializer.serialize(value)?,
            headers,
        };

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let (outcome_tx, outcome_rx) = bounded(1);
        let message = QueuedMessage {
            sequence,
            record,
            outcome: outcome_tx,
        };

        {
            let queue = self.queue.read();
            let Some(sender) = queue.as_ref() else {
                return Err(Error::ProducerClosed);
            };
            self.in_flight.add();
            if let Err(e) = sender.try_send(message) {
                self.in_flight.settle();
                return Err(match e {
                    TrySendError::Full(_) => Error::QueueFull {
                        capacity: self.capacity,
                    },
                    TrySendError::Disconnected(_) => Error::ProducerClosed,
                });
            }
        }

        debug!(
            sequence,
            partition_key = field_text(key, "partitionKey"),
            value_id = field_text(value, "id"),
            "Message queued for production"
        );

        self.poll_once();
        Ok(DeliveryReceipt {
            sequence,
            outcome: outcome_rx,
        })
    }

    /// Pass every ready delivery report to the callback; never blocks
    ///
    /// Returns the number of reports served.
    pub fn poll_once(&self) -> usize {
        if self.state() == ProducerState::Closed {
            return 0;
        }
        self.drain_reports()
    }

    /// Wait up to `timeout` for every queued message to be acknowledged
    ///
    /// Returns the number of messages still unacknowledged; zero means everything
    /// was delivered or failed. A non-zero result is not a failure, only uncertainty.
    pub fn flush(&self, timeout: Duration) -> usize {
        if self.state() == ProducerState::Closed {
            return 0;
        }
        self.flush_inner(timeout)
    }

    fn flush_inner(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            self.drain_reports();
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if self.in_flight.wait_settled((deadline - now).min(FLUSH_POLL_INTERVAL)) == 0 {
                break;
            }
        }
        self.drain_reports();
        self.in_flight.get()
    }

    /// Flush, stop the delivery worker and release the transport
    ///
    /// Idempotent. Messages still unacknowledged when the flush times out are failed
    /// with [`TransportError::Shutdown`].
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state != ProducerState::Open {
                return;
            }
            *state = ProducerState::Flushing;
        }

        info!("Flushing and closing producer...");
        let remaining = self.flush_inner(self.flush_timeout);
        if remaining > 0 {
            warn!(remaining, "{} messages still in queue after flush", remaining);
        }

        self.queue.write().take();
        self.transport.close();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("Delivery worker panicked");
            }
        }
        self.drain_reports();

        *self.state.lock() = ProducerState::Closed;
        info!(topic = %self.topic, "Producer closed");
    }

    fn drain_reports(&self) -> usize {
        let mut served = 0;
        for report in self.reports.try_iter() {
            (self.callback)(&report);
            served += 1;
        }
        served
    }
}

impl Drop for AvroProducer {
    fn drop(&mut self) {
        self.close();
    }
}

fn deliver_loop(
    queue: Receiver<QueuedMessage>,
    reports: Sender<DeliveryReport>,
    transport: Arc<dyn BrokerTransport>,
    in_flight: Arc<InFlight>,
) {
    for message in queue.iter() {
        let QueuedMessage {
            sequence,
            record,
            outcome,
        } = message;

        let report = match transport.send(&record) {
            Ok(metadata) => DeliveryReport::Delivered {
                sequence,
                key: record.key,
                metadata,
            },
            Err(error) => DeliveryReport::Failed {
                sequence,
                key: record.key,
                topic: record.topic,
                error,
            },
        };

        // receivers may be gone; the report is informational
        let _ = outcome.send(report.clone());
        let _ = reports.send(report);
        in_flight.settle();
    }
    debug!("Delivery worker stopped");
}

/// Default delivery callback
pub fn log_delivery(report: &DeliveryReport) {
    match report {
        DeliveryReport::Delivered { key, metadata, .. } => info!(
            topic = %metadata.topic,
            partition = metadata.partition,
            offset = metadata.offset,
            key_len = key.len(),
            "Message delivered to {} [{}] at offset {}",
            metadata.topic,
            metadata.partition,
            metadata.offset
        ),
        DeliveryReport::Failed { key, topic, error, .. } => warn!(
            topic = %topic,
            key_len = key.len(),
            error = %error,
            "Delivery failed"
        ),
    }
}

fn field_text<'a>(record: &'a StructuredRecord, field: &str) -> &'a str {
    match record.get(field) {
        Some(JsonValue::String(s)) => s.as_str(),
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LocalRegistry;
    use crate::schema::SchemaDefinition;
    use crate::transport::MemoryBroker;
    use serde_json::json;

    const OUT_KEY: &str = r#"{"type":"record","name":"OutKey","fields":[
        {"name":"correlationId","type":"string"},
        {"name":"partitionKey","type":"string"}]}"#;
    const OUT_VALUE: &str = r#"{"type":"record","name":"OutValue","fields":[
        {"name":"id","type":"string"},
        {"name":"status","type":"string"}]}"#;

    fn schemas() -> Arc<CodecRegistry> {
        let def = |text: &str, role| SchemaDefinition::parse(text, role).unwrap();
        Arc::new(CodecRegistry::from_definitions(
            def(OUT_KEY, SchemaRole::InboundKey),
            def(OUT_VALUE, SchemaRole::InboundValue),
            def(OUT_KEY, SchemaRole::OutboundKey),
            def(OUT_VALUE, SchemaRole::OutboundValue),
        ))
    }

    fn producer_with(config: HandlerConfig, broker: Arc<MemoryBroker>) -> AvroProducer {
        let schemas = schemas();
        let registry = LocalRegistry::in_memory();
        registry
            .register("response-topic-key", schemas.get(SchemaRole::OutboundKey))
            .unwrap();
        registry
            .register("response-topic-value", schemas.get(SchemaRole::OutboundValue))
            .unwrap();
        AvroProducer::new(&config, schemas, &registry, broker).unwrap()
    }

    fn producer(broker: Arc<MemoryBroker>) -> AvroProducer {
        producer_with(HandlerConfig::default(), broker)
    }

    fn key() -> StructuredRecord {
        json!({ "correlationId": "abc", "partitionKey": "p1" }).as_object().cloned().unwrap()
    }

    fn value() -> StructuredRecord {
        json!({ "id": "m1", "status": "SUCCESS" }).as_object().cloned().unwrap()
    }

    #[test]
    fn test_publish_and_flush() {
        let broker = Arc::new(MemoryBroker::default());
        let producer = producer(broker.clone());

        let receipt = producer.publish(&key(), &value(), None, Vec::new()).unwrap();
        assert_eq!(producer.flush(Duration::from_secs(5)), 0);

        let report = receipt.wait(Duration::from_secs(1)).unwrap();
        assert!(report.is_delivered());
        assert_eq!(report.sequence(), receipt.sequence());
        assert_eq!(broker.record_count("response-topic"), 1);
    }

    #[test]
    fn test_callback_sees_every_report() {
        let broker = Arc::new(MemoryBroker::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let producer = {
            let seen = seen.clone();
            producer(broker).with_delivery_callback(move |r| seen.lock().push(r.sequence()))
        };

        for _ in 0..3 {
            producer.publish(&key(), &value(), None, Vec::new()).unwrap();
        }
        assert_eq!(producer.flush(Duration::from_secs(5)), 0);

        let mut sequences = seen.lock().clone();
        sequences.sort_unstable();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn test_transport_failure_reported_not_raised() {
        let broker = Arc::new(MemoryBroker::default());
        broker.fail_next(TransportError::Rejected("too large".into()));
        let producer = producer(broker.clone());

        let receipt = producer.publish(&key(), &value(), None, Vec::new()).unwrap();
        assert_eq!(producer.flush(Duration::from_secs(5)), 0);
        match receipt.try_outcome() {
            Some(DeliveryReport::Failed { error, .. }) => {
                assert_eq!(error, TransportError::Rejected("too large".into()))
            }
            other => panic!("expected failed report, got {:?}", other),
        }
        assert_eq!(broker.record_count("response-topic"), 0);
    }

    #[test]
    fn test_encode_failure_returned_from_publish() {
        let producer = producer(Arc::new(MemoryBroker::default()));
        let mut bad = value();
        bad.remove("status");
        let result = producer.publish(&key(), &bad, None, Vec::new());
        assert!(matches!(result, Err(Error::Encode { role: SchemaRole::OutboundValue, .. })));
        assert_eq!(producer.in_flight(), 0);
    }

    #[test]
    fn test_flush_timeout_returns_remaining() {
        let broker = Arc::new(MemoryBroker::default());
        broker.pause();
        let producer = producer(broker.clone());

        producer.publish(&key(), &value(), None, Vec::new()).unwrap();
        assert_eq!(producer.flush(Duration::from_millis(50)), 1);

        broker.resume();
        assert_eq!(producer.flush(Duration::from_secs(5)), 0);
    }

    #[test]
    fn test_queue_full_is_retryable() {
        let broker = Arc::new(MemoryBroker::default());
        broker.pause();
        let mut config = HandlerConfig::default();
        config.producer.queue_capacity = 1;
        let producer = producer_with(config, broker.clone());

        // the worker takes the first message off the queue and blocks in send,
        // the second fills the queue
        producer.publish(&key(), &value(), None, Vec::new()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match producer.publish(&key(), &value(), None, Vec::new()) {
                Ok(_) if Instant::now() < deadline => continue,
                Ok(_) => panic!("queue never filled"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Error::QueueFull { capacity: 1 }));
        assert!(err.is_retryable());

        broker.resume();
        assert_eq!(producer.flush(Duration::from_secs(5)), 0);
    }

    #[test]
    fn test_publish_after_close_fails() {
        let broker = Arc::new(MemoryBroker::default());
        let producer = producer(broker.clone());
        producer.publish(&key(), &value(), None, Vec::new()).unwrap();

        producer.close();
        assert_eq!(producer.state(), ProducerState::Closed);
        assert_eq!(broker.record_count("response-topic"), 1);

        let result = producer.publish(&key(), &value(), None, Vec::new());
        assert!(matches!(result, Err(Error::ProducerClosed)));
        assert_eq!(producer.flush(Duration::from_millis(10)), 0);
        assert_eq!(producer.poll_once(), 0);

        // second close is a no-op
        producer.close();
    }

    #[test]
    fn test_close_fails_undeliverable_messages() {
        let broker = Arc::new(MemoryBroker::default());
        broker.pause();
        let mut config = HandlerConfig::default();
        config.producer.flush_timeout_ms = 20;
        let producer = producer_with(config, broker);

        let receipt = producer.publish(&key(), &value(), None, Vec::new()).unwrap();
        producer.close();

        match receipt.try_outcome() {
            Some(DeliveryReport::Failed { error, .. }) => assert_eq!(error, TransportError::Shutdown),
            other => panic!("expected shutdown failure, got {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_publishers() {
        let broker = Arc::new(MemoryBroker::new(4));
        let producer = Arc::new(producer(broker.clone()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let producer = producer.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        producer.publish(&key(), &value(), None, Vec::new()).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(producer.flush(Duration::from_secs(5)), 0);
        assert_eq!(broker.record_count("response-topic"), 100);
    }
}
