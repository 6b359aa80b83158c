//! Message handler
//!
//! The entry point a hosting trigger calls once per inbound record:
//!
//! ```text
//! raw key/value -> strip header -> decode -> transform -> encode + frame -> publish
//! ```
//!
//! Decode failures are local to their half of the message and the transform never
//! fails, so the only errors that escape [`MessageHandler::handle`] are the ones the
//! trigger should answer by re-delivering the message.

use std::sync::Arc;
use std::thread;

use tracing::{debug, error, warn, Span};

use crate::codec::{self, DecodedMessage};
use crate::config::{EmptyMessagePolicy, HandlerConfig};
use crate::context::{CorrelationContext, MessageMetadata};
use crate::error::{Error, Result};
use crate::pipeline::{self, ResponseEnvelope};
use crate::producer::{AvroProducer, DeliveryReceipt};
use crate::registry::RegistryClient;
use crate::schema::CodecRegistry;
use crate::transport::BrokerTransport;

/// One record as delivered by the trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub metadata: MessageMetadata,
}

/// What handling a message produced
#[derive(Debug)]
pub struct HandledMessage {
    pub context: CorrelationContext,
    pub response: ResponseEnvelope,
    pub receipt: DeliveryReceipt,
}

/// Decodes inbound records, derives responses and publishes them
pub struct MessageHandler {
    schemas: Arc<CodecRegistry>,
    producer: AvroProducer,
    config: HandlerConfig,
}

impl MessageHandler {
    /// Load schemas, bind the producer to the registry and start it
    ///
    /// Any failure here is fatal for the process.
    pub fn new(
        config: HandlerConfig,
        registry: &dyn RegistryClient,
        transport: Arc<dyn BrokerTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let schemas = Arc::new(CodecRegistry::load(&config.schemas.paths())?);
        let producer = AvroProducer::new(&config, schemas.clone(), registry, transport)?;
        Ok(Self::from_parts(config, schemas, producer))
    }

    /// Assemble from an already-built schema set and producer
    pub fn from_parts(config: HandlerConfig, schemas: Arc<CodecRegistry>, producer: AvroProducer) -> Self {
        Self {
            schemas,
            producer,
            config,
        }
    }

    pub fn schemas(&self) -> &CodecRegistry {
        &self.schemas
    }

    pub fn producer(&self) -> &AvroProducer {
        &self.producer
    }

    /// Process one inbound message
    ///
    /// Errors are logged with the message coordinates before they are returned.
    pub fn handle(&self, message: &InboundMessage) -> Result<HandledMessage> {
        let mut context = CorrelationContext::new(&message.metadata);
        let span = context.span();
        let _entered = span.enter();

        let decoded = codec::decode_message(message.key.as_deref(), message.value.as_deref(), &self.schemas);
        context.record_decoded(&span, &decoded);

        debug!(key = ?decoded.key, value = ?decoded.value, "Extracted key and value");

        match self.respond(&decoded, &mut context, &span) {
            Ok((response, receipt)) => Ok(HandledMessage {
                context,
                response,
                receipt,
            }),
            Err(e) => {
                error!(
                    error = %e,
                    message_id = context.message_id.as_deref().unwrap_or("unknown"),
                    topic = %context.topic,
                    partition = context.partition,
                    offset = context.offset,
                    "Error processing Kafka message"
                );
                Err(e)
            }
        }
    }

    fn respond(
        &self,
        decoded: &DecodedMessage,
        context: &mut CorrelationContext,
        span: &Span,
    ) -> Result<(ResponseEnvelope, DeliveryReceipt)> {
        if decoded.is_empty() {
            match self.config.handler.empty_message_policy {
                EmptyMessagePolicy::Abort => {
                    return Err(Error::EmptyMessage {
                        topic: context.topic.clone(),
                        partition: context.partition,
                        offset: context.offset,
                    })
                }
                EmptyMessagePolicy::Process => {
                    warn!("Neither key nor value decoded; responding from empty data")
                }
            }
        }

        let response = pipeline::transform(decoded.key.as_ref(), decoded.value.as_ref());
        context.record_correlation_id(span, &response.key.correlation_id);

        let (key, value) = response.to_records()?;
        let receipt = self.publish_with_backoff(&key, &value)?;
        Ok((response, receipt))
    }

    /// Publish, backing off and retrying while the queue is full
    fn publish_with_backoff(
        &self,
        key: &codec::StructuredRecord,
        value: &codec::StructuredRecord,
    ) -> Result<DeliveryReceipt> {
        let retries = self.config.producer.queue_full_retries;
        let mut backoff = self.config.producer.retry_backoff();
        let mut attempt = 0;
        loop {
            match self.producer.publish(key, value, None, Vec::new()) {
                Err(e) if e.is_retryable() && attempt < retries => {
                    attempt += 1;
                    warn!(attempt, backoff_ms = backoff.as_millis() as u64, "Producer queue full, retrying");
                    self.producer.poll_once();
                    thread::sleep(backoff);
                    backoff *= 2;
                }
                other => return other,
            }
        }
    }

    /// Flush outstanding deliveries and close the producer
    pub fn shutdown(&self) {
        self.producer.close();
    }
}
