//! Kafka Avro Handler
//!
//! Decodes schema-registry framed Avro records, derives a correlated response for
//! each one and publishes the response through an asynchronous producer.
//!
//! ## Features
//!
//! - **Envelope Codec**: Strips and writes the 5-byte magic + schema id header
//! - **Schema-Driven Decoding**: Avro binary to JSON-shaped records and back
//! - **Correlation**: Every response carries the correlation id of its request
//! - **Registry-Bound Serializers**: Outbound subjects resolve once, never auto-register
//! - **Delivery Tracking**: Per-message receipts, callbacks, flush and close
//!
//! ## Architecture
//!
//! ```text
//! InboundMessage
//!   │  envelope::strip + codec::decode      (key and value independently)
//!   ▼
//! DecodedMessage ──► CorrelationContext    (span: kafka_message)
//!   │  pipeline::transform
//!   ▼
//! ResponseEnvelope
//!   │  SchemaSerializer: codec::encode + envelope::frame
//!   ▼
//! AvroProducer queue ──► delivery worker ──► BrokerTransport
//!   │
//!   ▼
//! DeliveryReport ──► poll_once / flush ──► callback
//! ```

pub mod checksum;
pub mod codec;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod pipeline;
pub mod producer;
pub mod registry;
pub mod schema;
pub mod transport;

pub use checksum::Fingerprint;
pub use codec::{DecodedMessage, StructuredRecord};
pub use config::{EmptyMessagePolicy, HandlerConfig};
pub use context::{CorrelationContext, MessageMetadata};
pub use envelope::FramedMessage;
pub use error::{DecodeError, EncodeError, Error, Result, TransportError};
pub use handler::{HandledMessage, InboundMessage, MessageHandler};
pub use pipeline::{ResponseEnvelope, ResponseKey, ResponseValue, Status};
pub use producer::{AvroProducer, DeliveryReceipt, DeliveryReport, ProducerState};
pub use registry::{LocalRegistry, RegisteredSchema, RegistryClient, SchemaSerializer};
pub use schema::{CodecRegistry, SchemaDefinition, SchemaPaths, SchemaRole};
pub use transport::{BrokerTransport, DeliveryMetadata, MemoryBroker, ProducedRecord};
