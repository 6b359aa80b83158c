//! Error types for the handler pipeline

use thiserror::Error;

use crate::schema::SchemaRole;

/// Result type for handler operations
pub type Result<T> = std::result::Result<T, Error>;

/// Handler errors
///
/// Startup failures (`SchemaLoad`, `Config`, `SchemaNotRegistered`, `Registry`) mean
/// the process cannot proceed. `Encode`, `EmptyMessage` and exhausted `QueueFull`
/// retries escape `MessageHandler::handle` so the hosting trigger re-delivers the
/// message. Decode and transform failures never appear here; they are recovered
/// where they happen.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to load schema from {path}: {reason}")]
    SchemaLoad { path: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No registered schema under subject '{subject}' matches fingerprint {fingerprint}")]
    SchemaNotRegistered { subject: String, fingerprint: String },

    #[error("Schema registry error: {0}")]
    Registry(String),

    #[error("Schema id {id} is already registered under subject '{subject}'")]
    RegistryConflict { subject: String, id: u32 },

    #[error("Failed to encode {role} record: {source}")]
    Encode {
        role: SchemaRole,
        #[source]
        source: EncodeError,
    },

    #[error("Producer queue is full ({capacity} messages in flight)")]
    QueueFull { capacity: usize },

    #[error("Producer is closed")]
    ProducerClosed,

    #[error("Neither key nor value could be decoded for {topic}[{partition}]@{offset}")]
    EmptyMessage {
        topic: String,
        partition: i32,
        offset: i64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the caller may retry the same operation after backing off
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::QueueFull { .. })
    }
}

impl From<config_crate::ConfigError> for Error {
    fn from(e: config_crate::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

/// Failure decoding Avro binary data into a record
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Schema '{0}' is not a record schema")]
    NotARecord(String),

    #[error("Malformed payload: {0}")]
    Malformed(#[from] apache_avro::Error),

    #[error("Payload of {0} bytes ended before the record was complete")]
    Truncated(usize),

    #[error("{0} trailing bytes after datum")]
    TrailingBytes(usize),

    #[error("Unsupported decoded value at '{path}': {kind}")]
    Unsupported { path: String, kind: String },
}

/// Failure encoding a record against a schema
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Schema '{0}' is not a record schema")]
    NotARecord(String),

    #[error("Required field '{0}' is missing")]
    MissingField(String),

    #[error("Value at '{path}' is incompatible with schema type {expected}")]
    TypeMismatch { path: String, expected: String },

    #[error("Unresolved schema reference '{0}'")]
    UnresolvedReference(String),

    #[error("Avro encoding failed: {0}")]
    Avro(#[from] apache_avro::Error),
}

/// Failure reported by a broker transport for one record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Partition {partition} does not exist for topic '{topic}'")]
    UnknownPartition { topic: String, partition: i32 },

    #[error("Record rejected by broker: {0}")]
    Rejected(String),

    #[error("Transport shut down before delivery")]
    Shutdown,
}
