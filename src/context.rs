//! Per-message correlation context
//!
//! Every inbound message gets its own [`CorrelationContext`]. It is threaded through
//! the call chain explicitly and mirrored into a `tracing` span, so every log line
//! emitted while the message is processed carries its coordinates. Nothing here is
//! global: concurrent messages never see each other's context.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::field::Empty;
use tracing::Span;

use crate::codec::DecodedMessage;

/// Broker coordinates of an inbound record, supplied by the trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Record timestamp in epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Identifiers and coordinates of one in-flight message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationContext {
    /// `id` field of the inbound value, if it decoded
    pub message_id: Option<String>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<i64>,
    /// `correlationId` field of the inbound key, if present
    pub correlation_id: Option<String>,
    /// `partitionKey` field of the inbound key, if present
    pub partition_key: Option<String>,
}

impl CorrelationContext {
    /// Start the context of a message from its broker coordinates
    ///
    /// Identifiers are filled in once the message is decoded, see
    /// [`CorrelationContext::record_decoded`].
    pub fn new(metadata: &MessageMetadata) -> Self {
        Self {
            message_id: None,
            topic: metadata.topic.clone(),
            partition: metadata.partition,
            offset: metadata.offset,
            timestamp: metadata.timestamp,
            correlation_id: None,
            partition_key: None,
        }
    }

    /// Span carrying this context's fields
    ///
    /// Identifiers not known yet start empty and are recorded as they become known.
    pub fn span(&self) -> Span {
        let span = tracing::info_span!(
            "kafka_message",
            topic = %self.topic,
            partition = self.partition,
            offset = self.offset,
            timestamp = self.timestamp.unwrap_or_default(),
            message_id = Empty,
            correlation_id = Empty,
        );
        if let Some(id) = &self.message_id {
            span.record("message_id", id.as_str());
        }
        if let Some(id) = &self.correlation_id {
            span.record("correlation_id", id.as_str());
        }
        span
    }

    /// Take the message id from the value and the correlation fields from the key
    pub fn record_decoded(&mut self, span: &Span, decoded: &DecodedMessage) {
        let key_field = |name: &str| {
            decoded
                .key
                .as_ref()
                .and_then(|key| key.get(name))
                .and_then(scalar_string)
        };

        self.message_id = decoded
            .value
            .as_ref()
            .and_then(|value| value.get("id"))
            .and_then(scalar_string);
        self.correlation_id = key_field("correlationId");
        self.partition_key = key_field("partitionKey");

        if let Some(id) = &self.message_id {
            span.record("message_id", id.as_str());
        }
        if let Some(id) = &self.correlation_id {
            span.record("correlation_id", id.as_str());
        }
    }

    /// Record the correlation id the response ended up using
    pub fn record_correlation_id(&mut self, span: &Span, correlation_id: &str) {
        if self.correlation_id.is_none() {
            self.correlation_id = Some(correlation_id.to_string());
            span.record("correlation_id", correlation_id);
        }
    }
}

fn scalar_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
