//! Response derivation
//!
//! Turns a decoded inbound key/value pair into the correlated response pair. The
//! transform never fails outward: anything that goes wrong while deriving the
//! processed payload becomes an `ERROR` response instead.

use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::codec::StructuredRecord;

/// Name stamped on every response
pub const FUNCTION_NAME: &str = "KafkaAvroHandler";

/// Response format version
pub const RESPONSE_VERSION: &str = "1.0";

/// Error code used for every transform failure
pub const PROCESSING_ERROR: &str = "PROCESSING_ERROR";

const DEFAULT_PARTITION_KEY: &str = "default";
const DEFAULT_SOURCE: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseType {
    ProcessingResult,
    ErrorResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    Error,
}

/// Outbound record key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseKey {
    pub correlation_id: String,
    pub partition_key: String,
    pub response_type: ResponseType,
    pub function_name: String,
}

/// Outcome block of a response
///
/// Exactly one of `processed_data` and `error_message` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultBlock {
    /// JSON-serialized [`ProcessedData`]
    pub processed_data: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub processing_time_ms: i64,
    pub retry_count: i32,
}

/// Outbound record value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseValue {
    pub id: String,
    pub correlation_id: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub status: Status,
    pub result: ResultBlock,
    pub function_name: String,
    pub execution_id: String,
    pub version: String,
}

/// Payload carried in `result.processedData`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedData {
    pub original_id: String,
    pub processed_at: i64,
    pub transformed_data: String,
    pub source: String,
}

/// The derived response pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub key: ResponseKey,
    pub value: ResponseValue,
}

impl ResponseEnvelope {
    /// Whether the transform succeeded
    pub fn is_success(&self) -> bool {
        self.value.status == Status::Success
    }

    /// Key and value as records ready for encoding
    pub fn to_records(&self) -> serde_json::Result<(StructuredRecord, StructuredRecord)> {
        Ok((to_record(&self.key)?, to_record(&self.value)?))
    }
}

fn to_record<T: Serialize>(value: &T) -> serde_json::Result<StructuredRecord> {
    match serde_json::to_value(value)? {
        JsonValue::Object(map) => Ok(map),
        other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

#[derive(Debug, Error)]
enum TransformError {
    #[error("inbound value is absent")]
    ValueAbsent,

    #[error("field '{field}' must be a scalar, got {kind}")]
    NonScalarField { field: &'static str, kind: &'static str },

    #[error("failed to serialize processed data: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Derive the response for an inbound key/value pair
///
/// `correlationId` and `partitionKey` come from the key, falling back to a fresh
/// UUID and `"default"`. Never panics and never returns an error.
pub fn transform(key: Option<&StructuredRecord>, value: Option<&StructuredRecord>) -> ResponseEnvelope {
    let correlation_id = field_string(key, "correlationId").unwrap_or_else(new_id);
    let partition_key =
        field_string(key, "partitionKey").unwrap_or_else(|| DEFAULT_PARTITION_KEY.to_string());
    let id = field_string(value, "id").unwrap_or_else(new_id);

    let started = Instant::now();
    let (response_type, status, result) = match process(&correlation_id, value) {
        Ok(processed_data) => {
            let processing_time_ms = started.elapsed().as_millis() as i64;
            let result = ResultBlock {
                processed_data: Some(processed_data),
                error_message: None,
                error_code: None,
                processing_time_ms,
                retry_count: 0,
            };
            (ResponseType::ProcessingResult, Status::Success, result)
        }
        Err(e) => {
            error!(error = %e, "Error in processing");
            let result = ResultBlock {
                processed_data: None,
                error_message: Some(e.to_string()),
                error_code: Some(PROCESSING_ERROR.to_string()),
                processing_time_ms: 0,
                retry_count: 0,
            };
            (ResponseType::ErrorResponse, Status::Error, result)
        }
    };

    let envelope = ResponseEnvelope {
        key: ResponseKey {
            correlation_id: correlation_id.clone(),
            partition_key,
            response_type,
            function_name: FUNCTION_NAME.to_string(),
        },
        value: ResponseValue {
            id,
            correlation_id,
            timestamp: Utc::now().timestamp_millis(),
            status,
            result,
            function_name: FUNCTION_NAME.to_string(),
            execution_id: new_id(),
            version: RESPONSE_VERSION.to_string(),
        },
    };

    info!(key = ?envelope.key, status = ?envelope.value.status, "Generated response");
    envelope
}

fn process(correlation_id: &str, value: Option<&StructuredRecord>) -> Result<String, TransformError> {
    let value = value.ok_or(TransformError::ValueAbsent)?;

    let data = scalar_field(value, "data")?.unwrap_or_default();
    let source = scalar_field(value, "source")?.unwrap_or_else(|| DEFAULT_SOURCE.to_string());

    let processed = ProcessedData {
        original_id: correlation_id.to_string(),
        processed_at: Utc::now().timestamp_millis(),
        transformed_data: data.to_uppercase(),
        source,
    };
    Ok(serde_json::to_string(&processed)?)
}

/// Read a field as text; null and absent are `None`, containers are an error
fn scalar_field(record: &StructuredRecord, field: &'static str) -> Result<Option<String>, TransformError> {
    match record.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s.clone())),
        Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
        Some(JsonValue::Bool(b)) => Ok(Some(b.to_string())),
        Some(JsonValue::Array(_)) => Err(TransformError::NonScalarField { field, kind: "array" }),
        Some(JsonValue::Object(_)) => Err(TransformError::NonScalarField { field, kind: "object" }),
    }
}

fn field_string(record: Option<&StructuredRecord>, field: &str) -> Option<String> {
    match record?.get(field)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}
