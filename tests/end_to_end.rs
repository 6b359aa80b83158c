//! End-to-End Tests
//!
//! Runs framed Avro records through the handler against the fixture schemas, a
//! file-backed registry and the in-memory broker, then decodes what was produced.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kafka_avro_handler::codec::{self, StructuredRecord};
use kafka_avro_handler::envelope;
use kafka_avro_handler::{
    AvroProducer, CodecRegistry, EmptyMessagePolicy, EncodeError, Error, HandlerConfig, InboundMessage,
    LocalRegistry, MemoryBroker, MessageHandler, MessageMetadata, RegistryClient, SchemaDefinition,
    SchemaRole, Status, TransportError,
};
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};

fn fixtures_path() -> &'static Path {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").leak()
}

fn config(registry_dir: &Path) -> HandlerConfig {
    let mut config = HandlerConfig::default();
    config.schemas.dir = fixtures_path().to_path_buf();
    config.registry.path = registry_dir.to_path_buf();
    config.producer.flush_timeout_ms = 2000;
    config
}

struct Harness {
    _dir: TempDir,
    schemas: CodecRegistry,
    registry: LocalRegistry,
    broker: Arc<MemoryBroker>,
    handler: MessageHandler,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(customize: impl FnOnce(&mut HandlerConfig)) -> Self {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        customize(&mut config);

        let schemas = CodecRegistry::load(&config.schemas.paths()).unwrap();
        let registry = LocalRegistry::open(dir.path()).unwrap();
        registry
            .register("response-topic-key", schemas.get(SchemaRole::OutboundKey))
            .unwrap();
        registry
            .register("response-topic-value", schemas.get(SchemaRole::OutboundValue))
            .unwrap();

        let broker = Arc::new(MemoryBroker::default());
        let handler = MessageHandler::new(config, &registry, broker.clone()).unwrap();
        Self {
            _dir: dir,
            schemas,
            registry,
            broker,
            handler,
        }
    }

    fn inbound(&self, role: SchemaRole, record: Value, schema_id: Option<u32>) -> Vec<u8> {
        let record: StructuredRecord = record.as_object().cloned().unwrap();
        let payload = codec::encode(&record, &self.schemas.get(role).schema).unwrap();
        match schema_id {
            Some(id) => envelope::frame(id, &payload),
            None => payload,
        }
    }

    fn message(&self, key: Option<Value>, value: Option<Value>) -> InboundMessage {
        InboundMessage {
            key: key.map(|k| self.inbound(SchemaRole::InboundKey, k, Some(11))),
            value: value.map(|v| self.inbound(SchemaRole::InboundValue, v, Some(12))),
            metadata: MessageMetadata {
                topic: "incoming-topic".to_string(),
                partition: 0,
                offset: 42,
                timestamp: Some(1_700_000_000_000),
            },
        }
    }

    /// Decode every record produced to the response topic
    fn produced(&self) -> Vec<(StructuredRecord, StructuredRecord)> {
        self.broker
            .records("response-topic", 0)
            .into_iter()
            .map(|stored| {
                let key = codec::decode_framed(&stored.key, self.schemas.get(SchemaRole::OutboundKey)).unwrap();
                let value =
                    codec::decode_framed(&stored.value, self.schemas.get(SchemaRole::OutboundValue)).unwrap();
                (key, value)
            })
            .collect()
    }
}

fn processed_data(value: &StructuredRecord) -> Value {
    let text = value["result"]["processedData"].as_str().unwrap();
    serde_json::from_str(text).unwrap()
}

// =============================================================================
// Produce Path
// =============================================================================

#[test]
fn test_request_produces_correlated_response() {
    let harness = Harness::new();
    let message = harness.message(
        Some(json!({ "correlationId": "abc", "partitionKey": "p1" })),
        Some(json!({ "id": "m1", "data": "hi", "source": "sensorA" })),
    );

    let handled = harness.handler.handle(&message).unwrap();
    assert!(handled.response.is_success());
    assert_eq!(harness.handler.producer().flush(Duration::from_secs(5)), 0);
    assert!(handled.receipt.try_outcome().unwrap().is_delivered());

    let produced = harness.produced();
    assert_eq!(produced.len(), 1);
    let (key, value) = &produced[0];

    assert_eq!(key["correlationId"], json!("abc"));
    assert_eq!(key["partitionKey"], json!("p1"));
    assert_eq!(key["responseType"], json!("PROCESSING_RESULT"));
    assert_eq!(key["functionName"], json!("KafkaAvroHandler"));

    assert_eq!(value["id"], json!("m1"));
    assert_eq!(value["correlationId"], json!("abc"));
    assert_eq!(value["status"], json!("SUCCESS"));
    assert_eq!(value["version"], json!("1.0"));
    assert!(value["result"]["errorMessage"].is_null());
    assert!(value["result"]["errorCode"].is_null());

    let data = processed_data(value);
    assert_eq!(data["transformedData"], json!("HI"));
    assert_eq!(data["source"], json!("sensorA"));
    assert_eq!(data["originalId"], json!("abc"));
}

#[test]
fn test_produced_records_carry_registered_schema_ids() {
    let harness = Harness::new();
    let message = harness.message(Some(json!({ "correlationId": "abc" })), Some(json!({ "id": "m1" })));
    harness.handler.handle(&message).unwrap();
    harness.handler.producer().flush(Duration::from_secs(5));

    let key_id = harness
        .registry
        .latest("response-topic-key")
        .unwrap()
        .id;
    let value_id = harness
        .registry
        .latest("response-topic-value")
        .unwrap()
        .id;

    let stored = harness.broker.records("response-topic", 0);
    assert_eq!(envelope::strip(&stored[0].key).schema_id, Some(key_id));
    assert_eq!(envelope::strip(&stored[0].value).schema_id, Some(value_id));
    assert_ne!(key_id, value_id);
}

#[test]
fn test_missing_optional_fields_use_defaults() {
    let harness = Harness::new();
    let message = harness.message(Some(json!({ "correlationId": "abc" })), Some(json!({ "id": "m1" })));

    harness.handler.handle(&message).unwrap();
    harness.handler.producer().flush(Duration::from_secs(5));

    let (key, value) = &harness.produced()[0];
    assert_eq!(key["partitionKey"], json!("default"));
    assert_eq!(value["status"], json!("SUCCESS"));
    let data = processed_data(value);
    assert_eq!(data["transformedData"], json!(""));
    assert_eq!(data["source"], json!("unknown"));
}

#[test]
fn test_absent_key_generates_correlation_id() {
    let harness = Harness::new();
    let message = harness.message(None, Some(json!({ "id": "m1", "data": "x" })));

    let handled = harness.handler.handle(&message).unwrap();
    let correlation_id = handled.response.key.correlation_id.clone();
    assert!(!correlation_id.is_empty());
    assert_eq!(handled.context.correlation_id.as_deref(), Some(correlation_id.as_str()));

    harness.handler.producer().flush(Duration::from_secs(5));
    let (key, value) = &harness.produced()[0];
    assert_eq!(key["correlationId"], json!(correlation_id));
    assert_eq!(value["correlationId"], json!(correlation_id));
}

#[test]
fn test_unframed_inbound_records_decode() {
    let harness = Harness::new();
    let message = InboundMessage {
        key: Some(harness.inbound(SchemaRole::InboundKey, json!({ "correlationId": "raw" }), None)),
        value: Some(harness.inbound(SchemaRole::InboundValue, json!({ "id": "m1", "data": "plain" }), None)),
        metadata: MessageMetadata {
            topic: "incoming-topic".to_string(),
            partition: 3,
            offset: 9,
            timestamp: None,
        },
    };

    let handled = harness.handler.handle(&message).unwrap();
    assert_eq!(handled.response.key.correlation_id, "raw");
    assert_eq!(handled.response.value.id, "m1");
    assert!(handled.response.is_success());
}

#[test]
fn test_zero_leading_datum_is_read_as_framed() {
    let harness = Harness::new();
    // a null first union branch encodes as 0x00, indistinguishable from the magic byte
    let raw = harness.inbound(SchemaRole::InboundValue, json!({ "data": "plain" }), None);
    assert_eq!(raw[0], 0x00);
    assert!(raw.len() >= 5);

    let framed = envelope::strip(&raw);
    assert!(framed.is_framed());
    assert_eq!(framed.payload, &raw[5..]);
}

#[test]
fn test_empty_payloads_respond_with_error() {
    let harness = Harness::new();
    let message = InboundMessage {
        key: Some(Vec::new()),
        value: Some(Vec::new()),
        metadata: MessageMetadata {
            topic: "incoming-topic".to_string(),
            partition: 0,
            offset: 1,
            timestamp: None,
        },
    };

    let handled = harness.handler.handle(&message).unwrap();
    assert_eq!(handled.response.value.status, Status::Error);
    assert_eq!(handled.response.value.result.error_code.as_deref(), Some("PROCESSING_ERROR"));

    harness.handler.producer().flush(Duration::from_secs(5));
    let (key, value) = &harness.produced()[0];
    assert_eq!(key["responseType"], json!("ERROR_RESPONSE"));
    assert_eq!(value["status"], json!("ERROR"));
    assert!(value["result"]["processedData"].is_null());
}

#[test]
fn test_abort_policy_rejects_empty_message() {
    let harness = Harness::with_config(|c| c.handler.empty_message_policy = EmptyMessagePolicy::Abort);
    let message = InboundMessage {
        key: None,
        value: Some(vec![0x00, 0x00, 0x00, 0x00, 0x01, 0xff]),
        metadata: MessageMetadata {
            topic: "incoming-topic".to_string(),
            partition: 2,
            offset: 5,
            timestamp: None,
        },
    };

    let err = harness.handler.handle(&message).unwrap_err();
    assert!(matches!(
        err,
        Error::EmptyMessage {
            partition: 2,
            offset: 5,
            ..
        }
    ));
    assert_eq!(harness.broker.record_count("response-topic"), 0);
}

#[test]
fn test_responses_keep_publish_order() {
    let harness = Harness::new();
    for i in 0..5 {
        let message = harness.message(
            Some(json!({ "correlationId": format!("c{}", i), "partitionKey": "same" })),
            Some(json!({ "id": format!("m{}", i), "data": "x" })),
        );
        harness.handler.handle(&message).unwrap();
    }
    assert_eq!(harness.handler.producer().flush(Duration::from_secs(5)), 0);

    let ids: Vec<Value> = harness.produced().into_iter().map(|(_, v)| v["id"].clone()).collect();
    assert_eq!(ids, vec![json!("m0"), json!("m1"), json!("m2"), json!("m3"), json!("m4")]);
    let offsets: Vec<i64> = harness
        .broker
        .records("response-topic", 0)
        .iter()
        .map(|r| r.offset)
        .collect();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
}

// =============================================================================
// Failures and Lifecycle
// =============================================================================

#[test]
fn test_transport_failure_reaches_receipt() {
    let harness = Harness::new();
    harness
        .broker
        .fail_next(TransportError::Rejected("message too large".to_string()));
    let message = harness.message(Some(json!({ "correlationId": "abc" })), Some(json!({ "id": "m1" })));

    let handled = harness.handler.handle(&message).unwrap();
    let report = handled.receipt.wait(Duration::from_secs(5)).unwrap();
    assert!(!report.is_delivered());
    assert_eq!(harness.handler.producer().flush(Duration::from_secs(5)), 0);
}

#[test]
fn test_encode_failure_escapes_handle() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let loaded = CodecRegistry::load(&config.schemas.paths()).unwrap();

    // outbound value requires a field the response never carries
    let strict_value = SchemaDefinition::parse(
        r#"{"type":"record","name":"StrictValue","fields":[
            {"name":"id","type":"string"},
            {"name":"tenant","type":"string"}]}"#,
        SchemaRole::OutboundValue,
    )
    .unwrap();
    let schemas = Arc::new(CodecRegistry::from_definitions(
        loaded.get(SchemaRole::InboundKey).clone(),
        loaded.get(SchemaRole::InboundValue).clone(),
        loaded.get(SchemaRole::OutboundKey).clone(),
        strict_value,
    ));

    let registry = LocalRegistry::open(dir.path()).unwrap();
    registry
        .register("response-topic-key", schemas.get(SchemaRole::OutboundKey))
        .unwrap();
    registry
        .register("response-topic-value", schemas.get(SchemaRole::OutboundValue))
        .unwrap();

    let broker = Arc::new(MemoryBroker::default());
    let producer = AvroProducer::new(&config, schemas.clone(), &registry, broker.clone()).unwrap();
    let handler = MessageHandler::from_parts(config, schemas.clone(), producer);

    let key: StructuredRecord = json!({ "correlationId": "abc" }).as_object().cloned().unwrap();
    let message = InboundMessage {
        key: Some(envelope::frame(
            1,
            &codec::encode(&key, &schemas.get(SchemaRole::InboundKey).schema).unwrap(),
        )),
        value: None,
        metadata: MessageMetadata {
            topic: "incoming-topic".to_string(),
            partition: 0,
            offset: 0,
            timestamp: None,
        },
    };

    let err = handler.handle(&message).unwrap_err();
    match err {
        Error::Encode { role, source } => {
            assert_eq!(role, SchemaRole::OutboundValue);
            assert!(matches!(source, EncodeError::MissingField(ref f) if f == "tenant"));
        }
        other => panic!("Expected Encode, got {:?}", other),
    }
    assert_eq!(broker.record_count("response-topic"), 0);
}

#[test]
fn test_unregistered_subject_fails_startup() {
    let dir = tempdir().unwrap();
    let registry = LocalRegistry::open(dir.path()).unwrap();
    let result = MessageHandler::new(config(dir.path()), &registry, Arc::new(MemoryBroker::default()));
    assert!(matches!(result, Err(Error::SchemaNotRegistered { .. })));
}

#[test]
fn test_subject_override_is_used() {
    let dir = tempdir().unwrap();
    let mut config = config(dir.path());
    config.schemas.value_subject = Some("custom-value".to_string());
    let schemas = CodecRegistry::load(&config.schemas.paths()).unwrap();
    let registry = LocalRegistry::open(dir.path()).unwrap();
    registry
        .register("response-topic-key", schemas.get(SchemaRole::OutboundKey))
        .unwrap();
    registry
        .register("custom-value", schemas.get(SchemaRole::OutboundValue))
        .unwrap();

    let handler = MessageHandler::new(config, &registry, Arc::new(MemoryBroker::default())).unwrap();
    assert_eq!(handler.producer().subjects(), ("response-topic-key", "custom-value"));
}

#[test]
fn test_shutdown_then_publish_fails() {
    let harness = Harness::new();
    let message = harness.message(Some(json!({ "correlationId": "abc" })), Some(json!({ "id": "m1" })));
    harness.handler.handle(&message).unwrap();

    harness.handler.shutdown();
    assert_eq!(harness.broker.record_count("response-topic"), 1);
    assert_eq!(harness.handler.producer().flush(Duration::from_millis(10)), 0);
    assert_eq!(harness.handler.producer().poll_once(), 0);
    assert!(matches!(harness.handler.handle(&message), Err(Error::ProducerClosed)));
}

#[test]
fn test_delivery_callback_sees_every_report() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let schemas = Arc::new(CodecRegistry::load(&config.schemas.paths()).unwrap());
    let registry = LocalRegistry::open(dir.path()).unwrap();
    registry
        .register("response-topic-key", schemas.get(SchemaRole::OutboundKey))
        .unwrap();
    registry
        .register("response-topic-value", schemas.get(SchemaRole::OutboundValue))
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let producer = {
        let seen = seen.clone();
        AvroProducer::new(&config, schemas.clone(), &registry, Arc::new(MemoryBroker::default()))
            .unwrap()
            .with_delivery_callback(move |report| seen.lock().unwrap().push(report.sequence()))
    };
    let handler = MessageHandler::from_parts(config, schemas.clone(), producer);

    let key: StructuredRecord = json!({ "correlationId": "abc" }).as_object().cloned().unwrap();
    let raw_key = codec::encode(&key, &schemas.get(SchemaRole::InboundKey).schema).unwrap();
    for offset in 0..3 {
        let message = InboundMessage {
            key: Some(raw_key.clone()),
            value: None,
            metadata: MessageMetadata {
                topic: "incoming-topic".to_string(),
                partition: 0,
                offset,
                timestamp: None,
            },
        };
        handler.handle(&message).unwrap();
    }

    assert_eq!(handler.producer().flush(Duration::from_secs(5)), 0);
    let mut sequences = seen.lock().unwrap().clone();
    sequences.sort_unstable();
    assert_eq!(sequences, vec![0, 1, 2]);
}

#[test]
fn test_registry_persists_across_opens() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let schemas = CodecRegistry::load(&config.schemas.paths()).unwrap();
    let first = {
        let registry = LocalRegistry::open(dir.path()).unwrap();
        registry
            .register("response-topic-value", schemas.get(SchemaRole::OutboundValue))
            .unwrap()
    };

    let reopened = LocalRegistry::open(dir.path()).unwrap();
    let found = reopened
        .lookup("response-topic-value", schemas.get(SchemaRole::OutboundValue))
        .unwrap();
    assert_eq!(found.id, first.id);
    assert_eq!(found.version, 1);
}
