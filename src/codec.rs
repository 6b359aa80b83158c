//! Avro binary codec
//!
//! Converts between Avro binary datums and [`StructuredRecord`]s, a JSON-shaped view of
//! a record. Both directions are driven strictly by the schema: field order, types,
//! union branches and enum symbols all come from it.
//!
//! Decoded values map as follows:
//!
//! | Avro                      | StructuredRecord value          |
//! |---------------------------|---------------------------------|
//! | null, boolean, string     | same                            |
//! | int, long, float, double  | number                          |
//! | bytes, fixed              | array of byte values            |
//! | enum                      | symbol string                   |
//! | union                     | value of the selected branch    |
//! | array, map, record        | array, object, object           |
//! | date, time-*, timestamp-* | number                          |
//! | uuid                      | string                          |

use std::collections::HashMap;
use std::io::{self, Read};

use apache_avro::schema::{RecordSchema, UnionSchema};
use apache_avro::types::Value as AvroValue;
use apache_avro::Schema as AvroSchema;
use serde_json::{Map, Number, Value as JsonValue};
use tracing::{debug, warn};

use crate::envelope;
use crate::error::{DecodeError, EncodeError};
use crate::schema::{CodecRegistry, SchemaDefinition, SchemaRole};

/// A decoded record: field name to value
pub type StructuredRecord = Map<String, JsonValue>;

/// Decode an Avro binary datum into a record
///
/// The whole payload must be consumed; leftover bytes are an error.
pub fn decode(payload: &[u8], schema: &AvroSchema) -> Result<StructuredRecord, DecodeError> {
    if !matches!(schema, AvroSchema::Record(_)) {
        return Err(DecodeError::NotARecord(type_name(schema)));
    }

    // a union index cut off by the end of input reads as its null branch, so running
    // out of bytes has to be tracked outside the Avro reader
    let mut reader = EofTracker::new(payload);
    let value = match apache_avro::from_avro_datum(schema, &mut reader, None) {
        Ok(_) if reader.hit_eof => return Err(DecodeError::Truncated(payload.len())),
        Ok(value) => value,
        Err(_) if reader.hit_eof => return Err(DecodeError::Truncated(payload.len())),
        Err(e) => return Err(e.into()),
    };
    if !reader.remaining.is_empty() {
        return Err(DecodeError::TrailingBytes(reader.remaining.len()));
    }

    match avro_to_json(value, "")? {
        JsonValue::Object(record) => Ok(record),
        _ => Err(DecodeError::NotARecord(type_name(schema))),
    }
}

/// Slice reader that remembers whether any read asked for more than was left
struct EofTracker<'a> {
    remaining: &'a [u8],
    hit_eof: bool,
}

impl<'a> EofTracker<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self {
            remaining: payload,
            hit_eof: false,
        }
    }
}

impl Read for EofTracker<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.len() > self.remaining.len() {
            self.hit_eof = true;
        }
        self.remaining.read(buf)
    }
}

/// Encode a record as an Avro binary datum
///
/// Absent fields are filled from the schema default, or null for a nullable union;
/// otherwise they are reported as missing. Fields not in the schema are ignored.
pub fn encode(record: &StructuredRecord, schema: &AvroSchema) -> Result<Vec<u8>, EncodeError> {
    let AvroSchema::Record(record_schema) = schema else {
        return Err(EncodeError::NotARecord(type_name(schema)));
    };

    let mut names = HashMap::new();
    collect_names(schema, &mut names);

    let value = record_to_avro(record, record_schema, "", &names)?;
    Ok(apache_avro::to_avro_datum(schema, value)?)
}

/// Strip the framing header, if any, and decode what remains
pub fn decode_framed(raw: &[u8], definition: &SchemaDefinition) -> Result<StructuredRecord, DecodeError> {
    let framed = envelope::strip(raw);
    if let Some(schema_id) = framed.schema_id {
        debug!(role = %definition.role, schema_id, "Stripped framing header");
    }
    decode(framed.payload, &definition.schema)
}

/// Key and value of an inbound message, each decoded independently
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedMessage {
    pub key: Option<StructuredRecord>,
    pub value: Option<StructuredRecord>,
}

impl DecodedMessage {
    /// Whether neither half produced a record
    pub fn is_empty(&self) -> bool {
        self.key.is_none() && self.value.is_none()
    }
}

/// Decode both halves of an inbound message
///
/// A failure on one half never prevents decoding the other. Failures are logged and
/// surface as `None`; an absent half is `None` without a decode attempt.
pub fn decode_message(
    raw_key: Option<&[u8]>,
    raw_value: Option<&[u8]>,
    schemas: &CodecRegistry,
) -> DecodedMessage {
    DecodedMessage {
        key: raw_key.and_then(|raw| decode_half(raw, schemas.get(SchemaRole::InboundKey))),
        value: raw_value.and_then(|raw| decode_half(raw, schemas.get(SchemaRole::InboundValue))),
    }
}

fn decode_half(raw: &[u8], definition: &SchemaDefinition) -> Option<StructuredRecord> {
    match decode_framed(raw, definition) {
        Ok(record) => {
            debug!(role = %definition.role, ?record, "Decoded record");
            Some(record)
        }
        Err(e) => {
            warn!(role = %definition.role, error = %e, "Failed to deserialize {}", definition.role);
            None
        }
    }
}

fn avro_to_json(value: AvroValue, path: &str) -> Result<JsonValue, DecodeError> {
    let json = match value {
        AvroValue::Null => JsonValue::Null,
        AvroValue::Boolean(b) => JsonValue::Bool(b),
        AvroValue::Int(i) | AvroValue::Date(i) | AvroValue::TimeMillis(i) => JsonValue::from(i),
        AvroValue::Long(i)
        | AvroValue::TimeMicros(i)
        | AvroValue::TimestampMillis(i)
        | AvroValue::TimestampMicros(i)
        | AvroValue::LocalTimestampMillis(i)
        | AvroValue::LocalTimestampMicros(i) => JsonValue::from(i),
        AvroValue::Float(f) => float_to_json(f64::from(f), path)?,
        AvroValue::Double(f) => float_to_json(f, path)?,
        AvroValue::Bytes(bytes) | AvroValue::Fixed(_, bytes) => {
            JsonValue::Array(bytes.into_iter().map(JsonValue::from).collect())
        }
        AvroValue::String(s) | AvroValue::Enum(_, s) => JsonValue::String(s),
        AvroValue::Uuid(uuid) => JsonValue::String(uuid.to_string()),
        AvroValue::Union(_, inner) => avro_to_json(*inner, path)?,
        AvroValue::Array(items) => JsonValue::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| avro_to_json(item, &format!("{}[{}]", path, i)))
                .collect::<Result<_, _>>()?,
        ),
        AvroValue::Map(entries) => {
            let mut map = Map::new();
            for (k, v) in entries {
                let child = avro_to_json(v, &join(path, &k))?;
                map.insert(k, child);
            }
            JsonValue::Object(map)
        }
        AvroValue::Record(fields) => {
            let mut map = Map::new();
            for (name, v) in fields {
                let child = avro_to_json(v, &join(path, &name))?;
                map.insert(name, child);
            }
            JsonValue::Object(map)
        }
        other => {
            return Err(DecodeError::Unsupported {
                path: path.to_string(),
                kind: format!("{:?}", other),
            })
        }
    };
    Ok(json)
}

fn float_to_json(f: f64, path: &str) -> Result<JsonValue, DecodeError> {
    Number::from_f64(f)
        .map(JsonValue::Number)
        .ok_or_else(|| DecodeError::Unsupported {
            path: path.to_string(),
            kind: format!("non-finite float {}", f),
        })
}

type Names<'s> = HashMap<String, &'s AvroSchema>;

fn collect_names<'s>(schema: &'s AvroSchema, names: &mut Names<'s>) {
    match schema {
        AvroSchema::Record(record) => {
            names.insert(record.name.fullname(None), schema);
            for field in &record.fields {
                collect_names(&field.schema, names);
            }
        }
        AvroSchema::Enum(e) => {
            names.insert(e.name.fullname(None), schema);
        }
        AvroSchema::Fixed(f) => {
            names.insert(f.name.fullname(None), schema);
        }
        AvroSchema::Array(inner) | AvroSchema::Map(inner) => collect_names(inner, names),
        AvroSchema::Union(union) => {
            for variant in union.variants() {
                collect_names(variant, names);
            }
        }
        _ => {}
    }
}

fn record_to_avro(
    record: &StructuredRecord,
    schema: &RecordSchema,
    path: &str,
    names: &Names<'_>,
) -> Result<AvroValue, EncodeError> {
    let mut fields = Vec::with_capacity(schema.fields.len());
    for field in &schema.fields {
        let field_path = join(path, &field.name);
        let value = match (record.get(&field.name), &field.default) {
            (Some(value), _) => json_to_avro(value, &field.schema, &field_path, names)?,
            (None, Some(default)) => json_to_avro(default, &field.schema, &field_path, names)?,
            (None, None) => match null_branch(&field.schema) {
                Some(index) => AvroValue::Union(index, Box::new(AvroValue::Null)),
                None => return Err(EncodeError::MissingField(field_path)),
            },
        };
        fields.push((field.name.clone(), value));
    }
    Ok(AvroValue::Record(fields))
}

fn null_branch(schema: &AvroSchema) -> Option<u32> {
    match schema {
        AvroSchema::Union(union) => union
            .variants()
            .iter()
            .position(|v| matches!(v, AvroSchema::Null))
            .map(|i| i as u32),
        _ => None,
    }
}

fn json_to_avro(
    value: &JsonValue,
    schema: &AvroSchema,
    path: &str,
    names: &Names<'_>,
) -> Result<AvroValue, EncodeError> {
    let mismatch = || EncodeError::TypeMismatch {
        path: path.to_string(),
        expected: type_name(schema),
    };

    let avro = match schema {
        AvroSchema::Null => match value {
            JsonValue::Null => AvroValue::Null,
            _ => return Err(mismatch()),
        },
        AvroSchema::Boolean => AvroValue::Boolean(value.as_bool().ok_or_else(mismatch)?),
        AvroSchema::Int => AvroValue::Int(as_i32(value).ok_or_else(mismatch)?),
        AvroSchema::Long => AvroValue::Long(value.as_i64().ok_or_else(mismatch)?),
        AvroSchema::Float => AvroValue::Float(value.as_f64().ok_or_else(mismatch)? as f32),
        AvroSchema::Double => AvroValue::Double(value.as_f64().ok_or_else(mismatch)?),
        AvroSchema::String => AvroValue::String(value.as_str().ok_or_else(mismatch)?.to_string()),
        AvroSchema::Bytes => AvroValue::Bytes(as_bytes(value).ok_or_else(mismatch)?),
        AvroSchema::Fixed(fixed) => {
            let bytes = as_bytes(value).ok_or_else(mismatch)?;
            if bytes.len() != fixed.size {
                return Err(mismatch());
            }
            AvroValue::Fixed(fixed.size, bytes)
        }
        AvroSchema::Enum(e) => {
            let symbol = value.as_str().ok_or_else(mismatch)?;
            let index = e.symbols.iter().position(|s| s == symbol).ok_or_else(mismatch)?;
            AvroValue::Enum(index as u32, symbol.to_string())
        }
        AvroSchema::Array(inner) => {
            let items = value.as_array().ok_or_else(mismatch)?;
            AvroValue::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| json_to_avro(item, inner, &format!("{}[{}]", path, i), names))
                    .collect::<Result<_, _>>()?,
            )
        }
        AvroSchema::Map(inner) => {
            let entries = value.as_object().ok_or_else(mismatch)?;
            let mut map = HashMap::with_capacity(entries.len());
            for (k, v) in entries {
                map.insert(k.clone(), json_to_avro(v, inner, &join(path, k), names)?);
            }
            AvroValue::Map(map)
        }
        AvroSchema::Record(record) => {
            let fields = value.as_object().ok_or_else(mismatch)?;
            record_to_avro(fields, record, path, names)?
        }
        AvroSchema::Union(union) => union_to_avro(value, union, path, names).ok_or_else(mismatch)?,
        AvroSchema::Ref { name } => {
            let fullname = name.fullname(None);
            let target = names
                .get(&fullname)
                .ok_or(EncodeError::UnresolvedReference(fullname))?;
            json_to_avro(value, target, path, names)?
        }
        AvroSchema::Date => AvroValue::Date(as_i32(value).ok_or_else(mismatch)?),
        AvroSchema::TimeMillis => AvroValue::TimeMillis(as_i32(value).ok_or_else(mismatch)?),
        AvroSchema::TimeMicros => AvroValue::TimeMicros(value.as_i64().ok_or_else(mismatch)?),
        AvroSchema::TimestampMillis => AvroValue::TimestampMillis(value.as_i64().ok_or_else(mismatch)?),
        AvroSchema::TimestampMicros => AvroValue::TimestampMicros(value.as_i64().ok_or_else(mismatch)?),
        AvroSchema::LocalTimestampMillis => {
            AvroValue::LocalTimestampMillis(value.as_i64().ok_or_else(mismatch)?)
        }
        AvroSchema::LocalTimestampMicros => {
            AvroValue::LocalTimestampMicros(value.as_i64().ok_or_else(mismatch)?)
        }
        AvroSchema::Uuid => {
            let text = value.as_str().ok_or_else(mismatch)?;
            AvroValue::Uuid(text.parse().map_err(|_| mismatch())?)
        }
        _ => return Err(mismatch()),
    };
    Ok(avro)
}

/// Pick the first union branch the value converts to
///
/// A record branch only takes objects whose keys are all fields of that record, so
/// an object meant for a later record branch is never absorbed by an earlier one.
fn union_to_avro(
    value: &JsonValue,
    union: &UnionSchema,
    path: &str,
    names: &Names<'_>,
) -> Option<AvroValue> {
    union
        .variants()
        .iter()
        .enumerate()
        .filter(|(_, variant)| keys_fit(value, variant, names))
        .find_map(|(i, variant)| {
            json_to_avro(value, variant, path, names)
                .ok()
                .map(|v| AvroValue::Union(i as u32, Box::new(v)))
        })
}

fn keys_fit(value: &JsonValue, variant: &AvroSchema, names: &Names<'_>) -> bool {
    let variant = match variant {
        AvroSchema::Ref { name } => match names.get(&name.fullname(None)) {
            Some(target) => *target,
            None => return false,
        },
        other => other,
    };
    match (value, variant) {
        (JsonValue::Object(object), AvroSchema::Record(record)) => object
            .keys()
            .all(|key| record.fields.iter().any(|field| &field.name == key)),
        _ => true,
    }
}

fn as_i32(value: &JsonValue) -> Option<i32> {
    value.as_i64().and_then(|i| i32::try_from(i).ok())
}

fn as_bytes(value: &JsonValue) -> Option<Vec<u8>> {
    match value {
        JsonValue::String(s) => Some(s.as_bytes().to_vec()),
        JsonValue::Array(items) => items
            .iter()
            .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect(),
        _ => None,
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

fn type_name(schema: &AvroSchema) -> String {
    match schema {
        AvroSchema::Null => "null".into(),
        AvroSchema::Boolean => "boolean".into(),
        AvroSchema::Int => "int".into(),
        AvroSchema::Long => "long".into(),
        AvroSchema::Float => "float".into(),
        AvroSchema::Double => "double".into(),
        AvroSchema::Bytes => "bytes".into(),
        AvroSchema::String => "string".into(),
        AvroSchema::Array(_) => "array".into(),
        AvroSchema::Map(_) => "map".into(),
        AvroSchema::Union(_) => "union".into(),
        AvroSchema::Record(r) => format!("record {}", r.name.fullname(None)),
        AvroSchema::Enum(e) => format!("enum {}", e.name.fullname(None)),
        AvroSchema::Fixed(f) => format!("fixed {}", f.name.fullname(None)),
        AvroSchema::Ref { name } => name.fullname(None),
        other => format!("{:?}", other).to_lowercase(),
    }
}
