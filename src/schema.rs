//! Schema types and loading
//!
//! Four Avro schemas govern a handler: the inbound key and value it decodes, and the
//! outbound key and value it produces. They are parsed once at startup into a
//! [`CodecRegistry`] and shared read-only for the life of the process.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use apache_avro::Schema as AvroSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checksum::Fingerprint;
use crate::error::{Error, Result};

/// Which half of which message a schema governs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaRole {
    InboundKey,
    InboundValue,
    OutboundKey,
    OutboundValue,
}

impl SchemaRole {
    /// Whether this schema describes a record key
    pub fn is_key(&self) -> bool {
        matches!(self, SchemaRole::InboundKey | SchemaRole::OutboundKey)
    }

    /// Suffix used by the default subject naming strategy
    pub fn subject_suffix(&self) -> &'static str {
        if self.is_key() {
            "key"
        } else {
            "value"
        }
    }
}

impl fmt::Display for SchemaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchemaRole::InboundKey => "inbound key",
            SchemaRole::InboundValue => "inbound value",
            SchemaRole::OutboundKey => "outbound key",
            SchemaRole::OutboundValue => "outbound value",
        };
        f.write_str(s)
    }
}

/// A parsed, immutable schema definition
#[derive(Debug, Clone)]
pub struct SchemaDefinition {
    /// Role this schema plays in the pipeline
    pub role: SchemaRole,
    /// File the definition was read from, if any
    pub source_path: Option<PathBuf>,
    /// Parsed Avro schema
    pub schema: AvroSchema,
    /// Fingerprint of the canonical form
    pub fingerprint: Fingerprint,
}

impl SchemaDefinition {
    /// Load and parse a definition from an `.avsc` file
    pub fn load(path: impl AsRef<Path>, role: SchemaRole) -> Result<Self> {
        let path = path.as_ref();
        let load_err = |reason: String| Error::SchemaLoad {
            path: path.display().to_string(),
            reason,
        };

        let content = fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let mut definition = Self::parse(&content, role).map_err(|e| match e {
            Error::SchemaLoad { reason, .. } => load_err(reason),
            other => other,
        })?;
        definition.source_path = Some(path.to_path_buf());

        debug!(%role, path = %path.display(), fingerprint = definition.fingerprint.short(), "Loaded schema");
        Ok(definition)
    }

    /// Parse a definition from its JSON text
    pub fn parse(content: &str, role: SchemaRole) -> Result<Self> {
        let load_err = |reason: String| Error::SchemaLoad {
            path: "<inline>".to_string(),
            reason,
        };

        let json: serde_json::Value =
            serde_json::from_str(content).map_err(|e| load_err(format!("invalid JSON: {}", e)))?;
        let schema =
            AvroSchema::parse(&json).map_err(|e| load_err(format!("invalid Avro schema: {}", e)))?;

        if !matches!(schema, AvroSchema::Record(_)) {
            return Err(load_err("top-level type must be a record".to_string()));
        }

        let fingerprint = Fingerprint::of_schema(&schema);
        Ok(Self {
            role,
            source_path: None,
            schema,
            fingerprint,
        })
    }

    /// Fully qualified record name
    pub fn name(&self) -> String {
        match &self.schema {
            AvroSchema::Record(record) => record.name.fullname(None),
            other => format!("{:?}", other),
        }
    }

    /// Parsing Canonical Form of the schema
    pub fn canonical_form(&self) -> String {
        self.schema.canonical_form()
    }
}

/// Locations of the four schema files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaPaths {
    pub inbound_key: PathBuf,
    pub inbound_value: PathBuf,
    pub outbound_key: PathBuf,
    pub outbound_value: PathBuf,
}

/// The schemas a handler decodes and encodes with
///
/// Built once at startup and shared behind an `Arc`; nothing mutates it afterwards.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    inbound_key: SchemaDefinition,
    inbound_value: SchemaDefinition,
    outbound_key: SchemaDefinition,
    outbound_value: SchemaDefinition,
}

impl CodecRegistry {
    /// Load every schema, failing on the first missing or malformed definition
    pub fn load(paths: &SchemaPaths) -> Result<Self> {
        let registry = Self {
            inbound_key: SchemaDefinition::load(&paths.inbound_key, SchemaRole::InboundKey)?,
            inbound_value: SchemaDefinition::load(&paths.inbound_value, SchemaRole::InboundValue)?,
            outbound_key: SchemaDefinition::load(&paths.outbound_key, SchemaRole::OutboundKey)?,
            outbound_value: SchemaDefinition::load(&paths.outbound_value, SchemaRole::OutboundValue)?,
        };
        info!("Avro schemas loaded successfully");
        Ok(registry)
    }

    /// Assemble from already-parsed definitions
    pub fn from_definitions(
        inbound_key: SchemaDefinition,
        inbound_value: SchemaDefinition,
        outbound_key: SchemaDefinition,
        outbound_value: SchemaDefinition,
    ) -> Self {
        Self {
            inbound_key,
            inbound_value,
            outbound_key,
            outbound_value,
        }
    }

    /// Get the definition for a role
    pub fn get(&self, role: SchemaRole) -> &SchemaDefinition {
        match role {
            SchemaRole::InboundKey => &self.inbound_key,
            SchemaRole::InboundValue => &self.inbound_value,
            SchemaRole::OutboundKey => &self.outbound_key,
            SchemaRole::OutboundValue => &self.outbound_value,
        }
    }
}
