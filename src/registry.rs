//! Schema Registry
//!
//! Outbound records are encoded against a schema that must already be registered
//! under a subject. The subject is resolved once, when a [`SchemaSerializer`] is
//! built, and the registered schema id is cached for the serializer's lifetime.
//! Nothing in the produce path ever registers a schema: a subject without a matching
//! version is a startup failure.
//!
//! [`LocalRegistry`] is an append-only, file-backed registry used for local runs and
//! tests. Network registries plug in through [`RegistryClient`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checksum::Fingerprint;
use crate::codec::{self, StructuredRecord};
use crate::envelope;
use crate::error::{Error, Result};
use crate::schema::{CodecRegistry, SchemaDefinition, SchemaRole};

const MANIFEST_FILE: &str = "registry.json";

/// Resolve the subject a schema is looked up under
///
/// A non-empty override wins; otherwise the topic name strategy applies:
/// `{topic}-key` or `{topic}-value`.
pub fn resolve_subject(topic: &str, role: SchemaRole, override_subject: Option<&str>) -> String {
    match override_subject {
        Some(subject) if !subject.is_empty() => subject.to_string(),
        _ => format!("{}-{}", topic, role.subject_suffix()),
    }
}

/// A schema version registered under a subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredSchema {
    /// Global schema id, written into the framing header
    pub id: u32,
    /// Subject the version belongs to
    pub subject: String,
    /// Version number within the subject, starting at 1
    pub version: u32,
    /// Canonical form of the schema
    pub schema: String,
    /// Fingerprint of the canonical form
    pub fingerprint: Fingerprint,
    /// When the version was registered
    pub registered_at: DateTime<Utc>,
}

/// Read access to a schema registry
pub trait RegistryClient: Send + Sync {
    /// Find the version under `subject` whose schema matches `definition`
    fn lookup(&self, subject: &str, definition: &SchemaDefinition) -> Result<RegisteredSchema>;

    /// Latest version registered under `subject`
    fn latest(&self, subject: &str) -> Result<RegisteredSchema>;
}

/// On-disk manifest of a local registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryManifest {
    next_id: u32,
    subjects: BTreeMap<String, Vec<RegisteredSchema>>,
}

impl RegistryManifest {
    fn find_id(&self, fingerprint: &Fingerprint) -> Option<u32> {
        self.subjects
            .values()
            .flatten()
            .find(|v| &v.fingerprint == fingerprint)
            .map(|v| v.id)
    }

    fn fingerprint_of(&self, id: u32) -> Option<&Fingerprint> {
        self.subjects
            .values()
            .flatten()
            .find(|v| v.id == id)
            .map(|v| &v.fingerprint)
    }
}

/// Append-only registry persisted as a single JSON manifest
///
/// Registered versions are never modified or removed. Schema ids are global: the
/// same schema registered under two subjects shares one id.
pub struct LocalRegistry {
    /// Directory holding the manifest, `None` for a purely in-memory registry
    root: Option<PathBuf>,
    manifest: RwLock<RegistryManifest>,
}

impl LocalRegistry {
    /// Open an existing registry directory or create a new one
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let manifest_path = root.join(MANIFEST_FILE);
        let manifest = if manifest_path.exists() {
            let content = fs::read_to_string(&manifest_path)?;
            serde_json::from_str(&content)?
        } else {
            RegistryManifest::default()
        };

        debug!(path = %root.display(), subjects = manifest.subjects.len(), "Opened local registry");
        Ok(Self {
            root: Some(root),
            manifest: RwLock::new(manifest),
        })
    }

    /// Create a registry that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            root: None,
            manifest: RwLock::new(RegistryManifest::default()),
        }
    }

    /// Get the root path of the registry, if persisted
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// All subjects, sorted
    pub fn subjects(&self) -> Vec<String> {
        self.manifest.read().subjects.keys().cloned().collect()
    }

    /// All versions under a subject, oldest first
    pub fn versions(&self, subject: &str) -> Vec<RegisteredSchema> {
        self.manifest
            .read()
            .subjects
            .get(subject)
            .cloned()
            .unwrap_or_default()
    }

    /// Find any registered version carrying `id`
    pub fn by_id(&self, id: u32) -> Option<RegisteredSchema> {
        self.manifest
            .read()
            .subjects
            .values()
            .flatten()
            .find(|v| v.id == id)
            .cloned()
    }

    /// Register a schema under a subject
    ///
    /// Registering a schema already present under the subject returns the existing
    /// version unchanged.
    pub fn register(&self, subject: &str, definition: &SchemaDefinition) -> Result<RegisteredSchema> {
        self.register_inner(subject, definition, None)
    }

    /// Register a schema under a subject with a caller-chosen id
    ///
    /// Used to mirror ids assigned by an upstream registry. Fails if the id is already
    /// taken by a different schema.
    pub fn register_with_id(
        &self,
        subject: &str,
        definition: &SchemaDefinition,
        id: u32,
    ) -> Result<RegisteredSchema> {
        self.register_inner(subject, definition, Some(id))
    }

    fn register_inner(
        &self,
        subject: &str,
        definition: &SchemaDefinition,
        requested_id: Option<u32>,
    ) -> Result<RegisteredSchema> {
        let mut manifest = self.manifest.write();

        if let Some(existing) = manifest
            .subjects
            .get(subject)
            .and_then(|versions| versions.iter().find(|v| v.fingerprint == definition.fingerprint))
        {
            return match requested_id {
                Some(id) if id != existing.id => Err(Error::RegistryConflict {
                    subject: subject.to_string(),
                    id,
                }),
                _ => Ok(existing.clone()),
            };
        }

        let known_id = manifest.find_id(&definition.fingerprint);
        let id = match requested_id {
            Some(id) => {
                let taken_by_other = manifest
                    .fingerprint_of(id)
                    .is_some_and(|fp| fp != &definition.fingerprint);
                let schema_has_other_id = known_id.is_some_and(|known| known != id);
                if taken_by_other || schema_has_other_id {
                    return Err(Error::RegistryConflict {
                        subject: subject.to_string(),
                        id,
                    });
                }
                id
            }
            None => known_id.unwrap_or_else(|| manifest.next_id.max(1)),
        };
        let next_id = id
            .checked_add(1)
            .ok_or_else(|| Error::Registry(format!("Schema id {} leaves no room for another id", id)))?;

        // persist the updated copy first; the live manifest only changes once it is on disk
        let mut updated = manifest.clone();
        updated.next_id = updated.next_id.max(next_id);
        let versions = updated.subjects.entry(subject.to_string()).or_default();
        let entry = RegisteredSchema {
            id,
            subject: subject.to_string(),
            version: versions.len() as u32 + 1,
            schema: definition.canonical_form(),
            fingerprint: definition.fingerprint.clone(),
            registered_at: Utc::now(),
        };
        versions.push(entry.clone());

        self.persist(&updated)?;
        *manifest = updated;
        info!(subject, id, version = entry.version, "Registered schema");
        Ok(entry)
    }

    fn persist(&self, manifest: &RegistryManifest) -> Result<()> {
        if let Some(root) = &self.root {
            let content = serde_json::to_string_pretty(manifest)?;
            fs::write(root.join(MANIFEST_FILE), content)?;
        }
        Ok(())
    }
}

impl RegistryClient for LocalRegistry {
    fn lookup(&self, subject: &str, definition: &SchemaDefinition) -> Result<RegisteredSchema> {
        let manifest = self.manifest.read();
        manifest
            .subjects
            .get(subject)
            .and_then(|versions| versions.iter().find(|v| v.fingerprint == definition.fingerprint))
            .cloned()
            .ok_or_else(|| Error::SchemaNotRegistered {
                subject: subject.to_string(),
                fingerprint: definition.fingerprint.to_string(),
            })
    }

    fn latest(&self, subject: &str) -> Result<RegisteredSchema> {
        self.manifest
            .read()
            .subjects
            .get(subject)
            .and_then(|versions| versions.last())
            .cloned()
            .ok_or_else(|| Error::Registry(format!("Subject '{}' not found", subject)))
    }
}

/// Encodes records for one role against a registered schema and frames them
#[derive(Debug, Clone)]
pub struct SchemaSerializer {
    role: SchemaRole,
    subject: String,
    registered: RegisteredSchema,
    schemas: Arc<CodecRegistry>,
}

impl SchemaSerializer {
    /// Resolve the subject and bind it to the registered schema id
    ///
    /// Fails if the local schema for `role` is not registered under the subject.
    pub fn new(
        registry: &dyn RegistryClient,
        schemas: Arc<CodecRegistry>,
        role: SchemaRole,
        topic: &str,
        override_subject: Option<&str>,
    ) -> Result<Self> {
        let subject = resolve_subject(topic, role, override_subject);
        let registered = registry.lookup(&subject, schemas.get(role))?;

        info!(%role, subject = %subject, schema_id = registered.id, version = registered.version, "Bound serializer to registered schema");
        Ok(Self {
            role,
            subject,
            registered,
            schemas,
        })
    }

    /// Subject this serializer resolved at construction
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Schema id written into every framing header
    pub fn schema_id(&self) -> u32 {
        self.registered.id
    }

    /// Encode and frame a record
    pub fn serialize(&self, record: &StructuredRecord) -> Result<Vec<u8>> {
        let payload = codec::encode(record, &self.schemas.get(self.role).schema).map_err(|source| {
            Error::Encode {
                role: self.role,
                source,
            }
        })?;
        Ok(envelope::frame(self.registered.id, &payload))
    }
}
