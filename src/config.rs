//! Configuration management for the handler
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (handler.toml)
//! - Environment variables (HANDLER__*)
//!
//! ## Example config file (handler.toml):
//! ```toml
//! [kafka]
//! bootstrap_servers = "kafka:9092"
//! topic = "response-topic"
//! security_protocol = "SASL_SSL"
//! sasl_mechanism = "PLAIN"
//! username = "kafka_user"
//! password = "kafka_password"
//!
//! [registry]
//! url = "http://host.docker.internal:8081"
//! path = "./registry"
//!
//! [schemas]
//! dir = "./schemas"
//! value_subject = "response-topic-value"
//!
//! [producer]
//! queue_capacity = 10000
//! flush_timeout_ms = 10000
//!
//! [handler]
//! empty_message_policy = "abort"
//! ```
//!
//! Environment overrides use a double underscore between section and field, e.g.
//! `HANDLER__KAFKA__TOPIC=responses`.

use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::schema::SchemaPaths;

const SECURITY_PROTOCOLS: &[&str] = &["PLAINTEXT", "SSL", "SASL_PLAINTEXT", "SASL_SSL"];

/// Main configuration for the handler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Broker connection settings
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Schema registry settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Schema files and subject overrides
    #[serde(default)]
    pub schemas: SchemasConfig,

    /// Producer queue settings
    #[serde(default)]
    pub producer: ProducerConfig,

    /// Message processing policy
    #[serde(default)]
    pub handler: PipelineConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,

    /// Topic responses are produced to
    #[serde(default = "default_topic")]
    pub topic: String,

    /// PLAINTEXT, SSL, SASL_PLAINTEXT or SASL_SSL
    #[serde(default = "default_security_protocol")]
    pub security_protocol: String,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, ...)
    #[serde(default = "default_sasl_mechanism")]
    pub sasl_mechanism: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

/// Schema registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry service URL, used by network registry clients
    #[serde(default = "default_registry_url")]
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Directory of the local file-backed registry
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

/// Schema file locations and subject overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemasConfig {
    /// Directory relative schema file names resolve against
    #[serde(default = "default_schema_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_inbound_key")]
    pub inbound_key: PathBuf,

    #[serde(default = "default_inbound_value")]
    pub inbound_value: PathBuf,

    #[serde(default = "default_outbound_key")]
    pub outbound_key: PathBuf,

    #[serde(default = "default_outbound_value")]
    pub outbound_value: PathBuf,

    /// Subject for the outbound key schema instead of `{topic}-key`
    #[serde(default)]
    pub key_subject: Option<String>,

    /// Subject for the outbound value schema instead of `{topic}-value`
    #[serde(default)]
    pub value_subject: Option<String>,
}

/// Producer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Maximum messages queued or awaiting acknowledgment
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Flush timeout used by close
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    /// Publish attempts after a full queue before giving up
    #[serde(default = "default_queue_full_retries")]
    pub queue_full_retries: u32,

    /// Initial backoff between queue-full retries, doubled per attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

/// What to do with a message where neither key nor value decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmptyMessagePolicy {
    /// Run the transform anyway; it answers with an error response
    #[default]
    Process,
    /// Fail the invocation so the trigger retries it
    Abort,
}

/// Message processing configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub empty_message_policy: EmptyMessagePolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_bootstrap_servers() -> String {
    "kafka:9092".to_string()
}

fn default_topic() -> String {
    "response-topic".to_string()
}

fn default_security_protocol() -> String {
    "PLAINTEXT".to_string()
}

fn default_sasl_mechanism() -> String {
    "PLAIN".to_string()
}

fn default_registry_url() -> String {
    "http://host.docker.internal:8081".to_string()
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("./registry")
}

fn default_schema_dir() -> PathBuf {
    PathBuf::from("./schemas")
}

fn default_inbound_key() -> PathBuf {
    PathBuf::from("incoming-topic-key.avsc")
}

fn default_inbound_value() -> PathBuf {
    PathBuf::from("incoming-topic-value.avsc")
}

fn default_outbound_key() -> PathBuf {
    PathBuf::from("response-topic-key.avsc")
}

fn default_outbound_value() -> PathBuf {
    PathBuf::from("response-topic-value.avsc")
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_flush_timeout_ms() -> u64 {
    10_000
}

fn default_queue_full_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            topic: default_topic(),
            security_protocol: default_security_protocol(),
            sasl_mechanism: default_sasl_mechanism(),
            username: None,
            password: None,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            username: None,
            password: None,
            path: default_registry_path(),
        }
    }
}

impl Default for SchemasConfig {
    fn default() -> Self {
        Self {
            dir: default_schema_dir(),
            inbound_key: default_inbound_key(),
            inbound_value: default_inbound_value(),
            outbound_key: default_outbound_key(),
            outbound_value: default_outbound_value(),
            key_subject: None,
            value_subject: None,
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            flush_timeout_ms: default_flush_timeout_ms(),
            queue_full_retries: default_queue_full_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SchemasConfig {
    /// Resolve the four schema files against `dir`
    pub fn paths(&self) -> SchemaPaths {
        SchemaPaths {
            inbound_key: self.dir.join(&self.inbound_key),
            inbound_value: self.dir.join(&self.inbound_value),
            outbound_key: self.dir.join(&self.outbound_key),
            outbound_value: self.dir.join(&self.outbound_value),
        }
    }
}

impl ProducerConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl HandlerConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration, layering an explicit file over the default locations
    pub fn load_from(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        let config_locations = ["handler.toml", ".handler.toml", "config/handler.toml"];
        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // Load from XDG config directory
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "kafka-avro", "handler") {
            let xdg_config = config_dir.config_dir().join("handler.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("HANDLER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the handler cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.kafka.bootstrap_servers.trim().is_empty() {
            return Err(Error::Config("kafka.bootstrap_servers is empty".to_string()));
        }
        if self.kafka.topic.trim().is_empty() {
            return Err(Error::Config("kafka.topic is empty".to_string()));
        }
        if !SECURITY_PROTOCOLS.contains(&self.kafka.security_protocol.as_str()) {
            return Err(Error::Config(format!(
                "kafka.security_protocol '{}' is not one of {}",
                self.kafka.security_protocol,
                SECURITY_PROTOCOLS.join(", ")
            )));
        }
        if self.kafka.security_protocol.starts_with("SASL")
            && self.kafka.username.as_deref().unwrap_or_default().is_empty()
        {
            return Err(Error::Config(format!(
                "kafka.username is required with {}",
                self.kafka.security_protocol
            )));
        }
        if self.producer.queue_capacity == 0 {
            return Err(Error::Config("producer.queue_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Render as TOML with secrets masked
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut redacted = self.clone();
        for secret in [&mut redacted.kafka.password, &mut redacted.registry.password] {
            if secret.is_some() {
                *secret = Some("********".to_string());
            }
        }
        toml::to_string_pretty(&redacted).map_err(|e| Error::Config(e.to_string()))
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}
