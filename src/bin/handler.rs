//! Kafka Avro Handler CLI
//!
//! Runs single messages through the handler against a local registry and an
//! in-memory broker, and manages the local registry and configuration.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use kafka_avro_handler::codec;
use kafka_avro_handler::envelope;
use kafka_avro_handler::registry::resolve_subject;
use kafka_avro_handler::{
    CodecRegistry, DeliveryReport, HandlerConfig, InboundMessage, LocalRegistry, MemoryBroker,
    MessageHandler, MessageMetadata, SchemaRole,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kafka-avro-handler")]
#[command(about = "Decode Avro Kafka records and publish correlated responses")]
struct Cli {
    /// Configuration file layered over the default locations
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle one message read from files and publish the response
    Process {
        /// File holding the raw key bytes
        #[arg(short, long)]
        key: Option<PathBuf>,
        /// File holding the raw value bytes
        #[arg(short, long)]
        value: Option<PathBuf>,
        /// Topic the message was consumed from
        #[arg(long, default_value = "incoming-topic")]
        topic: String,
        #[arg(long, default_value_t = 0)]
        partition: i32,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Show the subjects the outbound serializers resolve to
    Subject,

    /// Register schemas in the local registry
    Register {
        /// Role to register (defaults to both outbound roles)
        #[arg(short, long, value_enum)]
        role: Option<RoleArg>,
        /// Explicit schema id, mirroring an upstream registry
        #[arg(long, requires = "role")]
        id: Option<u32>,
    },

    /// Decode a framed or unframed record file
    Inspect {
        /// File holding the raw bytes
        file: PathBuf,
        #[arg(short, long, value_enum, default_value = "inbound-value")]
        role: RoleArg,
    },

    /// Print the effective configuration with secrets masked
    Config {
        /// Save the effective configuration to this file instead
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    InboundKey,
    InboundValue,
    OutboundKey,
    OutboundValue,
}

impl From<RoleArg> for SchemaRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::InboundKey => SchemaRole::InboundKey,
            RoleArg::InboundValue => SchemaRole::InboundValue,
            RoleArg::OutboundKey => SchemaRole::OutboundKey,
            RoleArg::OutboundValue => SchemaRole::OutboundValue,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let config = match HandlerConfig::load_from(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli.command, config) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands, config: HandlerConfig) -> anyhow::Result<()> {
    match command {
        Commands::Process {
            key,
            value,
            topic,
            partition,
            offset,
        } => {
            let message = InboundMessage {
                key: key.map(read_bytes).transpose()?,
                value: value.map(read_bytes).transpose()?,
                metadata: MessageMetadata {
                    topic,
                    partition,
                    offset,
                    timestamp: Some(chrono::Utc::now().timestamp_millis()),
                },
            };
            process(config, &message)
        }

        Commands::Subject => {
            let topic = &config.kafka.topic;
            println!("📋 Subjects for topic '{}'", topic);
            println!(
                "  key:   {}",
                resolve_subject(topic, SchemaRole::OutboundKey, config.schemas.key_subject.as_deref())
            );
            println!(
                "  value: {}",
                resolve_subject(topic, SchemaRole::OutboundValue, config.schemas.value_subject.as_deref())
            );
            Ok(())
        }

        Commands::Register { role, id } => {
            let schemas = CodecRegistry::load(&config.schemas.paths())?;
            let registry = LocalRegistry::open(&config.registry.path)?;
            let roles = match role {
                Some(role) => vec![SchemaRole::from(role)],
                None => vec![SchemaRole::OutboundKey, SchemaRole::OutboundValue],
            };

            for role in roles {
                let override_subject = match role {
                    SchemaRole::OutboundKey => config.schemas.key_subject.as_deref(),
                    SchemaRole::OutboundValue => config.schemas.value_subject.as_deref(),
                    _ => None,
                };
                let subject = resolve_subject(&config.kafka.topic, role, override_subject);
                let definition = schemas.get(role);
                let registered = match id {
                    Some(id) => registry.register_with_id(&subject, definition, id)?,
                    None => registry.register(&subject, definition)?,
                };
                println!(
                    "✅ {} -> {} v{} (id {}, {})",
                    definition.name(),
                    registered.subject,
                    registered.version,
                    registered.id,
                    registered.fingerprint.short()
                );
            }
            Ok(())
        }

        Commands::Inspect { file, role } => {
            let role = SchemaRole::from(role);
            let schemas = CodecRegistry::load(&config.schemas.paths())?;
            let raw = read_bytes(file)?;

            let framed = envelope::strip(&raw);
            match framed.schema_id {
                Some(id) => println!("🔍 Framed record, schema id {}", id),
                None => println!("🔍 Unframed record"),
            }
            let record = codec::decode(framed.payload, &schemas.get(role).schema)
                .with_context(|| format!("Failed to decode as {}", role))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }

        Commands::Config { output } => {
            match output {
                Some(path) => {
                    config.save(&path)?;
                    println!("✅ Configuration saved to {}", path);
                }
                None => print!("{}", config.to_redacted_toml()?),
            }
            Ok(())
        }
    }
}

fn process(config: HandlerConfig, message: &InboundMessage) -> anyhow::Result<()> {
    let flush_timeout = config.producer.flush_timeout();
    let registry = LocalRegistry::open(&config.registry.path)?;
    let broker = Arc::new(MemoryBroker::default());
    let handler = MessageHandler::new(config, &registry, broker.clone())
        .context("Handler startup failed; are the outbound schemas registered?")?;

    let handled = handler.handle(message)?;
    println!("{}", serde_json::to_string_pretty(&handled.response)?);

    let remaining = handler.producer().flush(flush_timeout);
    if remaining > 0 {
        bail!("{} messages still unacknowledged after flush", remaining);
    }
    match handled.receipt.try_outcome() {
        Some(DeliveryReport::Delivered { metadata, .. }) => println!(
            "📬 Delivered to {} [{}] at offset {}",
            metadata.topic, metadata.partition, metadata.offset
        ),
        Some(DeliveryReport::Failed { error, .. }) => bail!("Delivery failed: {}", error),
        None => bail!("No delivery outcome"),
    }

    handler.shutdown();
    Ok(())
}

fn read_bytes(path: PathBuf) -> anyhow::Result<Vec<u8>> {
    fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))
}
