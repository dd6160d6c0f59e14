//! Index administration CLI
//!
//! Operator commands for the indices of one store.
//!
//! # Usage
//!
//! ```bash
//! # Check cluster health of the store's indices
//! index-admin --name snomed --schemas schemas.json health
//!
//! # Create or migrate indices
//! index-admin --name snomed --schemas schemas.json create
//!
//! # Delete every document of two types
//! index-admin --name snomed --schemas schemas.json clear concept description
//!
//! # Change a dynamic setting
//! index-admin --name snomed --schemas schemas.json update-settings max_result_window=50000
//! ```
//!
//! # Environment Variables
//!
//! - `INDEX_NODES` - Comma separated node URLs (default: http://localhost:9200)
//! - `INDEX_NAME` - Store name
//! - `INDEX_PREFIX` - Optional index prefix
//! - `INDEX_SCHEMAS` - Path to a JSON array of schema descriptors
//! - `INDEX_USERNAME` / `INDEX_PASSWORD` - Basic auth credentials
//! - `INDEX_LOG_LEVEL` - Log level of this crate (default: debug)

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use helios_index::backends::elasticsearch::{
    ElasticsearchAuth, ElasticsearchBackend, ElasticsearchConfig,
};
use helios_index::{IndexAdmin, IndexConfig, Mappings, MigrationOutcome, SchemaDescriptor};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(name = "index-admin")]
#[command(about = "Administer the search indices of a document store", version)]
struct Cli {
    /// Elasticsearch node URLs.
    #[arg(
        long,
        env = "INDEX_NODES",
        value_delimiter = ',',
        default_value = "http://localhost:9200"
    )]
    nodes: Vec<String>,

    /// Store name.
    #[arg(long, env = "INDEX_NAME")]
    name: String,

    /// Index prefix.
    #[arg(long, env = "INDEX_PREFIX")]
    prefix: Option<String>,

    /// JSON file with an array of schema descriptors.
    #[arg(long, env = "INDEX_SCHEMAS", global = true)]
    schemas: Option<PathBuf>,

    /// Basic auth user name.
    #[arg(long, env = "INDEX_USERNAME")]
    username: Option<String>,

    /// Basic auth password.
    #[arg(long, env = "INDEX_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Skip TLS certificate validation.
    #[arg(long, default_value = "false")]
    insecure: bool,

    /// Log level of this crate.
    #[arg(long, env = "INDEX_LOG_LEVEL", default_value = "debug")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll cluster health of the store's indices once.
    Health,
    /// Check whether every index of the store exists.
    Exists,
    /// Create missing indices and migrate existing mappings.
    Create,
    /// Delete every index of the store.
    Delete,
    /// Delete every document of the given types.
    Clear {
        #[arg(required = true)]
        types: Vec<String>,
    },
    /// Print local and backend settings.
    Settings,
    /// Update dynamic or local settings.
    UpdateSettings {
        /// `key=value` pairs; values are parsed as JSON when possible.
        #[arg(required = true, value_parser = parse_setting)]
        values: Vec<(String, Value)>,
    },
}

fn parse_setting(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let value =
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,helios_index={}", level)));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn load_mappings(path: Option<&PathBuf>) -> anyhow::Result<Mappings> {
    let Some(path) = path else {
        return Ok(Mappings::new());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read schemas from {}", path.display()))?;
    let descriptors: Vec<SchemaDescriptor> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid schema file {}", path.display()))?;
    Ok(Mappings::from_descriptors(descriptors)?)
}

fn build_admin(cli: &Cli) -> anyhow::Result<IndexAdmin> {
    let auth = match (&cli.username, &cli.password) {
        (Some(username), Some(password)) => Some(ElasticsearchAuth::Basic {
            username: username.clone(),
            password: password.clone(),
        }),
        (None, None) => None,
        _ => bail!("--username and --password must be given together"),
    };
    let backend = ElasticsearchBackend::new(ElasticsearchConfig {
        nodes: cli.nodes.clone(),
        auth,
        disable_certificate_validation: cli.insecure,
        ..Default::default()
    })?;

    let mut config = IndexConfig::new(&cli.name);
    if let Some(prefix) = &cli.prefix {
        config = config.with_prefix(prefix);
    }
    let mappings = load_mappings(cli.schemas.as_ref())?;
    Ok(IndexAdmin::new(Arc::new(backend), config, mappings))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let admin = build_admin(&cli)?;
    info!(store = %admin.name(), indices = admin.indices().len(), "Index admin starting");

    match &cli.command {
        Command::Health => {
            let health = admin.health().await?;
            println!("status: {} (timed out: {})", health.status, health.timed_out);
        }
        Command::Exists => {
            println!("{}", admin.exists().await?);
        }
        Command::Create => {
            let report = admin.create().await?;
            for (doc_type, outcome) in &report.outcomes {
                match outcome {
                    MigrationOutcome::Created => println!("{doc_type}: created"),
                    MigrationOutcome::Unchanged => println!("{doc_type}: unchanged"),
                    MigrationOutcome::Updated { changes, reindexed } => println!(
                        "{doc_type}: updated {:?}{}",
                        changes,
                        if *reindexed { " (documents migrated)" } else { "" }
                    ),
                    MigrationOutcome::Incompatible { breaking } => {
                        println!("{doc_type}: incompatible, reindex required for {:?}", breaking)
                    }
                }
            }
        }
        Command::Delete => {
            admin.delete().await?;
            println!("deleted {}", admin.indices().join(", "));
        }
        Command::Clear { types } => {
            let types: Vec<&str> = types.iter().map(String::as_str).collect();
            admin.clear(&types).await?;
            println!("cleared {}", types.join(", "));
        }
        Command::Settings => {
            println!("{}", serde_json::to_string_pretty(&admin.settings())?);
            for (index, settings) in admin.backend_settings().await? {
                println!("{index}: {}", serde_json::to_string_pretty(&settings)?);
            }
        }
        Command::UpdateSettings { values } => {
            let updates: BTreeMap<String, Value> = values.iter().cloned().collect();
            admin.update_settings(updates).await?;
            println!("{}", serde_json::to_string_pretty(&admin.settings())?);
        }
    }

    Ok(())
}
