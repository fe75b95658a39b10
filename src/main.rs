//! Relmap CLI - relation-aware queries over a SQLite document store

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use relmap::config::{self, RelmapConfig};
use relmap::{Document, Engine, Filter, Query, Selector, SortKey, SqliteStore};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "relmap")]
#[command(version = "0.0.1")]
#[command(about = "Relation-aware query layer over a schemaless document store")]
#[command(long_about = r#"
Relmap reads entity declarations from relmap.toml and answers queries that
pull a base entity together with its related data:
  • one-to-one and one-to-many references
  • many-to-many links through a link entity
  • paging, sorting and field selection

Example usage:
  relmap relations
  relmap insert user --doc '{"_id": "u1", "name": "user", "roleId": "r1"}'
  relmap query user --embed role --embed group --limit 10
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the database file (overrides the config)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config file
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Print the registered relations as JSON
    Relations,

    /// Query an entity and its embeds
    Query {
        /// Base entity name
        entity: String,

        /// Primary keys to fetch (overrides --filter)
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,

        /// Filter document, e.g. '{"name": {"$in": ["a", "b"]}}'
        #[arg(short, long)]
        filter: Option<String>,

        /// Fields to return
        #[arg(short, long, value_delimiter = ',')]
        select: Vec<String>,

        /// Sort keys; prefix with '-' for descending
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        sort: Vec<String>,

        /// Rows to skip
        #[arg(long, default_value = "0")]
        skip: usize,

        /// Maximum number of rows
        #[arg(short, long)]
        limit: Option<usize>,

        /// Related entities to embed
        #[arg(short, long)]
        embed: Vec<String>,
    },

    /// Insert a document (storage form)
    Insert {
        entity: String,

        /// Document as JSON
        #[arg(long)]
        doc: String,
    },

    /// Replace the document matching a filter, inserting if none matches
    Upsert {
        entity: String,

        /// Filter document
        #[arg(short, long)]
        filter: String,

        /// Document as JSON
        #[arg(long)]
        doc: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Commands::Init { force } = cli.command {
        let path = cli.config.unwrap_or_else(config::default_config_path);
        config::write_config(&path, &RelmapConfig::default(), force)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let settings = config::load_config(cli.config.as_deref())?.ok_or_else(|| {
        anyhow::anyhow!("no config found (run `relmap init` or pass --config)")
    })?;
    let database = cli.database.unwrap_or_else(|| settings.database_path());
    let engine = open_engine(&settings, &database)?;

    match cli.command {
        Commands::Init { .. } => {}

        Commands::Relations => {
            println!("{}", engine.relations()?);
        }

        Commands::Query { entity, ids, filter, select, sort, skip, limit, embed } => {
            let mut query = Query::new().ids(ids).skip(skip);
            if let Some(filter) = filter {
                query = query.filter(parse_filter(&filter)?);
            }
            if !select.is_empty() {
                query = query.select(Selector::new(select));
            }
            for key in &sort {
                query = query.sort(SortKey::parse(key));
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            for name in embed {
                query = query.embed(name);
            }

            let codec = engine.codec();
            let (records, failure) = match engine.run(&query, &entity) {
                Ok(records) => (records, None),
                Err(failure) => (failure.records, Some(failure.error)),
            };
            let rows = records
                .iter()
                .map(|r| codec.encode(r).map(Value::Object))
                .collect::<relmap::Result<Vec<_>>>()?;
            println!("{}", serde_json::to_string_pretty(&rows)?);

            if let Some(error) = failure {
                anyhow::bail!("query stopped after {} rows: {}", rows.len(), error);
            }
        }

        Commands::Insert { entity, doc } => {
            let record = engine.insert(&entity, parse_document(&doc)?)?;
            println!("{}", serde_json::to_string_pretty(&engine.codec().encode(&record)?)?);
        }

        Commands::Upsert { entity, filter, doc } => {
            let filter = parse_filter(&filter)?;
            let record = engine.upsert(&entity, &filter, parse_document(&doc)?)?;
            println!("{}", serde_json::to_string_pretty(&engine.codec().encode(&record)?)?);
        }
    }

    Ok(())
}

fn open_engine(settings: &RelmapConfig, database: &Path) -> anyhow::Result<Engine> {
    config::ensure_db_dir(database)?;
    tracing::debug!("opening {}", database.display());
    let store = SqliteStore::open(database)?.with_batch_size(settings.engine.cursor_batch_size);
    let registry = settings.build_registry()?;
    Ok(Engine::new(registry, Arc::new(store), settings.engine.clone())?)
}

fn parse_filter(text: &str) -> anyhow::Result<Filter> {
    let value: Value = serde_json::from_str(text)?;
    Ok(Filter::from_json(&value)?)
}

fn parse_document(text: &str) -> anyhow::Result<Document> {
    match serde_json::from_str(text)? {
        Value::Object(doc) => Ok(doc),
        other => anyhow::bail!("document must be a JSON object, got {}", other),
    }
}
