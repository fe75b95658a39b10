//! # Relmap - Relation-aware queries over a schemaless document store
//!
//! Declare entities once, with the relations between them, and fetch a base
//! entity together with its related data in a single call.
//!
//! Relmap provides:
//! - A schema registry of entities, reference fields and link groups
//! - Resilient session acquisition with bounded, probed retries
//! - A record codec between storage form and caller-facing external form
//! - Embed resolution for one-to-one, one-to-many and many-to-many relations
//! - A query engine with paging, sorting, projection and partial results
//! - SQLite-backed and in-memory document stores

pub mod document;
pub mod store;
pub mod session;
pub mod schema;
pub mod record;
pub mod codec;
pub mod query;
pub mod config;

// Re-exports for convenient access
pub use document::{Document, Filter, FindOptions, Selector, SortKey};
pub use record::{Embed, Record};
pub use schema::{EntityDef, FieldDef, FieldKind, SchemaRegistry};
pub use session::{BackendError, DiagnosticSink, TracingSink};
pub use store::{MemoryStore, SqliteStore, Store, StoreError};
pub use query::{Engine, Query, QueryFailure};
pub use config::{EngineConfig, RelmapConfig};

/// Result type alias for Relmap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Relmap operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Embed `{embed}` is not resolvable from `{entity}`")]
    EmbedNotResolvable { entity: String, embed: String },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Decode error on {entity}.{field}: {reason}")]
    Decode {
        entity: String,
        field: String,
        reason: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the backend itself is gone and retrying the call is pointless
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Backend(_))
    }
}
