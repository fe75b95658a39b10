//! Store Layer - the document-store contract consumed by the engine
//!
//! The engine never talks to a driver directly. It holds a base `Store`,
//! duplicates short-lived `Session`s from it, and reaches collections through
//! those sessions:
//! - `Store::duplicate` → exclusive session
//! - `Session::ping` → liveness probe
//! - `Session::find` → lazily consumed `Cursor`
//! - `Session::close` → release
//!
//! Two implementations ship with the crate: `MemoryStore` (fault injection
//! for tests) and `SqliteStore` (JSON documents in a single SQLite table).

pub mod memory;
pub mod schema;
pub mod sqlite;

pub use memory::{MemoryStore, PingFault};
pub use sqlite::SqliteStore;

use crate::document::{Document, Filter, FindOptions};

/// Result type for driver-level operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by a document store driver
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no reachable servers")]
    Unreachable,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cursor is closed")]
    CursorClosed,

    #[error("session lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Whether the failure says the whole backend is gone rather than one
    /// probe failing. `markers` are matched against the error text.
    pub fn is_cluster_unreachable(&self, markers: &[String]) -> bool {
        if matches!(self, StoreError::Unreachable) {
            return true;
        }
        let text = self.to_string();
        markers.iter().any(|m| text.contains(m.as_str()))
    }
}

/// A base connection to a document store.
pub trait Store: Send + Sync {
    /// Duplicate the base connection into a fresh, exclusive session.
    fn duplicate(&self) -> StoreResult<Box<dyn Session>>;
}

/// An exclusive session against the store.
pub trait Session: Send {
    /// Lightweight liveness probe
    fn ping(&self) -> StoreResult<()>;

    /// Start a lazy fetch over a collection
    fn find(&self, collection: &str, options: &FindOptions) -> StoreResult<Box<dyn Cursor>>;

    fn insert(&self, collection: &str, document: &Document) -> StoreResult<()>;

    /// Replace the first document matching `filter`, or insert if none does
    fn upsert(&self, collection: &str, filter: &Filter, document: &Document) -> StoreResult<()>;

    /// Release the session. Called once; further use is an error.
    fn close(&mut self) -> StoreResult<()>;

    /// Fetch every document matching `filter` in natural order.
    fn find_all(&self, collection: &str, filter: &Filter) -> StoreResult<Vec<Document>> {
        let mut cursor = self.find(collection, &FindOptions::filtered(filter.clone()))?;
        let mut documents = Vec::new();
        let drained = loop {
            match cursor.next_document() {
                Ok(Some(doc)) => documents.push(doc),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        let closed = cursor.close();
        drained?;
        closed?;
        Ok(documents)
    }
}

/// Forward-only iteration over a fetch. Not restartable.
pub trait Cursor: Send {
    /// Next document, or `None` once exhausted
    fn next_document(&mut self) -> StoreResult<Option<Document>>;

    fn close(&mut self) -> StoreResult<()>;
}

/// A named collection reached through a session.
#[derive(Clone, Copy)]
pub struct Collection<'s> {
    session: &'s dyn Session,
    name: &'s str,
}

impl<'s> Collection<'s> {
    pub fn new(session: &'s dyn Session, name: &'s str) -> Self {
        Self { session, name }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn find(&self, options: &FindOptions) -> StoreResult<Box<dyn Cursor>> {
        self.session.find(self.name, options)
    }

    pub fn find_all(&self, filter: &Filter) -> StoreResult<Vec<Document>> {
        self.session.find_all(self.name, filter)
    }

    pub fn insert(&self, document: &Document) -> StoreResult<()> {
        self.session.insert(self.name, document)
    }

    pub fn upsert(&self, filter: &Filter, document: &Document) -> StoreResult<()> {
        self.session.upsert(self.name, filter, document)
    }
}
