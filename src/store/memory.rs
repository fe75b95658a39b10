//! In-memory document store
//!
//! Collections are vectors of documents in insertion order, which is the
//! store's natural fetch order. Faults can be scripted so the session
//! wrapper and release discipline can be exercised deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use super::{Cursor, Session, Store, StoreError, StoreResult};
use crate::document::{compare_documents, Document, Filter, FindOptions};

/// A scripted liveness-probe failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingFault {
    /// Probe times out; the backend may recover
    Timeout,
    /// The whole cluster is gone
    Unreachable,
}

impl PingFault {
    fn to_error(self) -> StoreError {
        match self {
            PingFault::Timeout => StoreError::Connection("ping timed out".to_string()),
            PingFault::Unreachable => StoreError::Unreachable,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    pings: VecDeque<PingFault>,
    closes: usize,
    /// collection → finds allowed before every further find fails
    finds: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct Inner {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    faults: Mutex<Faults>,
    open_sessions: AtomicUsize,
    open_cursors: AtomicUsize,
    pings: AtomicUsize,
}

/// In-memory store with fault injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` liveness probes fail with `fault`.
    pub fn fail_pings(&self, count: usize, fault: PingFault) {
        if let Ok(mut faults) = self.inner.faults.lock() {
            faults.pings.extend(std::iter::repeat_n(fault, count));
        }
    }

    /// Make the next `count` session closes report an error.
    pub fn fail_closes(&self, count: usize) {
        if let Ok(mut faults) = self.inner.faults.lock() {
            faults.closes += count;
        }
    }

    /// Let `allowed` finds on `collection` succeed, then fail every later one.
    pub fn fail_finds_after(&self, collection: &str, allowed: usize) {
        if let Ok(mut faults) = self.inner.faults.lock() {
            faults.finds.insert(collection.to_string(), allowed);
        }
    }

    /// Sessions duplicated but not yet closed
    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    /// Cursors opened but not yet closed
    pub fn open_cursors(&self) -> usize {
        self.inner.open_cursors.load(Ordering::SeqCst)
    }

    /// Total liveness probes issued
    pub fn ping_count(&self) -> usize {
        self.inner.pings.load(Ordering::SeqCst)
    }

    /// Number of documents in a collection
    pub fn count(&self, collection: &str) -> usize {
        self.inner
            .collections
            .read()
            .map(|c| c.get(collection).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }
}

impl Store for MemoryStore {
    fn duplicate(&self) -> StoreResult<Box<dyn Session>> {
        self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            inner: Arc::clone(&self.inner),
            closed: false,
        }))
    }
}

struct MemorySession {
    inner: Arc<Inner>,
    closed: bool,
}

impl MemorySession {
    fn check_open(&self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::Connection("session already closed".to_string()));
        }
        Ok(())
    }

    fn check_find_fault(&self, collection: &str) -> StoreResult<()> {
        let mut faults = self.inner.faults.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(allowed) = faults.finds.get_mut(collection) {
            if *allowed == 0 {
                return Err(StoreError::Query(format!("injected find failure on {}", collection)));
            }
            *allowed -= 1;
        }
        Ok(())
    }
}

impl Session for MemorySession {
    fn ping(&self) -> StoreResult<()> {
        self.check_open()?;
        self.inner.pings.fetch_add(1, Ordering::SeqCst);
        let fault = self.inner.faults.lock().map_err(|_| StoreError::Poisoned)?.pings.pop_front();
        match fault {
            Some(fault) => Err(fault.to_error()),
            None => Ok(()),
        }
    }

    fn find(&self, collection: &str, options: &FindOptions) -> StoreResult<Box<dyn Cursor>> {
        self.check_open()?;
        self.check_find_fault(collection)?;

        let collections = self.inner.collections.read().map_err(|_| StoreError::Poisoned)?;
        let mut matched: Vec<Document> = collections
            .get(collection)
            .map(|docs| docs.iter().filter(|d| options.filter.matches(d)).cloned().collect())
            .unwrap_or_default();

        if !options.sort.is_empty() {
            matched.sort_by(|a, b| compare_documents(a, b, &options.sort));
        }

        let limit = options.limit.unwrap_or(usize::MAX);
        let documents: VecDeque<Document> = matched
            .into_iter()
            .skip(options.skip)
            .take(limit)
            .map(|d| options.selector.apply(d))
            .collect();

        self.inner.open_cursors.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryCursor {
            inner: Arc::clone(&self.inner),
            documents,
            closed: false,
        }))
    }

    fn insert(&self, collection: &str, document: &Document) -> StoreResult<()> {
        self.check_open()?;
        let mut collections = self.inner.collections.write().map_err(|_| StoreError::Poisoned)?;
        collections.entry(collection.to_string()).or_default().push(document.clone());
        Ok(())
    }

    fn upsert(&self, collection: &str, filter: &Filter, document: &Document) -> StoreResult<()> {
        self.check_open()?;
        let mut collections = self.inner.collections.write().map_err(|_| StoreError::Poisoned)?;
        let docs = collections.entry(collection.to_string()).or_default();
        match docs.iter_mut().find(|d| filter.matches(d)) {
            Some(existing) => *existing = document.clone(),
            None => docs.push(document.clone()),
        }
        Ok(())
    }

    fn close(&mut self) -> StoreResult<()> {
        self.check_open()?;
        self.closed = true;
        self.inner.open_sessions.fetch_sub(1, Ordering::SeqCst);

        let mut faults = self.inner.faults.lock().map_err(|_| StoreError::Poisoned)?;
        if faults.closes > 0 {
            faults.closes -= 1;
            return Err(StoreError::Connection("injected close failure".to_string()));
        }
        Ok(())
    }
}

struct MemoryCursor {
    inner: Arc<Inner>,
    documents: VecDeque<Document>,
    closed: bool,
}

impl Cursor for MemoryCursor {
    fn next_document(&mut self) -> StoreResult<Option<Document>> {
        if self.closed {
            return Err(StoreError::CursorClosed);
        }
        Ok(self.documents.pop_front())
    }

    fn close(&mut self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::CursorClosed);
        }
        self.closed = true;
        self.inner.open_cursors.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Selector, SortKey};
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().unwrap().clone()
    }

    fn seeded() -> (MemoryStore, Box<dyn Session>) {
        let store = MemoryStore::new();
        let session = store.duplicate().unwrap();
        for (id, name) in [("1", "c"), ("2", "a"), ("3", "b")] {
            session.insert("tag", &doc(json!({"_id": id, "name": name}))).unwrap();
        }
        (store, session)
    }

    #[test]
    fn test_natural_order_and_paging() {
        let (_store, session) = seeded();

        let all = session.find_all("tag", &Filter::All).unwrap();
        let names: Vec<_> = all.iter().map(|d| d["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);

        let options = FindOptions {
            sort: vec![SortKey::asc("name")],
            skip: 1,
            limit: Some(1),
            selector: Selector::new(["name"]),
            ..FindOptions::default()
        };
        let mut cursor = session.find("tag", &options).unwrap();
        let first = cursor.next_document().unwrap().unwrap();
        assert_eq!(first["name"], "b");
        assert!(cursor.next_document().unwrap().is_none());
        cursor.close().unwrap();
    }

    #[test]
    fn test_upsert_replaces_or_inserts() {
        let (store, session) = seeded();

        session.upsert("tag", &Filter::eq("_id", "2"), &doc(json!({"_id": "2", "name": "z"}))).unwrap();
        session.upsert("tag", &Filter::eq("_id", "9"), &doc(json!({"_id": "9", "name": "y"}))).unwrap();

        assert_eq!(store.count("tag"), 4);
        let found = session.find_all("tag", &Filter::eq("_id", "2")).unwrap();
        assert_eq!(found[0]["name"], "z");
    }

    #[test]
    fn test_fault_injection_and_counters() {
        let (store, mut session) = seeded();
        assert_eq!(store.open_sessions(), 1);

        store.fail_pings(1, PingFault::Timeout);
        assert!(session.ping().is_err());
        assert!(session.ping().is_ok());
        assert_eq!(store.ping_count(), 2);

        store.fail_finds_after("tag", 1);
        assert!(session.find_all("tag", &Filter::All).is_ok());
        assert!(session.find_all("tag", &Filter::All).is_err());
        assert_eq!(store.open_cursors(), 0);

        store.fail_closes(1);
        assert!(session.close().is_err());
        assert_eq!(store.open_sessions(), 0);
    }
}
