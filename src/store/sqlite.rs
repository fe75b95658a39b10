//! SQLite storage implementation
//!
//! Documents are stored as JSON text in one table keyed by collection name.
//! Filters are evaluated with SQLite's JSON functions so only matching rows
//! leave the database. A cursor resolves the matching row ids once, on first
//! advance, then loads bodies for those ids in batches.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

use super::schema;
use super::{Cursor, Session, Store, StoreError, StoreResult};
use crate::document::{Document, Filter, FindOptions, Selector, SortKey};

/// Rows fetched per cursor round trip unless configured otherwise
pub const DEFAULT_BATCH_SIZE: usize = 64;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed document store.
///
/// The base "connection" is the database path; every duplicated session
/// opens its own `rusqlite::Connection`.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    batch_size: usize,
}

impl SqliteStore {
    /// Open a database file (creates it and the schema if missing)
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        for stmt in schema::all_schema_statements() {
            conn.execute(stmt, [])?;
        }
        conn.close().map_err(|(_, e)| StoreError::from(e))?;

        Ok(Self {
            path: path.to_path_buf(),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    /// Set how many rows a cursor pulls per round trip
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Store for SqliteStore {
    fn duplicate(&self) -> StoreResult<Box<dyn Session>> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Box::new(SqliteSession {
            conn: Arc::new(Mutex::new(Some(conn))),
            batch_size: self.batch_size,
        }))
    }
}

type SharedConnection = Arc<Mutex<Option<Connection>>>;

fn with_connection<T>(
    conn: &SharedConnection,
    f: impl FnOnce(&Connection) -> StoreResult<T>,
) -> StoreResult<T> {
    let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
    let conn = guard
        .as_ref()
        .ok_or_else(|| StoreError::Connection("session already closed".to_string()))?;
    f(conn)
}

struct SqliteSession {
    conn: SharedConnection,
    batch_size: usize,
}

impl Session for SqliteSession {
    fn ping(&self) -> StoreResult<()> {
        with_connection(&self.conn, |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }

    fn find(&self, collection: &str, options: &FindOptions) -> StoreResult<Box<dyn Cursor>> {
        let mut params = vec![SqlValue::Text(collection.to_string())];
        let predicate = where_clause(&options.filter, &mut params);
        let order = order_clause(&options.sort, &mut params);
        let sql = format!(
            "SELECT id FROM documents WHERE collection = ? AND {} ORDER BY {} LIMIT ? OFFSET ?",
            predicate, order
        );
        // Negative LIMIT means no limit
        let limit = options.limit.and_then(|l| i64::try_from(l).ok()).unwrap_or(-1);
        params.push(SqlValue::Integer(limit));
        params.push(SqlValue::Integer(i64::try_from(options.skip).unwrap_or(i64::MAX)));
        tracing::debug!("find on {}: {} ({} params)", collection, sql, params.len());

        // Fail fast on a closed session rather than on first advance
        with_connection(&self.conn, |_| Ok(()))?;

        Ok(Box::new(SqliteCursor {
            conn: Arc::clone(&self.conn),
            sql,
            params,
            selector: options.selector.clone(),
            ids: None,
            batch_size: self.batch_size,
            buffer: VecDeque::new(),
            closed: false,
        }))
    }

    fn insert(&self, collection: &str, document: &Document) -> StoreResult<()> {
        let body = serde_json::to_string(document)?;
        with_connection(&self.conn, |conn| {
            conn.execute(
                "INSERT INTO documents (collection, body) VALUES (?1, ?2)",
                params![collection, body],
            )?;
            Ok(())
        })
    }

    fn upsert(&self, collection: &str, filter: &Filter, document: &Document) -> StoreResult<()> {
        let body = serde_json::to_string(document)?;
        let mut params = vec![SqlValue::Text(collection.to_string())];
        let predicate = where_clause(filter, &mut params);
        let sql = format!(
            "SELECT id FROM documents WHERE collection = ? AND {} ORDER BY id LIMIT 1",
            predicate
        );

        with_connection(&self.conn, |conn| {
            let existing: Option<i64> = conn
                .query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))
                .optional()?;

            match existing {
                Some(id) => conn.execute("UPDATE documents SET body = ?1 WHERE id = ?2", params![body, id])?,
                None => conn.execute(
                    "INSERT INTO documents (collection, body) VALUES (?1, ?2)",
                    params![collection, body],
                )?,
            };
            Ok(())
        })
    }

    fn close(&mut self) -> StoreResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .take()
            .ok_or_else(|| StoreError::Connection("session already closed".to_string()))?;
        conn.close().map_err(|(_, e)| StoreError::from(e))
    }
}

struct SqliteCursor {
    conn: SharedConnection,
    sql: String,
    params: Vec<SqlValue>,
    selector: Selector,
    /// Matching row ids not yet loaded; `None` until first advance
    ids: Option<VecDeque<i64>>,
    batch_size: usize,
    buffer: VecDeque<Document>,
    closed: bool,
}

impl SqliteCursor {
    fn has_pending(&self) -> bool {
        self.ids.as_ref().is_none_or(|ids| !ids.is_empty())
    }

    /// Run the id query once. Later writes cannot reorder, skip or repeat rows.
    fn snapshot(&self) -> StoreResult<VecDeque<i64>> {
        with_connection(&self.conn, |conn| {
            let mut stmt = conn.prepare(&self.sql)?;
            let ids = stmt
                .query_map(params_from_iter(self.params.iter()), |row| row.get(0))?
                .collect::<rusqlite::Result<VecDeque<i64>>>()?;
            Ok(ids)
        })
    }

    /// Load the next batch of bodies into the buffer
    fn fill(&mut self) -> StoreResult<()> {
        if self.ids.is_none() {
            self.ids = Some(self.snapshot()?);
        }
        let batch_size = self.batch_size;
        let batch: Vec<i64> = match self.ids.as_mut() {
            Some(ids) => {
                let take = ids.len().min(batch_size);
                ids.drain(..take).collect()
            }
            None => Vec::new(),
        };
        if batch.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "SELECT id, body FROM documents WHERE id IN ({})",
            vec!["?"; batch.len()].join(", ")
        );
        let mut bodies: HashMap<i64, String> = with_connection(&self.conn, |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(batch.iter()), |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<HashMap<i64, String>>>()?;
            Ok(rows)
        })?;

        // Rows deleted since the snapshot are skipped
        for id in batch {
            if let Some(body) = bodies.remove(&id) {
                let doc: Document = serde_json::from_str(&body)?;
                self.buffer.push_back(self.selector.apply(doc));
            }
        }
        Ok(())
    }
}

impl Cursor for SqliteCursor {
    fn next_document(&mut self) -> StoreResult<Option<Document>> {
        if self.closed {
            return Err(StoreError::CursorClosed);
        }
        while self.buffer.is_empty() && self.has_pending() {
            self.fill()?;
        }
        Ok(self.buffer.pop_front())
    }

    fn close(&mut self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::CursorClosed);
        }
        self.closed = true;
        self.buffer.clear();
        self.ids = Some(VecDeque::new());
        Ok(())
    }
}

/// Render a filter as a SQL predicate, pushing bound parameters in order.
///
/// Matches the way `Filter::matches` treats values: a field matches when its
/// whole value, or any element of an array value, equals the operand. Types
/// must agree (`true` never equals `1`). Compound operands compare by their
/// compact JSON text.
fn where_clause(filter: &Filter, params: &mut Vec<SqlValue>) -> String {
    match filter {
        Filter::All => "1".to_string(),
        Filter::Eq(field, value) => field_clause(field, std::slice::from_ref(value), params),
        Filter::In(_, values) if values.is_empty() => "0".to_string(),
        Filter::In(field, values) => field_clause(field, values, params),
        Filter::And(filters) if filters.is_empty() => "1".to_string(),
        Filter::And(filters) => {
            let parts: Vec<String> = filters.iter().map(|f| where_clause(f, params)).collect();
            format!("({})", parts.join(" AND "))
        }
    }
}

fn field_clause(field: &str, values: &[Value], params: &mut Vec<SqlValue>) -> String {
    let path = schema::path_literal(field);
    let whole = any_equals(
        &format!("json_type(documents.body, {})", path),
        &format!("json_extract(documents.body, {})", path),
        values,
        params,
    );
    let element = any_equals("json_each.type", "json_each.value", values, params);
    format!(
        "({} OR (json_type(documents.body, {}) = 'array' AND EXISTS (SELECT 1 FROM json_each(documents.body, {}) WHERE {})))",
        whole, path, path, element
    )
}

/// `(type, value)` equals any of `values`. A NULL type means the field is absent.
fn any_equals(ty: &str, val: &str, values: &[Value], params: &mut Vec<SqlValue>) -> String {
    let parts: Vec<String> = values
        .iter()
        .map(|value| match value {
            Value::Null => format!("({ty} IS NULL OR {ty} = 'null')"),
            Value::Bool(true) => format!("{ty} = 'true'"),
            Value::Bool(false) => format!("{ty} = 'false'"),
            Value::Number(n) => match n.as_i64() {
                Some(i) => {
                    params.push(SqlValue::Integer(i));
                    format!("({ty} = 'integer' AND {val} = ?)")
                }
                None => {
                    params.push(SqlValue::Real(n.as_f64().unwrap_or(0.0)));
                    format!("({ty} = 'real' AND {val} = ?)")
                }
            },
            Value::String(s) => {
                params.push(SqlValue::Text(s.clone()));
                format!("({ty} = 'text' AND {val} = ?)")
            }
            Value::Array(_) => {
                params.push(SqlValue::Text(value.to_string()));
                format!("({ty} = 'array' AND {val} = ?)")
            }
            Value::Object(_) => {
                params.push(SqlValue::Text(value.to_string()));
                format!("({ty} = 'object' AND {val} = ?)")
            }
        })
        .collect();
    format!("({})", parts.join(" OR "))
}

fn order_clause(sort: &[SortKey], params: &mut Vec<SqlValue>) -> String {
    let mut parts = Vec::with_capacity(sort.len() + 1);
    for key in sort {
        params.push(SqlValue::Text(schema::field_path(&key.field)));
        let direction = if key.descending { "DESC" } else { "ASC" };
        parts.push(format!("json_extract(body, ?) {}", direction));
    }
    parts.push("id".to_string());
    parts.join(", ")
}
