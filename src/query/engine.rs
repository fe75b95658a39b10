//! Query engine implementation
//!
//! Runs one high-level query:
//! - plan every requested embed against the schema; a name no relation
//!   satisfies fails the query before anything is fetched
//! - acquire a probed session and open the base cursor
//! - per row: decode, then resolve embeds in the order requested
//!
//! Rows are produced lazily by `RecordStream`; `Engine::run` drains it and
//! hands back whatever was gathered if a row fails.

use std::sync::Arc;

use super::descriptor::Query;
use super::resolver::{EmbedPlan, EmbedResolver};
use crate::codec::{self, RecordCodec};
use crate::config::EngineConfig;
use crate::document::{Document, Filter};
use crate::record::{Embed, Record};
use crate::schema::{EntityDescriptor, SchemaRegistry};
use crate::session::{self, DiagnosticSink, SessionGuard, SessionPolicy, TracingSink};
use crate::store::{Cursor, Store};
use crate::{Error, Result};

/// A query that stopped early, with the rows produced before it did.
#[derive(Debug, thiserror::Error)]
#[error("query aborted: {error}")]
pub struct QueryFailure {
    pub records: Vec<Record>,
    #[source]
    pub error: Error,
}

impl QueryFailure {
    fn empty(error: Error) -> Self {
        Self {
            records: Vec::new(),
            error,
        }
    }
}

/// Relation-aware query engine over a document store.
///
/// Cheap to share across threads: the registry is read-only and every call
/// acquires its own sessions.
pub struct Engine {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn Store>,
    config: EngineConfig,
    policy: SessionPolicy,
    sink: Arc<dyn DiagnosticSink>,
}

impl Engine {
    /// Create an engine. The registry is validated and frozen here.
    pub fn new(registry: SchemaRegistry, store: Arc<dyn Store>, config: EngineConfig) -> Result<Self> {
        registry.validate()?;
        let policy = SessionPolicy::from(&config);
        Ok(Self {
            registry: Arc::new(registry),
            store,
            config,
            policy,
            sink: Arc::new(TracingSink),
        })
    }

    /// Route suppressed release errors somewhere other than the log
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn codec(&self) -> RecordCodec<'_> {
        RecordCodec::new(&self.registry)
    }

    fn resolver(&self) -> EmbedResolver<'_> {
        EmbedResolver::new(&self.registry, &*self.store, &self.policy, &*self.sink)
    }

    fn session(&self) -> Result<SessionGuard<'_>> {
        session::acquire(&*self.store, &self.policy, &*self.sink)
    }

    /// Start a query, producing records one at a time.
    pub fn stream(&self, query: &Query, entity: &str) -> Result<RecordStream<'_>> {
        let descriptor = self.registry.lookup(entity)?;
        let resolver = self.resolver();

        let mut plans = Vec::with_capacity(query.embeds.len());
        for name in &query.embeds {
            let plan = resolver.plan(&descriptor.name, name).inspect_err(|e| {
                tracing::warn!("cannot plan embed {} on {}: {}", name, descriptor.name, e);
            })?;
            tracing::debug!("embed {} on {}: {}", name, descriptor.name, plan.shape());
            plans.push((name.to_lowercase(), plan));
        }

        let session = self.session()?;
        let options = query.find_options(descriptor, self.config.max_limit);
        tracing::debug!("query on {}: {}", descriptor.name, query);
        let cursor = session.collection(descriptor.collection()).find(&options)?;

        Ok(RecordStream {
            descriptor,
            resolver,
            plans,
            cursor: Some(cursor),
            sink: &*self.sink,
            _session: session,
        })
    }

    /// Run a query to completion.
    ///
    /// A row whose embed target is missing simply lacks that embed. Any other
    /// failure stops the query; the rows already built come back with it.
    /// Returned records never carry omitted fields.
    pub fn run(&self, query: &Query, entity: &str) -> std::result::Result<Vec<Record>, QueryFailure> {
        let mut stream = self.stream(query, entity).map_err(QueryFailure::empty)?;
        let mut records = Vec::new();
        for item in stream.by_ref() {
            match item {
                Ok(record) => records.push(record),
                Err(error) => return Err(QueryFailure { records, error }),
            }
        }
        match stream.finish() {
            Ok(()) => Ok(records),
            Err(error) => Err(QueryFailure { records, error }),
        }
    }

    /// Resolve one embed for a record fetched earlier.
    ///
    /// Relation keys held in omitted fields are gone from redacted records,
    /// so such embeds resolve as empty or not found.
    pub fn resolve_embed(&self, base: &Record, embed: &str) -> Result<Embed> {
        self.resolver().resolve(base, embed)
    }

    /// Validate and persist a storage-form document
    pub fn insert(&self, entity: &str, document: Document) -> Result<Record> {
        let descriptor = self.registry.lookup(entity)?;
        let record = codec::decode_with(descriptor, document)?;
        let stored = self.codec().to_storage(&record)?;

        let session = self.session()?;
        session.collection(descriptor.collection()).insert(&stored)?;
        Ok(codec::redact(descriptor, record))
    }

    /// Replace the first document matching `filter`, inserting if none does
    pub fn upsert(&self, entity: &str, filter: &Filter, document: Document) -> Result<Record> {
        let descriptor = self.registry.lookup(entity)?;
        let record = codec::decode_with(descriptor, document)?;
        let stored = self.codec().to_storage(&record)?;

        let session = self.session()?;
        session.collection(descriptor.collection()).upsert(filter, &stored)?;
        Ok(codec::redact(descriptor, record))
    }

    /// Every record matching `filter`, in store order, without embeds
    pub fn find(&self, entity: &str, filter: &Filter) -> Result<Vec<Record>> {
        let descriptor = self.registry.lookup(entity)?;
        let session = self.session()?;
        let documents = session.collection(descriptor.collection()).find_all(filter)?;
        documents
            .into_iter()
            .map(|doc| codec::decode_with(descriptor, doc).map(|r| codec::redact(descriptor, r)))
            .collect()
    }

    /// Pretty JSON dump of the registered relations
    pub fn relations(&self) -> Result<String> {
        self.registry.relations()
    }
}

/// Lazily produced query results. Single forward pass.
///
/// The cursor is closed before the session is released, on every path.
pub struct RecordStream<'e> {
    descriptor: &'e EntityDescriptor,
    resolver: EmbedResolver<'e>,
    plans: Vec<(String, EmbedPlan<'e>)>,
    cursor: Option<Box<dyn Cursor>>,
    sink: &'e dyn DiagnosticSink,
    _session: SessionGuard<'e>,
}

impl RecordStream<'_> {
    /// Close the cursor, reporting its close error
    pub fn finish(mut self) -> Result<()> {
        match self.cursor.take() {
            Some(mut cursor) => Ok(cursor.close()?),
            None => Ok(()),
        }
    }

    fn abort(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            if let Err(e) = cursor.close() {
                self.sink.suppressed("cursor close", &e);
            }
        }
    }

    fn build(&self, raw: Document) -> Result<Record> {
        let mut record = codec::decode_with(self.descriptor, raw)?;
        for (name, plan) in &self.plans {
            match self.resolver.resolve_planned(&record, plan) {
                Ok(embed) => record.set_embed(name.clone(), embed),
                Err(Error::NotFound(reason)) => {
                    tracing::debug!("no {} embed for row: {}", name, reason);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(codec::redact(self.descriptor, record))
    }
}

impl Iterator for RecordStream<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.cursor.as_mut()?.next_document();
        let raw = match next {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                self.abort();
                return Some(Err(e.into()));
            }
        };

        match self.build(raw) {
            Ok(record) => Some(Ok(record)),
            Err(e) => {
                self.abort();
                Some(Err(e))
            }
        }
    }
}

impl Drop for RecordStream<'_> {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SortKey;
    use crate::schema::{EntityDef, FieldDef};
    use crate::store::{MemoryStore, PingFault, SqliteStore};
    use serde_json::{json, Value};

    fn schema() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntityDef::new("User")
                    .field(FieldDef::string("_id").tag("id").link("usergroup"))
                    .field(FieldDef::string("password").omit())
                    .field(FieldDef::string("name").tag("nam"))
                    .field(FieldDef::string("roleId").references("role", "_id"))
                    .field(FieldDef::string_list("tagIds").references("tag", "name")),
            )
            .unwrap();
        registry
            .register(
                EntityDef::new("Role")
                    .field(FieldDef::string("_id").tag("id"))
                    .field(FieldDef::string("name"))
                    .field(FieldDef::string("secret").omit()),
            )
            .unwrap();
        registry
            .register(
                EntityDef::new("Tag")
                    .field(FieldDef::string("_id").omit())
                    .field(FieldDef::string("name")),
            )
            .unwrap();
        registry
            .register(
                EntityDef::new("Group")
                    .field(FieldDef::string("_id").tag("id").link("usergroup"))
                    .field(FieldDef::string("name")),
            )
            .unwrap();
        registry
            .register(
                EntityDef::new("UserGroup")
                    .field(FieldDef::string("_id").tag("id"))
                    .field(FieldDef::string("uid").foreign("user", "_id"))
                    .field(FieldDef::string("gid").foreign("group", "_id")),
            )
            .unwrap();
        registry
    }

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    fn seed(engine: &Engine) {
        engine.insert("role", doc(json!({"_id": "r1", "name": "role", "secret": "s"}))).unwrap();
        engine.insert("tag", doc(json!({"_id": "t1", "name": "tag1"}))).unwrap();
        engine.insert("tag", doc(json!({"_id": "t2", "name": "tag2"}))).unwrap();
        engine.insert("group", doc(json!({"_id": "g1", "name": "group1"}))).unwrap();
        engine.insert("group", doc(json!({"_id": "g2", "name": "group2"}))).unwrap();
        engine
            .insert(
                "user",
                doc(json!({
                    "_id": "u1",
                    "password": "1223",
                    "name": "user",
                    "roleId": "r1",
                    "tagIds": ["tag1", "tag2"]
                })),
            )
            .unwrap();
        engine.insert("usergroup", doc(json!({"_id": "l1", "uid": "u1", "gid": "g1"}))).unwrap();
        engine.insert("usergroup", doc(json!({"_id": "l2", "uid": "u1", "gid": "g2"}))).unwrap();
    }

    fn memory_engine() -> (MemoryStore, Engine) {
        let store = MemoryStore::new();
        let engine = Engine::new(schema(), Arc::new(store.clone()), EngineConfig::default()).unwrap();
        seed(&engine);
        (store, engine)
    }

    fn names(embed: &Embed) -> Vec<String> {
        embed
            .as_many()
            .unwrap()
            .iter()
            .map(|r| r.get_str("name").unwrap().to_string())
            .collect()
    }

    fn assert_embed_scenario(engine: &Engine) {
        // 1:1
        let rows = engine.run(&Query::new().embed("role"), "user").unwrap();
        assert_eq!(rows.len(), 1);
        let role = rows[0].embed("role").unwrap().as_one().unwrap();
        assert_eq!(role.get_str("name"), Some("role"));

        // 1:n
        let rows = engine.run(&Query::new().embed("tag"), "user").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(names(rows[0].embed("tag").unwrap()), vec!["tag1", "tag2"]);

        // m:n
        let rows = engine.run(&Query::new().embed("group"), "user").unwrap();
        assert_eq!(rows.len(), 1);
        let mut groups = names(rows[0].embed("group").unwrap());
        groups.sort();
        assert_eq!(groups, vec!["group1", "group2"]);
    }

    #[test]
    fn test_embed_scenario_in_memory() {
        let (store, engine) = memory_engine();
        assert_embed_scenario(&engine);
        assert_eq!(store.open_sessions(), 0);
        assert_eq!(store.open_cursors(), 0);
    }

    #[test]
    fn test_embed_scenario_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("relmap.db")).unwrap().with_batch_size(1);
        let engine = Engine::new(schema(), Arc::new(store), EngineConfig::default()).unwrap();
        seed(&engine);
        assert_embed_scenario(&engine);
    }

    #[test]
    fn test_external_form_of_embedded_row() {
        let (_store, engine) = memory_engine();
        let rows = engine.run(&Query::new().embed("role").embed("tag"), "user").unwrap();
        let external = engine.codec().encode(&rows[0]).unwrap();

        assert_eq!(external["id"], "u1");
        assert_eq!(external["nam"], "user");
        assert!(!external.contains_key("password"));
        assert_eq!(external["role"], json!({"id": "r1", "name": "role"}));
        assert_eq!(external["tag"], json!([{"name": "tag1"}, {"name": "tag2"}]));
    }

    #[test]
    fn test_missing_one_to_one_target_is_absent() {
        let (_store, engine) = memory_engine();
        engine.insert("user", doc(json!({"_id": "u2", "name": "orphan", "roleId": "gone"}))).unwrap();

        let rows = engine.run(&Query::new().ids(["u2"]).embed("role").embed("tag"), "user").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].embed("role").is_none());
        assert!(rows[0].embed("tag").unwrap().is_empty());
    }

    #[test]
    fn test_many_to_many_is_symmetric() {
        let (_store, engine) = memory_engine();
        engine.insert("user", doc(json!({"_id": "u2", "name": "other"}))).unwrap();
        engine.insert("usergroup", doc(json!({"_id": "l3", "uid": "u2", "gid": "g1"}))).unwrap();

        let links = engine.find("usergroup", &Filter::All).unwrap();
        let users = engine.run(&Query::new().embed("group"), "user").unwrap();
        let groups = engine.run(&Query::new().embed("user"), "group").unwrap();

        for link in &links {
            let (uid, gid) = (link.get("uid").unwrap(), link.get("gid").unwrap());
            let user = users.iter().find(|u| u.id() == Some(uid)).unwrap();
            let group = groups.iter().find(|g| g.id() == Some(gid)).unwrap();

            let user_groups = user.embed("group").unwrap().as_many().unwrap();
            let group_users = group.embed("user").unwrap().as_many().unwrap();
            assert!(user_groups.iter().any(|g| g.id() == Some(gid)));
            assert!(group_users.iter().any(|u| u.id() == Some(uid)));
        }
        let g1 = groups.iter().find(|g| g.get_str("name") == Some("group1")).unwrap();
        assert_eq!(g1.embed("user").unwrap().len(), 2);
    }

    #[test]
    fn test_limit_capped_and_ids_override_filter() {
        let store = MemoryStore::new();
        let config = EngineConfig {
            max_limit: 3,
            ..EngineConfig::default()
        };
        let engine = Engine::new(schema(), Arc::new(store), config).unwrap();
        for i in 0..5 {
            engine.insert("tag", doc(json!({"_id": format!("t{}", i), "name": format!("tag{}", i)}))).unwrap();
        }

        let rows = engine.run(&Query::new().limit(50), "tag").unwrap();
        assert_eq!(rows.len(), 3);

        let query = Query::new()
            .filter(Filter::eq("name", "tag0"))
            .ids(["t3", "t4"])
            .sort(SortKey::desc("name"));
        let rows = engine.run(&query, "tag").unwrap();
        let got: Vec<_> = rows.iter().map(|r| r.get_str("name").unwrap()).collect();
        assert_eq!(got, vec!["tag4", "tag3"]);
    }

    #[test]
    fn test_fetch_error_returns_partial_results() {
        let (store, engine) = memory_engine();
        engine.insert("user", doc(json!({"_id": "u2", "name": "second", "tagIds": ["tag1"]}))).unwrap();
        store.fail_finds_after("tag", 1);

        let failure = engine.run(&Query::new().embed("tag"), "user").unwrap_err();
        assert_eq!(failure.records.len(), 1);
        assert!(matches!(failure.error, Error::Store(_)));
        assert_eq!(store.open_sessions(), 0);
        assert_eq!(store.open_cursors(), 0);
    }

    #[test]
    fn test_decode_error_returns_partial_results() {
        let (store, engine) = memory_engine();
        let mut session = store.duplicate().unwrap();
        session
            .insert("user", &doc(json!({"_id": "u2", "name": "broken", "tagIds": "x"})))
            .unwrap();
        session.close().unwrap();

        let failure = engine.run(&Query::new().embed("role"), "user").unwrap_err();
        assert_eq!(failure.records.len(), 1);
        assert_eq!(failure.records[0].get_str("name"), Some("user"));
        assert!(matches!(failure.error, Error::Decode { ref field, .. } if field == "tagIds"));
        assert_eq!(store.open_sessions(), 0);
        assert_eq!(store.open_cursors(), 0);
    }

    #[test]
    fn test_unresolvable_embed_fails_the_query() {
        let (store, engine) = memory_engine();

        let failure = engine.run(&Query::new().embed("role").embed("rolex"), "user").unwrap_err();
        assert!(failure.records.is_empty());
        assert!(matches!(
            failure.error,
            Error::EmbedNotResolvable { ref embed, .. } if embed == "rolex"
        ));
        assert_eq!(store.open_sessions(), 0);

        let rows = engine.run(&Query::new().embed("role"), "user").unwrap();
        let err = engine.resolve_embed(&rows[0], "rolex").unwrap_err();
        assert!(matches!(err, Error::EmbedNotResolvable { .. }));
    }

    #[test]
    fn test_rows_never_carry_omitted_fields() {
        let (_store, engine) = memory_engine();

        let rows = engine.run(&Query::new().embed("role").embed("tag"), "user").unwrap();
        assert!(rows[0].get("password").is_none());
        assert_eq!(rows[0].get_str("roleId"), Some("r1"));

        let role = rows[0].embed("role").unwrap().as_one().unwrap();
        assert!(role.get("secret").is_none());
        assert_eq!(role.get_str("name"), Some("role"));

        let tags = rows[0].embed("tag").unwrap().as_many().unwrap();
        assert!(tags.iter().all(|t| t.id().is_none()));

        let found = engine.find("role", &Filter::All).unwrap();
        assert!(found[0].get("secret").is_none());

        let inserted = engine
            .insert("user", doc(json!({"_id": "u2", "password": "pw", "name": "second"})))
            .unwrap();
        assert!(inserted.get("password").is_none());
    }

    #[test]
    fn test_unknown_base_entity() {
        let (_store, engine) = memory_engine();
        let failure = engine.run(&Query::new(), "ghost").unwrap_err();
        assert!(failure.records.is_empty());
        assert!(matches!(failure.error, Error::EntityNotFound(_)));
    }

    #[test]
    fn test_backend_failure_is_fatal_and_distinguishable() {
        let (store, engine) = memory_engine();
        store.fail_pings(1, PingFault::Unreachable);

        let failure = engine.run(&Query::new(), "user").unwrap_err();
        assert!(failure.error.is_fatal());

        // Later calls are unaffected
        assert_eq!(engine.run(&Query::new(), "user").unwrap().len(), 1);
    }

    #[test]
    fn test_stream_dropped_early_releases_everything() {
        let (store, engine) = memory_engine();
        engine.insert("user", doc(json!({"_id": "u2", "name": "second"}))).unwrap();

        let mut stream = engine.stream(&Query::new(), "user").unwrap();
        assert!(stream.next().unwrap().is_ok());
        assert_eq!(store.open_sessions(), 1);
        assert_eq!(store.open_cursors(), 1);
        drop(stream);

        assert_eq!(store.open_sessions(), 0);
        assert_eq!(store.open_cursors(), 0);
    }

    #[test]
    fn test_upsert_and_find() {
        let (_store, engine) = memory_engine();
        let filter = Filter::eq("_id", "r1");
        engine.upsert("role", &filter, doc(json!({"_id": "r1", "name": "admin"}))).unwrap();

        let roles = engine.find("role", &Filter::All).unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].get_str("name"), Some("admin"));

        let err = engine.insert("role", doc(json!({"_id": 7}))).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_concurrent_queries() {
        let (store, engine) = memory_engine();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let rows = engine.run(&Query::new().embed("group").embed("tag"), "user").unwrap();
                    assert_eq!(rows[0].embed("group").unwrap().len(), 2);
                });
            }
        });
        assert_eq!(store.open_sessions(), 0);
    }
}
