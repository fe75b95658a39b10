//! Embed Resolver
//!
//! Attaches related records to a base record. Resolution order (first match
//! wins):
//! 1. Reference on the base entity → one fetch on the target, by key
//!    (single key → exactly one record, key list → every match)
//! 2. Link group shared with the target → fetch link records for the base
//!    key, collect the target keys they hold, fetch the targets
//! 3. Otherwise the embed is not resolvable
//!
//! Every fetch runs on its own probed session, released on every path.

use serde_json::Value;

use crate::codec;
use crate::document::{Filter, PRIMARY_KEY};
use crate::record::{Embed, Record};
use crate::schema::{EntityDescriptor, Reference, SchemaRegistry};
use crate::session::{self, DiagnosticSink, SessionPolicy};
use crate::store::Store;
use crate::{Error, Result};

/// How an embed name resolves for a given base entity
#[derive(Debug, Clone, Copy)]
pub enum EmbedPlan<'a> {
    /// 1:1 or 1:n through a reference field
    Reference {
        target: &'a EntityDescriptor,
        reference: &'a Reference,
    },
    /// m:n through a link entity
    Link {
        link: &'a EntityDescriptor,
        target: &'a EntityDescriptor,
    },
}

impl EmbedPlan<'_> {
    pub fn target(&self) -> &EntityDescriptor {
        match self {
            EmbedPlan::Reference { target, .. } | EmbedPlan::Link { target, .. } => target,
        }
    }

    /// Short label for logs
    pub fn shape(&self) -> &'static str {
        match self {
            EmbedPlan::Reference { reference, .. } if reference.is_list => "one-to-many",
            EmbedPlan::Reference { .. } => "one-to-one",
            EmbedPlan::Link { .. } => "many-to-many",
        }
    }
}

/// Resolves embeds against a store
pub struct EmbedResolver<'a> {
    registry: &'a SchemaRegistry,
    store: &'a dyn Store,
    policy: &'a SessionPolicy,
    sink: &'a dyn DiagnosticSink,
}

impl<'a> EmbedResolver<'a> {
    pub fn new(
        registry: &'a SchemaRegistry,
        store: &'a dyn Store,
        policy: &'a SessionPolicy,
        sink: &'a dyn DiagnosticSink,
    ) -> Self {
        Self {
            registry,
            store,
            policy,
            sink,
        }
    }

    /// Decide how `embed` resolves from `base`. Touches only the schema.
    pub fn plan(&self, base: &str, embed: &str) -> Result<EmbedPlan<'a>> {
        let base_table = self.registry.lookup(base)?;
        let embed = embed.to_lowercase();
        let not_resolvable = || Error::EmbedNotResolvable {
            entity: base_table.name.clone(),
            embed: embed.clone(),
        };

        if let Some(reference) = base_table.refs.get(&embed) {
            let target = self.registry.lookup(&embed)?;
            return Ok(EmbedPlan::Reference { target, reference });
        }

        let group = self
            .registry
            .find_link_table(&base_table.name, &embed)
            .ok_or_else(not_resolvable)?;
        let link = self.registry.lookup(group).map_err(|_| not_resolvable())?;
        if !link.foreigns.contains_key(&base_table.name) || !link.foreigns.contains_key(&embed) {
            return Err(not_resolvable());
        }
        let target = self.registry.lookup(&embed)?;
        Ok(EmbedPlan::Link { link, target })
    }

    /// Resolve `embed` for one base record
    pub fn resolve(&self, base: &Record, embed: &str) -> Result<Embed> {
        let plan = self.plan(base.entity(), embed)?;
        self.resolve_planned(base, &plan)
    }

    /// Resolve with a plan computed up front
    pub fn resolve_planned(&self, base: &Record, plan: &EmbedPlan<'_>) -> Result<Embed> {
        match plan {
            EmbedPlan::Reference { target, reference } => self.follow_reference(base, target, reference),
            EmbedPlan::Link { link, target } => self.follow_link(base, link, target),
        }
    }

    fn follow_reference(&self, base: &Record, target: &EntityDescriptor, reference: &Reference) -> Result<Embed> {
        let key = base.get(&reference.field).cloned().unwrap_or(Value::Null);

        if reference.is_list {
            let keys = match key {
                Value::Array(keys) => keys,
                Value::Null => Vec::new(),
                single => vec![single],
            };
            if keys.is_empty() {
                return Ok(Embed::Many(Vec::new()));
            }
            let records = self.fetch(target, &Filter::In(reference.remote.clone(), keys))?;
            return Ok(Embed::Many(redact_all(target, records)));
        }

        if key.is_null() {
            return Err(Error::NotFound(format!(
                "{}.{} holds no key",
                base.entity(),
                reference.field
            )));
        }
        let filter = Filter::Eq(reference.remote.clone(), key);
        let related = self.fetch(target, &filter)?.into_iter().next();
        match related {
            Some(record) => Ok(Embed::One(Box::new(codec::redact(target, record)))),
            None => Err(Error::NotFound(format!("no {} matching {}", target.name, filter))),
        }
    }

    fn follow_link(&self, base: &Record, link: &EntityDescriptor, target: &EntityDescriptor) -> Result<Embed> {
        let not_resolvable = || Error::EmbedNotResolvable {
            entity: base.entity().to_string(),
            embed: target.name.clone(),
        };
        let base_foreign = link.foreigns.get(base.entity()).ok_or_else(not_resolvable)?;
        let target_foreign = link.foreigns.get(&target.name).ok_or_else(not_resolvable)?;

        let base_key = base.get(&base_foreign.remote).cloned().unwrap_or(Value::Null);
        if base_key.is_null() {
            return Ok(Embed::Many(Vec::new()));
        }

        let link_records = self.fetch(link, &Filter::Eq(base_foreign.field.clone(), base_key))?;

        let mut keys: Vec<Value> = Vec::with_capacity(link_records.len());
        for record in &link_records {
            match record.get(&target_foreign.field) {
                Some(key) if !key.is_null() && !keys.contains(key) => keys.push(key.clone()),
                _ => {}
            }
        }
        if keys.is_empty() {
            return Ok(Embed::Many(Vec::new()));
        }

        let records = self.fetch(target, &Filter::In(target_foreign.remote.clone(), keys))?;
        Ok(Embed::Many(redact_all(target, dedup_by_primary_key(records))))
    }

    /// One fetch on its own session. Records come back in storage form.
    fn fetch(&self, entity: &EntityDescriptor, filter: &Filter) -> Result<Vec<Record>> {
        tracing::debug!("embed fetch on {}: {}", entity.name, filter);
        let session = session::acquire(self.store, self.policy, self.sink)?;
        let documents = session.collection(entity.collection()).find_all(filter)?;
        documents
            .into_iter()
            .map(|doc| codec::decode_with(entity, doc))
            .collect()
    }
}

fn redact_all(entity: &EntityDescriptor, records: Vec<Record>) -> Vec<Record> {
    records.into_iter().map(|r| codec::redact(entity, r)).collect()
}

/// Keep the first record per primary key; records without one are kept.
fn dedup_by_primary_key(records: Vec<Record>) -> Vec<Record> {
    let mut seen: Vec<Value> = Vec::new();
    records
        .into_iter()
        .filter(|record| match record.get(PRIMARY_KEY) {
            Some(id) if seen.contains(id) => false,
            Some(id) => {
                seen.push(id.clone());
                true
            }
            None => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityDef, FieldDef};
    use crate::session::TracingSink;
    use crate::store::{MemoryStore, Session};
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntityDef::new("User")
                    .field(FieldDef::string("_id").link("usergroup"))
                    .field(FieldDef::string("roleId").references("role", "_id"))
                    .field(FieldDef::string_list("tagIds").references("tag", "name")),
            )
            .unwrap();
        registry
            .register(EntityDef::new("Role").field(FieldDef::string("_id")).field(FieldDef::string("name")))
            .unwrap();
        registry
            .register(EntityDef::new("Tag").field(FieldDef::string("_id")).field(FieldDef::string("name")))
            .unwrap();
        registry
            .register(
                EntityDef::new("Group")
                    .field(FieldDef::string("_id").link("usergroup"))
                    .field(FieldDef::string("name")),
            )
            .unwrap();
        registry
            .register(
                EntityDef::new("UserGroup")
                    .field(FieldDef::string("_id"))
                    .field(FieldDef::string("uid").foreign("user", "_id"))
                    .field(FieldDef::string("gid").foreign("group", "_id")),
            )
            .unwrap();
        registry
    }

    fn insert(session: &dyn Session, collection: &str, value: Value) {
        session.insert(collection, value.as_object().unwrap()).unwrap();
    }

    fn user(id: &str, role: &str, tags: Value) -> Record {
        let fields = json!({"_id": id, "roleId": role, "tagIds": tags});
        Record::new("user", fields.as_object().unwrap().clone())
    }

    #[test]
    fn test_plan_shapes() {
        let registry = registry();
        let store = MemoryStore::new();
        let policy = SessionPolicy::default();
        let resolver = EmbedResolver::new(&registry, &store, &policy, &TracingSink);

        assert_eq!(resolver.plan("user", "role").unwrap().shape(), "one-to-one");
        assert_eq!(resolver.plan("user", "tag").unwrap().shape(), "one-to-many");
        assert_eq!(resolver.plan("User", "Group").unwrap().shape(), "many-to-many");
        assert_eq!(resolver.plan("group", "user").unwrap().target().name, "user");
        assert!(matches!(
            resolver.plan("role", "user"),
            Err(Error::EmbedNotResolvable { .. })
        ));
        assert!(matches!(resolver.plan("ghost", "user"), Err(Error::EntityNotFound(_))));
    }

    #[test]
    fn test_missing_single_reference_is_not_found() {
        let registry = registry();
        let store = MemoryStore::new();
        let policy = SessionPolicy::default();
        let resolver = EmbedResolver::new(&registry, &store, &policy, &TracingSink);

        let err = resolver.resolve(&user("u1", "nope", json!([])), "role").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(store.open_sessions(), 0);
    }

    #[test]
    fn test_reference_list_keeps_store_order() {
        let registry = registry();
        let store = MemoryStore::new();
        let session = store.duplicate().unwrap();
        insert(&*session, "tag", json!({"_id": "t2", "name": "tag2"}));
        insert(&*session, "tag", json!({"_id": "t1", "name": "tag1"}));
        insert(&*session, "tag", json!({"_id": "t3", "name": "tag3"}));

        let policy = SessionPolicy::default();
        let resolver = EmbedResolver::new(&registry, &store, &policy, &TracingSink);

        let embed = resolver.resolve(&user("u1", "r", json!(["tag1", "tag2"])), "tag").unwrap();
        let names: Vec<_> = embed.as_many().unwrap().iter().map(|r| r.get_str("name").unwrap()).collect();
        assert_eq!(names, vec!["tag2", "tag1"]);

        let embed = resolver.resolve(&user("u1", "r", json!(["tag9"])), "tag").unwrap();
        assert!(embed.as_many().unwrap().is_empty());
    }

    #[test]
    fn test_link_dedups_targets() {
        let registry = registry();
        let store = MemoryStore::new();
        let session = store.duplicate().unwrap();
        insert(&*session, "group", json!({"_id": "g1", "name": "group1"}));
        insert(&*session, "usergroup", json!({"_id": "l1", "uid": "u1", "gid": "g1"}));
        insert(&*session, "usergroup", json!({"_id": "l2", "uid": "u1", "gid": "g1"}));

        let policy = SessionPolicy::default();
        let resolver = EmbedResolver::new(&registry, &store, &policy, &TracingSink);

        let embed = resolver.resolve(&user("u1", "r", json!([])), "group").unwrap();
        assert_eq!(embed.len(), 1);

        let embed = resolver.resolve(&user("u2", "r", json!([])), "group").unwrap();
        assert!(embed.is_empty());
    }

    #[test]
    fn test_dedup_by_primary_key() {
        let rec = |id: Value| Record::new("tag", json!({"_id": id}).as_object().unwrap().clone());
        let records = vec![rec(json!("a")), rec(json!("b")), rec(json!("a"))];
        assert_eq!(dedup_by_primary_key(records).len(), 2);
    }
}
