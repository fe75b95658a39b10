//! Schema Registry
//!
//! Turns entity descriptions into descriptors keyed by lower-cased entity
//! name. Each descriptor indexes the entity's relations by the *other*
//! entity's name (or by link-group name for links), which is all the embed
//! resolver needs to plan follow-up fetches.

use std::collections::BTreeMap;

use serde::Serialize;

use super::entity::{EntityDef, FieldDef, Relation};
use crate::{Error, Result};

/// Direct pointer to another entity's records (1:1 or 1:n)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reference {
    /// Local field holds a collection of keys
    pub is_list: bool,
    /// Local storage key
    pub field: String,
    /// Remote storage key matched against
    pub remote: String,
}

/// Membership in a many-to-many link group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    pub field: String,
}

/// Link-entity field holding one participant's key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Foreign {
    /// Local storage key
    pub field: String,
    /// Local external tag (`None` when omitted)
    pub tag: Option<String>,
    /// Remote storage key matched against
    pub remote: String,
}

/// Everything the engine knows about one entity kind. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct EntityDescriptor {
    pub name: String,
    #[serde(skip)]
    pub fields: Vec<FieldDef>,
    pub refs: BTreeMap<String, Reference>,
    pub links: BTreeMap<String, Link>,
    pub foreigns: BTreeMap<String, Foreign>,
}

impl EntityDescriptor {
    /// Build a descriptor from a validated description
    fn from_def(def: EntityDef) -> Result<Self> {
        def.validate()?;
        let name = def.key();

        let mut refs = BTreeMap::new();
        let mut links = BTreeMap::new();
        let mut foreigns = BTreeMap::new();

        for field in &def.fields {
            let Some(relation) = field.relation() else {
                continue;
            };
            let duplicate = match relation {
                Relation::Reference { entity, remote } => refs
                    .insert(
                        entity.clone(),
                        Reference {
                            is_list: field.kind.is_list(),
                            field: field.name.clone(),
                            remote: remote.clone(),
                        },
                    )
                    .map(|_| entity),
                Relation::Link { name: group } => links
                    .insert(group.clone(), Link { field: field.name.clone() })
                    .map(|_| group),
                Relation::Foreign { entity, remote } => foreigns
                    .insert(
                        entity.clone(),
                        Foreign {
                            field: field.name.clone(),
                            tag: field.external_name().map(str::to_string),
                            remote: remote.clone(),
                        },
                    )
                    .map(|_| entity),
            };
            if let Some(target) = duplicate {
                return Err(Error::Schema(format!(
                    "entity `{}` declares more than one {} to `{}`",
                    name,
                    relation.shape(),
                    target
                )));
            }
        }

        Ok(Self {
            name,
            fields: def.fields,
            refs,
            links,
            foreigns,
        })
    }

    /// Field by storage key
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Collection holding this entity's documents
    pub fn collection(&self) -> &str {
        &self.name
    }
}

/// Registry of entity descriptors.
///
/// Populated once at startup, then shared read-only.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    tables: BTreeMap<String, EntityDescriptor>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity description
    pub fn register(&mut self, def: EntityDef) -> Result<()> {
        let descriptor = EntityDescriptor::from_def(def)?;
        if self.tables.contains_key(&descriptor.name) {
            return Err(Error::Schema(format!("entity `{}` is already registered", descriptor.name)));
        }
        tracing::info!(
            "registered entity {} ({} refs, {} links, {} foreigns)",
            descriptor.name,
            descriptor.refs.len(),
            descriptor.links.len(),
            descriptor.foreigns.len()
        );
        self.tables.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Look up a descriptor by (case-insensitive) entity name
    pub fn lookup(&self, name: &str) -> Result<&EntityDescriptor> {
        self.tables
            .get(&name.to_lowercase())
            .ok_or_else(|| Error::EntityNotFound(name.to_string()))
    }

    /// First link group shared by both entities, if any.
    ///
    /// Groups are scanned in name order, so the answer does not depend on
    /// argument order.
    pub fn find_link_table(&self, a: &str, b: &str) -> Option<&str> {
        let a = self.tables.get(&a.to_lowercase())?;
        let b = self.tables.get(&b.to_lowercase())?;
        a.links
            .keys()
            .find(|group| b.links.contains_key(*group))
            .map(String::as_str)
    }

    /// Cross-entity checks, run once every entity is registered.
    ///
    /// References and foreign keys must point at registered entities and at
    /// fields those entities actually persist.
    pub fn validate(&self) -> Result<()> {
        for table in self.tables.values() {
            for (target, reference) in &table.refs {
                self.check_remote(&table.name, target, &reference.remote)?;
            }
            for (target, foreign) in &table.foreigns {
                self.check_remote(&table.name, target, &foreign.remote)?;
            }
            for group in table.links.keys() {
                self.check_link_group(&table.name, group)?;
            }
        }
        Ok(())
    }

    /// A link group needs a registered link entity holding a foreign key
    /// back to every participant.
    fn check_link_group(&self, participant: &str, group: &str) -> Result<()> {
        let link = self.tables.get(group).ok_or_else(|| {
            Error::Schema(format!(
                "`{}` joins link group `{}`, but no entity `{}` is registered",
                participant, group, group
            ))
        })?;
        if !link.foreigns.contains_key(participant) {
            return Err(Error::Schema(format!(
                "link entity `{}` has no foreign key to `{}`",
                group, participant
            )));
        }
        Ok(())
    }

    fn check_remote(&self, from: &str, target: &str, remote: &str) -> Result<()> {
        let remote_table = self.tables.get(target).ok_or_else(|| {
            Error::Schema(format!("`{}` relates to unregistered entity `{}`", from, target))
        })?;
        if remote_table.field(remote).is_none() {
            return Err(Error::Schema(format!(
                "`{}` relates to `{}.{}`, which `{}` does not persist",
                from, target, remote, target
            )));
        }
        Ok(())
    }

    /// All descriptors in name order
    pub fn entities(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Pretty JSON dump of every descriptor's relations
    pub fn relations(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.tables)?)
    }
}
