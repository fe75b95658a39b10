//! Runtime records and their attached embeds

use std::collections::BTreeMap;

use serde_json::Value;

use crate::document::Document;

/// Related data attached to a record under an embed name.
#[derive(Debug, Clone, PartialEq)]
pub enum Embed {
    /// One-to-one reference
    One(Box<Record>),
    /// One-to-many reference or many-to-many link, in store order
    Many(Vec<Record>),
}

impl Embed {
    pub fn as_one(&self) -> Option<&Record> {
        match self {
            Embed::One(record) => Some(record),
            Embed::Many(_) => None,
        }
    }

    pub fn as_many(&self) -> Option<&[Record]> {
        match self {
            Embed::One(_) => None,
            Embed::Many(records) => Some(records),
        }
    }

    /// Number of attached records
    pub fn len(&self) -> usize {
        match self {
            Embed::One(_) => 1,
            Embed::Many(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One decoded entity instance.
///
/// `fields` are keyed by storage name. Embeds are attached by the query
/// engine; a missing embed key means nothing was found for this row.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    entity: String,
    fields: Document,
    embeds: BTreeMap<String, Embed>,
}

impl Record {
    pub fn new(entity: impl Into<String>, fields: Document) -> Self {
        Self {
            entity: entity.into(),
            fields,
            embeds: BTreeMap::new(),
        }
    }

    /// Registry name of the entity this record belongs to
    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn fields(&self) -> &Document {
        &self.fields
    }

    pub fn into_fields(self) -> Document {
        self.fields
    }

    /// Field value by storage name
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// The primary key, if present
    pub fn id(&self) -> Option<&Value> {
        self.get(crate::document::PRIMARY_KEY)
    }

    pub fn embed(&self, name: &str) -> Option<&Embed> {
        self.embeds.get(name)
    }

    pub fn embeds(&self) -> &BTreeMap<String, Embed> {
        &self.embeds
    }

    pub fn set_embed(&mut self, name: impl Into<String>, embed: Embed) {
        self.embeds.insert(name.into(), embed);
    }
}
