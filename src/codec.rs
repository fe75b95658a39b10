//! Record Codec
//!
//! Two forms of the same entity:
//! - storage form: keyed by storage name, every declared field, as persisted
//! - external form: keyed by external tag, omitted fields dropped, embeds nested
//!
//! Decoding checks each declared field against its `FieldKind`; a mismatch is
//! a decode error, never a partial record.

use serde_json::Value;

use crate::document::Document;
use crate::record::{Embed, Record};
use crate::schema::{EntityDescriptor, FieldKind, SchemaRegistry};
use crate::{Error, Result};

/// Converts between raw documents and records for registered entities.
#[derive(Clone, Copy)]
pub struct RecordCodec<'a> {
    registry: &'a SchemaRegistry,
}

impl<'a> RecordCodec<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Decode a document read from the store into a caller-facing record.
    ///
    /// Omitted fields are dropped.
    pub fn decode(&self, entity: &str, raw: Document) -> Result<Record> {
        let descriptor = self.registry.lookup(entity)?;
        Ok(redact(descriptor, decode_with(descriptor, raw)?))
    }

    /// Encode a record (and its embeds) into the external form
    pub fn encode(&self, record: &Record) -> Result<Document> {
        let descriptor = self.registry.lookup(record.entity())?;
        let mut out = Document::new();
        for field in &descriptor.fields {
            if let Some(tag) = field.external_name() {
                let value = record.get(&field.name).cloned().unwrap_or(Value::Null);
                out.insert(tag.to_string(), value);
            }
        }

        for (name, embed) in record.embeds() {
            let value = match embed {
                Embed::One(related) => Value::Object(self.encode(related)?),
                Embed::Many(related) => Value::Array(
                    related
                        .iter()
                        .map(|r| self.encode(r).map(Value::Object))
                        .collect::<Result<Vec<_>>>()?,
                ),
            };
            out.insert(name.clone(), value);
        }
        Ok(out)
    }

    /// Build a record from a caller-supplied external document.
    ///
    /// Omitted fields cannot be set this way and are left absent.
    pub fn from_external(&self, entity: &str, external: Document) -> Result<Record> {
        let descriptor = self.registry.lookup(entity)?;
        let mut fields = Document::new();
        for field in &descriptor.fields {
            if let Some(value) = field.external_name().and_then(|tag| external.get(tag)) {
                fields.insert(field.name.clone(), value.clone());
            }
        }
        decode_with(descriptor, fields)
    }

    /// Storage form of a record, ready to persist
    pub fn to_storage(&self, record: &Record) -> Result<Document> {
        let descriptor = self.registry.lookup(record.entity())?;
        Ok(descriptor
            .fields
            .iter()
            .filter_map(|f| record.get(&f.name).map(|v| (f.name.clone(), v.clone())))
            .collect())
    }
}

/// Strip every omitted field from a record
pub fn redact(descriptor: &EntityDescriptor, mut record: Record) -> Record {
    for field in descriptor.fields.iter().filter(|f| f.is_omitted()) {
        record.remove(&field.name);
    }
    record
}

/// Decode against a known descriptor, keeping the full storage form.
///
/// Undeclared keys are dropped. Omitted fields stay, since relation keys may
/// live in them; pass the result through `redact` before handing it out.
pub fn decode_with(descriptor: &EntityDescriptor, mut raw: Document) -> Result<Record> {
    let mut fields = Document::new();
    for field in &descriptor.fields {
        let Some(value) = raw.remove(&field.name) else {
            continue;
        };
        if !kind_accepts(field.kind, &value) {
            return Err(Error::Decode {
                entity: descriptor.name.clone(),
                field: field.name.clone(),
                reason: format!("expected {}, got {}", field.kind, type_name(&value)),
            });
        }
        fields.insert(field.name.clone(), value);
    }
    Ok(Record::new(descriptor.name.clone(), fields))
}

fn kind_accepts(kind: FieldKind, value: &Value) -> bool {
    match (kind, value) {
        (_, Value::Null) | (FieldKind::Any, _) => true,
        (FieldKind::String, Value::String(_)) => true,
        (FieldKind::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
        (FieldKind::Float, Value::Number(_)) => true,
        (FieldKind::Bool, Value::Bool(_)) => true,
        (FieldKind::StringList, Value::Array(items)) => items.iter().all(Value::is_string),
        (FieldKind::List, Value::Array(_)) => true,
        (FieldKind::Document, Value::Object(_)) => true,
        _ => false,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
