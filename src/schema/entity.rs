//! Entity descriptions - fields, external tags and relation annotations
//!
//! Relations are declared explicitly on fields, one shape per field:
//! - `Relation::Reference`: this field holds key(s) of another entity (1:1, 1:n)
//! - `Relation::Link`: this entity takes part in a many-to-many link group
//! - `Relation::Foreign`: on a link entity, this field holds a participant's key

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{Error, Result};

/// Value shape of a field, checked when decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Int,
    Float,
    Bool,
    StringList,
    List,
    Document,
    #[default]
    Any,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Int => "int",
            FieldKind::Float => "float",
            FieldKind::Bool => "bool",
            FieldKind::StringList => "string_list",
            FieldKind::List => "list",
            FieldKind::Document => "document",
            FieldKind::Any => "any",
        }
    }

    /// Whether the field holds a collection of values
    pub fn is_list(&self) -> bool {
        matches!(self, FieldKind::StringList | FieldKind::List)
    }
}

impl FromStr for FieldKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "string" | "str" | "text" => Ok(FieldKind::String),
            "int" | "integer" => Ok(FieldKind::Int),
            "float" | "number" | "real" => Ok(FieldKind::Float),
            "bool" | "boolean" => Ok(FieldKind::Bool),
            "string_list" | "strings" | "[string]" => Ok(FieldKind::StringList),
            "list" | "array" => Ok(FieldKind::List),
            "document" | "object" | "map" => Ok(FieldKind::Document),
            "any" => Ok(FieldKind::Any),
            _ => Err(Error::Schema(format!("Unknown field kind: {}", s))),
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// External-facing name of a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalTag {
    /// Exposed under this key
    Named(String),
    /// Never exposed to callers
    Omit,
}

/// Relation annotation carried by a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "shape")]
pub enum Relation {
    /// Field holds key(s) matched against `entity.remote`
    Reference { entity: String, remote: String },
    /// Entity participates in the named link group
    Link { name: String },
    /// Link-entity field holding the key of `entity.remote`
    Foreign { entity: String, remote: String },
}

impl Relation {
    pub fn shape(&self) -> &'static str {
        match self {
            Relation::Reference { .. } => "reference",
            Relation::Link { .. } => "link",
            Relation::Foreign { .. } => "foreign",
        }
    }
}

/// Parse `entity.field` target notation (e.g. `role._id`).
pub fn parse_target(target: &str) -> Result<(String, String)> {
    match target.split_once('.') {
        Some((entity, field)) if !entity.is_empty() && !field.is_empty() => {
            Ok((entity.to_lowercase(), field.to_string()))
        }
        _ => Err(Error::Schema(format!(
            "relation target `{}` must look like `entity.field`",
            target
        ))),
    }
}

/// A single field of an entity.
///
/// `name` is the storage key; `tag` is what callers see.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub tag: ExternalTag,
    pub kind: FieldKind,
    relations: Vec<Relation>,
}

impl FieldDef {
    /// New field exposed under its storage name
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        Self {
            tag: ExternalTag::Named(name.clone()),
            name,
            kind,
            relations: Vec::new(),
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::String)
    }

    pub fn string_list(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::StringList)
    }

    /// Expose the field under a different external key
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = ExternalTag::Named(tag.into());
        self
    }

    /// Hide the field from the external form
    pub fn omit(mut self) -> Self {
        self.tag = ExternalTag::Omit;
        self
    }

    pub fn references(mut self, entity: impl Into<String>, remote: impl Into<String>) -> Self {
        self.relations.push(Relation::Reference {
            entity: entity.into().to_lowercase(),
            remote: remote.into(),
        });
        self
    }

    pub fn link(mut self, name: impl Into<String>) -> Self {
        self.relations.push(Relation::Link {
            name: name.into().to_lowercase(),
        });
        self
    }

    pub fn foreign(mut self, entity: impl Into<String>, remote: impl Into<String>) -> Self {
        self.relations.push(Relation::Foreign {
            entity: entity.into().to_lowercase(),
            remote: remote.into(),
        });
        self
    }

    /// The field's relation annotation, if any
    pub fn relation(&self) -> Option<&Relation> {
        self.relations.first()
    }

    /// External key, or `None` when omitted
    pub fn external_name(&self) -> Option<&str> {
        match &self.tag {
            ExternalTag::Named(tag) => Some(tag),
            ExternalTag::Omit => None,
        }
    }

    pub fn is_omitted(&self) -> bool {
        self.tag == ExternalTag::Omit
    }

    fn validate(&self, entity: &str) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Schema(format!("entity `{}` has a field with an empty name", entity)));
        }
        if self.relations.len() > 1 {
            let shapes: Vec<_> = self.relations.iter().map(Relation::shape).collect();
            return Err(Error::Schema(format!(
                "field `{}.{}` carries more than one relation annotation ({})",
                entity,
                self.name,
                shapes.join(", ")
            )));
        }
        Ok(())
    }
}

/// Static description of an entity kind, handed to the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl EntityDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Registry key and collection name: the lower-cased entity name
    pub fn key(&self) -> String {
        self.name.to_lowercase()
    }

    /// Check field-level invariants
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Schema("entity name must not be empty".to_string()));
        }
        for (i, field) in self.fields.iter().enumerate() {
            field.validate(&self.name)?;
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(Error::Schema(format!(
                    "entity `{}` declares field `{}` twice",
                    self.name, field.name
                )));
            }
        }
        Ok(())
    }
}
