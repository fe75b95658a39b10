//! Document values - the flat key/value shape the store persists
//!
//! Documents are JSON objects. Filters, selectors and sort keys are the
//! small query vocabulary the engine needs from a document store:
//! - `Filter::Eq`: field equals value
//! - `Filter::In`: field is one of a set of values
//! - `Filter::And`: all sub-filters match

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// A raw document as persisted by the store.
pub type Document = Map<String, Value>;

/// Name of the primary key field every document carries.
pub const PRIMARY_KEY: &str = "_id";

/// Filter predicate evaluated by the store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filter {
    /// Matches every document
    #[default]
    All,
    /// Field equals a value
    Eq(String, Value),
    /// Field is one of the given values
    In(String, Vec<Value>),
    /// Every sub-filter matches
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In(field.into(), values)
    }

    /// Parse a Mongo-style filter document.
    ///
    /// `{"name": "a", "tags": {"$in": ["x", "y"]}}` becomes
    /// `And([Eq(name, "a"), In(tags, [x, y])])`. An empty object matches all.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = match value {
            Value::Null => return Ok(Filter::All),
            Value::Object(obj) => obj,
            other => return Err(Error::Schema(format!("filter must be an object, got {}", other))),
        };

        let mut clauses = Vec::with_capacity(obj.len());
        for (field, cond) in obj {
            let clause = match cond {
                Value::Object(op) if op.len() == 1 && op.contains_key("$in") => match &op["$in"] {
                    Value::Array(values) => Filter::In(field.clone(), values.clone()),
                    other => {
                        return Err(Error::Schema(format!("$in on `{}` expects an array, got {}", field, other)));
                    }
                },
                Value::Object(op) if op.keys().any(|k| k.starts_with('$')) => {
                    return Err(Error::Schema(format!("unsupported operator on `{}`", field)));
                }
                other => Filter::Eq(field.clone(), other.clone()),
            };
            clauses.push(clause);
        }

        Ok(match clauses.len() {
            0 => Filter::All,
            1 => clauses.remove(0),
            _ => Filter::And(clauses),
        })
    }

    /// Evaluate the filter against a document.
    ///
    /// An array-valued field matches when any of its elements matches.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, expected) => field_matches(doc.get(field), |v| v == expected),
            Filter::In(field, values) => field_matches(doc.get(field), |v| values.contains(v)),
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
        }
    }
}

fn field_matches(actual: Option<&Value>, pred: impl Fn(&Value) -> bool) -> bool {
    match actual {
        None => pred(&Value::Null),
        Some(v @ Value::Array(items)) => pred(v) || items.iter().any(&pred),
        Some(v) => pred(v),
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::All => write!(f, "{{}}"),
            Filter::Eq(field, value) => write!(f, "{{{}: {}}}", field, value),
            Filter::In(field, values) => write!(f, "{{{}: {{$in: {}}}}}", field, Value::Array(values.clone())),
            Filter::And(filters) => {
                let parts: Vec<String> = filters.iter().map(|x| x.to_string()).collect();
                write!(f, "{{$and: [{}]}}", parts.join(", "))
            }
        }
    }
}

/// Field-inclusion projection. An empty selector keeps every field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Selector {
    pub fields: Vec<String>,
}

impl Selector {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Project a document. The primary key is always kept.
    pub fn apply(&self, doc: Document) -> Document {
        if self.fields.is_empty() {
            return doc;
        }
        doc.into_iter()
            .filter(|(k, _)| k == PRIMARY_KEY || self.fields.iter().any(|f| f == k))
            .collect()
    }
}

/// A sort key. Parses `"name"` as ascending and `"-name"` as descending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self { field: field.into(), descending: false }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self { field: field.into(), descending: true }
    }

    pub fn parse(spec: &str) -> Self {
        match spec.strip_prefix('-') {
            Some(field) => Self::desc(field),
            None => Self::asc(spec.strip_prefix('+').unwrap_or(spec)),
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.descending {
            write!(f, "-{}", self.field)
        } else {
            write!(f, "{}", self.field)
        }
    }
}

/// Everything a single `find` call needs.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub filter: Filter,
    pub selector: Selector,
    pub sort: Vec<SortKey>,
    pub skip: usize,
    /// `None` means no limit
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn filtered(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }
}

/// Total order over JSON values used for sorting.
///
/// null < bool < number < string < array < object
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Compare two documents by a list of sort keys.
pub fn compare_documents(a: &Document, b: &Document, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let l = a.get(&key.field).unwrap_or(&Value::Null);
        let r = b.get(&key.field).unwrap_or(&Value::Null);
        let mut ord = compare_values(l, r);
        if key.descending {
            ord = ord.reverse();
        }
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
