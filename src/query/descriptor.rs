//! Query descriptor - what to fetch and which embeds to attach

use std::fmt;

use serde_json::Value;

use crate::document::{Filter, FindOptions, Selector, SortKey, PRIMARY_KEY};
use crate::schema::EntityDescriptor;

/// Default cap on rows returned by one query
pub const DEFAULT_MAX_LIMIT: usize = 100;

/// A single high-level query against one base entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Primary keys to fetch directly; overrides `filter` when non-empty
    pub ids: Vec<String>,
    pub filter: Filter,
    pub selector: Selector,
    pub sort: Vec<SortKey>,
    pub skip: usize,
    /// Requested row count; capped at the engine maximum
    pub limit: Option<usize>,
    /// Related entity names to resolve per row, in order
    pub embeds: Vec<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn select(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    pub fn sort(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn embed(mut self, name: impl Into<String>) -> Self {
        self.embeds.push(name.into());
        self
    }

    /// The filter actually sent to the store
    pub fn finder(&self) -> Filter {
        if self.ids.is_empty() {
            return self.filter.clone();
        }
        Filter::In(
            PRIMARY_KEY.to_string(),
            self.ids.iter().cloned().map(Value::String).collect(),
        )
    }

    /// Requested limit, capped at `max`. Zero or unset means `max`.
    pub fn effective_limit(&self, max: usize) -> usize {
        match self.limit {
            Some(limit) if limit > 0 => limit.min(max),
            _ => max,
        }
    }

    /// Selector without fields the entity hides from callers
    pub fn trimmed_selector(&self, entity: &EntityDescriptor) -> Selector {
        Selector {
            fields: self
                .selector
                .fields
                .iter()
                .filter(|name| !entity.field(name).is_some_and(|f| f.is_omitted()))
                .cloned()
                .collect(),
        }
    }

    /// Find options for the base fetch
    pub fn find_options(&self, entity: &EntityDescriptor, max_limit: usize) -> FindOptions {
        FindOptions {
            filter: self.finder(),
            selector: self.trimmed_selector(entity),
            sort: self.sort.clone(),
            skip: self.skip,
            limit: Some(self.effective_limit(max_limit)),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sort: Vec<String> = self.sort.iter().map(SortKey::to_string).collect();
        write!(
            f,
            "finder: {}, sort: [{}], selector: [{}], skip: {}, limit: {}, embeds: [{}]",
            self.finder(),
            sort.join(", "),
            self.selector.fields.join(", "),
            self.skip,
            self.limit.map(|l| l.to_string()).unwrap_or_else(|| "default".to_string()),
            self.embeds.join(", ")
        )
    }
}
