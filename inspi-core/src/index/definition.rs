//! Declarative index definitions
//!
//! An [`IndexDefinition`] names a collection, an ordered key specification,
//! a kind tag and an options bag. The kind must agree with the options that
//! are actually set; [`IndexDefinition::validate`] checks this.

use crate::query::Filter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::BTreeMap;

/// Direction or special type of an index key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexDirection {
    Ascending,
    Descending,
    Text,
    Geo2dSphere,
    Hashed,
}

impl IndexDirection {
    /// Key value as stores spell it (`1`, `-1`, `"text"`, ...)
    pub fn to_json(self) -> JsonValue {
        match self {
            IndexDirection::Ascending => json!(1),
            IndexDirection::Descending => json!(-1),
            IndexDirection::Text => json!("text"),
            IndexDirection::Geo2dSphere => json!("2dsphere"),
            IndexDirection::Hashed => json!("hashed"),
        }
    }

    pub fn is_ordered(self) -> bool {
        matches!(self, IndexDirection::Ascending | IndexDirection::Descending)
    }
}

/// Index type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Single,
    Compound,
    Text,
    Geospatial,
    Hashed,
    Partial,
    Sparse,
    Ttl,
}

/// Index options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexOptions {
    pub unique: bool,
    /// Only index documents that have the key fields
    pub sparse: bool,
    /// Only index documents matching this filter
    pub partial_filter: Option<Filter>,
    /// TTL expiry, relative to the indexed date field
    pub expire_after_seconds: Option<u64>,
    /// Text index field weights
    pub weights: BTreeMap<String, u32>,
    pub default_language: Option<String>,
    pub background: bool,
}

/// A secondary index the application expects to exist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub collection: String,
    /// Unique within the collection
    pub name: String,
    /// Ordered key specification
    pub keys: Vec<(String, IndexDirection)>,
    pub kind: IndexKind,
    pub options: IndexOptions,
}

impl IndexDefinition {
    fn with_keys(
        collection: impl Into<String>,
        name: impl Into<String>,
        kind: IndexKind,
        keys: Vec<(String, IndexDirection)>,
    ) -> Self {
        Self {
            collection: collection.into(),
            name: name.into(),
            keys,
            kind,
            options: IndexOptions {
                background: true,
                ..IndexOptions::default()
            },
        }
    }

    /// Single ascending or descending key
    pub fn single(
        collection: impl Into<String>,
        name: impl Into<String>,
        field: impl Into<String>,
        direction: IndexDirection,
    ) -> Self {
        Self::with_keys(collection, name, IndexKind::Single, vec![(field.into(), direction)])
    }

    /// Two or more keys, in order
    pub fn compound(
        collection: impl Into<String>,
        name: impl Into<String>,
        keys: &[(&str, IndexDirection)],
    ) -> Self {
        Self::with_keys(collection, name, IndexKind::Compound, owned_keys(keys))
    }

    /// Full-text index over `fields`
    pub fn text(collection: impl Into<String>, name: impl Into<String>, fields: &[&str]) -> Self {
        let keys = fields
            .iter()
            .map(|f| (f.to_string(), IndexDirection::Text))
            .collect();
        Self::with_keys(collection, name, IndexKind::Text, keys)
    }

    /// 2dsphere index
    pub fn geospatial(
        collection: impl Into<String>,
        name: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self::with_keys(
            collection,
            name,
            IndexKind::Geospatial,
            vec![(field.into(), IndexDirection::Geo2dSphere)],
        )
    }

    pub fn hashed(collection: impl Into<String>, name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::with_keys(
            collection,
            name,
            IndexKind::Hashed,
            vec![(field.into(), IndexDirection::Hashed)],
        )
    }

    /// Index over the documents matching `filter` only
    pub fn partial(
        collection: impl Into<String>,
        name: impl Into<String>,
        keys: &[(&str, IndexDirection)],
        filter: Filter,
    ) -> Self {
        let mut definition = Self::with_keys(collection, name, IndexKind::Partial, owned_keys(keys));
        definition.options.partial_filter = Some(filter);
        definition
    }

    /// Index skipping documents without the key fields
    pub fn sparse_keys(
        collection: impl Into<String>,
        name: impl Into<String>,
        keys: &[(&str, IndexDirection)],
    ) -> Self {
        let mut definition = Self::with_keys(collection, name, IndexKind::Sparse, owned_keys(keys));
        definition.options.sparse = true;
        definition
    }

    /// Documents expire `seconds` after the date stored in `field`
    pub fn ttl(
        collection: impl Into<String>,
        name: impl Into<String>,
        field: impl Into<String>,
        seconds: u64,
    ) -> Self {
        let mut definition = Self::with_keys(
            collection,
            name,
            IndexKind::Ttl,
            vec![(field.into(), IndexDirection::Ascending)],
        );
        definition.options.expire_after_seconds = Some(seconds);
        definition
    }

    pub fn unique(mut self) -> Self {
        self.options.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.options.sparse = true;
        self
    }

    pub fn weight(mut self, field: impl Into<String>, weight: u32) -> Self {
        self.options.weights.insert(field.into(), weight);
        self
    }

    pub fn default_language(mut self, language: impl Into<String>) -> Self {
        self.options.default_language = Some(language.into());
        self
    }

    /// Key specification in store form, e.g. `{"author": 1, "createdAt": -1}`
    pub fn key_document(&self) -> JsonValue {
        let mut keys = Map::new();
        for (field, direction) in &self.keys {
            keys.insert(field.clone(), direction.to_json());
        }
        JsonValue::Object(keys)
    }

    /// Options in store form
    pub fn options_document(&self) -> JsonValue {
        let options = &self.options;
        let mut doc = Map::new();
        doc.insert("name".to_string(), json!(self.name));
        doc.insert("background".to_string(), json!(options.background));
        if options.unique {
            doc.insert("unique".to_string(), json!(true));
        }
        if options.sparse {
            doc.insert("sparse".to_string(), json!(true));
        }
        if let Some(filter) = &options.partial_filter {
            doc.insert("partialFilterExpression".to_string(), filter.to_json());
        }
        if let Some(seconds) = options.expire_after_seconds {
            doc.insert("expireAfterSeconds".to_string(), json!(seconds));
        }
        if !options.weights.is_empty() {
            doc.insert("weights".to_string(), json!(options.weights));
        }
        if let Some(language) = &options.default_language {
            doc.insert("default_language".to_string(), json!(language));
        }
        JsonValue::Object(doc)
    }

    /// Check that the kind tag agrees with the keys and options
    pub fn validate(&self) -> Result<(), CatalogError> {
        let fail = |reason: &str| {
            Err(CatalogError::InconsistentDefinition {
                collection: self.collection.clone(),
                name: self.name.clone(),
                reason: reason.to_string(),
            })
        };
        let has = |direction: IndexDirection| self.keys.iter().any(|(_, d)| *d == direction);

        if self.name.is_empty() {
            return fail("index name is empty");
        }
        if self.keys.is_empty() {
            return fail("index has no keys");
        }

        match self.kind {
            IndexKind::Single if self.keys.len() != 1 => return fail("single index needs exactly one key"),
            IndexKind::Compound if self.keys.len() < 2 => return fail("compound index needs two or more keys"),
            IndexKind::Text if !has(IndexDirection::Text) => return fail("text index needs a text key"),
            IndexKind::Geospatial if !has(IndexDirection::Geo2dSphere) => {
                return fail("geospatial index needs a 2dsphere key")
            }
            IndexKind::Hashed if self.keys.len() != 1 || !has(IndexDirection::Hashed) => {
                return fail("hashed index needs exactly one hashed key")
            }
            IndexKind::Partial if self.options.partial_filter.is_none() => {
                return fail("partial index needs a partial filter")
            }
            IndexKind::Sparse if !self.options.sparse => return fail("sparse index must set sparse"),
            IndexKind::Ttl => {
                if self.options.expire_after_seconds.is_none() {
                    return fail("ttl index needs expire_after_seconds");
                }
                if self.keys.len() != 1 || !self.keys[0].1.is_ordered() {
                    return fail("ttl index needs a single ordered key");
                }
            }
            _ => {}
        }

        if self.options.expire_after_seconds.is_some() && self.kind != IndexKind::Ttl {
            return fail("expire_after_seconds is only valid on ttl indexes");
        }
        if !self.options.weights.is_empty() && !has(IndexDirection::Text) {
            return fail("weights require a text key");
        }
        if self.options.unique && has(IndexDirection::Hashed) {
            return fail("hashed indexes cannot be unique");
        }

        Ok(())
    }
}

fn owned_keys(keys: &[(&str, IndexDirection)]) -> Vec<(String, IndexDirection)> {
    keys.iter().map(|(f, d)| (f.to_string(), *d)).collect()
}

/// Catalog consistency errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CatalogError {
    #[error("Duplicate index name '{name}' in collection '{collection}'")]
    DuplicateName { collection: String, name: String },

    #[error("Index '{collection}.{name}' is inconsistent: {reason}")]
    InconsistentDefinition {
        collection: String,
        name: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use IndexDirection::*;

    #[test]
    fn test_key_document_preserves_order() {
        let def = IndexDefinition::compound("works", "author_created", &[("author", Ascending), ("createdAt", Descending)]);
        assert_eq!(def.key_document(), json!({ "author": 1, "createdAt": -1 }));
        assert_eq!(def.keys[0].0, "author");
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_options_document() {
        let def = IndexDefinition::ttl("sessions", "expires_ttl", "expiresAt", 0);
        assert_eq!(
            def.options_document(),
            json!({ "name": "expires_ttl", "background": true, "expireAfterSeconds": 0 })
        );

        let partial = IndexDefinition::partial(
            "works",
            "published",
            &[("publishedAt", Descending)],
            Filter::eq("status", "published"),
        );
        assert_eq!(
            partial.options_document()["partialFilterExpression"],
            json!({ "status": "published" })
        );
    }

    #[test]
    fn test_validate_kind_consistency() {
        let mut ttl = IndexDefinition::ttl("sessions", "exp", "expiresAt", 60);
        assert!(ttl.validate().is_ok());
        ttl.options.expire_after_seconds = None;
        assert!(ttl.validate().is_err());

        let mut single = IndexDefinition::single("users", "email", "email", Ascending);
        single.options.expire_after_seconds = Some(10);
        assert!(single.validate().is_err());

        let mut compound = IndexDefinition::compound("users", "c", &[("a", Ascending)]);
        assert!(compound.validate().is_err());
        compound.keys.push(("b".to_string(), Descending));
        assert!(compound.validate().is_ok());

        let mut partial = IndexDefinition::partial("works", "p", &[("a", Ascending)], Filter::Empty);
        partial.options.partial_filter = None;
        assert!(partial.validate().is_err());

        let mut sparse = IndexDefinition::sparse_keys("kg", "s", &[("nodes.id", Ascending)]);
        sparse.options.sparse = false;
        assert!(sparse.validate().is_err());

        assert!(IndexDefinition::hashed("sessions", "h", "userId").unique().validate().is_err());

        let mut text = IndexDefinition::text("works", "t", &["title"]).weight("title", 10);
        assert!(text.validate().is_ok());
        text.keys = vec![("title".to_string(), Ascending)];
        assert!(text.validate().is_err());
    }
}
