//! Filter, projection and sort definitions shared by pipeline stages
//!
//! Filters are a small recursive AST rather than open-ended maps. Operators
//! that are not modelled are carried verbatim in [`Filter::Raw`].

use crate::document::{Value, ID_FIELD};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Filter conditions for `$match` stages and partial indexes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", content = "args")]
pub enum Filter {
    /// Empty filter (matches all documents)
    Empty,

    /// Equality: field == value
    Eq { field: String, value: Value },

    /// Not equal: field != value
    Ne { field: String, value: Value },

    /// Greater than: field > value
    Gt { field: String, value: Value },

    /// Greater than or equal: field >= value
    Gte { field: String, value: Value },

    /// Less than: field < value
    Lt { field: String, value: Value },

    /// Less than or equal: field <= value
    Lte { field: String, value: Value },

    /// In: field in [values]
    In { field: String, values: Vec<Value> },

    /// Not in: field not in [values]
    Nin { field: String, values: Vec<Value> },

    /// Exists: field exists (or not)
    Exists { field: String, exists: bool },

    /// Regex: field matches pattern
    Regex {
        field: String,
        pattern: String,
        options: Option<String>,
    },

    /// Logical AND: all conditions must match
    And(Vec<Filter>),

    /// Logical OR: at least one condition must match
    Or(Vec<Filter>),

    /// Logical NOT: condition must not match
    Not(Box<Filter>),

    /// Store-specific filter document passed through untouched
    Raw(serde_json::Value),
}

impl Filter {
    /// Create an equality filter
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a not-equal filter
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a greater-than filter
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a greater-than-or-equal filter
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gte {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a less-than filter
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create a less-than-or-equal filter
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lte {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Create an in filter
    pub fn in_values(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::In {
            field: field.into(),
            values,
        }
    }

    /// Create a not-in filter
    pub fn nin(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::Nin {
            field: field.into(),
            values,
        }
    }

    /// Create an exists filter
    pub fn exists(field: impl Into<String>, exists: bool) -> Self {
        Self::Exists {
            field: field.into(),
            exists,
        }
    }

    /// Create a regex filter
    pub fn regex(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Regex {
            field: field.into(),
            pattern: pattern.into(),
            options: None,
        }
    }

    /// Create an AND filter
    pub fn and(filters: Vec<Filter>) -> Self {
        Self::And(filters)
    }

    /// Create an OR filter
    pub fn or(filters: Vec<Filter>) -> Self {
        Self::Or(filters)
    }

    /// Create a NOT filter
    pub fn not(filter: Filter) -> Self {
        Self::Not(Box::new(filter))
    }

    /// Wrap a store-specific filter document
    pub fn raw(document: serde_json::Value) -> Self {
        Self::Raw(document)
    }

    /// Check if this filter is empty (matches all)
    pub fn is_empty(&self) -> bool {
        matches!(self, Filter::Empty)
    }

    /// The field a single-field comparison applies to
    pub fn field(&self) -> Option<&str> {
        match self {
            Filter::Eq { field, .. }
            | Filter::Ne { field, .. }
            | Filter::Gt { field, .. }
            | Filter::Gte { field, .. }
            | Filter::Lt { field, .. }
            | Filter::Lte { field, .. }
            | Filter::In { field, .. }
            | Filter::Nin { field, .. }
            | Filter::Exists { field, .. }
            | Filter::Regex { field, .. } => Some(field.as_str()),
            _ => None,
        }
    }

    /// All fields referenced by this filter, sorted and deduplicated.
    ///
    /// Returns `None` when the filter contains a raw document with a top-level
    /// operator (`$expr`, `$text`, `$where`, ...) whose inputs cannot be known.
    pub fn fields(&self) -> Option<Vec<String>> {
        let mut fields = BTreeSet::new();
        if self.collect_fields(&mut fields) {
            Some(fields.into_iter().collect())
        } else {
            None
        }
    }

    fn collect_fields(&self, fields: &mut BTreeSet<String>) -> bool {
        match self {
            Filter::Empty => true,
            Filter::And(filters) | Filter::Or(filters) => {
                filters.iter().all(|f| f.collect_fields(fields))
            }
            Filter::Not(filter) => filter.collect_fields(fields),
            Filter::Raw(document) => match document.as_object() {
                Some(obj) => {
                    for key in obj.keys() {
                        if key.starts_with('$') {
                            return false;
                        }
                        fields.insert(key.clone());
                    }
                    true
                }
                None => false,
            },
            other => {
                if let Some(field) = other.field() {
                    fields.insert(field.to_string());
                }
                true
            }
        }
    }

    /// Top-level conjuncts, with nested ANDs flattened and empties dropped
    pub fn conjuncts(&self) -> Vec<Filter> {
        match self {
            Filter::Empty => Vec::new(),
            Filter::And(filters) => filters.iter().flat_map(|f| f.conjuncts()).collect(),
            other => vec![other.clone()],
        }
    }

    /// Merge into a single filter that requires both sides to match
    pub fn conjoin(&self, other: &Filter) -> Filter {
        let mut conjuncts = self.conjuncts();
        conjuncts.extend(other.conjuncts());
        Self::from_conjuncts(conjuncts)
    }

    /// Merge where `other`'s top-level keys replace this filter's.
    ///
    /// Conjuncts of `self` whose key also appears in `other` are dropped, so a
    /// later `{score: {$lt: 5}}` replaces an earlier `{score: {$gt: 1}}`.
    pub fn overwrite(&self, other: &Filter) -> Filter {
        let later = other.conjuncts();
        let replaced: BTreeSet<String> = later.iter().filter_map(|f| f.overwrite_key()).collect();

        let mut conjuncts: Vec<Filter> = self
            .conjuncts()
            .into_iter()
            .filter(|f| match f.overwrite_key() {
                Some(key) => !replaced.contains(&key),
                None => true,
            })
            .collect();
        conjuncts.extend(later);
        Self::from_conjuncts(conjuncts)
    }

    fn overwrite_key(&self) -> Option<String> {
        match self {
            Filter::Or(_) => Some("$or".to_string()),
            Filter::Not(_) => Some("$nor".to_string()),
            Filter::Raw(document) => match document.as_object() {
                Some(obj) if obj.len() == 1 => obj.keys().next().cloned(),
                _ => None,
            },
            other => other.field().map(str::to_string),
        }
    }

    fn from_conjuncts(mut conjuncts: Vec<Filter>) -> Filter {
        match conjuncts.len() {
            0 => Filter::Empty,
            1 => conjuncts.remove(0),
            _ => Filter::And(conjuncts),
        }
    }

    /// Render as a MongoDB-style filter document
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;

        let op = |field: &str, name: &str, value: serde_json::Value| json!({ field: { name: value } });
        let list = |values: &[Value]| serde_json::Value::Array(values.iter().map(Value::to_json).collect());

        match self {
            Filter::Empty => json!({}),
            Filter::Eq { field, value } => json!({ field: value.to_json() }),
            Filter::Ne { field, value } => op(field, "$ne", value.to_json()),
            Filter::Gt { field, value } => op(field, "$gt", value.to_json()),
            Filter::Gte { field, value } => op(field, "$gte", value.to_json()),
            Filter::Lt { field, value } => op(field, "$lt", value.to_json()),
            Filter::Lte { field, value } => op(field, "$lte", value.to_json()),
            Filter::In { field, values } => op(field, "$in", list(values.as_slice())),
            Filter::Nin { field, values } => op(field, "$nin", list(values.as_slice())),
            Filter::Exists { field, exists } => op(field, "$exists", json!(exists)),
            Filter::Regex {
                field,
                pattern,
                options,
            } => match options {
                Some(options) => json!({ field: { "$regex": pattern, "$options": options } }),
                None => op(field, "$regex", json!(pattern)),
            },
            Filter::And(filters) => {
                let rendered: Vec<serde_json::Value> = filters.iter().map(Filter::to_json).collect();
                match flatten_conjuncts(&rendered) {
                    Some(merged) => serde_json::Value::Object(merged),
                    None => json!({ "$and": rendered }),
                }
            }
            Filter::Or(filters) => {
                json!({ "$or": filters.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
            Filter::Not(filter) => json!({ "$nor": [filter.to_json()] }),
            Filter::Raw(document) => document.clone(),
        }
    }
}

/// Field-wise union of rendered conjuncts; `None` when a key repeats
fn flatten_conjuncts(rendered: &[serde_json::Value]) -> Option<serde_json::Map<String, serde_json::Value>> {
    if rendered.is_empty() {
        return None;
    }

    let mut merged = serde_json::Map::new();
    for conjunct in rendered {
        for (key, value) in conjunct.as_object()? {
            if merged.insert(key.clone(), value.clone()).is_some() {
                return None;
            }
        }
    }
    Some(merged)
}

impl Default for Filter {
    fn default() -> Self {
        Filter::Empty
    }
}

/// True when one dotted path equals, contains or is contained by the other
pub fn paths_overlap(a: &str, b: &str) -> bool {
    a == b
        || (a.len() > b.len() && a.starts_with(b) && a.as_bytes()[b.len()] == b'.')
        || (b.len() > a.len() && b.starts_with(a) && b.as_bytes()[a.len()] == b'.')
}

/// How a projected field is produced
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ProjectionField {
    /// Keep the field (`1`)
    Include,
    /// Drop the field (`0`)
    Exclude,
    /// Compute the field from an expression
    Computed(serde_json::Value),
}

/// Projection specification (fields to include, exclude or compute)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Projection {
    pub fields: BTreeMap<String, ProjectionField>,
}

impl Projection {
    /// Create a new empty projection
    pub fn new() -> Self {
        Self::default()
    }

    /// Include a field
    pub fn include(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into(), ProjectionField::Include);
        self
    }

    /// Exclude a field
    pub fn exclude(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into(), ProjectionField::Exclude);
        self
    }

    /// Compute a field from an expression
    pub fn computed(mut self, field: impl Into<String>, expression: serde_json::Value) -> Self {
        self.fields
            .insert(field.into(), ProjectionField::Computed(expression));
        self
    }

    /// Inclusion mode: any included or computed non-`_id` field
    pub fn is_inclusion(&self) -> bool {
        self.fields.iter().any(|(name, kind)| {
            matches!(kind, ProjectionField::Include | ProjectionField::Computed(_))
                && name != ID_FIELD
        }) || (self.fields.len() == 1
            && matches!(self.fields.get(ID_FIELD), Some(ProjectionField::Include)))
    }

    /// Only `Include` entries (apart from an optional `_id` exclusion)
    pub fn is_pure_inclusion(&self) -> bool {
        !self.fields.is_empty()
            && self.fields.iter().all(|(name, kind)| match kind {
                ProjectionField::Include => true,
                ProjectionField::Exclude => name == ID_FIELD,
                ProjectionField::Computed(_) => false,
            })
    }

    /// Only `Exclude` entries
    pub fn is_pure_exclusion(&self) -> bool {
        !self.fields.is_empty()
            && self
                .fields
                .values()
                .all(|kind| matches!(kind, ProjectionField::Exclude))
    }

    /// Whether `path` reaches the next stage with exactly its input value
    pub fn passes_through(&self, path: &str) -> bool {
        let mut related = self
            .fields
            .iter()
            .filter(|(name, _)| paths_overlap(name, path));

        if self.is_inclusion() {
            let is_id = path == ID_FIELD || path.starts_with("_id.");
            let mut covered = is_id;
            for (name, kind) in related {
                match kind {
                    ProjectionField::Include => {
                        // including a sub-path only keeps part of the value
                        if name.len() > path.len() {
                            return false;
                        }
                        covered = true;
                    }
                    ProjectionField::Exclude | ProjectionField::Computed(_) => return false,
                }
            }
            covered
        } else {
            related.next().is_none()
        }
    }

    /// Render as a MongoDB-style `$project` document
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(name, kind)| {
                    let value = match kind {
                        ProjectionField::Include => serde_json::json!(1),
                        ProjectionField::Exclude => serde_json::json!(0),
                        ProjectionField::Computed(expr) => expr.clone(),
                    };
                    (name.clone(), value)
                })
                .collect(),
        )
    }
}

/// Sort specification
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Sort {
    /// Fields to sort by with their order
    pub fields: Vec<(String, SortOrder)>,
}

impl Sort {
    /// Create a new empty sort
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field to sort by
    pub fn add(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.fields.push((field.into(), order));
        self
    }

    /// Sort by field in ascending order
    pub fn asc(self, field: impl Into<String>) -> Self {
        self.add(field, SortOrder::Ascending)
    }

    /// Sort by field in descending order
    pub fn desc(self, field: impl Into<String>) -> Self {
        self.add(field, SortOrder::Descending)
    }

    /// Render as a MongoDB-style `$sort` document
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(field, order)| (field.clone(), serde_json::json!(order.direction())))
                .collect(),
        )
    }
}

/// Sort order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending order (1)
    Ascending,
    /// Descending order (-1)
    Descending,
}

impl SortOrder {
    /// Numeric direction as stores spell it
    pub fn direction(self) -> i32 {
        match self {
            SortOrder::Ascending => 1,
            SortOrder::Descending => -1,
        }
    }
}
