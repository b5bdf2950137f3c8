//! Parser for MongoDB-style filter and stage documents
//!
//! Converts JSON filter documents into the [`Filter`] AST. Operators that the
//! AST does not model are kept as [`Filter::Raw`] instead of being rejected.

use super::ast::{Filter, Projection, ProjectionField, Sort, SortOrder};
use crate::document::Value;
use serde_json::Value as JsonValue;

/// Filter parser for JSON documents
pub struct FilterParser;

impl FilterParser {
    /// Parse a filter from a JSON value
    pub fn parse_filter(value: &JsonValue) -> Result<Filter, FilterParseError> {
        let obj = value
            .as_object()
            .ok_or_else(|| FilterParseError::InvalidFormat("Filter must be an object".to_string()))?;

        let mut filters = Vec::new();

        for (key, val) in obj {
            let filter = match key.as_str() {
                "$and" => Filter::And(Self::parse_filter_list(key, val)?),
                "$or" => Filter::Or(Self::parse_filter_list(key, val)?),
                "$nor" => {
                    let mut list = Self::parse_filter_list(key, val)?;
                    if list.len() == 1 {
                        Filter::not(list.remove(0))
                    } else {
                        Filter::not(Filter::Or(list))
                    }
                }
                op if op.starts_with('$') => {
                    Filter::raw(serde_json::json!({ op: val.clone() }))
                }
                field => Self::parse_field_condition(field, val)?,
            };
            filters.push(filter);
        }

        Ok(match filters.len() {
            0 => Filter::Empty,
            1 => filters.remove(0),
            _ => Filter::And(filters),
        })
    }

    fn parse_filter_list(op: &str, value: &JsonValue) -> Result<Vec<Filter>, FilterParseError> {
        let arr = value
            .as_array()
            .ok_or_else(|| FilterParseError::InvalidFormat(format!("{} must be an array", op)))?;
        arr.iter().map(Self::parse_filter).collect()
    }

    /// Parse a field condition
    fn parse_field_condition(field: &str, value: &JsonValue) -> Result<Filter, FilterParseError> {
        let obj = match value {
            JsonValue::Object(obj) if obj.keys().any(|k| k.starts_with('$')) => obj,
            // Direct value comparison (equality)
            _ => return Ok(Filter::eq(field, Value::from(value))),
        };

        let mut filters = Vec::new();

        for (op, val) in obj {
            let filter = match op.as_str() {
                "$eq" => Filter::eq(field, Value::from(val)),
                "$ne" => Filter::ne(field, Value::from(val)),
                "$gt" => Filter::gt(field, Value::from(val)),
                "$gte" => Filter::gte(field, Value::from(val)),
                "$lt" => Filter::lt(field, Value::from(val)),
                "$lte" => Filter::lte(field, Value::from(val)),
                "$in" | "$nin" => {
                    let arr = val.as_array().ok_or_else(|| {
                        FilterParseError::InvalidFormat(format!("{} must be an array", op))
                    })?;
                    let values = arr.iter().map(Value::from).collect();
                    if op == "$in" {
                        Filter::in_values(field, values)
                    } else {
                        Filter::nin(field, values)
                    }
                }
                "$exists" => {
                    let exists = val.as_bool().ok_or_else(|| {
                        FilterParseError::InvalidFormat("$exists must be a boolean".to_string())
                    })?;
                    Filter::exists(field, exists)
                }
                "$regex" => {
                    let pattern = val.as_str().ok_or_else(|| {
                        FilterParseError::InvalidFormat("$regex must be a string".to_string())
                    })?;
                    Filter::Regex {
                        field: field.to_string(),
                        pattern: pattern.to_string(),
                        options: obj.get("$options").and_then(|v| v.as_str()).map(String::from),
                    }
                }
                "$options" => continue,
                "$not" => Filter::not(Self::parse_field_condition(field, val)?),
                _ => Filter::raw(serde_json::json!({ field: { op.as_str(): val.clone() } })),
            };
            filters.push(filter);
        }

        Ok(match filters.len() {
            1 => filters.remove(0),
            _ => Filter::And(filters),
        })
    }

    /// Parse a `$project` document
    pub fn parse_projection(value: &JsonValue) -> Result<Projection, FilterParseError> {
        let obj = value.as_object().ok_or_else(|| {
            FilterParseError::InvalidFormat("Projection must be an object".to_string())
        })?;

        let mut projection = Projection::new();
        for (field, spec) in obj {
            let kind = match spec {
                JsonValue::Bool(true) => ProjectionField::Include,
                JsonValue::Bool(false) => ProjectionField::Exclude,
                JsonValue::Number(n) if n.as_f64() == Some(0.0) => ProjectionField::Exclude,
                JsonValue::Number(_) => ProjectionField::Include,
                other => ProjectionField::Computed(other.clone()),
            };
            projection.fields.insert(field.clone(), kind);
        }
        Ok(projection)
    }

    /// Parse a `$sort` document
    pub fn parse_sort(value: &JsonValue) -> Result<Sort, FilterParseError> {
        let obj = value
            .as_object()
            .ok_or_else(|| FilterParseError::InvalidFormat("Sort must be an object".to_string()))?;

        let mut sort = Sort::new();
        for (field, direction) in obj {
            let order = match direction.as_i64() {
                Some(1) => SortOrder::Ascending,
                Some(-1) => SortOrder::Descending,
                _ => {
                    return Err(FilterParseError::InvalidFormat(format!(
                        "Sort direction for '{}' must be 1 or -1",
                        field
                    )))
                }
            };
            sort = sort.add(field.clone(), order);
        }
        Ok(sort)
    }
}

/// Filter parse errors
#[derive(Debug, thiserror::Error)]
pub enum FilterParseError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_simple_equality() {
        let filter = FilterParser::parse_filter(&json!({ "status": "published" })).unwrap();
        assert_eq!(filter, Filter::eq("status", "published"));
    }

    #[test]
    fn test_parse_multiple_fields() {
        let filter = FilterParser::parse_filter(&json!({ "grade": 3, "subject": "math" })).unwrap();
        assert_eq!(
            filter,
            Filter::And(vec![Filter::eq("grade", 3i64), Filter::eq("subject", "math")])
        );
    }

    #[test]
    fn test_parse_range_operators() {
        let filter = FilterParser::parse_filter(&json!({ "likes": { "$gte": 10, "$lt": 100 } })).unwrap();
        assert_eq!(
            filter,
            Filter::And(vec![Filter::gte("likes", 10i64), Filter::lt("likes", 100i64)])
        );
    }

    #[test]
    fn test_parse_logical_operators() {
        let filter = FilterParser::parse_filter(&json!({
            "$or": [ { "status": "published" }, { "featured": true } ]
        }))
        .unwrap();
        assert!(matches!(filter, Filter::Or(ref f) if f.len() == 2));

        let nor = FilterParser::parse_filter(&json!({ "$nor": [ { "deleted": true } ] })).unwrap();
        assert_eq!(nor, Filter::not(Filter::eq("deleted", true)));
    }

    #[test]
    fn test_parse_regex_with_options() {
        let filter =
            FilterParser::parse_filter(&json!({ "title": { "$regex": "^photo", "$options": "i" } })).unwrap();
        assert_eq!(
            filter,
            Filter::Regex {
                field: "title".to_string(),
                pattern: "^photo".to_string(),
                options: Some("i".to_string()),
            }
        );
    }

    #[test]
    fn test_unknown_operators_become_raw() {
        let filter = FilterParser::parse_filter(&json!({ "$text": { "$search": "cells" } })).unwrap();
        assert_eq!(filter, Filter::raw(json!({ "$text": { "$search": "cells" } })));

        let field_op = FilterParser::parse_filter(&json!({ "tags": { "$size": 2 } })).unwrap();
        assert_eq!(field_op, Filter::raw(json!({ "tags": { "$size": 2 } })));
    }

    #[test]
    fn test_parse_errors() {
        assert!(FilterParser::parse_filter(&json!([1, 2])).is_err());
        assert!(FilterParser::parse_filter(&json!({ "$and": { "a": 1 } })).is_err());
        assert!(FilterParser::parse_sort(&json!({ "a": 2 })).is_err());
    }

    #[test]
    fn test_parse_projection_and_sort() {
        let projection =
            FilterParser::parse_projection(&json!({ "title": 1, "_id": 0, "score": { "$add": [1, 2] } })).unwrap();
        assert_eq!(projection.fields.get("title"), Some(&ProjectionField::Include));
        assert_eq!(projection.fields.get("_id"), Some(&ProjectionField::Exclude));
        assert!(matches!(projection.fields.get("score"), Some(ProjectionField::Computed(_))));

        let sort = FilterParser::parse_sort(&json!({ "likes": -1 })).unwrap();
        assert_eq!(sort, Sort::new().desc("likes"));
    }
}
