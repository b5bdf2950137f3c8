//! Filter evaluation against documents
//!
//! Used by the in-memory store to run `$match` stages and partial index
//! predicates. Array-valued fields match when any element satisfies the
//! comparison, as in document stores.

use super::ast::Filter;
use super::parser::FilterParser;
use crate::document::{Document, Value};
use regex::RegexBuilder;
use std::cmp::Ordering;

/// Evaluates filters against documents
#[derive(Debug, Default, Clone, Copy)]
pub struct FilterEvaluator;

impl FilterEvaluator {
    /// Create a new evaluator
    pub fn new() -> Self {
        Self
    }

    /// Check if a document matches a filter
    pub fn matches(&self, doc: &Document, filter: &Filter) -> Result<bool, FilterEvalError> {
        match filter {
            Filter::Empty => Ok(true),

            Filter::Eq { field, value } => Ok(self.any_candidate(doc, field, |v| v.loosely_equals(value))
                || (value.is_null() && doc.get_by_path(field).is_none())),

            Filter::Ne { field, value } => {
                let eq = Filter::Eq {
                    field: field.clone(),
                    value: value.clone(),
                };
                Ok(!self.matches(doc, &eq)?)
            }

            Filter::Gt { field, value } => {
                Ok(self.any_comparable(doc, field, value, |ord| ord == Ordering::Greater))
            }

            Filter::Gte { field, value } => {
                Ok(self.any_comparable(doc, field, value, |ord| ord != Ordering::Less))
            }

            Filter::Lt { field, value } => {
                Ok(self.any_comparable(doc, field, value, |ord| ord == Ordering::Less))
            }

            Filter::Lte { field, value } => {
                Ok(self.any_comparable(doc, field, value, |ord| ord != Ordering::Greater))
            }

            Filter::In { field, values } => Ok(self.any_candidate(doc, field, |v| {
                values.iter().any(|candidate| v.loosely_equals(candidate))
            })),

            Filter::Nin { field, values } => {
                let within = Filter::In {
                    field: field.clone(),
                    values: values.clone(),
                };
                Ok(!self.matches(doc, &within)?)
            }

            Filter::Exists { field, exists } => Ok(doc.get_by_path(field).is_some() == *exists),

            Filter::Regex {
                field,
                pattern,
                options,
            } => {
                let opts = options.as_deref().unwrap_or("");
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(opts.contains('i'))
                    .multi_line(opts.contains('m'))
                    .dot_matches_new_line(opts.contains('s'))
                    .build()
                    .map_err(|e| FilterEvalError::InvalidRegex(e.to_string()))?;
                Ok(self.any_candidate(doc, field, |v| {
                    v.as_str().map(|s| regex.is_match(s)).unwrap_or(false)
                }))
            }

            Filter::And(filters) => {
                for f in filters {
                    if !self.matches(doc, f)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }

            Filter::Or(filters) => {
                for f in filters {
                    if self.matches(doc, f)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }

            Filter::Not(filter) => Ok(!self.matches(doc, filter)?),

            Filter::Raw(document) => {
                let parsed = FilterParser::parse_filter(document)
                    .map_err(|e| FilterEvalError::Unsupported(e.to_string()))?;
                match parsed {
                    Filter::Raw(raw) => Err(FilterEvalError::Unsupported(raw.to_string())),
                    Filter::And(ref parts) if parts.iter().any(|p| matches!(p, Filter::Raw(_))) => {
                        Err(FilterEvalError::Unsupported(document.to_string()))
                    }
                    other => self.matches(doc, &other),
                }
            }
        }
    }

    /// The field value plus, for arrays, each element
    fn any_candidate<F>(&self, doc: &Document, field: &str, predicate: F) -> bool
    where
        F: Fn(&Value) -> bool,
    {
        match doc.get_by_path(field) {
            Some(Value::Array(items)) => {
                predicate(&Value::Array(items.clone())) || items.iter().any(|item| predicate(item))
            }
            Some(value) => predicate(value),
            None => false,
        }
    }

    /// Range comparisons only apply between values of the same kind
    fn any_comparable<F>(&self, doc: &Document, field: &str, bound: &Value, accept: F) -> bool
    where
        F: Fn(Ordering) -> bool,
    {
        self.any_candidate(doc, field, |v| {
            comparable(v, bound) && accept(v.compare(bound))
        })
    }
}

fn comparable(a: &Value, b: &Value) -> bool {
    (a.is_number() && b.is_number()) || std::mem::discriminant(a) == std::mem::discriminant(b)
}

/// Filter evaluation errors
#[derive(Debug, thiserror::Error)]
pub enum FilterEvalError {
    #[error("Invalid regex: {0}")]
    InvalidRegex(String),

    #[error("Unsupported filter operator: {0}")]
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn work() -> Document {
        Document::from_json(&json!({
            "_id": 1,
            "title": "Photosynthesis Basics",
            "likes": 42,
            "rating": 4.5,
            "tags": ["biology", "plants"],
            "author": { "name": "Lin" }
        }))
    }

    #[test]
    fn test_equality_and_arrays() {
        let eval = FilterEvaluator::new();
        let doc = work();

        assert!(eval.matches(&doc, &Filter::eq("author.name", "Lin")).unwrap());
        assert!(eval.matches(&doc, &Filter::eq("tags", "plants")).unwrap());
        assert!(eval.matches(&doc, &Filter::eq("likes", 42.0)).unwrap());
        assert!(!eval.matches(&doc, &Filter::eq("tags", "math")).unwrap());
        assert!(eval.matches(&doc, &Filter::eq("missing", Value::Null)).unwrap());
        assert!(eval.matches(&doc, &Filter::ne("tags", "math")).unwrap());
    }

    #[test]
    fn test_range_comparisons() {
        let eval = FilterEvaluator::new();
        let doc = work();

        assert!(eval.matches(&doc, &Filter::gt("likes", 10i32)).unwrap());
        assert!(eval.matches(&doc, &Filter::gte("likes", 42i32)).unwrap());
        assert!(!eval.matches(&doc, &Filter::lt("rating", 4i32)).unwrap());
        assert!(eval.matches(&doc, &Filter::lte("rating", 4.5)).unwrap());
        // strings never satisfy numeric ranges
        assert!(!eval.matches(&doc, &Filter::gt("title", 0i32)).unwrap());
    }

    #[test]
    fn test_logical_operators() {
        let eval = FilterEvaluator::new();
        let doc = work();

        let filter = Filter::and(vec![
            Filter::in_values("tags", vec![Value::from("biology")]),
            Filter::or(vec![Filter::eq("likes", 0i32), Filter::exists("author", true)]),
            Filter::not(Filter::exists("deletedAt", true)),
        ]);
        assert!(eval.matches(&doc, &filter).unwrap());
        assert!(!eval
            .matches(&doc, &Filter::nin("tags", vec![Value::from("plants")]))
            .unwrap());
    }

    #[test]
    fn test_regex() {
        let eval = FilterEvaluator::new();
        let doc = work();

        let filter = Filter::Regex {
            field: "title".to_string(),
            pattern: "^photo".to_string(),
            options: Some("i".to_string()),
        };
        assert!(eval.matches(&doc, &filter).unwrap());
        assert!(eval.matches(&doc, &Filter::regex("title", "(")).is_err());
    }

    #[test]
    fn test_raw_filters() {
        let eval = FilterEvaluator::new();
        let doc = work();

        assert!(eval
            .matches(&doc, &Filter::raw(json!({ "likes": { "$gt": 40 } })))
            .unwrap());
        assert!(matches!(
            eval.matches(&doc, &Filter::raw(json!({ "$where": "true" }))),
            Err(FilterEvalError::Unsupported(_))
        ));
    }
}
