//! In-process pipeline evaluation
//!
//! Runs every stage kind over owned documents. Expressions support field
//! references (`"$field.path"`), literals, nested objects and arrays, and a
//! small set of operators.

use super::StoreError;
use crate::aggregation::{Accumulator, GroupSpec, LookupSpec, Pipeline, Stage, UnwindSpec};
use crate::document::{Document, Value, ID_FIELD};
use crate::query::{FilterEvaluator, Projection, ProjectionField, Sort, SortOrder};
use rand::seq::SliceRandom;
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Collections visible to `$lookup`
pub(crate) type Collections = HashMap<String, Vec<Document>>;

pub(crate) struct PipelineEvaluator<'a> {
    collections: &'a Collections,
    filters: FilterEvaluator,
    started: Instant,
    max_time: Option<Duration>,
}

impl<'a> PipelineEvaluator<'a> {
    pub(crate) fn new(collections: &'a Collections, max_time: Option<Duration>) -> Self {
        Self {
            collections,
            filters: FilterEvaluator::new(),
            started: Instant::now(),
            max_time,
        }
    }

    pub(crate) fn run(&self, mut docs: Vec<Document>, pipeline: &Pipeline) -> Result<Vec<Document>, StoreError> {
        for stage in pipeline {
            docs = self.stage(docs, stage)?;
            self.check_deadline()?;
        }
        Ok(docs)
    }

    fn check_deadline(&self) -> Result<(), StoreError> {
        match self.max_time {
            Some(limit) if self.started.elapsed() > limit => Err(StoreError::Timeout(limit)),
            _ => Ok(()),
        }
    }

    fn stage(&self, docs: Vec<Document>, stage: &Stage) -> Result<Vec<Document>, StoreError> {
        match stage {
            Stage::Match(filter) => {
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if self
                        .filters
                        .matches(&doc, filter)
                        .map_err(|e| StoreError::Execution(e.to_string()))?
                    {
                        kept.push(doc);
                    }
                }
                Ok(kept)
            }
            Stage::Group(group) => group_documents(docs, group),
            Stage::Sort(sort) => Ok(sort_documents(docs, sort)),
            Stage::Limit(n) => Ok(docs.into_iter().take(clamp(*n)).collect()),
            Stage::Skip(n) => Ok(docs.into_iter().skip(clamp(*n)).collect()),
            Stage::Project(projection) => docs.iter().map(|d| project(d, projection)).collect(),
            Stage::Lookup(lookup) => self.lookup(docs, lookup),
            Stage::Unwind(unwind) => Ok(unwind_documents(docs, unwind)),
            Stage::AddFields(fields) => docs
                .into_iter()
                .map(|mut doc| -> Result<Document, StoreError> {
                    for (path, expr) in fields {
                        let value = evaluate(expr, &doc)?;
                        set_path(&mut doc, path, value)?;
                    }
                    Ok(doc)
                })
                .collect(),
            Stage::Facet(facets) => {
                let mut out = Document::new();
                for (name, pipeline) in facets {
                    let results = self.run(docs.clone(), pipeline)?;
                    out.insert(name.clone(), documents_to_array(results));
                }
                Ok(vec![out])
            }
            Stage::Sample(n) => Ok(docs
                .choose_multiple(&mut rand::thread_rng(), clamp(*n))
                .cloned()
                .collect()),
        }
    }

    fn lookup(&self, docs: Vec<Document>, lookup: &LookupSpec) -> Result<Vec<Document>, StoreError> {
        let foreign = self
            .collections
            .get(&lookup.from)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        docs.into_iter()
            .map(|mut doc| -> Result<Document, StoreError> {
                let joined: Vec<Document> = match (&lookup.local_field, &lookup.foreign_field) {
                    (Some(local), Some(foreign_field)) => {
                        let local_value = doc.get_by_path(local).cloned().unwrap_or(Value::Null);
                        foreign
                            .iter()
                            .filter(|f| {
                                let other = f.get_by_path(foreign_field).cloned().unwrap_or(Value::Null);
                                join_matches(&local_value, &other)
                            })
                            .cloned()
                            .collect()
                    }
                    _ => foreign.to_vec(),
                };

                let joined = match &lookup.pipeline {
                    Some(pipeline) => self.run(joined, pipeline)?,
                    None => joined,
                };
                set_path(&mut doc, &lookup.as_field, documents_to_array(joined))?;
                Ok(doc)
            })
            .collect()
    }
}

fn clamp(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<(), StoreError> {
    doc.set_by_path(path, value)
        .map_err(|e| StoreError::Execution(e.to_string()))
}

fn documents_to_array(docs: Vec<Document>) -> Value {
    Value::Array(docs.into_iter().map(|d| Value::Object(d.fields)).collect())
}

/// Equality join where an array on either side matches any of its elements
fn join_matches(local: &Value, foreign: &Value) -> bool {
    let candidates = |v: &Value| -> Vec<Value> {
        match v {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        }
    };
    let foreign = candidates(foreign);
    candidates(local)
        .iter()
        .any(|l| foreign.iter().any(|f| l.loosely_equals(f)))
}

fn sort_documents(mut docs: Vec<Document>, sort: &Sort) -> Vec<Document> {
    docs.sort_by(|a, b| {
        for (field, order) in &sort.fields {
            let left = a.get_by_path(field).unwrap_or(&Value::Null);
            let right = b.get_by_path(field).unwrap_or(&Value::Null);
            let ord = match order {
                SortOrder::Ascending => left.compare(right),
                SortOrder::Descending => right.compare(left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    docs
}

fn project(doc: &Document, projection: &Projection) -> Result<Document, StoreError> {
    if !projection.is_inclusion() {
        let mut out = doc.clone();
        for field in projection.fields.keys() {
            out.remove_by_path(field);
        }
        return Ok(out);
    }

    let mut out = Document::new();
    let id_excluded = matches!(projection.fields.get(ID_FIELD), Some(ProjectionField::Exclude));
    if !id_excluded {
        if let Some(id) = doc.get(ID_FIELD) {
            out.insert(ID_FIELD, id.clone());
        }
    }

    for (field, kind) in &projection.fields {
        match kind {
            ProjectionField::Include => {
                if let Some(value) = doc.get_by_path(field) {
                    set_path(&mut out, field, value.clone())?;
                }
            }
            ProjectionField::Computed(expr) => set_path(&mut out, field, evaluate(expr, doc)?)?,
            ProjectionField::Exclude => {}
        }
    }
    Ok(out)
}

fn unwind_documents(docs: Vec<Document>, unwind: &UnwindSpec) -> Vec<Document> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        match doc.get_by_path(&unwind.path).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    // the path resolved, so every parent is an object
                    let _ = copy.set_by_path(&unwind.path, item);
                    out.push(copy);
                }
            }
            Some(Value::Array(_)) => {
                if unwind.preserve_null_and_empty_arrays {
                    let mut copy = doc;
                    copy.remove_by_path(&unwind.path);
                    out.push(copy);
                }
            }
            None | Some(Value::Null) => {
                if unwind.preserve_null_and_empty_arrays {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    out
}

fn group_documents(docs: Vec<Document>, group: &GroupSpec) -> Result<Vec<Document>, StoreError> {
    let mut order: Vec<(Value, Vec<Document>)> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for doc in docs {
        let key = evaluate(&group.id, &doc)?;
        let slot = key.to_json().to_string();
        match positions.get(&slot) {
            Some(&i) => order[i].1.push(doc),
            None => {
                positions.insert(slot, order.len());
                order.push((key, vec![doc]));
            }
        }
    }

    order
        .into_iter()
        .map(|(key, members)| -> Result<Document, StoreError> {
            let mut out = Document::new();
            out.insert(ID_FIELD, key);
            for (field, accumulator) in &group.accumulators {
                out.insert(field.clone(), accumulate(accumulator, &members)?);
            }
            Ok(out)
        })
        .collect()
}

fn accumulate(accumulator: &Accumulator, members: &[Document]) -> Result<Value, StoreError> {
    let values = |expr: &JsonValue| -> Result<Vec<Value>, StoreError> {
        members.iter().map(|doc| evaluate(expr, doc)).collect()
    };

    Ok(match accumulator {
        Accumulator::Count => Value::Int64(members.len() as i64),
        Accumulator::Sum(expr) => sum(&values(expr)?),
        Accumulator::Avg(expr) => {
            let numbers: Vec<f64> = values(expr)?.iter().filter_map(Value::as_f64).collect();
            if numbers.is_empty() {
                Value::Null
            } else {
                Value::Float64(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        Accumulator::Min(expr) => values(expr)?
            .into_iter()
            .filter(|v| !v.is_null())
            .min_by(|a, b| a.compare(b))
            .unwrap_or(Value::Null),
        Accumulator::Max(expr) => values(expr)?
            .into_iter()
            .filter(|v| !v.is_null())
            .max_by(|a, b| a.compare(b))
            .unwrap_or(Value::Null),
        Accumulator::First(expr) => match members.first() {
            Some(doc) => evaluate(expr, doc)?,
            None => Value::Null,
        },
        Accumulator::Last(expr) => match members.last() {
            Some(doc) => evaluate(expr, doc)?,
            None => Value::Null,
        },
        Accumulator::Push(expr) => Value::Array(values(expr)?),
        Accumulator::AddToSet(expr) => {
            let mut set: Vec<Value> = Vec::new();
            for value in values(expr)? {
                if !set.iter().any(|v| v.loosely_equals(&value)) {
                    set.push(value);
                }
            }
            Value::Array(set)
        }
    })
}

/// Integer sum while every input is an integer, float otherwise
fn sum(values: &[Value]) -> Value {
    let mut int_total: i64 = 0;
    let mut float_total = 0.0;
    let mut integral = true;

    for value in values {
        match value {
            Value::Int32(_) | Value::Int64(_) => {
                let i = value.as_i64().unwrap_or(0);
                float_total += i as f64;
                match int_total.checked_add(i) {
                    Some(total) => int_total = total,
                    None => integral = false,
                }
            }
            Value::Float64(f) => {
                float_total += f;
                integral = false;
            }
            _ => {}
        }
    }

    if integral {
        Value::Int64(int_total)
    } else {
        Value::Float64(float_total)
    }
}

/// Evaluate an aggregation expression against a document
pub(crate) fn evaluate(expr: &JsonValue, doc: &Document) -> Result<Value, StoreError> {
    match expr {
        JsonValue::String(s) if s.starts_with('$') && !s.starts_with("$$") => {
            Ok(doc.get_by_path(&s[1..]).cloned().unwrap_or(Value::Null))
        }
        JsonValue::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| evaluate(item, doc))
                .collect::<Result<_, _>>()?,
        )),
        JsonValue::Object(obj) => match obj.iter().next() {
            Some((op, args)) if obj.len() == 1 && op.starts_with('$') => operator(op, args, doc),
            _ => {
                let mut fields = BTreeMap::new();
                for (key, value) in obj {
                    fields.insert(key.clone(), evaluate(value, doc)?);
                }
                Ok(Value::Object(fields))
            }
        },
        literal => Ok(Value::from(literal)),
    }
}

fn operator(op: &str, args: &JsonValue, doc: &Document) -> Result<Value, StoreError> {
    if op == "$literal" {
        return Ok(Value::from(args));
    }

    let operands: Vec<Value> = match args {
        JsonValue::Array(items) => items
            .iter()
            .map(|item| evaluate(item, doc))
            .collect::<Result<_, _>>()?,
        single => vec![evaluate(single, doc)?],
    };
    let numbers = || -> Option<Vec<f64>> { operands.iter().map(Value::as_f64).collect() };

    let value = match op {
        "$add" => match numbers() {
            Some(_) if operands.iter().all(|v| v.as_i64().is_some()) => {
                Value::Int64(operands.iter().filter_map(Value::as_i64).fold(0i64, i64::saturating_add))
            }
            Some(ns) => Value::Float64(ns.iter().sum()),
            None => Value::Null,
        },
        "$multiply" => match numbers() {
            Some(ns) => Value::Float64(ns.iter().product()),
            None => Value::Null,
        },
        "$subtract" => match numbers().as_deref() {
            Some([a, b]) => Value::Float64(a - b),
            _ => Value::Null,
        },
        "$divide" => match numbers().as_deref() {
            Some([_, b]) if *b == 0.0 => {
                return Err(StoreError::Execution("$divide by zero".to_string()))
            }
            Some([a, b]) => Value::Float64(a / b),
            _ => Value::Null,
        },
        "$concat" => {
            let mut out = String::new();
            for operand in &operands {
                match operand.as_str() {
                    Some(s) => out.push_str(s),
                    None => return Ok(Value::Null),
                }
            }
            Value::String(out)
        }
        "$toLower" => operands
            .first()
            .and_then(Value::as_str)
            .map(|s| Value::String(s.to_lowercase()))
            .unwrap_or(Value::Null),
        "$toUpper" => operands
            .first()
            .and_then(Value::as_str)
            .map(|s| Value::String(s.to_uppercase()))
            .unwrap_or(Value::Null),
        "$size" => match operands.first() {
            Some(Value::Array(items)) => Value::Int64(items.len() as i64),
            _ => return Err(StoreError::Execution("$size requires an array".to_string())),
        },
        "$ifNull" => operands
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null),
        other => {
            return Err(StoreError::Execution(format!(
                "Unsupported expression operator: {}",
                other
            )))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Filter;
    use serde_json::json;

    fn docs(values: Vec<JsonValue>) -> Vec<Document> {
        values.iter().map(Document::from_json).collect()
    }

    fn run(input: Vec<Document>, stages: Vec<Stage>) -> Vec<JsonValue> {
        let collections = Collections::new();
        PipelineEvaluator::new(&collections, None)
            .run(input, &Pipeline::new(stages))
            .unwrap()
            .iter()
            .map(Document::to_json)
            .collect()
    }

    #[test]
    fn test_expressions() {
        let doc = Document::from_json(&json!({ "a": 2, "b": 3.5, "name": "Lin", "tags": [1, 2] }));

        assert_eq!(evaluate(&json!("$a"), &doc).unwrap(), Value::Int64(2));
        assert_eq!(evaluate(&json!("$missing"), &doc).unwrap(), Value::Null);
        assert_eq!(evaluate(&json!({ "$add": ["$a", 1] }), &doc).unwrap(), Value::Int64(3));
        assert_eq!(evaluate(&json!({ "$add": ["$a", "$b"] }), &doc).unwrap(), Value::Float64(5.5));
        assert_eq!(evaluate(&json!({ "$size": "$tags" }), &doc).unwrap(), Value::Int64(2));
        assert_eq!(
            evaluate(&json!({ "$concat": ["$name", "!"] }), &doc).unwrap(),
            Value::from("Lin!")
        );
        assert!(evaluate(&json!({ "$divide": ["$a", 0] }), &doc).is_err());
        assert!(evaluate(&json!({ "$bogus": 1 }), &doc).is_err());
    }

    #[test]
    fn test_group_accumulators() {
        let input = docs(vec![
            json!({ "subject": "math", "likes": 3 }),
            json!({ "subject": "bio", "likes": 5 }),
            json!({ "subject": "math", "likes": 7 }),
        ]);
        let group = GroupSpec::new(json!("$subject"))
            .accumulate("n", Accumulator::Count)
            .accumulate("total", Accumulator::Sum(json!("$likes")))
            .accumulate("avg", Accumulator::Avg(json!("$likes")))
            .accumulate("top", Accumulator::Max(json!("$likes")));

        let out = run(input, vec![Stage::Group(group)]);
        assert_eq!(
            out,
            vec![
                json!({ "_id": "math", "n": 2, "total": 10, "avg": 5.0, "top": 7 }),
                json!({ "_id": "bio", "n": 1, "total": 5, "avg": 5.0, "top": 5 }),
            ]
        );
    }

    #[test]
    fn test_sort_skip_limit_project() {
        let input = docs(vec![
            json!({ "_id": 1, "likes": 3, "title": "a" }),
            json!({ "_id": 2, "likes": 9, "title": "b" }),
            json!({ "_id": 3, "likes": 5, "title": "c" }),
        ]);
        let out = run(
            input,
            vec![
                Stage::Sort(Sort::new().desc("likes")),
                Stage::Skip(1),
                Stage::Limit(1),
                Stage::Project(Projection::new().include("title").exclude("_id")),
            ],
        );
        assert_eq!(out, vec![json!({ "title": "c" })]);
    }

    #[test]
    fn test_unwind_and_match() {
        let input = docs(vec![
            json!({ "_id": 1, "tags": ["x", "y"] }),
            json!({ "_id": 2, "tags": [] }),
            json!({ "_id": 3 }),
        ]);
        let out = run(
            input.clone(),
            vec![Stage::Unwind(UnwindSpec::new("$tags")), Stage::Match(Filter::eq("tags", "y"))],
        );
        assert_eq!(out, vec![json!({ "_id": 1, "tags": "y" })]);

        let preserved = run(input, vec![Stage::Unwind(UnwindSpec::new("tags").preserve_empty())]);
        assert_eq!(preserved.len(), 4);
    }

    #[test]
    fn test_lookup_with_sub_pipeline() {
        let mut collections = Collections::new();
        collections.insert(
            "users".to_string(),
            docs(vec![
                json!({ "_id": 10, "name": "Lin", "role": "teacher" }),
                json!({ "_id": 11, "name": "Ana", "role": "student" }),
            ]),
        );
        let input = docs(vec![json!({ "_id": 1, "authorId": 10 })]);
        let lookup = LookupSpec::new("users", "authorId", "_id", "author").pipeline(Pipeline::new(vec![
            Stage::Project(Projection::new().include("name").exclude("_id")),
        ]));

        let out = PipelineEvaluator::new(&collections, None)
            .run(input, &Pipeline::new(vec![Stage::Lookup(lookup)]))
            .unwrap();
        assert_eq!(
            out[0].to_json(),
            json!({ "_id": 1, "authorId": 10, "author": [ { "name": "Lin" } ] })
        );
    }

    #[test]
    fn test_facet_and_sample() {
        let input = docs(vec![json!({ "a": 1 }), json!({ "a": 2 }), json!({ "a": 3 })]);
        let facets = BTreeMap::from([
            ("count".to_string(), Pipeline::new(vec![Stage::Group(GroupSpec::new(JsonValue::Null).accumulate("n", Accumulator::Count))])),
            ("first".to_string(), Pipeline::new(vec![Stage::Limit(1)])),
        ]);
        let out = run(input.clone(), vec![Stage::Facet(facets)]);
        assert_eq!(
            out,
            vec![json!({ "count": [ { "_id": null, "n": 3 } ], "first": [ { "a": 1 } ] })]
        );

        assert_eq!(run(input, vec![Stage::Sample(2)]).len(), 2);
    }

    #[test]
    fn test_add_fields() {
        let input = docs(vec![json!({ "likes": 2, "views": 8 })]);
        let out = run(
            input,
            vec![Stage::AddFields(BTreeMap::from([(
                "stats.score".to_string(),
                json!({ "$add": ["$likes", "$views"] }),
            )]))],
        );
        assert_eq!(out, vec![json!({ "likes": 2, "views": 8, "stats": { "score": 10 } })]);
    }
}
