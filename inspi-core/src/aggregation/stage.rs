//! Aggregation pipeline stages
//!
//! MongoDB-style pipeline operators:
//! - $match: Filter documents
//! - $group: Group and accumulate
//! - $sort / $limit / $skip / $sample: Order and window results
//! - $project / $addFields: Select, drop and compute fields
//! - $lookup / $unwind: Join and flatten
//! - $facet: Run named sub-pipelines over the same input

use crate::query::{Filter, FilterParseError, FilterParser, Projection, Sort};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::BTreeMap;

/// Pipeline stage in aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$", content = "spec")]
pub enum Stage {
    #[serde(rename = "match")]
    Match(Filter),

    #[serde(rename = "group")]
    Group(GroupSpec),

    #[serde(rename = "sort")]
    Sort(Sort),

    #[serde(rename = "limit")]
    Limit(u64),

    #[serde(rename = "skip")]
    Skip(u64),

    #[serde(rename = "project")]
    Project(Projection),

    #[serde(rename = "lookup")]
    Lookup(LookupSpec),

    #[serde(rename = "unwind")]
    Unwind(UnwindSpec),

    #[serde(rename = "addFields")]
    AddFields(BTreeMap<String, JsonValue>),

    #[serde(rename = "facet")]
    Facet(BTreeMap<String, Pipeline>),

    #[serde(rename = "sample")]
    Sample(u64),
}

impl Stage {
    /// Operator name as stores spell it
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Group(_) => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
            Stage::Project(_) => "$project",
            Stage::Lookup(_) => "$lookup",
            Stage::Unwind(_) => "$unwind",
            Stage::AddFields(_) => "$addFields",
            Stage::Facet(_) => "$facet",
            Stage::Sample(_) => "$sample",
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Stage::Match(_))
    }

    /// Parse a MongoDB-style stage document such as `{"$limit": 10}`
    pub fn from_json(value: &JsonValue) -> Result<Self, FilterParseError> {
        let (name, body) = match value.as_object() {
            Some(obj) if obj.len() == 1 => obj.iter().next().ok_or_else(|| invalid("Empty stage"))?,
            _ => return Err(invalid("Stage must be an object with a single operator")),
        };

        let stage = match name.as_str() {
            "$match" => Stage::Match(FilterParser::parse_filter(body)?),
            "$group" => Stage::Group(GroupSpec::from_json(body)?),
            "$sort" => Stage::Sort(FilterParser::parse_sort(body)?),
            "$limit" => Stage::Limit(count(name, body)?),
            "$skip" => Stage::Skip(count(name, body)?),
            "$project" => Stage::Project(FilterParser::parse_projection(body)?),
            "$lookup" => Stage::Lookup(LookupSpec::from_json(body)?),
            "$unwind" => Stage::Unwind(UnwindSpec::from_json(body)?),
            "$addFields" => Stage::AddFields(
                body.as_object()
                    .ok_or_else(|| invalid("$addFields must be an object"))?
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            "$facet" => {
                let facets = body.as_object().ok_or_else(|| invalid("$facet must be an object"))?;
                let mut parsed = BTreeMap::new();
                for (facet, pipeline) in facets {
                    parsed.insert(facet.clone(), Pipeline::from_json(pipeline)?);
                }
                Stage::Facet(parsed)
            }
            "$sample" => Stage::Sample(count(name, body.get("size").unwrap_or(&JsonValue::Null))?),
            other => return Err(invalid(format!("Unsupported stage: {}", other))),
        };
        Ok(stage)
    }

    /// Render as a MongoDB-style stage document
    pub fn to_json(&self) -> JsonValue {
        let body = match self {
            Stage::Match(filter) => filter.to_json(),
            Stage::Group(group) => group.to_json(),
            Stage::Sort(sort) => sort.to_json(),
            Stage::Limit(n) | Stage::Skip(n) => json!(n),
            Stage::Project(projection) => projection.to_json(),
            Stage::Lookup(lookup) => lookup.to_json(),
            Stage::Unwind(unwind) => json!({
                "path": format!("${}", unwind.path),
                "preserveNullAndEmptyArrays": unwind.preserve_null_and_empty_arrays,
            }),
            Stage::AddFields(fields) => JsonValue::Object(
                fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ),
            Stage::Facet(facets) => JsonValue::Object(
                facets
                    .iter()
                    .map(|(name, pipeline)| (name.clone(), pipeline.to_json()))
                    .collect(),
            ),
            Stage::Sample(size) => json!({ "size": size }),
        };

        let mut stage = Map::new();
        stage.insert(self.name().to_string(), body);
        JsonValue::Object(stage)
    }
}

/// Accumulators available in `$group`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "$", content = "expr")]
pub enum Accumulator {
    #[serde(rename = "sum")]
    Sum(JsonValue),

    #[serde(rename = "avg")]
    Avg(JsonValue),

    #[serde(rename = "min")]
    Min(JsonValue),

    #[serde(rename = "max")]
    Max(JsonValue),

    #[serde(rename = "first")]
    First(JsonValue),

    #[serde(rename = "last")]
    Last(JsonValue),

    #[serde(rename = "push")]
    Push(JsonValue),

    #[serde(rename = "addToSet")]
    AddToSet(JsonValue),

    #[serde(rename = "count")]
    Count,
}

impl Accumulator {
    pub fn name(&self) -> &'static str {
        match self {
            Accumulator::Sum(_) => "$sum",
            Accumulator::Avg(_) => "$avg",
            Accumulator::Min(_) => "$min",
            Accumulator::Max(_) => "$max",
            Accumulator::First(_) => "$first",
            Accumulator::Last(_) => "$last",
            Accumulator::Push(_) => "$push",
            Accumulator::AddToSet(_) => "$addToSet",
            Accumulator::Count => "$count",
        }
    }

    /// The accumulated expression; `$count` has none
    pub fn expression(&self) -> Option<&JsonValue> {
        match self {
            Accumulator::Sum(e)
            | Accumulator::Avg(e)
            | Accumulator::Min(e)
            | Accumulator::Max(e)
            | Accumulator::First(e)
            | Accumulator::Last(e)
            | Accumulator::Push(e)
            | Accumulator::AddToSet(e) => Some(e),
            Accumulator::Count => None,
        }
    }
}

/// `$group` specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    /// Group key expression (`"$field"`, an object of expressions, or null)
    pub id: JsonValue,
    /// Output field → accumulator
    pub accumulators: BTreeMap<String, Accumulator>,
}

impl GroupSpec {
    pub fn new(id: JsonValue) -> Self {
        Self {
            id,
            accumulators: BTreeMap::new(),
        }
    }

    /// Add an accumulated output field
    pub fn accumulate(mut self, field: impl Into<String>, accumulator: Accumulator) -> Self {
        self.accumulators.insert(field.into(), accumulator);
        self
    }

    fn from_json(value: &JsonValue) -> Result<Self, FilterParseError> {
        let obj = value.as_object().ok_or_else(|| invalid("$group must be an object"))?;
        let id = obj.get("_id").ok_or_else(|| invalid("$group requires an _id"))?;

        let mut group = GroupSpec::new(id.clone());
        for (field, spec) in obj.iter().filter(|(k, _)| k.as_str() != "_id") {
            let (op, expr) = match spec.as_object() {
                Some(acc) if acc.len() == 1 => acc.iter().next().ok_or_else(|| invalid("Empty accumulator"))?,
                _ => return Err(invalid(format!("Accumulator for '{}' must have one operator", field))),
            };
            let accumulator = match op.as_str() {
                "$sum" => Accumulator::Sum(expr.clone()),
                "$avg" => Accumulator::Avg(expr.clone()),
                "$min" => Accumulator::Min(expr.clone()),
                "$max" => Accumulator::Max(expr.clone()),
                "$first" => Accumulator::First(expr.clone()),
                "$last" => Accumulator::Last(expr.clone()),
                "$push" => Accumulator::Push(expr.clone()),
                "$addToSet" => Accumulator::AddToSet(expr.clone()),
                "$count" => Accumulator::Count,
                other => return Err(invalid(format!("Unsupported accumulator: {}", other))),
            };
            group = group.accumulate(field.clone(), accumulator);
        }
        Ok(group)
    }

    fn to_json(&self) -> JsonValue {
        let mut body = Map::new();
        body.insert("_id".to_string(), self.id.clone());
        for (field, acc) in &self.accumulators {
            let expr = acc.expression().cloned().unwrap_or_else(|| json!({}));
            body.insert(field.clone(), json!({ acc.name(): expr }));
        }
        JsonValue::Object(body)
    }
}

/// `$lookup` specification, optionally carrying a sub-pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupSpec {
    /// Foreign collection
    pub from: String,
    /// Field of the input documents
    pub local_field: Option<String>,
    /// Field of the foreign documents
    pub foreign_field: Option<String>,
    /// Output array field
    pub as_field: String,
    /// Sub-pipeline run over the joined foreign documents
    pub pipeline: Option<Pipeline>,
}

impl LookupSpec {
    /// Equality join on `local_field == foreign_field`
    pub fn new(
        from: impl Into<String>,
        local_field: impl Into<String>,
        foreign_field: impl Into<String>,
        as_field: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            local_field: Some(local_field.into()),
            foreign_field: Some(foreign_field.into()),
            as_field: as_field.into(),
            pipeline: None,
        }
    }

    /// Join every foreign document through a sub-pipeline
    pub fn with_pipeline(from: impl Into<String>, as_field: impl Into<String>, pipeline: Pipeline) -> Self {
        Self {
            from: from.into(),
            local_field: None,
            foreign_field: None,
            as_field: as_field.into(),
            pipeline: Some(pipeline),
        }
    }

    /// Attach a sub-pipeline to an equality join
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    fn from_json(value: &JsonValue) -> Result<Self, FilterParseError> {
        let obj = value.as_object().ok_or_else(|| invalid("$lookup must be an object"))?;
        let text = |key: &str| obj.get(key).and_then(JsonValue::as_str).map(str::to_string);

        Ok(Self {
            from: text("from").ok_or_else(|| invalid("$lookup requires 'from'"))?,
            local_field: text("localField"),
            foreign_field: text("foreignField"),
            as_field: text("as").ok_or_else(|| invalid("$lookup requires 'as'"))?,
            pipeline: obj.get("pipeline").map(Pipeline::from_json).transpose()?,
        })
    }

    fn to_json(&self) -> JsonValue {
        let mut body = Map::new();
        body.insert("from".to_string(), json!(self.from));
        if let Some(local) = &self.local_field {
            body.insert("localField".to_string(), json!(local));
        }
        if let Some(foreign) = &self.foreign_field {
            body.insert("foreignField".to_string(), json!(foreign));
        }
        body.insert("as".to_string(), json!(self.as_field));
        if let Some(pipeline) = &self.pipeline {
            body.insert("pipeline".to_string(), pipeline.to_json());
        }
        JsonValue::Object(body)
    }
}

/// `$unwind` specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnwindSpec {
    /// Array field path, without the leading `$`
    pub path: String,
    /// Keep documents whose array is missing, null or empty
    pub preserve_null_and_empty_arrays: bool,
}

impl UnwindSpec {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            path: path.trim_start_matches('$').to_string(),
            preserve_null_and_empty_arrays: false,
        }
    }

    pub fn preserve_empty(mut self) -> Self {
        self.preserve_null_and_empty_arrays = true;
        self
    }

    /// Accepts both `"$path"` and `{path, preserveNullAndEmptyArrays}`
    fn from_json(value: &JsonValue) -> Result<Self, FilterParseError> {
        match value {
            JsonValue::String(path) => Ok(Self::new(path.as_str())),
            JsonValue::Object(obj) => {
                let path = obj
                    .get("path")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| invalid("$unwind requires a path"))?;
                let mut unwind = Self::new(path);
                unwind.preserve_null_and_empty_arrays = obj
                    .get("preserveNullAndEmptyArrays")
                    .and_then(JsonValue::as_bool)
                    .unwrap_or(false);
                Ok(unwind)
            }
            _ => Err(invalid("$unwind must be a path or an object")),
        }
    }
}

/// Aggregation pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Stage> {
        self.stages.iter()
    }

    /// Number of stages of the given kind
    pub fn count_where(&self, predicate: impl Fn(&Stage) -> bool) -> usize {
        self.stages.iter().filter(|s| predicate(s)).count()
    }

    /// Render as a MongoDB-style pipeline array
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Array(self.stages.iter().map(Stage::to_json).collect())
    }

    /// Parse a MongoDB-style pipeline array
    pub fn from_json(value: &JsonValue) -> Result<Self, FilterParseError> {
        let stages = value
            .as_array()
            .ok_or_else(|| invalid("Pipeline must be an array"))?
            .iter()
            .map(Stage::from_json)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { stages })
    }

    /// Parse a pipeline from JSON text
    pub fn parse(json: &str) -> Result<Self, FilterParseError> {
        let value: JsonValue =
            serde_json::from_str(json).map_err(|e| FilterParseError::InvalidJson(e.to_string()))?;
        Self::from_json(&value)
    }
}

fn invalid(message: impl Into<String>) -> FilterParseError {
    FilterParseError::InvalidFormat(message.into())
}

fn count(stage: &str, value: &JsonValue) -> Result<u64, FilterParseError> {
    value
        .as_u64()
        .ok_or_else(|| invalid(format!("{} must be a non-negative integer", stage)))
}

impl From<Vec<Stage>> for Pipeline {
    fn from(stages: Vec<Stage>) -> Self {
        Self { stages }
    }
}

impl<'a> IntoIterator for &'a Pipeline {
    type Item = &'a Stage;
    type IntoIter = std::slice::Iter<'a, Stage>;

    fn into_iter(self) -> Self::IntoIter {
        self.stages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Projection;

    #[test]
    fn test_stage_to_json() {
        assert_eq!(
            Stage::Match(Filter::eq("status", "published")).to_json(),
            json!({ "$match": { "status": "published" } })
        );
        assert_eq!(Stage::Limit(10).to_json(), json!({ "$limit": 10 }));
        assert_eq!(
            Stage::Unwind(UnwindSpec::new("$tags").preserve_empty()).to_json(),
            json!({ "$unwind": { "path": "$tags", "preserveNullAndEmptyArrays": true } })
        );
        assert_eq!(Stage::Sample(3).to_json(), json!({ "$sample": { "size": 3 } }));
    }

    #[test]
    fn test_group_to_json() {
        let group = GroupSpec::new(json!("$authorId"))
            .accumulate("works", Accumulator::Count)
            .accumulate("likes", Accumulator::Sum(json!("$likes")));

        assert_eq!(
            Stage::Group(group).to_json(),
            json!({ "$group": {
                "_id": "$authorId",
                "likes": { "$sum": "$likes" },
                "works": { "$count": {} }
            }})
        );
    }

    #[test]
    fn test_lookup_to_json_with_pipeline() {
        let lookup = LookupSpec::new("users", "authorId", "_id", "author").pipeline(Pipeline::new(vec![
            Stage::Project(Projection::new().include("name")),
        ]));

        assert_eq!(
            Stage::Lookup(lookup).to_json(),
            json!({ "$lookup": {
                "from": "users",
                "localField": "authorId",
                "foreignField": "_id",
                "as": "author",
                "pipeline": [ { "$project": { "name": 1 } } ]
            }})
        );
    }

    #[test]
    fn test_parse_pipeline_document() {
        let pipeline = Pipeline::parse(
            r#"[
                {"$match": {"status": "published", "likes": {"$gte": 10}}},
                {"$unwind": "$tags"},
                {"$group": {"_id": "$tags", "works": {"$count": {}}, "likes": {"$sum": "$likes"}}},
                {"$sort": {"works": -1}},
                {"$limit": 5},
                {"$lookup": {"from": "users", "localField": "_id", "foreignField": "favoriteTag",
                             "as": "fans", "pipeline": [{"$project": {"name": 1}}]}},
                {"$facet": {"sampled": [{"$sample": {"size": 2}}]}}
            ]"#,
        )
        .unwrap();

        assert_eq!(
            pipeline.stages[0],
            Stage::Match(Filter::And(vec![
                Filter::gte("likes", 10i64),
                Filter::eq("status", "published")
            ]))
        );
        assert_eq!(pipeline.stages[1], Stage::Unwind(UnwindSpec::new("tags")));
        assert_eq!(
            pipeline.stages[2],
            Stage::Group(
                GroupSpec::new(json!("$tags"))
                    .accumulate("works", Accumulator::Count)
                    .accumulate("likes", Accumulator::Sum(json!("$likes")))
            )
        );
        assert_eq!(pipeline.stages[3], Stage::Sort(Sort::new().desc("works")));
        assert_eq!(pipeline.stages[4], Stage::Limit(5));
        assert_eq!(
            pipeline.stages[5],
            Stage::Lookup(
                LookupSpec::new("users", "_id", "favoriteTag", "fans")
                    .pipeline(Pipeline::new(vec![Stage::Project(Projection::new().include("name"))]))
            )
        );
        assert_eq!(
            pipeline.stages[6],
            Stage::Facet(BTreeMap::from([("sampled".to_string(), Pipeline::new(vec![Stage::Sample(2)]))]))
        );

        // rendering and parsing again gives the same pipeline
        assert_eq!(Pipeline::from_json(&pipeline.to_json()).unwrap(), pipeline);
    }

    #[test]
    fn test_parse_pipeline_errors() {
        assert!(matches!(Pipeline::parse("not json"), Err(FilterParseError::InvalidJson(_))));
        assert!(Pipeline::from_json(&json!({ "$limit": 1 })).is_err());
        assert!(Pipeline::from_json(&json!([{ "$limit": -1 }])).is_err());
        assert!(Pipeline::from_json(&json!([{ "$out": "copy" }])).is_err());
        assert!(Pipeline::from_json(&json!([{ "$limit": 1, "$skip": 1 }])).is_err());
        assert!(Pipeline::from_json(&json!([{ "$group": { "n": { "$count": {} } } }])).is_err());
    }

    #[test]
    fn test_stage_serde_round_trip() {
        let stage = Stage::Facet(BTreeMap::from([(
            "top".to_string(),
            Pipeline::new(vec![Stage::Sort(Sort::new().desc("likes")), Stage::Limit(5)]),
        )]));
        let encoded = serde_json::to_string(&stage).unwrap();
        let decoded: Stage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, stage);
    }
}
