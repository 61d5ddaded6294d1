//! Candidate query model.
//!
//! The generator hands over a raw JSON value. It is classified exactly once,
//! here, into either a read ([`CandidateQuery`]) or a command (writes and
//! other verbs the read path does not support). Downstream code never has to
//! re-inspect whether it is looking at a list or a mapping.

use serde_json::{Map, Value};

/// A find-style predicate tree.
pub type FilterDocument = Map<String, Value>;

/// A single-key pipeline stage, e.g. `{"$match": {...}}`.
pub type Stage = Map<String, Value>;

/// An ordered sequence of stages.
pub type Pipeline = Vec<Stage>;

/// An output projection attached to a find query.
pub type Projection = Map<String, Value>;

pub const MATCH: &str = "$match";
pub const PROJECT: &str = "$project";
pub const LOOKUP: &str = "$lookup";
pub const UNION_WITH: &str = "$unionWith";
pub const GRAPH_LOOKUP: &str = "$graphLookup";
pub const FACET: &str = "$facet";

/// Verbs that turn a mapping into a command instead of a filter.
pub const COMMAND_VERBS: &[&str] = &[
    "insertOne",
    "insertMany",
    "updateOne",
    "updateMany",
    "replaceOne",
    "deleteOne",
    "deleteMany",
    "findOneAndUpdate",
    "findOneAndReplace",
    "findOneAndDelete",
    "bulkWrite",
    "countDocuments",
    "distinct",
];

/// A query proposed by the generator, before or after enforcement.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateQuery {
    /// A find query: predicate plus optional output projection.
    Filter {
        filter: FilterDocument,
        projection: Option<Projection>,
    },
    /// An aggregation pipeline.
    Aggregation(Pipeline),
}

/// Shape of a candidate query, as reported to the executor and in audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Find,
    Aggregate,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Find => "find",
            Self::Aggregate => "aggregate",
        }
    }
}

impl std::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CandidateQuery {
    /// A find query without projection.
    pub fn filter(filter: FilterDocument) -> Self {
        Self::Filter {
            filter,
            projection: None,
        }
    }

    /// The empty, maximally permissive find query.
    pub fn empty() -> Self {
        Self::filter(FilterDocument::new())
    }

    pub fn kind(&self) -> QueryKind {
        match self {
            Self::Filter { .. } => QueryKind::Find,
            Self::Aggregation(_) => QueryKind::Aggregate,
        }
    }

    /// The predicate of a find query.
    pub fn as_filter(&self) -> Option<&FilterDocument> {
        match self {
            Self::Filter { filter, .. } => Some(filter),
            Self::Aggregation(_) => None,
        }
    }

    /// The stages of an aggregation.
    pub fn as_pipeline(&self) -> Option<&[Stage]> {
        match self {
            Self::Filter { .. } => None,
            Self::Aggregation(stages) => Some(stages),
        }
    }

    /// JSON rendering for logs and audit records.
    ///
    /// A find query without projection renders as its filter; with a
    /// projection it renders as `{"find": ..., "projection": ...}`.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Filter {
                filter,
                projection: None,
            } => Value::Object(filter.clone()),
            Self::Filter {
                filter,
                projection: Some(projection),
            } => {
                let mut map = Map::with_capacity(2);
                map.insert("find".to_string(), Value::Object(filter.clone()));
                map.insert("projection".to_string(), Value::Object(projection.clone()));
                Value::Object(map)
            }
            Self::Aggregation(stages) => {
                Value::Array(stages.iter().cloned().map(Value::Object).collect())
            }
        }
    }
}

/// Result of classifying a raw generator value.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOperation {
    /// A find or aggregate read.
    Read(CandidateQuery),
    /// A write or other non-read verb, carried opaquely.
    Command { verb: String, body: Value },
}

/// Classify a raw generator value purely from its shape.
///
/// - an array is an aggregation pipeline
/// - `{"aggregate": [...]}` is an aggregation pipeline
/// - an object containing a command verb is a command
/// - `{"find": {...}, "projection": {...}}` is a find with projection
/// - any other object is a find filter
///
/// Anything else, and any pipeline whose stages are not single-key objects,
/// is malformed and degrades to the empty find query. The empty query is
/// then fully scoped by the rewriter, so malformed input fails safe.
pub fn classify(value: Value) -> QueryOperation {
    match value {
        Value::Array(items) => QueryOperation::Read(pipeline_from(items)),
        Value::Object(mut map) => {
            if let Some(verb) = COMMAND_VERBS.iter().find(|verb| map.contains_key(**verb)) {
                let body = map.remove(*verb).unwrap_or(Value::Null);
                return QueryOperation::Command {
                    verb: (*verb).to_string(),
                    body,
                };
            }

            if let Some(aggregate) = map.remove("aggregate") {
                return QueryOperation::Read(match aggregate {
                    Value::Array(items) => pipeline_from(items),
                    _ => malformed("aggregate is not a stage sequence"),
                });
            }

            if let Some(find) = map.remove("find") {
                let Value::Object(filter) = find else {
                    return QueryOperation::Read(malformed("find is not a mapping"));
                };
                let projection = match map.remove("projection") {
                    Some(Value::Object(projection)) => Some(projection),
                    Some(_) => {
                        tracing::warn!("Ignoring non-object projection on candidate query");
                        None
                    }
                    None => None,
                };
                return QueryOperation::Read(CandidateQuery::Filter { filter, projection });
            }

            QueryOperation::Read(CandidateQuery::filter(map))
        }
        _ => QueryOperation::Read(malformed("neither mapping nor stage sequence")),
    }
}

/// The operator tag of a single-key stage.
pub fn stage_operator(stage: &Stage) -> Option<&str> {
    if stage.len() != 1 {
        return None;
    }
    stage.keys().next().map(String::as_str)
}

fn pipeline_from(items: Vec<Value>) -> CandidateQuery {
    let mut stages = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Object(stage) if stage.len() == 1 => stages.push(stage),
            _ => return malformed("pipeline stage is not a single-key object"),
        }
    }
    CandidateQuery::Aggregation(stages)
}

fn malformed(reason: &str) -> CandidateQuery {
    tracing::warn!(reason, "Malformed candidate query, degrading to empty filter");
    CandidateQuery::empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_array_is_aggregation() {
        let op = classify(json!([{"$match": {"a": 1}}, {"$limit": 5}]));
        assert_eq!(
            op,
            QueryOperation::Read(CandidateQuery::Aggregation(vec![
                obj(json!({"$match": {"a": 1}})),
                obj(json!({"$limit": 5})),
            ]))
        );
    }

    #[test]
    fn test_object_is_filter() {
        let op = classify(json!({"details.type": "inbound"}));
        assert_eq!(
            op,
            QueryOperation::Read(CandidateQuery::filter(obj(json!({"details.type": "inbound"}))))
        );
    }

    #[test]
    fn test_find_wrapper_with_projection() {
        let op = classify(json!({"find": {"status": "open"}, "projection": {"name": 1}}));
        assert_eq!(
            op,
            QueryOperation::Read(CandidateQuery::Filter {
                filter: obj(json!({"status": "open"})),
                projection: Some(obj(json!({"name": 1}))),
            })
        );
    }

    #[test]
    fn test_aggregate_wrapper() {
        let op = classify(json!({"aggregate": [{"$limit": 1}]}));
        assert_eq!(
            op,
            QueryOperation::Read(CandidateQuery::Aggregation(vec![obj(json!({"$limit": 1}))]))
        );
    }

    #[test]
    fn test_write_verbs_are_commands() {
        let op = classify(json!({"updateMany": {"filter": {}, "update": {"$set": {"x": 1}}}}));
        match op {
            QueryOperation::Command { verb, body } => {
                assert_eq!(verb, "updateMany");
                assert_eq!(body["update"]["$set"]["x"], json!(1));
            }
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn test_scalars_degrade_to_empty_filter() {
        for raw in [json!("drop everything"), json!(17), json!(null), json!(true)] {
            assert_eq!(classify(raw), QueryOperation::Read(CandidateQuery::empty()));
        }
    }

    #[test]
    fn test_malformed_stage_degrades_to_empty_filter() {
        let op = classify(json!([{"$match": {}, "$limit": 1}]));
        assert_eq!(op, QueryOperation::Read(CandidateQuery::empty()));

        let op = classify(json!([{"$match": {}}, "oops"]));
        assert_eq!(op, QueryOperation::Read(CandidateQuery::empty()));
    }

    #[test]
    fn test_to_value_round_trips_shape() {
        let query = CandidateQuery::Filter {
            filter: obj(json!({"a": 1})),
            projection: Some(obj(json!({"a": 1}))),
        };
        assert_eq!(
            query.to_value(),
            json!({"find": {"a": 1}, "projection": {"a": 1}})
        );
        assert_eq!(classify(query.to_value()), QueryOperation::Read(query));
    }

    #[test]
    fn test_stage_operator() {
        assert_eq!(stage_operator(&obj(json!({"$match": {}}))), Some("$match"));
        assert_eq!(stage_operator(&obj(json!({}))), None);
    }
}
