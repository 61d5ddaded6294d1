//! Role-based field redaction.
//!
//! Restricted field paths are removed from `$project` stages and find
//! projections before execution, and stripped from result documents after
//! execution. Only inclusion entries are removed from projections; an
//! exclusion (`0`/`false`) already withholds the field.
//!
//! Sub-pipelines are redacted against the collection they read: `$facet`
//! branches against the current collection, `$lookup` and `$unionWith`
//! pipelines against their source. Documents joined from a source with
//! restrictions get an exclusion `$project` for the restricted paths.

use std::sync::Arc;

use mongate_core::query::{stage_operator, FACET, GRAPH_LOOKUP, LOOKUP, PROJECT, UNION_WITH};
use mongate_core::{CandidateQuery, PolicyConfig, Projection, Stage};
use serde_json::{Map, Value};

const PIPELINE: &str = "pipeline";

/// Removes fields a role may not see.
#[derive(Debug, Clone)]
pub struct RoleProjectionRedactor {
    policy: Arc<PolicyConfig>,
}

impl RoleProjectionRedactor {
    pub fn new(policy: Arc<PolicyConfig>) -> Self {
        Self { policy }
    }

    /// Field paths withheld from `role` on `collection`.
    pub fn restricted_fields(&self, role: &str, collection: &str) -> &[String] {
        self.policy
            .get_policy(collection)
            .map(|policy| policy.restricted_fields(role))
            .unwrap_or(&[])
    }

    /// Redact the projections of a query. The filter is never touched.
    pub fn apply(&self, query: CandidateQuery, role: &str, collection: &str) -> CandidateQuery {
        match query {
            CandidateQuery::Filter { filter, projection } => {
                let restricted = self.restricted_fields(role, collection);
                CandidateQuery::Filter {
                    filter,
                    projection: match projection {
                        Some(p) if !restricted.is_empty() => Some(redact_projection(&p, restricted)),
                        other => other,
                    },
                }
            }
            CandidateQuery::Aggregation(stages) => {
                let items = stages.into_iter().map(Value::Object).collect();
                CandidateQuery::Aggregation(
                    self.redact_pipeline(items, role, Some(collection))
                        .into_iter()
                        .filter_map(|item| match item {
                            Value::Object(stage) => Some(stage),
                            _ => None,
                        })
                        .collect(),
                )
            }
        }
    }

    /// Strip restricted paths from result documents, through nested arrays.
    pub fn redact_documents(&self, documents: &mut [Value], role: &str, collection: &str) {
        let restricted = self.restricted_fields(role, collection);
        if restricted.is_empty() {
            return;
        }
        for document in documents.iter_mut() {
            for path in restricted {
                let segments: Vec<&str> = path.split('.').collect();
                strip_path(document, &segments);
            }
        }
    }

    fn restricted_in(&self, role: &str, collection: Option<&str>) -> &[String] {
        collection
            .map(|collection| self.restricted_fields(role, collection))
            .unwrap_or(&[])
    }

    /// Redact a pipeline reading `collection`. Non-object items are kept.
    fn redact_pipeline(&self, items: Vec<Value>, role: &str, collection: Option<&str>) -> Vec<Value> {
        let mut out = Vec::with_capacity(items.len());
        let mut items = items.into_iter().peekable();
        while let Some(mut item) = items.next() {
            let trailing = match &mut item {
                Value::Object(stage) => self.redact_stage(stage, role, collection),
                _ => None,
            };
            out.push(item);
            if let Some(trailing) = trailing.map(Value::Object) {
                if items.peek() != Some(&trailing) {
                    out.push(trailing);
                }
            }
        }
        out
    }

    /// Redact one stage in place. Returns a stage to insert after it, when
    /// the stage joins documents that need restricted paths excluded.
    fn redact_stage(&self, stage: &mut Stage, role: &str, collection: Option<&str>) -> Option<Stage> {
        let operator = match stage_operator(stage) {
            Some(PROJECT) => PROJECT,
            Some(FACET) => FACET,
            Some(LOOKUP) => LOOKUP,
            Some(UNION_WITH) => UNION_WITH,
            Some(GRAPH_LOOKUP) => GRAPH_LOOKUP,
            _ => return None,
        };
        let body = stage.get_mut(operator)?;

        match (operator, body) {
            (PROJECT, Value::Object(projection)) => {
                let restricted = self.restricted_in(role, collection);
                if !restricted.is_empty() {
                    *projection = redact_projection(projection, restricted);
                }
                None
            }
            (FACET, Value::Object(branches)) => {
                for branch in branches.values_mut() {
                    if let Value::Array(nested) = branch {
                        *nested = self.redact_pipeline(std::mem::take(nested), role, collection);
                    }
                }
                None
            }
            (LOOKUP, Value::Object(lookup)) => {
                let from = lookup.get("from").and_then(Value::as_str).map(str::to_string);
                self.redact_sub_pipeline(lookup, role, from.as_deref());
                None
            }
            (UNION_WITH, body) => {
                let converted = match &mut *body {
                    Value::String(coll) if !self.restricted_fields(role, coll).is_empty() => {
                        Some(std::mem::take(coll))
                    }
                    _ => None,
                };
                if let Some(coll) = converted {
                    let mut union = Map::with_capacity(2);
                    union.insert("coll".to_string(), Value::String(coll));
                    *body = Value::Object(union);
                }
                if let Value::Object(union) = &mut *body {
                    let coll = union.get("coll").and_then(Value::as_str).map(str::to_string);
                    self.redact_sub_pipeline(union, role, coll.as_deref());
                }
                None
            }
            (GRAPH_LOOKUP, Value::Object(graph)) => {
                let from = graph.get("from").and_then(Value::as_str)?;
                let target = graph.get("as").and_then(Value::as_str)?;
                exclusion_stage(self.restricted_fields(role, from), Some(target))
            }
            _ => None,
        }
    }

    /// Redact the `pipeline` of a `$lookup` or `$unionWith` reading `source`
    /// and exclude the source's restricted paths at its end.
    fn redact_sub_pipeline(&self, body: &mut Map<String, Value>, role: &str, source: Option<&str>) {
        let present = body.contains_key(PIPELINE);
        let nested = match body.get_mut(PIPELINE) {
            Some(Value::Array(nested)) => std::mem::take(nested),
            _ => Vec::new(),
        };
        let mut nested = self.redact_pipeline(nested, role, source);

        if let Some(exclusion) = exclusion_stage(self.restricted_in(role, source), None) {
            let exclusion = Value::Object(exclusion);
            if nested.last() != Some(&exclusion) {
                nested.push(exclusion);
            }
        }
        if present || !nested.is_empty() {
            body.insert(PIPELINE.to_string(), Value::Array(nested));
        }
    }
}

/// `{"$project": {path: 0, ...}}` for every restricted path, under `prefix`.
fn exclusion_stage(restricted: &[String], prefix: Option<&str>) -> Option<Stage> {
    if restricted.is_empty() {
        return None;
    }
    let mut projection = Map::with_capacity(restricted.len());
    for path in restricted {
        let path = match prefix {
            Some(prefix) => format!("{}.{}", prefix, path),
            None => path.clone(),
        };
        projection.insert(path, Value::from(0));
    }
    let mut stage = Stage::with_capacity(1);
    stage.insert(PROJECT.to_string(), Value::Object(projection));
    Some(stage)
}

fn redact_projection(projection: &Projection, restricted: &[String]) -> Projection {
    let mut redacted = redact_level(projection, "", restricted);

    // An inclusion projection emptied of its inclusions would return every
    // field; keep only the id instead.
    if has_inclusion(projection) && !has_inclusion(&redacted) {
        redacted = Map::with_capacity(1);
        redacted.insert("_id".to_string(), Value::from(1));
    }
    redacted
}

fn redact_level(projection: &Projection, prefix: &str, restricted: &[String]) -> Projection {
    let mut out = Map::with_capacity(projection.len());
    for (key, value) in projection {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };

        if is_restricted(&path, restricted) && is_inclusion(value) {
            tracing::debug!(path = %path, "Removing restricted field from projection");
            continue;
        }

        match value {
            Value::Object(nested) if is_sub_projection(nested) => {
                let nested = redact_level(nested, &path, restricted);
                if !nested.is_empty() {
                    out.insert(key.clone(), Value::Object(nested));
                }
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

/// `path` equals a restricted path or lies beneath one.
fn is_restricted(path: &str, restricted: &[String]) -> bool {
    restricted.iter().any(|r| {
        path == r
            || path
                .strip_prefix(r.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    })
}

fn is_inclusion(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::Null => false,
        Value::Object(nested) if is_sub_projection(nested) => has_inclusion(nested),
        _ => true,
    }
}

fn has_inclusion(projection: &Projection) -> bool {
    projection
        .iter()
        .any(|(key, value)| key != "_id" && is_inclusion(value))
}

/// A nested projection document, as opposed to an expression object.
fn is_sub_projection(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|key| !key.starts_with('$'))
}

fn strip_path(value: &mut Value, segments: &[&str]) {
    match value {
        Value::Array(items) => {
            for item in items {
                strip_path(item, segments);
            }
        }
        Value::Object(map) => match segments {
            [] => {}
            [last] => {
                map.shift_remove(*last);
            }
            [head, rest @ ..] => {
                if let Some(child) = map.get_mut(*head) {
                    strip_path(child, rest);
                }
            }
        },
        _ => {}
    }
}
