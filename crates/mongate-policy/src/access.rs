//! Collection access checks.

use mongate_core::query::{stage_operator, FACET, GRAPH_LOOKUP, LOOKUP, UNION_WITH};
use mongate_core::{AuthorizationContext, CandidateQuery, Stage};
use serde_json::Value;

use crate::error::AccessError;

/// Checks that a query only reads collections the caller may read.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionAccessValidator;

impl CollectionAccessValidator {
    pub fn new() -> Self {
        Self
    }

    /// Check the target collection and every pipeline source.
    pub fn check(
        &self,
        query: &CandidateQuery,
        ctx: &AuthorizationContext,
        collection: &str,
    ) -> Result<(), AccessError> {
        if !ctx.can_access(collection) {
            tracing::warn!(
                collection,
                role = %ctx.role,
                "Collection not permitted for role"
            );
            return Err(AccessError::collection_not_permitted(collection, &ctx.role));
        }

        for (stage, source) in referenced_collections(query) {
            if !ctx.can_access(&source) {
                tracing::warn!(
                    collection,
                    stage,
                    source = %source,
                    role = %ctx.role,
                    "Pipeline source not permitted for role"
                );
                return Err(AccessError::source_not_permitted(&source, stage, &ctx.role));
            }
        }
        Ok(())
    }
}

/// Every `(stage operator, collection)` a pipeline reads from besides its own
/// collection, including nested `$lookup` pipelines and `$facet` branches.
pub fn referenced_collections(query: &CandidateQuery) -> Vec<(&'static str, String)> {
    let mut sources = Vec::new();
    if let CandidateQuery::Aggregation(stages) = query {
        collect_sources(stages.iter(), &mut sources);
    }
    sources
}

fn collect_sources<'a, I>(stages: I, sources: &mut Vec<(&'static str, String)>)
where
    I: IntoIterator<Item = &'a Stage>,
{
    for stage in stages {
        let Some(operator) = stage_operator(stage) else {
            continue;
        };
        let body = &stage[operator];
        match operator {
            LOOKUP => {
                if let Some(from) = body.get("from").and_then(Value::as_str) {
                    sources.push((LOOKUP, from.to_string()));
                }
                if let Some(Value::Array(nested)) = body.get("pipeline") {
                    collect_sources(object_stages(nested), sources);
                }
            }
            GRAPH_LOOKUP => {
                if let Some(from) = body.get("from").and_then(Value::as_str) {
                    sources.push((GRAPH_LOOKUP, from.to_string()));
                }
            }
            UNION_WITH => match body {
                Value::String(coll) => sources.push((UNION_WITH, coll.clone())),
                Value::Object(union) => {
                    if let Some(coll) = union.get("coll").and_then(Value::as_str) {
                        sources.push((UNION_WITH, coll.to_string()));
                    }
                    if let Some(Value::Array(nested)) = union.get("pipeline") {
                        collect_sources(object_stages(nested), sources);
                    }
                }
                _ => {}
            },
            FACET => {
                if let Value::Object(branches) = body {
                    for branch in branches.values() {
                        if let Value::Array(nested) = branch {
                            collect_sources(object_stages(nested), sources);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

fn object_stages(values: &[Value]) -> impl Iterator<Item = &Stage> {
    values.iter().filter_map(Value::as_object)
}
