//! Case-insensitive retry rewrite.
//!
//! After a zero-result query, string equality predicates are relaxed to
//! anchored, escaped, case-insensitive regular expressions and the query is
//! run once more. Identifier-valued fields are never relaxed.

use std::sync::Arc;

use mongate_core::query::MATCH;
use mongate_core::{CandidateQuery, CollectionPolicy, FilterDocument, Identifier, PolicyConfig};
use serde_json::{Map, Value};

use crate::algebra::{map_leaves, Leaf};

/// Builds the case-insensitive variant of a query.
#[derive(Debug, Clone)]
pub struct CaseInsensitiveRetry {
    policy: Arc<PolicyConfig>,
}

impl CaseInsensitiveRetry {
    pub fn new(policy: Arc<PolicyConfig>) -> Self {
        Self { policy }
    }

    /// Relax every plain string equality in `doc`.
    pub fn apply(&self, doc: &FilterDocument, collection: &str) -> FilterDocument {
        let policy = self.policy.get_policy(collection);
        map_leaves(doc, |leaf| relax(leaf, policy))
    }

    /// Relax a filter's predicate, or every `$match` body of a pipeline.
    ///
    /// Returns `None` when nothing would change, so the caller can skip the
    /// second execution.
    pub fn apply_query(&self, query: &CandidateQuery, collection: &str) -> Option<CandidateQuery> {
        let relaxed = match query {
            CandidateQuery::Filter { filter, projection } => CandidateQuery::Filter {
                filter: self.apply(filter, collection),
                projection: projection.clone(),
            },
            CandidateQuery::Aggregation(stages) => CandidateQuery::Aggregation(
                stages
                    .iter()
                    .map(|stage| match stage.get(MATCH) {
                        Some(Value::Object(body)) => {
                            let mut relaxed = stage.clone();
                            relaxed.insert(
                                MATCH.to_string(),
                                Value::Object(self.apply(body, collection)),
                            );
                            relaxed
                        }
                        _ => stage.clone(),
                    })
                    .collect(),
            ),
        };

        if &relaxed == query {
            tracing::debug!(collection, "no string predicates to relax");
            None
        } else {
            Some(relaxed)
        }
    }
}

/// Whether a field path looks like it holds an identifier: its last segment
/// is `_id` or `id`, or ends in `Id`.
pub fn is_identifier_path(path: &str) -> bool {
    let last = path.rsplit('.').next().unwrap_or(path);
    last == "_id" || last == "id" || last.ends_with("Id")
}

fn relax(leaf: Leaf<'_>, policy: Option<&CollectionPolicy>) -> Value {
    let Value::String(literal) = leaf.value else {
        return leaf.value.clone();
    };
    if !leaf.is_equality() {
        return leaf.value.clone();
    }
    if policy.is_some_and(|policy| policy.is_identifier_field(leaf.path)) {
        return leaf.value.clone();
    }
    if is_identifier_path(leaf.path) && Identifier::parse(literal).is_object_id() {
        return leaf.value.clone();
    }

    let mut pattern = Map::with_capacity(2);
    pattern.insert(
        "$regex".to_string(),
        Value::String(format!("^{}$", regex::escape(literal))),
    );
    pattern.insert("$options".to_string(), Value::String("i".to_string()));
    Value::Object(pattern)
}
