//! Scoping clause injection.
//!
//! The caller's scope is injected at every place a query reads a
//! policy-bearing collection: the target collection itself, and every
//! `$lookup`, `$graphLookup` and `$unionWith` source, including those nested
//! in sub-pipelines and `$facet` branches.

use std::sync::Arc;

use mongate_core::query::{stage_operator, FACET, GRAPH_LOOKUP, LOOKUP, MATCH, UNION_WITH};
use mongate_core::{
    AuthorizationContext, CandidateQuery, FilterDocument, Identifier, PolicyConfig, ScopeSource,
    Stage,
};
use serde_json::{Map, Value};

use crate::algebra::{build_clause, merge_clause, requires_clause};
use crate::error::RlsError;

const PIPELINE: &str = "pipeline";
const RESTRICT_SEARCH: &str = "restrictSearchWithMatch";

/// Injects mandatory tenant and role scoping into candidate queries.
#[derive(Debug, Clone)]
pub struct TenantIsolationRewriter {
    policy: Arc<PolicyConfig>,
}

impl TenantIsolationRewriter {
    /// Create a rewriter over a shared policy.
    pub fn new(policy: Arc<PolicyConfig>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// `{tenant_field: tenant_id}` for a policy-bearing collection.
    pub fn tenant_clause(
        &self,
        ctx: &AuthorizationContext,
        collection: &str,
    ) -> Option<FilterDocument> {
        let policy = self.policy.get_policy(collection)?;
        Some(build_clause(&policy.tenant_field, ctx.tenant_id.to_value()))
    }

    /// The role-specific clause, when the caller's role has a scope entry.
    ///
    /// A `processes` scope is a membership test keyed by the full dot path,
    /// so it also matches when the path runs through an array of embedded
    /// documents (`user.process._id`). With no assigned processes it yields
    /// `{"$in": []}`, which matches nothing.
    pub fn role_clause(
        &self,
        ctx: &AuthorizationContext,
        collection: &str,
    ) -> Option<FilterDocument> {
        let scope = self.policy.get_policy(collection)?.role_scope(&ctx.role)?;
        match scope.source {
            ScopeSource::User => Some(build_clause(
                &scope.field,
                Identifier::parse(&ctx.user_id).to_value(),
            )),
            ScopeSource::Processes => {
                let ids = ctx.process_ids.iter().map(Identifier::to_value).collect();
                let mut membership = Map::with_capacity(1);
                membership.insert("$in".to_string(), Value::Array(ids));

                let mut clause = Map::with_capacity(1);
                clause.insert(scope.field.clone(), Value::Object(membership));
                Some(clause)
            }
        }
    }

    /// Tenant clause ANDed with the role clause, if any.
    pub fn scope_clause(
        &self,
        ctx: &AuthorizationContext,
        collection: &str,
    ) -> Option<FilterDocument> {
        let tenant = self.tenant_clause(ctx, collection)?;
        Some(match self.role_clause(ctx, collection) {
            Some(role) => merge_clause(tenant, &role),
            None => tenant,
        })
    }

    /// Scope a candidate query to the caller.
    ///
    /// The caller's tenant clause (and role clause) is ANDed onto the query,
    /// whatever tenant value the query already asserts. Pipeline sources that
    /// read a policy-bearing collection are scoped to that collection's
    /// clauses, even when the target collection itself is exempt.
    pub fn apply(
        &self,
        query: CandidateQuery,
        ctx: &AuthorizationContext,
        collection: &str,
    ) -> CandidateQuery {
        let query = match query {
            CandidateQuery::Aggregation(stages) => CandidateQuery::Aggregation(
                stages
                    .into_iter()
                    .map(|stage| self.scope_stage(stage, ctx))
                    .collect(),
            ),
            filter => filter,
        };

        let Some(tenant) = self.tenant_clause(ctx, collection) else {
            tracing::debug!(collection, "collection has no scoping policy; query left unchanged");
            return query;
        };
        let role = self.role_clause(ctx, collection);

        tracing::debug!(
            collection,
            kind = %query.kind(),
            role = %ctx.role,
            role_scoped = role.is_some(),
            "injecting scoping clauses"
        );

        match query {
            CandidateQuery::Filter { filter, projection } => {
                let mut filter = merge_clause(filter, &tenant);
                if let Some(role) = &role {
                    filter = merge_clause(filter, role);
                }
                CandidateQuery::Filter { filter, projection }
            }
            CandidateQuery::Aggregation(mut stages) => {
                let clause = match &role {
                    Some(role) => merge_clause(tenant, role),
                    None => tenant,
                };
                if !stages.first_mut().is_some_and(|first| merge_into_match(first, &clause)) {
                    stages.insert(0, match_stage(&clause));
                }
                CandidateQuery::Aggregation(stages)
            }
        }
    }

    /// Check that a rewritten query requires the caller's scoping clauses.
    ///
    /// For a pipeline, the clauses must be required by a leading `$match`,
    /// and every source reading a policy-bearing collection must be scoped
    /// the same way.
    pub fn verify(
        &self,
        query: &CandidateQuery,
        ctx: &AuthorizationContext,
        collection: &str,
    ) -> Result<(), RlsError> {
        let empty = FilterDocument::new();
        let predicate = match query {
            CandidateQuery::Filter { filter, .. } => filter,
            CandidateQuery::Aggregation(stages) => {
                for stage in stages {
                    self.verify_stage(stage, ctx)?;
                }
                stages.first().and_then(match_body).unwrap_or(&empty)
            }
        };

        self.verify_predicate(predicate, ctx, collection)
            .map_err(|missing| match missing {
                Missing::Tenant => RlsError::MissingTenantClause {
                    collection: collection.to_string(),
                },
                Missing::Role => RlsError::MissingRoleClause {
                    collection: collection.to_string(),
                },
            })
    }

    fn verify_predicate(
        &self,
        predicate: &FilterDocument,
        ctx: &AuthorizationContext,
        collection: &str,
    ) -> Result<(), Missing> {
        let Some(tenant) = self.tenant_clause(ctx, collection) else {
            return Ok(());
        };
        if !requires_clause(predicate, &tenant) {
            return Err(Missing::Tenant);
        }
        if let Some(role) = self.role_clause(ctx, collection) {
            if !requires_clause(predicate, &role) {
                return Err(Missing::Role);
            }
        }
        Ok(())
    }

    fn scope_stage(&self, mut stage: Stage, ctx: &AuthorizationContext) -> Stage {
        let operator = match stage_operator(&stage) {
            Some(LOOKUP) => LOOKUP,
            Some(GRAPH_LOOKUP) => GRAPH_LOOKUP,
            Some(UNION_WITH) => UNION_WITH,
            Some(FACET) => FACET,
            _ => return stage,
        };
        if let Some(body) = stage.get_mut(operator) {
            self.scope_body(operator, body, ctx);
        }
        stage
    }

    fn scope_body(&self, operator: &'static str, body: &mut Value, ctx: &AuthorizationContext) {
        match (operator, body) {
            (LOOKUP, Value::Object(lookup)) => {
                let from = lookup.get("from").and_then(Value::as_str).map(str::to_string);
                self.scope_sub_pipeline(lookup, from.as_deref(), ctx);
            }
            (GRAPH_LOOKUP, Value::Object(graph)) => {
                let clause = graph
                    .get("from")
                    .and_then(Value::as_str)
                    .and_then(|from| self.scope_clause(ctx, from));
                if let Some(clause) = clause {
                    let restrict = match graph.get_mut(RESTRICT_SEARCH) {
                        Some(Value::Object(existing)) => {
                            merge_clause(std::mem::take(existing), &clause)
                        }
                        _ => clause,
                    };
                    graph.insert(RESTRICT_SEARCH.to_string(), Value::Object(restrict));
                }
            }
            (UNION_WITH, body) => {
                let converted = match &mut *body {
                    Value::String(coll) if self.policy.get_policy(coll).is_some() => Some(std::mem::take(coll)),
                    _ => None,
                };
                if let Some(coll) = converted {
                    let mut union = Map::with_capacity(2);
                    union.insert("coll".to_string(), Value::String(coll));
                    *body = Value::Object(union);
                }
                if let Value::Object(union) = &mut *body {
                    let coll = union.get("coll").and_then(Value::as_str).map(str::to_string);
                    self.scope_sub_pipeline(union, coll.as_deref(), ctx);
                }
            }
            (FACET, Value::Object(branches)) => {
                for branch in branches.values_mut() {
                    if let Value::Array(nested) = branch {
                        *nested = self.scope_nested(std::mem::take(nested), None, ctx);
                    }
                }
            }
            _ => {}
        }
    }

    /// Scope the `pipeline` of a `$lookup` or `$unionWith` body reading
    /// `source`, adding the pipeline when the source needs one.
    fn scope_sub_pipeline(
        &self,
        body: &mut Map<String, Value>,
        source: Option<&str>,
        ctx: &AuthorizationContext,
    ) {
        let present = body.contains_key(PIPELINE);
        let nested = match body.get_mut(PIPELINE) {
            Some(Value::Array(nested)) => std::mem::take(nested),
            _ => Vec::new(),
        };
        let scoped = self.scope_nested(nested, source, ctx);
        if present || !scoped.is_empty() {
            body.insert(PIPELINE.to_string(), Value::Array(scoped));
        }
    }

    fn scope_nested(
        &self,
        nested: Vec<Value>,
        source: Option<&str>,
        ctx: &AuthorizationContext,
    ) -> Vec<Value> {
        let mut stages: Vec<Value> = nested
            .into_iter()
            .map(|item| match item {
                Value::Object(stage) => Value::Object(self.scope_stage(stage, ctx)),
                other => other,
            })
            .collect();

        let Some((source, clause)) = source.and_then(|source| {
            self.scope_clause(ctx, source).map(|clause| (source, clause))
        }) else {
            return stages;
        };
        tracing::debug!(source, role = %ctx.role, "scoping pipeline source");

        let merged = match stages.first_mut() {
            Some(Value::Object(first)) => merge_into_match(first, &clause),
            _ => false,
        };
        if !merged {
            stages.insert(0, Value::Object(match_stage(&clause)));
        }
        stages
    }

    fn verify_stage(&self, stage: &Stage, ctx: &AuthorizationContext) -> Result<(), RlsError> {
        let Some(operator) = stage_operator(stage) else {
            return Ok(());
        };
        let body = &stage[operator];
        match (operator, body) {
            (LOOKUP, Value::Object(lookup)) => {
                let from = lookup.get("from").and_then(Value::as_str);
                self.verify_sub_pipeline(LOOKUP, lookup.get(PIPELINE), from, ctx)
            }
            (GRAPH_LOOKUP, Value::Object(graph)) => {
                let Some(from) = graph.get("from").and_then(Value::as_str) else {
                    return Ok(());
                };
                let empty = FilterDocument::new();
                let restrict = match graph.get(RESTRICT_SEARCH) {
                    Some(Value::Object(restrict)) => restrict,
                    _ => &empty,
                };
                self.verify_predicate(restrict, ctx, from)
                    .map_err(|_| unscoped(GRAPH_LOOKUP, from))
            }
            (UNION_WITH, Value::String(coll)) => match self.policy.get_policy(coll) {
                Some(_) => Err(unscoped(UNION_WITH, coll)),
                None => Ok(()),
            },
            (UNION_WITH, Value::Object(union)) => {
                let coll = union.get("coll").and_then(Value::as_str);
                self.verify_sub_pipeline(UNION_WITH, union.get(PIPELINE), coll, ctx)
            }
            (FACET, Value::Object(branches)) => {
                for branch in branches.values() {
                    self.verify_sub_pipeline(FACET, Some(branch), None, ctx)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn verify_sub_pipeline(
        &self,
        stage: &'static str,
        pipeline: Option<&Value>,
        source: Option<&str>,
        ctx: &AuthorizationContext,
    ) -> Result<(), RlsError> {
        let nested = match pipeline {
            Some(Value::Array(nested)) => nested.as_slice(),
            _ => &[],
        };
        for item in nested {
            if let Value::Object(nested_stage) = item {
                self.verify_stage(nested_stage, ctx)?;
            }
        }

        let Some(source) = source else {
            return Ok(());
        };
        let empty = FilterDocument::new();
        let predicate = nested
            .first()
            .and_then(Value::as_object)
            .and_then(match_body)
            .unwrap_or(&empty);
        self.verify_predicate(predicate, ctx, source)
            .map_err(|_| unscoped(stage, source))
    }
}

/// Which scoping clause a predicate is missing.
enum Missing {
    Tenant,
    Role,
}

fn unscoped(stage: &'static str, collection: &str) -> RlsError {
    RlsError::UnscopedSource {
        stage,
        collection: collection.to_string(),
    }
}

/// The body of a single-key `$match` stage.
fn match_body(stage: &Stage) -> Option<&FilterDocument> {
    match stage.get(MATCH) {
        Some(Value::Object(body)) if stage.len() == 1 => Some(body),
        _ => None,
    }
}

/// Merge `clause` into `stage` if it is a `$match`. A non-object body is
/// replaced by the clause.
fn merge_into_match(stage: &mut Stage, clause: &FilterDocument) -> bool {
    if stage.len() != 1 {
        return false;
    }
    let Some(body) = stage.get_mut(MATCH) else {
        return false;
    };
    let merged = match body.take() {
        Value::Object(existing) => merge_clause(existing, clause),
        _ => clause.clone(),
    };
    *body = Value::Object(merged);
    true
}

fn match_stage(clause: &FilterDocument) -> Stage {
    let mut stage = Stage::with_capacity(1);
    stage.insert(MATCH.to_string(), Value::Object(clause.clone()));
    stage
}
