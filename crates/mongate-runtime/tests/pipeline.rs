//! End-to-end pipeline tests: a raw candidate query goes in, the executor sees
//! the scoped query, the caller sees redacted documents.

mod common;

use common::*;
use mongate_core::{CacheConfig, MongateConfig, PolicyConfig, RetryConfig};
use mongate_runtime::{
    AuditEventType, AuthorizationContextCache, MemoryAuditSink, PipelineError,
    QuerySecurityPipeline,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;

struct Harness {
    source: Arc<MemorySource>,
    executor: Arc<RecordingExecutor>,
    audit: Arc<MemoryAuditSink>,
    pipeline: QuerySecurityPipeline<Arc<RecordingExecutor>, Arc<MemoryAuditSink>>,
}

fn harness() -> Harness {
    harness_with(RetryConfig::default())
}

fn harness_with(retry: RetryConfig) -> Harness {
    let policy = Arc::new(policy());
    let source = Arc::new(MemorySource::seeded());
    let executor = Arc::new(RecordingExecutor::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let cache = Arc::new(AuthorizationContextCache::new(
        Arc::clone(&source) as _,
        Arc::clone(&policy),
        &CacheConfig::default(),
    ));
    let pipeline = QuerySecurityPipeline::new(
        policy,
        cache,
        Arc::clone(&executor),
        Arc::clone(&audit),
    )
    .with_retry_config(&retry);

    Harness {
        source,
        executor,
        audit,
        pipeline,
    }
}

fn find(collection: &str, filter: Value) -> Executed {
    Executed::Find {
        collection: collection.to_string(),
        filter,
        projection: None,
    }
}

// =============================================================================
// TENANT SCOPING
// =============================================================================

#[test]
fn test_filter_is_scoped_to_callers_tenant() {
    let h = harness();
    h.executor.respond(vec![json!({"_id": 1, "details": {"type": "inbound"}})]);

    let outcome = h
        .pipeline
        .run(ANALYST, "call-interaction", json!({"details.type": "inbound"}))
        .unwrap();

    assert_eq!(
        h.executor.calls(),
        vec![find(
            "call-interaction",
            json!({"$and": [{"details.type": "inbound"}, {"companyId": oid(TENANT_A)}]})
        )]
    );
    assert_eq!(outcome.documents.len(), 1);
    assert!(!outcome.retried);
}

#[test]
fn test_pipeline_gets_leading_match() {
    let h = harness();
    h.executor.respond(vec![json!({"_id": "open", "n": 3})]);

    h.pipeline
        .run(
            ANALYST,
            "call-interaction",
            json!([{"$group": {"_id": "$status", "n": {"$sum": 1}}}]),
        )
        .unwrap();

    assert_eq!(
        h.executor.calls(),
        vec![Executed::Aggregate {
            collection: "call-interaction".to_string(),
            pipeline: json!([
                {"$match": {"companyId": oid(TENANT_A)}},
                {"$group": {"_id": "$status", "n": {"$sum": 1}}}
            ]),
        }]
    );
}

#[test]
fn test_forged_tenant_cannot_widen_scope() {
    let h = harness();
    h.executor.respond(Vec::new());

    let outcome = h
        .pipeline
        .run(ANALYST, "call-interaction", json!({"companyId": TENANT_B}))
        .unwrap();

    let calls = h.executor.calls();
    assert_eq!(
        calls[0],
        find(
            "call-interaction",
            json!({"$and": [{"companyId": TENANT_B}, {"companyId": oid(TENANT_A)}]})
        )
    );
    // Only identifier fields were present, so there is nothing to relax.
    assert_eq!(calls.len(), 1);
    assert!(outcome.documents.is_empty());
}

#[test]
fn test_process_manager_is_scoped_to_processes() {
    let h = harness();
    h.executor.respond(vec![json!({"name": "Acme"})]);

    h.pipeline
        .run(MANAGER, "customer", json!({"find": {"name": "Acme"}}))
        .unwrap();

    assert_eq!(
        h.executor.calls(),
        vec![find(
            "customer",
            json!({"$and": [
                {"name": "Acme"},
                {"company": {"_id": oid(TENANT_A)}},
                {"processId": {"$in": [oid(PROCESS_1), oid(PROCESS_2)]}}
            ]})
        )]
    );
}

#[test]
fn test_dotted_process_scope_is_a_membership_test() {
    let h = harness();
    h.pipeline.run(MANAGER, "ticket", json!({})).unwrap();

    assert_eq!(
        h.executor.calls(),
        vec![find(
            "ticket",
            json!({"$and": [
                {"companyId": oid(TENANT_A)},
                {"user.process._id": {"$in": [oid(PROCESS_1), oid(PROCESS_2)]}}
            ]})
        )]
    );
}

#[test]
fn test_unknown_role_gets_the_default_roles_scope() {
    let h = harness();
    h.source.insert(INTERN, "Intern", TENANT_A, &[]);

    h.pipeline.run(INTERN, "task", json!({})).unwrap();

    assert_eq!(
        h.executor.calls(),
        vec![find(
            "task",
            json!({"$and": [{"companyId": oid(TENANT_A)}, {"assignee": oid(INTERN)}]})
        )]
    );
    assert_eq!(h.pipeline.cache().get(INTERN).unwrap().role, "user");
}

#[test]
fn test_union_with_scoped_collection_is_scoped_and_redacted() {
    let h = harness();

    h.pipeline
        .run(ANALYST, "call-interaction", json!([{"$unionWith": "customer"}]))
        .unwrap();

    assert_eq!(
        h.executor.calls(),
        vec![Executed::Aggregate {
            collection: "call-interaction".to_string(),
            pipeline: json!([
                {"$match": {"companyId": oid(TENANT_A)}},
                {"$unionWith": {"coll": "customer", "pipeline": [
                    {"$match": {"company": {"_id": oid(TENANT_A)}}},
                    {"$project": {"phone": 0, "billing.iban": 0}}
                ]}}
            ]),
        }]
    );
}

#[test]
fn test_lookup_from_global_collection_into_scoped_one_is_scoped() {
    let h = harness();

    h.pipeline
        .run(
            ANALYST,
            "country",
            json!([{"$lookup": {"from": "call-interaction", "localField": "code", "foreignField": "country", "as": "calls"}}]),
        )
        .unwrap();

    assert_eq!(
        h.executor.calls(),
        vec![Executed::Aggregate {
            collection: "country".to_string(),
            pipeline: json!([
                {"$lookup": {
                    "from": "call-interaction",
                    "localField": "code",
                    "foreignField": "country",
                    "as": "calls",
                    "pipeline": [{"$match": {"companyId": oid(TENANT_A)}}]
                }}
            ]),
        }]
    );
}

#[test]
fn test_malformed_candidate_degrades_to_scoped_empty_filter() {
    let h = harness();
    h.executor.respond(Vec::new());

    h.pipeline.run(ANALYST, "call-interaction", json!(42)).unwrap();

    assert_eq!(
        h.executor.calls(),
        vec![find("call-interaction", json!({"companyId": oid(TENANT_A)}))]
    );
}

#[test]
fn test_global_collection_is_not_scoped() {
    let h = harness();
    h.executor.respond(vec![json!({"code": "FR"})]);

    h.pipeline
        .run(ANALYST, "country", json!({"code": "FR"}))
        .unwrap();

    assert_eq!(h.executor.calls(), vec![find("country", json!({"code": "FR"}))]);
}

// =============================================================================
// REFUSALS
// =============================================================================

#[test]
fn test_context_failure_is_access_denied() {
    let h = harness();
    h.source.set_failing(true);

    let err = h
        .pipeline
        .run(ANALYST, "call-interaction", json!({}))
        .unwrap_err();

    assert!(matches!(err, PipelineError::ContextUnavailable(_)));
    assert_eq!(err.to_string(), "access denied");
    assert!(h.executor.calls().is_empty());
    assert_eq!(h.audit.events()[0].event_type, AuditEventType::AccessDenied);
}

#[test]
fn test_unknown_user_is_access_denied() {
    let h = harness();
    let err = h.pipeline.run("nobody", "call-interaction", json!({})).unwrap_err();
    assert_eq!(err.to_string(), "access denied");
    assert!(h.executor.calls().is_empty());
}

#[test]
fn test_writes_are_refused() {
    let h = harness();
    let err = h
        .pipeline
        .run(ANALYST, "call-interaction", json!({"deleteMany": {}}))
        .unwrap_err();

    match err {
        PipelineError::UnsupportedOperation { verb } => assert_eq!(verb, "deleteMany"),
        other => panic!("expected UnsupportedOperation, got {other:?}"),
    }
    assert!(h.executor.calls().is_empty());
    assert_eq!(h.audit.events()[0].event_type, AuditEventType::QueryRejected);
}

#[test]
fn test_unknown_collection_is_refused_generically() {
    let h = harness();
    let err = h
        .pipeline
        .run(ADMIN, "payroll_internal", json!({}))
        .unwrap_err();

    assert!(matches!(err, PipelineError::UnsupportedCollection { .. }));
    assert_eq!(err.to_string(), "unsupported collection");
    assert!(h.executor.calls().is_empty());
}

#[test]
fn test_unpermitted_collection_is_denied() {
    let h = harness();
    let err = h
        .pipeline
        .run(MANAGER, "call-interaction", json!({}))
        .unwrap_err();

    assert!(matches!(err, PipelineError::CollectionDenied(_)));
    assert_eq!(err.to_string(), "access denied");
    assert_eq!(h.audit.events()[0].event_type, AuditEventType::AccessDenied);
}

#[test]
fn test_unpermitted_lookup_source_is_denied() {
    let h = harness();
    let err = h
        .pipeline
        .run(
            ANALYST,
            "customer",
            json!([{"$lookup": {"from": "payroll", "localField": "a", "foreignField": "b", "as": "p"}}]),
        )
        .unwrap_err();

    assert!(matches!(err, PipelineError::CollectionDenied(_)));
    assert!(h.executor.calls().is_empty());
}

#[test]
fn test_unknown_pipeline_source_is_refused() {
    let h = harness();
    let err = h
        .pipeline
        .run(ANALYST, "customer", json!([{"$unionWith": "legacy"}]))
        .unwrap_err();

    match err {
        PipelineError::UnsupportedCollection { collection } => assert_eq!(collection, "legacy"),
        other => panic!("expected UnsupportedCollection, got {other:?}"),
    }
    assert!(h.executor.calls().is_empty());
}

#[test]
fn test_execution_failure_is_generic() {
    let h = harness();
    h.executor.fail("E11000 index companyId_1 corrupted");

    let err = h
        .pipeline
        .run(ANALYST, "call-interaction", json!({"status": "open"}))
        .unwrap_err();

    assert!(matches!(err, PipelineError::ExecutionFailed(_)));
    assert_eq!(err.to_string(), "query execution failed");
    let events = h.audit.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, AuditEventType::QueryFailed);
}

// =============================================================================
// RETRY
// =============================================================================

#[test]
fn test_zero_results_retry_case_insensitively_once() {
    let h = harness();
    h.executor.respond(Vec::new());
    h.executor.respond(vec![json!({"agent": "Bob"})]);

    let outcome = h
        .pipeline
        .run(ANALYST, "call-interaction", json!({"agent": "bob"}))
        .unwrap();

    let calls = h.executor.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[1],
        find(
            "call-interaction",
            json!({"$and": [
                {"agent": {"$regex": "^bob$", "$options": "i"}},
                {"companyId": oid(TENANT_A)}
            ]})
        )
    );
    assert!(outcome.retried);
    assert_eq!(outcome.documents, vec![json!({"agent": "Bob"})]);

    let events = h.audit.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, AuditEventType::QueryExecuted);
    assert_eq!(events[1].event_type, AuditEventType::QueryRetried);
    assert_eq!(events[0].request_id, events[1].request_id);
    assert_eq!(events[1].result_count, Some(1));
}

#[test]
fn test_retry_can_be_disabled() {
    let h = harness_with(RetryConfig {
        case_insensitive: false,
    });
    h.executor.respond(Vec::new());

    let outcome = h
        .pipeline
        .run(ANALYST, "call-interaction", json!({"agent": "bob"}))
        .unwrap();

    assert_eq!(h.executor.calls().len(), 1);
    assert!(!outcome.retried);
}

// =============================================================================
// REDACTION
// =============================================================================

#[test]
fn test_restricted_fields_are_withheld() {
    let h = harness();
    h.executor.respond(vec![json!({
        "name": "Acme",
        "phone": "555-0100",
        "billing": {"iban": "FR76", "currency": "EUR"}
    })]);

    let outcome = h
        .pipeline
        .run(
            ANALYST,
            "customer",
            json!({"find": {"name": "Acme"}, "projection": {"name": 1, "phone": 1, "billing": 1}}),
        )
        .unwrap();

    let Executed::Find { projection, .. } = &h.executor.calls()[0] else {
        panic!("expected a find");
    };
    assert_eq!(projection, &Some(json!({"name": 1, "billing": 1})));
    assert_eq!(
        outcome.documents,
        vec![json!({"name": "Acme", "billing": {"currency": "EUR"}})]
    );
}

#[test]
fn test_projects_inside_facets_are_redacted() {
    let h = harness();
    h.executor.respond(vec![json!({"a": [{"_id": 1, "phone": "555-1"}]})]);

    h.pipeline
        .run(
            ANALYST,
            "customer",
            json!([{"$facet": {"a": [{"$project": {"phone": 1}}]}}]),
        )
        .unwrap();

    assert_eq!(
        h.executor.calls(),
        vec![Executed::Aggregate {
            collection: "customer".to_string(),
            pipeline: json!([
                {"$match": {"company": {"_id": oid(TENANT_A)}}},
                {"$facet": {"a": [{"$project": {"_id": 1}}]}}
            ]),
        }]
    );
}

// =============================================================================
// CONFIGURATION
// =============================================================================

#[test]
fn test_from_config_wires_cache_retry_and_audit() {
    let mut config = MongateConfig {
        policy: policy(),
        ..Default::default()
    };
    config.retry.case_insensitive = false;
    config.audit.enabled = false;

    let executor = Arc::new(RecordingExecutor::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let pipeline = QuerySecurityPipeline::from_config(
        &config,
        Arc::new(MemorySource::seeded()),
        Arc::clone(&executor),
        Arc::clone(&audit),
    );

    pipeline
        .run(ANALYST, "call-interaction", json!({"agent": "bob"}))
        .unwrap();

    assert_eq!(executor.calls().len(), 1);
    assert!(audit.is_empty());
    assert_eq!(pipeline.cache().len(), 1);
    assert!(pipeline.cache().invalidate(ANALYST));
}

#[test]
fn test_policy_round_trips_through_yaml() {
    let yaml = r#"
collections:
  call-interaction:
    tenant_field: companyId
  customer:
    tenant_field: company._id
    role_scopes:
      process_manager:
        field: processId
        source: processes
    restricted_fields:
      user: [phone]
global_collections: [country]
role_access:
  user: [call-interaction, customer, country]
  admin: all
"#;
    let policy = PolicyConfig::from_yaml(yaml).unwrap();
    policy.validate().unwrap();
    assert!(policy.is_known("customer"));
    assert!(policy.is_global("country"));
    assert_eq!(policy.permitted_collections("admin").len(), 3);
}
