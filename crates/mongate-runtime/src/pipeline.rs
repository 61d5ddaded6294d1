use crate::adapter::{execute, QueryExecutor};
use crate::audit::{AuditEvent, AuditEventType, AuditSink};
use crate::cache::{AuthorizationContextCache, ContextSource};
use crate::error::PipelineError;
use mongate_core::{
    classify, AuditConfig, AuthorizationContext, CandidateQuery, MongateConfig, PolicyConfig,
    QueryOperation, RetryConfig,
};
use mongate_policy::{referenced_collections, CollectionAccessValidator, RoleProjectionRedactor};
use mongate_rls::{CaseInsensitiveRetry, TenantIsolationRewriter};
use serde_json::Value;
use std::error::Error as _;
use std::sync::Arc;
use uuid::Uuid;

/// Result of a pipeline run.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub collection: String,
    /// The query the documents came from, after scoping and redaction.
    pub executed_query: CandidateQuery,
    /// Result documents, with restricted fields stripped.
    pub documents: Vec<Value>,
    /// Whether the documents came from the case-insensitive retry.
    pub retried: bool,
}

pub struct QuerySecurityPipeline<E: QueryExecutor, S: AuditSink> {
    policy: Arc<PolicyConfig>,
    cache: Arc<AuthorizationContextCache>,
    rewriter: TenantIsolationRewriter,
    redactor: RoleProjectionRedactor,
    access: CollectionAccessValidator,
    retry: Option<CaseInsensitiveRetry>,
    executor: E,
    audit: S,
    audit_config: AuditConfig,
}

impl<E: QueryExecutor, S: AuditSink> QuerySecurityPipeline<E, S> {
    pub fn new(
        policy: Arc<PolicyConfig>,
        cache: Arc<AuthorizationContextCache>,
        executor: E,
        audit: S,
    ) -> Self {
        Self {
            cache,
            rewriter: TenantIsolationRewriter::new(Arc::clone(&policy)),
            redactor: RoleProjectionRedactor::new(Arc::clone(&policy)),
            access: CollectionAccessValidator::new(),
            retry: Some(CaseInsensitiveRetry::new(Arc::clone(&policy))),
            policy,
            executor,
            audit,
            audit_config: AuditConfig::default(),
        }
    }

    /// Build the pipeline and its context cache from a loaded configuration.
    pub fn from_config(
        config: &MongateConfig,
        source: Arc<dyn ContextSource>,
        executor: E,
        audit: S,
    ) -> Self {
        let policy = Arc::new(config.policy.clone());
        let cache = Arc::new(AuthorizationContextCache::new(
            source,
            Arc::clone(&policy),
            &config.cache,
        ));
        Self::new(policy, cache, executor, audit)
            .with_retry_config(&config.retry)
            .with_audit_config(config.audit.clone())
    }

    pub fn with_retry_config(mut self, config: &RetryConfig) -> Self {
        self.retry = config
            .case_insensitive
            .then(|| CaseInsensitiveRetry::new(Arc::clone(&self.policy)));
        self
    }

    pub fn with_audit_config(mut self, config: AuditConfig) -> Self {
        self.audit_config = config;
        self
    }

    /// The context cache, for invalidation on identity or role changes.
    pub fn cache(&self) -> &Arc<AuthorizationContextCache> {
        &self.cache
    }

    /// Run a raw candidate query for a caller against a collection.
    pub fn run(
        &self,
        user_id: &str,
        collection: &str,
        candidate: Value,
    ) -> Result<QueryOutcome, PipelineError> {
        let request_id = Uuid::new_v4();

        let ctx = match self.cache.get(user_id) {
            Ok(ctx) => ctx,
            Err(err) => {
                self.record(
                    AuditEvent::new(request_id, AuditEventType::AccessDenied, user_id, collection)
                        .with_error(err.to_string()),
                );
                return Err(PipelineError::ContextUnavailable(err));
            }
        };

        let query = match self.prepare(&ctx, collection, candidate) {
            Ok(query) => query,
            Err(err) => {
                let event_type = match &err {
                    PipelineError::CollectionDenied(_) => AuditEventType::AccessDenied,
                    _ => AuditEventType::QueryRejected,
                };
                self.record(
                    AuditEvent::new(request_id, event_type, user_id, collection)
                        .with_context(&ctx)
                        .with_error(detail(&err)),
                );
                return Err(err);
            }
        };

        let mut documents =
            self.run_query(request_id, &ctx, collection, &query, AuditEventType::QueryExecuted)?;
        let mut executed_query = query;
        let mut retried = false;

        if documents.is_empty() {
            if let Some(relaxed) = self
                .retry
                .as_ref()
                .and_then(|retry| retry.apply_query(&executed_query, collection))
            {
                self.rewriter
                    .verify(&relaxed, &ctx, collection)
                    .map_err(|err| {
                        tracing::error!(collection, error = %err, "Relaxed query lost its scoping");
                        PipelineError::ScopeViolation(err)
                    })?;

                tracing::debug!(collection, "Zero results, retrying case-insensitively");
                documents = self.run_query(
                    request_id,
                    &ctx,
                    collection,
                    &relaxed,
                    AuditEventType::QueryRetried,
                )?;
                executed_query = relaxed;
                retried = true;
            }
        }

        self.redactor
            .redact_documents(&mut documents, &ctx.role, collection);

        Ok(QueryOutcome {
            collection: collection.to_string(),
            executed_query,
            documents,
            retried,
        })
    }

    /// Classify, check, scope, redact and verify a candidate query without
    /// running it.
    pub fn prepare(
        &self,
        ctx: &AuthorizationContext,
        collection: &str,
        candidate: Value,
    ) -> Result<CandidateQuery, PipelineError> {
        let query = match classify(candidate) {
            QueryOperation::Read(query) => query,
            QueryOperation::Command { verb, .. } => {
                tracing::warn!(collection, verb = %verb, "Refusing non-read operation");
                return Err(PipelineError::UnsupportedOperation { verb });
            }
        };

        if !self.policy.is_known(collection) {
            tracing::warn!(collection, "Query against unknown collection");
            return Err(PipelineError::UnsupportedCollection {
                collection: collection.to_string(),
            });
        }

        self.access
            .check(&query, ctx, collection)
            .map_err(PipelineError::CollectionDenied)?;

        if let Some((stage, source)) = referenced_collections(&query)
            .into_iter()
            .find(|(_, source)| !self.policy.is_known(source))
        {
            tracing::warn!(collection, stage, source = %source, "Pipeline reads an unknown collection");
            return Err(PipelineError::UnsupportedCollection { collection: source });
        }

        let scoped = self.rewriter.apply(query, ctx, collection);
        let redacted = self.redactor.apply(scoped, &ctx.role, collection);

        self.rewriter
            .verify(&redacted, ctx, collection)
            .map_err(|err| {
                tracing::error!(collection, error = %err, "Scoped query failed verification");
                PipelineError::ScopeViolation(err)
            })?;

        Ok(redacted)
    }

    fn run_query(
        &self,
        request_id: Uuid,
        ctx: &AuthorizationContext,
        collection: &str,
        query: &CandidateQuery,
        event_type: AuditEventType,
    ) -> Result<Vec<Value>, PipelineError> {
        let event = AuditEvent::new(request_id, event_type, ctx.user_id.as_str(), collection)
            .with_context(ctx)
            .with_query(query, self.audit_config.log_queries);

        match execute(&self.executor, collection, query) {
            Ok(documents) => {
                tracing::debug!(
                    collection,
                    kind = %query.kind(),
                    count = documents.len(),
                    "Query executed"
                );
                self.record(event.with_result_count(documents.len()));
                Ok(documents)
            }
            Err(err) => {
                tracing::error!(collection, error = %err, "Query execution failed");
                let mut event = event.with_error(err.to_string());
                event.event_type = AuditEventType::QueryFailed;
                self.record(event);
                Err(PipelineError::ExecutionFailed(err))
            }
        }
    }

    fn record(&self, event: AuditEvent) {
        if self.audit_config.enabled {
            self.audit.record(event);
        }
    }
}

/// Error message plus its source, for audit records only.
fn detail(err: &PipelineError) -> String {
    match err.source() {
        Some(source) => format!("{}: {}", err, source),
        None => err.to_string(),
    }
}
