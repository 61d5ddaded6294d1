//! Error types for the runtime crate.
//!
//! [`PipelineError`] messages are shown to the end user and stay generic;
//! the wrapped source carries the detail for logs.

use mongate_core::RecordError;
use mongate_policy::AccessError;
use mongate_rls::RlsError;
use thiserror::Error;

/// Errors resolving a caller's authorization context. Never cached.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("no authorization record for user {user_id}")]
    NotFound { user_id: String },

    #[error("invalid authorization record: {0}")]
    Invalid(#[from] RecordError),

    #[error("authorization source failed: {0}")]
    Source(#[from] anyhow::Error),
}

/// Errors returned by [`QuerySecurityPipeline::run`](crate::QuerySecurityPipeline::run).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("access denied")]
    ContextUnavailable(#[source] ContextError),

    #[error("unsupported operation")]
    UnsupportedOperation { verb: String },

    #[error("unsupported collection")]
    UnsupportedCollection { collection: String },

    #[error("access denied")]
    CollectionDenied(#[source] AccessError),

    #[error("query could not be safely scoped")]
    ScopeViolation(#[source] RlsError),

    #[error("query execution failed")]
    ExecutionFailed(#[source] anyhow::Error),
}
