//! Error types for the RLS crate.

use thiserror::Error;

/// Errors raised when a rewritten query fails scope verification.
///
/// Rewriting itself never fails; these only surface from
/// [`TenantIsolationRewriter::verify`](crate::TenantIsolationRewriter::verify).
#[derive(Debug, Error)]
pub enum RlsError {
    /// The tenant clause is not a top-level requirement of the query.
    #[error("query for collection {collection} is not tenant-scoped")]
    MissingTenantClause { collection: String },

    /// The role clause is not a top-level requirement of the query.
    #[error("query for collection {collection} is not role-scoped")]
    MissingRoleClause { collection: String },

    /// A pipeline stage reads a policy-bearing collection without its
    /// scoping clauses.
    #[error("{stage} stage reads collection {collection} without scoping")]
    UnscopedSource {
        stage: &'static str,
        collection: String,
    },
}
