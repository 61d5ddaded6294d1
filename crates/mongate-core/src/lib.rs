//! # mongate-core
//!
//! Types shared by every Mongate crate.
//!
//! Mongate sits between an untrusted query generator and a shared,
//! multi-tenant document store. Everything the enforcement layer reasons about
//! is defined here:
//!
//! - [`Identifier`]: binary ids and opaque string ids, normalized into one
//!   comparable form
//! - [`CandidateQuery`]: the tagged union of a filter document and an
//!   aggregation pipeline, built once at the boundary by [`classify`]
//! - [`AuthorizationContext`]: the resolved tenant, role and scoping ids of a
//!   caller
//! - [`config`]: the immutable collection policy and runtime settings, loaded
//!   from YAML

pub mod config;
pub mod context;
pub mod identifier;
pub mod query;

pub use config::{
    AuditConfig, CacheConfig, CollectionAccess, CollectionPolicy, ConfigError, MongateConfig,
    PolicyConfig, RetryConfig, RoleScope, ScopeSource,
};
pub use context::{AuthorizationContext, AuthorizationRecord, RecordError};
pub use identifier::Identifier;
pub use query::{
    classify, CandidateQuery, FilterDocument, Pipeline, Projection, QueryKind, QueryOperation,
    Stage,
};
