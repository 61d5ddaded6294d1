//! Mongate Policy Enforcement
//!
//! Role-based checks applied to a candidate query around tenant scoping:
//!
//! - [`CollectionAccessValidator`]: the target collection and every collection
//!   a pipeline reads from (`$lookup`, `$graphLookup`, `$unionWith`) must be
//!   permitted for the caller's role
//! - [`RoleProjectionRedactor`]: field paths restricted for the caller's role
//!   are removed from projections, and stripped from result documents

pub mod access;
pub mod error;
pub mod redactor;

pub use access::{referenced_collections, CollectionAccessValidator};
pub use error::{AccessError, AccessErrorKind};
pub use redactor::RoleProjectionRedactor;
