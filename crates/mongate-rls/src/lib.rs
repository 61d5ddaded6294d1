//! # mongate-rls
//!
//! Row-level (document-level) tenant isolation for Mongate.
//!
//! This crate provides:
//! - A small algebra over filter documents (merge, leaf mapping)
//! - Injection of mandatory tenant and role scoping clauses
//! - The case-insensitive rewrite used for a single retry after a
//!   zero-result query
//!
//! ## How It Works
//!
//! **Before (from the generator):**
//! ```json
//! {"details.type": "inbound"}
//! ```
//!
//! **After (to the store):**
//! ```json
//! {"$and": [{"details.type": "inbound"}, {"companyId": {"$oid": "64f0...01"}}]}
//! ```
//!
//! ## Supported Shapes
//!
//! | Shape         | Scoping                                              |
//! |---------------|------------------------------------------------------|
//! | Find filter   | AND the scoping clause onto the predicate            |
//! | Pipeline      | Merge into a leading `$match`, or prepend one        |
//!
//! The tenant value asserted by the candidate query is never trusted: the
//! caller's tenant is always ANDed on, so a forged tenant id can only narrow
//! the result to nothing.

pub mod algebra;
pub mod error;
pub mod injector;
pub mod retry;

pub use algebra::{build_clause, map_leaves, merge_clause, requires_clause, Leaf};
pub use error::RlsError;
pub use injector::TenantIsolationRewriter;
pub use retry::{is_identifier_path, CaseInsensitiveRetry};
