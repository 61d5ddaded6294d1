//! Access error types.

use std::fmt;

/// Error raised when a caller may not read a collection.
///
/// The message names the collection and is meant for logs; callers facing
/// the end user should report a generic denial instead.
#[derive(Debug, Clone)]
pub struct AccessError {
    /// The kind of access failure.
    pub kind: AccessErrorKind,
    /// The collection that was refused.
    pub collection: String,
    /// Human-readable error message.
    pub message: String,
}

impl AccessError {
    pub fn new(
        kind: AccessErrorKind,
        collection: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            collection: collection.into(),
            message: message.into(),
        }
    }

    /// The queried collection is not permitted for the role.
    pub fn collection_not_permitted(collection: &str, role: &str) -> Self {
        Self::new(
            AccessErrorKind::CollectionNotPermitted,
            collection,
            format!(
                "Collection '{}' is not permitted for role '{}'",
                collection, role
            ),
        )
    }

    /// A pipeline stage reads from a collection not permitted for the role.
    pub fn source_not_permitted(collection: &str, stage: &str, role: &str) -> Self {
        Self::new(
            AccessErrorKind::SourceNotPermitted,
            collection,
            format!(
                "{} source '{}' is not permitted for role '{}'",
                stage, collection, role
            ),
        )
    }
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AccessError {}

/// Categories of access errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessErrorKind {
    /// The target collection is not in the caller's permitted set.
    CollectionNotPermitted,
    /// A `$lookup`, `$graphLookup` or `$unionWith` source is not permitted.
    SourceNotPermitted,
}
