//! Store adapter boundary.

use mongate_core::{CandidateQuery, FilterDocument, Projection, Stage};
use serde_json::Value;
use std::sync::Arc;

/// Executes scoped queries against the document store.
///
/// Implementations receive queries that have already been scoped, redacted
/// and verified; they must run them as given.
pub trait QueryExecutor: Send + Sync {
    /// Run a find query.
    fn find(
        &self,
        collection: &str,
        filter: &FilterDocument,
        projection: Option<&Projection>,
    ) -> anyhow::Result<Vec<Value>>;

    /// Run an aggregation pipeline.
    fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> anyhow::Result<Vec<Value>>;
}

impl<T: QueryExecutor + ?Sized> QueryExecutor for Arc<T> {
    fn find(
        &self,
        collection: &str,
        filter: &FilterDocument,
        projection: Option<&Projection>,
    ) -> anyhow::Result<Vec<Value>> {
        (**self).find(collection, filter, projection)
    }

    fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> anyhow::Result<Vec<Value>> {
        (**self).aggregate(collection, pipeline)
    }
}

/// Dispatch a query to `find` or `aggregate` by its shape.
pub fn execute<E: QueryExecutor + ?Sized>(
    executor: &E,
    collection: &str,
    query: &CandidateQuery,
) -> anyhow::Result<Vec<Value>> {
    match query {
        CandidateQuery::Filter { filter, projection } => {
            executor.find(collection, filter, projection.as_ref())
        }
        CandidateQuery::Aggregation(stages) => executor.aggregate(collection, stages),
    }
}
