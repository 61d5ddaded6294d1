//! Audit events for pipeline decisions.

use chrono::{DateTime, Utc};
use mongate_core::{AuthorizationContext, CandidateQuery};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// Type of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// The scoped query ran.
    QueryExecuted,
    /// The case-insensitive variant ran after a zero-result query.
    QueryRetried,
    /// The store failed to run the query.
    QueryFailed,
    /// The caller's context could not be resolved, or a collection was not
    /// permitted.
    AccessDenied,
    /// The query was refused: a write, an unknown collection, or a query that
    /// could not be scoped.
    QueryRejected,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueryExecuted => write!(f, "QUERY_EXECUTED"),
            Self::QueryRetried => write!(f, "QUERY_RETRIED"),
            Self::QueryFailed => write!(f, "QUERY_FAILED"),
            Self::AccessDenied => write!(f, "ACCESS_DENIED"),
            Self::QueryRejected => write!(f, "QUERY_REJECTED"),
        }
    }
}

/// An audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID.
    pub event_id: Uuid,

    /// Shared by every event of one pipeline run.
    pub request_id: Uuid,

    pub occurred_at: DateTime<Utc>,

    pub event_type: AuditEventType,

    pub user_id: String,

    pub collection: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// `find` or `aggregate`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// The query as sent to the store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<serde_json::Value>,

    /// Number of documents returned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_count: Option<u64>,

    /// Error detail (if event_type indicates failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        request_id: Uuid,
        event_type: AuditEventType,
        user_id: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            request_id,
            occurred_at: Utc::now(),
            event_type,
            user_id: user_id.into(),
            collection: collection.into(),
            role: None,
            tenant_id: None,
            kind: None,
            query: None,
            result_count: None,
            error: None,
        }
    }

    /// Attach the caller's role and tenant.
    pub fn with_context(mut self, ctx: &AuthorizationContext) -> Self {
        self.role = Some(ctx.role.clone());
        self.tenant_id = Some(ctx.tenant_id.canonical());
        self
    }

    /// Attach the query kind, and the query itself when `include` is set.
    pub fn with_query(mut self, query: &CandidateQuery, include: bool) -> Self {
        self.kind = Some(query.kind().to_string());
        if include {
            self.query = Some(query.to_value());
        }
        self
    }

    pub fn with_result_count(mut self, count: usize) -> Self {
        self.result_count = Some(count as u64);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Format the event as a single log line.
    ///
    /// Format: `[timestamp] EVENT_TYPE user=... collection=... [role=...]`
    pub fn to_log_line(&self) -> String {
        let mut line = format!(
            "[{}] {} user={} collection={}",
            self.occurred_at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.event_type,
            self.user_id,
            self.collection,
        );
        if let Some(ref role) = self.role {
            line.push_str(&format!(" role={}", role));
        }
        if let Some(ref tenant_id) = self.tenant_id {
            line.push_str(&format!(" tenant={}", tenant_id));
        }
        if let Some(ref kind) = self.kind {
            line.push_str(&format!(" kind={}", kind));
        }
        if let Some(count) = self.result_count {
            line.push_str(&format!(" rows={}", count));
        }
        if let Some(ref error) = self.error {
            line.push_str(&format!(" error=\"{}\"", error.replace('"', "'")));
        }
        line
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits events through `tracing` under the `mongate::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let query = event
            .query
            .as_ref()
            .map(|q| q.to_string())
            .unwrap_or_default();
        tracing::info!(
            target: "mongate::audit",
            event_id = %event.event_id,
            request_id = %event.request_id,
            event_type = %event.event_type,
            user_id = %event.user_id,
            collection = %event.collection,
            role = event.role.as_deref().unwrap_or(""),
            tenant_id = event.tenant_id.as_deref().unwrap_or(""),
            result_count = event.result_count,
            query = %query,
            error = event.error.as_deref().unwrap_or(""),
            "{}",
            event.to_log_line()
        );
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of every recorded event, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl<T: AuditSink + ?Sized> AuditSink for std::sync::Arc<T> {
    fn record(&self, event: AuditEvent) {
        (**self).record(event)
    }
}

/// Discards events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) {}
}
