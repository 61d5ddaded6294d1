//! # mongate-runtime
//!
//! Runs one candidate query for one caller:
//!
//! ```text
//! user id -> context cache -> access check -> scoping -> redaction
//!         -> verification -> execution (-> case-insensitive retry)
//!         -> result redaction -> audit
//! ```
//!
//! The store and the authorization source are external collaborators behind
//! the [`QueryExecutor`] and [`ContextSource`] traits.

pub mod adapter;
pub mod audit;
pub mod cache;
pub mod error;
pub mod pipeline;

pub use adapter::{execute, QueryExecutor};
pub use audit::{AuditEvent, AuditEventType, AuditSink, MemoryAuditSink, NullAuditSink, TracingAuditSink};
pub use cache::{AuthorizationContextCache, Clock, ContextSource, SystemClock};
pub use error::{ContextError, PipelineError};
pub use pipeline::{QueryOutcome, QuerySecurityPipeline};
