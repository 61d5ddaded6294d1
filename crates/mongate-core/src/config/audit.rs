//! Audit configuration.

use serde::{Deserialize, Serialize};

/// Configuration for pipeline audit events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Whether audit events are recorded.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Whether the executed query is attached to audit events.
    #[serde(default = "default_enabled")]
    pub log_queries: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_queries: true,
        }
    }
}

fn default_enabled() -> bool {
    true
}
