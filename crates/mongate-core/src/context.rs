//! Authorization context.
//!
//! An [`AuthorizationContext`] is resolved once per cache miss from a single
//! [`AuthorizationRecord`] read, and is immutable afterwards. A newer context
//! supersedes an older one; nothing mutates a context in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

use crate::config::PolicyConfig;
use crate::identifier::Identifier;

/// The resolved tenant, role and scoping ids of one caller.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationContext {
    /// The caller's user id, as presented upstream.
    pub user_id: String,
    /// Tenant the caller belongs to.
    pub tenant_id: Identifier,
    /// Lowercased role name. Roles the policy does not grant access to are
    /// resolved to the policy's default role.
    pub role: String,
    /// Processes the caller is assigned to, deduplicated, in source order.
    pub process_ids: Vec<Identifier>,
    /// Collections the caller's role may query.
    pub permitted_collections: BTreeSet<String>,
    /// When the context was resolved.
    pub computed_at: DateTime<Utc>,
}

impl AuthorizationContext {
    /// Build a context from the combined authorization read.
    pub fn from_record(
        user_id: impl Into<String>,
        record: &AuthorizationRecord,
        policy: &PolicyConfig,
        computed_at: DateTime<Utc>,
    ) -> Result<Self, RecordError> {
        let tenant_id = record
            .company
            .as_ref()
            .and_then(|company| company.id.as_ref())
            .filter(|id| !id.is_null())
            .map(Identifier::normalize)
            .ok_or(RecordError::MissingTenant)?;

        let role = record
            .role
            .as_ref()
            .and_then(|role| role.name.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_lowercase)
            .unwrap_or_else(|| policy.default_role.clone());
        let role = if policy.has_role(&role) {
            role
        } else {
            tracing::warn!(role = %role, default_role = %policy.default_role, "Unknown role, using default role");
            policy.default_role.clone()
        };

        let mut process_ids: Vec<Identifier> = Vec::with_capacity(record.process.len());
        for entry in &record.process {
            let raw = match entry {
                Value::Object(map) if map.contains_key("_id") => &map["_id"],
                other => other,
            };
            if raw.is_null() {
                continue;
            }
            let id = Identifier::normalize(raw);
            if !process_ids.contains(&id) {
                process_ids.push(id);
            }
        }

        let permitted_collections = policy.permitted_collections(&role);

        Ok(Self {
            user_id: user_id.into(),
            tenant_id,
            role,
            process_ids,
            permitted_collections,
            computed_at,
        })
    }

    /// Whether the caller may query a collection.
    pub fn can_access(&self, collection: &str) -> bool {
        self.permitted_collections.contains(collection)
    }
}

/// The authorization source record: `{_id, role.name, company._id, process[]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizationRecord {
    #[serde(rename = "_id", default)]
    pub id: Value,

    #[serde(default)]
    pub role: Option<RoleRef>,

    #[serde(default)]
    pub company: Option<CompanyRef>,

    /// Assigned processes, either bare ids or `{_id: ...}` objects.
    #[serde(default)]
    pub process: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleRef {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompanyRef {
    #[serde(rename = "_id", default)]
    pub id: Option<Value>,
}

/// Errors building a context from an authorization record.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The record names no tenant.
    #[error("authorization record has no tenant")]
    MissingTenant,
}
