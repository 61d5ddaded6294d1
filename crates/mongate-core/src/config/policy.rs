//! Collection policy configuration.
//!
//! The policy is static: it is loaded once at startup, validated, and then
//! shared read-only (behind an `Arc`) by every enforcement component. Nothing
//! mutates it at runtime.
//!
//! ```yaml
//! default_role: user
//!
//! collections:
//!   call-interaction:
//!     tenant_field: companyId
//!     role_scopes:
//!       process_manager:
//!         field: user.process._id
//!         source: processes
//!     restricted_fields:
//!       process_manager: [details.recordingUrl]
//!   user:
//!     tenant_field: company._id
//!
//! global_collections: [country]
//!
//! role_access:
//!   user: [call-interaction, user]
//!   superadmin: all
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use super::ConfigError;

/// Static scoping policy for every collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy-bearing (tenant-scoped) collections.
    #[serde(default)]
    pub collections: HashMap<String, CollectionPolicy>,

    /// Collections holding shared reference data; never scoped.
    #[serde(default)]
    pub global_collections: Vec<String>,

    /// Which collections each role may query.
    #[serde(default)]
    pub role_access: HashMap<String, CollectionAccess>,

    /// Role assumed when the authorization record names none, and whose
    /// access applies to roles missing from `role_access`.
    #[serde(default = "default_role")]
    pub default_role: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            collections: HashMap::new(),
            global_collections: Vec::new(),
            role_access: HashMap::new(),
            default_role: default_role(),
        }
    }
}

/// Scoping policy for a single collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionPolicy {
    /// Field path holding the owning tenant's id.
    pub tenant_field: String,

    /// Additional per-role scoping, e.g. a process manager only sees their
    /// processes.
    #[serde(default)]
    pub role_scopes: HashMap<String, RoleScope>,

    /// Field paths withheld from each role's output.
    #[serde(default)]
    pub restricted_fields: HashMap<String, Vec<String>>,

    /// Extra identifier-valued field paths. Tenant and role-scope fields are
    /// always treated as identifiers.
    #[serde(default)]
    pub identifier_fields: Vec<String>,
}

/// Role-specific scoping field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleScope {
    /// Field path compared against the caller's ids.
    pub field: String,

    /// Which of the caller's ids the field must match.
    #[serde(default)]
    pub source: ScopeSource,
}

/// Source of the value a role scope matches on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeSource {
    /// The caller's own user id.
    #[default]
    User,
    /// Membership in the caller's assigned processes.
    Processes,
}

/// Collections a role may query: `all` (or `"*"`) or an explicit list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CollectionAccess {
    /// Every known collection.
    All(String), // "all" | "*"
    /// Specific collections.
    List(Vec<String>),
}

impl CollectionAccess {
    /// Whether this grants every known collection.
    pub fn is_all(&self) -> bool {
        matches!(self, CollectionAccess::All(s) if s == "all" || s == "*")
    }
}

impl CollectionPolicy {
    /// Create a policy scoped by a tenant field only.
    pub fn new(tenant_field: impl Into<String>) -> Self {
        Self {
            tenant_field: tenant_field.into(),
            role_scopes: HashMap::new(),
            restricted_fields: HashMap::new(),
            identifier_fields: Vec::new(),
        }
    }

    /// Add a role scope.
    pub fn with_role_scope(
        mut self,
        role: impl Into<String>,
        field: impl Into<String>,
        source: ScopeSource,
    ) -> Self {
        self.role_scopes.insert(
            role.into(),
            RoleScope {
                field: field.into(),
                source,
            },
        );
        self
    }

    /// Add restricted fields for a role.
    pub fn with_restricted_fields<I, S>(mut self, role: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.restricted_fields
            .entry(role.into())
            .or_default()
            .extend(fields.into_iter().map(Into::into));
        self
    }

    /// The role scope for a role, if any.
    pub fn role_scope(&self, role: &str) -> Option<&RoleScope> {
        self.role_scopes.get(role)
    }

    /// Fields withheld from a role; empty when unrestricted.
    pub fn restricted_fields(&self, role: &str) -> &[String] {
        self.restricted_fields
            .get(role)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether a field path is known to hold identifiers.
    pub fn is_identifier_field(&self, path: &str) -> bool {
        self.tenant_field == path
            || self.role_scopes.values().any(|scope| scope.field == path)
            || self.identifier_fields.iter().any(|f| f == path)
    }
}

impl PolicyConfig {
    /// Load a policy from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse a policy from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    /// Add a policy-bearing collection.
    pub fn with_collection(mut self, name: impl Into<String>, policy: CollectionPolicy) -> Self {
        self.collections.insert(name.into(), policy);
        self
    }

    /// Get the policy of a collection. `None` means scoping-exempt.
    pub fn get_policy(&self, collection: &str) -> Option<&CollectionPolicy> {
        self.collections.get(collection)
    }

    /// Whether a collection is declared global (shared reference data).
    pub fn is_global(&self, collection: &str) -> bool {
        self.global_collections.iter().any(|c| c == collection)
    }

    /// Whether the policy knows a collection at all, scoped or global.
    pub fn is_known(&self, collection: &str) -> bool {
        self.collections.contains_key(collection) || self.is_global(collection)
    }

    /// Every collection named anywhere in the policy.
    pub fn known_collections(&self) -> BTreeSet<String> {
        let mut all: BTreeSet<String> = self.collections.keys().cloned().collect();
        all.extend(self.global_collections.iter().cloned());
        for access in self.role_access.values() {
            if let CollectionAccess::List(list) = access {
                all.extend(list.iter().cloned());
            }
        }
        all
    }

    /// Whether `role_access` has an entry for a role.
    pub fn has_role(&self, role: &str) -> bool {
        self.role_access.contains_key(role)
    }

    /// Resolve the collections a role may query.
    ///
    /// Roles without an entry get the default role's access; if that is
    /// missing too, nothing is permitted.
    pub fn permitted_collections(&self, role: &str) -> BTreeSet<String> {
        let access = self
            .role_access
            .get(role)
            .or_else(|| self.role_access.get(&self.default_role));

        match access {
            Some(access) if access.is_all() => self.known_collections(),
            Some(CollectionAccess::List(list)) => list.iter().cloned().collect(),
            _ => BTreeSet::new(),
        }
    }

    /// Check the policy for inconsistencies.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_role("default_role", &self.default_role)?;
        for role in self.role_access.keys() {
            validate_role("role_access", role)?;
        }

        for (name, policy) in &self.collections {
            if self.is_global(name) {
                return Err(ConfigError::Config(format!(
                    "collection '{}' is both scoped and global",
                    name
                )));
            }
            validate_path(name, "tenant_field", &policy.tenant_field)?;
            for (role, scope) in &policy.role_scopes {
                validate_role(&format!("collections.{}.role_scopes", name), role)?;
                validate_path(name, &format!("role_scopes.{}", role), &scope.field)?;
            }
            for (role, fields) in &policy.restricted_fields {
                validate_role(&format!("collections.{}.restricted_fields", name), role)?;
                for field in fields {
                    validate_path(name, &format!("restricted_fields.{}", role), field)?;
                }
            }
        }

        for (role, access) in &self.role_access {
            if let CollectionAccess::All(s) = access {
                if !access.is_all() {
                    return Err(ConfigError::Config(format!(
                        "role '{}' has invalid access '{}' (expected 'all', '*' or a list)",
                        role, s
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Role names are matched against the lowercased role of the caller.
fn validate_role(what: &str, role: &str) -> Result<(), ConfigError> {
    if role.is_empty() || role.trim() != role || role.to_lowercase() != role {
        return Err(ConfigError::Config(format!(
            "{} role '{}' must be lowercase without surrounding whitespace",
            what, role
        )));
    }
    Ok(())
}

fn validate_path(collection: &str, what: &str, path: &str) -> Result<(), ConfigError> {
    if path.is_empty() || path.split('.').any(|segment| segment.is_empty()) {
        return Err(ConfigError::Config(format!(
            "collection '{}' has an invalid {} path '{}'",
            collection, what, path
        )));
    }
    if path.starts_with('$') {
        return Err(ConfigError::Config(format!(
            "collection '{}' {} path '{}' must not be an operator",
            collection, what, path
        )));
    }
    Ok(())
}

fn default_role() -> String {
    "user".to_string()
}
