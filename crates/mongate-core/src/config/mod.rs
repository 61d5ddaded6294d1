//! Configuration types for Mongate.
//!
//! Configuration is loaded from YAML (`mongate.yaml`, optionally referencing a
//! separate policy file) into a single [`MongateConfig`].
//!
//! # Configuration Files
//!
//! - **mongate.yaml**: cache, retry and audit settings, plus an inline policy
//!   or a `policy_file` reference
//! - **policy.yaml**: per-collection tenant fields, role scopes, restricted
//!   fields and per-role collection access

pub mod audit;
pub mod cache;
pub mod policy;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub use audit::AuditConfig;
pub use cache::CacheConfig;
pub use policy::{CollectionAccess, CollectionPolicy, PolicyConfig, RoleScope, ScopeSource};

/// Complete Mongate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MongateConfig {
    /// Inline policy.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Path to a policy file (alternative to inline).
    #[serde(default)]
    pub policy_file: Option<PathBuf>,

    /// Authorization context cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Case-insensitive retry settings.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Audit settings.
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Settings for the second, case-insensitive attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Whether a zero-result query is retried once case-insensitively.
    #[serde(default = "default_true")]
    pub case_insensitive: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            case_insensitive: true,
        }
    }
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MongateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    /// Load configuration, resolve the policy file and validate the result.
    ///
    /// A relative `policy_file` is resolved against the directory of the main
    /// configuration file. A missing policy file is an error: running without
    /// the policy would leave every collection unscoped.
    pub fn load_with_context(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = Self::from_file(path)?;

        let base_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        if let Some(policy_file) = &config.policy_file {
            let policy_path = if policy_file.is_absolute() {
                policy_file.clone()
            } else {
                base_dir.join(policy_file)
            };

            if !policy_path.exists() {
                return Err(ConfigError::Config(format!(
                    "Policy file not found: {}",
                    policy_path.display()
                )));
            }
            config.policy = PolicyConfig::from_file(&policy_path)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.policy.validate()
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = MongateConfig::from_yaml("{}").unwrap();
        assert_eq!(config.cache.ttl_seconds, 300);
        assert!(config.retry.case_insensitive);
        assert!(config.audit.enabled);
        assert!(config.policy.collections.is_empty());
        assert_eq!(config.policy.default_role, "user");
    }

    #[test]
    fn test_inline_policy() {
        let yaml = r#"
cache:
  ttl_seconds: 60
retry:
  case_insensitive: false
policy:
  collections:
    orders:
      tenant_field: tenantId
"#;
        let config = MongateConfig::from_yaml(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.cache.ttl(), chrono::Duration::seconds(60));
        assert!(!config.retry.case_insensitive);
        assert_eq!(
            config.policy.get_policy("orders").map(|p| p.tenant_field.as_str()),
            Some("tenantId")
        );
    }

    #[test]
    fn test_load_with_policy_file() {
        let dir = tempfile::tempdir().unwrap();

        let policy_path = dir.path().join("policy.yaml");
        let mut policy = fs::File::create(&policy_path).unwrap();
        writeln!(
            policy,
            "collections:\n  call-interaction:\n    tenant_field: companyId\nglobal_collections: [country]"
        )
        .unwrap();

        let config_path = dir.path().join("mongate.yaml");
        let mut config = fs::File::create(&config_path).unwrap();
        writeln!(config, "policy_file: policy.yaml\ncache:\n  ttl_seconds: 120").unwrap();

        let config = MongateConfig::load_with_context(&config_path).unwrap();
        assert!(config.policy.get_policy("call-interaction").is_some());
        assert!(config.policy.is_global("country"));
        assert_eq!(config.cache.ttl_seconds, 120);
    }

    #[test]
    fn test_missing_policy_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("mongate.yaml");
        fs::write(&config_path, "policy_file: missing.yaml\n").unwrap();

        let err = MongateConfig::load_with_context(&config_path).unwrap_err();
        assert!(matches!(err, ConfigError::Config(msg) if msg.contains("missing.yaml")));
    }

    #[test]
    fn test_zero_ttl_is_rejected() {
        let config = MongateConfig::from_yaml("cache:\n  ttl_seconds: 0\n").unwrap();
        assert!(config.validate().is_err());
    }
}
