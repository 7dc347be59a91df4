//! Configuration specification types for the reconciliation engine.
//!
//! This module defines the structs that map to `convergent.yaml`. The
//! `resources` section is the declared descriptor set; everything else
//! tunes where state lives, which remote is driven, and how applies run.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::planner::DEFAULT_PARALLELISM;
use crate::remote::{
    RetryPolicy, DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF_MS,
    DEFAULT_TIMEOUT_SECS,
};
use crate::resource::{DescriptorSource, ResourceDescriptor, ResourceSchema, SchemaRegistry};

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Remote control plane configuration.
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Apply tuning.
    #[serde(default)]
    pub apply: ApplyConfig,
    /// Per-type schema overrides layered over the built-in set.
    #[serde(default)]
    pub schemas: Vec<ResourceSchema>,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state file path (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Remote control plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Which client drives the remote.
    #[serde(default)]
    pub kind: RemoteKind,
    /// Base URL of the REST control plane (http kind only).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

/// Remote client kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    /// JSON over HTTP.
    #[default]
    Http,
    /// In-process control plane, for dry runs.
    Memory,
}

/// Apply tuning: worker pool size, retry policy and overall timeout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplyConfig {
    /// Maximum concurrent actions within a dependency layer.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Attempts per action, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Growth factor between retries.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound for a single retry delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Whole-apply timeout in seconds. Pending actions are skipped once it fires.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Logical name, unique across the file.
    pub name: String,
    /// Declared attributes, typed through the resource schema.
    #[serde(default = "empty_object")]
    pub attributes: serde_json::Value,
    /// Explicit dependencies on other logical names.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            kind: RemoteKind::default(),
            endpoint: None,
            timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            timeout_secs: None,
        }
    }
}

fn default_environment() -> String {
    String::from("dev")
}

const fn default_request_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

const fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

const fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

const fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF_MS
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl EngineConfig {
    /// Builds the schema registry: built-in schemas overlaid with the
    /// file's `schemas` section.
    ///
    /// # Errors
    ///
    /// Returns an error if the merged set is inconsistent.
    pub fn schema_registry(&self) -> Result<SchemaRegistry> {
        let mut registry = SchemaRegistry::builtin()?;
        registry.extend(self.schemas.iter().cloned());
        registry.validate()?;
        Ok(registry)
    }

    /// Returns the declared logical names in file order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }

    /// Looks up a declared resource by logical name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Project and environment joined for display and lock holders.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }
}

impl ApplyConfig {
    /// Retry policy for remote calls.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            self.backoff_multiplier,
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    /// Whole-apply timeout, if configured.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl RemoteConfig {
    /// Per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ResourceConfig {
    /// Converts this entry into a typed descriptor.
    #[must_use]
    pub fn to_descriptor(&self, schemas: &SchemaRegistry) -> ResourceDescriptor {
        ResourceDescriptor::from_json(
            &self.resource_type,
            &self.name,
            &self.attributes,
            &self.depends_on,
            schemas.get(&self.resource_type),
        )
    }
}

impl DescriptorSource for EngineConfig {
    fn descriptors(&self, schemas: &SchemaRegistry) -> Result<Vec<ResourceDescriptor>> {
        Ok(self
            .resources
            .iter()
            .map(|r| r.to_descriptor(schemas))
            .collect())
    }
}

impl std::fmt::Display for StateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::S3 => write!(f, "s3"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_applied() {
        let config: EngineConfig = serde_yaml::from_str("project:\n  name: fd\n").expect("parse");

        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.remote.kind, RemoteKind::Http);
        assert_eq!(config.apply.parallelism, DEFAULT_PARALLELISM);
        assert_eq!(config.apply.retry_policy(), RetryPolicy::default());
        assert!(config.apply.timeout().is_none());
    }

    #[test]
    fn test_descriptors_are_schema_typed() {
        let config = EngineConfig {
            project: ProjectConfig {
                name: String::from("fd"),
                environment: String::from("test"),
            },
            state: StateConfig::default(),
            remote: RemoteConfig::default(),
            apply: ApplyConfig::default(),
            schemas: Vec::new(),
            resources: vec![ResourceConfig {
                resource_type: String::from("frontdoor_frontend_endpoint"),
                name: String::from("frontend-endpoint"),
                attributes: json!({"host_name": "fd.example.net"}),
                depends_on: vec![String::from("backend-bing")],
            }],
        };

        let registry = config.schema_registry().expect("registry");
        let descriptors = config.descriptors(&registry).expect("descriptors");

        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].name, "frontend-endpoint");
        assert!(descriptors[0].dependencies().contains("backend-bing"));
    }

    #[test]
    fn test_schema_override_replaces_builtin() {
        let mut config: EngineConfig = serde_yaml::from_str("project:\n  name: fd\n").expect("parse");
        config.schemas.push(ResourceSchema {
            force_new: vec![String::from("session_affinity_enabled")],
            ..ResourceSchema::new("frontdoor_frontend_endpoint")
        });

        let registry = config.schema_registry().expect("registry");
        let schema = registry.get("frontdoor_frontend_endpoint").expect("schema");
        assert!(schema.requires_replacement("session_affinity_enabled"));
        assert!(!schema.requires_replacement("host_name"));
        assert!(schema.required.is_empty());
    }
}
