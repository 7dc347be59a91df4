//! State types for tracking observed remote resources.
//!
//! These types represent the last-known remote state of every managed
//! resource, used by the planner and updated after each successful action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ConvergentError, Result, StateError};
use crate::resource::AttributeMap;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept in a state document.
const MAX_HISTORY: usize = 100;

/// The complete observed state of a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied declared set.
    pub config_hash: String,
    /// Incremented on every write.
    #[serde(default)]
    pub serial: u64,
    /// Managed resources keyed by logical name.
    pub resources: BTreeMap<String, ResourceState>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Operation history (recent entries).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Last-known state of a single managed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Logical name.
    pub name: String,
    /// Resource type.
    pub resource_type: String,
    /// Identifier assigned by the remote.
    pub remote_id: String,
    /// Remote attribute snapshot.
    pub attributes: AttributeMap,
    /// Logical names this resource depended on when last written.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// When the entry was first recorded.
    pub created_at: DateTime<Utc>,
    /// When the remote attributes were last read or written.
    pub last_refreshed: DateTime<Utc>,
}

/// A single entry in the operation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the operation finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: Operation,
    /// Declared-set hash at the time.
    pub config_hash: String,
    /// Resources affected.
    pub resources: Vec<String>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// A plan was applied.
    Apply,
    /// An existing remote resource was adopted.
    Import,
    /// State was re-read from the remote.
    Refresh,
    /// Everything was destroyed.
    Destroy,
    /// An entry was removed from state without touching the remote.
    Forget,
}

impl ObservedState {
    /// Creates a new empty state.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            config_hash: String::new(),
            serial: 0,
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Parses a state document, rejecting other format versions.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for malformed JSON and a version error for
    /// documents written by another format version.
    pub fn decode(content: &str) -> Result<Self> {
        let state: Self = serde_json::from_str(content).map_err(|e| {
            ConvergentError::State(StateError::Corrupted {
                message: format!("Failed to parse state: {e}"),
            })
        })?;

        if state.version != STATE_VERSION {
            return Err(ConvergentError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }));
        }

        Ok(state)
    }

    /// Renders the state document.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ConvergentError::State(StateError::serialization(format!("Failed to serialize state: {e}"))))
    }

    /// Gets a resource by logical name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceState> {
        self.resources.get(name)
    }

    /// Adds or replaces a resource entry.
    pub fn upsert(&mut self, resource: ResourceState) {
        self.resources.insert(resource.name.clone(), resource);
        self.touch();
    }

    /// Removes a resource by logical name.
    pub fn remove(&mut self, name: &str) -> Option<ResourceState> {
        let result = self.resources.remove(name);
        if result.is_some() {
            self.touch();
        }
        result
    }

    /// Returns true if the logical name is managed.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    /// Returns all managed logical names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Returns the logical names whose entries recorded a dependency on `name`.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.resources
            .values()
            .filter(|r| r.dependencies.iter().any(|d| d == name))
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Adds a history entry, dropping the oldest beyond the retention limit.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    fn touch(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }
}

impl ResourceState {
    /// Creates a new resource entry.
    #[must_use]
    pub fn new(name: &str, resource_type: &str, remote_id: &str, attributes: AttributeMap) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            remote_id: remote_id.to_string(),
            attributes,
            dependencies: Vec::new(),
            created_at: now,
            last_refreshed: now,
        }
    }

    /// Sets the recorded dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Replaces the attribute snapshot and bumps the refresh timestamp.
    pub fn refresh(&mut self, attributes: AttributeMap) {
        self.attributes = attributes;
        self.last_refreshed = Utc::now();
    }
}

impl HistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: Operation, config_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: Operation,
        config_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Import => "import",
            Self::Refresh => "refresh",
            Self::Destroy => "destroy",
            Self::Forget => "forget",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_remove_bump_serial() {
        let mut state = ObservedState::new("fd", "test");
        state.upsert(ResourceState::new("backend-bing", "frontdoor_backend_pool", "bp-1", AttributeMap::new()));
        assert_eq!(state.serial, 1);

        assert!(state.remove("backend-bing").is_some());
        assert_eq!(state.serial, 2);
        assert!(state.remove("backend-bing").is_none());
        assert_eq!(state.serial, 2);
    }

    #[test]
    fn test_dependents_of() {
        let mut state = ObservedState::new("fd", "test");
        state.upsert(ResourceState::new("pool", "frontdoor_backend_pool", "bp-1", AttributeMap::new()));
        state.upsert(
            ResourceState::new("rule", "frontdoor_routing_rule", "rr-1", AttributeMap::new())
                .with_dependencies(vec![String::from("pool")]),
        );

        assert_eq!(state.dependents_of("pool"), vec!["rule"]);
        assert!(state.dependents_of("rule").is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = ObservedState::new("fd", "test");
        for _ in 0..(MAX_HISTORY + 5) {
            state.add_history(HistoryEntry::new(Operation::Refresh, "", vec![]));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
    }
}
