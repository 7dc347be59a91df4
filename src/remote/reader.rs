//! Reads remote state back into observed state.
//!
//! Covers adoption of pre-existing resources (import), refresh of every
//! managed entry, and existence checks after apply or destroy.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ConvergentError, ReconcileError, RemoteError, Result, StateError};
use crate::resource::{map_from_json, AttributeMap, SchemaRegistry};
use crate::state::{ObservedState, ResourceState};

use super::client::RemoteClient;
use super::retry::RetryPolicy;
use super::types::ReadOutcome;

/// Fetches remote attributes and turns them into state entries.
pub struct ResourceReader {
    client: Arc<dyn RemoteClient>,
    schemas: Arc<SchemaRegistry>,
    retry: RetryPolicy,
}

/// Outcome of refreshing a state document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    /// Entries whose attributes were re-read.
    pub refreshed: Vec<String>,
    /// Entries dropped because the remote no longer has them.
    pub removed: Vec<String>,
    /// Entries that could not be read; left untouched.
    pub errors: Vec<RefreshFailure>,
}

/// A refresh read that failed.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshFailure {
    /// Logical name.
    pub name: String,
    /// Error text.
    pub error: String,
}

impl RefreshReport {
    /// Returns true when every entry was read.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

impl ResourceReader {
    /// Creates a reader.
    #[must_use]
    pub fn new(client: Arc<dyn RemoteClient>, schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            client,
            schemas,
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the retry policy used for reads.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reads a resource's attributes, typed by its schema.
    ///
    /// Returns `None` when the remote reports it missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails after retries.
    pub async fn fetch(&self, resource_type: &str, remote_id: &str) -> Result<Option<AttributeMap>> {
        let label = format!("read {resource_type}/{remote_id}");
        let outcome = self
            .retry
            .run(&label, || self.client.read(resource_type, remote_id))
            .await
            .result?;

        Ok(match outcome {
            ReadOutcome::Found(value) => Some(self.convert(resource_type, &value)),
            ReadOutcome::NotFound => None,
        })
    }

    /// Builds a state entry for a pre-existing remote resource.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyManaged` if `name` is already in state, or a
    /// not-found error if the remote has no such resource.
    pub async fn import(
        &self,
        state: &ObservedState,
        name: &str,
        resource_type: &str,
        remote_id: &str,
    ) -> Result<ResourceState> {
        if let Some(existing) = state.get(name) {
            return Err(ConvergentError::Reconcile(ReconcileError::AlreadyManaged {
                name: name.to_string(),
                remote_id: existing.remote_id.clone(),
            }));
        }

        info!("Importing {resource_type} '{remote_id}' as {name}");

        let attributes = self
            .fetch(resource_type, remote_id)
            .await?
            .ok_or_else(|| RemoteError::not_found(resource_type, remote_id))?;

        Ok(ResourceState::new(name, resource_type, remote_id, attributes))
    }

    /// Re-reads every entry in `state`.
    ///
    /// Entries the remote reports missing are removed so the next plan
    /// recreates them. Read failures are collected and leave the entry as is.
    pub async fn refresh(&self, state: &mut ObservedState) -> RefreshReport {
        let mut report = RefreshReport::default();
        let entries: Vec<(String, String, String)> = state
            .resources
            .values()
            .map(|r| (r.name.clone(), r.resource_type.clone(), r.remote_id.clone()))
            .collect();

        for (name, resource_type, remote_id) in entries {
            match self.fetch(&resource_type, &remote_id).await {
                Ok(Some(attributes)) => {
                    if let Some(entry) = state.resources.get_mut(&name) {
                        entry.refresh(attributes);
                    }
                    debug!("Refreshed {name}");
                    report.refreshed.push(name);
                }
                Ok(None) => {
                    warn!("{resource_type} '{remote_id}' ({name}) was deleted outside of convergent");
                    state.remove(&name);
                    report.removed.push(name);
                }
                Err(e) => {
                    warn!("Failed to refresh {name}: {e}");
                    report.errors.push(RefreshFailure {
                        name,
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }

    /// Checks that each named entry is in state and readable remotely.
    ///
    /// # Errors
    ///
    /// Returns an error for the first name that is unknown or missing.
    pub async fn verify_exists(&self, state: &ObservedState, names: &[&str]) -> Result<()> {
        for name in names {
            let entry = state.get(name).ok_or_else(|| StateError::UnknownResource {
                name: (*name).to_string(),
            })?;

            if self.fetch(&entry.resource_type, &entry.remote_id).await?.is_none() {
                return Err(ConvergentError::Reconcile(ReconcileError::Missing {
                    resource_type: entry.resource_type.clone(),
                    name: entry.name.clone(),
                }));
            }
        }
        Ok(())
    }

    /// Checks that none of `entries` can still be read remotely.
    ///
    /// # Errors
    ///
    /// Returns `StillExists` for the first entry that is still present.
    pub async fn verify_destroyed(&self, entries: &[ResourceState]) -> Result<()> {
        for entry in entries {
            if self.fetch(&entry.resource_type, &entry.remote_id).await?.is_some() {
                return Err(ConvergentError::Reconcile(ReconcileError::StillExists {
                    resource_type: entry.resource_type.clone(),
                    name: entry.name.clone(),
                    remote_id: entry.remote_id.clone(),
                }));
            }
        }
        Ok(())
    }

    fn convert(&self, resource_type: &str, value: &serde_json::Value) -> AttributeMap {
        match self.schemas.get(resource_type) {
            Some(schema) => schema.convert(value),
            None => map_from_json(value, &|_: &str| false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{InMemoryRemote, RemoteOp};
    use crate::resource::AttributeValue;
    use serde_json::json;
    use std::time::Duration;

    fn reader(remote: &Arc<InMemoryRemote>) -> ResourceReader {
        let schemas = SchemaRegistry::builtin().expect("builtin schemas");
        ResourceReader::new(remote.clone(), Arc::new(schemas))
            .with_retry(RetryPolicy::new(3, Duration::from_millis(1), 2.0, Duration::from_millis(2)))
    }

    #[tokio::test]
    async fn test_import_types_attributes_by_schema() {
        let remote = Arc::new(InMemoryRemote::new());
        let id = remote
            .seed(
                "frontdoor_routing_rule",
                json!({"accepted_protocols": ["Https", "Http"], "patterns_to_match": ["/*"]}),
            )
            .await;

        let state = ObservedState::new("fd", "test");
        let entry = reader(&remote)
            .import(&state, "routing-rule", "frontdoor_routing_rule", &id)
            .await
            .expect("import");

        assert_eq!(entry.remote_id, id);
        assert!(matches!(entry.attributes.get("accepted_protocols"), Some(AttributeValue::Set(_))));
        assert!(matches!(entry.attributes.get("patterns_to_match"), Some(AttributeValue::List(_))));
    }

    #[tokio::test]
    async fn test_import_of_managed_name_is_rejected() {
        let remote = Arc::new(InMemoryRemote::new());
        let id = remote.seed("resource_group", json!({"location": "westeurope"})).await;

        let mut state = ObservedState::new("fd", "test");
        state.upsert(ResourceState::new("rg", "resource_group", &id, AttributeMap::new()));

        let err = reader(&remote)
            .import(&state, "rg", "resource_group", &id)
            .await
            .expect_err("should be rejected");
        assert!(matches!(err, ConvergentError::Reconcile(ReconcileError::AlreadyManaged { .. })));
        assert_eq!(remote.count(RemoteOp::Read).await, 0);
    }

    #[tokio::test]
    async fn test_import_of_missing_id_is_not_found() {
        let remote = Arc::new(InMemoryRemote::new());
        let state = ObservedState::new("fd", "test");

        let err = reader(&remote)
            .import(&state, "rg", "resource_group", "nope")
            .await
            .expect_err("should fail");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_refresh_drops_externally_deleted_entries() {
        let remote = Arc::new(InMemoryRemote::new());
        let kept = remote.seed("resource_group", json!({"location": "westeurope"})).await;
        let gone = remote.seed("resource_group", json!({"location": "northeurope"})).await;
        remote.remove_external("resource_group", &gone).await;
        remote
            .fail_next("resource_group", RemoteOp::Read, RemoteError::Unavailable { message: String::from("blip") })
            .await;

        let mut state = ObservedState::new("fd", "test");
        state.upsert(ResourceState::new("a", "resource_group", &kept, AttributeMap::new()));
        state.upsert(ResourceState::new("b", "resource_group", &gone, AttributeMap::new()));

        let report = reader(&remote).refresh(&mut state).await;

        assert_eq!(report.refreshed, vec![String::from("a")]);
        assert_eq!(report.removed, vec![String::from("b")]);
        assert!(report.is_clean());
        assert!(!state.contains("b"));
        assert_eq!(
            state.get("a").and_then(|r| r.attributes.get("location")),
            Some(&AttributeValue::String(String::from("westeurope")))
        );
    }

    #[tokio::test]
    async fn test_verify_exists_and_destroyed() {
        let remote = Arc::new(InMemoryRemote::new());
        let id = remote.seed("resource_group", json!({"location": "westeurope"})).await;

        let mut state = ObservedState::new("fd", "test");
        state.upsert(ResourceState::new("rg", "resource_group", &id, AttributeMap::new()));
        let reader = reader(&remote);

        reader.verify_exists(&state, &["rg"]).await.expect("exists");
        assert!(reader.verify_exists(&state, &["other"]).await.is_err());

        let entries: Vec<ResourceState> = state.resources.values().cloned().collect();
        assert!(matches!(
            reader.verify_destroyed(&entries).await,
            Err(ConvergentError::Reconcile(ReconcileError::StillExists { .. }))
        ));

        remote.remove_external("resource_group", &id).await;
        reader.verify_destroyed(&entries).await.expect("destroyed");
        assert!(matches!(
            reader.verify_exists(&state, &["rg"]).await,
            Err(ConvergentError::Reconcile(ReconcileError::Missing { .. }))
        ));
    }
}
