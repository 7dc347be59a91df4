//! In-process remote control plane.
//!
//! Deterministic ids (`{type}-{n}`), optional latency, and queued fault
//! injection per resource type and operation. Also tracks how many calls
//! were in flight at once so worker-pool bounds can be observed.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::RemoteError;

use super::client::{RemoteClient, RemoteResult};
use super::types::{Created, ReadOutcome, RemoteOp};

/// A recorded remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    /// Operation.
    pub op: RemoteOp,
    /// Resource type.
    pub resource_type: String,
    /// Remote id, when the operation addresses one.
    pub remote_id: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<(String, String), Value>,
    next_id: u64,
    faults: HashMap<(String, RemoteOp), VecDeque<RemoteError>>,
    calls: Vec<RemoteCall>,
}

/// Deterministic in-memory control plane.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl InMemoryRemote {
    /// Creates an empty control plane.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fixed delay to every call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queues an error for the next `op` on `resource_type`.
    ///
    /// Queued errors are consumed one per call, in order.
    pub async fn fail_next(&self, resource_type: &str, op: RemoteOp, error: RemoteError) {
        self.inner
            .lock()
            .await
            .faults
            .entry((resource_type.to_string(), op))
            .or_default()
            .push_back(error);
    }

    /// Inserts a resource as if created out of band; returns its id.
    pub async fn seed(&self, resource_type: &str, attributes: Value) -> String {
        let mut inner = self.inner.lock().await;
        let remote_id = next_id(&mut inner, resource_type);
        inner.resources.insert(
            (resource_type.to_string(), remote_id.clone()),
            with_id(attributes, &remote_id),
        );
        remote_id
    }

    /// Removes a resource out of band, simulating external deletion.
    pub async fn remove_external(&self, resource_type: &str, remote_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .resources
            .remove(&(resource_type.to_string(), remote_id.to_string()))
            .is_some()
    }

    /// Changes one top-level attribute out of band, simulating drift.
    pub async fn modify_external(
        &self,
        resource_type: &str,
        remote_id: &str,
        key: &str,
        value: Value,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        match inner
            .resources
            .get_mut(&(resource_type.to_string(), remote_id.to_string()))
            .and_then(Value::as_object_mut)
        {
            Some(object) => {
                object.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Returns the stored attributes of a resource.
    pub async fn get(&self, resource_type: &str, remote_id: &str) -> Option<Value> {
        self.inner
            .lock()
            .await
            .resources
            .get(&(resource_type.to_string(), remote_id.to_string()))
            .cloned()
    }

    /// Number of stored resources.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.resources.len()
    }

    /// Returns true when nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns every call made so far.
    pub async fn calls(&self) -> Vec<RemoteCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Number of calls of kind `op`, including failed ones.
    pub async fn count(&self, op: RemoteOp) -> usize {
        self.inner
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.op == op)
            .count()
    }

    /// Highest number of calls observed in flight at the same time.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Records the call, waits out the latency, then pops any queued fault.
    async fn enter(
        &self,
        op: RemoteOp,
        resource_type: &str,
        remote_id: Option<&str>,
    ) -> RemoteResult<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.inner.lock().await;
        trace!("{op} {resource_type} {remote_id:?}");
        inner.calls.push(RemoteCall {
            op,
            resource_type: resource_type.to_string(),
            remote_id: remote_id.map(str::to_string),
        });

        let fault = inner
            .faults
            .get_mut(&(resource_type.to_string(), op))
            .and_then(VecDeque::pop_front);

        match fault {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    async fn apply(
        &self,
        op: RemoteOp,
        resource_type: &str,
        remote_id: Option<&str>,
        attributes: Option<&Value>,
    ) -> RemoteResult<Option<(String, Value)>> {
        self.enter(op, resource_type, remote_id).await?;

        let mut inner = self.inner.lock().await;
        let key = |id: &str| (resource_type.to_string(), id.to_string());

        match (op, remote_id) {
            (RemoteOp::Create, _) => {
                let id = next_id(&mut inner, resource_type);
                let stored = with_id(attributes.cloned().unwrap_or(Value::Null), &id);
                inner.resources.insert(key(&id), stored.clone());
                Ok(Some((id, stored)))
            }
            (RemoteOp::Read, Some(id)) => Ok(inner
                .resources
                .get(&key(id))
                .map(|v| (id.to_string(), v.clone()))),
            (RemoteOp::Update, Some(id)) => match inner.resources.get_mut(&key(id)) {
                Some(existing) => {
                    *existing = with_id(attributes.cloned().unwrap_or(Value::Null), id);
                    Ok(Some((id.to_string(), existing.clone())))
                }
                None => Err(RemoteError::not_found(resource_type, id)),
            },
            (RemoteOp::Delete, Some(id)) => inner
                .resources
                .remove(&key(id))
                .map(|v| Some((id.to_string(), v)))
                .ok_or_else(|| RemoteError::not_found(resource_type, id)),
            (_, None) => Err(RemoteError::rejected(400, format!("{op} requires a remote id"))),
        }
    }

    async fn call(
        &self,
        op: RemoteOp,
        resource_type: &str,
        remote_id: Option<&str>,
        attributes: Option<&Value>,
    ) -> RemoteResult<Option<(String, Value)>> {
        let result = self.apply(op, resource_type, remote_id, attributes).await;
        self.leave();
        result
    }
}

fn next_id(inner: &mut Inner, resource_type: &str) -> String {
    inner.next_id += 1;
    format!("{resource_type}-{}", inner.next_id)
}

fn with_id(attributes: Value, remote_id: &str) -> Value {
    let mut object = match attributes {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    object.insert(String::from("id"), Value::String(remote_id.to_string()));
    Value::Object(object)
}

#[async_trait]
impl RemoteClient for InMemoryRemote {
    async fn create(&self, resource_type: &str, attributes: &Value) -> RemoteResult<Created> {
        match self.call(RemoteOp::Create, resource_type, None, Some(attributes)).await? {
            Some((remote_id, attributes)) => Ok(Created { remote_id, attributes }),
            None => Err(RemoteError::InvalidResponse {
                message: String::from("create returned nothing"),
            }),
        }
    }

    async fn read(&self, resource_type: &str, remote_id: &str) -> RemoteResult<ReadOutcome> {
        Ok(self
            .call(RemoteOp::Read, resource_type, Some(remote_id), None)
            .await?
            .map_or(ReadOutcome::NotFound, |(_, v)| ReadOutcome::Found(v)))
    }

    async fn update(&self, resource_type: &str, remote_id: &str, attributes: &Value) -> RemoteResult<Value> {
        self.call(RemoteOp::Update, resource_type, Some(remote_id), Some(attributes))
            .await?
            .map(|(_, v)| v)
            .ok_or_else(|| RemoteError::not_found(resource_type, remote_id))
    }

    async fn delete(&self, resource_type: &str, remote_id: &str) -> RemoteResult<()> {
        self.call(RemoteOp::Delete, resource_type, Some(remote_id), None)
            .await
            .map(|_| ())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_crud_round() {
        let remote = InMemoryRemote::new();

        let created = remote
            .create("frontdoor_backend_pool", &json!({"name": "backend-bing"}))
            .await
            .unwrap();
        assert_eq!(created.remote_id, "frontdoor_backend_pool-1");
        assert_eq!(created.attributes["id"], "frontdoor_backend_pool-1");

        let updated = remote
            .update("frontdoor_backend_pool", &created.remote_id, &json!({"name": "backend-bing", "weight": 50}))
            .await
            .unwrap();
        assert_eq!(updated["weight"], 50);

        remote.delete("frontdoor_backend_pool", &created.remote_id).await.unwrap();
        assert_eq!(
            remote.read("frontdoor_backend_pool", &created.remote_id).await.unwrap(),
            ReadOutcome::NotFound
        );
        assert!(matches!(
            remote.delete("frontdoor_backend_pool", &created.remote_id).await,
            Err(RemoteError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_faults_are_consumed_in_order() {
        let remote = InMemoryRemote::new();
        remote
            .fail_next("t", RemoteOp::Create, RemoteError::RateLimited { retry_after_secs: 0 })
            .await;

        assert!(remote.create("t", &json!({})).await.is_err());
        assert!(remote.create("t", &json!({})).await.is_ok());
        assert_eq!(remote.count(RemoteOp::Create).await, 2);
        assert_eq!(remote.len().await, 1);
    }

    #[tokio::test]
    async fn test_external_changes() {
        let remote = InMemoryRemote::new();
        let id = remote.seed("t", json!({"enabled": true})).await;

        assert!(remote.modify_external("t", &id, "enabled", json!(false)).await);
        assert_eq!(remote.get("t", &id).await.map(|v| v["enabled"].clone()), Some(json!(false)));

        assert!(remote.remove_external("t", &id).await);
        assert!(remote.is_empty().await);
    }
}
