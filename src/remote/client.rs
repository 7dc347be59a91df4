//! Remote control plane client interface.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RemoteError;

use super::types::{Created, ReadOutcome};

/// Result of a single remote call.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// CRUD access to the remote control plane.
///
/// Implementations must be safe to call from several workers at once.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Creates a resource and returns its id and reported attributes.
    async fn create(&self, resource_type: &str, attributes: &Value) -> RemoteResult<Created>;

    /// Reads a resource. A missing resource is `ReadOutcome::NotFound`.
    async fn read(&self, resource_type: &str, remote_id: &str) -> RemoteResult<ReadOutcome>;

    /// Updates a resource in place and returns its reported attributes.
    async fn update(
        &self,
        resource_type: &str,
        remote_id: &str,
        attributes: &Value,
    ) -> RemoteResult<Value>;

    /// Deletes a resource. A missing resource yields `RemoteError::NotFound`.
    async fn delete(&self, resource_type: &str, remote_id: &str) -> RemoteResult<()>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}
