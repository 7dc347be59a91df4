//! Types exchanged with the remote control plane.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Created {
    /// Identifier the remote assigned.
    pub remote_id: String,
    /// Full attribute state the remote reported back.
    pub attributes: Value,
}

/// Outcome of a read.
///
/// Not-found is an expected answer during refresh and destroy checks, so it
/// is a value here rather than an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// The resource exists; carries its attributes.
    Found(Value),
    /// The remote has no resource with that id.
    NotFound,
}

/// Remote operation kinds, used for fault injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteOp {
    /// `create`
    Create,
    /// `read`
    Read,
    /// `update`
    Update,
    /// `delete`
    Delete,
}

impl ReadOutcome {
    /// Returns the attributes when found.
    #[must_use]
    pub fn into_found(self) -> Option<Value> {
        match self {
            Self::Found(value) => Some(value),
            Self::NotFound => None,
        }
    }
}

impl std::fmt::Display for RemoteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{op}")
    }
}
