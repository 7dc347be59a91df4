//! Error types for the Convergent reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, state storage, the remote control plane, planning,
//! applying, and reconciliation.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Convergent engine.
#[derive(Debug, Error)]
pub enum ConvergentError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Remote control plane errors.
    #[error("Remote API error: {0}")]
    Remote(#[from] RemoteError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Duplicate resource definition.
    #[error("Duplicate {resource_type} name: {name}")]
    DuplicateName {
        /// Type of the duplicated resource.
        resource_type: String,
        /// The duplicated name.
        name: String,
    },

    /// A schema definition is malformed.
    #[error("Invalid schema for resource type '{resource_type}': {message}")]
    InvalidSchema {
        /// Resource type the schema describes.
        resource_type: String,
        /// Description of the problem.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Writing the state failed.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// No entry exists for the given logical name.
    #[error("No state entry for resource '{name}'")]
    UnknownResource {
        /// Logical name that was looked up.
        name: String,
    },
}

/// Remote control plane errors.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Authentication failed.
    #[error("Remote authentication failed: {message}")]
    AuthenticationFailed {
        /// Description of the auth failure.
        message: String,
    },

    /// The remote rejected the request.
    #[error("Remote request rejected: {status} - {message}")]
    Rejected {
        /// HTTP status code (or equivalent).
        status: u16,
        /// Error message from the remote.
        message: String,
    },

    /// Rate limited.
    #[error("Remote API rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The request timed out.
    #[error("Remote request timed out: {message}")]
    Timeout {
        /// Description of the timeout.
        message: String,
    },

    /// The remote is temporarily unavailable.
    #[error("Remote service unavailable: {message}")]
    Unavailable {
        /// Description of the outage.
        message: String,
    },

    /// Resource not found.
    #[error("{resource_type} '{remote_id}' not found")]
    NotFound {
        /// Type of the missing resource.
        resource_type: String,
        /// Remote identifier of the missing resource.
        remote_id: String,
    },

    /// Network error.
    #[error("Network error communicating with the remote: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// Invalid response from API.
    #[error("Invalid response from remote API: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// Planning errors. Any of these aborts the run before a remote mutation.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A declared descriptor failed schema validation.
    #[error("Invalid resource '{resource}': {message}")]
    Validation {
        /// Logical name of the offending descriptor.
        resource: String,
        /// Description of the problem.
        message: String,
    },

    /// The reference graph contains a cycle.
    #[error("Dependency cycle detected: {cycle}")]
    CycleDetected {
        /// The cycle, rendered as `a -> b -> a`.
        cycle: String,
    },
}

/// Apply errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// One or more actions ended in the failed state.
    #[error("{failed} of {total} actions failed")]
    ActionsFailed {
        /// Number of failed actions.
        failed: usize,
        /// Total number of actions in the plan.
        total: usize,
    },

    /// An action was asked to make an illegal state transition.
    #[error("Illegal transition for action {action}: {from} -> {to}")]
    InvalidTransition {
        /// Action id.
        action: usize,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// Maximum retry attempts exceeded.
    #[error("Maximum retry attempts ({attempts}) exceeded for {resource}: {last_error}")]
    MaxRetriesExceeded {
        /// Number of attempts made.
        attempts: u32,
        /// Resource that failed.
        resource: String,
        /// Last transient error observed.
        last_error: String,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Import target is already tracked in state.
    #[error("Resource '{name}' is already managed (remote id {remote_id}); remove it from state before importing")]
    AlreadyManaged {
        /// Logical name.
        name: String,
        /// Remote id currently recorded.
        remote_id: String,
    },

    /// A resource expected to exist was not found remotely.
    #[error("{resource_type} '{name}' does not exist remotely")]
    Missing {
        /// Resource type.
        resource_type: String,
        /// Logical name.
        name: String,
    },

    /// A resource expected to be destroyed still exists remotely.
    #[error("{resource_type} '{name}' still exists remotely (remote id {remote_id})")]
    StillExists {
        /// Resource type.
        resource_type: String,
        /// Logical name.
        name: String,
        /// Remote id that is still readable.
        remote_id: String,
    },
}

/// Result type alias for Convergent operations.
pub type Result<T> = std::result::Result<T, ConvergentError>;

impl ConvergentError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is a remote "not found" signal.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Remote(RemoteError::NotFound { .. }))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

impl RemoteError {
    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource_type: impl Into<String>, remote_id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            remote_id: remote_id.into(),
        }
    }

    /// Returns true for failures worth retrying: rate limits, timeouts,
    /// outages and dropped connections.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Timeout { .. }
                | Self::Unavailable { .. }
                | Self::NetworkError { .. }
        )
    }

    /// Returns the delay a rate limit asked for, if any.
    #[must_use]
    pub const fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

impl PlanError {
    /// Creates a validation error for a descriptor.
    #[must_use]
    pub fn validation(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: message.into(),
        }
    }
}
