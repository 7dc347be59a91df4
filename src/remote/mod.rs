//! Remote control plane access.
//!
//! This module provides:
//! - The `RemoteClient` trait the engine drives
//! - A JSON/HTTP client and an in-memory control plane
//! - Retry with bounded exponential backoff
//! - The reader used for import, refresh and existence checks

mod client;
mod http;
mod memory;
mod reader;
mod retry;
mod types;

pub use client::{RemoteClient, RemoteResult};
pub use http::{HttpRemoteClient, DEFAULT_TIMEOUT_SECS, TOKEN_ENV_VAR};
pub use memory::{InMemoryRemote, RemoteCall};
pub use reader::{RefreshFailure, RefreshReport, ResourceReader};
pub use retry::{
    Attempted, RetryPolicy, DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_BACKOFF_MS,
};
pub use types::{Created, ReadOutcome, RemoteOp};
