//! S3-based state storage backend.
//!
//! Keeps the state document and its lock object in a bucket so that several
//! operators (or CI runners) can reconcile the same project. The lock object
//! is written with `If-None-Match: *`, so only one run can create it.

use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{ConvergentError, Result, StateError};

use super::lock::{ensure_takeable, holder_or_generated, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::ObservedState;

const STATE_KEY: &str = "state.json";
const LOCK_KEY: &str = "state.lock";

/// Status S3 returns when a conditional write loses.
const PRECONDITION_FAILED: u16 = 412;
/// Status S3 returns when two conditional writes race.
const CONDITIONAL_CONFLICT: u16 = 409;

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3StateStore {
    /// Creates a store using credentials from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let mut loader = aws_config::from_env();
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region.to_string()));
        }
        let config = loader.load().await;

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a store around an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    fn url(&self, key: &str) -> String {
        format!("s3://{}/{key}", self.bucket)
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let response = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(response) => response,
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    return Ok(None);
                }
                return Err(StateError::s3(format!("Reading {}: {service_err}", self.url(key))).into());
            }
        };

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StateError::s3(format!("Reading body of {}: {e}", self.url(key))))?;

        String::from_utf8(bytes.to_vec()).map(Some).map_err(|e| {
            ConvergentError::State(StateError::Corrupted {
                message: format!("{} is not UTF-8: {e}", self.url(key)),
            })
        })
    }

    async fn put_object(&self, key: &str, content: String) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(content.into_bytes()))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::s3(format!("Writing {}: {e}", self.url(key))))?;
        Ok(())
    }

    /// Creates `key` only if it does not exist. Returns false if it does.
    async fn put_if_absent(&self, key: &str, content: String) -> Result<bool> {
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .if_none_match("*")
            .body(ByteStream::from(content.into_bytes()))
            .content_type("application/json")
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if lost_condition(&err) => Ok(false),
            Err(err) => Err(StateError::s3(format!("Writing {}: {err}", self.url(key))).into()),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::s3(format!("Deleting {}: {e}", self.url(key))))?;
        Ok(())
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        self.get_object(&self.key(LOCK_KEY))
            .await?
            .map(|content| LockInfo::decode(&content))
            .transpose()
    }
}

fn lost_condition<E>(err: &SdkError<E, HttpResponse>) -> bool {
    err.raw_response()
        .is_some_and(|response| matches!(response.status().as_u16(), PRECONDITION_FAILED | CONDITIONAL_CONFLICT))
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<ObservedState>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from {}", self.url(&key));

        let Some(content) = self.get_object(&key).await? else {
            debug!("No state document in S3");
            return Ok(None);
        };

        let state = ObservedState::decode(&content)?;
        info!(
            serial = state.serial,
            "Loaded state for project: {}/{}",
            state.project, state.environment
        );
        Ok(Some(state))
    }

    async fn save(&self, state: &ObservedState) -> Result<()> {
        let key = self.key(STATE_KEY);
        debug!(serial = state.serial, "Saving state to {}", self.url(&key));
        self.put_object(&key, state.encode()?).await
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.key(STATE_KEY);
        info!("Deleting state at {}", self.url(&state_key));

        self.delete_object(&state_key).await?;
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn exists(&self) -> Result<bool> {
        let key = self.key(STATE_KEY);
        match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StateError::s3(format!("Checking {}: {service_err}", self.url(&key))).into())
                }
            }
        }
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);
        let lock_info = LockInfo::new(&holder_or_generated(holder));

        if !self.put_if_absent(&key, lock_info.encode()?).await? {
            ensure_takeable(self.read_lock().await?.as_ref())?;
            self.delete_object(&key).await?;

            if !self.put_if_absent(&key, lock_info.encode()?).await? {
                return Err(self.read_lock().await?.map_or_else(
                    || {
                        ConvergentError::State(StateError::LockFailed {
                            message: String::from("Lock object changed while taking over an expired lock"),
                        })
                    },
                    |lock| lock.conflict(),
                ));
            }
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.read_lock().await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.delete_object(&self.key(LOCK_KEY)).await?;
                info!("Released state lock: {lock_id}");
            }
            Some(existing) => debug!("Lock {lock_id} not released; bucket holds {}", existing.lock_id),
            None => {}
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self.read_lock().await?.is_some_and(|lock| !lock.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
