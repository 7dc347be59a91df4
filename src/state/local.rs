//! Local file-based state storage backend.
//!
//! State lives in a JSON document next to the configuration file. Writes go
//! to a temporary file that is synced and renamed over the old document, so
//! a crash mid-write never leaves a torn state file behind. The lock file is
//! created exclusively; two runs racing for it cannot both win.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{ConvergentError, Result, StateError};

use super::lock::{ensure_takeable, holder_or_generated, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::ObservedState;

/// Default state directory name.
pub const STATE_DIR: &str = ".convergent";

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    state_path: PathBuf,
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Stores `state.json` and `state.lock` inside `base_dir`.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            state_path: base_dir.join(STATE_FILE),
            lock_path: base_dir.join(LOCK_FILE),
        }
    }

    /// Stores the document at `state_path`; the lock sits beside it.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let lock_path = state_path.with_extension("lock");
        Self { state_path, lock_path }
    }

    /// Returns the path of the state document.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| StateError::write(format!("Failed to create {}: {e}", dir.display())))?;
        }
        Ok(())
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        read_optional(&self.lock_path)
            .await?
            .map(|content| LockInfo::decode(&content))
            .transpose()
    }

    /// Creates the lock file only if none exists. Returns false if one does.
    async fn create_lock(&self, lock_info: &LockInfo) -> Result<bool> {
        Self::ensure_parent(&self.lock_path).await?;
        let content = lock_info.encode()?;

        let lock_failed = |e: std::io::Error| {
            ConvergentError::State(StateError::LockFailed {
                message: format!("Failed to write {}: {e}", self.lock_path.display()),
            })
        };

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.lock_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(lock_failed(e)),
        };
        file.write_all(content.as_bytes()).await.map_err(lock_failed)?;
        file.sync_all().await.map_err(lock_failed)?;

        Ok(true)
    }

    async fn remove_lock(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(ConvergentError::State(StateError::LockFailed {
                message: format!("Failed to delete {}: {e}", self.lock_path.display()),
            })),
            _ => Ok(()),
        }
    }
}

/// Reads a file, treating a missing file as `None`.
async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConvergentError::State(StateError::Corrupted {
            message: format!("Failed to read {}: {e}", path.display()),
        })),
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<ObservedState>> {
        debug!("Loading state from: {}", self.state_path.display());

        let Some(content) = read_optional(&self.state_path).await? else {
            debug!("No state document yet");
            return Ok(None);
        };

        ObservedState::decode(&content).map(Some)
    }

    async fn save(&self, state: &ObservedState) -> Result<()> {
        Self::ensure_parent(&self.state_path).await?;
        debug!(serial = state.serial, "Saving state to: {}", self.state_path.display());

        let content = state.encode()?;
        let temp_path = self.state_path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::write(format!("Failed to create {}: {e}", temp_path.display())))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::write(format!("Failed to write state: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::write(format!("Failed to sync state: {e}")))?;
        drop(file);

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| StateError::write(format!("Failed to replace state document: {e}")))?;

        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.state_path).await {
            Ok(()) => info!("Deleted state file: {}", self.state_path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StateError::write(format!("Failed to delete state file: {e}")).into()),
        }

        self.remove_lock().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(fs::try_exists(&self.state_path).await.unwrap_or(false))
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let lock_info = LockInfo::new(&holder_or_generated(holder));

        if !self.create_lock(&lock_info).await? {
            ensure_takeable(self.read_lock().await?.as_ref())?;
            self.remove_lock().await?;

            if !self.create_lock(&lock_info).await? {
                let winner = self.read_lock().await?;
                return Err(winner.map_or_else(
                    || {
                        ConvergentError::State(StateError::LockFailed {
                            message: String::from("Lock file changed while taking over an expired lock"),
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
                self.remove_lock().await?;
                debug!("Released state lock: {lock_id}");
            }
            Some(existing) => debug!("Lock {lock_id} not released; file holds {}", existing.lock_id),
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
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{AttributeMap, AttributeValue};
    use crate::state::ResourceState;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load_round_trips_attributes() {
        let (store, _temp) = create_test_store();

        let mut attributes = AttributeMap::new();
        attributes.insert(
            String::from("accepted_protocols"),
            AttributeValue::Set(vec![
                AttributeValue::String(String::from("Http")),
                AttributeValue::String(String::from("Https")),
            ]),
        );

        let mut state = ObservedState::new("frontdoor", "test");
        state.upsert(ResourceState::new("routing-rule", "frontdoor_routing_rule", "rr-1", attributes.clone()));
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.project, "frontdoor");
        assert_eq!(loaded.get("routing-rule").map(|r| &r.attributes), Some(&attributes));
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected() {
        let (store, _temp) = create_test_store();

        let mut state = ObservedState::new("frontdoor", "test");
        state.version = String::from("0.1");
        store.save(&state).await.expect("Failed to save state");

        assert!(matches!(
            store.load().await,
            Err(ConvergentError::State(StateError::VersionMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));
        assert!(store.acquire_lock("other").await.is_err());

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, temp) = create_test_store();

        let mut stale = LockInfo::new("crashed-run");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        std::fs::write(temp.path().join(LOCK_FILE), stale.encode().expect("encode")).expect("write lock");

        let lock = store.acquire_lock("next-run").await.expect("takeover");
        assert_eq!(lock.holder, "next-run");
        assert_eq!(
            store.get_lock_info().await.expect("lock info").map(|l| l.lock_id),
            Some(lock.lock_id)
        );
    }

    #[tokio::test]
    async fn test_custom_state_path_keeps_lock_alongside() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_state_path(temp.path().join("nested/fd.json"));

        store.save(&ObservedState::new("frontdoor", "test")).await.expect("save");
        store.acquire_lock("me").await.expect("lock");

        assert!(temp.path().join("nested/fd.json").exists());
        assert!(temp.path().join("nested/fd.lock").exists());
        assert!(!temp.path().join("nested/fd.json.tmp").exists());
    }
}
