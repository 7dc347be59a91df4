//! In-memory state backend.
//!
//! Used for dry runs against a snapshot and by the engine's own tests. It
//! counts writes so callers can check that each successful action was
//! persisted on its own.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use crate::error::Result;

use super::lock::{ensure_takeable, holder_or_generated, LockInfo};
use super::store::StateStore;
use super::types::ObservedState;

/// State store that keeps the document in process memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<ObservedState>>,
    lock: Mutex<Option<LockInfo>>,
    saves: AtomicUsize,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with an existing document.
    #[must_use]
    pub fn with_state(state: ObservedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            ..Self::default()
        }
    }

    /// Number of successful `save` calls so far.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Returns a copy of the current document.
    pub async fn snapshot(&self) -> Option<ObservedState> {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<ObservedState>> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, state: &ObservedState) -> Result<()> {
        *self.state.lock().await = Some(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.state.lock().await = None;
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state.lock().await.is_some())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut guard = self.lock.lock().await;
        ensure_takeable(guard.as_ref())?;

        let lock_info = LockInfo::new(&holder_or_generated(holder));
        *guard = Some(lock_info.clone());
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut guard = self.lock.lock().await;
        if guard.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *guard = None;
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .lock
            .lock()
            .await
            .as_ref()
            .is_some_and(|l| !l.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
