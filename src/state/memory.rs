//! In-memory state backend.
//!
//! Used by `preview` when no state should be touched and by tests that need
//! to inspect every write or inject write failures.

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{Result, StackweaveError, StateError};

use super::lock::{LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::Snapshot;

/// State store that keeps the snapshot in process memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshot: Mutex<Option<Snapshot>>,
    lock: Mutex<Option<LockInfo>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

fn poisoned() -> StackweaveError {
    StackweaveError::State(StateError::backend("memory state mutex poisoned"))
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with `snapshot`.
    #[must_use]
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            ..Self::default()
        }
    }

    /// Number of successful saves so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes every following save fail until switched off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Current snapshot, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal mutex is poisoned.
    pub fn current(&self) -> Result<Option<Snapshot>> {
        self.snapshot.lock().map(|s| s.clone()).map_err(|_| poisoned())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        self.current()
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StackweaveError::State(StateError::backend(
                "simulated state write failure",
            )));
        }
        *self.snapshot.lock().map_err(|_| poisoned())? = Some(snapshot.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        *self.snapshot.lock().map_err(|_| poisoned())? = None;
        *self.lock.lock().map_err(|_| poisoned())? = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.snapshot.lock().map_err(|_| poisoned())?.is_some())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let mut guard = self.lock.lock().map_err(|_| poisoned())?;
        if let Some(existing) = guard.as_ref().filter(|l| !l.is_expired()) {
            return Err(StackweaveError::State(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }));
        }
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock = LockInfo::new(&holder_id, operation);
        *guard = Some(lock.clone());
        Ok(lock)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut guard = self.lock.lock().map_err(|_| poisoned())?;
        if guard.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *guard = None;
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        *self.lock.lock().map_err(|_| poisoned())? = None;
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.lock.lock().map(|l| l.clone()).map_err(|_| poisoned())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{NodeRecord, RecordChange};

    #[tokio::test]
    async fn test_counts_writes_and_keeps_working_copy_on_failure() {
        let store = MemoryStateStore::new();
        let mut snapshot = Snapshot::new("demo", "dev");

        store
            .record_node_result(&mut snapshot, RecordChange::Put(NodeRecord::new("a", "test:Thing")))
            .await
            .expect("write");
        assert_eq!(store.write_count(), 1);

        store.set_fail_writes(true);
        let result = store
            .record_node_result(&mut snapshot, RecordChange::Put(NodeRecord::new("b", "test:Thing")))
            .await;
        assert!(result.is_err());
        assert_eq!(store.write_count(), 1);
        assert_eq!(snapshot.names(), vec!["a", "b"]);

        let persisted = store.current().expect("current").expect("snapshot");
        assert_eq!(persisted.names(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let store = MemoryStateStore::new();
        let lock = store.acquire_lock("one", "up").await.expect("lock");
        assert!(store.acquire_lock("two", "up").await.is_err());
        store.release_lock("someone-else").await.expect("noop");
        assert!(store.is_locked().await.expect("locked"));
        store.release_lock(&lock.lock_id).await.expect("release");
        assert!(!store.is_locked().await.expect("unlocked"));
    }
}
