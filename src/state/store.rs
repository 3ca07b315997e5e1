//! State store trait definition.
//!
//! A store persists one stack's [`Snapshot`] and guards it with a lock.

use async_trait::async_trait;

use crate::error::Result;

use super::lock::LockInfo;
use super::types::{RecordChange, Snapshot};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the snapshot.
    ///
    /// Returns `None` if the stack has never been deployed.
    async fn load(&self) -> Result<Option<Snapshot>>;

    /// Persists the whole snapshot.
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Applies one node's outcome and persists it before returning.
    ///
    /// Callers serialize calls for a given snapshot; the working copy is
    /// updated even when the write fails so later writes carry it along.
    async fn record_node_result(&self, snapshot: &mut Snapshot, change: RecordChange) -> Result<()> {
        snapshot.apply(change);
        self.save(snapshot).await
    }

    /// Deletes the snapshot and any lock.
    async fn delete(&self) -> Result<()>;

    /// Checks if a snapshot exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires the stack lock for `operation`.
    ///
    /// An expired lock is taken over. An empty `holder` gets a generated id.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the lock regardless of owner.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked by a live lock.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
