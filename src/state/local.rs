//! Local file-based state storage backend.
//!
//! Each stack gets `<base>/<stack>.json` plus a `<stack>.lock` file. Saves go
//! through a temporary file and a rename so a crash never leaves a torn
//! snapshot behind.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, StackweaveError, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::Snapshot;

/// Default state directory name.
pub const STATE_DIR: &str = ".stackweave";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the snapshot file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

fn backend_err(message: String) -> StackweaveError {
    StackweaveError::State(StateError::backend(message))
}

impl LocalStateStore {
    /// Creates a store under `./.stackweave` for `stack`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new(stack: &str) -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| StackweaveError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir, stack))
    }

    /// Creates a store for `stack` under a custom directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>, stack: &str) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(format!("{stack}.json"));
        let lock_path = base_dir.join(format!("{stack}.lock"));

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Creates a store from an explicit snapshot path.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let lock_path = state_path.with_extension("lock");

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| backend_err(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StackweaveError::State(StateError::LockFailed {
                    message: format!("Failed to read lock file: {e}"),
                }));
            }
        };

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            StackweaveError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    /// Creates the lock file, failing if one already exists.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<bool> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info).map_err(|e| {
            StackweaveError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(StackweaveError::State(StateError::LockFailed {
                    message: format!("Failed to create lock file: {e}"),
                }));
            }
        };

        file.write_all(content.as_bytes()).await.map_err(|e| {
            StackweaveError::State(StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })
        })?;
        file.sync_all().await.map_err(|e| {
            StackweaveError::State(StateError::LockFailed {
                message: format!("Failed to sync lock file: {e}"),
            })
        })?;

        Ok(true)
    }

    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StackweaveError::State(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        debug!("Loading state from {}", self.state_path.display());

        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file found");
                return Ok(None);
            }
            Err(e) => return Err(backend_err(format!("Failed to read state file: {e}"))),
        };

        let snapshot = Snapshot::from_json(&content)?;
        info!(
            project = %snapshot.project,
            stack = %snapshot.stack,
            resources = snapshot.records.len(),
            "Loaded state"
        );
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        self.ensure_dir().await?;
        let content = snapshot.to_json()?;

        let temp_path = self.state_path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| backend_err(format!("Failed to create temp state file: {e}")))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| backend_err(format!("Failed to write state: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| backend_err(format!("Failed to sync state: {e}")))?;
        drop(file);

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| backend_err(format!("Failed to replace state file: {e}")))?;

        debug!(path = %self.state_path.display(), "State saved");
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        info!("Deleting state at {}", self.state_path.display());
        match fs::remove_file(&self.state_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(backend_err(format!("Failed to delete state file: {e}"))),
        }
        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(fs::try_exists(&self.state_path).await.unwrap_or(false))
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder_id, operation);

        if self.create_lock_file(&lock_info).await? {
            info!(
                "Acquired state lock: {} (expires in {LOCK_EXPIRY_SECS}s)",
                lock_info.lock_id
            );
            return Ok(lock_info);
        }

        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StackweaveError::State(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            debug!(holder = %existing.holder, "Expired lock found, taking over");
        }

        self.delete_lock_file().await?;
        if self.create_lock_file(&lock_info).await? {
            info!("Acquired state lock: {}", lock_info.lock_id);
            Ok(lock_info)
        } else {
            Err(StackweaveError::State(StateError::LockFailed {
                message: String::from("Another process took the lock concurrently"),
            }))
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        info!("Force-removing state lock at {}", self.lock_path.display());
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
