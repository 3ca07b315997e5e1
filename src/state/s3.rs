//! S3-based state storage backend.
//!
//! Snapshots live at `s3://<bucket>/<prefix><stack>.json` so a team can share
//! one stack. The lock object sits next to it as `<stack>.lock`.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{StackweaveError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::Snapshot;

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
    /// Stack the store belongs to.
    stack: String,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(
        bucket: &str,
        prefix: Option<&str>,
        region: Option<&str>,
        stack: &str,
    ) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix, stack))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>, stack: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            stack: stack.to_string(),
        }
    }

    /// Object key of the snapshot.
    fn state_key(&self) -> String {
        format!("{}{}.json", self.prefix, self.stack)
    }

    /// Object key of the lock.
    fn lock_key(&self) -> String {
        format!("{}{}.lock", self.prefix, self.stack)
    }

    fn parse_lock(content: &str) -> Result<LockInfo> {
        serde_json::from_str(content).map_err(|e| {
            StackweaveError::State(StateError::Corrupted {
                message: format!("Failed to parse lock: {e}"),
            })
        })
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    StackweaveError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StackweaveError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StackweaveError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| {
                StackweaveError::State(StateError::s3(format!("S3 put error: {e}")))
            })?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                StackweaveError::State(StateError::s3(format!("S3 delete error: {e}")))
            })?;

        Ok(())
    }

    /// Checks if an object exists in S3.
    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StackweaveError::State(StateError::s3(format!(
                        "S3 head error: {service_err}"
                    ))))
                }
            }
        }
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<Snapshot>> {
        let key = self.state_key();
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(json) = self.get_object(&key).await? else {
            debug!("No state found in S3");
            return Ok(None);
        };

        let snapshot = Snapshot::from_json(&json)?;
        info!(
            "Loaded state for {}/{} ({} resources)",
            snapshot.project,
            snapshot.stack,
            snapshot.records.len()
        );
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let key = self.state_key();
        debug!("Saving state to s3://{}/{key}", self.bucket);
        self.put_object(&key, &snapshot.to_json()?).await
    }

    async fn delete(&self) -> Result<()> {
        let state_key = self.state_key();
        info!("Deleting state from s3://{}/{state_key}", self.bucket);

        self.delete_object(&state_key).await?;
        self.delete_object(&self.lock_key()).await
    }

    async fn exists(&self) -> Result<bool> {
        self.object_exists(&self.state_key()).await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let key = self.lock_key();

        if let Some(content) = self.get_object(&key).await? {
            let existing = Self::parse_lock(&content)?;
            if !existing.is_expired() {
                return Err(StackweaveError::State(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Expired lock found, taking over");
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder_id, operation);

        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            StackweaveError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;
        self.put_object(&key, &content).await?;

        info!(
            "Acquired state lock: {} (expires in {LOCK_EXPIRY_SECS}s)",
            lock_info.lock_id
        );
        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let key = self.lock_key();

        if let Some(content) = self.get_object(&key).await? {
            let existing = Self::parse_lock(&content)?;
            if existing.lock_id == lock_id {
                self.delete_object(&key).await?;
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
        info!("Force-removing lock s3://{}/{}", self.bucket, self.lock_key());
        self.delete_object(&self.lock_key()).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.get_object(&self.lock_key())
            .await?
            .map(|content| Self::parse_lock(&content))
            .transpose()
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
