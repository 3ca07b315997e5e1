//! Stack locks.
//!
//! A lock keeps two runs from writing the same stack's snapshot. Locks carry
//! an expiry so a crashed run does not hold the stack forever.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lock lifetime in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 1800;

/// A held or persisted lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// Command that took the lock, e.g. `up`.
    #[serde(default)]
    pub operation: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a lock for `holder` with the default lifetime.
    #[must_use]
    pub fn new(holder: &str, operation: &str) -> Self {
        Self::with_ttl(holder, operation, Duration::seconds(LOCK_EXPIRY_SECS))
    }

    /// Creates a lock with an explicit lifetime.
    #[must_use]
    pub fn with_ttl(holder: &str, operation: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            operation: operation.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    /// Returns true once the lock has outlived its lease.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Seconds until expiry, never negative.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// Builds a holder id of the form `host-pid-xxxxxxxx`.
#[must_use]
pub fn generate_holder_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| String::from("unknown"));
    let pid = std::process::id();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}-{pid}-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lock_is_live() {
        let lock = LockInfo::new("ci-runner", "up");
        assert!(!lock.is_expired());
        assert_eq!(lock.operation, "up");
        assert!(lock.remaining_secs() > LOCK_EXPIRY_SECS - 5);
    }

    #[test]
    fn test_expired_lock() {
        let lock = LockInfo::with_ttl("ci-runner", "destroy", Duration::seconds(-1));
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), 0);
    }

    #[test]
    fn test_holder_ids_are_unique() {
        let a = generate_holder_id();
        let b = generate_holder_id();
        assert_ne!(a, b);
        assert!(a.contains(&std::process::id().to_string()));
    }
}
