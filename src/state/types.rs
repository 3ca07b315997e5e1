//! Realized state types.
//!
//! A [`Snapshot`] records, per logical name, the inputs last applied and the
//! outputs last observed. It is the only data that outlives a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{Result, StateError, StackweaveError};
use crate::resource::PropertyMap;

/// Current version of the snapshot format.
pub const STATE_VERSION: u32 = 2;

/// Maximum number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The persisted state of one stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    /// Format version.
    pub version: u32,
    /// Project name.
    pub project: String,
    /// Stack name.
    pub stack: String,
    /// Realized resources by logical name.
    #[serde(default)]
    pub records: BTreeMap<String, NodeRecord>,
    /// Recent runs.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// When the snapshot last changed.
    pub last_updated: DateTime<Utc>,
}

/// What is known about one realized resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    /// Logical name.
    pub name: String,
    /// Type token.
    #[serde(rename = "type")]
    pub type_token: String,
    /// Provider-assigned identifier; absent for data sources.
    #[serde(default)]
    pub provider_id: Option<String>,
    /// Declared inputs, with output references in logical form.
    #[serde(default)]
    pub declared_inputs: BTreeMap<String, Value>,
    /// Inputs as last sent to the provider.
    #[serde(default)]
    pub resolved_inputs: PropertyMap,
    /// Outputs as last observed.
    #[serde(default)]
    pub outputs: PropertyMap,
    /// Logical names this resource depended on when applied.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Whether the last operation succeeded.
    #[serde(default)]
    pub status: RecordStatus,
    /// Data sources are re-read each run and never deleted at the provider.
    #[serde(default)]
    pub data_source: bool,
    /// Whether the resource is protected from deletion.
    #[serde(default)]
    pub protect: bool,
    /// Superseded instances whose deletion is still pending.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retired_ids: Vec<String>,
    /// When the record was written.
    pub updated_at: DateTime<Utc>,
}

/// Outcome of the last operation on a record.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Inputs and outputs reflect the realized object.
    #[default]
    Ready,
    /// The last operation failed; the next plan retries it.
    Failed,
}

/// A single write to the snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordChange {
    /// Insert or overwrite a record.
    Put(NodeRecord),
    /// Remove a record.
    Remove(String),
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: HistoryOperation,
    /// Graph fingerprint at the time of the run.
    pub fingerprint: String,
    /// Resources the run acted on.
    pub resources: Vec<String>,
    /// Whether every node succeeded.
    pub success: bool,
    /// Optional summary of what went wrong.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOperation {
    /// `up`
    Update,
    /// `destroy`
    Destroy,
    /// `refresh`
    Refresh,
}

/// Shape of a version 1 snapshot.
#[derive(Debug, Deserialize)]
struct SnapshotV1 {
    project: String,
    stack: String,
    #[serde(default)]
    resources: BTreeMap<String, ResourceV1>,
    last_updated: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ResourceV1 {
    #[serde(rename = "type")]
    type_token: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    inputs: PropertyMap,
    #[serde(default)]
    outputs: PropertyMap,
}

impl Snapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new(project: &str, stack: &str) -> Self {
        Self {
            version: STATE_VERSION,
            project: project.to_string(),
            stack: stack.to_string(),
            records: BTreeMap::new(),
            history: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Parses a snapshot, migrating older formats.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON, a missing version, or a version
    /// newer than this build understands.
    pub fn from_json(content: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(content)
            .map_err(|e| StateError::serialization(format!("Failed to parse state: {e}")))?;

        let version = raw
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| StateError::Corrupted {
                message: String::from("state has no numeric version field"),
            })?;

        match version {
            1 => {
                let old: SnapshotV1 = serde_json::from_value(raw).map_err(|e| {
                    StateError::serialization(format!("Failed to parse version 1 state: {e}"))
                })?;
                Ok(Self::migrate_v1(old))
            }
            2 => serde_json::from_value(raw).map_err(|e| {
                StackweaveError::from(StateError::serialization(format!(
                    "Failed to parse state: {e}"
                )))
            }),
            found => Err(StateError::VersionMismatch {
                expected: STATE_VERSION,
                found: u32::try_from(found).unwrap_or(u32::MAX),
            }
            .into()),
        }
    }

    fn migrate_v1(old: SnapshotV1) -> Self {
        let records = old
            .resources
            .into_iter()
            .map(|(name, resource)| {
                let record = NodeRecord {
                    name: name.clone(),
                    type_token: resource.type_token,
                    provider_id: resource.id,
                    declared_inputs: resource
                        .inputs
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    resolved_inputs: resource.inputs,
                    outputs: resource.outputs,
                    dependencies: Vec::new(),
                    status: RecordStatus::Ready,
                    data_source: false,
                    protect: false,
                    retired_ids: Vec::new(),
                    updated_at: old.last_updated,
                };
                (name, record)
            })
            .collect();

        Self {
            version: STATE_VERSION,
            project: old.project,
            stack: old.stack,
            records,
            history: Vec::new(),
            last_updated: old.last_updated,
        }
    }

    /// Serializes the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            StateError::serialization(format!("Failed to serialize state: {e}")).into()
        })
    }

    /// Gets a record by logical name.
    #[must_use]
    pub fn record(&self, name: &str) -> Option<&NodeRecord> {
        self.records.get(name)
    }

    /// Applies one change.
    pub fn apply(&mut self, change: RecordChange) {
        match change {
            RecordChange::Put(record) => {
                self.records.insert(record.name.clone(), record);
            }
            RecordChange::Remove(name) => {
                self.records.remove(&name);
            }
        }
        self.last_updated = Utc::now();
    }

    /// Adds a history entry, keeping the most recent ones.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Logical names of every record.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.records.keys().map(String::as_str).collect()
    }

    /// Records still marked failed.
    #[must_use]
    pub fn failed_records(&self) -> Vec<&NodeRecord> {
        self.records
            .values()
            .filter(|r| r.status == RecordStatus::Failed)
            .collect()
    }
}

impl NodeRecord {
    /// Creates a ready record.
    #[must_use]
    pub fn new(name: &str, type_token: &str) -> Self {
        Self {
            name: name.to_string(),
            type_token: type_token.to_string(),
            provider_id: None,
            declared_inputs: BTreeMap::new(),
            resolved_inputs: PropertyMap::new(),
            outputs: PropertyMap::new(),
            dependencies: Vec::new(),
            status: RecordStatus::Ready,
            data_source: false,
            protect: false,
            retired_ids: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Returns a copy marked failed.
    #[must_use]
    pub fn failed(mut self) -> Self {
        self.status = RecordStatus::Failed;
        self.updated_at = Utc::now();
        self
    }

    /// Returns true if the last operation on the record succeeded.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == RecordStatus::Ready
    }
}

impl RecordChange {
    /// Logical name the change touches.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Put(record) => &record.name,
            Self::Remove(name) => name,
        }
    }
}

impl HistoryEntry {
    /// Creates a history entry.
    #[must_use]
    pub fn new(
        operation: HistoryOperation,
        fingerprint: &str,
        resources: Vec<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            fingerprint: fingerprint.to_string(),
            resources,
            success: error.is_none(),
            error,
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        write!(f, "{status}")
    }
}

impl std::fmt::Display for HistoryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Update => "update",
            Self::Destroy => "destroy",
            Self::Refresh => "refresh",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_migrates_version_one() {
        let v1 = json!({
            "version": 1,
            "project": "demo",
            "stack": "dev",
            "last_updated": "2024-01-01T00:00:00Z",
            "resources": {
                "apprepo": {
                    "type": "aws:ecr/Repository",
                    "id": "repository-000001",
                    "inputs": { "name": "apprepo" },
                    "outputs": { "repositoryUrl": "acct.dkr/apprepo" }
                }
            }
        });
        let snapshot = Snapshot::from_json(&v1.to_string()).expect("migrated");
        assert_eq!(snapshot.version, STATE_VERSION);

        let record = snapshot.record("apprepo").expect("record");
        assert_eq!(record.provider_id.as_deref(), Some("repository-000001"));
        assert_eq!(record.declared_inputs["name"], json!("apprepo"));
        assert!(record.is_ready());
    }

    #[test]
    fn test_rejects_newer_versions() {
        let err = Snapshot::from_json(r#"{"version": 7}"#).expect_err("too new");
        assert!(err.to_string().contains("expected 2, found 7"));

        assert!(Snapshot::from_json(r#"{"project": "x"}"#).is_err());
        assert!(Snapshot::from_json("not json").is_err());
    }

    #[test]
    fn test_round_trip_keeps_records() {
        let mut snapshot = Snapshot::new("demo", "dev");
        let mut record = NodeRecord::new("app-cluster", "aws:ecs/Cluster");
        record.provider_id = Some(String::from("cluster-000001"));
        snapshot.apply(RecordChange::Put(record));

        let parsed = Snapshot::from_json(&snapshot.to_json().expect("json")).expect("parsed");
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_apply_remove_and_history_cap() {
        let mut snapshot = Snapshot::new("demo", "dev");
        snapshot.apply(RecordChange::Put(NodeRecord::new("a", "test:Thing").failed()));
        assert_eq!(snapshot.failed_records().len(), 1);
        snapshot.apply(RecordChange::Remove(String::from("a")));
        assert!(snapshot.names().is_empty());

        for _ in 0..(MAX_HISTORY + 5) {
            snapshot.add_history(HistoryEntry::new(HistoryOperation::Update, "abc", vec![], None));
        }
        assert_eq!(snapshot.history.len(), MAX_HISTORY);
    }
}
