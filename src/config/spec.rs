//! Project file types.
//!
//! This module defines the structs that map to `stackweave.yaml`. The file
//! names the project and stack, supplies program configuration values, and
//! selects the state backend, provider and execution limits.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use ::validator::Validate;

/// The root structure of a project file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectFile {
    /// Project-level settings.
    pub project: ProjectConfig,
    /// Program configuration values.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Execution limits.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Provider selection.
    #[serde(default)]
    pub provider: ProviderConfig,
}

/// Project-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Project name.
    pub name: String,
    /// Stack (deployment instance) name, e.g. "dev" or "prod".
    #[serde(default = "default_stack")]
    pub stack: String,
    /// Target region.
    #[serde(default)]
    pub region: Option<String>,
    /// Program to run.
    #[serde(default = "default_program")]
    pub program: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for the s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (the AWS default chain applies when unset).
    #[serde(default)]
    pub region: Option<String>,
    /// State file path for the local backend.
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local JSON file.
    #[default]
    Local,
    /// AWS S3 object.
    S3,
}

/// How downstream nodes react to upstream changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiffPolicy {
    /// Compare declared inputs only; a changed upstream value alone is a no-op.
    #[default]
    Reference,
    /// Nodes consuming outputs of a changed node are updated too.
    Value,
}

/// Execution limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ExecutionConfig {
    /// Nodes running concurrently within a batch.
    #[serde(default = "default_parallelism")]
    #[validate(range(min = 1, max = 64))]
    pub parallelism: usize,
    /// Attempts per provider operation, including the first.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    /// Backoff before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    #[validate(range(min = 1, max = 60_000))]
    pub initial_backoff_ms: u64,
    /// Upper bound on a single backoff, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    #[validate(range(min = 1, max = 600_000))]
    pub max_backoff_ms: u64,
    /// Deadline for one provider operation, in seconds.
    #[serde(default = "default_operation_timeout_secs")]
    #[validate(range(min = 1, max = 7_200))]
    pub operation_timeout_secs: u64,
    /// Diff policy for downstream nodes.
    #[serde(default)]
    pub diff_policy: DiffPolicy,
}

/// Provider kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-process simulated cloud.
    #[default]
    Simulated,
    /// Provider plugin reached over HTTP.
    Http,
}

/// Provider selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Provider kind.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Plugin endpoint (required for the http provider).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Account identifier used by the simulated provider.
    #[serde(default)]
    pub account: Option<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
            diff_policy: DiffPolicy::default(),
        }
    }
}

impl ExecutionConfig {
    /// Backoff before the first retry.
    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Upper bound on a single backoff.
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Deadline for one provider operation.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl ProjectFile {
    /// Creates a project file with defaults for everything but the names.
    #[must_use]
    pub fn new(name: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            project: ProjectConfig {
                name: name.into(),
                stack: stack.into(),
                region: None,
                program: default_program(),
            },
            config: BTreeMap::new(),
            state: StateConfig::default(),
            execution: ExecutionConfig::default(),
            provider: ProviderConfig::default(),
        }
    }

    /// Qualified stack name, `<project>/<stack>`.
    #[must_use]
    pub fn qualified_stack(&self) -> String {
        format!("{}/{}", self.project.name, self.project.stack)
    }
}

const fn default_parallelism() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_operation_timeout_secs() -> u64 {
    300
}

fn default_stack() -> String {
    String::from("dev")
}

fn default_program() -> String {
    String::from("fargate")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_defaults() {
        let execution = ExecutionConfig::default();
        assert_eq!(execution.parallelism, 4);
        assert_eq!(execution.max_attempts, 5);
        assert_eq!(execution.initial_backoff(), Duration::from_millis(500));
        assert_eq!(execution.max_backoff(), Duration::from_secs(30));
        assert_eq!(execution.operation_timeout(), Duration::from_secs(300));
        assert_eq!(execution.diff_policy, DiffPolicy::Reference);
    }

    #[test]
    fn test_execution_ranges_validated() {
        let execution = ExecutionConfig {
            parallelism: 0,
            ..ExecutionConfig::default()
        };
        let errors = execution.validate().expect_err("zero parallelism");
        assert!(errors.field_errors().contains_key("parallelism"));
    }

    #[test]
    fn test_qualified_stack() {
        assert_eq!(ProjectFile::new("app", "prod").qualified_stack(), "app/prod");
    }
}
