//! Error types for the stackweave deployment engine.
//!
//! This module provides the error hierarchy for every stage of a deployment
//! pass: configuration, graph construction, planning, provider calls, and
//! state management.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the stackweave deployment engine.
#[derive(Debug, Error)]
pub enum StackweaveError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Dependency graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider errors that escaped a node boundary.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An engine invariant was violated. This is a bug, never a user error.
    #[error("Internal consistency violation: {0}")]
    InternalConsistency(String),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The project file was not found.
    #[error("Project file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The project file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// A required program configuration value was not supplied.
    #[error("Missing required configuration value: {key}")]
    MissingValue {
        /// Name of the missing value.
        key: String,
    },

    /// An input name that the resource type does not declare.
    #[error("Resource '{resource}' ({type_token}) has no input named '{field}'")]
    UnknownInput {
        /// Logical name of the resource.
        resource: String,
        /// Type token of the resource.
        type_token: String,
        /// The rejected input name.
        field: String,
    },

    /// A required input was not supplied.
    #[error("Resource '{resource}' ({type_token}) is missing required input '{field}'")]
    MissingInput {
        /// Logical name of the resource.
        resource: String,
        /// Type token of the resource.
        type_token: String,
        /// The missing input name.
        field: String,
    },

    /// The resource type is not present in the catalog.
    #[error("Unknown resource type: {type_token}")]
    UnknownResourceType {
        /// The unknown type token.
        type_token: String,
    },
}

/// Dependency graph errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The graph contains a dependency cycle.
    #[error("Cyclic dependency between resources: {}", cycle.join(" -> "))]
    CyclicDependency {
        /// Logical names participating in the cycle, in declaration order.
        cycle: Vec<String>,
    },

    /// A logical name was declared twice.
    #[error("Duplicate resource name: {name}")]
    DuplicateResource {
        /// The duplicated logical name.
        name: String,
    },

    /// A resource refers to a resource that was never declared.
    #[error("Resource '{resource}' references undeclared resource '{target}'")]
    UnknownReference {
        /// The referencing resource.
        resource: String,
        /// The missing target.
        target: String,
    },

    /// An output field that the resource type does not produce.
    #[error("Resource '{resource}' has no output named '{field}'")]
    UnknownOutput {
        /// The producing resource.
        resource: String,
        /// The requested output field.
        field: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A protected resource would be deleted or replaced.
    #[error("Resource '{name}' is protected and cannot be {action}")]
    Protected {
        /// Logical name of the resource.
        name: String,
        /// The refused action.
        action: String,
    },

    /// The plan refers to a node the graph does not contain.
    #[error("Plan entry '{name}' has no matching resource in the graph")]
    MissingNode {
        /// Logical name of the node.
        name: String,
    },
}

/// Classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Retryable (throttling, network, timeouts).
    Transient,
    /// Not retryable; the node fails.
    Permanent,
    /// The target object does not exist.
    NotFound,
}

/// Error returned by a provider operation.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct ProviderError {
    /// Failure classification.
    pub kind: ProviderErrorKind,
    /// Human readable message.
    pub message: String,
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State storage backend failed.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: u32,
        /// Found state version.
        found: u32,
    },
}

/// Result type alias for stackweave operations.
pub type Result<T> = std::result::Result<T, StackweaveError>;

impl StackweaveError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Creates an internal consistency violation.
    #[must_use]
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::InternalConsistency(message.into())
    }

    /// Returns true for errors that abort a run before any side effect.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Graph(_) | Self::Plan(_))
    }

    /// Process exit code for an error that aborted the run.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        1
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl ProviderError {
    /// Creates a transient (retryable) error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::NotFound,
            message: message.into(),
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::Transient)
    }

    /// Returns true if the target object does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::NotFound)
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}
