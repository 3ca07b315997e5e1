//! Provider plugins.
//!
//! A provider performs the actual create, read, update and delete calls
//! against the target system. The engine only sees the [`Provider`] trait;
//! failures come back classified as transient, permanent or not-found.

mod http;
mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProviderError;
use crate::resource::PropertyMap;

pub use http::HttpProvider;
pub use simulated::{FailureRule, Operation, ProviderCall, SimulatedProvider};

/// Result type for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Identifies the resource an operation is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Type token, e.g. `aws:ecs/Service`.
    pub type_token: String,
    /// Logical name within the stack.
    pub name: String,
}

/// Outcome of a successful create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Created {
    /// Provider-assigned identifier.
    pub id: String,
    /// Realized outputs.
    pub outputs: PropertyMap,
}

/// Current state of an existing object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadResult {
    /// Inputs as the provider currently sees them.
    pub inputs: PropertyMap,
    /// Current outputs.
    pub outputs: PropertyMap,
}

/// Operations a provider plugin must support.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates an object from resolved inputs.
    async fn create(&self, key: &ResourceKey, inputs: &PropertyMap) -> ProviderResult<Created>;

    /// Reads an existing object by provider id.
    async fn read(&self, key: &ResourceKey, id: &str) -> ProviderResult<ReadResult>;

    /// Updates an object in place, returning its new outputs.
    async fn update(
        &self,
        key: &ResourceKey,
        id: &str,
        old_inputs: &PropertyMap,
        new_inputs: &PropertyMap,
    ) -> ProviderResult<PropertyMap>;

    /// Deletes an object.
    async fn delete(&self, key: &ResourceKey, id: &str) -> ProviderResult<()>;

    /// Evaluates a data source lookup.
    async fn invoke(&self, key: &ResourceKey, args: &PropertyMap) -> ProviderResult<PropertyMap>;

    /// Human readable provider name.
    fn name(&self) -> &'static str;
}

impl ResourceKey {
    /// Creates a new key.
    #[must_use]
    pub fn new(type_token: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_token: type_token.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.type_token)
    }
}
