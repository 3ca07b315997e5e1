//! Program configuration values.

use std::collections::BTreeMap;

use crate::error::{ConfigError, Result};

use super::spec::ProjectFile;

/// Key under which the project region is exposed to programs.
pub const REGION_KEY: &str = "region";

/// Named string values a program reads while declaring resources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackConfig {
    values: BTreeMap<String, String>,
}

impl StackConfig {
    /// Creates a config from explicit values.
    #[must_use]
    pub fn new<K: Into<String>, V: Into<String>>(values: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Values from a project file; the project region is exposed as `region`
    /// unless the file sets that key itself.
    #[must_use]
    pub fn from_file(file: &ProjectFile) -> Self {
        let mut values = file.config.clone();
        if let Some(region) = &file.project.region {
            values
                .entry(REGION_KEY.to_string())
                .or_insert_with(|| region.clone());
        }
        Self { values }
    }

    /// A value that must be supplied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingValue`] if the key is unset.
    pub fn require(&self, key: &str) -> Result<String> {
        self.get(key).ok_or_else(|| {
            ConfigError::MissingValue {
                key: key.to_string(),
            }
            .into()
        })
    }

    /// An optional value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    /// An optional value with a fallback.
    #[must_use]
    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Every value, sorted by key.
    #[must_use]
    pub const fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }
}
