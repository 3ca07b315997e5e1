//! Project file validation.
//!
//! Checks names, backend settings, execution limits and provider selection
//! before any graph is built.

use crate::error::{ConfigError, Result, StackweaveError};
use tracing::debug;
use ::validator::Validate;

use super::spec::{ExecutionConfig, ProjectFile, ProviderConfig, ProviderKind, StateBackend, StateConfig};

/// Validator for project files.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all findings.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Validation errors.
    pub errors: Vec<ValidationError>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a project file.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate(&self, file: &ProjectFile) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(file, &mut result);
        Self::validate_state(&file.state, &mut result);
        Self::validate_execution(&file.execution, &mut result);
        Self::validate_provider(&file.provider, &mut result);
        Self::validate_values(file, &mut result);

        if let Some(first) = result.errors.first() {
            return Err(StackweaveError::Config(ConfigError::ValidationError {
                message: first.message.clone(),
                field: Some(first.field.clone()),
            }));
        }
        debug!(warnings = result.warnings.len(), "Project file validation passed");
        Ok(result)
    }

    fn validate_project(file: &ProjectFile, result: &mut ValidationResult) {
        for (field, value) in [
            ("project.name", &file.project.name),
            ("project.stack", &file.project.stack),
        ] {
            if value.is_empty() {
                result.error(field, format!("{field} cannot be empty"));
            } else if !is_valid_name(value) {
                result.error(
                    field,
                    format!("'{value}' is invalid. Must be lowercase alphanumeric with hyphens."),
                );
            }
        }

        if file.project.region.is_none() {
            result
                .warnings
                .push(String::from("project.region: not set, programs fall back to their default"));
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if state.path.as_ref().is_some_and(String::is_empty) {
                    result.error("state.path", "State file path cannot be empty");
                }
            }
        }
    }

    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if let Err(errors) = execution.validate() {
            for (field, errs) in errors.field_errors() {
                for err in errs {
                    result.error(
                        format!("execution.{field}"),
                        format!("execution.{field} is out of range ({})", err.code),
                    );
                }
            }
        }

        if execution.max_backoff_ms < execution.initial_backoff_ms {
            result.error(
                "execution.max_backoff_ms",
                "max_backoff_ms must not be smaller than initial_backoff_ms",
            );
        }
    }

    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        match (provider.kind, provider.endpoint.as_deref()) {
            (ProviderKind::Http, None | Some("")) => {
                result.error("provider.endpoint", "An endpoint is required for the http provider");
            }
            (ProviderKind::Http, Some(endpoint))
                if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") =>
            {
                result.error(
                    "provider.endpoint",
                    format!("Endpoint '{endpoint}' must start with http:// or https://"),
                );
            }
            (ProviderKind::Simulated, Some(_)) => {
                result
                    .warnings
                    .push(String::from("provider.endpoint: ignored by the simulated provider"));
            }
            _ => {}
        }
    }

    fn validate_values(file: &ProjectFile, result: &mut ValidationResult) {
        for (key, value) in &file.config {
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                result.error(format!("config.{key}"), format!("Invalid config key '{key}'"));
            }
            if value.is_empty() {
                result.warnings.push(format!("config.{key}: empty value"));
            }
        }
    }
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_lowercase()
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
        && !name.contains("--")
}
