//! Configuration module for the stackweave engine.
//!
//! This module handles:
//! - Parsing `stackweave.yaml`, `.env` and environment overrides
//! - Validation of project settings
//! - Program configuration values (`require` / `get`)
//! - Graph fingerprints for change detection

mod hash;
mod parser;
mod spec;
mod validator;
mod values;

pub use hash::GraphHasher;
pub use parser::{CONFIG_ENV_PREFIX, ConfigParser, find_config_file};
pub use spec::{
    DiffPolicy, ExecutionConfig, ProjectConfig, ProjectFile, ProviderConfig, ProviderKind,
    StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationResult};
pub use values::{REGION_KEY, StackConfig};
