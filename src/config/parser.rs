//! Project file parser.
//!
//! This module loads `stackweave.yaml`, the optional `.env` file next to it,
//! and applies environment variable overrides.

use crate::error::{ConfigError, Result, StackweaveError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::ProjectFile;

/// Prefix of environment variables carrying program configuration values.
pub const CONFIG_ENV_PREFIX: &str = "STACKWEAVE_CONFIG_";

/// Default project file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["stackweave.yaml", "stackweave.yml"];

/// Parser for project files.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory `.env` is loaded from.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a project file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ProjectFile> {
        let path = path.as_ref();
        info!("Loading project file from: {}", path.display());

        if !path.exists() {
            return Err(StackweaveError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackweaveError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a project file from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<ProjectFile> {
        debug!("Parsing YAML project file");

        let file: ProjectFile = serde_yaml::from_str(content).map_err(|e| {
            StackweaveError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        debug!("Parsed project file for {}", file.qualified_stack());
        Ok(file)
    }

    /// Loads `.env`, then the project file, then applies environment overrides.
    ///
    /// Overrides use `STACKWEAVE_<SECTION>_<KEY>` (e.g. `STACKWEAVE_STACK`),
    /// and program values `STACKWEAVE_CONFIG_<KEY>`.
    ///
    /// # Errors
    ///
    /// Returns an error if `.env` or the file cannot be loaded.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<ProjectFile> {
        self.load_dotenv()?;
        let mut file = self.load_file(path)?;
        Self::apply_env_overrides(&mut file, std::env::vars());
        Ok(file)
    }

    /// Applies overrides from `vars` to the project file.
    pub fn apply_env_overrides(
        file: &mut ProjectFile,
        vars: impl IntoIterator<Item = (String, String)>,
    ) {
        for (key, value) in vars {
            match key.as_str() {
                "STACKWEAVE_PROJECT_NAME" => {
                    debug!("Overriding project.name from environment");
                    file.project.name = value;
                }
                "STACKWEAVE_STACK" => {
                    debug!("Overriding project.stack from environment");
                    file.project.stack = value;
                }
                "STACKWEAVE_REGION" => {
                    debug!("Overriding project.region from environment");
                    file.project.region = Some(value);
                }
                "STACKWEAVE_STATE_BUCKET" => {
                    debug!("Overriding state.bucket from environment");
                    file.state.bucket = Some(value);
                }
                "STACKWEAVE_STATE_PREFIX" => {
                    debug!("Overriding state.prefix from environment");
                    file.state.prefix = Some(value);
                }
                "STACKWEAVE_PROVIDER_ENDPOINT" => {
                    debug!("Overriding provider.endpoint from environment");
                    file.provider.endpoint = Some(value);
                }
                _ => {
                    if let Some(name) = key.strip_prefix(CONFIG_ENV_PREFIX) {
                        let name = name.to_lowercase();
                        debug!(key = %name, "Overriding config value from environment");
                        file.config.insert(name, value);
                    }
                }
            }
        }
    }

    /// Loads the `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StackweaveError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Finds the project file in `start_dir` or one of its parents.
///
/// # Errors
///
/// Returns an error if no project file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let candidate = current.join(filename);
            if candidate.exists() {
                info!("Found project file: {}", candidate.display());
                return Ok(candidate);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StackweaveError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiffPolicy, ProviderKind, StateBackend};

    #[test]
    fn test_parse_minimal_file() {
        let yaml = r"
project:
  name: fargate-demo
";
        let file = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
        assert_eq!(file.project.name, "fargate-demo");
        assert_eq!(file.project.stack, "dev");
        assert_eq!(file.state.backend, StateBackend::Local);
        assert_eq!(file.provider.kind, ProviderKind::Simulated);
        assert_eq!(file.execution.parallelism, 4);
    }

    #[test]
    fn test_parse_full_file() {
        let yaml = r#"
project:
  name: fargate-demo
  stack: prod
  region: us-west-2

config:
  message: "Hello from the fleet"

state:
  backend: s3
  bucket: stackweave-state
  prefix: fargate-demo/prod

execution:
  parallelism: 8
  max_attempts: 3
  diff_policy: value

provider:
  kind: http
  endpoint: http://127.0.0.1:7700
"#;
        let file = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
        assert_eq!(file.qualified_stack(), "fargate-demo/prod");
        assert_eq!(file.config["message"], "Hello from the fleet");
        assert_eq!(file.state.backend, StateBackend::S3);
        assert_eq!(file.execution.max_attempts, 3);
        assert_eq!(file.execution.initial_backoff_ms, 500);
        assert_eq!(file.execution.diff_policy, DiffPolicy::Value);
        assert_eq!(file.provider.endpoint.as_deref(), Some("http://127.0.0.1:7700"));
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let err = ConfigParser::new()
            .parse_yaml("project: [", None)
            .expect_err("invalid");
        assert!(matches!(err, StackweaveError::Config(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut file = ProjectFile::new("app", "dev");
        ConfigParser::apply_env_overrides(
            &mut file,
            vec![
                (String::from("STACKWEAVE_STACK"), String::from("prod")),
                (String::from("STACKWEAVE_REGION"), String::from("eu-west-1")),
                (String::from("STACKWEAVE_CONFIG_MESSAGE"), String::from("hi")),
                (String::from("UNRELATED"), String::from("x")),
            ],
        );
        assert_eq!(file.project.stack, "prod");
        assert_eq!(file.project.region.as_deref(), Some("eu-west-1"));
        assert_eq!(file.config.get("message").map(String::as_str), Some("hi"));
        assert_eq!(file.config.len(), 1);
    }

    #[test]
    fn test_find_config_file_in_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("stackweave.yaml"), "project:\n  name: x\n").expect("write");
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, dir.path().join("stackweave.yaml"));
    }
}
