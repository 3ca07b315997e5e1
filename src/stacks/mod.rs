//! Built-in deployment programs.
//!
//! A program declares resources against a [`DeploymentContext`]; the
//! project file picks one by name.

mod fargate;

use crate::context::{Deployment, DeploymentContext};
use crate::error::{ConfigError, Result};

pub use fargate::{APP_MESSAGE_KEY, DEFAULT_REGION};

/// Names of the programs this binary ships with.
pub const PROGRAMS: &[&str] = &[fargate::NAME];

/// Runs the named program and validates what it declared.
///
/// # Errors
///
/// Returns an error for an unknown program, a missing required config
/// value, or an invalid declaration.
pub fn run(program: &str, mut ctx: DeploymentContext) -> Result<Deployment> {
    match program {
        fargate::NAME => fargate::declare(&mut ctx)?,
        other => {
            return Err(ConfigError::validation(
                format!("unknown program '{other}', expected one of: {}", PROGRAMS.join(", ")),
                "project.program",
            )
            .into());
        }
    }
    ctx.finish()
}
