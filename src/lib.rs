// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![warn(unused_imports)]              // Unused imports are reported
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![allow(clippy::module_name_repetitions)]

// Numeric safety
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # stackweave
//!
//! Declarative infrastructure deployment driven by a dependency graph.
//!
//! ## Overview
//!
//! A deployment program declares resources whose inputs may reference the
//! outputs of other resources. Those references form a DAG. stackweave:
//!
//! - Diffs the declared graph against the last recorded snapshot
//! - Applies the resulting plan in dependency order with bounded parallelism
//! - Retries transient provider failures and skips dependents of failed nodes
//! - Persists per-node results as they happen, under a stack lock
//!
//! ## Modules
//!
//! - [`output`]: Deferred output values and their combinators
//! - [`resource`]: Resource schemas, declarations and inputs
//! - [`graph`]: The dependency graph and its scheduler
//! - [`context`]: The API deployment programs declare resources through
//! - [`planner`]: Diff computation and plan execution
//! - [`provider`]: The provider plugin trait and built-in providers
//! - [`state`]: Snapshot storage backends (memory, local, S3)
//! - [`engine`]: Preview, up, destroy and refresh for one stack
//! - [`stacks`]: Built-in deployment programs
//! - [`config`]: Project file parsing and validation
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: my-app
//!   stack: dev
//!   region: us-west-2
//!   program: fargate
//!
//! config:
//!   appMessage: "Hello"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod graph;
pub mod output;
pub mod planner;
pub mod provider;
pub mod resource;
pub mod stacks;
pub mod state;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigParser, ConfigValidator, ProjectFile, StackConfig};
pub use context::{Deployment, DeploymentContext};
pub use engine::{DriftReport, Engine, RunOutcome};
pub use error::{Result, StackweaveError};
pub use graph::DependencyGraph;
pub use output::Output;
pub use planner::{ApplyResult, DeploymentPlan, DiffEngine, PlanExecutor};
pub use provider::{HttpProvider, Provider, SimulatedProvider};
pub use resource::{Input, Inputs, ResourceOptions, SchemaRegistry};
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, Snapshot, StateStore};
