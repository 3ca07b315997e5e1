//! Dependency graph and scheduling.
//!
//! This module provides:
//! - The resource dependency graph with cycle detection
//! - Batch scheduling for creation and deletion orders

mod dag;
mod scheduler;

pub use dag::DependencyGraph;
pub use scheduler::{Schedule, Scheduler};
