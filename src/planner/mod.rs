//! Planning and execution of deployments.
//!
//! [`DiffEngine`] compares declared resources against the last snapshot and
//! produces a [`DeploymentPlan`]. [`PlanExecutor`] walks that plan batch by
//! batch, retrying transient provider failures and recording each node's
//! outcome as it settles.

mod cancel;
mod diff;
mod executor;
mod plan;
mod report;
mod retry;

pub use cancel::CancelSignal;
pub use diff::DiffEngine;
pub use executor::{DEFAULT_PARALLELISM, PlanExecutor};
pub use plan::{ActionType, DeploymentPlan, FieldChange, PlannedAction};
pub use report::{ApplyResult, NodeReport, NodeStatus, SkipReason};
pub use retry::{Attempted, RetryPolicy};
