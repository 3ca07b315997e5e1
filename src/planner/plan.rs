//! Deployment plan types.
//!
//! A plan holds one action per logical name plus the batches they run in.
//! Actions for declared resources come first, in declaration order, so the
//! action index of a declared resource equals its graph index. Deletes of
//! resources that are no longer declared follow.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use crate::resource::ReplaceOrder;

/// A complete deployment plan.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Project name.
    pub project: String,
    /// Stack name.
    pub stack: String,
    /// Fingerprint of the declared graph.
    pub fingerprint: String,
    /// One action per logical name.
    pub actions: Vec<PlannedAction>,
    /// Execution batches, as indices into `actions`.
    pub batches: Vec<Vec<usize>>,
    /// Logical names whose replaced instances still await deletion.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cleanup: Vec<String>,
}

/// A single planned action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedAction {
    /// Logical name.
    pub name: String,
    /// Type token.
    #[serde(rename = "type")]
    pub type_token: String,
    /// What will happen.
    pub action: ActionType,
    /// Why.
    pub reason: String,
    /// Fields whose declared value changed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<FieldChange>,
    /// Ordering of a replacement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace_order: Option<ReplaceOrder>,
    /// Provider id of the existing object, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Graph index for declared resources; `None` for removed ones.
    #[serde(skip)]
    pub node: Option<usize>,
    /// Logical names this action waits for.
    pub depends_on: Vec<String>,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// Create a new object.
    Create,
    /// Update the existing object in place.
    Update,
    /// Delete and recreate the object.
    Replace,
    /// Delete the object.
    Delete,
    /// Nothing to do; outputs come from state.
    #[serde(rename = "no-op")]
    NoOp,
    /// Look up a data source.
    Read,
}

/// One changed input field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    /// Input name.
    pub field: String,
    /// Previously declared value.
    pub old: Option<Value>,
    /// Newly declared value.
    pub new: Option<Value>,
    /// Whether this change forces a replacement.
    pub force_new: bool,
}

impl DeploymentPlan {
    /// Returns true if applying the plan would change anything, including
    /// deleting instances left over from earlier replacements.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actions.iter().any(|a| a.action.is_mutation()) || self.has_pending_cleanup()
    }

    /// Returns true if earlier replacements left instances to delete.
    #[must_use]
    pub fn has_pending_cleanup(&self) -> bool {
        !self.cleanup.is_empty()
    }

    /// Number of actions.
    #[must_use]
    pub const fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Number of actions of the given type.
    #[must_use]
    pub fn count(&self, action: ActionType) -> usize {
        self.actions.iter().filter(|a| a.action == action).count()
    }

    /// Finds the action for a logical name.
    #[must_use]
    pub fn action(&self, name: &str) -> Option<&PlannedAction> {
        self.actions.iter().find(|a| a.name == name)
    }

    /// Logical names in execution order.
    #[must_use]
    pub fn execution_order(&self) -> Vec<&str> {
        self.batches
            .iter()
            .flatten()
            .filter_map(|&i| self.actions.get(i))
            .map(|a| a.name.as_str())
            .collect()
    }

    /// `create=N update=N ...` summary of mutating actions.
    #[must_use]
    pub fn summary(&self) -> String {
        [
            ActionType::Create,
            ActionType::Update,
            ActionType::Replace,
            ActionType::Delete,
        ]
        .iter()
        .map(|a| format!("{a}={}", self.count(*a)))
        .collect::<Vec<_>>()
        .join(" ")
    }
}

impl PlannedAction {
    /// Creates an action without field changes.
    #[must_use]
    pub fn new(name: &str, type_token: &str, action: ActionType, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            type_token: type_token.to_string(),
            action,
            reason: reason.into(),
            changes: Vec::new(),
            replace_order: None,
            provider_id: None,
            node: None,
            depends_on: Vec::new(),
        }
    }

    /// Names of the changed fields.
    #[must_use]
    pub fn changed_fields(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.field.as_str()).collect()
    }
}

impl ActionType {
    /// Returns true for actions that call a provider to change something.
    #[must_use]
    pub const fn is_mutation(self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Replace | Self::Delete)
    }

    /// Symbol used in previews.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "+-",
            Self::Delete => "-",
            Self::NoOp => " ",
            Self::Read => ">",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
            Self::Read => "read",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.action.symbol(), self.name, self.type_token)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl fmt::Display for DeploymentPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan for {}/{} ({}):", self.project, self.stack, self.summary())?;
        for (n, batch) in self.batches.iter().enumerate() {
            writeln!(f, "  batch {n}:")?;
            for action in batch.iter().filter_map(|&i| self.actions.get(i)) {
                writeln!(f, "    {action}")?;
            }
        }
        if self.has_pending_cleanup() {
            writeln!(f, "  pending deletion of replaced instances: {}", self.cleanup.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> DeploymentPlan {
        DeploymentPlan {
            created_at: Utc::now(),
            project: String::from("demo"),
            stack: String::from("dev"),
            fingerprint: String::from("abc"),
            actions: vec![
                PlannedAction::new("vpc", "aws:ec2/getVpc", ActionType::Read, "data source"),
                PlannedAction::new("repo", "aws:ecr/Repository", ActionType::NoOp, ""),
                PlannedAction::new("old", "aws:ecs/Cluster", ActionType::Delete, "removed"),
            ],
            batches: vec![vec![0, 1], vec![2]],
            cleanup: Vec::new(),
        }
    }

    #[test]
    fn test_counts_and_order() {
        let plan = plan();
        assert!(plan.has_changes());
        assert_eq!(plan.count(ActionType::Delete), 1);
        assert_eq!(plan.execution_order(), vec!["vpc", "repo", "old"]);
        assert_eq!(plan.summary(), "create=0 update=0 replace=0 delete=1");
    }

    #[test]
    fn test_reads_and_noops_are_not_changes() {
        let mut plan = plan();
        plan.actions.pop();
        plan.batches.pop();
        assert!(!plan.has_changes());
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_pending_cleanup_counts_as_change() {
        let mut plan = plan();
        plan.actions.pop();
        plan.batches.pop();
        plan.cleanup.push(String::from("repo"));
        assert!(plan.has_changes());
        assert!(plan.to_string().contains("pending deletion of replaced instances: repo"));
    }

    #[test]
    fn test_action_display() {
        let action = PlannedAction::new("repo", "aws:ecr/Repository", ActionType::Replace, "name changed");
        assert_eq!(action.to_string(), "+- repo aws:ecr/Repository (name changed)");
    }
}
