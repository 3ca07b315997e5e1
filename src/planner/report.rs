//! Outcome of applying a plan.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use super::plan::ActionType;

/// Lifecycle of one node during apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Waiting for its dependencies.
    Pending,
    /// Provider work in progress.
    Running,
    /// Finished successfully, or nothing to do.
    Succeeded,
    /// The node's own operation failed.
    Failed,
    /// Never attempted.
    Skipped,
}

/// Why a node was never attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// A node it depends on failed; `root` names the failed node.
    DependencyFailed {
        /// Root-cause node.
        root: String,
    },
    /// The run was cancelled before the node started.
    Cancelled,
}

/// Per-node outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    /// Logical name.
    pub name: String,
    /// Type token.
    #[serde(rename = "type")]
    pub type_token: String,
    /// Planned action.
    pub action: ActionType,
    /// Terminal status.
    pub status: NodeStatus,
    /// Provider attempts made.
    pub attempts: u32,
    /// Error for failed nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Reason for skipped nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

/// Result of applying a whole plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyResult {
    /// One report per planned action, in plan order.
    pub nodes: Vec<NodeReport>,
    /// Stack exports that resolved.
    pub exports: BTreeMap<String, Value>,
    /// Whether cancellation was observed.
    pub cancelled: bool,
}

impl NodeReport {
    /// A pending report for a planned action.
    #[must_use]
    pub fn pending(name: &str, type_token: &str, action: ActionType) -> Self {
        Self {
            name: name.to_string(),
            type_token: type_token.to_string(),
            action,
            status: NodeStatus::Pending,
            attempts: 0,
            error: None,
            skip_reason: None,
        }
    }
}

impl ApplyResult {
    /// Returns true if every node succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.nodes.iter().all(|n| n.status == NodeStatus::Succeeded)
    }

    /// Number of nodes in `status`.
    #[must_use]
    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }

    /// Report for a logical name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Nodes whose own operation failed.
    #[must_use]
    pub fn root_causes(&self) -> Vec<&NodeReport> {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Failed)
            .collect()
    }

    /// Nodes skipped because `root` failed.
    #[must_use]
    pub fn skipped_because_of(&self, root: &str) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| {
                matches!(&n.skip_reason, Some(SkipReason::DependencyFailed { root: r }) if r == root)
            })
            .map(|n| n.name.as_str())
            .collect()
    }

    /// Process exit code: 0 success, 2 failures, 3 cancelled.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        if self.cancelled {
            3
        } else if self.is_success() {
            0
        } else {
            2
        }
    }

    /// Short summary such as `3 succeeded, 1 failed, 2 skipped`.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} succeeded, {} failed, {} skipped",
            self.count(NodeStatus::Succeeded),
            self.count(NodeStatus::Failed),
            self.count(NodeStatus::Skipped)
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependencyFailed { root } => write!(f, "dependency '{root}' failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl fmt::Display for ApplyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        for root in self.root_causes() {
            write!(
                f,
                "\n  {} failed: {}",
                root.name,
                root.error.as_deref().unwrap_or("unknown error")
            )?;
            let skipped = self.skipped_because_of(&root.name);
            if !skipped.is_empty() {
                write!(f, "\n    skipped as a consequence: {}", skipped.join(", "))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, status: NodeStatus, skip: Option<SkipReason>) -> NodeReport {
        NodeReport {
            status,
            skip_reason: skip,
            error: (status == NodeStatus::Failed).then(|| String::from("boom")),
            ..NodeReport::pending(name, "test:Thing", ActionType::Create)
        }
    }

    #[test]
    fn test_exit_codes() {
        let mut result = ApplyResult {
            nodes: vec![report("a", NodeStatus::Succeeded, None)],
            ..ApplyResult::default()
        };
        assert_eq!(result.exit_code(), 0);

        result.nodes.push(report("b", NodeStatus::Failed, None));
        assert_eq!(result.exit_code(), 2);

        result.cancelled = true;
        assert_eq!(result.exit_code(), 3);
    }

    #[test]
    fn test_root_cause_reporting() {
        let root = || Some(SkipReason::DependencyFailed { root: String::from("b") });
        let result = ApplyResult {
            nodes: vec![
                report("a", NodeStatus::Succeeded, None),
                report("b", NodeStatus::Failed, None),
                report("c", NodeStatus::Skipped, root()),
                report("d", NodeStatus::Skipped, root()),
            ],
            ..ApplyResult::default()
        };

        assert_eq!(result.root_causes().len(), 1);
        assert_eq!(result.skipped_because_of("b"), vec!["c", "d"]);
        let text = result.to_string();
        assert!(text.starts_with("1 succeeded, 1 failed, 2 skipped"));
        assert!(text.contains("skipped as a consequence: c, d"));
    }
}
