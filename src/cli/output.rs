//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::engine::{DriftReport, RunOutcome};
use crate::planner::{ActionType, ApplyResult, DeploymentPlan, NodeStatus};
use crate::state::{LockInfo, Snapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    type_token: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Per-node result row.
#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// Recorded resource row.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    type_token: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "ID")]
    id: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    fn json<T: Serialize>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_default()
    }

    /// Formats a deployment plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &DeploymentPlan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &DeploymentPlan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes required - {}/{} is up to date.\n",
                "✓".green(),
                plan.project,
                plan.stack
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nPlan for {}/{}", plan.project, plan.stack);
        let _ = writeln!(output, "   Fingerprint: {}\n", short(&plan.fingerprint));

        let rows: Vec<PlanActionRow> = plan
            .batches
            .iter()
            .flatten()
            .filter_map(|&i| plan.actions.get(i))
            .filter(|a| detailed || a.action.is_mutation())
            .enumerate()
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action_type(a.action),
                resource: a.name.clone(),
                type_token: a.type_token.clone(),
                reason: Self::truncate(&a.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for action in plan.actions.iter().filter(|a| !a.changes.is_empty()) {
                let _ = writeln!(output, "\n   {} {}:", action.action.symbol(), action.name);
                for change in &action.changes {
                    let marker = if change.force_new { " (forces replacement)" } else { "" };
                    let _ = writeln!(
                        output,
                        "       {}: {} -> {}{marker}",
                        change.field,
                        change.old.as_ref().map_or_else(|| String::from("<unset>"), ToString::to_string),
                        change.new.as_ref().map_or_else(|| String::from("<unset>"), ToString::to_string),
                    );
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete\n",
            plan.count(ActionType::Create).to_string().green(),
            plan.count(ActionType::Update).to_string().yellow(),
            plan.count(ActionType::Replace).to_string().magenta(),
            plan.count(ActionType::Delete).to_string().red()
        );
        if plan.has_pending_cleanup() {
            let _ = writeln!(
                output,
                "{} replaced instance(s) pending deletion: {}",
                plan.cleanup.len().to_string().red(),
                plan.cleanup.join(", ")
            );
        }
        output
    }

    /// Formats the outcome of `up` or `destroy`.
    #[must_use]
    pub fn format_outcome(&self, outcome: &RunOutcome) -> String {
        match self.format {
            OutputFormat::Json => Self::json(outcome),
            OutputFormat::Text => Self::format_result_text(&outcome.result),
        }
    }

    fn format_result_text(result: &ApplyResult) -> String {
        let mut output = String::new();

        let rows: Vec<NodeRow> = result
            .nodes
            .iter()
            .filter(|n| n.action != ActionType::NoOp || n.status != NodeStatus::Succeeded)
            .map(|n| NodeRow {
                resource: n.name.clone(),
                action: n.action.to_string(),
                status: Self::format_status(n.status),
                attempts: n.attempts,
                detail: n
                    .error
                    .clone()
                    .or_else(|| n.skip_reason.as_ref().map(ToString::to_string))
                    .map(|d| Self::truncate(&d, 60))
                    .unwrap_or_default(),
            })
            .collect();
        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let headline = if result.is_success() {
            format!("{} {}", "✓".green(), result.summary())
        } else if result.cancelled {
            format!("{} Cancelled: {}", "⚠".yellow(), result.summary())
        } else {
            format!("{} {}", "✗".red(), result.summary())
        };
        let _ = writeln!(output, "\n{headline}");

        for root in result.root_causes() {
            let _ = writeln!(
                output,
                "\n   {} failed: {}",
                root.name.red(),
                root.error.as_deref().unwrap_or("unknown error")
            );
            let skipped = result.skipped_because_of(&root.name);
            if !skipped.is_empty() {
                let _ = writeln!(output, "   skipped as a consequence: {}", skipped.join(", "));
            }
        }

        if !result.exports.is_empty() {
            output.push_str("\nOutputs:\n");
            for (name, value) in &result.exports {
                let shown = value.as_str().map_or_else(|| value.to_string(), ToString::to_string);
                let _ = writeln!(output, "   {name}: {shown}");
            }
        }
        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text if report.is_converged() => {
                format!("{} {report}\n", "✓".green())
            }
            OutputFormat::Text => format!("{} {report}", "⚠".yellow()),
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, resources: usize, warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({
                "valid": result.errors.is_empty(),
                "resources": resources,
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = format!(
                    "{} Configuration is valid ({resources} resources declared)\n",
                    "✓".green()
                );
                if warnings {
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   {} {warning}", "⚠".yellow());
                    }
                } else if !result.warnings.is_empty() {
                    let _ = writeln!(
                        output,
                        "   {} warning(s), use --warnings to show them",
                        result.warnings.len()
                    );
                }
                output
            }
        }
    }

    /// Formats a snapshot.
    #[must_use]
    pub fn format_state(&self, snapshot: &Snapshot) -> String {
        match self.format {
            OutputFormat::Json => Self::json(snapshot),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nState: {}/{}\n", snapshot.project, snapshot.stack);
                let _ = writeln!(output, "   Version: {}", snapshot.version);
                let _ = writeln!(output, "   Last updated: {}", snapshot.last_updated);
                let _ = writeln!(output, "   Resources: {}\n", snapshot.records.len());

                if !snapshot.records.is_empty() {
                    let rows: Vec<RecordRow> = snapshot
                        .records
                        .values()
                        .map(|r| RecordRow {
                            resource: r.name.clone(),
                            type_token: r.type_token.clone(),
                            status: if r.is_ready() {
                                r.status.to_string().green().to_string()
                            } else {
                                r.status.to_string().red().to_string()
                            },
                            id: r
                                .provider_id
                                .as_deref()
                                .map_or_else(|| String::from("-"), |id| Self::truncate(id, 32)),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }
                output
            }
        }
    }

    /// Formats the most recent history entries.
    #[must_use]
    pub fn format_history(&self, snapshot: &Snapshot, limit: usize) -> String {
        let recent: Vec<_> = snapshot.history.iter().rev().take(limit).collect();
        match self.format {
            OutputFormat::Json => Self::json(&recent),
            OutputFormat::Text if recent.is_empty() => String::from("No runs recorded.\n"),
            OutputFormat::Text => {
                let mut output = String::new();
                for entry in recent {
                    let status = if entry.success { "✓".green() } else { "✗".red() };
                    let _ = writeln!(
                        output,
                        "{status} {} {} [{}] {}",
                        entry.timestamp.format("%Y-%m-%d %H:%M"),
                        entry.operation,
                        short(&entry.fingerprint),
                        entry.resources.join(", ")
                    );
                    if let Some(error) = &entry.error {
                        let _ = writeln!(output, "     {error}");
                    }
                }
                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: Option<&LockInfo>) -> String {
        match (self.format, lock) {
            (OutputFormat::Json, lock) => Self::json(&lock),
            (OutputFormat::Text, None) => String::from("State is not locked.\n"),
            (OutputFormat::Text, Some(lock)) => format!(
                "Locked by {} for '{}' (lock {}), expires in {}s\n",
                lock.holder,
                lock.operation,
                lock.lock_id,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats an action type with color.
    fn format_action_type(action: ActionType) -> String {
        let label = format!("{}{action}", action.symbol().trim());
        match action {
            ActionType::Create => label.green().to_string(),
            ActionType::Update => label.yellow().to_string(),
            ActionType::Replace => label.magenta().to_string(),
            ActionType::Delete => label.red().to_string(),
            ActionType::Read => label.cyan().to_string(),
            ActionType::NoOp => label.dimmed().to_string(),
        }
    }

    fn format_status(status: NodeStatus) -> String {
        match status {
            NodeStatus::Succeeded => status.to_string().green().to_string(),
            NodeStatus::Failed => status.to_string().red().to_string(),
            NodeStatus::Skipped => status.to_string().yellow().to_string(),
            NodeStatus::Pending | NodeStatus::Running => status.to_string().dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &"✓".green(), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &"✗".red(), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &"⚠".yellow(), message)
    }

    fn message(&self, status: &str, symbol: &colored::ColoredString, message: &str) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({ "status": status, "message": message })),
            OutputFormat::Text => format!("{symbol} {message}"),
        }
    }
}

fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{NodeReport, PlannedAction, SkipReason};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn plan(actions: Vec<PlannedAction>) -> DeploymentPlan {
        let batches = vec![(0..actions.len()).collect()];
        DeploymentPlan {
            created_at: Utc::now(),
            project: String::from("demo"),
            stack: String::from("dev"),
            fingerprint: String::from("0123456789abcdef"),
            actions,
            batches,
            cleanup: Vec::new(),
        }
    }

    #[test]
    fn test_plan_text_lists_pending_cleanup() {
        colored::control::set_override(false);
        let mut plan = plan(vec![PlannedAction::new("repo", "aws:ecr/Repository", ActionType::NoOp, "")]);
        plan.cleanup.push(String::from("repo"));
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan, false);
        assert!(!text.contains("No changes required"));
        assert!(text.contains("1 replaced instance(s) pending deletion: repo"));
    }

    #[test]
    fn test_plan_text_counts() {
        colored::control::set_override(false);
        let plan = plan(vec![
            PlannedAction::new("repo", "aws:ecr/Repository", ActionType::Create, "not in state"),
            PlannedAction::new("cluster", "aws:ecs/Cluster", ActionType::NoOp, ""),
        ]);
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan, false);
        assert!(text.contains("Fingerprint: 01234567"));
        assert!(text.contains("repo"));
        assert!(!text.contains("cluster"));
        assert!(text.contains("1 to create, 0 to update, 0 to replace, 0 to delete"));
    }

    #[test]
    fn test_empty_plan_json() {
        let plan = plan(vec![PlannedAction::new("cluster", "aws:ecs/Cluster", ActionType::NoOp, "")]);
        let json = OutputFormatter::new(OutputFormat::Json).format_plan(&plan, false);
        let value: serde_json::Value = serde_json::from_str(&json).expect("json");
        assert_eq!(value["actions"][0]["action"], "no-op");
        assert_eq!(value["stack"], "dev");
    }

    #[test]
    fn test_result_names_root_cause() {
        colored::control::set_override(false);
        let mut failed = NodeReport::pending("image", "docker:Image", ActionType::Create);
        failed.status = NodeStatus::Failed;
        failed.error = Some(String::from("build failed"));
        let mut skipped = NodeReport::pending("service", "aws:ecs/Service", ActionType::Create);
        skipped.status = NodeStatus::Skipped;
        skipped.skip_reason = Some(SkipReason::DependencyFailed { root: String::from("image") });

        let result = ApplyResult {
            nodes: vec![failed, skipped],
            exports: BTreeMap::new(),
            cancelled: false,
        };
        let text = OutputFormatter::format_result_text(&result);
        assert!(text.contains("image failed: build failed"));
        assert!(text.contains("skipped as a consequence: service"));
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("abcdefghijkl", 8), "abcde...");
        assert_eq!(short("abc"), "abc");
    }
}
