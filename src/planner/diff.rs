//! Diff engine for comparing declared resources against realized state.
//!
//! Diffing is structural over declared-input templates: literals compare by
//! value and output references compare by their logical `resource.field`
//! form. Whether a change to an upstream value alone dirties its consumers
//! is decided by [`DiffPolicy`]. A replaced upstream always dirties its
//! consumers, since their resolved inputs will name the new instance.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::config::{DiffPolicy, GraphHasher};
use crate::context::Deployment;
use crate::error::{PlanError, Result};
use crate::graph::{DependencyGraph, Scheduler};
use crate::resource::{ReplaceOrder, ResourceNode, ResourceSchema};
use crate::state::{NodeRecord, Snapshot};

use super::plan::{ActionType, DeploymentPlan, FieldChange, PlannedAction};

/// Engine for computing plans.
#[derive(Debug, Default)]
pub struct DiffEngine {
    policy: DiffPolicy,
    hasher: GraphHasher,
}

impl DiffEngine {
    /// Creates a diff engine with the given downstream policy.
    #[must_use]
    pub const fn new(policy: DiffPolicy) -> Self {
        Self {
            policy,
            hasher: GraphHasher::new(),
        }
    }

    /// The policy in effect.
    #[must_use]
    pub const fn policy(&self) -> DiffPolicy {
        self.policy
    }

    /// Plans a deployment against the prior snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if a protected resource would be replaced or deleted,
    /// or if recorded dependencies of removed resources form a cycle.
    pub fn plan(&self, deployment: &Deployment, snapshot: Option<&Snapshot>) -> Result<DeploymentPlan> {
        let graph = &deployment.graph;
        let schedule = Scheduler::order(graph)?;

        let mut actions = Vec::with_capacity(graph.len());
        for (index, node) in graph.nodes().iter().enumerate() {
            let record = snapshot.and_then(|s| s.record(&node.name));
            let mut action = Self::diff_node(node, record);
            action.node = Some(index);
            action.depends_on = dependency_names(graph, index);

            if action.action == ActionType::Replace {
                check_replaceable(node, record)?;
            }
            debug!(resource = %node.name, action = %action.action, reason = %action.reason, "Planned");
            actions.push(action);
        }

        propagate_replacements(graph, schedule.iter(), &mut actions, snapshot)?;
        if self.policy == DiffPolicy::Value {
            propagate_value_changes(graph, schedule.iter(), &mut actions);
        }

        let mut batches = schedule.batches;
        let cleanup = snapshot
            .map(|s| {
                s.records
                    .values()
                    .filter(|r| !r.retired_ids.is_empty())
                    .map(|r| r.name.clone())
                    .collect()
            })
            .unwrap_or_default();

        if let Some(snapshot) = snapshot {
            let removed: Vec<&NodeRecord> = snapshot
                .records
                .values()
                .filter(|r| graph.index_of(&r.name).is_none())
                .collect();
            let (deletes, delete_batches) = delete_actions(&removed, "no longer declared")?;
            let offset = actions.len();
            actions.extend(deletes);
            batches.extend(
                delete_batches
                    .into_iter()
                    .map(|batch| batch.into_iter().map(|i| i + offset).collect()),
            );
        }

        Ok(DeploymentPlan {
            created_at: Utc::now(),
            project: deployment.project.clone(),
            stack: deployment.stack.clone(),
            fingerprint: self.hasher.hash_graph(graph),
            actions,
            batches,
            cleanup,
        })
    }

    /// Plans the deletion of every recorded resource, dependents first.
    ///
    /// # Errors
    ///
    /// Returns an error if a recorded resource is protected.
    pub fn plan_destroy(&self, snapshot: &Snapshot) -> Result<DeploymentPlan> {
        let records: Vec<&NodeRecord> = snapshot.records.values().collect();
        let (actions, batches) = delete_actions(&records, "stack destroyed")?;

        Ok(DeploymentPlan {
            created_at: Utc::now(),
            project: snapshot.project.clone(),
            stack: snapshot.stack.clone(),
            fingerprint: self.hasher.hash_graph(&DependencyGraph::new()),
            actions,
            batches,
            cleanup: Vec::new(),
        })
    }

    /// Decides the action for one declared resource.
    fn diff_node(node: &ResourceNode, record: Option<&NodeRecord>) -> PlannedAction {
        let type_token = node.type_token();

        if node.schema.is_data_source() {
            return PlannedAction::new(&node.name, type_token, ActionType::Read, "data source");
        }

        let Some(record) = record else {
            return PlannedAction::new(&node.name, type_token, ActionType::Create, "not in state");
        };

        if record.type_token != type_token {
            let mut action = PlannedAction::new(
                &node.name,
                type_token,
                ActionType::Replace,
                format!("type changed from {}", record.type_token),
            );
            // Two types cannot share a name, so the old one goes first.
            action.replace_order = Some(ReplaceOrder::DeleteBeforeCreate);
            action.provider_id.clone_from(&record.provider_id);
            return action;
        }

        let Some(provider_id) = record.provider_id.clone() else {
            return PlannedAction::new(
                &node.name,
                type_token,
                ActionType::Create,
                "previous create did not complete",
            );
        };

        let changes = field_changes(&node.schema, &record.declared_inputs, &node.declared_inputs());
        let forced: Vec<&str> = changes
            .iter()
            .filter(|c| c.force_new)
            .map(|c| c.field.as_str())
            .collect();

        let (action, reason) = if !forced.is_empty() {
            (ActionType::Replace, format!("{} changed", forced.join(", ")))
        } else if !changes.is_empty() {
            let fields: Vec<&str> = changes.iter().map(|c| c.field.as_str()).collect();
            (ActionType::Update, format!("{} changed", fields.join(", ")))
        } else if !record.is_ready() {
            (ActionType::Update, String::from("previous operation failed"))
        } else {
            (ActionType::NoOp, String::new())
        };

        let mut planned = PlannedAction::new(&node.name, type_token, action, reason);
        if action == ActionType::Replace {
            planned.replace_order = Some(node.replace_order());
        }
        planned.changes = changes;
        planned.provider_id = Some(provider_id);
        planned
    }
}

/// Compares two declared-input maps field by field.
fn field_changes(
    schema: &ResourceSchema,
    old: &BTreeMap<String, Value>,
    new: &BTreeMap<String, Value>,
) -> Vec<FieldChange> {
    let fields: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    fields
        .into_iter()
        .filter_map(|field| {
            let (before, after) = (old.get(field), new.get(field));
            (before != after).then(|| FieldChange {
                field: field.clone(),
                old: before.cloned(),
                new: after.cloned(),
                force_new: schema.is_force_new(field),
            })
        })
        .collect()
}

fn dependency_names(graph: &DependencyGraph, index: usize) -> Vec<String> {
    graph
        .dependencies(index)
        .into_iter()
        .map(|d| graph.node(d).name.clone())
        .collect()
}

fn check_replaceable(node: &ResourceNode, record: Option<&NodeRecord>) -> Result<()> {
    if node.options.protect || record.is_some_and(|r| r.protect) {
        return Err(PlanError::Protected {
            name: node.name.clone(),
            action: String::from("replaced"),
        }
        .into());
    }
    Ok(())
}

/// Dirties consumers of replaced nodes, in execution order so replacements
/// travel through whole chains.
///
/// A consumer is replaced itself when a force-new input references a replaced
/// node, and updated otherwise.
fn propagate_replacements(
    graph: &DependencyGraph,
    order: impl Iterator<Item = usize>,
    actions: &mut [PlannedAction],
    snapshot: Option<&Snapshot>,
) -> Result<()> {
    for index in order {
        if !matches!(actions[index].action, ActionType::NoOp | ActionType::Update) {
            continue;
        }
        let node = graph.node(index);
        let replaced: BTreeSet<String> = node
            .referenced_resources()
            .into_iter()
            .filter(|r| {
                graph
                    .index_of(r)
                    .is_some_and(|d| actions[d].action == ActionType::Replace)
            })
            .collect();
        let Some(upstream) = replaced.iter().next() else {
            continue;
        };

        let forced: Vec<&str> = node
            .inputs
            .iter()
            .filter(|(field, input)| {
                node.schema.is_force_new(field)
                    && input.refs().iter().any(|r| replaced.contains(&r.resource))
            })
            .map(|(field, _)| field.as_str())
            .collect();

        let action = &mut actions[index];
        if forced.is_empty() {
            if action.action == ActionType::NoOp {
                action.action = ActionType::Update;
                action.reason = format!("upstream '{upstream}' replaced");
            }
        } else {
            check_replaceable(node, snapshot.and_then(|s| s.record(&node.name)))?;
            action.action = ActionType::Replace;
            action.reason = format!("{} references replaced '{upstream}'", forced.join(", "));
            action.replace_order = Some(node.replace_order());
        }
    }
    Ok(())
}

/// Marks no-op consumers of changed nodes as updates, in execution order so
/// the change travels through whole chains.
fn propagate_value_changes(
    graph: &DependencyGraph,
    order: impl Iterator<Item = usize>,
    actions: &mut [PlannedAction],
) {
    for index in order {
        if actions[index].action != ActionType::NoOp {
            continue;
        }
        let changed_upstream = graph.node(index).referenced_resources().into_iter().find(|r| {
            graph.index_of(r).is_some_and(|d| {
                matches!(
                    actions[d].action,
                    ActionType::Create | ActionType::Update | ActionType::Replace
                )
            })
        });
        if let Some(upstream) = changed_upstream {
            actions[index].action = ActionType::Update;
            actions[index].reason = format!("upstream '{upstream}' changed");
        }
    }
}

/// Builds delete actions for recorded resources, dependents first.
fn delete_actions(records: &[&NodeRecord], reason: &str) -> Result<(Vec<PlannedAction>, Vec<Vec<usize>>)> {
    if let Some(protected) = records.iter().find(|r| r.protect) {
        return Err(PlanError::Protected {
            name: protected.name.clone(),
            action: String::from("deleted"),
        }
        .into());
    }

    let names: Vec<String> = records.iter().map(|r| r.name.clone()).collect();
    // A record must wait for every record that depends on it.
    let schedule = Scheduler::layer(&names, |i| {
        records
            .iter()
            .enumerate()
            .filter(|(_, other)| other.dependencies.contains(&names[i]))
            .map(|(j, _)| j)
            .collect()
    })?;

    let actions = records
        .iter()
        .map(|record| {
            let mut action =
                PlannedAction::new(&record.name, &record.type_token, ActionType::Delete, reason);
            action.provider_id.clone_from(&record.provider_id);
            action.depends_on = records
                .iter()
                .filter(|other| other.dependencies.contains(&record.name))
                .map(|other| other.name.clone())
                .collect();
            action
        })
        .collect();

    Ok((actions, schedule.batches))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeploymentContext;
    use crate::config::StackConfig;
    use crate::error::StackweaveError;
    use crate::resource::{FieldSpec, Inputs, ResourceOptions};
    use crate::state::{RecordChange, RecordStatus};
    use crate::testing::{chain_deployment, chain_registry};
    use serde_json::json;

    /// Snapshot as it would look after applying `deployment`.
    fn applied(deployment: &Deployment) -> Snapshot {
        let mut snapshot = Snapshot::new(&deployment.project, &deployment.stack);
        for (index, node) in deployment.graph.nodes().iter().enumerate() {
            let mut record = NodeRecord::new(&node.name, node.type_token());
            record.provider_id = Some(format!("id-{index}"));
            record.declared_inputs = node.declared_inputs();
            record.dependencies = dependency_names(&deployment.graph, index);
            record.protect = node.options.protect;
            snapshot.apply(RecordChange::Put(record));
        }
        snapshot
    }

    fn actions(plan: &DeploymentPlan) -> Vec<(&str, ActionType)> {
        plan.actions.iter().map(|a| (a.name.as_str(), a.action)).collect()
    }

    #[test]
    fn test_fresh_chain_creates_in_three_batches() {
        let deployment = chain_deployment("./app");
        let plan = DiffEngine::default().plan(&deployment, None).expect("plan");

        assert_eq!(
            actions(&plan),
            vec![
                ("Registry", ActionType::Create),
                ("Image", ActionType::Create),
                ("Service", ActionType::Create),
            ]
        );
        assert_eq!(plan.batches, vec![vec![0], vec![1], vec![2]]);
        assert_eq!(plan.execution_order(), vec!["Registry", "Image", "Service"]);
        assert_eq!(plan.action("Service").expect("service").depends_on, vec!["Image"]);
    }

    #[test]
    fn test_unchanged_graph_is_all_noop() {
        let snapshot = applied(&chain_deployment("./app"));
        let plan = DiffEngine::default()
            .plan(&chain_deployment("./app"), Some(&snapshot))
            .expect("plan");

        assert!(plan.actions.iter().all(|a| a.action == ActionType::NoOp));
        assert!(!plan.has_changes());
    }

    #[test]
    fn test_changed_context_reference_policy() {
        let snapshot = applied(&chain_deployment("./app"));
        let plan = DiffEngine::new(DiffPolicy::Reference)
            .plan(&chain_deployment("./app-v2"), Some(&snapshot))
            .expect("plan");

        assert_eq!(
            actions(&plan),
            vec![
                ("Registry", ActionType::NoOp),
                ("Image", ActionType::Update),
                ("Service", ActionType::NoOp),
            ]
        );
        let image = plan.action("Image").expect("image");
        assert_eq!(image.changed_fields(), vec!["context"]);
        assert_eq!(image.changes[0].old, Some(json!("./app")));
        assert_eq!(image.changes[0].new, Some(json!("./app-v2")));
    }

    #[test]
    fn test_changed_context_value_policy() {
        let snapshot = applied(&chain_deployment("./app"));
        let plan = DiffEngine::new(DiffPolicy::Value)
            .plan(&chain_deployment("./app-v2"), Some(&snapshot))
            .expect("plan");

        assert_eq!(
            actions(&plan),
            vec![
                ("Registry", ActionType::NoOp),
                ("Image", ActionType::Update),
                ("Service", ActionType::Update),
            ]
        );
        assert_eq!(plan.action("Service").expect("service").reason, "upstream 'Image' changed");
    }

    #[test]
    fn test_force_new_field_replaces() {
        let deployment = chain_deployment("./app");
        let mut snapshot = applied(&deployment);
        let mut registry = snapshot.record("Registry").expect("registry").clone();
        registry.declared_inputs.insert(String::from("name"), json!("old-repo"));
        snapshot.apply(RecordChange::Put(registry));

        let plan = DiffEngine::default().plan(&deployment, Some(&snapshot)).expect("plan");
        let action = plan.action("Registry").expect("registry");
        assert_eq!(action.action, ActionType::Replace);
        assert_eq!(action.provider_id.as_deref(), Some("id-0"));
        assert!(action.changes[0].force_new);
        assert!(action.replace_order.is_some());
    }

    fn renamed_registry(snapshot: &mut Snapshot) {
        let mut registry = snapshot.record("Registry").expect("registry").clone();
        registry.declared_inputs.insert(String::from("name"), json!("old-repo"));
        snapshot.apply(RecordChange::Put(registry));
    }

    #[test]
    fn test_replaced_upstream_updates_consumer_under_reference_policy() {
        let deployment = chain_deployment("./app");
        let mut snapshot = applied(&deployment);
        renamed_registry(&mut snapshot);

        let plan = DiffEngine::new(DiffPolicy::Reference)
            .plan(&deployment, Some(&snapshot))
            .expect("plan");
        assert_eq!(
            actions(&plan),
            vec![
                ("Registry", ActionType::Replace),
                ("Image", ActionType::Update),
                ("Service", ActionType::NoOp),
            ]
        );
        assert_eq!(plan.action("Image").expect("image").reason, "upstream 'Registry' replaced");
    }

    #[test]
    fn test_replaced_upstream_in_force_new_input_cascades() {
        let mut schemas = chain_registry();
        schemas.register(
            ResourceSchema::managed("test:Mirror")
                .input(FieldSpec::required("source").force_new())
                .outputs(&["url"]),
        );
        let mut ctx = DeploymentContext::new("demo", "dev", StackConfig::default(), schemas);
        let registry = ctx
            .declare("test:Registry", "Registry", Inputs::new().set("name", "repo"), ResourceOptions::new())
            .expect("registry");
        let mirror = ctx
            .declare(
                "test:Mirror",
                "Mirror",
                Inputs::new().set("source", registry.output("url").expect("url")),
                ResourceOptions::new(),
            )
            .expect("mirror");
        ctx.declare(
            "test:Image",
            "Image",
            Inputs::new()
                .set("repository", mirror.output("url").expect("url"))
                .set("context", "./app"),
            ResourceOptions::new(),
        )
        .expect("image");
        let deployment = ctx.finish().expect("deployment");
        let mut snapshot = applied(&deployment);
        renamed_registry(&mut snapshot);

        let plan = DiffEngine::default().plan(&deployment, Some(&snapshot)).expect("plan");
        let mirror = plan.action("Mirror").expect("mirror");
        assert_eq!(mirror.action, ActionType::Replace);
        assert_eq!(mirror.reason, "source references replaced 'Registry'");
        assert!(mirror.replace_order.is_some());
        assert_eq!(plan.action("Image").expect("image").action, ActionType::Update);

        let mut protected = snapshot.record("Mirror").expect("mirror").clone();
        protected.protect = true;
        snapshot.apply(RecordChange::Put(protected));
        let err = DiffEngine::default().plan(&deployment, Some(&snapshot)).expect_err("protected");
        assert!(matches!(err, StackweaveError::Plan(PlanError::Protected { .. })));
    }

    #[test]
    fn test_retired_instances_are_pending_cleanup() {
        let deployment = chain_deployment("./app");
        let mut snapshot = applied(&deployment);
        let mut registry = snapshot.record("Registry").expect("registry").clone();
        registry.retired_ids.push(String::from("id-old"));
        snapshot.apply(RecordChange::Put(registry));

        let plan = DiffEngine::default().plan(&deployment, Some(&snapshot)).expect("plan");
        assert!(plan.actions.iter().all(|a| a.action == ActionType::NoOp));
        assert_eq!(plan.cleanup, vec!["Registry"]);
        assert!(plan.has_changes());
    }

    #[test]
    fn test_failed_record_is_retried() {
        let deployment = chain_deployment("./app");
        let mut snapshot = applied(&deployment);
        let image = snapshot.record("Image").expect("image").clone();
        snapshot.apply(RecordChange::Put(image.failed()));
        let mut service = snapshot.record("Service").expect("service").clone();
        service.provider_id = None;
        service.status = RecordStatus::Failed;
        snapshot.apply(RecordChange::Put(service));

        let plan = DiffEngine::default().plan(&deployment, Some(&snapshot)).expect("plan");
        assert_eq!(plan.action("Image").expect("image").action, ActionType::Update);
        assert_eq!(plan.action("Service").expect("service").action, ActionType::Create);
    }

    #[test]
    fn test_removed_resources_are_deleted_last_in_reverse_order() {
        let old = chain_deployment("./app");
        let snapshot = applied(&old);

        let plan = DiffEngine::default()
            .plan(&Deployment::empty("demo", "dev"), Some(&snapshot))
            .expect("plan");
        assert_eq!(plan.execution_order(), vec!["Service", "Image", "Registry"]);
        assert!(plan.actions.iter().all(|a| a.action == ActionType::Delete));
        assert_eq!(plan.batches.len(), 3);
    }

    #[test]
    fn test_plan_destroy_reverse_dependency_order() {
        let snapshot = applied(&chain_deployment("./app"));
        let plan = DiffEngine::default().plan_destroy(&snapshot).expect("plan");

        assert_eq!(plan.execution_order(), vec!["Service", "Image", "Registry"]);
        assert_eq!(plan.count(ActionType::Delete), 3);
        assert_eq!(plan.action("Image").expect("image").depends_on, vec!["Service"]);
    }

    #[test]
    fn test_protected_resources() {
        let mut ctx = DeploymentContext::new("demo", "dev", StackConfig::default(), chain_registry());
        ctx.declare(
            "test:Registry",
            "Registry",
            Inputs::new().set("name", "repo"),
            ResourceOptions::new().protect(true),
        )
        .expect("registry");
        let deployment = ctx.finish().expect("deployment");
        let mut snapshot = applied(&deployment);

        let err = DiffEngine::default().plan_destroy(&snapshot).expect_err("protected");
        assert!(matches!(err, StackweaveError::Plan(PlanError::Protected { .. })));

        let mut registry = snapshot.record("Registry").expect("registry").clone();
        registry.declared_inputs.insert(String::from("name"), json!("renamed"));
        snapshot.apply(RecordChange::Put(registry));
        let err = DiffEngine::default().plan(&deployment, Some(&snapshot)).expect_err("protected");
        assert!(err.to_string().contains("cannot be replaced"));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = DiffEngine::default().plan(&chain_deployment("./app"), None).expect("plan");
        let b = DiffEngine::default().plan(&chain_deployment("./app"), None).expect("plan");
        let c = DiffEngine::default().plan(&chain_deployment("./other"), None).expect("plan");
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_ne!(a.fingerprint, c.fingerprint);
    }
}
