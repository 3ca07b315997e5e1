//! Plan executor.
//!
//! Batches run strictly in sequence. Within a batch nodes run concurrently,
//! bounded by a semaphore. Each node's outcome is written to the state store
//! as soon as its provider work finishes, so an interrupted run leaves an
//! accurate snapshot behind.
//!
//! A node whose operation fails takes its descendants down with it: they are
//! marked skipped, never started, and their output cells fail with the
//! original failure.
//!
//! Instances superseded by a create-before-delete replacement are deleted
//! after the last batch, and only once every consumer of the replaced node
//! succeeded. Until then the ids stay on the record for a later run.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::context::Deployment;
use crate::error::{Result, StackweaveError};
use crate::output::OutputFailure;
use crate::provider::{Provider, ProviderResult, ResourceKey};
use crate::resource::{ID_OUTPUT, PropertyMap, ReplaceOrder, ResourceNode, Unresolved};
use crate::state::{NodeRecord, RecordChange, RecordStatus, Snapshot, StateStore};

use super::cancel::CancelSignal;
use super::plan::{ActionType, DeploymentPlan, PlannedAction};
use super::report::{ApplyResult, NodeReport, NodeStatus, SkipReason};
use super::retry::RetryPolicy;

/// Default number of nodes running at once.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Executes deployment plans against a provider.
#[derive(Clone)]
pub struct PlanExecutor {
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
    parallelism: usize,
    cancel: CancelSignal,
}

/// Everything a node task needs, shared across the run.
struct Shared {
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
    cancel: CancelSignal,
    snapshot: Mutex<Snapshot>,
}

/// One node's work.
struct NodeJob {
    action: PlannedAction,
    node: Option<ResourceNode>,
    record: Option<NodeRecord>,
}

enum NodeOutcome {
    Succeeded { attempts: u32 },
    Failed { attempts: u32, error: String },
    Cancelled,
}

/// Why a node can no longer produce outputs.
#[derive(Debug, Clone)]
struct Blocked {
    failure: OutputFailure,
    cancelled: bool,
}

/// A managed object as the provider returned it.
struct Instance {
    id: String,
    inputs: PropertyMap,
    outputs: PropertyMap,
}

type NodeResult = std::result::Result<(), String>;

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.name())
            .field("store", &self.store.backend_type())
            .field("retry", &self.retry)
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

impl PlanExecutor {
    /// Creates an executor with default retry and parallelism.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, store: Arc<dyn StateStore>) -> Self {
        Self {
            provider,
            store,
            retry: RetryPolicy::default(),
            parallelism: DEFAULT_PARALLELISM,
            cancel: CancelSignal::new(),
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets how many nodes may run at once.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Uses `cancel` as the run's cancellation signal.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Applies `plan`, updating `snapshot` as nodes complete.
    ///
    /// Per-node provider failures are reported in the result, not returned
    /// as errors.
    ///
    /// # Errors
    ///
    /// Returns an internal consistency error if the plan schedules a node
    /// before one of its dependencies finished, or refers to resources the
    /// deployment does not contain.
    pub async fn apply(
        &self,
        plan: &DeploymentPlan,
        deployment: &Deployment,
        snapshot: &mut Snapshot,
    ) -> Result<ApplyResult> {
        info!(
            project = %plan.project,
            stack = %plan.stack,
            actions = plan.action_count(),
            batches = plan.batches.len(),
            "Applying plan"
        );

        let positions: HashMap<&str, usize> = plan
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| (a.name.as_str(), i))
            .collect();
        let mut reports: Vec<NodeReport> = plan
            .actions
            .iter()
            .map(|a| NodeReport::pending(&a.name, &a.type_token, a.action))
            .collect();
        let mut blocked: Vec<Option<Blocked>> = vec![None; plan.actions.len()];
        let mut cancelled = false;

        let shared = Arc::new(Shared {
            provider: Arc::clone(&self.provider),
            store: Arc::clone(&self.store),
            retry: self.retry,
            cancel: self.cancel.clone(),
            snapshot: Mutex::new(snapshot.clone()),
        });
        let semaphore = Arc::new(Semaphore::new(self.parallelism));

        for (number, batch) in plan.batches.iter().enumerate() {
            debug!(batch = number, nodes = batch.len(), "Starting batch");
            let mut tasks = JoinSet::new();

            for &index in batch {
                let action = plan.actions.get(index).ok_or_else(|| {
                    StackweaveError::consistency(format!("batch {number} refers to missing action {index}"))
                })?;
                let node = graph_node(deployment, action)?;

                let mut upstream: Option<Blocked> = None;
                for dep in &action.depends_on {
                    let Some(&d) = positions.get(dep.as_str()) else {
                        continue;
                    };
                    if let Some(b) = &blocked[d] {
                        upstream.get_or_insert_with(|| b.clone());
                    } else if reports[d].status != NodeStatus::Succeeded {
                        return Err(StackweaveError::consistency(format!(
                            "'{}' was scheduled before its dependency '{dep}' finished",
                            action.name
                        )));
                    }
                }

                let skip = match upstream {
                    Some(b) if b.cancelled => Some((b, SkipReason::Cancelled)),
                    Some(b) => {
                        let root = b.failure.resource.clone();
                        Some((b, SkipReason::DependencyFailed { root }))
                    }
                    None if self.cancel.is_cancelled() => {
                        Some((cancelled_block(&action.name), SkipReason::Cancelled))
                    }
                    None => None,
                };

                if let Some((block, reason)) = skip {
                    warn!(resource = %action.name, %reason, "Skipping");
                    if let Some(node) = node {
                        node.fail_outputs(&block.failure);
                    }
                    cancelled |= block.cancelled;
                    reports[index].status = NodeStatus::Skipped;
                    reports[index].skip_reason = Some(reason);
                    blocked[index] = Some(block);
                    continue;
                }

                reports[index].status = NodeStatus::Running;
                let job = NodeJob {
                    action: action.clone(),
                    node: node.cloned(),
                    record: snapshot.record(&action.name).cloned(),
                };
                let shared = Arc::clone(&shared);
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        let error = String::from("worker pool closed");
                        return (index, NodeOutcome::Failed { attempts: 0, error });
                    };
                    if shared.cancel.is_cancelled() {
                        return (index, NodeOutcome::Cancelled);
                    }
                    let mut attempts = 0;
                    let outcome = match shared.run(job, &mut attempts).await {
                        Ok(()) => NodeOutcome::Succeeded { attempts },
                        Err(error) => NodeOutcome::Failed { attempts, error },
                    };
                    (index, outcome)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (index, outcome) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        error!("Node task did not complete: {e}");
                        continue;
                    }
                };
                let report = &mut reports[index];
                let name = report.name.clone();
                let block = match outcome {
                    NodeOutcome::Succeeded { attempts } => {
                        report.status = NodeStatus::Succeeded;
                        report.attempts = attempts;
                        None
                    }
                    NodeOutcome::Failed { attempts, error } => {
                        error!(resource = %name, attempts, "Failed: {error}");
                        report.status = NodeStatus::Failed;
                        report.attempts = attempts;
                        report.error = Some(error.clone());
                        Some(Blocked {
                            failure: OutputFailure::new(&name, error),
                            cancelled: false,
                        })
                    }
                    NodeOutcome::Cancelled => {
                        report.status = NodeStatus::Skipped;
                        report.skip_reason = Some(SkipReason::Cancelled);
                        cancelled = true;
                        Some(cancelled_block(&name))
                    }
                };
                if let Some(block) = block {
                    if let Some(node) = plan.actions.get(index).and_then(|a| graph_node(deployment, a).ok().flatten()) {
                        node.fail_outputs(&block.failure);
                    }
                    blocked[index] = Some(block);
                }
            }

            for &index in batch {
                if reports[index].status == NodeStatus::Running {
                    let error = String::from("node task aborted");
                    reports[index].status = NodeStatus::Failed;
                    reports[index].error = Some(error.clone());
                    let failure = OutputFailure::new(&reports[index].name, error);
                    if let Some(node) = plan.actions.get(index).and_then(|a| graph_node(deployment, a).ok().flatten()) {
                        node.fail_outputs(&failure);
                    }
                    blocked[index] = Some(Blocked { failure, cancelled: false });
                }
            }
        }

        if self.cancel.is_cancelled() {
            debug!("Cancelled; replaced instances are kept for the next run");
        } else {
            shared.cleanup(plan, &mut reports).await;
        }

        *snapshot = shared.snapshot.lock().await.clone();

        let exports = deployment
            .exports
            .iter()
            .filter_map(|(name, cell)| match cell.peek() {
                Some(Ok(value)) => Some((name.clone(), value)),
                _ => None,
            })
            .collect();

        let result = ApplyResult {
            nodes: reports,
            exports,
            cancelled,
        };
        info!(cancelled, "Apply finished: {}", result.summary());
        Ok(result)
    }
}

fn graph_node<'a>(deployment: &'a Deployment, action: &PlannedAction) -> Result<Option<&'a ResourceNode>> {
    action
        .node
        .map(|i| {
            deployment.graph.nodes().get(i).ok_or_else(|| {
                StackweaveError::consistency(format!("'{}' has no resource at index {i}", action.name))
            })
        })
        .transpose()
}

fn cancelled_block(name: &str) -> Blocked {
    Blocked {
        failure: OutputFailure::new(name, "deployment cancelled"),
        cancelled: true,
    }
}

fn resolved_inputs(node: &ResourceNode) -> std::result::Result<PropertyMap, String> {
    node.resolve_inputs().map_err(|unresolved| match unresolved {
        Unresolved::Pending(refs) => {
            let names: Vec<String> = refs.iter().map(ToString::to_string).collect();
            format!(
                "internal consistency: inputs {} were unresolved when the node started",
                names.join(", ")
            )
        }
        Unresolved::Failed(failure) => failure.to_string(),
    })
}

impl Shared {
    async fn run(&self, job: NodeJob, attempts: &mut u32) -> NodeResult {
        let NodeJob { action, node, record } = job;
        debug!(resource = %action.name, action = %action.action, "Running");

        let result = match (action.action, node.as_ref()) {
            (ActionType::Create, Some(node)) => self.create(node, &action, record.as_ref(), attempts).await,
            (ActionType::Update, Some(node)) => self.update(node, &action, record.as_ref(), attempts).await,
            (ActionType::Replace, Some(node)) => self.replace(node, &action, record.as_ref(), attempts).await,
            (ActionType::Read, Some(node)) => self.read(node, &action, attempts).await,
            (ActionType::NoOp, Some(node)) => self.no_op(node, &action, record.as_ref()).await,
            (ActionType::Delete, _) => self.delete(&action, record.as_ref(), attempts).await,
            (other, None) => Err(format!(
                "internal consistency: {other} planned for '{}' without a declared resource",
                action.name
            )),
        };

        if result.is_ok() && action.action != ActionType::NoOp {
            info!(resource = %action.name, action = %action.action, "Done");
        }
        result
    }

    /// Runs one provider operation under the retry policy.
    async fn call<T, F, Fut>(&self, label: String, attempts: &mut u32, operation: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let attempted = self.retry.run(&label, operation).await;
        *attempts += attempted.attempts;
        attempted.result
    }

    /// Persists one change; writes are serialized through the snapshot lock.
    async fn write(&self, change: RecordChange) -> NodeResult {
        let mut snapshot = self.snapshot.lock().await;
        self.store
            .record_node_result(&mut snapshot, change)
            .await
            .map_err(|e| format!("state write failed: {e}"))
    }

    /// Marks an existing record failed without losing the original error.
    async fn mark_failed(&self, record: &NodeRecord) {
        if let Err(e) = self.write(RecordChange::Put(record.clone().failed())).await {
            warn!(resource = %record.name, "{e}");
        }
    }

    async fn create(
        &self,
        node: &ResourceNode,
        action: &PlannedAction,
        previous: Option<&NodeRecord>,
        attempts: &mut u32,
    ) -> NodeResult {
        let inputs = resolved_inputs(node)?;
        let key = ResourceKey::new(node.type_token(), &node.name);
        let created = self
            .call(format!("create {key}"), attempts, || self.provider.create(&key, &inputs))
            .await
            .map_err(|e| e.to_string())?;

        let retired = previous.map(|r| r.retired_ids.clone()).unwrap_or_default();
        let instance = Instance { id: created.id, inputs, outputs: created.outputs };
        self.realized(node, action, instance, retired).await
    }

    async fn update(
        &self,
        node: &ResourceNode,
        action: &PlannedAction,
        record: Option<&NodeRecord>,
        attempts: &mut u32,
    ) -> NodeResult {
        let (record, id) = existing(&node.name, record)?;
        let inputs = resolved_inputs(node)?;
        let key = ResourceKey::new(node.type_token(), &node.name);

        match self
            .call(format!("update {key}"), attempts, || {
                self.provider.update(&key, &id, &record.resolved_inputs, &inputs)
            })
            .await
        {
            Ok(outputs) => {
                let retired = record.retired_ids.clone();
                self.realized(node, action, Instance { id, inputs, outputs }, retired).await
            }
            Err(e) => {
                self.mark_failed(record).await;
                Err(e.to_string())
            }
        }
    }

    async fn replace(
        &self,
        node: &ResourceNode,
        action: &PlannedAction,
        record: Option<&NodeRecord>,
        attempts: &mut u32,
    ) -> NodeResult {
        let Some(old) = record else {
            return self.create(node, action, None, attempts).await;
        };
        let order = action.replace_order.unwrap_or_else(|| node.replace_order());

        match order {
            ReplaceOrder::CreateBeforeDelete => {
                let inputs = resolved_inputs(node)?;
                let key = ResourceKey::new(node.type_token(), &node.name);
                let created = match self
                    .call(format!("create replacement {key}"), attempts, || {
                        self.provider.create(&key, &inputs)
                    })
                    .await
                {
                    Ok(created) => created,
                    Err(e) => {
                        self.mark_failed(old).await;
                        return Err(e.to_string());
                    }
                };
                // Consumers still point at the old instance until they are
                // redeployed, so it is only retired here.
                let mut retired = old.retired_ids.clone();
                retired.extend(old.provider_id.clone());
                let instance = Instance { id: created.id, inputs, outputs: created.outputs };
                self.realized(node, action, instance, retired).await
            }
            ReplaceOrder::DeleteBeforeCreate => {
                if let Some(old_id) = &old.provider_id {
                    let old_key = ResourceKey::new(&old.type_token, &old.name);
                    match self
                        .call(format!("delete {old_key}"), attempts, || {
                            self.provider.delete(&old_key, old_id)
                        })
                        .await
                    {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => debug!(resource = %old.name, "Already deleted"),
                        Err(e) => {
                            self.mark_failed(old).await;
                            return Err(e.to_string());
                        }
                    }
                }
                let mut placeholder = old.clone().failed();
                placeholder.provider_id = None;
                self.write(RecordChange::Put(placeholder.clone())).await?;
                self.create(node, action, Some(&placeholder), attempts).await
            }
        }
    }

    async fn read(&self, node: &ResourceNode, action: &PlannedAction, attempts: &mut u32) -> NodeResult {
        let args = resolved_inputs(node)?;
        let key = ResourceKey::new(node.type_token(), &node.name);
        let outputs = self
            .call(format!("read {key}"), attempts, || self.provider.invoke(&key, &args))
            .await
            .map_err(|e| e.to_string())?;

        warn_missing(node, &node.resolve_outputs(None, &outputs));

        let mut record = NodeRecord::new(&node.name, node.type_token());
        record.data_source = true;
        record.declared_inputs = node.declared_inputs();
        record.resolved_inputs = args;
        record.outputs = outputs;
        record.dependencies.clone_from(&action.depends_on);
        self.write(RecordChange::Put(record)).await
    }

    async fn no_op(&self, node: &ResourceNode, action: &PlannedAction, record: Option<&NodeRecord>) -> NodeResult {
        let Some(record) = record else {
            return Err(format!("internal consistency: no-op for '{}' without a state record", node.name));
        };
        warn_missing(node, &node.resolve_outputs(record.provider_id.as_deref(), &record.outputs));

        let mut current = record.clone();
        if current.dependencies != action.depends_on || current.protect != node.options.protect {
            current.dependencies.clone_from(&action.depends_on);
            current.protect = node.options.protect;
            self.write(RecordChange::Put(current)).await?;
        }
        Ok(())
    }

    async fn delete(&self, action: &PlannedAction, record: Option<&NodeRecord>, attempts: &mut u32) -> NodeResult {
        let Some(record) = record else {
            debug!(resource = %action.name, "Nothing recorded, nothing to delete");
            return Ok(());
        };

        if !record.data_source {
            let key = ResourceKey::new(&record.type_token, &record.name);
            for id in record.provider_id.iter().chain(&record.retired_ids) {
                match self
                    .call(format!("delete {key}"), attempts, || self.provider.delete(&key, id))
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => debug!(resource = %record.name, id = %id, "Already deleted"),
                    Err(e) => {
                        self.mark_failed(record).await;
                        return Err(e.to_string());
                    }
                }
            }
        }
        self.write(RecordChange::Remove(record.name.clone())).await
    }

    /// Resolves outputs and records a managed resource after create or update.
    async fn realized(
        &self,
        node: &ResourceNode,
        action: &PlannedAction,
        instance: Instance,
        retired: Vec<String>,
    ) -> NodeResult {
        let Instance { id, inputs, mut outputs } = instance;
        outputs.insert(ID_OUTPUT.to_string(), Value::String(id.clone()));
        warn_missing(node, &node.resolve_outputs(Some(&id), &outputs));

        let mut record = NodeRecord::new(&node.name, node.type_token());
        record.provider_id = Some(id);
        record.declared_inputs = node.declared_inputs();
        record.resolved_inputs = inputs;
        record.outputs = outputs;
        record.dependencies.clone_from(&action.depends_on);
        record.protect = node.options.protect;
        record.retired_ids = retired;
        record.status = RecordStatus::Ready;

        self.write(RecordChange::Put(record)).await
    }

    /// Deletes the retired instances of succeeded nodes whose consumers all
    /// succeeded too.
    async fn cleanup(&self, plan: &DeploymentPlan, reports: &mut [NodeReport]) {
        let mut consumers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, action) in plan.actions.iter().enumerate() {
            if action.action != ActionType::Delete {
                for dep in &action.depends_on {
                    consumers.entry(dep.as_str()).or_default().push(index);
                }
            }
        }

        for (index, action) in plan.actions.iter().enumerate() {
            if action.action == ActionType::Delete || reports[index].status != NodeStatus::Succeeded {
                continue;
            }
            let record = self.snapshot.lock().await.record(&action.name).cloned();
            let Some(record) = record.filter(|r| !r.retired_ids.is_empty()) else {
                continue;
            };
            if let Some(waiting) = unfinished_consumer(&action.name, &consumers, plan, reports) {
                info!(resource = %action.name, consumer = %waiting, "Keeping replaced instance until its consumers move");
                continue;
            }
            let mut attempts = 0;
            self.cleanup_retired(record, &mut attempts).await;
            reports[index].attempts += attempts;
        }
    }

    /// Deletes superseded instances. Failures keep the id for the next run.
    async fn cleanup_retired(&self, mut record: NodeRecord, attempts: &mut u32) {
        if record.retired_ids.is_empty() {
            return;
        }
        let key = ResourceKey::new(&record.type_token, &record.name);
        let retired = std::mem::take(&mut record.retired_ids);
        let before = retired.len();

        for id in retired {
            match self
                .call(format!("delete retired {key}"), attempts, || self.provider.delete(&key, &id))
                .await
            {
                Ok(()) => info!(resource = %record.name, id = %id, "Deleted replaced instance"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(resource = %record.name, id = %id, "Replaced instance not deleted: {e}");
                    record.retired_ids.push(id);
                }
            }
        }

        if record.retired_ids.len() != before {
            if let Err(e) = self.write(RecordChange::Put(record)).await {
                warn!("{e}");
            }
        }
    }
}

/// First transitive consumer of `name` that did not succeed in this run.
fn unfinished_consumer<'a>(
    name: &str,
    consumers: &HashMap<&str, Vec<usize>>,
    plan: &'a DeploymentPlan,
    reports: &[NodeReport],
) -> Option<&'a str> {
    let mut seen = HashSet::new();
    let mut stack: Vec<usize> = consumers.get(name).cloned().unwrap_or_default();
    while let Some(index) = stack.pop() {
        if !seen.insert(index) {
            continue;
        }
        let action = plan.actions.get(index)?;
        if reports[index].status != NodeStatus::Succeeded {
            return Some(&action.name);
        }
        stack.extend(consumers.get(action.name.as_str()).into_iter().flatten());
    }
    None
}

fn existing<'a>(name: &str, record: Option<&'a NodeRecord>) -> std::result::Result<(&'a NodeRecord, String), String> {
    let record = record.ok_or_else(|| format!("internal consistency: '{name}' has no state record"))?;
    let id = record
        .provider_id
        .clone()
        .ok_or_else(|| format!("internal consistency: '{name}' has no provider id"))?;
    Ok((record, id))
}

fn warn_missing(node: &ResourceNode, missing: &[String]) {
    if !missing.is_empty() {
        warn!(
            resource = %node.name,
            missing = %missing.join(", "),
            "Provider did not return every declared output"
        );
    }
}
