//! Deployment engine.
//!
//! Ties planning, execution and state together for one stack. Every mutating
//! run follows the same sequence: take the stack lock, load the snapshot,
//! plan, apply, append a history entry, save, release the lock.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ExecutionConfig;
use crate::context::Deployment;
use crate::error::{Result, StackweaveError, StateError};
use crate::planner::{ApplyResult, CancelSignal, DeploymentPlan, DiffEngine, PlanExecutor, RetryPolicy};
use crate::provider::{Provider, ResourceKey};
use crate::resource::ID_OUTPUT;
use crate::state::{
    HistoryEntry, HistoryOperation, RecordChange, Snapshot, StateStore, generate_holder_id,
};

/// Orchestrates preview, up, destroy and refresh for one stack.
pub struct Engine {
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    settings: ExecutionConfig,
    cancel: CancelSignal,
    holder: String,
}

/// A plan together with the result of applying it.
#[derive(Debug, Serialize)]
pub struct RunOutcome {
    /// The plan that was applied.
    pub plan: DeploymentPlan,
    /// Per-node results.
    pub result: ApplyResult,
}

/// What a refresh found.
#[derive(Debug, Default, Serialize)]
pub struct DriftReport {
    /// Records whose outputs changed behind the engine's back.
    pub drifted: Vec<String>,
    /// Records whose object no longer exists; they were dropped.
    pub missing: Vec<String>,
    /// Records checked.
    pub checked: usize,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("provider", &self.provider.name())
            .field("store", &self.store.backend_type())
            .field("settings", &self.settings)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine with default execution settings.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, store: Arc<dyn StateStore>) -> Self {
        Self {
            provider,
            store,
            settings: ExecutionConfig::default(),
            cancel: CancelSignal::new(),
            holder: generate_holder_id(),
        }
    }

    /// Sets execution limits and the diff policy.
    #[must_use]
    pub fn with_settings(mut self, settings: ExecutionConfig) -> Self {
        self.settings = settings;
        self
    }

    /// Uses `cancel` for runs started by this engine.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// The signal that cancels runs started by this engine.
    #[must_use]
    pub const fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    fn diff_engine(&self) -> DiffEngine {
        DiffEngine::new(self.settings.diff_policy)
    }

    fn executor(&self) -> PlanExecutor {
        PlanExecutor::new(Arc::clone(&self.provider), Arc::clone(&self.store))
            .with_retry(RetryPolicy::from_config(&self.settings))
            .with_parallelism(self.settings.parallelism)
            .with_cancel(self.cancel.clone())
    }

    /// Computes the plan for `deployment` without changing anything.
    ///
    /// With `refresh`, recorded objects are re-read first; the refreshed
    /// snapshot is used for planning but not saved.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be loaded or planning fails.
    pub async fn preview(&self, deployment: &Deployment, refresh: bool) -> Result<DeploymentPlan> {
        let mut snapshot = self.load(&deployment.project, &deployment.stack).await?;
        if refresh {
            let report = self.refresh(&mut snapshot).await;
            debug!(drifted = report.drifted.len(), missing = report.missing.len(), "Refreshed for preview");
        }
        self.diff_engine().plan(deployment, Some(&snapshot))
    }

    /// Plans and applies `deployment`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken, the snapshot cannot be
    /// loaded or saved, or planning fails. Node failures are reported in the
    /// outcome instead.
    pub async fn up(&self, deployment: &Deployment, refresh: bool) -> Result<RunOutcome> {
        let lock = self.store.acquire_lock(&self.holder, "up").await?;
        let outcome = self.run_up(deployment, refresh).await;
        self.unlock(&lock.lock_id).await;
        outcome
    }

    async fn run_up(&self, deployment: &Deployment, refresh: bool) -> Result<RunOutcome> {
        let mut snapshot = self.load(&deployment.project, &deployment.stack).await?;
        if refresh {
            let report = self.refresh(&mut snapshot).await;
            if !report.drifted.is_empty() || !report.missing.is_empty() {
                self.store.save(&snapshot).await?;
            }
        }

        let plan = self.diff_engine().plan(deployment, Some(&snapshot))?;
        info!(
            project = %plan.project,
            stack = %plan.stack,
            changes = plan.action_count(),
            "Plan: {}",
            plan.summary()
        );

        let result = self.executor().apply(&plan, deployment, &mut snapshot).await?;
        self.finish(&mut snapshot, HistoryOperation::Update, &plan, &result)
            .await?;
        Ok(RunOutcome { plan, result })
    }

    /// Deletes every recorded resource of a stack, dependents first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken, a recorded resource is
    /// protected, or the snapshot cannot be loaded or saved.
    pub async fn destroy(&self, project: &str, stack: &str) -> Result<RunOutcome> {
        let lock = self.store.acquire_lock(&self.holder, "destroy").await?;
        let outcome = self.run_destroy(project, stack).await;
        self.unlock(&lock.lock_id).await;
        outcome
    }

    async fn run_destroy(&self, project: &str, stack: &str) -> Result<RunOutcome> {
        let mut snapshot = self.load(project, stack).await?;
        let plan = self.diff_engine().plan_destroy(&snapshot)?;
        info!(project, stack, resources = plan.actions.len(), "Destroying stack");

        let empty = Deployment::empty(project, stack);
        let result = self.executor().apply(&plan, &empty, &mut snapshot).await?;
        self.finish(&mut snapshot, HistoryOperation::Destroy, &plan, &result)
            .await?;
        Ok(RunOutcome { plan, result })
    }

    /// Re-reads every recorded managed resource and updates `snapshot`.
    ///
    /// Objects the provider no longer knows are dropped from the snapshot.
    /// Read failures are logged and leave the record untouched.
    pub async fn refresh(&self, snapshot: &mut Snapshot) -> DriftReport {
        let retry = RetryPolicy::from_config(&self.settings);
        let mut report = DriftReport::default();

        let records: Vec<_> = snapshot
            .records
            .values()
            .filter(|r| !r.data_source)
            .cloned()
            .collect();

        for record in records {
            let Some(id) = record.provider_id.clone() else {
                continue;
            };
            report.checked += 1;
            let key = ResourceKey::new(&record.type_token, &record.name);
            let attempted = retry
                .run(&format!("read {key}"), || self.provider.read(&key, &id))
                .await;

            match attempted.result {
                Ok(current) => {
                    let mut outputs = current.outputs;
                    if let Some(recorded_id) = record.outputs.get(ID_OUTPUT) {
                        outputs.insert(ID_OUTPUT.to_string(), recorded_id.clone());
                    }
                    if outputs != record.outputs {
                        info!(resource = %record.name, "Outputs drifted");
                        report.drifted.push(record.name.clone());
                        let mut updated = record;
                        updated.outputs = outputs;
                        updated.resolved_inputs = current.inputs;
                        snapshot.apply(RecordChange::Put(updated));
                    }
                }
                Err(e) if e.is_not_found() => {
                    warn!(resource = %record.name, %id, "Object no longer exists, dropping it from state");
                    report.missing.push(record.name.clone());
                    snapshot.apply(RecordChange::Remove(record.name));
                }
                Err(e) => warn!(resource = %record.name, "Refresh failed: {e}"),
            }
        }

        info!(
            checked = report.checked,
            drifted = report.drifted.len(),
            missing = report.missing.len(),
            "Refresh complete"
        );
        report
    }

    /// Refreshes the recorded state of a stack and saves it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken or the snapshot cannot be
    /// loaded or saved.
    pub async fn refresh_stack(&self, project: &str, stack: &str) -> Result<DriftReport> {
        let lock = self.store.acquire_lock(&self.holder, "refresh").await?;
        let report = self.run_refresh(project, stack).await;
        self.unlock(&lock.lock_id).await;
        report
    }

    async fn run_refresh(&self, project: &str, stack: &str) -> Result<DriftReport> {
        let mut snapshot = self.load(project, stack).await?;
        let report = self.refresh(&mut snapshot).await;
        let fingerprint = snapshot
            .history
            .last()
            .map(|h| h.fingerprint.clone())
            .unwrap_or_default();
        let mut changed = report.drifted.clone();
        changed.extend(report.missing.iter().cloned());
        snapshot.add_history(HistoryEntry::new(HistoryOperation::Refresh, &fingerprint, changed, None));
        self.store.save(&snapshot).await?;
        Ok(report)
    }

    /// The stack's recorded snapshot, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be loaded or belongs to
    /// another stack.
    pub async fn snapshot(&self, project: &str, stack: &str) -> Result<Option<Snapshot>> {
        if self.store.exists().await? {
            self.load(project, stack).await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Loads the stack's snapshot, or a fresh one for a new stack.
    async fn load(&self, project: &str, stack: &str) -> Result<Snapshot> {
        match self.store.load().await? {
            Some(snapshot) if snapshot.project != project || snapshot.stack != stack => {
                Err(StackweaveError::State(StateError::Corrupted {
                    message: format!(
                        "state belongs to {}/{}, not {project}/{stack}",
                        snapshot.project, snapshot.stack
                    ),
                }))
            }
            Some(snapshot) => Ok(snapshot),
            None => {
                debug!(project, stack, "No previous state, starting fresh");
                Ok(Snapshot::new(project, stack))
            }
        }
    }

    /// Appends the run to history and persists the snapshot.
    async fn finish(
        &self,
        snapshot: &mut Snapshot,
        operation: HistoryOperation,
        plan: &DeploymentPlan,
        result: &ApplyResult,
    ) -> Result<()> {
        let resources = plan
            .actions
            .iter()
            .filter(|a| a.action.is_mutation())
            .map(|a| a.name.clone())
            .collect();
        let error = (!result.is_success()).then(|| result.summary());
        snapshot.add_history(HistoryEntry::new(operation, &plan.fingerprint, resources, error));
        self.store.save(snapshot).await
    }

    async fn unlock(&self, lock_id: &str) {
        if let Err(e) = self.store.release_lock(lock_id).await {
            warn!("Failed to release state lock: {e}");
        }
    }
}

impl RunOutcome {
    /// Process exit code for the run.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        self.result.exit_code()
    }
}

impl DriftReport {
    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.drifted.is_empty() && self.missing.is_empty()
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected ({} resources checked)", self.checked);
        }
        writeln!(f, "Drift detected:")?;
        for name in &self.drifted {
            writeln!(f, "  ~ {name}")?;
        }
        for name in &self.missing {
            writeln!(f, "  - {name} (no longer exists)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::planner::{ActionType, NodeStatus};
    use crate::provider::{Operation, SimulatedProvider};
    use crate::state::MemoryStateStore;
    use crate::testing::chain_deployment;
    use std::time::Duration;

    fn settings() -> ExecutionConfig {
        ExecutionConfig {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..ExecutionConfig::default()
        }
    }

    fn engine(provider: &Arc<SimulatedProvider>, store: &Arc<MemoryStateStore>) -> Engine {
        Engine::new(Arc::clone(provider) as Arc<dyn Provider>, Arc::clone(store) as Arc<dyn StateStore>)
            .with_settings(settings())
    }

    #[tokio::test]
    async fn test_up_then_preview_is_converged() {
        let provider = Arc::new(SimulatedProvider::default());
        let store = Arc::new(MemoryStateStore::new());
        let engine = engine(&provider, &store);

        let outcome = engine.up(&chain_deployment("./app"), false).await.expect("up");
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.plan.count(ActionType::Create), 3);

        let plan = engine.preview(&chain_deployment("./app"), false).await.expect("preview");
        assert!(!plan.has_changes());

        let snapshot = store.current().expect("current").expect("saved");
        assert_eq!(snapshot.history.len(), 1);
        assert!(snapshot.history[0].success);
        assert!(!store.is_locked().await.expect("lock state"));
    }

    #[tokio::test]
    async fn test_up_finishes_pending_cleanup_without_other_changes() {
        use crate::context::DeploymentContext;
        use crate::config::StackConfig;
        use crate::resource::{Inputs, ResourceOptions};

        let declare = |name: &str| {
            let mut ctx = DeploymentContext::new("demo", "dev", StackConfig::default(), crate::testing::chain_registry());
            ctx.declare(
                "test:Registry",
                "Registry",
                Inputs::new().set("name", name),
                ResourceOptions::new().replace_order(crate::resource::ReplaceOrder::CreateBeforeDelete),
            )
            .expect("registry");
            ctx.finish().expect("deployment")
        };
        let provider = Arc::new(SimulatedProvider::default());
        let store = Arc::new(MemoryStateStore::new());
        let engine = engine(&provider, &store);

        engine.up(&declare("one"), false).await.expect("up");
        let old_id = store
            .current()
            .expect("current")
            .and_then(|s| s.record("Registry").and_then(|r| r.provider_id.clone()))
            .expect("id");

        provider.fail_on("Registry", Operation::Delete, ProviderError::permanent("in use"), Some(1));
        let outcome = engine.up(&declare("two"), false).await.expect("replaced");
        assert_eq!(outcome.exit_code(), 0);
        assert!(provider.exists(&old_id));

        let plan = engine.preview(&declare("two"), false).await.expect("preview");
        assert_eq!(plan.count(ActionType::NoOp), 1);
        assert!(plan.has_changes());
        assert!(plan.has_pending_cleanup());

        engine.up(&declare("two"), false).await.expect("cleanup");
        assert!(!provider.exists(&old_id));
        let plan = engine.preview(&declare("two"), false).await.expect("preview");
        assert!(!plan.has_changes());
    }

    #[tokio::test]
    async fn test_up_refuses_when_locked() {
        let provider = Arc::new(SimulatedProvider::default());
        let store = Arc::new(MemoryStateStore::new());
        store.acquire_lock("someone-else", "up").await.expect("held");

        let err = engine(&provider, &store)
            .up(&chain_deployment("./app"), false)
            .await
            .expect_err("locked");
        assert!(matches!(err, StackweaveError::State(StateError::LockedByOther { .. })));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_is_recorded_and_lock_released() {
        let provider = Arc::new(SimulatedProvider::default());
        provider.fail_on("Image", Operation::Create, ProviderError::permanent("build failed"), None);
        let store = Arc::new(MemoryStateStore::new());

        let outcome = engine(&provider, &store)
            .up(&chain_deployment("./app"), false)
            .await
            .expect("run completes");
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(outcome.result.node("Service").expect("service").status, NodeStatus::Skipped);

        let snapshot = store.current().expect("current").expect("saved");
        assert_eq!(snapshot.names(), vec!["Registry"]);
        let entry = snapshot.history.last().expect("history");
        assert!(!entry.success);
        assert!(entry.error.as_deref().unwrap_or_default().contains("1 failed"));
        assert!(!store.is_locked().await.expect("lock state"));
    }

    #[tokio::test]
    async fn test_destroy_empties_state() {
        let provider = Arc::new(SimulatedProvider::default());
        let store = Arc::new(MemoryStateStore::new());
        let engine = engine(&provider, &store);
        engine.up(&chain_deployment("./app"), false).await.expect("up");

        let outcome = engine.destroy("demo", "dev").await.expect("destroy");
        assert_eq!(outcome.plan.count(ActionType::Delete), 3);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(provider.object_count(), 0);

        let snapshot = store.current().expect("current").expect("saved");
        assert!(snapshot.records.is_empty());
        assert_eq!(snapshot.history.last().expect("entry").operation, HistoryOperation::Destroy);
    }

    #[tokio::test]
    async fn test_refresh_drops_missing_objects() {
        let provider = Arc::new(SimulatedProvider::default());
        let store = Arc::new(MemoryStateStore::new());
        let engine = engine(&provider, &store);
        engine.up(&chain_deployment("./app"), false).await.expect("up");

        let mut snapshot = store.current().expect("current").expect("saved");
        let service_id = snapshot
            .record("Service")
            .and_then(|r| r.provider_id.clone())
            .expect("id");
        provider.forget(&service_id);

        let report = engine.refresh(&mut snapshot).await;
        assert_eq!(report.checked, 3);
        assert_eq!(report.missing, vec!["Service"]);
        assert!(report.drifted.is_empty());
        assert!(snapshot.record("Service").is_none());

        // Planning from the refreshed state recreates the lost object.
        let plan = engine.preview(&chain_deployment("./app"), true).await.expect("preview");
        assert_eq!(plan.action("Service").expect("service").action, ActionType::Create);
    }

    #[tokio::test]
    async fn test_refresh_stack_saves_and_records_history() {
        let provider = Arc::new(SimulatedProvider::default());
        let store = Arc::new(MemoryStateStore::new());
        let engine = engine(&provider, &store);
        assert!(engine.snapshot("demo", "dev").await.expect("load").is_none());
        engine.up(&chain_deployment("./app"), false).await.expect("up");

        let snapshot = engine.snapshot("demo", "dev").await.expect("load").expect("saved");
        let registry_id = snapshot
            .record("Registry")
            .and_then(|r| r.provider_id.clone())
            .expect("id");
        provider.forget(&registry_id);

        let report = engine.refresh_stack("demo", "dev").await.expect("refresh");
        assert_eq!(report.missing, vec!["Registry"]);

        let saved = store.current().expect("current").expect("saved");
        assert!(saved.record("Registry").is_none());
        let entry = saved.history.last().expect("history");
        assert_eq!(entry.operation, HistoryOperation::Refresh);
        assert_eq!(entry.resources, vec!["Registry"]);
        assert!(!store.is_locked().await.expect("lock state"));
    }

    #[tokio::test]
    async fn test_state_of_another_stack_is_rejected() {
        let provider = Arc::new(SimulatedProvider::default());
        let store = Arc::new(MemoryStateStore::with_snapshot(Snapshot::new("demo", "prod")));

        let err = engine(&provider, &store)
            .preview(&chain_deployment("./app"), false)
            .await
            .expect_err("wrong stack");
        assert!(err.to_string().contains("demo/prod"));
    }

    #[tokio::test]
    async fn test_cancelled_up_reports_exit_code_three() {
        let provider = Arc::new(SimulatedProvider::default().with_latency(Duration::from_millis(5)));
        let store = Arc::new(MemoryStateStore::new());
        let engine = engine(&provider, &store);
        engine.cancel_signal().cancel();

        let outcome = engine.up(&chain_deployment("./app"), false).await.expect("up");
        assert_eq!(outcome.exit_code(), 3);
        assert!(provider.calls().is_empty());
    }
}
