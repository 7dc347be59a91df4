//! Plan executor for applying execution plans.
//!
//! Actions run layer by layer. Within a layer a bounded pool of workers
//! drives the remote; across layers execution is strictly ordered. An action
//! whose prerequisite did not succeed is skipped, and so is everything that
//! depends on it, while unrelated branches keep going. Every success is
//! written to the state store before the next result is handled.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ApplyError, ConvergentError, RemoteError, Result};
use crate::remote::{RemoteClient, RetryPolicy};
use crate::resource::{map_from_json, map_to_json, AttributeMap, ResourceDescriptor, SchemaRegistry};
use crate::state::{ObservedState, ResourceState, StateStore};

use super::plan::{ActionKind, ExecutionPlan, PlannedAction};

/// Default number of concurrent remote operations.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Executor for execution plans.
pub struct PlanExecutor {
    client: Arc<dyn RemoteClient>,
    store: Arc<dyn StateStore>,
    schemas: Arc<SchemaRegistry>,
    retry: RetryPolicy,
    parallelism: usize,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

/// Lifecycle of a single action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Not started.
    Pending,
    /// Remote operation in progress.
    Running,
    /// Finished and recorded in state.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Never started: a prerequisite did not succeed, or the run was cancelled.
    Skipped,
}

/// Terminal record of one action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionReport {
    /// Action id.
    pub id: usize,
    /// Action kind.
    pub kind: ActionKind,
    /// Logical name.
    pub resource_name: String,
    /// Resource type.
    pub resource_type: String,
    /// Final status.
    pub status: ActionStatus,
    /// Remote attempts made.
    pub attempts: u32,
    /// Remote id after the action, when known.
    pub remote_id: Option<String>,
    /// Error or skip reason.
    pub error: Option<String>,
}

/// Result of executing a plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyResult {
    /// Actions that succeeded.
    pub succeeded: Vec<ActionReport>,
    /// Actions that failed.
    pub failed: Vec<ActionReport>,
    /// Actions that never started.
    pub skipped: Vec<ActionReport>,
    /// Whether the run was cancelled before finishing.
    pub cancelled: bool,
}

/// What a worker hands back to the coordinator.
struct Outcome {
    id: usize,
    attempts: u32,
    result: std::result::Result<Option<String>, String>,
}

/// Shared context for workers.
struct Worker {
    client: Arc<dyn RemoteClient>,
    store: Arc<dyn StateStore>,
    schemas: Arc<SchemaRegistry>,
    retry: RetryPolicy,
    state: Arc<Mutex<ObservedState>>,
}

impl ActionStatus {
    /// Returns true for `Succeeded`, `Failed` and `Skipped`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Moves to `to`, rejecting transitions the lifecycle does not allow.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` for an illegal move.
    pub fn transition(&mut self, action: usize, to: Self) -> Result<()> {
        let allowed = matches!(
            (*self, to),
            (Self::Pending, Self::Running | Self::Skipped)
                | (Self::Running, Self::Succeeded | Self::Failed)
        );
        if !allowed {
            return Err(ApplyError::InvalidTransition {
                action,
                from: self.to_string(),
                to: to.to_string(),
            }
            .into());
        }
        *self = to;
        Ok(())
    }
}

impl PlanExecutor {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(
        client: Arc<dyn RemoteClient>,
        store: Arc<dyn StateStore>,
        schemas: Arc<SchemaRegistry>,
    ) -> Self {
        Self {
            client,
            store,
            schemas,
            retry: RetryPolicy::default(),
            parallelism: DEFAULT_PARALLELISM,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the retry policy for remote operations.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets how many remote operations may run at once.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Cancels the run if it has not finished after `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the token that cancels this executor's runs.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Executes `plan` starting from `state`.
    ///
    /// Per-action failures are reported in the result rather than returned.
    /// The final state is returned alongside; it has already been saved
    /// after every successful action.
    ///
    /// # Errors
    ///
    /// Returns an error only for internal faults such as an illegal status
    /// transition.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        state: ObservedState,
    ) -> Result<(ApplyResult, ObservedState)> {
        info!(
            "Executing plan with {} actions in {} layers (parallelism {})",
            plan.actions.len(),
            plan.layers.len(),
            self.parallelism
        );

        let cancel = self.cancel.child_token();
        let deadline = self.timeout.map(|timeout| {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!("Apply timed out after {timeout:?}, cancelling remaining actions");
                token.cancel();
            })
        });

        let worker = Arc::new(Worker {
            client: self.client.clone(),
            store: self.store.clone(),
            schemas: self.schemas.clone(),
            retry: self.retry.clone(),
            state: Arc::new(Mutex::new(state)),
        });
        let semaphore = Arc::new(Semaphore::new(self.parallelism));

        let mut statuses = vec![ActionStatus::Pending; plan.actions.len()];
        let mut reports: Vec<Option<ActionReport>> = vec![None; plan.actions.len()];

        let run = self
            .run_layers(plan, &worker, &semaphore, &cancel, &mut statuses, &mut reports)
            .await;

        if let Some(handle) = deadline {
            handle.abort();
        }
        run?;

        let mut result = ApplyResult {
            cancelled: cancel.is_cancelled(),
            ..ApplyResult::default()
        };
        for report in reports.into_iter().flatten() {
            match report.status {
                ActionStatus::Succeeded => result.succeeded.push(report),
                ActionStatus::Failed => result.failed.push(report),
                _ => result.skipped.push(report),
            }
        }

        info!(
            "Apply finished: {} succeeded, {} failed, {} skipped{}",
            result.succeeded.len(),
            result.failed.len(),
            result.skipped.len(),
            if result.cancelled { " (cancelled)" } else { "" }
        );

        let state = worker.state.lock().await.clone();
        Ok((result, state))
    }

    async fn run_layers(
        &self,
        plan: &ExecutionPlan,
        worker: &Arc<Worker>,
        semaphore: &Arc<Semaphore>,
        cancel: &CancellationToken,
        statuses: &mut [ActionStatus],
        reports: &mut [Option<ActionReport>],
    ) -> Result<()> {
        for (depth, layer) in plan.layers.iter().enumerate() {
            debug!("Starting layer {depth} ({} actions)", layer.len());
            let mut tasks = JoinSet::new();
            let mut task_actions = HashMap::new();

            for &id in layer {
                let Some(action) = plan.action(id) else {
                    return Err(ConvergentError::internal(format!("plan has no action {id}")));
                };

                if let Some(reason) = blocked_by(action, statuses, plan) {
                    warn!("Skipping {}: {reason}", action.description());
                    statuses[id].transition(id, ActionStatus::Skipped)?;
                    reports[id] = Some(report(action, ActionStatus::Skipped, 0, None, Some(reason)));
                    continue;
                }

                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    permit = semaphore.clone().acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    statuses[id].transition(id, ActionStatus::Skipped)?;
                    reports[id] = Some(report(
                        action,
                        ActionStatus::Skipped,
                        0,
                        None,
                        Some(String::from("run cancelled")),
                    ));
                    continue;
                };

                statuses[id].transition(id, ActionStatus::Running)?;
                debug!("Starting action {id}: {}", action.description());

                let worker = worker.clone();
                let action = action.clone();
                let handle = tasks.spawn(async move {
                    let outcome = worker.run(&action).await;
                    drop(permit);
                    outcome
                });
                task_actions.insert(handle.id(), id);
            }

            while let Some(joined) = tasks.join_next_with_id().await {
                let outcome = match joined {
                    Ok((_, outcome)) => outcome,
                    Err(e) => {
                        let Some(&id) = task_actions.get(&e.id()) else {
                            return Err(ConvergentError::internal(format!("unknown task failed: {e}")));
                        };
                        Outcome {
                            id,
                            attempts: 0,
                            result: Err(format!("worker aborted: {e}")),
                        }
                    }
                };

                let Some(action) = plan.action(outcome.id) else {
                    return Err(ConvergentError::internal(format!("plan has no action {}", outcome.id)));
                };

                let (status, remote_id, error) = match outcome.result {
                    Ok(remote_id) => {
                        info!("{} succeeded", action.description());
                        (ActionStatus::Succeeded, remote_id, None)
                    }
                    Err(message) => {
                        error!("{} failed: {message}", action.description());
                        (ActionStatus::Failed, action.remote_id.clone(), Some(message))
                    }
                };

                statuses[outcome.id].transition(outcome.id, status)?;
                reports[outcome.id] = Some(report(action, status, outcome.attempts, remote_id, error));
            }
        }

        Ok(())
    }
}

/// Returns why `action` cannot start, if any prerequisite did not succeed.
fn blocked_by(action: &PlannedAction, statuses: &[ActionStatus], plan: &ExecutionPlan) -> Option<String> {
    action.prerequisites.iter().find_map(|&p| match statuses.get(p) {
        Some(ActionStatus::Succeeded) => None,
        Some(status) => {
            let name = plan.action(p).map_or("?", |a| a.resource_name.as_str());
            Some(format!("prerequisite {p} ({name}) {status}"))
        }
        None => Some(format!("prerequisite {p} is not in the plan")),
    })
}

fn report(
    action: &PlannedAction,
    status: ActionStatus,
    attempts: u32,
    remote_id: Option<String>,
    error: Option<String>,
) -> ActionReport {
    ActionReport {
        id: action.id,
        kind: action.kind,
        resource_name: action.resource_name.clone(),
        resource_type: action.resource_type.clone(),
        status,
        attempts,
        remote_id,
        error,
    }
}

impl Worker {
    async fn run(&self, action: &PlannedAction) -> Outcome {
        let (attempts, result) = match action.kind {
            ActionKind::NoOp => (0, self.record_noop(action).await),
            ActionKind::Create => self.create(action).await,
            ActionKind::Update => self.update(action).await,
            ActionKind::Delete => self.delete(action).await,
        };

        Outcome {
            id: action.id,
            attempts,
            result: result.map_err(|e| e.to_string()),
        }
    }

    async fn create(&self, action: &PlannedAction) -> (u32, Result<Option<String>>) {
        let Some(descriptor) = &action.descriptor else {
            return (0, Err(ConvergentError::internal("create without descriptor")));
        };
        let body = map_to_json(&descriptor.attributes);
        let label = action.description();

        let attempted = self
            .retry
            .run(&label, || self.client.create(&action.resource_type, &body))
            .await;
        let attempts = attempted.attempts;

        let created = match attempted.result {
            Ok(created) => created,
            Err(e) => return (attempts, Err(self.exhausted(action, attempts, e))),
        };

        let attributes = self.convert(&action.resource_type, &created.attributes);
        let entry = ResourceState::new(&action.resource_name, &action.resource_type, &created.remote_id, attributes)
            .with_dependencies(dependencies(descriptor));

        let saved = self.write(|state| state.upsert(entry)).await;
        (attempts, saved.map(|()| Some(created.remote_id)))
    }

    async fn update(&self, action: &PlannedAction) -> (u32, Result<Option<String>>) {
        let (Some(descriptor), Some(remote_id)) = (&action.descriptor, &action.remote_id) else {
            return (0, Err(ConvergentError::internal("update without descriptor or remote id")));
        };
        let body = map_to_json(&descriptor.attributes);
        let label = action.description();

        let attempted = self
            .retry
            .run(&label, || self.client.update(&action.resource_type, remote_id, &body))
            .await;
        let attempts = attempted.attempts;

        let reported = match attempted.result {
            Ok(value) => value,
            Err(e) => return (attempts, Err(self.exhausted(action, attempts, e))),
        };

        let attributes = self.convert(&action.resource_type, &reported);
        let dependencies = dependencies(descriptor);
        let saved = self
            .write(|state| {
                let entry = match state.get(&action.resource_name) {
                    Some(existing) => {
                        let mut entry = existing.clone();
                        entry.refresh(attributes);
                        entry.dependencies = dependencies;
                        entry
                    }
                    None => ResourceState::new(&action.resource_name, &action.resource_type, remote_id, attributes)
                        .with_dependencies(dependencies),
                };
                state.upsert(entry);
            })
            .await;
        (attempts, saved.map(|()| Some(remote_id.clone())))
    }

    async fn delete(&self, action: &PlannedAction) -> (u32, Result<Option<String>>) {
        let Some(remote_id) = &action.remote_id else {
            return (0, Err(ConvergentError::internal("delete without remote id")));
        };
        let label = action.description();

        let attempted = self
            .retry
            .run(&label, || self.client.delete(&action.resource_type, remote_id))
            .await;
        let attempts = attempted.attempts;

        match attempted.result {
            Ok(()) => {}
            Err(RemoteError::NotFound { .. }) => {
                info!("{} was already gone", action.description());
            }
            Err(e) => return (attempts, Err(self.exhausted(action, attempts, e))),
        }

        let saved = self
            .write(|state| {
                state.remove(&action.resource_name);
            })
            .await;
        (attempts, saved.map(|()| None))
    }

    /// Records current dependencies for an unchanged resource, if they moved.
    async fn record_noop(&self, action: &PlannedAction) -> Result<Option<String>> {
        let Some(descriptor) = &action.descriptor else {
            return Ok(action.remote_id.clone());
        };
        let wanted = dependencies(descriptor);

        let mut state = self.state.lock().await;
        let stale = state
            .get(&action.resource_name)
            .is_some_and(|entry| entry.dependencies != wanted);
        if stale {
            if let Some(mut entry) = state.get(&action.resource_name).cloned() {
                entry.dependencies = wanted;
                state.upsert(entry);
                self.store.save(&state).await?;
            }
        }
        Ok(action.remote_id.clone())
    }

    /// Applies `change` to the shared state and persists it immediately.
    async fn write(&self, change: impl FnOnce(&mut ObservedState)) -> Result<()> {
        let mut state = self.state.lock().await;
        change(&mut *state);
        self.store.save(&state).await
    }

    fn convert(&self, resource_type: &str, value: &serde_json::Value) -> AttributeMap {
        match self.schemas.get(resource_type) {
            Some(schema) => schema.convert(value),
            None => map_from_json(value, &|_: &str| false),
        }
    }

    fn exhausted(&self, action: &PlannedAction, attempts: u32, error: RemoteError) -> ConvergentError {
        if error.is_transient() && attempts >= self.retry.max_attempts {
            ApplyError::MaxRetriesExceeded {
                attempts,
                resource: action.resource_name.clone(),
                last_error: error.to_string(),
            }
            .into()
        } else {
            error.into()
        }
    }
}

fn dependencies(descriptor: &ResourceDescriptor) -> Vec<String> {
    descriptor.dependencies().into_iter().map(String::from).collect()
}

impl ApplyResult {
    /// Returns true when no action failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of actions covered.
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }

    /// Process exit code: non-zero when any action failed.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        u8::from(!self.is_success())
    }

    /// Converts a run with failures into an error.
    ///
    /// # Errors
    ///
    /// Returns `ActionsFailed` when at least one action failed.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ApplyError::ActionsFailed {
                failed: self.failed.len(),
                total: self.total(),
            }
            .into())
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::Planner;
    use crate::remote::{InMemoryRemote, RemoteOp};
    use crate::resource::{AttributeValue, ResourceSchema};
    use crate::state::MemoryStateStore;

    fn chain_schemas() -> SchemaRegistry {
        let mut schemas = SchemaRegistry::new();
        schemas.insert(ResourceSchema::new("node"));
        schemas
    }

    fn node(name: &str) -> ResourceDescriptor {
        ResourceDescriptor::new("node", name).with_attribute("label", AttributeValue::String(name.to_string()))
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), 2.0, Duration::from_millis(2))
    }

    fn executor(remote: &Arc<InMemoryRemote>, store: &Arc<MemoryStateStore>, schemas: SchemaRegistry) -> PlanExecutor {
        PlanExecutor::new(remote.clone(), store.clone(), Arc::new(schemas)).with_retry(fast_retry())
    }

    #[test]
    fn test_status_transitions() {
        let mut status = ActionStatus::Pending;
        status.transition(0, ActionStatus::Running).expect("start");
        status.transition(0, ActionStatus::Succeeded).expect("finish");
        assert!(status.is_terminal());
        assert!(status.transition(0, ActionStatus::Skipped).is_err());

        let mut running = ActionStatus::Running;
        assert!(matches!(
            running.transition(3, ActionStatus::Skipped),
            Err(ConvergentError::Apply(ApplyError::InvalidTransition { action: 3, .. }))
        ));
    }

    #[tokio::test]
    async fn test_each_success_is_saved_immediately() {
        let schemas = chain_schemas();
        let declared = vec![node("a"), node("b").depending_on("a"), node("c")];
        let plan = Planner::new(&schemas).plan(&declared, &ObservedState::new("p", "e"), "h").expect("plan");

        let remote = Arc::new(InMemoryRemote::new());
        let store = Arc::new(MemoryStateStore::new());
        let (result, state) = executor(&remote, &store, schemas)
            .execute(&plan, ObservedState::new("p", "e"))
            .await
            .expect("execute");

        assert!(result.is_success());
        assert_eq!(result.succeeded.len(), 3);
        assert_eq!(store.save_count(), 3);
        assert_eq!(state.get("b").map(|r| r.dependencies.clone()), Some(vec![String::from("a")]));
        assert_eq!(remote.len().await, 3);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let schemas = chain_schemas();
        let plan = Planner::new(&schemas).plan(&[node("a")], &ObservedState::new("p", "e"), "h").expect("plan");

        let remote = Arc::new(InMemoryRemote::new());
        remote.fail_next("node", RemoteOp::Create, RemoteError::RateLimited { retry_after_secs: 0 }).await;
        remote.fail_next("node", RemoteOp::Create, RemoteError::Timeout { message: String::from("slow") }).await;
        let store = Arc::new(MemoryStateStore::new());

        let (result, _) = executor(&remote, &store, schemas)
            .execute(&plan, ObservedState::new("p", "e"))
            .await
            .expect("execute");

        assert!(result.is_success());
        assert_eq!(result.succeeded[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let schemas = chain_schemas();
        let plan = Planner::new(&schemas).plan(&[node("a")], &ObservedState::new("p", "e"), "h").expect("plan");

        let remote = Arc::new(InMemoryRemote::new());
        for _ in 0..5 {
            remote.fail_next("node", RemoteOp::Create, RemoteError::Unavailable { message: String::from("down") }).await;
        }
        let store = Arc::new(MemoryStateStore::new());

        let (result, _) = executor(&remote, &store, schemas)
            .execute(&plan, ObservedState::new("p", "e"))
            .await
            .expect("execute");

        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].attempts, 3);
        assert!(result.failed[0].error.as_deref().is_some_and(|e| e.contains("Maximum retry attempts")));
        assert_eq!(result.exit_code(), 1);
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_but_not_siblings() {
        let schemas = chain_schemas();
        let declared = vec![
            node("base"),
            node("child").depending_on("base"),
            node("grandchild").depending_on("child"),
            node("sibling"),
        ];
        let plan = Planner::new(&schemas).plan(&declared, &ObservedState::new("p", "e"), "h").expect("plan");

        let remote = Arc::new(InMemoryRemote::new());
        remote.fail_next("node", RemoteOp::Create, RemoteError::rejected(400, "bad label")).await;
        let store = Arc::new(MemoryStateStore::new());

        // Parallelism 1 makes "base" the first create to reach the remote.
        let (result, state) = executor(&remote, &store, schemas)
            .with_parallelism(1)
            .execute(&plan, ObservedState::new("p", "e"))
            .await
            .expect("execute");

        let names = |reports: &[ActionReport]| reports.iter().map(|r| r.resource_name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&result.failed), vec!["base"]);
        assert_eq!(names(&result.succeeded), vec!["sibling"]);
        assert_eq!(names(&result.skipped), vec!["child", "grandchild"]);
        assert!(result.skipped.iter().all(|r| r.status == ActionStatus::Skipped && r.attempts == 0));
        assert!(state.contains("sibling"));
        assert!(!state.contains("child"));
        assert!(matches!(result.into_result(), Err(ConvergentError::Apply(ApplyError::ActionsFailed { failed: 1, total: 4 }))));
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let schemas = chain_schemas();
        let declared: Vec<ResourceDescriptor> = (0..8).map(|i| node(&format!("n{i}"))).collect();
        let plan = Planner::new(&schemas).plan(&declared, &ObservedState::new("p", "e"), "h").expect("plan");
        assert_eq!(plan.layers.len(), 1);

        let remote = Arc::new(InMemoryRemote::new().with_latency(Duration::from_millis(20)));
        let store = Arc::new(MemoryStateStore::new());

        let (result, _) = executor(&remote, &store, schemas)
            .with_parallelism(3)
            .execute(&plan, ObservedState::new("p", "e"))
            .await
            .expect("execute");

        assert_eq!(result.succeeded.len(), 8);
        assert!(remote.peak_in_flight() <= 3);
        assert!(remote.peak_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_cancellation_skips_pending_actions() {
        let schemas = chain_schemas();
        let declared = vec![node("a"), node("b").depending_on("a")];
        let plan = Planner::new(&schemas).plan(&declared, &ObservedState::new("p", "e"), "h").expect("plan");

        let remote = Arc::new(InMemoryRemote::new());
        let store = Arc::new(MemoryStateStore::new());
        let executor = executor(&remote, &store, schemas);
        executor.cancellation_token().cancel();

        let (result, state) = executor.execute(&plan, ObservedState::new("p", "e")).await.expect("execute");

        assert!(result.cancelled);
        assert_eq!(result.skipped.len(), 2);
        assert!(result.is_success());
        assert!(state.resources.is_empty());
        assert!(remote.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_lets_running_actions_finish() {
        let schemas = chain_schemas();
        let declared = vec![node("a"), node("b").depending_on("a")];
        let plan = Planner::new(&schemas).plan(&declared, &ObservedState::new("p", "e"), "h").expect("plan");

        let remote = Arc::new(InMemoryRemote::new().with_latency(Duration::from_millis(100)));
        let store = Arc::new(MemoryStateStore::new());

        let (result, state) = executor(&remote, &store, schemas)
            .with_timeout(Some(Duration::from_millis(20)))
            .execute(&plan, ObservedState::new("p", "e"))
            .await
            .expect("execute");

        assert!(result.cancelled);
        assert_eq!(result.succeeded.len(), 1);
        assert_eq!(result.skipped.len(), 1);
        assert!(state.contains("a"));
    }

    #[tokio::test]
    async fn test_delete_of_missing_resource_succeeds() {
        let schemas = chain_schemas();
        let mut state = ObservedState::new("p", "e");
        state.upsert(ResourceState::new("gone", "node", "node-404", AttributeMap::new()));
        let plan = Planner::new(&schemas).plan(&[], &state, "h").expect("plan");

        let remote = Arc::new(InMemoryRemote::new());
        let store = Arc::new(MemoryStateStore::new());

        let (result, state) = executor(&remote, &store, schemas)
            .execute(&plan, state)
            .await
            .expect("execute");

        assert_eq!(result.succeeded.len(), 1);
        assert_eq!(result.succeeded[0].kind, ActionKind::Delete);
        assert!(state.resources.is_empty());
        assert_eq!(store.save_count(), 1);
    }
}
