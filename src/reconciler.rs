//! Reconciler: the engine's top-level operations.
//!
//! This module ties the pieces together. Each mutating operation takes the
//! state lock, loads the observed state, does its work through the planner,
//! the apply engine or the reader, records a history entry and releases the
//! lock again, even when the work failed.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, EngineConfig};
use crate::error::{ConvergentError, Result, StateError};
use crate::planner::{ActionKind, ApplyResult, ExecutionPlan, PlanExecutor, Planner, DEFAULT_PARALLELISM};
use crate::remote::{RefreshReport, RemoteClient, ResourceReader, RetryPolicy};
use crate::resource::{AttributeChange, DescriptorSource, ResourceDescriptor, SchemaRegistry};
use crate::state::{HistoryEntry, LockInfo, ObservedState, Operation, ResourceState, StateStore};

/// Orchestrates plan, apply, refresh, drift, import and destroy runs.
pub struct Reconciler {
    project: String,
    environment: String,
    declared: Vec<ResourceDescriptor>,
    schemas: Arc<SchemaRegistry>,
    client: Arc<dyn RemoteClient>,
    store: Arc<dyn StateStore>,
    hasher: ConfigHasher,
    retry: RetryPolicy,
    parallelism: usize,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    lock_holder: String,
}

/// Result of an apply or destroy run.
#[derive(Debug, Serialize)]
pub struct ApplyOutcome {
    /// The plan that was executed.
    pub plan: ExecutionPlan,
    /// Per-action results.
    pub result: ApplyResult,
    /// Refresh performed before planning, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh: Option<RefreshReport>,
}

/// Report of drift detection.
#[derive(Debug, Serialize)]
pub struct DriftReport {
    /// Whether drift was detected.
    pub has_drift: bool,
    /// Resources whose remote state no longer matches the declared set.
    pub drifted: Vec<DriftedResource>,
    /// Entries the remote no longer has.
    pub removed_remotely: Vec<String>,
    /// Entries that could not be read.
    pub read_errors: Vec<String>,
    /// Number of declared resources.
    pub total_declared: usize,
    /// Number of managed resources before the refresh.
    pub total_managed: usize,
}

/// A single drifted resource.
#[derive(Debug, Serialize)]
pub struct DriftedResource {
    /// Logical name.
    pub name: String,
    /// Resource type.
    pub resource_type: String,
    /// Action the next apply would take.
    pub action: ActionKind,
    /// Differing attributes.
    pub changes: Vec<AttributeChange>,
}

impl Reconciler {
    /// Creates a reconciler for an explicit declared set.
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        environment: impl Into<String>,
        declared: Vec<ResourceDescriptor>,
        schemas: Arc<SchemaRegistry>,
        client: Arc<dyn RemoteClient>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            project: project.into(),
            environment: environment.into(),
            declared,
            schemas,
            client,
            store,
            hasher: ConfigHasher::new(),
            retry: RetryPolicy::default(),
            parallelism: DEFAULT_PARALLELISM,
            timeout: None,
            cancel: CancellationToken::new(),
            lock_holder: String::new(),
        }
    }

    /// Creates a reconciler from a loaded configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema set is inconsistent.
    pub fn from_config(
        config: &EngineConfig,
        client: Arc<dyn RemoteClient>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let schemas = config.schema_registry()?;
        let declared = config.descriptors(&schemas)?;

        Ok(Self::new(
            &config.project.name,
            &config.project.environment,
            declared,
            Arc::new(schemas),
            client,
            store,
        )
        .with_retry(config.apply.retry_policy())
        .with_parallelism(config.apply.parallelism)
        .with_timeout(config.apply.timeout()))
    }

    /// Sets the retry policy for remote calls.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the worker pool size per dependency layer.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets the whole-apply timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Uses an externally owned cancellation token (e.g. wired to Ctrl-C).
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the holder id recorded in the state lock.
    #[must_use]
    pub fn with_lock_holder(mut self, holder: impl Into<String>) -> Self {
        self.lock_holder = holder.into();
        self
    }

    /// The declared descriptors.
    #[must_use]
    pub fn declared(&self) -> &[ResourceDescriptor] {
        &self.declared
    }

    /// Hash of the declared set.
    #[must_use]
    pub fn config_hash(&self) -> String {
        self.hasher
            .hash_declared(&self.project, &self.environment, &self.declared)
    }

    /// Loads the observed state, or an empty one for a fresh project.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    pub async fn load_state(&self) -> Result<ObservedState> {
        match self.store.load().await? {
            Some(state) => {
                if state.project != self.project || state.environment != self.environment {
                    warn!(
                        "State belongs to {}/{}, configuration declares {}/{}",
                        state.project, state.environment, self.project, self.environment
                    );
                }
                Ok(state)
            }
            None => {
                debug!("No state found, starting empty");
                Ok(ObservedState::new(&self.project, &self.environment))
            }
        }
    }

    /// Plans against the stored state without contacting the remote.
    ///
    /// # Errors
    ///
    /// Returns a validation or cycle error, or a state read error.
    pub async fn plan(&self) -> Result<ExecutionPlan> {
        let state = self.load_state().await?;
        self.plan_against(&state)
    }

    /// Refreshes a copy of the state, then plans against it.
    ///
    /// Nothing is saved.
    ///
    /// # Errors
    ///
    /// Returns a validation or cycle error, or a state read error.
    pub async fn plan_refreshed(&self) -> Result<(ExecutionPlan, RefreshReport)> {
        let mut state = self.load_state().await?;
        let report = self.reader().refresh(&mut state).await;
        let plan = self.plan_against(&state)?;
        Ok((plan, report))
    }

    /// Plans, then executes the plan.
    ///
    /// With `refresh`, state is re-read and saved first so external
    /// deletions turn into creates.
    ///
    /// # Errors
    ///
    /// Returns an error for lock, state, validation or cycle failures.
    /// Per-action failures are reported in the outcome, not returned.
    pub async fn apply(&self, refresh: bool) -> Result<ApplyOutcome> {
        self.locked(Operation::Apply, || self.apply_locked(refresh))
            .await
    }

    async fn apply_locked(&self, refresh: bool) -> Result<ApplyOutcome> {
        let config_hash = self.config_hash();
        let mut state = self.load_state().await?;

        let refresh = if refresh {
            let report = self.reader().refresh(&mut state).await;
            self.store.save(&state).await?;
            Some(report)
        } else {
            None
        };

        let plan = self.plan_against(&state)?;
        info!("Plan: {}", plan.summary());

        let (result, mut state) = self.executor().execute(&plan, state).await?;

        let touched: Vec<String> = plan.changes().map(|a| a.resource_name.clone()).collect();
        if result.is_success() {
            state.config_hash.clone_from(&config_hash);
            state.add_history(HistoryEntry::new(Operation::Apply, &config_hash, touched));
        } else {
            let message = format!("{} of {} actions failed", result.failed.len(), result.total());
            error!("{message}");
            state.add_history(HistoryEntry::failed(Operation::Apply, &config_hash, touched, &message));
        }
        self.store.save(&state).await?;

        Ok(ApplyOutcome { plan, result, refresh })
    }

    /// Re-reads every managed resource and saves the result.
    ///
    /// # Errors
    ///
    /// Returns an error for lock or state failures.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        self.locked(Operation::Refresh, || async move {
            let mut state = self.load_state().await?;
            let report = self.reader().refresh(&mut state).await;

            let mut touched = report.refreshed.clone();
            touched.extend(report.removed.iter().cloned());
            let entry = if report.is_clean() {
                HistoryEntry::new(Operation::Refresh, &state.config_hash, touched)
            } else {
                let message = format!("{} entries could not be read", report.errors.len());
                HistoryEntry::failed(Operation::Refresh, &state.config_hash, touched, &message)
            };
            state.add_history(entry);
            self.store.save(&state).await?;

            info!(
                "Refreshed {} resources, {} removed, {} errors",
                report.refreshed.len(),
                report.removed.len(),
                report.errors.len()
            );
            Ok(report)
        })
        .await
    }

    /// Compares the live remote against the declared set without applying
    /// or saving anything.
    ///
    /// # Errors
    ///
    /// Returns a validation, cycle or state read error.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!("Checking for drift in {}/{}", self.project, self.environment);

        let mut state = self.load_state().await?;
        let total_managed = state.resources.len();
        let report = self.reader().refresh(&mut state).await;
        let plan = self.plan_against(&state)?;

        let drifted: Vec<DriftedResource> = plan
            .changes()
            .map(|action| DriftedResource {
                name: action.resource_name.clone(),
                resource_type: action.resource_type.clone(),
                action: action.kind,
                changes: action.changes.clone(),
            })
            .collect();

        Ok(DriftReport {
            has_drift: !drifted.is_empty() || !report.removed.is_empty(),
            drifted,
            removed_remotely: report.removed,
            read_errors: report
                .errors
                .into_iter()
                .map(|f| format!("{}: {}", f.name, f.error))
                .collect(),
            total_declared: self.declared.len(),
            total_managed,
        })
    }

    /// Adopts a pre-existing remote resource under `name`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyManaged` if `name` is in state, or a not-found error
    /// if the remote has no such resource.
    pub async fn import(&self, name: &str, resource_type: &str, remote_id: &str) -> Result<ResourceState> {
        self.locked(Operation::Import, || async move {
            let mut state = self.load_state().await?;
            let entry = self
                .reader()
                .import(&state, name, resource_type, remote_id)
                .await?;

            if let Some(declared) = self.declared.iter().find(|d| d.name == name)
                && declared.resource_type != resource_type
            {
                warn!(
                    "Imported {name} as {resource_type}, but it is declared as {}; the next plan will replace it",
                    declared.resource_type
                );
            }

            state.upsert(entry.clone());
            let config_hash = state.config_hash.clone();
            state.add_history(HistoryEntry::new(Operation::Import, &config_hash, vec![name.to_string()]));
            self.store.save(&state).await?;

            info!("Imported {resource_type} '{remote_id}' as {name}");
            Ok(entry)
        })
        .await
    }

    /// Deletes every managed resource, dependents first.
    ///
    /// # Errors
    ///
    /// Returns an error for lock or state failures.
    pub async fn destroy(&self) -> Result<ApplyOutcome> {
        self.locked(Operation::Destroy, || async move {
            let state = self.load_state().await?;
            let plan = Planner::new(&self.schemas).plan(&[], &state, "")?;
            info!("Destroy plan: {}", plan.summary());

            let (result, mut state) = self.executor().execute(&plan, state).await?;

            let touched: Vec<String> = plan.changes().map(|a| a.resource_name.clone()).collect();
            if result.is_success() {
                state.config_hash.clear();
                state.add_history(HistoryEntry::new(Operation::Destroy, "", touched));
            } else {
                let message = format!("{} of {} deletes failed", result.failed.len(), result.total());
                state.add_history(HistoryEntry::failed(Operation::Destroy, "", touched, &message));
            }
            self.store.save(&state).await?;

            Ok(ApplyOutcome {
                plan,
                result,
                refresh: None,
            })
        })
        .await
    }

    /// Checks that every managed resource can still be read.
    ///
    /// # Errors
    ///
    /// Returns `Missing` for the first resource the remote no longer has.
    pub async fn verify_exists(&self) -> Result<()> {
        let state = self.load_state().await?;
        let names = state.names();
        self.reader().verify_exists(&state, &names).await
    }

    /// Checks that none of `entries` can still be read.
    ///
    /// # Errors
    ///
    /// Returns `StillExists` for the first surviving resource.
    pub async fn verify_destroyed(&self, entries: &[ResourceState]) -> Result<()> {
        self.reader().verify_destroyed(entries).await
    }

    /// Removes an entry from state without touching the remote.
    ///
    /// # Errors
    ///
    /// Returns `UnknownResource` if `name` is not managed.
    pub async fn forget(&self, name: &str) -> Result<ResourceState> {
        self.locked(Operation::Forget, || async move {
            let mut state = self.load_state().await?;
            let entry = state.remove(name).ok_or_else(|| {
                ConvergentError::State(StateError::UnknownResource {
                    name: name.to_string(),
                })
            })?;

            let config_hash = state.config_hash.clone();
            state.add_history(HistoryEntry::new(Operation::Forget, &config_hash, vec![name.to_string()]));
            self.store.save(&state).await?;

            info!("Removed {name} from state; the remote resource is untouched");
            Ok(entry)
        })
        .await
    }

    /// Current lock, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    pub async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.store.get_lock_info().await
    }

    /// Releases whatever lock is held, whoever holds it.
    ///
    /// Returns the released lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    pub async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        let lock = self.store.get_lock_info().await?;
        if let Some(lock) = &lock {
            warn!("Force-releasing lock held by {} since {}", lock.holder, lock.acquired_at);
            self.store.release_lock(&lock.lock_id).await?;
        }
        Ok(lock)
    }

    fn plan_against(&self, state: &ObservedState) -> Result<ExecutionPlan> {
        Planner::new(&self.schemas).plan(&self.declared, state, &self.config_hash())
    }

    fn reader(&self) -> ResourceReader {
        ResourceReader::new(self.client.clone(), self.schemas.clone()).with_retry(self.retry.clone())
    }

    fn executor(&self) -> PlanExecutor {
        PlanExecutor::new(self.client.clone(), self.store.clone(), self.schemas.clone())
            .with_retry(self.retry.clone())
            .with_parallelism(self.parallelism)
            .with_timeout(self.timeout)
            .with_cancellation(self.cancel.clone())
    }

    /// Runs `work` while holding the state lock.
    async fn locked<T, F, Fut>(&self, operation: Operation, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.store.acquire_lock(&self.lock_holder).await?;
        debug!("Holding lock {} for {operation}", lock.lock_id);

        let result = work().await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            error!("Failed to release state lock {}: {e}", lock.lock_id);
            if result.is_ok() {
                return Err(e);
            }
        }
        result
    }
}

impl DriftReport {
    /// Returns true if the remote matches the declared set.
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        !self.has_drift
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_drift {
            return write!(f, "No drift detected - remote matches the declared set");
        }

        writeln!(f, "Drift detected:")?;
        for resource in &self.drifted {
            writeln!(f, "  - {} ({}): {}", resource.name, resource.resource_type, resource.action)?;
            for change in &resource.changes {
                writeln!(f, "      {change}")?;
            }
        }
        for name in &self.removed_remotely {
            writeln!(f, "  - {name}: deleted outside this tool")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, PlanError, ReconcileError, RemoteError};
    use crate::remote::{InMemoryRemote, RemoteOp};
    use crate::state::MemoryStateStore;
    use serde_json::json;

    const BACKEND: &str = "frontdoor_backend_pool";
    const ENDPOINT: &str = "frontdoor_frontend_endpoint";
    const RULE: &str = "frontdoor_routing_rule";

    fn frontdoor(schemas: &SchemaRegistry) -> Vec<ResourceDescriptor> {
        vec![
            ResourceDescriptor::from_json(
                RULE,
                "routing-rule",
                &json!({
                    "accepted_protocols": ["Http", "Https"],
                    "patterns_to_match": ["/*"],
                    "frontend_endpoints": ["frontend-endpoint"],
                    "forwarding_configuration": {
                        "forwarding_protocol": "MatchRequest",
                        "backend_pool_name": "backend-bing"
                    }
                }),
                &[],
                schemas.get(RULE),
            ),
            ResourceDescriptor::from_json(
                BACKEND,
                "backend-bing",
                &json!({"backend": [{"address": "www.bing.com", "http_port": 80, "https_port": 443}]}),
                &[],
                schemas.get(BACKEND),
            ),
            ResourceDescriptor::from_json(
                ENDPOINT,
                "frontend-endpoint",
                &json!({"host_name": "fd.example.net"}),
                &[],
                schemas.get(ENDPOINT),
            ),
        ]
    }

    struct Fixture {
        remote: Arc<InMemoryRemote>,
        store: Arc<MemoryStateStore>,
        schemas: Arc<SchemaRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                remote: Arc::new(InMemoryRemote::new()),
                store: Arc::new(MemoryStateStore::new()),
                schemas: Arc::new(SchemaRegistry::builtin().expect("builtin schemas")),
            }
        }

        fn reconciler(&self, declared: Vec<ResourceDescriptor>) -> Reconciler {
            Reconciler::new(
                "frontdoor",
                "test",
                declared,
                self.schemas.clone(),
                self.remote.clone(),
                self.store.clone(),
            )
            .with_retry(RetryPolicy::none())
        }

        fn frontdoor(&self) -> Reconciler {
            self.reconciler(frontdoor(&self.schemas))
        }

        async fn remote_id(&self, name: &str) -> String {
            self.store
                .snapshot()
                .await
                .and_then(|s| s.get(name).map(|r| r.remote_id.clone()))
                .expect("entry in state")
        }
    }

    #[tokio::test]
    async fn test_frontdoor_converges() {
        let fixture = Fixture::new();
        let reconciler = fixture.frontdoor();

        let plan = reconciler.plan().await.expect("plan");
        assert_eq!(plan.summary().create, 3);
        let rule = plan
            .actions
            .iter()
            .find(|a| a.resource_name == "routing-rule")
            .expect("rule action");
        assert_eq!(rule.prerequisites.len(), 2);

        let outcome = reconciler.apply(false).await.expect("apply");
        assert!(outcome.result.is_success());
        assert_eq!(outcome.result.succeeded.len(), 3);

        let calls = fixture.remote.calls().await;
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].resource_type, RULE);

        let state = fixture.store.snapshot().await.expect("state saved");
        assert_eq!(state.names(), vec!["backend-bing", "frontend-endpoint", "routing-rule"]);
        assert_eq!(state.config_hash, reconciler.config_hash());
        assert_eq!(state.history.last().map(|h| h.operation), Some(Operation::Apply));
        assert!(!fixture.store.is_locked().await.expect("lock check"));

        let replan = reconciler.plan().await.expect("replan");
        assert!(replan.is_empty());
        reconciler.verify_exists().await.expect("everything exists");
    }

    #[tokio::test]
    async fn test_external_deletion_becomes_create() {
        let fixture = Fixture::new();
        let reconciler = fixture.frontdoor();
        reconciler.apply(false).await.expect("apply");

        let pool_id = fixture.remote_id("backend-bing").await;
        assert!(fixture.remote.remove_external(BACKEND, &pool_id).await);

        let (plan, report) = reconciler.plan_refreshed().await.expect("plan");
        assert_eq!(report.removed, vec![String::from("backend-bing")]);
        let pool = plan
            .actions
            .iter()
            .find(|a| a.resource_name == "backend-bing")
            .expect("pool action");
        assert_eq!(pool.kind, ActionKind::Create);
        assert_eq!(plan.summary().update, 0);

        // planning on a refreshed copy does not save
        assert!(fixture.store.snapshot().await.expect("state").contains("backend-bing"));

        let outcome = reconciler.apply(true).await.expect("apply");
        assert!(outcome.result.is_success());
        assert_ne!(fixture.remote_id("backend-bing").await, pool_id);
        assert!(reconciler.plan().await.expect("replan").is_empty());
    }

    #[tokio::test]
    async fn test_drift_detection_reports_remote_change() {
        let fixture = Fixture::new();
        let reconciler = fixture.frontdoor();
        reconciler.apply(false).await.expect("apply");

        let report = reconciler.check_drift().await.expect("drift");
        assert!(report.is_converged());

        let rule_id = fixture.remote_id("routing-rule").await;
        fixture
            .remote
            .modify_external(RULE, &rule_id, "patterns_to_match", json!(["/api/*"]))
            .await;

        let saves = fixture.store.save_count();
        let report = reconciler.check_drift().await.expect("drift");
        assert!(report.has_drift);
        assert_eq!(report.drifted.len(), 1);
        assert_eq!(report.drifted[0].name, "routing-rule");
        assert_eq!(report.drifted[0].action, ActionKind::Update);
        assert_eq!(fixture.store.save_count(), saves);
    }

    #[tokio::test]
    async fn test_import_then_plan_is_noop() {
        let fixture = Fixture::new();
        let remote_id = fixture
            .remote
            .seed(ENDPOINT, json!({"host_name": "fd.example.net"}))
            .await;

        let declared: Vec<ResourceDescriptor> = frontdoor(&fixture.schemas)
            .into_iter()
            .filter(|d| d.name == "frontend-endpoint")
            .collect();
        let reconciler = fixture.reconciler(declared);

        let entry = reconciler
            .import("frontend-endpoint", ENDPOINT, &remote_id)
            .await
            .expect("import");
        assert_eq!(entry.remote_id, remote_id);

        let plan = reconciler.plan().await.expect("plan");
        assert!(plan.is_empty());

        let err = reconciler
            .import("frontend-endpoint", ENDPOINT, &remote_id)
            .await
            .expect_err("second import");
        assert!(matches!(
            err,
            ConvergentError::Reconcile(ReconcileError::AlreadyManaged { .. })
        ));
        assert!(!fixture.store.is_locked().await.expect("lock check"));
    }

    #[tokio::test]
    async fn test_import_missing_remote_id() {
        let fixture = Fixture::new();
        let reconciler = fixture.frontdoor();

        let err = reconciler
            .import("frontend-endpoint", ENDPOINT, "nope")
            .await
            .expect_err("missing");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_destroy_then_verify_destroyed() {
        let fixture = Fixture::new();
        let reconciler = fixture.frontdoor();
        reconciler.apply(false).await.expect("apply");

        let before: Vec<ResourceState> = fixture
            .store
            .snapshot()
            .await
            .expect("state")
            .resources
            .into_values()
            .collect();

        let outcome = reconciler.destroy().await.expect("destroy");
        assert!(outcome.result.is_success());
        assert_eq!(outcome.plan.summary().delete, 3);

        let deletes: Vec<String> = fixture
            .remote
            .calls()
            .await
            .into_iter()
            .filter(|c| c.op == RemoteOp::Delete)
            .map(|c| c.resource_type)
            .collect();
        assert_eq!(deletes.first().map(String::as_str), Some(RULE));

        assert!(fixture.remote.is_empty().await);
        assert!(fixture.store.snapshot().await.expect("state").resources.is_empty());
        reconciler.verify_destroyed(&before).await.expect("all gone");
    }

    #[tokio::test]
    async fn test_cycle_aborts_before_remote_calls() {
        let fixture = Fixture::new();
        let declared = vec![
            ResourceDescriptor::new("frontdoor_load_balancing", "a").depending_on("b"),
            ResourceDescriptor::new("frontdoor_load_balancing", "b").depending_on("a"),
        ];
        let reconciler = fixture.reconciler(declared);

        let err = reconciler.apply(false).await.expect_err("cycle");
        assert!(matches!(err, ConvergentError::Plan(PlanError::CycleDetected { .. })));
        assert!(fixture.remote.calls().await.is_empty());
        assert!(!fixture.store.is_locked().await.expect("lock check"));
    }

    #[tokio::test]
    async fn test_failed_apply_records_history() {
        let fixture = Fixture::new();
        fixture
            .remote
            .fail_next(BACKEND, RemoteOp::Create, RemoteError::rejected(400, "bad backend"))
            .await;
        let reconciler = fixture.frontdoor();

        let outcome = reconciler.apply(false).await.expect("apply runs");
        assert_eq!(outcome.result.failed.len(), 1);
        assert_eq!(outcome.result.skipped.len(), 1);
        assert_eq!(outcome.result.exit_code(), 1);

        let state = fixture.store.snapshot().await.expect("state");
        assert!(state.contains("frontend-endpoint"));
        assert!(state.config_hash.is_empty());
        assert_eq!(state.history.last().map(|h| h.success), Some(false));
    }

    #[tokio::test]
    async fn test_lock_held_elsewhere() {
        let fixture = Fixture::new();
        fixture.store.acquire_lock("other-run").await.expect("lock");
        let reconciler = fixture.frontdoor();

        let err = reconciler.apply(false).await.expect_err("locked");
        assert!(matches!(
            err,
            ConvergentError::State(StateError::LockedByOther { ref holder, .. }) if holder == "other-run"
        ));

        let released = reconciler.force_unlock().await.expect("unlock");
        assert_eq!(released.map(|l| l.holder), Some(String::from("other-run")));
        assert!(reconciler.apply(false).await.is_ok());
    }

    #[tokio::test]
    async fn test_forget() {
        let fixture = Fixture::new();
        let reconciler = fixture.frontdoor();
        reconciler.apply(false).await.expect("apply");

        let entry = reconciler.forget("backend-bing").await.expect("forget");
        assert_eq!(entry.resource_type, BACKEND);
        assert_eq!(fixture.remote.len().await, 3);

        let err = reconciler.forget("backend-bing").await.expect_err("unknown");
        assert!(matches!(err, ConvergentError::State(StateError::UnknownResource { .. })));
    }

    #[test]
    fn test_from_config_uses_apply_settings() {
        let yaml = r"
project:
  name: frontdoor
apply:
  parallelism: 2
  max_attempts: 7
  timeout_secs: 30
resources:
  - type: frontdoor_frontend_endpoint
    name: frontend-endpoint
    attributes:
      host_name: fd.example.net
";
        let config: EngineConfig = serde_yaml::from_str(yaml).expect("parse");
        let reconciler = Reconciler::from_config(
            &config,
            Arc::new(InMemoryRemote::new()),
            Arc::new(MemoryStateStore::new()),
        )
        .expect("reconciler");

        assert_eq!(reconciler.parallelism, 2);
        assert_eq!(reconciler.retry.max_attempts, 7);
        assert_eq!(reconciler.timeout, Some(Duration::from_secs(30)));
        assert_eq!(reconciler.declared().len(), 1);
    }

    #[test]
    fn test_from_config_rejects_bad_schema_override() {
        let yaml = r"
project:
  name: frontdoor
schemas:
  - type: frontdoor_frontend_endpoint
    references:
      waf: missing_type
";
        let config: EngineConfig = serde_yaml::from_str(yaml).expect("parse");
        let result = Reconciler::from_config(
            &config,
            Arc::new(InMemoryRemote::new()),
            Arc::new(MemoryStateStore::new()),
        );
        assert!(matches!(
            result,
            Err(ConvergentError::Config(ConfigError::InvalidSchema { .. }))
        ));
    }
}
