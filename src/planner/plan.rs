//! Execution plan types and construction.
//!
//! The planner validates the declared set, orders it by reference, diffs it
//! against observed state and turns the diffs into actions with explicit
//! prerequisites. Action ids are positions in a valid execution order, and
//! every prerequisite id is lower than the id of the action that needs it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::error::Result;
use crate::resource::{AttributeChange, ResourceDescriptor, SchemaRegistry};
use crate::state::ObservedState;

use super::diff::{DiffEngine, DiffType, ResourceDiff};
use super::graph::DependencyGraph;
use super::validate::DescriptorValidator;

/// A complete execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the declared set this plan is based on.
    pub config_hash: String,
    /// Planned actions in execution order.
    pub actions: Vec<PlannedAction>,
    /// Action ids grouped by dependency layer.
    pub layers: Vec<Vec<usize>>,
}

/// A single planned action.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    /// Position in the plan.
    pub id: usize,
    /// Action kind.
    pub kind: ActionKind,
    /// Logical name.
    pub resource_name: String,
    /// Resource type.
    pub resource_type: String,
    /// Declared descriptor, absent for deletes.
    #[serde(skip)]
    pub descriptor: Option<ResourceDescriptor>,
    /// Remote id, when the resource already exists.
    pub remote_id: Option<String>,
    /// Changed attributes.
    pub changes: Vec<AttributeChange>,
    /// Ids of actions that must succeed first.
    pub prerequisites: Vec<usize>,
    /// Why this action is planned.
    pub reason: String,
}

/// Kinds of planned actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Create a resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Delete a resource.
    Delete,
    /// Nothing to do; kept so the plan covers every resource.
    #[serde(rename = "noop")]
    NoOp,
}

/// Per-kind action counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Creates.
    pub create: usize,
    /// In-place updates.
    pub update: usize,
    /// Deletes.
    pub delete: usize,
    /// Unchanged resources.
    pub noop: usize,
}

/// Builds execution plans.
#[derive(Debug)]
pub struct Planner<'a> {
    schemas: &'a SchemaRegistry,
}

impl<'a> Planner<'a> {
    /// Creates a planner over `schemas`.
    #[must_use]
    pub const fn new(schemas: &'a SchemaRegistry) -> Self {
        Self { schemas }
    }

    /// Plans the actions that take `state` to `declared`.
    ///
    /// Performs no remote calls.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad declared set, or
    /// `CycleDetected` if references form a cycle.
    pub fn plan(
        &self,
        declared: &[ResourceDescriptor],
        state: &ObservedState,
        config_hash: &str,
    ) -> Result<ExecutionPlan> {
        DescriptorValidator::new(self.schemas).validate(declared)?;

        let mut references = DependencyGraph::new();
        for descriptor in declared {
            references.add_node(descriptor.name.as_str());
            for target in descriptor.dependencies() {
                references.add_edge(descriptor.name.as_str(), target);
            }
        }
        let order = references.topological_order()?;
        debug!("Declared order: {}", order.join(", "));

        let by_name: BTreeMap<&str, &ResourceDescriptor> =
            declared.iter().map(|d| (d.name.as_str(), d)).collect();
        let ordered: Vec<ResourceDescriptor> = order
            .iter()
            .filter_map(|name| by_name.get(name).map(|d| (*d).clone()))
            .collect();

        let diff = DiffEngine::new(self.schemas).compute_diff(&ordered, state);
        let actions = build_actions(&diff.diffs, &by_name, state);
        let plan = ExecutionPlan::sequence(actions, config_hash)?;

        let summary = plan.summary();
        info!(
            "Plan: {} to create, {} to update, {} to delete, {} unchanged",
            summary.create, summary.update, summary.delete, summary.noop
        );

        Ok(plan)
    }
}

/// Turns diffs into actions with prerequisites expressed as raw indices.
fn build_actions(
    diffs: &[ResourceDiff],
    declared: &BTreeMap<&str, &ResourceDescriptor>,
    state: &ObservedState,
) -> Vec<PlannedAction> {
    let mut actions: Vec<PlannedAction> = Vec::new();
    let mut main: BTreeMap<&str, usize> = BTreeMap::new();
    let mut deletes: BTreeMap<&str, usize> = BTreeMap::new();

    // Deletes first so that replacement creates can point at them.
    for diff in diffs {
        if matches!(diff.diff_type, DiffType::Delete | DiffType::Replace) {
            let Some(entry) = state.get(&diff.name) else {
                continue;
            };
            let reason = if diff.diff_type == DiffType::Delete {
                String::from("no longer declared")
            } else {
                format!("replacement forced by {}", diff.replaced_by.join(", "))
            };
            deletes.insert(diff.name.as_str(), actions.len());
            actions.push(PlannedAction {
                id: actions.len(),
                kind: ActionKind::Delete,
                resource_name: entry.name.clone(),
                resource_type: entry.resource_type.clone(),
                descriptor: None,
                remote_id: Some(entry.remote_id.clone()),
                changes: Vec::new(),
                prerequisites: Vec::new(),
                reason,
            });
        }
    }

    for diff in diffs {
        let Some(descriptor) = declared.get(diff.name.as_str()) else {
            continue;
        };
        let (kind, reason, remote_id) = match diff.diff_type {
            DiffType::Create => (ActionKind::Create, String::from("not in state"), None),
            DiffType::Replace => (
                ActionKind::Create,
                format!("replacement forced by {}", diff.replaced_by.join(", ")),
                None,
            ),
            DiffType::Update => (
                ActionKind::Update,
                format!("{} attribute(s) changed", diff.changes.len()),
                diff.remote_id.clone(),
            ),
            DiffType::NoChange => (ActionKind::NoOp, String::from("up to date"), diff.remote_id.clone()),
            DiffType::Delete => continue,
        };

        main.insert(diff.name.as_str(), actions.len());
        actions.push(PlannedAction {
            id: actions.len(),
            kind,
            resource_name: diff.name.clone(),
            resource_type: diff.resource_type.clone(),
            descriptor: Some((*descriptor).clone()),
            remote_id,
            changes: diff.changes.clone(),
            prerequisites: Vec::new(),
            reason,
        });
    }

    // Declared actions wait for the actions of what they reference, and a
    // replacement's create waits for its delete.
    for (name, &index) in &main {
        let mut prereqs = BTreeSet::new();
        if let Some(descriptor) = declared.get(name) {
            for target in descriptor.dependencies() {
                if let Some(&p) = main.get(target) {
                    prereqs.insert(p);
                }
            }
        }
        if let Some(&d) = deletes.get(name) {
            prereqs.insert(d);
        }
        actions[index].prerequisites = prereqs.into_iter().collect();
    }

    // A delete waits for the deletes of entries that depended on it; a pure
    // delete also waits for declared resources that used to depend on it to
    // move their references away.
    for (name, &index) in &deletes {
        let pure = !main.contains_key(name);
        let mut prereqs = BTreeSet::new();
        for dependent in state.dependents_of(name) {
            if let Some(&d) = deletes.get(dependent) {
                prereqs.insert(d);
            }
            if pure {
                if let Some(&m) = main.get(dependent) {
                    prereqs.insert(m);
                }
            }
        }
        actions[index].prerequisites = prereqs.into_iter().collect();
    }

    actions
}

impl ExecutionPlan {
    /// Orders raw actions into layers and renumbers them so that ids follow
    /// execution order.
    fn sequence(actions: Vec<PlannedAction>, config_hash: &str) -> Result<Self> {
        let mut graph = DependencyGraph::new();
        for action in &actions {
            graph.add_node(action.id);
            for &p in &action.prerequisites {
                graph.add_edge(action.id, p);
            }
        }
        let raw_layers = graph.layers()?;

        let mut renumber = vec![0usize; actions.len()];
        let mut next = 0;
        for layer in &raw_layers {
            for &raw in layer {
                renumber[raw] = next;
                next += 1;
            }
        }

        let mut slots: Vec<Option<PlannedAction>> = vec![None; actions.len()];
        for mut action in actions {
            let id = renumber[action.id];
            action.id = id;
            action.prerequisites = action.prerequisites.iter().map(|p| renumber[*p]).collect();
            action.prerequisites.sort_unstable();
            slots[id] = Some(action);
        }

        let layers = raw_layers
            .iter()
            .map(|layer| layer.iter().map(|raw| renumber[*raw]).collect())
            .collect();

        Ok(Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            actions: slots.into_iter().flatten().collect(),
            layers,
        })
    }

    /// Creates an empty plan.
    #[must_use]
    pub fn empty(config_hash: &str) -> Self {
        Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            actions: Vec::new(),
            layers: Vec::new(),
        }
    }

    /// Returns true if nothing needs to change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.iter().all(|a| a.kind == ActionKind::NoOp)
    }

    /// Returns the number of actions, no-ops included.
    #[must_use]
    pub const fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Counts actions per kind.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        self.actions
            .iter()
            .fold(PlanSummary::default(), |mut summary, action| {
                match action.kind {
                    ActionKind::Create => summary.create += 1,
                    ActionKind::Update => summary.update += 1,
                    ActionKind::Delete => summary.delete += 1,
                    ActionKind::NoOp => summary.noop += 1,
                }
                summary
            })
    }

    /// Gets an action by id.
    #[must_use]
    pub fn action(&self, id: usize) -> Option<&PlannedAction> {
        self.actions.get(id)
    }

    /// Gets the actions that list `id` as a prerequisite.
    #[must_use]
    pub fn dependent_actions(&self, id: usize) -> Vec<&PlannedAction> {
        self.actions
            .iter()
            .filter(|a| a.prerequisites.contains(&id))
            .collect()
    }

    /// Actions that change something.
    pub fn changes(&self) -> impl Iterator<Item = &PlannedAction> {
        self.actions.iter().filter(|a| a.kind != ActionKind::NoOp)
    }
}

impl PlannedAction {
    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match self.kind {
            ActionKind::Create => format!("Create {} '{}'", self.resource_type, self.resource_name),
            ActionKind::Update => format!("Update {} '{}'", self.resource_type, self.resource_name),
            ActionKind::Delete => format!("Delete {} '{}'", self.resource_type, self.resource_name),
            ActionKind::NoOp => format!("No change for '{}'", self.resource_name),
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.noop
        )
    }
}

impl std::fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.resource_name)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Execution Plan ({} actions):", self.actions.len())?;
        for action in self.changes() {
            write!(f, "  {}. {action}", action.id)?;
            if !action.prerequisites.is_empty() {
                let after: Vec<String> = action.prerequisites.iter().map(ToString::to_string).collect();
                write!(f, " after {}", after.join(", "))?;
            }
            writeln!(f)?;
            for change in &action.changes {
                writeln!(f, "       {change}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConvergentError, PlanError};
    use crate::resource::{AttributeValue, ResourceSchema};
    use crate::state::ResourceState;
    use serde_json::json;

    fn schemas() -> SchemaRegistry {
        SchemaRegistry::builtin().expect("builtin schemas")
    }

    fn frontdoor(schemas: &SchemaRegistry) -> Vec<ResourceDescriptor> {
        let d = |t: &str, n: &str, a: serde_json::Value| ResourceDescriptor::from_json(t, n, &a, &[], schemas.get(t));
        vec![
            d(
                "frontdoor_routing_rule",
                "routing-rule",
                json!({
                    "accepted_protocols": ["Http", "Https"],
                    "patterns_to_match": ["/*"],
                    "frontend_endpoints": ["frontend-endpoint"],
                    "forwarding_configuration": {"backend_pool_name": "backend-bing"}
                }),
            ),
            d("frontdoor_backend_pool", "backend-bing", json!({"backend": [{"address": "www.bing.com", "http_port": 80}]})),
            d("frontdoor_frontend_endpoint", "frontend-endpoint", json!({"host_name": "example.azurefd.net"})),
        ]
    }

    fn state_from(applied: &[ResourceDescriptor]) -> ObservedState {
        let mut state = ObservedState::new("fd", "test");
        for d in applied {
            state.upsert(
                ResourceState::new(&d.name, &d.resource_type, &format!("{}-id", d.name), d.attributes.clone())
                    .with_dependencies(d.dependencies().into_iter().map(String::from).collect()),
            );
        }
        state
    }

    #[test]
    fn test_first_plan_creates_dependencies_first() {
        let schemas = schemas();
        let declared = frontdoor(&schemas);
        let plan = Planner::new(&schemas)
            .plan(&declared, &ObservedState::new("fd", "test"), "h")
            .expect("plan");

        assert_eq!(plan.summary(), PlanSummary { create: 3, ..PlanSummary::default() });
        let names: Vec<&str> = plan.actions.iter().map(|a| a.resource_name.as_str()).collect();
        assert_eq!(names, vec!["backend-bing", "frontend-endpoint", "routing-rule"]);
        assert_eq!(plan.actions[2].prerequisites, vec![0, 1]);
        assert_eq!(plan.layers, vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn test_identical_state_is_all_noop() {
        let schemas = schemas();
        let declared = frontdoor(&schemas);
        let state = state_from(&declared);

        let plan = Planner::new(&schemas).plan(&declared, &state, "h").expect("plan");
        assert!(plan.is_empty());
        assert_eq!(plan.summary().noop, 3);
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut schemas = SchemaRegistry::new();
        schemas.insert(ResourceSchema::new("node"));
        let declared = vec![
            ResourceDescriptor::new("node", "a").depending_on("b"),
            ResourceDescriptor::new("node", "b").depending_on("a"),
        ];

        match Planner::new(&schemas).plan(&declared, &ObservedState::new("p", "e"), "h") {
            Err(ConvergentError::Plan(PlanError::CycleDetected { cycle })) => assert_eq!(cycle, "a -> b -> a"),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_removed_resource_is_deleted_after_its_dependents() {
        let schemas = schemas();
        let declared = frontdoor(&schemas);
        let state = state_from(&declared);

        // Drop the routing rule and the backend pool it referenced.
        let remaining: Vec<ResourceDescriptor> = declared
            .into_iter()
            .filter(|d| d.name == "frontend-endpoint")
            .collect();

        let plan = Planner::new(&schemas).plan(&remaining, &state, "h").expect("plan");
        assert_eq!(plan.summary(), PlanSummary { delete: 2, noop: 1, ..PlanSummary::default() });

        let rule_delete = plan.actions.iter().find(|a| a.resource_name == "routing-rule").expect("rule");
        let pool_delete = plan.actions.iter().find(|a| a.resource_name == "backend-bing").expect("pool");
        assert_eq!(rule_delete.kind, ActionKind::Delete);
        assert!(pool_delete.prerequisites.contains(&rule_delete.id));
        assert!(rule_delete.id < pool_delete.id);
    }

    #[test]
    fn test_replacement_is_delete_then_create() {
        let schemas = schemas();
        let declared = frontdoor(&schemas);
        let state = state_from(&declared);

        let changed: Vec<ResourceDescriptor> = declared
            .into_iter()
            .map(|d| {
                if d.name == "frontend-endpoint" {
                    d.with_attribute("host_name", AttributeValue::String(String::from("other.azurefd.net")))
                } else {
                    d
                }
            })
            .collect();

        let plan = Planner::new(&schemas).plan(&changed, &state, "h").expect("plan");
        let for_endpoint: Vec<&PlannedAction> = plan
            .actions
            .iter()
            .filter(|a| a.resource_name == "frontend-endpoint")
            .collect();

        assert_eq!(for_endpoint.len(), 2);
        assert_eq!(for_endpoint[0].kind, ActionKind::Delete);
        assert_eq!(for_endpoint[1].kind, ActionKind::Create);
        assert!(for_endpoint[1].prerequisites.contains(&for_endpoint[0].id));
        assert!(for_endpoint[1].reason.contains("host_name"));
    }

    fn iothub(schemas: &SchemaRegistry, sku: &str, routes: &[&str]) -> Vec<ResourceDescriptor> {
        let routes: Vec<serde_json::Value> = routes
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "source": "DeviceMessages",
                    "condition": "true",
                    "endpoint_names": [name],
                    "enabled": true
                })
            })
            .collect();
        let tier = if sku.starts_with('B') { "Basic" } else { "Standard" };
        let d = |t: &str, n: &str, a: serde_json::Value| ResourceDescriptor::from_json(t, n, &a, &[], schemas.get(t));
        vec![
            d("resource_group", "acctestRG", json!({"location": "westeurope"})),
            d(
                "iothub",
                "hub",
                json!({
                    "location": "westeurope",
                    "resource_group_name": "acctestRG",
                    "sku": {"name": sku, "tier": tier, "capacity": 1},
                    "ip_filter_rule": [{"name": "test", "ip_mask": "10.0.0.0/31", "action": "Accept"}],
                    "fallback_route": {"source": "DeviceMessages", "endpoint_names": ["events"], "enabled": true},
                    "route": routes,
                    "tags": {"purpose": "testing"}
                }),
            ),
        ]
    }

    #[test]
    fn test_iothub_sku_and_route_order_update_in_place() {
        let schemas = schemas();
        let applied = iothub(&schemas, "B1", &["export", "export2"]);
        let state = state_from(&applied);

        let plan = Planner::new(&schemas).plan(&applied, &state, "h").expect("plan");
        assert!(plan.is_empty());
        assert_eq!(applied[1].dependencies().into_iter().collect::<Vec<_>>(), vec!["acctestRG"]);

        let standard = iothub(&schemas, "S1", &["export", "export2"]);
        let plan = Planner::new(&schemas).plan(&standard, &state, "h").expect("plan");
        assert_eq!(plan.summary(), PlanSummary { update: 1, noop: 1, ..PlanSummary::default() });
        let update = plan.changes().next().expect("update");
        assert_eq!(update.resource_name, "hub");
        let paths: Vec<&str> = update.changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["sku.name", "sku.tier"]);

        let reordered = iothub(&schemas, "B1", &["export2", "export"]);
        let plan = Planner::new(&schemas).plan(&reordered, &state, "h").expect("plan");
        assert_eq!(plan.summary(), PlanSummary { update: 1, noop: 1, ..PlanSummary::default() });
        let update = plan.changes().next().expect("update");
        assert!(update.changes.iter().all(|c| c.path.starts_with("route[")));
    }

    #[test]
    fn test_iothub_location_change_is_replacement() {
        let schemas = schemas();
        let applied = iothub(&schemas, "S1", &["export"]);
        let state = state_from(&applied);

        let moved: Vec<ResourceDescriptor> = applied
            .into_iter()
            .map(|d| {
                if d.name == "hub" {
                    d.with_attribute("location", AttributeValue::String(String::from("northeurope")))
                } else {
                    d
                }
            })
            .collect();

        let plan = Planner::new(&schemas).plan(&moved, &state, "h").expect("plan");
        assert_eq!(plan.summary(), PlanSummary { create: 1, delete: 1, noop: 1, ..PlanSummary::default() });
    }
}
