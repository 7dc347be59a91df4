//! Planning and applying.
//!
//! This module validates the declared set, orders it by reference, diffs it
//! against observed state, builds an execution plan, and applies that plan
//! through the remote client.

mod diff;
mod executor;
mod graph;
mod plan;
mod validate;

pub use diff::{DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use executor::{ActionReport, ActionStatus, ApplyResult, PlanExecutor, DEFAULT_PARALLELISM};
pub use graph::DependencyGraph;
pub use plan::{ActionKind, ExecutionPlan, PlanSummary, PlannedAction, Planner};
pub use validate::DescriptorValidator;
