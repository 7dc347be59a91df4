//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{EngineConfig, ValidationResult};
use crate::planner::{ActionKind, ActionReport, ActionStatus, ExecutionPlan};
use crate::reconciler::{ApplyOutcome, DriftReport};
use crate::remote::RefreshReport;
use crate::state::{ObservedState, ResourceState};

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
    id: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "After")]
    after: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Apply result row for table display.
#[derive(Tabled)]
struct ActionResultRow {
    #[tabled(rename = "#")]
    id: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// Managed resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Remote ID")]
    remote_id: String,
    #[tabled(rename = "Depends On")]
    dependencies: String,
    #[tabled(rename = "Refreshed")]
    refreshed: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats an execution plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &ExecutionPlan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &ExecutionPlan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - remote matches the declared set.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nExecution Plan\n");
        let _ = write!(output, "   Declared hash: {}\n\n", short(&plan.config_hash));

        let rows: Vec<PlanActionRow> = plan
            .changes()
            .map(|a| PlanActionRow {
                id: a.id,
                action: Self::format_action_kind(a.kind),
                resource_type: a.resource_type.clone(),
                resource: a.resource_name.clone(),
                after: a
                    .prerequisites
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                reason: Self::truncate(&a.reason, 48),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanges:\n");
            for action in plan.changes().filter(|a| !a.changes.is_empty()) {
                let _ = writeln!(output, "   {} {}", Self::format_action_kind(action.kind), action.resource_name);
                for change in &action.changes {
                    let _ = writeln!(output, "       {change}");
                }
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete, {} unchanged\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.delete.to_string().red(),
            summary.noop
        );

        output
    }

    /// Formats the result of an apply or destroy run.
    #[must_use]
    pub fn format_apply(&self, outcome: &ApplyOutcome) -> String {
        match self.format {
            OutputFormat::Json => to_json(outcome),
            OutputFormat::Text => Self::format_apply_text(outcome),
        }
    }

    fn format_apply_text(outcome: &ApplyOutcome) -> String {
        let result = &outcome.result;
        let mut output = String::new();

        if let Some(refresh) = &outcome.refresh {
            output.push_str(&Self::format_refresh_text(refresh));
        }

        let mut reports: Vec<&ActionReport> = result
            .succeeded
            .iter()
            .chain(&result.failed)
            .chain(&result.skipped)
            .filter(|r| r.kind != ActionKind::NoOp)
            .collect();
        reports.sort_by_key(|r| r.id);

        if !reports.is_empty() {
            let rows: Vec<ActionResultRow> = reports
                .into_iter()
                .map(|r| ActionResultRow {
                    id: r.id,
                    action: Self::format_action_kind(r.kind),
                    resource: r.resource_name.clone(),
                    status: Self::format_status(r.status),
                    attempts: r.attempts,
                    detail: r
                        .error
                        .as_deref()
                        .or(r.remote_id.as_deref())
                        .map(|s| Self::truncate(s, 60))
                        .unwrap_or_default(),
                })
                .collect();
            output.push('\n');
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let headline = if result.cancelled {
            format!("{} Apply cancelled", "⚠".yellow())
        } else if result.is_success() {
            format!("{} Apply complete", "✓".green())
        } else {
            format!("{} Apply failed", "✗".red())
        };
        let _ = write!(
            output,
            "\n{headline}: {} succeeded, {} failed, {} skipped\n",
            result.succeeded.len(),
            result.failed.len(),
            result.skipped.len()
        );

        output
    }

    /// Formats a refresh report.
    #[must_use]
    pub fn format_refresh(&self, report: &RefreshReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => Self::format_refresh_text(report),
        }
    }

    fn format_refresh_text(report: &RefreshReport) -> String {
        let mut output = format!(
            "Refreshed {} resources, {} removed outside this tool, {} unreadable\n",
            report.refreshed.len(),
            report.removed.len(),
            report.errors.len()
        );
        for name in &report.removed {
            let _ = writeln!(output, "   {} {name}: no longer exists, will be recreated", "-".red());
        }
        for failure in &report.errors {
            let _ = writeln!(output, "   {} {}: {}", "!".yellow(), failure.name, failure.error);
        }
        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!(
                        "{} No drift detected - remote matches the declared set.\n",
                        "✓".green()
                    );
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for resource in &report.drifted {
                    let _ = writeln!(
                        output,
                        "   {} {} ({})",
                        Self::format_action_kind(resource.action),
                        resource.name,
                        resource.resource_type
                    );
                    for change in &resource.changes {
                        let _ = writeln!(output, "       {change}");
                    }
                }
                for name in &report.removed_remotely {
                    let _ = writeln!(output, "   {} {name} deleted outside this tool", "-".red());
                }
                for error in &report.read_errors {
                    let _ = writeln!(output, "   {} {error}", "!".yellow());
                }
                let _ = write!(
                    output,
                    "\n{} of {} declared resources have drifted.\n",
                    report.drifted.len(),
                    report.total_declared
                );
                output
            }
        }
    }

    /// Formats the state document summary.
    #[must_use]
    pub fn format_state(&self, state: &ObservedState) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Declared hash: {}", short(&state.config_hash));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                        if let Some(error) = &entry.error {
                            let _ = writeln!(output, "         {error}");
                        }
                    }
                }

                output
            }
        }
    }

    /// Formats the managed resources as a table.
    #[must_use]
    pub fn format_resources(&self, state: &ObservedState) -> String {
        match self.format {
            OutputFormat::Json => to_json(&state.resources.values().collect::<Vec<_>>()),
            OutputFormat::Text => {
                if state.resources.is_empty() {
                    return String::from("No managed resources.\n");
                }
                let rows: Vec<ResourceRow> = state.resources.values().map(Self::resource_row).collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats a single state entry.
    #[must_use]
    pub fn format_resource(&self, resource: &ResourceState) -> String {
        match self.format {
            OutputFormat::Json => to_json(resource),
            OutputFormat::Text => format!("{}\n", Table::new([Self::resource_row(resource)])),
        }
    }

    /// Formats a validation outcome with a configuration summary.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &EngineConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "project": config.project.name,
                "environment": config.project.environment,
                "resources": config.resources.len(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Configuration is valid.\n", "✓".green())
                } else {
                    let mut out = format!("{} Configuration is invalid:\n", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(out, "   - {error}");
                    }
                    out
                };

                if show_warnings && !result.warnings.is_empty() {
                    output.push_str("\nWarnings:\n");
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                output.push_str("\nConfiguration summary:\n");
                let _ = writeln!(output, "   Project: {}", config.project.name);
                let _ = writeln!(output, "   Environment: {}", config.project.environment);
                let _ = writeln!(output, "   State backend: {}", config.state.backend);
                let _ = writeln!(output, "   Resources: {}", config.resources.len());
                output
            }
        }
    }

    /// Formats a one-line status message.
    #[must_use]
    pub fn message(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "status": "ok", "message": message })),
            OutputFormat::Text => format!("{} {message}\n", "✓".green()),
        }
    }

    fn resource_row(resource: &ResourceState) -> ResourceRow {
        ResourceRow {
            name: resource.name.clone(),
            resource_type: resource.resource_type.clone(),
            remote_id: Self::truncate(&resource.remote_id, 36),
            dependencies: resource.dependencies.join(", "),
            refreshed: resource.last_refreshed.format("%Y-%m-%d %H:%M").to_string(),
        }
    }

    /// Formats an action kind with color.
    fn format_action_kind(kind: ActionKind) -> String {
        match kind {
            ActionKind::Create => "+create".green().to_string(),
            ActionKind::Update => "~update".yellow().to_string(),
            ActionKind::Delete => "-delete".red().to_string(),
            ActionKind::NoOp => "noop".dimmed().to_string(),
        }
    }

    fn format_status(status: ActionStatus) -> String {
        match status {
            ActionStatus::Succeeded => "succeeded".green().to_string(),
            ActionStatus::Failed => "failed".red().to_string(),
            ActionStatus::Skipped => "skipped".yellow().to_string(),
            other => other.to_string(),
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
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).map_or_else(
        |e| format!("{{\"error\": \"failed to serialize output: {e}\"}}"),
        |s| s + "\n",
    )
}

fn short(hash: &str) -> &str {
    if hash.is_empty() {
        "(none)"
    } else {
        &hash[..8.min(hash.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{ApplyResult, PlannedAction};
    use crate::resource::AttributeMap;

    fn plan_with_create() -> ExecutionPlan {
        let mut plan = ExecutionPlan::empty("0123456789abcdef");
        plan.actions.push(PlannedAction {
            id: 0,
            kind: ActionKind::Create,
            resource_name: String::from("backend-bing"),
            resource_type: String::from("frontdoor_backend_pool"),
            descriptor: None,
            remote_id: None,
            changes: Vec::new(),
            prerequisites: Vec::new(),
            reason: String::from("not in state"),
        });
        plan.layers.push(vec![0]);
        plan
    }

    #[test]
    fn test_empty_plan_text() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let text = formatter.format_plan(&ExecutionPlan::empty("abc"), false);
        assert!(text.contains("No changes required"));
    }

    #[test]
    fn test_plan_text_lists_actions() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let text = formatter.format_plan(&plan_with_create(), true);
        assert!(text.contains("backend-bing"));
        assert!(text.contains("01234567"));
    }

    #[test]
    fn test_plan_json_is_parseable() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let json: serde_json::Value =
            serde_json::from_str(&formatter.format_plan(&plan_with_create(), false)).expect("json");
        assert_eq!(json["actions"][0]["kind"], "create");
        assert_eq!(json["layers"][0][0], 0);
    }

    #[test]
    fn test_apply_json_reports_cancelled() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let outcome = ApplyOutcome {
            plan: plan_with_create(),
            result: ApplyResult {
                cancelled: true,
                ..ApplyResult::default()
            },
            refresh: None,
        };
        let json: serde_json::Value =
            serde_json::from_str(&formatter.format_apply(&outcome)).expect("json");
        assert_eq!(json["result"]["cancelled"], true);
        assert!(json.get("refresh").is_none());
    }

    #[test]
    fn test_resources_table() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let mut state = ObservedState::new("fd", "test");
        assert!(formatter.format_resources(&state).contains("No managed resources"));

        state.upsert(ResourceState::new("backend-bing", "frontdoor_backend_pool", "bp-1", AttributeMap::new()));
        let text = formatter.format_resources(&state);
        assert!(text.contains("backend-bing"));
        assert!(text.contains("bp-1"));
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("ééééééééé", 6), "ééé...");
    }
}
