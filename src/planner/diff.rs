//! Diff engine for comparing declared descriptors with observed state.
//!
//! The comparison is structural: blocks per key, ordered lists per index,
//! unordered sets as a whole. Computed attributes are skipped on both sides,
//! and a change under a force-new path turns an update into a replacement.

use std::collections::HashSet;
use tracing::debug;

use crate::resource::{
    diff_maps, normalize_path, AttributeChange, ResourceDescriptor, ResourceSchema, SchemaRegistry,
};
use crate::state::{ObservedState, ResourceState};

/// Engine for computing per-resource diffs.
#[derive(Debug)]
pub struct DiffEngine<'a> {
    schemas: &'a SchemaRegistry,
}

/// Difference for a single logical resource.
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    /// Logical name.
    pub name: String,
    /// Declared type, or the state type for deletes.
    pub resource_type: String,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Changed leaf attributes, old value from state.
    pub changes: Vec<AttributeChange>,
    /// Paths that forced a replacement.
    pub replaced_by: Vec<String>,
    /// Remote id from state, when the resource exists.
    pub remote_id: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Not in state; needs to be created.
    Create,
    /// In state with changed attributes that can be updated in place.
    Update,
    /// In state, but a change requires delete then create.
    Replace,
    /// In state but no longer declared.
    Delete,
    /// In state and equal.
    NoChange,
}

/// Complete diff result.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Declared resources in input order, then deletions in name order.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update in place.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl<'a> DiffEngine<'a> {
    /// Creates a diff engine over `schemas`.
    #[must_use]
    pub const fn new(schemas: &'a SchemaRegistry) -> Self {
        Self { schemas }
    }

    /// Computes the diff between the declared set and observed state.
    #[must_use]
    pub fn compute_diff(&self, declared: &[ResourceDescriptor], state: &ObservedState) -> DiffResult {
        let mut diffs = Vec::with_capacity(declared.len());

        for descriptor in declared {
            diffs.push(self.diff_resource(descriptor, state.get(&descriptor.name)));
        }

        let declared_names: HashSet<&str> = declared.iter().map(|d| d.name.as_str()).collect();
        for entry in state.resources.values() {
            if !declared_names.contains(entry.name.as_str()) {
                debug!("{} is no longer declared", entry.name);
                diffs.push(ResourceDiff {
                    name: entry.name.clone(),
                    resource_type: entry.resource_type.clone(),
                    diff_type: DiffType::Delete,
                    changes: Vec::new(),
                    replaced_by: Vec::new(),
                    remote_id: Some(entry.remote_id.clone()),
                });
            }
        }

        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        DiffResult {
            creates: count(DiffType::Create),
            updates: count(DiffType::Update),
            replaces: count(DiffType::Replace),
            deletes: count(DiffType::Delete),
            unchanged: count(DiffType::NoChange),
            diffs,
        }
    }

    /// Computes the diff for one declared resource.
    #[must_use]
    pub fn diff_resource(
        &self,
        descriptor: &ResourceDescriptor,
        prior: Option<&ResourceState>,
    ) -> ResourceDiff {
        let mut diff = ResourceDiff {
            name: descriptor.name.clone(),
            resource_type: descriptor.resource_type.clone(),
            diff_type: DiffType::Create,
            changes: Vec::new(),
            replaced_by: Vec::new(),
            remote_id: prior.map(|p| p.remote_id.clone()),
        };

        let Some(prior) = prior else {
            debug!("{} needs to be created", descriptor.name);
            return diff;
        };

        if prior.resource_type != descriptor.resource_type {
            debug!(
                "{} changed type from {} to {}",
                descriptor.name, prior.resource_type, descriptor.resource_type
            );
            diff.diff_type = DiffType::Replace;
            diff.replaced_by.push(String::from("type"));
            return diff;
        }

        let fallback = ResourceSchema::new(&descriptor.resource_type);
        let schema = self.schemas.get(&descriptor.resource_type).unwrap_or(&fallback);

        diff.changes = diff_maps(&prior.attributes, &descriptor.attributes, &|path: &str| {
            schema.is_computed(path)
        });

        diff.replaced_by = diff
            .changes
            .iter()
            .map(|c| normalize_path(&c.path))
            .filter(|p| schema.requires_replacement(p))
            .collect();
        diff.replaced_by.dedup();

        diff.diff_type = if diff.changes.is_empty() {
            DiffType::NoChange
        } else if diff.replaced_by.is_empty() {
            DiffType::Update
        } else {
            DiffType::Replace
        };

        debug!("{}: {}", descriptor.name, diff.diff_type);
        diff
    }
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.replaces > 0 || self.deletes > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.replaces + self.deletes
    }

    /// Looks up the diff for a logical name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| d.name == name)
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.diff_type)?;
        if !self.changes.is_empty() {
            let fields: Vec<&str> = self.changes.iter().map(|c| c.path.as_str()).collect();
            write!(f, " ({})", fields.join(", "))?;
        }
        Ok(())
    }
}
