//! Per-resource-type schemas.
//!
//! Schemas are configuration data: which attributes are required, which force
//! a replacement when they change, which arrays are unordered, which
//! attributes the remote computes, and which attributes reference other
//! resources. A built-in set ships with the binary and can be overridden per
//! type from the configuration file.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::error::{ConfigError, ConvergentError, Result};

use super::attributes::{map_from_json, AttributeMap};

/// Built-in schema definitions, one file per resource family.
const BUILTIN_SCHEMAS: [(&str, &str); 3] = [
    ("core", include_str!("../../schemas/core.yaml")),
    ("frontdoor", include_str!("../../schemas/frontdoor.yaml")),
    ("iothub", include_str!("../../schemas/iothub.yaml")),
];

/// Schema for a single resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// Resource type name.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Attribute paths that must be present and non-null.
    #[serde(default)]
    pub required: Vec<String>,
    /// Attribute paths whose change forces delete + create.
    #[serde(default)]
    pub force_new: Vec<String>,
    /// Array paths whose element order is not significant.
    #[serde(default)]
    pub unordered: Vec<String>,
    /// Attribute paths set by the remote and ignored when diffing.
    #[serde(default)]
    pub computed: Vec<String>,
    /// Attribute path to referenced resource type.
    #[serde(default)]
    pub references: BTreeMap<String, String>,
}

/// Registry of schemas keyed by resource type.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, ResourceSchema>,
}

impl ResourceSchema {
    /// Creates an empty schema for a resource type.
    #[must_use]
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ..Self::default()
        }
    }

    /// Returns true if arrays at this normalized path are unordered.
    #[must_use]
    pub fn is_unordered(&self, path: &str) -> bool {
        self.unordered.iter().any(|p| p == path)
    }

    /// Returns true if the attribute at this normalized path is computed.
    #[must_use]
    pub fn is_computed(&self, path: &str) -> bool {
        self.computed.iter().any(|p| covers(p, path))
    }

    /// Returns true if a change at this normalized path forces replacement.
    #[must_use]
    pub fn requires_replacement(&self, path: &str) -> bool {
        self.force_new.iter().any(|p| covers(p, path))
    }

    /// Converts loosely typed JSON attributes into a typed attribute map.
    #[must_use]
    pub fn convert(&self, value: &serde_json::Value) -> AttributeMap {
        map_from_json(value, &|path: &str| self.is_unordered(path))
    }
}

/// True when `path` is `prefix` itself or lies inside it.
fn covers(prefix: &str, path: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
}

impl SchemaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in schemas.
    ///
    /// # Errors
    ///
    /// Returns an error if an embedded schema file is malformed or two files
    /// define the same type.
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        for (family, content) in BUILTIN_SCHEMAS {
            for schema in Self::from_yaml(content)?.schemas.into_values() {
                if registry.contains(&schema.resource_type) {
                    return Err(ConvergentError::Config(ConfigError::DuplicateName {
                        resource_type: format!("{family} schema"),
                        name: schema.resource_type,
                    }));
                }
                registry.insert(schema);
            }
        }
        Ok(registry)
    }

    /// Parses a registry from a YAML list of schemas.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid or a type is defined twice.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let schemas: Vec<ResourceSchema> = serde_yaml::from_str(content).map_err(|e| {
            ConvergentError::Config(ConfigError::ParseError {
                message: format!("Invalid schema YAML: {e}"),
                location: None,
            })
        })?;

        let mut registry = Self::new();
        for schema in schemas {
            if registry.schemas.contains_key(&schema.resource_type) {
                return Err(ConvergentError::Config(ConfigError::DuplicateName {
                    resource_type: String::from("schema"),
                    name: schema.resource_type,
                }));
            }
            registry.insert(schema);
        }
        Ok(registry)
    }

    /// Adds or replaces a schema.
    pub fn insert(&mut self, schema: ResourceSchema) {
        self.schemas.insert(schema.resource_type.clone(), schema);
    }

    /// Overlays another set of schemas on top of this one, type by type.
    pub fn extend(&mut self, schemas: impl IntoIterator<Item = ResourceSchema>) {
        for schema in schemas {
            debug!("Overriding schema for {}", schema.resource_type);
            self.insert(schema);
        }
    }

    /// Looks up the schema for a resource type.
    #[must_use]
    pub fn get(&self, resource_type: &str) -> Option<&ResourceSchema> {
        self.schemas.get(resource_type)
    }

    /// Returns true if the registry knows this resource type.
    #[must_use]
    pub fn contains(&self, resource_type: &str) -> bool {
        self.schemas.contains_key(resource_type)
    }

    /// Returns all known resource types, sorted.
    #[must_use]
    pub fn resource_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.schemas.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Checks that every schema is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns an error if a reference names an unknown type or a path is empty.
    pub fn validate(&self) -> Result<()> {
        for schema in self.schemas.values() {
            let paths = schema
                .required
                .iter()
                .chain(&schema.force_new)
                .chain(&schema.unordered)
                .chain(&schema.computed)
                .chain(schema.references.keys());

            for path in paths {
                if path.is_empty() || path.split('.').any(str::is_empty) {
                    return Err(ConvergentError::Config(ConfigError::InvalidSchema {
                        resource_type: schema.resource_type.clone(),
                        message: format!("malformed attribute path '{path}'"),
                    }));
                }
            }

            for (path, target) in &schema.references {
                if !self.contains(target) {
                    return Err(ConvergentError::Config(ConfigError::InvalidSchema {
                        resource_type: schema.resource_type.clone(),
                        message: format!("reference '{path}' targets unknown type '{target}'"),
                    }));
                }
            }
        }
        Ok(())
    }
}
