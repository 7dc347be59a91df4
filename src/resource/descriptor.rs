//! Declared resource descriptors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::Result;

use super::attributes::{resolve_path, AttributeMap, AttributeValue};
use super::schema::{ResourceSchema, SchemaRegistry};

/// Attribute name used for explicit, non-attribute dependencies.
pub const DEPENDS_ON: &str = "depends_on";

/// A declared logical resource and its attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Resource type (e.g. `frontdoor_backend_pool`).
    pub resource_type: String,
    /// Logical name, unique within a plan.
    pub name: String,
    /// Declared attributes.
    pub attributes: AttributeMap,
    /// References to other descriptors.
    pub references: Vec<Reference>,
}

/// An attribute-level reference to another descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Concrete attribute path holding the reference.
    pub attribute: String,
    /// Logical name of the referenced descriptor.
    pub target: String,
    /// Resource type the schema expects the target to have, if constrained.
    #[serde(default)]
    pub target_type: Option<String>,
}

/// Supplies the declared descriptor set.
///
/// The engine never parses configuration syntax itself; anything that can
/// produce descriptors (a YAML file, an HCL front end, a test fixture) plugs
/// in here.
pub trait DescriptorSource {
    /// Produces the declared descriptors, using `schemas` to type attributes.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read.
    fn descriptors(&self, schemas: &SchemaRegistry) -> Result<Vec<ResourceDescriptor>>;
}

impl ResourceDescriptor {
    /// Creates a descriptor with no attributes.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            attributes: AttributeMap::new(),
            references: Vec::new(),
        }
    }

    /// Builds a descriptor from loosely typed JSON attributes.
    ///
    /// When a schema is known it directs set/list typing and reference
    /// extraction; `depends_on` adds explicit references.
    #[must_use]
    pub fn from_json(
        resource_type: &str,
        name: &str,
        attributes: &serde_json::Value,
        depends_on: &[String],
        schema: Option<&ResourceSchema>,
    ) -> Self {
        let fallback = ResourceSchema::new(resource_type);
        let schema = schema.unwrap_or(&fallback);

        let mut descriptor = Self::new(resource_type, name);
        descriptor.attributes = schema.convert(attributes);
        descriptor.references = extract_references(&descriptor.attributes, schema);
        for target in depends_on {
            descriptor.references.push(Reference {
                attribute: String::from(DEPENDS_ON),
                target: target.clone(),
                target_type: None,
            });
        }
        descriptor
    }

    /// Sets an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Adds an explicit dependency on another descriptor.
    #[must_use]
    pub fn depending_on(mut self, target: impl Into<String>) -> Self {
        self.references.push(Reference {
            attribute: String::from(DEPENDS_ON),
            target: target.into(),
            target_type: None,
        });
        self
    }

    /// Returns the distinct logical names this descriptor depends on.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<&str> {
        self.references.iter().map(|r| r.target.as_str()).collect()
    }
}

/// Extracts references from the schema's reference attributes.
///
/// A reference attribute may hold a single name or a list/set of names.
fn extract_references(attributes: &AttributeMap, schema: &ResourceSchema) -> Vec<Reference> {
    let mut references = Vec::new();

    for (path, target_type) in &schema.references {
        for (concrete, found) in resolve_path(attributes, path) {
            match found.value {
                Some(AttributeValue::String(target)) => references.push(Reference {
                    attribute: concrete,
                    target: target.clone(),
                    target_type: Some(target_type.clone()),
                }),
                Some(AttributeValue::List(items) | AttributeValue::Set(items)) => {
                    for (i, item) in items.iter().enumerate() {
                        if let Some(target) = item.as_str() {
                            references.push(Reference {
                                attribute: format!("{concrete}[{i}]"),
                                target: target.to_string(),
                                target_type: Some(target_type.clone()),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
    }

    references
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_references_extracted_from_schema() {
        let registry = SchemaRegistry::builtin().expect("builtin schemas");
        let descriptor = ResourceDescriptor::from_json(
            "frontdoor_routing_rule",
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
            registry.get("frontdoor_routing_rule"),
        );

        let deps: Vec<&str> = descriptor.dependencies().into_iter().collect();
        assert_eq!(deps, vec!["backend-bing", "frontend-endpoint"]);

        let backend_ref = descriptor
            .references
            .iter()
            .find(|r| r.target == "backend-bing")
            .expect("backend reference");
        assert_eq!(backend_ref.attribute, "forwarding_configuration.backend_pool_name");
        assert_eq!(backend_ref.target_type.as_deref(), Some("frontdoor_backend_pool"));
    }

    #[test]
    fn test_explicit_depends_on() {
        let descriptor = ResourceDescriptor::from_json(
            "unknown_type",
            "a",
            &json!({"x": 1}),
            &[String::from("b")],
            None,
        );

        assert_eq!(descriptor.references.len(), 1);
        assert_eq!(descriptor.references[0].attribute, DEPENDS_ON);
        assert!(descriptor.references[0].target_type.is_none());
    }
}
