//! Descriptor validation against schemas.
//!
//! Runs before any graph or diff work so that a bad declared set never
//! reaches the remote.

use std::collections::{BTreeMap, HashSet};
use tracing::warn;

use crate::error::{PlanError, Result};
use crate::resource::{resolve_path, ResourceDescriptor, SchemaRegistry};

/// Validates a declared descriptor set.
#[derive(Debug)]
pub struct DescriptorValidator<'a> {
    schemas: &'a SchemaRegistry,
}

impl<'a> DescriptorValidator<'a> {
    /// Creates a validator over `schemas`.
    #[must_use]
    pub const fn new(schemas: &'a SchemaRegistry) -> Self {
        Self { schemas }
    }

    /// Returns every problem found, in declaration order.
    #[must_use]
    pub fn issues(&self, descriptors: &[ResourceDescriptor]) -> Vec<PlanError> {
        let mut issues = Vec::new();
        let mut seen = HashSet::new();
        let by_name: BTreeMap<&str, &ResourceDescriptor> =
            descriptors.iter().map(|d| (d.name.as_str(), d)).collect();

        for descriptor in descriptors {
            if !seen.insert(descriptor.name.as_str()) {
                issues.push(PlanError::validation(
                    &descriptor.name,
                    "logical name is declared more than once",
                ));
                continue;
            }

            let Some(schema) = self.schemas.get(&descriptor.resource_type) else {
                issues.push(PlanError::validation(
                    &descriptor.name,
                    format!("no schema for resource type '{}'", descriptor.resource_type),
                ));
                continue;
            };

            for path in &schema.required {
                let found = resolve_path(&descriptor.attributes, path);
                if found.is_empty() || found.iter().any(|(_, m)| m.value.is_none_or(|v| v.is_null())) {
                    issues.push(PlanError::validation(
                        &descriptor.name,
                        format!("required attribute '{path}' is missing"),
                    ));
                }
            }

            for reference in &descriptor.references {
                match by_name.get(reference.target.as_str()) {
                    None => issues.push(PlanError::validation(
                        &descriptor.name,
                        format!(
                            "'{}' references '{}', which is not declared",
                            reference.attribute, reference.target
                        ),
                    )),
                    Some(target) => {
                        if let Some(expected) = &reference.target_type
                            && target.resource_type != *expected
                        {
                            issues.push(PlanError::validation(
                                &descriptor.name,
                                format!(
                                    "'{}' must reference a {expected}, but '{}' is a {}",
                                    reference.attribute, reference.target, target.resource_type
                                ),
                            ));
                        }
                    }
                }
            }
        }

        issues
    }

    /// Validates the set, logging every problem.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self, descriptors: &[ResourceDescriptor]) -> Result<()> {
        let issues = self.issues(descriptors);
        for issue in &issues {
            warn!("{issue}");
        }
        match issues.into_iter().next() {
            Some(first) => Err(first.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConvergentError;
    use crate::resource::{AttributeValue, ResourceSchema};
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::builtin().expect("builtin schemas")
    }

    fn descriptor(registry: &SchemaRegistry, resource_type: &str, name: &str, attrs: serde_json::Value) -> ResourceDescriptor {
        ResourceDescriptor::from_json(resource_type, name, &attrs, &[], registry.get(resource_type))
    }

    #[test]
    fn test_valid_frontdoor_set() {
        let schemas = registry();
        let set = vec![
            descriptor(&schemas, "frontdoor_backend_pool", "backend-bing", json!({"backend": [{"address": "www.bing.com"}]})),
            descriptor(&schemas, "frontdoor_frontend_endpoint", "frontend-endpoint", json!({"host_name": "fd.azurefd.net"})),
            descriptor(
                &schemas,
                "frontdoor_routing_rule",
                "routing-rule",
                json!({
                    "accepted_protocols": ["Http", "Https"],
                    "patterns_to_match": ["/*"],
                    "frontend_endpoints": ["frontend-endpoint"],
                    "forwarding_configuration": {"backend_pool_name": "backend-bing"}
                }),
            ),
        ];

        assert!(DescriptorValidator::new(&schemas).issues(&set).is_empty());
    }

    #[test]
    fn test_missing_required_attribute() {
        let schemas = registry();
        let set = vec![descriptor(&schemas, "frontdoor_frontend_endpoint", "fe", json!({"host_name": null}))];

        let err = DescriptorValidator::new(&schemas).validate(&set).expect_err("invalid");
        assert!(err.to_string().contains("host_name"));
    }

    #[test]
    fn test_unknown_type_and_duplicate_name() {
        let schemas = registry();
        let set = vec![
            ResourceDescriptor::new("mystery", "x"),
            ResourceDescriptor::new("mystery", "x"),
        ];

        let issues = DescriptorValidator::new(&schemas).issues(&set);
        assert_eq!(issues.len(), 2);
        assert!(issues[0].to_string().contains("no schema"));
        assert!(issues[1].to_string().contains("more than once"));
    }

    #[test]
    fn test_reference_checks() {
        let mut schemas = SchemaRegistry::new();
        let mut rule = ResourceSchema::new("rule");
        rule.references.insert(String::from("pool"), String::from("pool"));
        schemas.insert(rule);
        schemas.insert(ResourceSchema::new("pool"));
        schemas.insert(ResourceSchema::new("endpoint"));

        let dangling = vec![descriptor(&schemas, "rule", "r", json!({"pool": "missing"}))];
        assert!(matches!(
            DescriptorValidator::new(&schemas).validate(&dangling),
            Err(ConvergentError::Plan(PlanError::Validation { .. }))
        ));

        let wrong_type = vec![
            descriptor(&schemas, "rule", "r", json!({"pool": "e"})),
            ResourceDescriptor::new("endpoint", "e"),
        ];
        let issues = DescriptorValidator::new(&schemas).issues(&wrong_type);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].to_string().contains("must reference a pool"));

        let explicit = vec![
            ResourceDescriptor::new("pool", "p").depending_on("ghost"),
        ];
        assert_eq!(DescriptorValidator::new(&schemas).issues(&explicit).len(), 1);

        let fine = vec![
            ResourceDescriptor::new("pool", "p").with_attribute("weight", AttributeValue::Int(50)),
            ResourceDescriptor::new("endpoint", "e").depending_on("p"),
        ];
        assert!(DescriptorValidator::new(&schemas).issues(&fine).is_empty());
    }
}
