//! Configuration validation.
//!
//! Checks settings and declared resources for consistency before anything is
//! planned. Errors stop the run; warnings are reported and ignored.
//! Schema-level checks on descriptors (required attributes, reference
//! targets) belong to the planner.

use crate::error::{ConfigError, ConvergentError, Result};
use std::collections::HashSet;
use tracing::{debug, warn};

use super::spec::{
    ApplyConfig, EngineConfig, ProjectConfig, RemoteConfig, RemoteKind, ResourceConfig,
    StateBackend, StateConfig,
};
use crate::resource::SchemaRegistry;

/// Parallelism above this is accepted but reported.
const HIGH_PARALLELISM: usize = 64;

/// Validator for engine configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates an engine configuration against the schema registry.
    ///
    /// # Errors
    ///
    /// Returns the first error found. Duplicate resource names surface as
    /// [`ConfigError::DuplicateName`].
    pub fn validate(&self, config: &EngineConfig, schemas: &SchemaRegistry) -> Result<ValidationResult> {
        let result = self.check(config, schemas);

        for warning in &result.warnings {
            warn!("{warning}");
        }

        if let Some(duplicate) = find_duplicate(&config.resources) {
            return Err(ConvergentError::Config(ConfigError::DuplicateName {
                resource_type: duplicate.resource_type.clone(),
                name: duplicate.name.clone(),
            }));
        }

        if let Some(first_error) = result.errors.first() {
            return Err(ConvergentError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }

        debug!("Configuration validation passed");
        Ok(result)
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &EngineConfig, schemas: &SchemaRegistry) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_remote(&config.remote, &mut result);
        Self::validate_apply(&config.apply, &mut result);
        Self::validate_resources(&config.resources, schemas, &mut result);

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: String::from("Project name cannot be empty"),
            });
        } else if !is_valid_name(&project.name, false) {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            });
        }

        if project.environment.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.environment"),
                message: String::from("Environment cannot be empty"),
            });
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.errors.push(ValidationError {
                        field: String::from("state.bucket"),
                        message: String::from("S3 bucket name is required when using S3 backend"),
                    });
                }
                if state.path.is_some() {
                    result
                        .warnings
                        .push(String::from("state.path: ignored by the s3 backend"));
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket: ignored by the local backend"));
                }
            }
        }
    }

    fn validate_remote(remote: &RemoteConfig, result: &mut ValidationResult) {
        match remote.kind {
            RemoteKind::Http => match remote.endpoint.as_deref() {
                None | Some("") => result.errors.push(ValidationError {
                    field: String::from("remote.endpoint"),
                    message: String::from("An endpoint is required for the http remote"),
                }),
                Some(endpoint) if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") => {
                    result.errors.push(ValidationError {
                        field: String::from("remote.endpoint"),
                        message: format!("Endpoint '{endpoint}' must be an http(s) URL"),
                    });
                }
                Some(_) => {}
            },
            RemoteKind::Memory => {
                result.warnings.push(String::from(
                    "remote.kind: memory remote selected, nothing will reach a real control plane",
                ));
            }
        }

        if remote.timeout_secs == 0 {
            result.errors.push(ValidationError {
                field: String::from("remote.timeout_secs"),
                message: String::from("Request timeout must be at least 1 second"),
            });
        }
    }

    fn validate_apply(apply: &ApplyConfig, result: &mut ValidationResult) {
        if apply.parallelism == 0 {
            result.errors.push(ValidationError {
                field: String::from("apply.parallelism"),
                message: String::from("Parallelism must be at least 1"),
            });
        } else if apply.parallelism > HIGH_PARALLELISM {
            result.warnings.push(format!(
                "apply.parallelism: {} concurrent actions may trip remote rate limits",
                apply.parallelism
            ));
        }

        if apply.max_attempts == 0 {
            result.errors.push(ValidationError {
                field: String::from("apply.max_attempts"),
                message: String::from("At least one attempt is required"),
            });
        }

        if !apply.backoff_multiplier.is_finite() || apply.backoff_multiplier < 1.0 {
            result.errors.push(ValidationError {
                field: String::from("apply.backoff_multiplier"),
                message: format!(
                    "Backoff multiplier must be at least 1.0, got {}",
                    apply.backoff_multiplier
                ),
            });
        }

        if apply.initial_backoff_ms > apply.max_backoff_ms {
            result.errors.push(ValidationError {
                field: String::from("apply.initial_backoff_ms"),
                message: String::from("Initial backoff cannot exceed max_backoff_ms"),
            });
        }

        if apply.timeout_secs == Some(0) {
            result.errors.push(ValidationError {
                field: String::from("apply.timeout_secs"),
                message: String::from("Apply timeout must be at least 1 second"),
            });
        }
    }

    fn validate_resources(
        resources: &[ResourceConfig],
        schemas: &SchemaRegistry,
        result: &mut ValidationResult,
    ) {
        if resources.is_empty() {
            result.warnings.push(String::from(
                "No resources declared; applying will delete everything in state",
            ));
            return;
        }

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !is_valid_name(&resource.name, true) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with hyphens or underscores.",
                        resource.name
                    ),
                });
            }

            if !resource.attributes.is_object() {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.attributes"),
                    message: format!("Attributes of '{}' must be a mapping", resource.name),
                });
            }

            if resource.depends_on.contains(&resource.name) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.depends_on"),
                    message: format!("Resource '{}' depends on itself", resource.name),
                });
            }

            if !schemas.contains(&resource.resource_type) {
                result.warnings.push(format!(
                    "{prefix}.type: no schema for '{}'; planning will reject it",
                    resource.resource_type
                ));
            }
        }
    }
}

fn find_duplicate(resources: &[ResourceConfig]) -> Option<&ResourceConfig> {
    let mut seen = HashSet::new();
    resources.iter().find(|r| !seen.insert(r.name.as_str()))
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str, allow_underscore: bool) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    let allowed = |c: char| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || (allow_underscore && c == '_')
    };
    if !chars.all(allowed) {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
