//! Configuration module for the reconciliation engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `convergent.yaml`
//! - Environment overrides and `.env` loading
//! - Validation of settings and declared resources
//! - Computing declared-set hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{apply_env_overrides, find_config_file, ConfigParser, DEFAULT_CONFIG_FILES, ENV_PREFIX};
pub use spec::{
    ApplyConfig, EngineConfig, ProjectConfig, RemoteConfig, RemoteKind, ResourceConfig,
    StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
