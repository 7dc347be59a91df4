//! Configuration parser for loading and merging configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, ConvergentError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{EngineConfig, StateBackend};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "CONVERGENT_";

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["convergent.yaml", "convergent.yml"];

/// Configuration parser for loading engine configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConvergentError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergentError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        let mut config = self.parse_yaml(&content, Some(path))?;
        self.resolve_state_path(&mut config);
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<EngineConfig> {
        debug!("Parsing YAML configuration");

        let config: EngineConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            ConvergentError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            resources = config.resources.len(),
            "Parsed configuration for project: {}", config.project.name
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `CONVERGENT_<SECTION>_<KEY>` (e.g., `CONVERGENT_STATE_BUCKET`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an
    /// override holds a malformed value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        let mut config = self.load_file(path)?;
        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        self.resolve_state_path(&mut config);
        Ok(config)
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergentError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Makes a relative local state path relative to the base path.
    fn resolve_state_path(&self, config: &mut EngineConfig) {
        let Some(base) = &self.base_path else {
            return;
        };
        if let Some(path) = &config.state.path
            && Path::new(path).is_relative()
        {
            config.state.path = Some(base.join(path).display().to_string());
        }
    }
}

/// Applies `CONVERGENT_*` overrides using `lookup` to read variables.
///
/// # Errors
///
/// Returns an error if a numeric or enumerated override cannot be parsed.
pub fn apply_env_overrides<F>(config: &mut EngineConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| {
        let value = lookup(&format!("{ENV_PREFIX}{key}"));
        if value.is_some() {
            debug!("Overriding {} from environment", key.to_lowercase());
        }
        value
    };

    if let Some(name) = var("PROJECT_NAME") {
        config.project.name = name;
    }
    if let Some(env) = var("PROJECT_ENVIRONMENT") {
        config.project.environment = env;
    }

    if let Some(backend) = var("STATE_BACKEND") {
        config.state.backend = match backend.to_lowercase().as_str() {
            "local" => StateBackend::Local,
            "s3" => StateBackend::S3,
            other => {
                return Err(ConvergentError::Config(ConfigError::validation(
                    format!("Unknown state backend '{other}'"),
                    "state.backend",
                )));
            }
        };
    }
    if let Some(bucket) = var("STATE_BUCKET") {
        config.state.bucket = Some(bucket);
    }
    if let Some(prefix) = var("STATE_PREFIX") {
        config.state.prefix = Some(prefix);
    }
    if let Some(region) = var("STATE_REGION") {
        config.state.region = Some(region);
    }
    if let Some(path) = var("STATE_PATH") {
        config.state.path = Some(path);
    }

    if let Some(endpoint) = var("REMOTE_ENDPOINT") {
        config.remote.endpoint = Some(endpoint);
    }

    if let Some(value) = var("APPLY_PARALLELISM") {
        config.apply.parallelism = parse_number(&value, "apply.parallelism")?;
    }
    if let Some(value) = var("APPLY_MAX_ATTEMPTS") {
        config.apply.max_attempts = parse_number(&value, "apply.max_attempts")?;
    }
    if let Some(value) = var("APPLY_TIMEOUT_SECS") {
        config.apply.timeout_secs = Some(parse_number(&value, "apply.timeout_secs")?);
    }

    Ok(())
}

fn parse_number<T: std::str::FromStr>(value: &str, field: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        ConvergentError::Config(ConfigError::validation(
            format!("'{value}' is not a valid number"),
            field,
        ))
    })
}

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergentError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
