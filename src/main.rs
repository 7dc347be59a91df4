//! Convergent CLI entrypoint.
//!
//! This is the main entrypoint for the convergent command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use convergent::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use convergent::config::{
    find_config_file, ConfigParser, ConfigValidator, EngineConfig, RemoteKind, StateBackend,
    ValidationError,
};
use convergent::error::{ConfigError, ConvergentError, Result, StateError};
use convergent::planner::{DescriptorValidator, Planner};
use convergent::reconciler::Reconciler;
use convergent::remote::{HttpRemoteClient, InMemoryRemote, RemoteClient};
use convergent::resource::DescriptorSource;
use convergent::state::{LocalStateStore, ObservedState, S3StateStore, StateStore, STATE_DIR};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code reported when `drift` finds differences.
const DRIFT_EXIT_CODE: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. Logs go to stderr; command output to stdout.
fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Main async entry point. Returns the process exit code.
async fn run(cli: Cli) -> Result<u8> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Plan { refresh, detailed } => {
            let (workspace, reconciler) = Workspace::load(config_path).await?.into_reconciler()?;
            let plan = if refresh {
                let (plan, report) = reconciler.plan_refreshed().await?;
                emit(&formatter.format_refresh(&report))?;
                plan
            } else {
                reconciler.plan().await?
            };
            debug!("Planned against {}", workspace.describe());
            emit(&formatter.format_plan(&plan, detailed))?;
            Ok(0)
        }
        Commands::Apply {
            yes,
            refresh,
            parallelism,
            timeout,
        } => {
            let mut workspace = Workspace::load(config_path).await?;
            if let Some(parallelism) = parallelism {
                workspace.config.apply.parallelism = parallelism;
            }
            if timeout.is_some() {
                workspace.config.apply.timeout_secs = timeout;
            }
            cmd_apply(workspace, yes, refresh, &formatter).await
        }
        Commands::Refresh => {
            let (_, reconciler) = Workspace::load(config_path).await?.into_reconciler()?;
            let report = reconciler.refresh().await?;
            emit(&formatter.format_refresh(&report))?;
            Ok(u8::from(!report.is_clean()))
        }
        Commands::Drift => {
            let (_, reconciler) = Workspace::load(config_path).await?.into_reconciler()?;
            let report = reconciler.check_drift().await?;
            emit(&formatter.format_drift(&report))?;
            Ok(if report.is_converged() { 0 } else { DRIFT_EXIT_CODE })
        }
        Commands::Import {
            resource_type,
            name,
            remote_id,
        } => {
            let (_, reconciler) = Workspace::load(config_path).await?.into_reconciler()?;
            let entry = reconciler.import(&name, &resource_type, &remote_id).await?;
            emit(&formatter.format_resource(&entry))?;
            Ok(0)
        }
        Commands::Destroy { yes, verify } => {
            let workspace = Workspace::load(config_path).await?;
            cmd_destroy(workspace, yes, verify, &formatter).await
        }
        Commands::Verify => {
            let (_, reconciler) = Workspace::load(config_path).await?.into_reconciler()?;
            reconciler.verify_exists().await?;
            emit(&formatter.message("Every managed resource exists remotely"))?;
            Ok(0)
        }
        Commands::State { command } => {
            let workspace = Workspace::load(config_path).await?;
            cmd_state(workspace, command, &formatter).await
        }
    }
}

/// Validate configuration and declared resources.
fn cmd_validate(config_path: Option<&PathBuf>, show_warnings: bool, formatter: &OutputFormatter) -> Result<u8> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let config = load_config(&config_file)?;
    let schemas = config.schema_registry()?;
    let mut result = ConfigValidator.check(&config, &schemas);

    if result.is_valid() {
        let descriptors = config.descriptors(&schemas)?;
        let issues = DescriptorValidator::new(&schemas).issues(&descriptors);

        if issues.is_empty() {
            let empty = ObservedState::new(&config.project.name, &config.project.environment);
            if let Err(e) = Planner::new(&schemas).plan(&descriptors, &empty, "") {
                result.errors.push(ValidationError {
                    field: String::from("resources"),
                    message: e.to_string(),
                });
            }
        }

        result.errors.extend(issues.into_iter().map(|issue| ValidationError {
            field: String::from("resources"),
            message: issue.to_string(),
        }));
    }

    emit(&formatter.format_validation(&config, &result, show_warnings))?;
    Ok(u8::from(!result.is_valid()))
}

/// Plan, confirm, apply.
async fn cmd_apply(workspace: Workspace, auto_approve: bool, refresh: bool, formatter: &OutputFormatter) -> Result<u8> {
    let (_, reconciler) = workspace.into_reconciler()?;

    let plan = if refresh {
        reconciler.plan_refreshed().await?.0
    } else {
        reconciler.plan().await?
    };

    if plan.is_empty() && !refresh {
        emit(&formatter.message("No changes to apply"))?;
        return Ok(0);
    }

    emit(&formatter.format_plan(&plan, false))?;

    if !auto_approve && !plan.is_empty() && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(0);
    }

    let outcome = reconciler.apply(refresh).await?;
    emit(&formatter.format_apply(&outcome))?;

    Ok(outcome.result.exit_code())
}

/// Destroy everything in state.
async fn cmd_destroy(workspace: Workspace, auto_approve: bool, verify: bool, formatter: &OutputFormatter) -> Result<u8> {
    let store = workspace.store.clone();
    let (_, reconciler) = workspace.into_reconciler()?;

    let state = reconciler.load_state().await?;
    if state.resources.is_empty() {
        emit(&formatter.message("Nothing to destroy"))?;
        return Ok(0);
    }

    eprintln!("The following resources will be destroyed:");
    for resource in state.resources.values() {
        eprintln!("  - {} {} ({})", resource.resource_type, resource.name, resource.remote_id);
    }

    if !auto_approve && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
        eprintln!("Destruction cancelled.");
        return Ok(0);
    }

    let before: Vec<_> = state.resources.into_values().collect();
    let outcome = reconciler.destroy().await?;
    emit(&formatter.format_apply(&outcome))?;

    if verify && outcome.result.is_success() {
        reconciler.verify_destroyed(&before).await?;
        emit(&formatter.message("All destroyed resources are gone remotely"))?;
    }

    debug!("Destroy finished against {} state", store.backend_type());
    Ok(outcome.result.exit_code())
}

/// State management commands.
async fn cmd_state(workspace: Workspace, command: StateCommands, formatter: &OutputFormatter) -> Result<u8> {
    let store = workspace.store.clone();

    match command {
        StateCommands::Show => match store.load().await? {
            Some(state) => emit(&formatter.format_state(&state))?,
            None => emit(&formatter.message("No state found"))?,
        },
        StateCommands::List => match store.load().await? {
            Some(state) => emit(&formatter.format_resources(&state))?,
            None => emit(&formatter.message("No state found"))?,
        },
        StateCommands::Rm { name } => {
            let (_, reconciler) = workspace.into_reconciler()?;
            let entry = reconciler.forget(&name).await?;
            emit(&formatter.message(&format!(
                "Removed {} ({}) from state; remote id {} is no longer managed",
                entry.name, entry.resource_type, entry.remote_id
            )))?;
        }
        StateCommands::Unlock { force } => match store.get_lock_info().await? {
            None => emit(&formatter.message("State is not locked"))?,
            Some(lock) if lock.is_expired() || force => {
                store.release_lock(&lock.lock_id).await?;
                emit(&formatter.message(&format!("Released lock held by {}", lock.holder)))?;
            }
            Some(lock) => {
                return Err(ConvergentError::State(StateError::LockedByOther {
                    holder: lock.holder,
                    since: lock.acquired_at.to_rfc3339(),
                }));
            }
        },
    }

    Ok(0)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Loaded configuration plus the backends it selects.
struct Workspace {
    config: EngineConfig,
    config_file: PathBuf,
    store: Arc<dyn StateStore>,
    client: Arc<dyn RemoteClient>,
}

impl Workspace {
    /// Loads and validates configuration, then builds the state store and remote client.
    async fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        let config = load_config(&config_file)?;

        let schemas = config.schema_registry()?;
        ConfigValidator.validate(&config, &schemas)?;

        let store = create_state_store(&config, &config_file).await?;
        let client = create_remote_client(&config)?;

        Ok(Self {
            config,
            config_file,
            store,
            client,
        })
    }

    /// Builds a reconciler wired to Ctrl-C.
    fn into_reconciler(self) -> Result<(Self, Reconciler)> {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; running actions will finish, pending ones are skipped");
                on_signal.cancel();
            }
        });

        let reconciler = Reconciler::from_config(&self.config, self.client.clone(), self.store.clone())?
            .with_cancellation(cancel);
        Ok((self, reconciler))
    }

    fn describe(&self) -> String {
        format!(
            "{} ({} state, {} remote)",
            self.config_file.display(),
            self.store.backend_type(),
            self.client.name()
        )
    }
}

/// Reads `.env` next to the configuration, then the file with overrides.
fn load_config(config_file: &Path) -> Result<EngineConfig> {
    let parser = ConfigParser::new().with_base_path(config_dir(config_file));
    parser.load_dotenv()?;
    parser.load_with_env(config_file)
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Creates the state store the configuration selects.
async fn create_state_store(config: &EngineConfig, config_file: &Path) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.state.backend {
        StateBackend::Local => match &config.state.path {
            Some(path) => Arc::new(LocalStateStore::with_state_path(path)),
            None => Arc::new(LocalStateStore::with_base_dir(config_dir(config_file).join(STATE_DIR))),
        },
        StateBackend::S3 => {
            let bucket = config.state.bucket.as_deref().ok_or_else(|| {
                ConvergentError::Config(ConfigError::validation("S3 bucket not configured", "state.bucket"))
            })?;
            Arc::new(S3StateStore::new(bucket, config.state.prefix.as_deref(), config.state.region.as_deref()).await?)
        }
    };
    debug!("Using {} state backend", store.backend_type());
    Ok(store)
}

/// Creates the remote client the configuration selects.
fn create_remote_client(config: &EngineConfig) -> Result<Arc<dyn RemoteClient>> {
    match config.remote.kind {
        RemoteKind::Http => {
            let endpoint = config.remote.endpoint.as_deref().ok_or_else(|| {
                ConvergentError::Config(ConfigError::validation("Remote endpoint not configured", "remote.endpoint"))
            })?;
            Ok(Arc::new(HttpRemoteClient::from_env(endpoint, config.remote.request_timeout())?))
        }
        RemoteKind::Memory => {
            warn!("Using the in-memory remote; nothing outlives this process");
            Ok(Arc::new(InMemoryRemote::new()))
        }
    }
}

/// Writes command output to stdout.
fn emit(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

/// Prompts on stderr and compares the answer to `expected`.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}
