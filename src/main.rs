//! stackweave CLI entrypoint.
//!
//! Exit codes: 0 success, 1 configuration or structural error, 2 one or
//! more resources failed, 3 cancelled.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use stackweave::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use stackweave::config::{
    ConfigParser, ConfigValidator, ProjectFile, ProviderKind, StackConfig, StateBackend,
    find_config_file,
};
use stackweave::context::{Deployment, DeploymentContext};
use stackweave::engine::Engine;
use stackweave::error::{ConfigError, Result, StackweaveError};
use stackweave::provider::{HttpProvider, Provider, SimulatedProvider};
use stackweave::resource::SchemaRegistry;
use stackweave::stacks;
use stackweave::state::{LocalStateStore, S3StateStore, StateStore, generate_holder_id};

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_TEMPLATE: &str = r#"project:
  name: my-app
  stack: dev
  region: us-west-2
  program: fargate

config:
  appMessage: "Hello from stackweave"

state:
  backend: local

execution:
  parallelism: 4
  max_attempts: 5
  initial_backoff_ms: 500
  max_backoff_ms: 30000
  operation_timeout_secs: 300
  diff_policy: reference

provider:
  kind: simulated
"#;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli, &formatter)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", formatter.error(&e.to_string()));
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point. Returns the process exit code.
async fn run(cli: Cli, formatter: &OutputFormatter) -> Result<u8> {
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| 0),
        Commands::Validate { warnings } => cmd_validate(config, warnings, formatter),
        Commands::Preview { refresh, detailed } => {
            cmd_preview(config, refresh, detailed, formatter).await
        }
        Commands::Up { yes, refresh } => cmd_up(config, yes, refresh, formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config, yes, formatter).await,
        Commands::Refresh => cmd_refresh(config, formatter).await,
        Commands::State { command } => cmd_state(config, command, formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new stackweave project in: {}", path.display());

    let config_path = path.join("stackweave.yaml");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Project file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, CONFIG_TEMPLATE)?;
    eprintln!("Created: {}", config_path.display());

    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".stackweave") {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n.stackweave/")?;
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".env\n.stackweave/\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized. Next steps:");
    eprintln!("  1. Edit stackweave.yaml");
    eprintln!("  2. Run 'stackweave preview' to see what will be deployed");
    eprintln!("  3. Run 'stackweave up' to deploy");
    Ok(())
}

/// Validate the project file and the declared program.
fn cmd_validate(config: Option<&Path>, warnings: bool, formatter: &OutputFormatter) -> Result<u8> {
    let (file, _) = load_project(config)?;
    let result = ConfigValidator::new().validate(&file)?;
    let deployment = declare(&file)?;

    println!("{}", formatter.format_validation(&result, deployment.graph.len(), warnings));
    Ok(0)
}

/// Show what `up` would change.
async fn cmd_preview(
    config: Option<&Path>,
    refresh: bool,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let (file, base) = load_checked(config)?;
    let deployment = declare(&file)?;
    let engine = build_engine(&file, &base).await?;

    let plan = engine.preview(&deployment, refresh).await?;
    println!("{}", formatter.format_plan(&plan, detailed));
    Ok(0)
}

/// Plan and apply the stack.
async fn cmd_up(
    config: Option<&Path>,
    auto_approve: bool,
    refresh: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let (file, base) = load_checked(config)?;
    let deployment = declare(&file)?;
    let engine = build_engine(&file, &base).await?;

    let plan = engine.preview(&deployment, refresh).await?;
    println!("{}", formatter.format_plan(&plan, false));
    if !plan.has_changes() {
        return Ok(0);
    }
    if !auto_approve && !confirm("Do you want to apply these changes? [y/N]: ", "y")? {
        eprintln!("Update cancelled.");
        return Ok(0);
    }

    watch_ctrl_c(&engine);
    let outcome = engine.up(&deployment, refresh).await?;
    println!("{}", formatter.format_outcome(&outcome));
    Ok(outcome.exit_code())
}

/// Delete every recorded resource.
async fn cmd_destroy(config: Option<&Path>, auto_approve: bool, formatter: &OutputFormatter) -> Result<u8> {
    let (file, base) = load_checked(config)?;
    let engine = build_engine(&file, &base).await?;

    let Some(snapshot) = engine.snapshot(&file.project.name, &file.project.stack).await? else {
        println!("{}", formatter.success("Nothing to destroy."));
        return Ok(0);
    };
    if snapshot.records.is_empty() {
        println!("{}", formatter.success("Nothing to destroy."));
        return Ok(0);
    }

    eprintln!("The following resources will be deleted:");
    for name in snapshot.names().iter().rev() {
        eprintln!("  - {name}");
    }
    if !auto_approve
        && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")?
    {
        eprintln!("Destroy cancelled.");
        return Ok(0);
    }

    watch_ctrl_c(&engine);
    let outcome = engine.destroy(&file.project.name, &file.project.stack).await?;
    println!("{}", formatter.format_outcome(&outcome));
    Ok(outcome.exit_code())
}

/// Re-read recorded resources and save what changed.
async fn cmd_refresh(config: Option<&Path>, formatter: &OutputFormatter) -> Result<u8> {
    let (file, base) = load_checked(config)?;
    let engine = build_engine(&file, &base).await?;

    let report = engine.refresh_stack(&file.project.name, &file.project.stack).await?;
    println!("{}", formatter.format_drift(&report));
    Ok(0)
}

/// State management commands.
async fn cmd_state(config: Option<&Path>, command: StateCommands, formatter: &OutputFormatter) -> Result<u8> {
    let (file, base) = load_checked(config)?;
    let store = build_store(&file, &base).await?;

    match command {
        StateCommands::Show | StateCommands::History { .. } => {
            let engine = Engine::new(build_provider(&file)?, Arc::clone(&store));
            let Some(snapshot) = engine.snapshot(&file.project.name, &file.project.stack).await? else {
                println!("No state found for {}.", file.qualified_stack());
                return Ok(0);
            };
            let output = match command {
                StateCommands::History { limit } => formatter.format_history(&snapshot, limit),
                _ => formatter.format_state(&snapshot),
            };
            println!("{output}");
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder, "manual").await?;
            println!("{}", formatter.format_lock(Some(&lock)));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                println!("{}", formatter.success("State forcefully unlocked."));
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                println!("{}", formatter.success("State unlocked."));
            } else {
                let current = store.get_lock_info().await?;
                println!("{}", formatter.format_lock(current.as_ref()));
                eprintln!("{}", formatter.warning("Provide a lock id or use --force to unlock."));
            }
        }
    }

    Ok(0)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Loads the project file, returning it with its directory.
fn load_project(config: Option<&Path>) -> Result<(ProjectFile, PathBuf)> {
    let config_file = config.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))?;
    debug!("Loading project file from: {}", config_file.display());

    let base = config_file
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let parser = ConfigParser::new().with_base_path(&base);
    parser.load_dotenv()?;

    Ok((parser.load_with_env(&config_file)?, base))
}

/// Loads and validates the project file.
fn load_checked(config: Option<&Path>) -> Result<(ProjectFile, PathBuf)> {
    let (file, base) = load_project(config)?;
    let result = ConfigValidator::new().validate(&file)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }
    Ok((file, base))
}

/// Runs the configured program and returns its resource graph.
fn declare(file: &ProjectFile) -> Result<Deployment> {
    let ctx = DeploymentContext::new(
        &file.project.name,
        &file.project.stack,
        StackConfig::from_file(file),
        SchemaRegistry::aws(),
    );
    stacks::run(&file.project.program, ctx)
}

fn build_provider(file: &ProjectFile) -> Result<Arc<dyn Provider>> {
    let region = file
        .project
        .region
        .clone()
        .unwrap_or_else(|| String::from(stacks::DEFAULT_REGION));

    match file.provider.kind {
        ProviderKind::Simulated => {
            let account = file
                .provider
                .account
                .clone()
                .unwrap_or_else(|| String::from("123456789012"));
            Ok(Arc::new(SimulatedProvider::new(account, region)))
        }
        ProviderKind::Http => {
            let endpoint = file.provider.endpoint.as_deref().ok_or_else(|| {
                StackweaveError::Config(ConfigError::MissingValue {
                    key: String::from("provider.endpoint"),
                })
            })?;
            Ok(Arc::new(HttpProvider::from_env(endpoint)?))
        }
    }
}

async fn build_store(file: &ProjectFile, base: &Path) -> Result<Arc<dyn StateStore>> {
    let stack = file.project.stack.as_str();
    let store: Arc<dyn StateStore> = match file.state.backend {
        StateBackend::Local => match file.state.path.as_deref() {
            Some(path) => Arc::new(LocalStateStore::with_state_path(base.join(path))),
            None => Arc::new(LocalStateStore::with_base_dir(
                base.join(stackweave::state::STATE_DIR),
                stack,
            )),
        },
        StateBackend::S3 => {
            let bucket = file.state.bucket.as_deref().ok_or_else(|| {
                StackweaveError::Config(ConfigError::MissingValue {
                    key: String::from("state.bucket"),
                })
            })?;
            Arc::new(
                S3StateStore::new(
                    bucket,
                    file.state.prefix.as_deref(),
                    file.state.region.as_deref(),
                    stack,
                )
                .await?,
            )
        }
    };
    Ok(store)
}

async fn build_engine(file: &ProjectFile, base: &Path) -> Result<Engine> {
    let provider = build_provider(file)?;
    let store = build_store(file, base).await?;
    debug!(provider = provider.name(), store = store.backend_type(), "Engine ready");
    Ok(Engine::new(provider, store).with_settings(file.execution.clone()))
}

/// Cancels the engine's runs on Ctrl-C. In-flight operations finish, nothing
/// new starts.
fn watch_ctrl_c(engine: &Engine) {
    let cancel = engine.cancel_signal().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, waiting for in-flight operations");
            cancel.cancel();
        }
    });
}

/// Prompts on stderr and compares the answer with `expected`.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}
