use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kubestrap_core::config::AppConfig;
use kubestrap_core::error::StrapError;
use kubestrap_core::event::EventBus;
use kubestrap_core::inventory::Inventory;
use kubestrap_core::types::PlanDefinition;
use kubestrap_engine::{CheckRegistry, Engine, EngineOptions, Plan, RunLogger};
use kubestrap_transport::TransportRouter;

/// Exit status for plan or config validation failures.
const EXIT_INVALID: u8 = 2;
/// Exit status for an aborted run or an unexpected load failure.
const EXIT_FAILED: u8 = 1;

#[derive(Parser)]
#[command(
    name = "kubestrap",
    version,
    about = "Phased, idempotent Kubernetes cluster bootstrap over SSH"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "kubestrap.toml", env = "KUBESTRAP_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan against an inventory
    Run {
        /// Plan file (TOML)
        #[arg(short, long)]
        plan: PathBuf,
        /// Inventory file (TOML)
        #[arg(short, long)]
        inventory: PathBuf,
        /// Render every command without touching any host
        #[arg(long)]
        dry_run: bool,
        /// Override [engine].max_parallel
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a plan and print its phase layout
    Validate {
        #[arg(short, long)]
        plan: PathBuf,
        #[arg(short, long)]
        inventory: PathBuf,
    },
    /// Show the effective configuration
    Config,
    /// List the built-in named checks
    Checks,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("kubestrap=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "kubestrap", &mut std::io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let config = match AppConfig::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "Invalid config");
            return Ok(ExitCode::from(load_exit_status(&e)));
        }
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Checks => {
            let registry = CheckRegistry::with_builtins();
            for name in registry.list() {
                if let Some(check) = registry.get(name) {
                    println!("{:<22} {}", name, check.description());
                }
            }
        }
        Commands::Validate { plan, inventory } => {
            let plan = match load_plan(&config, &plan, &inventory) {
                Ok(plan) => plan,
                Err(code) => return Ok(code),
            };
            print!("{}", plan.describe());
        }
        Commands::Run {
            plan,
            inventory,
            dry_run,
            max_parallel,
            json,
        } => {
            let plan = match load_plan(&config, &plan, &inventory) {
                Ok(plan) => plan,
                Err(code) => return Ok(code),
            };
            return run(&config, &plan, dry_run, max_parallel, json).await;
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(ExitCode::SUCCESS)
}

/// Load and validate a plan, logging the reason on failure.
fn load_plan(config: &AppConfig, plan: &Path, inventory: &Path) -> Result<Plan, ExitCode> {
    let built = PlanDefinition::load(plan).and_then(|definition| {
        let inventory = Inventory::load(inventory, &config.ssh)?;
        Plan::build(definition, inventory, &CheckRegistry::with_builtins())
    });
    built.map_err(|e| {
        error!(plan = %plan.display(), kind = e.kind(), "{}", e);
        ExitCode::from(load_exit_status(&e))
    })
}

/// Exit status for an error raised before the run starts.
fn load_exit_status(err: &StrapError) -> u8 {
    if err.is_plan_error() {
        EXIT_INVALID
    } else {
        EXIT_FAILED
    }
}

async fn run(
    config: &AppConfig,
    plan: &Plan,
    dry_run: bool,
    max_parallel: Option<usize>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let mut options = EngineOptions::from(&config.engine).with_dry_run(dry_run);
    if let Some(n) = max_parallel {
        options = options.with_max_parallel(n);
    }

    let transport = Arc::new(TransportRouter::from_config(&config.ssh));
    let engine = Engine::new(transport, options)
        .with_event_bus(Arc::new(EventBus::new(plan.event_capacity())));
    let run_id = uuid::Uuid::new_v4().to_string();

    // The logger stops on RunFinished, so it outlives an interrupted run.
    let logger = config.log.enabled.then(|| {
        RunLogger::new(config.log_dir()).spawn(
            engine.event_bus().clone(),
            run_id.clone(),
            CancellationToken::new(),
        )
    });

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("Interrupted, cancelling run...");
        cancel_clone.cancel();
    });

    info!(run_id = %run_id, plan = %plan.name(), "Starting run");
    let report = engine.run_with_id(plan, run_id, cancel).await;
    engine.shutdown().await;
    if let Some(handle) = logger {
        handle.await.ok();
    }

    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.render_text());
    }

    Ok(ExitCode::from(report.exit_code() as u8))
}
