//! kite - CLI runner for segment/ride workflows defined in `kite.yaml`.

mod loader;
mod render;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use eyre::{Context, Result};
use kite_core::{ArtifactStore, Config, ConfigError, Graph, GraphError, RideStatus, Scheduler};
use loader::{LoaderError, Workspace};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Runner for segment/ride workflows defined in `kite.yaml`.
#[derive(Parser)]
#[command(name = "kite")]
#[command(about = "Run DAG-scheduled workflows defined in kite.yaml")]
#[command(version)]
struct Cli {
    /// Workspace root (defaults to the current directory)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Path to the workspace definition (defaults to <workspace>/kite.yaml)
    #[arg(long, global = true)]
    file: Option<PathBuf>,

    /// Path to the config file (defaults to <workspace>/.kite/config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a named ride to completion
    RunRide {
        /// Ride name, as declared under `rides:` in kite.yaml
        name: String,
    },
    /// Run one or more segments directly, in the order given, ignoring rides
    RunSegments {
        /// Segment names, as declared under `segments:` in kite.yaml
        names: Vec<String>,
    },
    /// List segment names declared in kite.yaml
    ListSegments,
    /// List ride names declared in kite.yaml
    ListRides,
    /// Print a ride's topological order and execution levels without running it
    Plan {
        /// Ride name, as declared under `rides:` in kite.yaml
        name: String,
    },
}

/// Errors that map to exit code 2 (Section 6's "configuration error"):
/// everything caught before a ride's segments start running.
#[derive(Debug, thiserror::Error)]
enum ValidationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let workspace = cli
        .workspace
        .unwrap_or_else(|| PathBuf::from("."))
        .canonicalize()
        .context("resolving workspace root")?;

    match run(cli, workspace).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(AppError::Validation(err)) => {
            eprintln!("kite: configuration error: {err}");
            std::process::exit(2);
        }
        Err(AppError::Other(err)) => Err(err),
    }
}

#[derive(Debug)]
enum AppError {
    Validation(ValidationError),
    Other(eyre::Report),
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl From<eyre::Report> for AppError {
    fn from(err: eyre::Report) -> Self {
        Self::Other(err)
    }
}

async fn run(cli: Cli, workspace: PathBuf) -> std::result::Result<i32, AppError> {
    let file = cli.file.unwrap_or_else(|| workspace.join("kite.yaml"));
    let config_path = cli.config.unwrap_or_else(|| workspace.join(".kite/config"));

    let mut config = if config_path.exists() {
        Config::from_file(&config_path).map_err(ValidationError::from)?
    } else {
        Config::default()
    };
    config.resolve_paths(&workspace);

    let workspace_def = Workspace::load(&file).map_err(ValidationError::from)?;

    let exit_code = match cli.command {
        Command::RunRide { name } => {
            let ride = workspace_def.ride(&name).map_err(ValidationError::from)?;
            run_ride(&workspace, &config, &workspace_def, ride).await?
        }
        Command::RunSegments { names } => {
            let ride = workspace_def
                .ad_hoc_ride(&names)
                .map_err(ValidationError::from)?;
            run_ride(&workspace, &config, &workspace_def, ride).await?
        }
        Command::ListSegments => {
            let names: Vec<String> = workspace_def
                .segments
                .iter()
                .map(|s| s.name.clone())
                .collect();
            render::print_segment_list(&names);
            0
        }
        Command::ListRides => {
            render::print_ride_list(&workspace_def.ride_names);
            0
        }
        Command::Plan { name } => {
            let ride = workspace_def.ride(&name).map_err(ValidationError::from)?;
            let graph = Graph::build(&ride, &workspace_def.segments).map_err(ValidationError::from)?;
            render::print_plan(&name, &graph.render_plan());
            0
        }
    };

    Ok(exit_code)
}

/// Build a scheduler for `ride`, run it, print the report, and translate
/// the outcome into a process exit code: 0 success, 1 ride failure.
async fn run_ride(
    workspace: &std::path::Path,
    config: &Config,
    workspace_def: &Workspace,
    ride: kite_core::Ride,
) -> std::result::Result<i32, AppError> {
    let artifacts = Arc::new(ArtifactStore::new(config.artifact_root.clone()));
    artifacts
        .load_manifest()
        .context("loading artifact manifest")
        .map_err(AppError::Other)?;

    let graph = Graph::build(&ride, &workspace_def.segments).map_err(ValidationError::from)?;

    let scheduler = Scheduler::new(config.clone(), workspace.to_path_buf(), Arc::clone(&artifacts));
    let report = scheduler
        .run(&ride, &graph)
        .await
        .context("running ride")
        .map_err(AppError::Other)?;

    render::print_ride_report(&report);

    Ok(match report.status {
        RideStatus::Success => 0,
        RideStatus::Failure => 1,
    })
}
