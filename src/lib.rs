//! Command line interface for the Capstan serverless HPC backend.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

use std::path::Path;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use capstan_engine::broker::AmqpBroker;
use capstan_engine::config::BackendConfig;
use capstan_engine::controller::Controller;
use capstan_engine::scheduler::SlurmScheduler;
use capstan_engine::storage::FsObjectStore;
use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use tracing_subscriber::EnvFilter;

pub mod commands;

/// The environment variable naming the configuration file.
const CONFIG_ENV: &str = "CAPSTAN_CONFIG";

/// The default configuration file path.
const DEFAULT_CONFIG_PATH: &str = "capstan.yaml";

/// The default object-store directory, relative to the home directory.
const DEFAULT_STORAGE_DIR: &str = ".capstan/storage";

/// The command line interface.
#[derive(Parser)]
#[command(author, version, about, propagate_version = true)]
struct Cli {
    /// The path to the backend configuration file.
    #[arg(
        short,
        long,
        global = true,
        env = CONFIG_ENV,
        default_value = DEFAULT_CONFIG_PATH,
        value_name = "FILE"
    )]
    config: PathBuf,

    /// The verbosity flags.
    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,

    /// The subcommand to run.
    #[command(subcommand)]
    command: Commands,
}

/// The CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Deploys a runtime's worker pool and prints its metadata.
    Deploy(commands::deploy::DeployArgs),
    /// Publishes a map job to a deployed runtime.
    Invoke(commands::invoke::InvokeArgs),
    /// Stops a runtime's worker pool.
    Stop(commands::stop::StopArgs),
    /// Stops every runtime and deletes its queues.
    Clean(commands::clean::CleanArgs),
    /// Lists the deployed runtimes.
    List(commands::list::ListArgs),
    /// Runs the compute-node worker entry point.
    ///
    /// This subcommand is what deployed pools execute; it is not meant to be
    /// run by hand.
    Worker(commands::worker::WorkerArgs),
}

/// The CLI entry point.
pub async fn capstan_main() {
    let cli = Cli::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(cli.verbosity.tracing_level_filter().into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e:?}");
        exit(1);
    }
}

/// Dispatches the parsed command line.
async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        // The worker runs on compute nodes where the configuration file is
        // not present; everything it needs arrives on its command line.
        Commands::Worker(args) => commands::worker::run(args).await,
        command => {
            let controller = controller(&cli.config).await?;
            match command {
                Commands::Deploy(args) => commands::deploy::run(controller, args).await,
                Commands::Invoke(args) => commands::invoke::run(controller, args).await,
                Commands::Stop(args) => commands::stop::run(controller, args).await,
                Commands::Clean(args) => commands::clean::run(controller, args).await,
                Commands::List(args) => commands::list::run(controller, args).await,
                Commands::Worker(_) => unreachable!("handled above"),
            }
        }
    }
}

/// Loads the configuration and wires the controller to its collaborators.
async fn controller(config_path: &Path) -> Result<Controller> {
    let text = tokio::fs::read_to_string(config_path).await.with_context(|| {
        format!(
            "failed to read configuration file `{path}`",
            path = config_path.display()
        )
    })?;
    let config = BackendConfig::from_yaml(&text)?;

    let storage_root = match &config.hpc.storage_dir {
        Some(dir) => dir.clone(),
        None => dirs::home_dir()
            .context("failed to determine the home directory")?
            .join(DEFAULT_STORAGE_DIR),
    };

    let broker = Arc::new(AmqpBroker::new(config.amqp_url()));
    let store = Arc::new(FsObjectStore::new(storage_root));
    let scheduler = Arc::new(SlurmScheduler::new());
    Ok(Controller::new(config, broker, store, scheduler))
}
