//! Implementation of the `deploy` command.

use std::time::Duration;

use anyhow::Result;
use capstan_engine::controller::Controller;
use clap::Parser;

/// Arguments for the `deploy` command.
#[derive(Parser, Debug)]
pub struct DeployArgs {
    /// The runtime to deploy; defaults to the configured runtime.
    pub runtime: Option<String>,

    /// The runtime memory in MB; this backend ignores it.
    #[arg(long)]
    pub memory: Option<u64>,

    /// The runtime timeout in seconds; this backend ignores it.
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Deploys a runtime's worker pool and prints the probed metadata.
pub async fn run(controller: Controller, args: DeployArgs) -> Result<()> {
    let name = args
        .runtime
        .unwrap_or_else(|| controller.config().hpc.default_runtime_name().to_string());

    let metadata = controller
        .deploy_runtime(&name, args.memory, args.timeout.map(Duration::from_secs))
        .await?;

    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}
