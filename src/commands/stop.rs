//! Implementation of the `stop` command.

use anyhow::Result;
use capstan_engine::controller::Controller;
use clap::Parser;

/// Arguments for the `stop` command.
#[derive(Parser, Debug)]
pub struct StopArgs {
    /// The runtime to stop; defaults to the configured runtime.
    pub runtime: Option<String>,
}

/// Stops a runtime's worker pool and deletes its persisted job id.
pub async fn run(controller: Controller, args: StopArgs) -> Result<()> {
    let name = args
        .runtime
        .unwrap_or_else(|| controller.config().hpc.default_runtime_name().to_string());

    controller.delete_runtime(&name).await?;
    Ok(())
}
