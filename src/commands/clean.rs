//! Implementation of the `clean` command.

use anyhow::Result;
use capstan_engine::controller::Controller;
use clap::Parser;

/// Arguments for the `clean` command.
#[derive(Parser, Debug)]
pub struct CleanArgs {}

/// Stops every declared runtime and deletes its queues.
pub async fn run(controller: Controller, _args: CleanArgs) -> Result<()> {
    controller.clean().await?;
    Ok(())
}
