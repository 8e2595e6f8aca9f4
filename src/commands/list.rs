//! Implementation of the `list` command.

use anyhow::Result;
use capstan_engine::controller::Controller;
use clap::Parser;

/// Arguments for the `list` command.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// The runtime to list, or `all`.
    #[arg(default_value = "all")]
    pub runtime: String,
}

/// Lists the deployed runtimes.
pub async fn run(controller: Controller, args: ListArgs) -> Result<()> {
    let runtimes = controller.list_runtimes(&args.runtime).await?;

    if runtimes.is_empty() {
        println!("no deployed runtimes");
        return Ok(());
    }

    for runtime in runtimes {
        println!(
            "{name}\t{memory}\t{version}",
            name = runtime.name,
            memory = runtime.memory,
            version = runtime.version
        );
    }

    Ok(())
}
