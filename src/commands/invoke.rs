//! Implementation of the `invoke` command.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use capstan_engine::controller::Controller;
use capstan_engine::message::JobPayload;
use clap::Parser;

/// Arguments for the `invoke` command.
#[derive(Parser, Debug)]
pub struct InvokeArgs {
    /// The runtime to invoke; defaults to the configured runtime.
    pub runtime: Option<String>,

    /// The path to the job payload (JSON).
    #[arg(short, long, value_name = "FILE")]
    pub payload: PathBuf,

    /// The runtime memory in MB; this backend ignores it.
    #[arg(long)]
    pub memory: Option<u64>,
}

/// Publishes a map job and prints its activation id.
pub async fn run(controller: Controller, args: InvokeArgs) -> Result<()> {
    let name = args
        .runtime
        .unwrap_or_else(|| controller.config().hpc.default_runtime_name().to_string());

    let text = tokio::fs::read_to_string(&args.payload)
        .await
        .with_context(|| {
            format!(
                "failed to read job payload `{path}`",
                path = args.payload.display()
            )
        })?;
    let payload: JobPayload =
        serde_json::from_str(&text).context("failed to parse the job payload")?;
    payload.check_parity()?;

    let activation_id = controller.invoke(&name, args.memory, &payload).await?;
    println!("{activation_id}");
    Ok(())
}
