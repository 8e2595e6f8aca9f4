//! Implementation of the `worker` command: the compute-node entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use capstan_engine::broker::AmqpBroker;
use capstan_engine::config::DEFAULT_FUNCTION_HANDLER;
use capstan_engine::worker::ProcessHandler;
use capstan_engine::worker::Worker;
use clap::Parser;
use tracing::info;

/// Arguments for the `worker` command.
///
/// The positional arguments mirror the command line the controller builds
/// into the batch submission.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// The AMQP URL of the message broker.
    pub amqp_url: String,

    /// The management queue to consume.
    pub manage_queue: String,

    /// The task queue to consume.
    pub task_queue: String,

    /// The number of calls this worker can run at once.
    pub max_tasks: u32,

    /// The function-handler program admitted chunks are handed to.
    #[arg(long, default_value = DEFAULT_FUNCTION_HANDLER, value_name = "PROGRAM")]
    pub handler: PathBuf,
}

/// Runs the worker until its pool is stopped.
pub async fn run(args: WorkerArgs) -> Result<()> {
    info!(
        "starting worker node: max_tasks={max_tasks}",
        max_tasks = args.max_tasks
    );

    let broker = Arc::new(AmqpBroker::new(args.amqp_url));
    let handler = Arc::new(ProcessHandler::new(args.handler));
    let worker = Worker::new(
        broker,
        handler,
        args.manage_queue,
        args.task_queue,
        args.max_tasks,
    );

    worker.run().await?;
    Ok(())
}
