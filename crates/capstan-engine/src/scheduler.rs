//! The batch scheduler seam and its Slurm implementation.
//!
//! The controller describes a worker pool as a typed [`PoolRequest`] and
//! hands it to a [`BatchScheduler`]; the Slurm implementation translates the
//! request into an [`Sbatch`] submission and wraps the resulting job handle.

use std::time::Duration;

use async_trait::async_trait;
use capstan_slurm::DirectiveValue;
use capstan_slurm::Sbatch;
use capstan_slurm::SlurmJob;
use indexmap::IndexMap;
use tracing::debug;

use crate::Error;
use crate::Result;

/// A typed description of a worker-pool submission.
#[derive(Debug, Clone)]
pub struct PoolRequest {
    /// The scheduler job name.
    pub job_name: String,
    /// The path pattern for the pool's stdout log.
    pub stdout_log: String,
    /// The path pattern for the pool's stderr log.
    pub stderr_log: String,
    /// The account the pool is charged to.
    pub account: String,
    /// The quality-of-service the pool is submitted under.
    pub qos: String,
    /// The number of worker tasks.
    pub tasks: u32,
    /// The CPUs allocated to each worker task.
    pub cpus_per_task: u32,
    /// The pool's wall-clock limit.
    pub time_limit: Duration,
    /// The signal hook, e.g. `SIGUSR1@20`.
    pub signal: Option<String>,
    /// The GPUs requested per worker task.
    pub gpus_per_worker: Option<u32>,
    /// Additional directives appended after the typed ones.
    pub extra_args: IndexMap<String, DirectiveValue>,
    /// Shell commands run before the workers are launched.
    pub setup: Vec<String>,
    /// The launcher prefix for the worker command, e.g. `srun -l`.
    pub launcher: Vec<String>,
    /// The worker command and its arguments.
    pub command: Vec<String>,
}

/// A batch scheduler able to run worker pools.
#[async_trait]
pub trait BatchScheduler: Send + Sync {
    /// Submits a worker pool, returning a handle to the queued job.
    async fn submit(&self, request: PoolRequest) -> Result<Box<dyn BatchJob>>;

    /// Reconstructs a job handle from a persisted identifier.
    fn job_from_id(&self, id: &str) -> Box<dyn BatchJob>;
}

/// A handle to a submitted worker-pool job.
#[async_trait]
pub trait BatchJob: Send + Sync {
    /// Gets the scheduler-assigned job identifier.
    fn id(&self) -> &str;

    /// Polls until the job reaches `target`; an empty target waits for the
    /// job to leave the queue.
    ///
    /// Returns `false` on timeout or when the job is gone while a non-empty
    /// target was expected.
    async fn wait_for_state(
        &self,
        target: &str,
        poll: Duration,
        timeout: Option<Duration>,
    ) -> Result<bool>;

    /// Determines whether the job is currently running.
    async fn is_running(&self) -> Result<bool>;

    /// Looks up the hostname of the node the job runs on.
    async fn hostname(&self) -> Result<String>;

    /// Cancels the job.
    async fn cancel(&self) -> Result<()>;
}

/// The Slurm implementation of [`BatchScheduler`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SlurmScheduler;

impl SlurmScheduler {
    /// Constructs the scheduler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BatchScheduler for SlurmScheduler {
    async fn submit(&self, request: PoolRequest) -> Result<Box<dyn BatchJob>> {
        let mut sbatch = Sbatch::new();
        sbatch.arg("job_name", request.job_name.as_str())?;
        sbatch.arg("output", request.stdout_log.as_str())?;
        sbatch.arg("error", request.stderr_log.as_str())?;
        sbatch.arg("account", request.account.as_str())?;
        sbatch.arg("qos", request.qos.as_str())?;
        sbatch.arg("ntasks", request.tasks)?;
        sbatch.arg("cpus_per_task", request.cpus_per_task)?;
        sbatch.arg("time", request.time_limit)?;

        if let Some(signal) = &request.signal {
            sbatch.arg("signal", signal.as_str())?;
        }

        if let Some(gpus) = request.gpus_per_worker {
            sbatch.arg("gres", format!("gpu:{gpus}"))?;
        }

        for (key, value) in &request.extra_args {
            sbatch.arg(key, value.clone())?;
        }

        for line in &request.setup {
            sbatch.cmd(line.clone());
        }

        let command = request.launcher.iter().chain(request.command.iter());
        let job = sbatch.submit(command).await?;
        debug!("worker pool queued as job `{id}`", id = job.id());

        Ok(Box::new(SlurmPoolJob(job)))
    }

    fn job_from_id(&self, id: &str) -> Box<dyn BatchJob> {
        Box::new(SlurmPoolJob(SlurmJob::from_id(id)))
    }
}

/// A Slurm job wrapped as a [`BatchJob`].
struct SlurmPoolJob(SlurmJob);

#[async_trait]
impl BatchJob for SlurmPoolJob {
    fn id(&self) -> &str {
        self.0.id()
    }

    async fn wait_for_state(
        &self,
        target: &str,
        poll: Duration,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        Ok(self.0.wait(target, poll, timeout).await?)
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.0.is_running().await?)
    }

    async fn hostname(&self) -> Result<String> {
        Ok(self.0.hostname().await?)
    }

    async fn cancel(&self) -> Result<()> {
        Ok(self.0.cancel().await?)
    }
}

/// Converts a configured extra argument into a typed directive value.
///
/// Mappings and sequences convert recursively; a null stands for a bare flag.
pub fn directive_from_yaml(value: &serde_yaml_ng::Value) -> Result<DirectiveValue> {
    use serde_yaml_ng::Value;

    match value {
        Value::Null => Ok(DirectiveValue::Flag(true)),
        Value::Bool(flag) => Ok(DirectiveValue::Flag(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(int) => Ok(DirectiveValue::Int(int)),
            None => Ok(DirectiveValue::Str(number.to_string())),
        },
        Value::String(text) => Ok(DirectiveValue::Str(text.clone())),
        Value::Sequence(items) => Ok(DirectiveValue::List(
            items.iter().map(directive_from_yaml).collect::<Result<_>>()?,
        )),
        Value::Mapping(entries) => {
            let mut map = IndexMap::new();
            for (key, value) in entries {
                let Value::String(key) = key else {
                    return Err(Error::Config(format!(
                        "extra scheduler argument has a non-string sub-key: {key:?}"
                    )));
                };
                map.insert(key.clone(), directive_from_yaml(value)?);
            }
            Ok(DirectiveValue::Map(map))
        }
        Value::Tagged(_) => Err(Error::Config(
            "extra scheduler arguments may not use YAML tags".to_string(),
        )),
    }
}
