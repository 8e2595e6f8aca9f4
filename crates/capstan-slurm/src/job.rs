//! Handles to submitted Slurm jobs.

use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use tokio::process::Command;
use tracing::debug;
use tracing::trace;

use crate::Error;
use crate::Result;

/// The state reported by the scheduler while a job is executing.
pub const RUNNING_STATE: &str = "RUNNING";

/// A handle to a job known to the scheduler.
///
/// The handle stores only the job identifier (plus the submitted script, when
/// the job was created by [`Sbatch::submit`][crate::Sbatch::submit]); every
/// query spawns the corresponding scheduler program.
#[derive(Debug, Clone)]
pub struct SlurmJob {
    /// The scheduler-assigned job identifier.
    id: String,
    /// The batch script the job was submitted with, if known.
    script: Option<String>,
}

impl SlurmJob {
    /// Constructs a handle for a freshly submitted job.
    pub(crate) fn new(id: String, script: Option<String>) -> Self {
        Self { id, script }
    }

    /// Reconstructs a handle from a previously persisted job identifier.
    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: None,
        }
    }

    /// Gets the scheduler-assigned job identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Gets the batch script the job was submitted with, if known.
    pub fn script(&self) -> Option<&str> {
        self.script.as_deref()
    }

    /// Queries the job's current queue state with `squeue`.
    ///
    /// An empty state means the job is no longer queued.
    pub async fn state(&self) -> Result<String> {
        let stdout = run_for_stdout("squeue", &["-h", "-j", &self.id, "-o", "%T"]).await?;
        Ok(stdout.trim().to_string())
    }

    /// Polls the queue until the job reaches the `target` state.
    ///
    /// Returns `true` when the state equals `target`. Returns `false` when
    /// the reported state becomes empty (the job has left the queue) or when
    /// `timeout` elapses; `None` waits indefinitely. An empty `target` is
    /// therefore a wait for the job to leave the queue.
    ///
    /// Transient command failures are not retried; they propagate to the
    /// caller.
    pub async fn wait(&self, target: &str, poll: Duration, timeout: Option<Duration>) -> Result<bool> {
        debug!("waiting for job `{id}` to reach `{target}`", id = self.id);

        let start = Instant::now();
        loop {
            let state = self.state().await?;
            if state.is_empty() || state == target {
                return Ok(state == target);
            }

            debug!("job `{id}` is {state}", id = self.id);

            if let Some(timeout) = timeout
                && start.elapsed() + poll >= timeout
            {
                debug!("gave up waiting for job `{id}`", id = self.id);
                return Ok(false);
            }

            tokio::time::sleep(poll).await;
        }
    }

    /// Looks up the hostname of the node the job is running on.
    // TODO: return every hostname for jobs spanning more than one node.
    pub async fn hostname(&self) -> Result<String> {
        let stdout = run_for_stdout("squeue", &["-h", "-j", &self.id, "-o", "%N"]).await?;
        Ok(stdout.trim().to_string())
    }

    /// Determines whether the job is currently running according to the
    /// scheduler's accounting records.
    pub async fn is_running(&self) -> Result<bool> {
        let stdout = run_for_stdout("sacct", &["-n", "-j", &self.id, "-o", "State"]).await?;
        Ok(stdout
            .lines()
            .next()
            .map(str::trim)
            .is_some_and(|state| state == RUNNING_STATE))
    }

    /// Cancels the job with `scancel`.
    pub async fn cancel(&self) -> Result<()> {
        run_for_stdout("scancel", &[&self.id]).await?;
        Ok(())
    }
}

/// Runs a scheduler program and returns its stdout.
///
/// A nonzero exit status or non-UTF-8 output is an error.
async fn run_for_stdout(program: &'static str, args: &[&str]) -> Result<String> {
    trace!(program, ?args, "querying the scheduler");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| Error::Io { program, source })?;

    if !output.status.success() {
        return Err(Error::CommandFailed {
            program,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    String::from_utf8(output.stdout).map_err(|_| Error::UnexpectedOutput {
        program,
        reason: "output was not UTF-8".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_reconstruct_from_persisted_ids() {
        let job = SlurmJob::from_id("48213");
        assert_eq!(job.id(), "48213");
        assert!(job.script().is_none());
    }
}
