//! The error type shared by the engine's components.

use thiserror::Error as ThisError;

/// An error raised by the engine.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The configuration is missing a required field or holds an invalid
    /// value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An operation named a runtime that the configuration does not declare.
    #[error("runtime `{0}` is not defined in the configuration")]
    UnknownRuntime(String),

    /// A batch scheduler command failed.
    ///
    /// Submission failures carry the submit program's standard error.
    #[error(transparent)]
    Scheduler(#[from] capstan_slurm::Error),

    /// The worker pool job never reached the running state.
    #[error("worker pool job `{job_id}` for runtime `{runtime}` failed to start; check the pool logs")]
    WorkerPoolFailed {
        /// The runtime whose pool failed.
        runtime: String,
        /// The batch job identifier of the failed pool.
        job_id: String,
    },

    /// The metadata probe timed out or returned a malformed body.
    #[error("unable to extract metadata from runtime `{0}`")]
    MetadataUnavailable(String),

    /// The broker connection or channel failed.
    ///
    /// The connection is reopened lazily on the next operation; the failed
    /// operation itself is not retried.
    #[error("broker transport error")]
    Broker(#[from] lapin::Error),

    /// An I/O error from the object store or a co-launch artifact.
    #[error("i/o error")]
    Io(#[source] std::io::Error),

    /// The function handler could not be run or reported failure.
    #[error("function handler failed: {0}")]
    Handler(String),

    /// A message body could not be serialized or deserialized.
    #[error("malformed message body")]
    Codec(#[source] serde_json::Error),

    /// A message payload was not valid base64.
    #[error("malformed base64 payload")]
    Decode(#[from] base64::DecodeError),

    /// A job payload's parallel sequences disagree about the call count.
    #[error("inconsistent job payload: {0}")]
    Payload(String),
}

/// The result type used throughout the engine.
pub type Result<T, E = Error> = std::result::Result<T, E>;
