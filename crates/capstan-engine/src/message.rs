//! The wire protocol between the controller and the workers.
//!
//! Both queues carry the same envelope: an action tag plus a base64-encoded
//! JSON body. Task bodies are [`JobPayload`]s; control bodies are
//! [`ControlPayload`]s. Fields the engine does not interpret round-trip
//! through a payload untouched so the function handler sees exactly what the
//! client-side executor sent.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Error;
use crate::Result;

/// The suffix appended to a management queue to name its return queue.
pub const RETURN_QUEUE_SUFFIX: &str = "_return";

/// Gets the name of a runtime's management queue.
pub fn management_queue(runtime: &str) -> String {
    format!("{runtime}_manage")
}

/// Gets the name of the return queue paired with a management queue.
pub fn return_queue(management_queue: &str) -> String {
    format!("{management_queue}{RETURN_QUEUE_SUFFIX}")
}

/// The action carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Ask a worker to publish its runtime metadata on the return queue.
    GetMetadata,
    /// Dispatch a chunk of a map job.
    SendTask,
    /// Ask a worker to stop consuming and drain.
    Stop,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetMetadata => write!(f, "get_metadata"),
            Self::SendTask => write!(f, "send_task"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// The message envelope published on the task and management queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// The action the receiver should take.
    pub action: Action,
    /// The base64-encoded JSON body.
    pub payload: String,
}

impl Envelope {
    /// Wraps a body under the given action tag.
    fn new<T: Serialize>(action: Action, body: &T) -> Result<Self> {
        let json = serde_json::to_vec(body).map_err(Error::Codec)?;
        Ok(Self {
            action,
            payload: BASE64.encode(json),
        })
    }

    /// Builds a task-dispatch envelope.
    pub fn send_task(payload: &JobPayload) -> Result<Self> {
        Self::new(Action::SendTask, payload)
    }

    /// Builds a metadata-request envelope.
    pub fn get_metadata(payload: &ControlPayload) -> Result<Self> {
        Self::new(Action::GetMetadata, payload)
    }

    /// Builds a stop envelope.
    pub fn stop(payload: &ControlPayload) -> Result<Self> {
        Self::new(Action::Stop, payload)
    }

    /// Decodes the envelope's body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = BASE64.decode(&self.payload)?;
        serde_json::from_slice(&bytes).map_err(Error::Codec)
    }

    /// Serializes the envelope for publishing.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::Codec)
    }

    /// Deserializes an envelope from a delivered message body.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Error::Codec)
    }
}

/// The body of a `send_task` message: one chunk of a map job.
///
/// `call_ids` and `data_byte_ranges` are parallel sequences of length
/// `total_calls`. Fields beyond the ones named here belong to the function
/// handler and pass through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// The number of calls in this chunk.
    pub total_calls: u64,
    /// The identifiers of the calls, parallel to `data_byte_ranges`.
    pub call_ids: Vec<String>,
    /// The input-data byte range of each call, parallel to `call_ids`.
    pub data_byte_ranges: Vec<serde_json::Value>,
    /// The key of the job this chunk belongs to.
    pub job_key: String,
    /// The number of admitted calls, stamped by a worker before the chunk is
    /// handed to the function handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_processes: Option<u64>,
    /// Fields the engine does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl JobPayload {
    /// Ensures the parallel sequences agree with `total_calls`.
    pub fn check_parity(&self) -> Result<()> {
        if self.call_ids.len() as u64 != self.total_calls
            || self.data_byte_ranges.len() as u64 != self.total_calls
        {
            return Err(Error::Payload(format!(
                "total_calls is {total} but there are {ids} call ids and {ranges} byte ranges",
                total = self.total_calls,
                ids = self.call_ids.len(),
                ranges = self.data_byte_ranges.len(),
            )));
        }

        Ok(())
    }

    /// Slices the payload into consecutive chunks of at most `granularity`
    /// calls; the last chunk may be shorter.
    pub fn chunks(&self, granularity: usize) -> Vec<JobPayload> {
        assert!(granularity > 0, "granularity must be positive");

        let total = self.call_ids.len();
        let mut chunks = Vec::with_capacity(total.div_ceil(granularity));
        let mut start = 0;
        while start < total {
            let end = usize::min(start + granularity, total);
            let mut chunk = self.clone();
            chunk.call_ids = self.call_ids[start..end].to_vec();
            chunk.data_byte_ranges = self.data_byte_ranges[start..end].to_vec();
            chunk.total_calls = (end - start) as u64;
            chunks.push(chunk);
            start = end;
        }

        chunks
    }

    /// Splits off the calls at `[keep, total)` into a new payload, truncating
    /// this payload to its first `keep` calls.
    pub fn split_off(&mut self, keep: usize) -> JobPayload {
        let mut remainder = self.clone();
        remainder.call_ids = self.call_ids.split_off(keep);
        remainder.data_byte_ranges = self.data_byte_ranges.split_off(keep);
        remainder.total_calls = remainder.call_ids.len() as u64;
        self.total_calls = keep as u64;
        remainder
    }
}

/// The body of a `get_metadata` or `stop` message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlPayload {
    /// The log level the worker should mirror.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl ControlPayload {
    /// Captures the controller's current log level.
    pub fn current() -> Self {
        Self {
            log_level: Some(
                tracing::level_filters::LevelFilter::current()
                    .to_string()
                    .to_lowercase(),
            ),
        }
    }
}
