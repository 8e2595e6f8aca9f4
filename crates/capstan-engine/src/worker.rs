//! The compute-node worker entry point.
//!
//! One worker process runs per scheduler task. It consumes the runtime's
//! management and task queues with a prefetch of one, admits dispatched
//! chunks against a budget of free execution slots, splits chunks that do
//! not fit, and hands admitted chunks to the function handler. All admission
//! decisions are serialized by the slot pool's lock, so each worker has a
//! well-defined trace of admit/split/reject decisions even though handlers
//! complete concurrently.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::Error;
use crate::Result;
use crate::broker::Broker;
use crate::broker::InboundMessage;
use crate::message::Action;
use crate::message::Envelope;
use crate::message::JobPayload;
use crate::message::return_queue;

/// How long the consumer sleeps after rejecting a message under backpressure.
///
/// The nacked message is redelivered by the broker; the pause keeps a fully
/// busy worker from spinning on it.
const BACKPRESSURE_DELAY: Duration = Duration::from_millis(500);

/// The environment variable carrying the activation id into the handler.
///
/// The name is part of the contract with the client-side executor's runtime.
const ACTIVATION_ID_ENV: &str = "__LITHOPS_ACTIVATION_ID";

/// The environment variable naming the backend for the handler.
const BACKEND_ENV: &str = "__LITHOPS_BACKEND";

/// The backend name exported to the handler.
const BACKEND_ENV_VALUE: &str = "hpc";

/// The number of hex characters in a handler activation id.
const ACTIVATION_ID_LEN: usize = 12;

/// The outcome of an admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The given number of slots was granted; it may be fewer than requested.
    Granted(u32),
    /// No slots are free.
    Busy,
}

/// The pool of free execution slots for one worker process.
///
/// The free count starts at the configured capacity and is read and mutated
/// only under a single lock: [`SlotPool::admit`] decrements on admission and
/// [`SlotPool::release`] adds back when a handler finishes its chunk. The
/// count never leaves `0..=capacity`.
#[derive(Debug)]
pub struct SlotPool {
    /// The configured slot budget.
    capacity: u32,
    /// The free slot count.
    free: Mutex<u32>,
}

impl SlotPool {
    /// Constructs a pool with every slot free.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            free: Mutex::new(capacity),
        }
    }

    /// Gets the configured slot budget.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Gets the current free slot count.
    pub fn free(&self) -> u32 {
        *self.free.lock().expect("failed to lock slot pool")
    }

    /// Grants up to `requested` slots, decrementing the free count in the
    /// same critical section as the read.
    pub fn admit(&self, requested: u32) -> Admission {
        let mut free = self.free.lock().expect("failed to lock slot pool");
        if *free == 0 {
            return Admission::Busy;
        }

        let granted = requested.min(*free);
        *free -= granted;
        Admission::Granted(granted)
    }

    /// Returns `count` slots to the pool when a handler completes a chunk.
    pub fn release(&self, count: u32) {
        let mut free = self.free.lock().expect("failed to lock slot pool");
        debug_assert!(
            *free + count <= self.capacity,
            "released more slots than were admitted"
        );
        *free = (*free + count).min(self.capacity);
    }
}

/// The contract the worker invokes to execute user code.
///
/// Implementations own everything about the user function: fetching it,
/// running it across processes, and writing results to the job's storage.
/// The worker only sizes and schedules the chunks.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    /// Executes one admitted chunk of a map job.
    async fn run(&self, payload: JobPayload) -> Result<()>;

    /// Produces the runtime metadata snapshot (the module and version
    /// inventory the client-side executor validates against).
    async fn metadata(&self) -> Result<serde_json::Value>;
}

/// Runs the handler program deployed alongside the worker.
///
/// `<program> handle` receives the chunk payload as JSON on stdin with the
/// activation id exported in the environment; `<program> metadata` prints
/// the runtime snapshot as JSON on stdout.
#[derive(Debug, Clone)]
pub struct ProcessHandler {
    /// The handler program.
    program: PathBuf,
}

impl ProcessHandler {
    /// Constructs a handler invoking the given program.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl FunctionHandler for ProcessHandler {
    async fn run(&self, payload: JobPayload) -> Result<()> {
        let mut activation_id = Uuid::new_v4().simple().to_string();
        activation_id.truncate(ACTIVATION_ID_LEN);

        let mut child = Command::new(&self.program)
            .arg("handle")
            .env(ACTIVATION_ID_ENV, &activation_id)
            .env(BACKEND_ENV, BACKEND_ENV_VALUE)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::Handler(format!(
                    "failed to spawn `{program}`: {e}",
                    program = self.program.display()
                ))
            })?;

        let body = serde_json::to_vec(&payload).map_err(Error::Codec)?;
        let mut stdin = child.stdin.take().expect("handler stdin was piped");
        stdin
            .write_all(&body)
            .await
            .map_err(|e| Error::Handler(format!("failed to write the chunk payload: {e}")))?;
        drop(stdin);

        let status = child
            .wait()
            .await
            .map_err(|e| Error::Handler(format!("failed to wait for the handler: {e}")))?;
        if !status.success() {
            return Err(Error::Handler(format!("handler exited with {status}")));
        }

        Ok(())
    }

    async fn metadata(&self) -> Result<serde_json::Value> {
        let output = Command::new(&self.program)
            .arg("metadata")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                Error::Handler(format!(
                    "failed to run `{program} metadata`: {e}",
                    program = self.program.display()
                ))
            })?;

        if !output.status.success() {
            return Err(Error::Handler(format!(
                "metadata probe exited with {status}: {stderr}",
                status = output.status,
                stderr = String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(Error::Codec)
    }
}

/// Whether the consume loop keeps going after a message.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    /// Keep consuming.
    Continue,
    /// A stop was requested; cancel the consumers and drain.
    Stop,
}

/// One worker process's runtime state.
pub struct Worker {
    /// The broker connection.
    broker: Arc<dyn Broker>,
    /// The function handler admitted chunks are handed to.
    handler: Arc<dyn FunctionHandler>,
    /// The free execution slots.
    slots: Arc<SlotPool>,
    /// The management queue this worker consumes.
    manage_queue: String,
    /// The task queue this worker consumes and republishes remainders on.
    task_queue: String,
}

impl Worker {
    /// Constructs a worker with every slot free.
    pub fn new(
        broker: Arc<dyn Broker>,
        handler: Arc<dyn FunctionHandler>,
        manage_queue: impl Into<String>,
        task_queue: impl Into<String>,
        max_tasks: u32,
    ) -> Self {
        Self {
            broker,
            handler,
            slots: Arc::new(SlotPool::new(max_tasks)),
            manage_queue: manage_queue.into(),
            task_queue: task_queue.into(),
        }
    }

    /// Consumes both queues until a stop message arrives, then drains the
    /// in-flight handlers and returns.
    pub async fn run(&self) -> Result<()> {
        info!(
            "worker starting: task queue `{queue}`, {slots} slots",
            queue = self.task_queue,
            slots = self.slots.capacity(),
        );

        self.broker.declare_queue(&self.manage_queue).await?;
        self.broker.declare_queue(&self.task_queue).await?;

        let mut stream = self
            .broker
            .consume(&[self.manage_queue.as_str(), self.task_queue.as_str()])
            .await?;

        let mut handlers = JoinSet::new();
        while let Some(message) = stream.next().await? {
            match self.handle(message, &mut handlers).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => {
                    stream.cancel().await?;
                    break;
                }
                Err(e) => error!("failed to handle a message: {e}"),
            }
        }

        debug!("draining in-flight handlers");
        while handlers.join_next().await.is_some() {}

        info!("worker stopped");
        Ok(())
    }

    /// Handles one delivered message.
    async fn handle(&self, message: InboundMessage, handlers: &mut JoinSet<()>) -> Result<Flow> {
        let envelope = match Envelope::from_bytes(message.body()) {
            Ok(envelope) => envelope,
            Err(e) => {
                // A body that cannot be decoded would be redelivered forever;
                // drop it instead.
                warn!("discarding an undecodable message: {e}");
                message.ack().await?;
                return Ok(Flow::Continue);
            }
        };

        debug!("received `{action}`", action = envelope.action);

        match envelope.action {
            Action::GetMetadata => {
                self.send_metadata().await?;
                message.ack().await?;
            }
            Action::SendTask => {
                let payload = match envelope.decode::<JobPayload>().and_then(|payload| {
                    payload.check_parity()?;
                    Ok(payload)
                }) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("discarding an invalid task payload: {e}");
                        message.ack().await?;
                        return Ok(Flow::Continue);
                    }
                };

                self.dispatch(payload, message, handlers).await?;
            }
            Action::Stop => {
                info!("stop requested; cancelling consumers");
                message.ack().await?;
                return Ok(Flow::Stop);
            }
        }

        Ok(Flow::Continue)
    }

    /// Publishes the runtime metadata snapshot on the return queue.
    async fn send_metadata(&self) -> Result<()> {
        info!("generating runtime metadata");
        let metadata = self.handler.metadata().await?;
        let body = serde_json::to_vec(&metadata).map_err(Error::Codec)?;
        self.broker
            .publish(&return_queue(&self.manage_queue), body)
            .await?;
        info!("runtime metadata published");
        Ok(())
    }

    /// Admits, splits, or rejects one dispatched chunk.
    async fn dispatch(
        &self,
        mut payload: JobPayload,
        message: InboundMessage,
        handlers: &mut JoinSet<()>,
    ) -> Result<()> {
        let total = payload.call_ids.len() as u32;

        match self.slots.admit(total) {
            Admission::Busy => {
                debug!("all slots are busy; requeueing {total} calls");
                message.nack_requeue().await?;
                tokio::time::sleep(BACKPRESSURE_DELAY).await;
            }
            Admission::Granted(granted) => {
                if granted < total {
                    let remainder = payload.split_off(granted as usize);
                    debug!(
                        "splitting: running {granted} calls, requeueing {rest}",
                        rest = remainder.total_calls
                    );
                    let envelope = Envelope::send_task(&remainder)?;
                    self.broker
                        .publish(&self.task_queue, envelope.to_bytes()?)
                        .await?;
                }

                message.ack().await?;
                self.spawn_handler(payload, granted, handlers);
            }
        }

        Ok(())
    }

    /// Starts a handler for an admitted chunk; the slots come back when it
    /// finishes.
    fn spawn_handler(&self, mut payload: JobPayload, granted: u32, handlers: &mut JoinSet<()>) {
        payload.worker_processes = Some(granted.into());
        info!("starting {granted} calls");

        let handler = Arc::clone(&self.handler);
        let slots = Arc::clone(&self.slots);
        handlers.spawn(async move {
            if let Err(e) = handler.run(payload).await {
                error!("function handler failed: {e}");
            }
            slots.release(granted);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::broker::Acknowledger;
    use crate::broker::MessageStream;
    use crate::message::ControlPayload;

    /// What happened to a delivery.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum AckOutcome {
        Acked,
        Requeued,
    }

    /// An acknowledger that records the outcome.
    struct RecordingAcknowledger {
        outcome: Arc<StdMutex<Option<AckOutcome>>>,
    }

    #[async_trait]
    impl Acknowledger for RecordingAcknowledger {
        async fn ack(self: Box<Self>) -> Result<()> {
            *self.outcome.lock().unwrap() = Some(AckOutcome::Acked);
            Ok(())
        }

        async fn nack_requeue(self: Box<Self>) -> Result<()> {
            *self.outcome.lock().unwrap() = Some(AckOutcome::Requeued);
            Ok(())
        }
    }

    /// A broker that records publishes and scripts consumed deliveries.
    #[derive(Default)]
    struct MockBroker {
        published: StdMutex<Vec<(String, Vec<u8>)>>,
        script: StdMutex<VecDeque<InboundMessage>>,
        cancelled: Arc<StdMutex<bool>>,
    }

    #[async_trait]
    impl Broker for MockBroker {
        async fn declare_queue(&self, _queue: &str) -> Result<()> {
            Ok(())
        }

        async fn delete_queue(&self, _queue: &str) -> Result<()> {
            Ok(())
        }

        async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<()> {
            self.published.lock().unwrap().push((queue.to_string(), body));
            Ok(())
        }

        async fn get(&self, _queue: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }

        async fn consume(&self, _queues: &[&str]) -> Result<Box<dyn MessageStream>> {
            Ok(Box::new(ScriptedStream {
                messages: std::mem::take(&mut *self.script.lock().unwrap()),
                cancelled: Arc::clone(&self.cancelled),
            }))
        }
    }

    /// A stream that yields pre-scripted deliveries.
    struct ScriptedStream {
        messages: VecDeque<InboundMessage>,
        cancelled: Arc<StdMutex<bool>>,
    }

    #[async_trait]
    impl MessageStream for ScriptedStream {
        async fn next(&mut self) -> Result<Option<InboundMessage>> {
            Ok(self.messages.pop_front())
        }

        async fn cancel(&mut self) -> Result<()> {
            *self.cancelled.lock().unwrap() = true;
            self.messages.clear();
            Ok(())
        }
    }

    /// A handler that records the chunks it was given.
    #[derive(Default)]
    struct MockHandler {
        runs: StdMutex<Vec<JobPayload>>,
    }

    #[async_trait]
    impl FunctionHandler for MockHandler {
        async fn run(&self, payload: JobPayload) -> Result<()> {
            self.runs.lock().unwrap().push(payload);
            Ok(())
        }

        async fn metadata(&self) -> Result<serde_json::Value> {
            Ok(json!({ "preinstalls": [["os", true]] }))
        }
    }

    /// Builds a payload with `n` sequentially numbered calls.
    fn payload(n: usize) -> JobPayload {
        JobPayload {
            total_calls: n as u64,
            call_ids: (0..n).map(|i| format!("{i:05}")).collect(),
            data_byte_ranges: (0..n).map(|i| json!([i * 10, (i + 1) * 10])).collect(),
            job_key: "A123".to_string(),
            worker_processes: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Wraps a payload as a delivered `send_task` message.
    fn task_message(
        payload: &JobPayload,
        outcome: &Arc<StdMutex<Option<AckOutcome>>>,
    ) -> InboundMessage {
        let envelope = Envelope::send_task(payload).unwrap();
        InboundMessage::new(
            envelope.to_bytes().unwrap(),
            Box::new(RecordingAcknowledger {
                outcome: Arc::clone(outcome),
            }),
        )
    }

    /// Builds a worker over fresh mocks.
    fn worker(max_tasks: u32) -> (Worker, Arc<MockBroker>, Arc<MockHandler>) {
        let broker = Arc::new(MockBroker::default());
        let handler = Arc::new(MockHandler::default());
        let worker = Worker::new(
            broker.clone(),
            handler.clone(),
            "rt_manage",
            "rt",
            max_tasks,
        );
        (worker, broker, handler)
    }

    /// Decodes every republished task payload, draining the publish log.
    fn drain_republished(broker: &MockBroker) -> Vec<JobPayload> {
        let mut published = broker.published.lock().unwrap();
        published
            .drain(..)
            .map(|(queue, body)| {
                assert_eq!(queue, "rt");
                let envelope = Envelope::from_bytes(&body).unwrap();
                assert_eq!(envelope.action, Action::SendTask);
                envelope.decode().unwrap()
            })
            .collect()
    }

    #[test]
    fn slot_counts_stay_within_the_budget() {
        let slots = SlotPool::new(4);
        assert_eq!(slots.admit(3), Admission::Granted(3));
        assert_eq!(slots.admit(3), Admission::Granted(1));
        assert_eq!(slots.admit(3), Admission::Busy);
        assert_eq!(slots.free(), 0);

        slots.release(1);
        slots.release(3);
        assert_eq!(slots.free(), 4);
        assert_eq!(slots.admit(5), Admission::Granted(4));
    }

    #[tokio::test]
    async fn an_exact_fit_is_admitted_whole() {
        let (worker, broker, handler) = worker(4);
        let mut handlers = JoinSet::new();
        let outcome = Arc::new(StdMutex::new(None));

        let flow = worker
            .handle(task_message(&payload(4), &outcome), &mut handlers)
            .await
            .unwrap();

        assert_eq!(flow, Flow::Continue);
        assert_eq!(*outcome.lock().unwrap(), Some(AckOutcome::Acked));
        assert_eq!(worker.slots.free(), 0);
        assert!(broker.published.lock().unwrap().is_empty());

        while handlers.join_next().await.is_some() {}

        let runs = handler.runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].total_calls, 4);
        assert_eq!(runs[0].worker_processes, Some(4));
        drop(runs);

        assert_eq!(worker.slots.free(), 4);
    }

    #[tokio::test]
    async fn an_oversized_chunk_is_split_and_requeued() {
        let (worker, broker, handler) = worker(4);
        // One slot is already taken.
        assert_eq!(worker.slots.admit(1), Admission::Granted(1));

        let mut handlers = JoinSet::new();
        let outcome = Arc::new(StdMutex::new(None));
        worker
            .handle(task_message(&payload(5), &outcome), &mut handlers)
            .await
            .unwrap();

        assert_eq!(*outcome.lock().unwrap(), Some(AckOutcome::Acked));
        assert_eq!(worker.slots.free(), 0);

        let republished = drain_republished(&broker);
        assert_eq!(republished.len(), 1);
        assert_eq!(republished[0].total_calls, 2);
        assert_eq!(republished[0].call_ids, ["00003", "00004"]);
        republished[0].check_parity().unwrap();

        while handlers.join_next().await.is_some() {}

        let runs = handler.runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].call_ids, ["00000", "00001", "00002"]);
        assert_eq!(runs[0].worker_processes, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn a_busy_worker_rejects_without_consuming() {
        let (worker, broker, handler) = worker(2);
        assert_eq!(worker.slots.admit(2), Admission::Granted(2));

        let mut handlers = JoinSet::new();
        let outcome = Arc::new(StdMutex::new(None));
        worker
            .handle(task_message(&payload(3), &outcome), &mut handlers)
            .await
            .unwrap();

        assert_eq!(*outcome.lock().unwrap(), Some(AckOutcome::Requeued));
        assert_eq!(worker.slots.free(), 0);
        assert!(broker.published.lock().unwrap().is_empty());
        assert!(handler.runs.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn every_call_is_eventually_handled_once() {
        let (worker, broker, handler) = worker(4);
        let mut queue = VecDeque::from([payload(10)]);
        let mut handlers = JoinSet::new();

        while let Some(chunk) = queue.pop_front() {
            let outcome = Arc::new(StdMutex::new(None));
            worker
                .handle(task_message(&chunk, &outcome), &mut handlers)
                .await
                .unwrap();

            queue.extend(drain_republished(&broker));

            if *outcome.lock().unwrap() == Some(AckOutcome::Requeued) {
                // Let the running handlers finish so slots come back, then
                // redeliver the rejected chunk.
                while handlers.join_next().await.is_some() {}
                queue.push_back(chunk);
            }
        }

        while handlers.join_next().await.is_some() {}

        let runs = handler.runs.lock().unwrap();
        let mut handled: Vec<_> = runs
            .iter()
            .flat_map(|payload| payload.call_ids.iter().cloned())
            .collect();
        handled.sort();
        assert_eq!(handled, payload(10).call_ids);
        assert_eq!(worker.slots.free(), 4);
    }

    #[tokio::test]
    async fn metadata_requests_answer_on_the_return_queue() {
        let (worker, broker, _) = worker(2);
        let mut handlers = JoinSet::new();
        let outcome = Arc::new(StdMutex::new(None));

        let envelope = Envelope::get_metadata(&ControlPayload::default()).unwrap();
        let message = InboundMessage::new(
            envelope.to_bytes().unwrap(),
            Box::new(RecordingAcknowledger {
                outcome: Arc::clone(&outcome),
            }),
        );

        worker.handle(message, &mut handlers).await.unwrap();

        assert_eq!(*outcome.lock().unwrap(), Some(AckOutcome::Acked));
        let published = broker.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "rt_manage_return");

        let metadata: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert!(metadata.get("preinstalls").is_some());
    }

    #[tokio::test]
    async fn undecodable_messages_are_discarded() {
        let (worker, broker, handler) = worker(2);
        let mut handlers = JoinSet::new();
        let outcome = Arc::new(StdMutex::new(None));

        let message = InboundMessage::new(
            b"not an envelope".to_vec(),
            Box::new(RecordingAcknowledger {
                outcome: Arc::clone(&outcome),
            }),
        );

        let flow = worker.handle(message, &mut handlers).await.unwrap();

        assert_eq!(flow, Flow::Continue);
        assert_eq!(*outcome.lock().unwrap(), Some(AckOutcome::Acked));
        assert!(broker.published.lock().unwrap().is_empty());
        assert!(handler.runs.lock().unwrap().is_empty());
        assert_eq!(worker.slots.free(), 2);
    }

    #[tokio::test]
    async fn a_stop_message_cancels_and_drains() {
        let broker = Arc::new(MockBroker::default());
        let handler = Arc::new(MockHandler::default());

        let task_outcome = Arc::new(StdMutex::new(None));
        let stop_outcome = Arc::new(StdMutex::new(None));
        {
            let mut script = broker.script.lock().unwrap();
            script.push_back(task_message(&payload(2), &task_outcome));

            let stop = Envelope::stop(&ControlPayload::default()).unwrap();
            script.push_back(InboundMessage::new(
                stop.to_bytes().unwrap(),
                Box::new(RecordingAcknowledger {
                    outcome: Arc::clone(&stop_outcome),
                }),
            ));
        }

        let worker = Worker::new(broker.clone(), handler.clone(), "rt_manage", "rt", 2);
        worker.run().await.unwrap();

        assert_eq!(*task_outcome.lock().unwrap(), Some(AckOutcome::Acked));
        assert_eq!(*stop_outcome.lock().unwrap(), Some(AckOutcome::Acked));
        assert!(*broker.cancelled.lock().unwrap());
        assert_eq!(handler.runs.lock().unwrap().len(), 1);
        assert_eq!(worker.slots.free(), 2);
    }
}
