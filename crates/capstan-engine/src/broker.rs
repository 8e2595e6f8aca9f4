//! The message broker seam and its AMQP implementation.
//!
//! Every component talks to the broker through the narrow [`Broker`] trait:
//! declare/delete durable queues, publish with persistent delivery, poll a
//! single message, or consume with explicit acknowledgement. The AMQP
//! implementation keeps one channel and reopens it lazily when the
//! connection is found closed; the operation that observed the failure is
//! not retried.

use async_trait::async_trait;
use futures::StreamExt as _;
use futures::stream::SelectAll;
use lapin::BasicProperties;
use lapin::Channel;
use lapin::Connection;
use lapin::ConnectionProperties;
use lapin::Consumer;
use lapin::acker::Acker;
use lapin::options::BasicAckOptions;
use lapin::options::BasicCancelOptions;
use lapin::options::BasicConsumeOptions;
use lapin::options::BasicGetOptions;
use lapin::options::BasicNackOptions;
use lapin::options::BasicPublishOptions;
use lapin::options::BasicQosOptions;
use lapin::options::QueueDeclareOptions;
use lapin::options::QueueDeleteOptions;
use lapin::types::FieldTable;
use tokio::sync::Mutex;
use tracing::debug;

use crate::Result;

/// Persistent delivery mode per AMQP 0.9.1.
const PERSISTENT_DELIVERY: u8 = 2;

/// The consumer prefetch used by workers.
///
/// Exactly one unacknowledged message per worker keeps admission decisions
/// strictly serialized with the broker's redelivery.
const CONSUMER_PREFETCH: u16 = 1;

/// A narrow message broker: queues, persistent publishes, consumption with
/// explicit acknowledgement.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares a durable queue. Declaring an existing queue succeeds.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Deletes a queue.
    async fn delete_queue(&self, queue: &str) -> Result<()>;

    /// Publishes a message with persistent delivery.
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<()>;

    /// Polls a queue for a single message without registering a consumer.
    ///
    /// Returns `None` when the queue is empty.
    async fn get(&self, queue: &str) -> Result<Option<Vec<u8>>>;

    /// Starts consuming from the given queues with a prefetch of one and a
    /// distinct consumer tag per queue.
    async fn consume(&self, queues: &[&str]) -> Result<Box<dyn MessageStream>>;
}

/// A merged stream of deliveries from one or more queues.
#[async_trait]
pub trait MessageStream: Send {
    /// Waits for the next delivery.
    ///
    /// Returns `None` once every consumer has been cancelled and the
    /// in-flight deliveries are exhausted.
    async fn next(&mut self) -> Result<Option<InboundMessage>>;

    /// Cancels every consumer registered by the stream.
    async fn cancel(&mut self) -> Result<()>;
}

/// The acknowledgement backchannel for one delivery.
#[async_trait]
pub trait Acknowledger: Send {
    /// Acknowledges the delivery.
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Rejects the delivery, asking the broker to requeue it.
    async fn nack_requeue(self: Box<Self>) -> Result<()>;
}

/// One delivered message plus its acknowledgement handle.
pub struct InboundMessage {
    /// The message body.
    body: Vec<u8>,
    /// The acknowledgement backchannel.
    acknowledger: Box<dyn Acknowledger>,
}

impl InboundMessage {
    /// Pairs a message body with its acknowledgement handle.
    pub fn new(body: Vec<u8>, acknowledger: Box<dyn Acknowledger>) -> Self {
        Self { body, acknowledger }
    }

    /// Gets the message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Acknowledges the message, consuming it.
    pub async fn ack(self) -> Result<()> {
        self.acknowledger.ack().await
    }

    /// Rejects the message back onto its queue.
    pub async fn nack_requeue(self) -> Result<()> {
        self.acknowledger.nack_requeue().await
    }
}

/// The AMQP implementation of [`Broker`].
pub struct AmqpBroker {
    /// The broker URL.
    url: String,
    /// The lazily opened connection and its channel.
    state: Mutex<Option<(Connection, Channel)>>,
}

impl AmqpBroker {
    /// Constructs a broker client for the given AMQP URL.
    ///
    /// No connection is opened until the first operation needs one.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: Mutex::new(None),
        }
    }

    /// Gets the current channel, reconnecting if the previous connection has
    /// been closed.
    async fn channel(&self) -> Result<Channel> {
        let mut guard = self.state.lock().await;

        if let Some((connection, channel)) = guard.as_ref()
            && connection.status().connected()
            && channel.status().connected()
        {
            return Ok(channel.clone());
        }

        debug!("connecting to the message broker");
        let connection = Connection::connect(&self.url, connection_properties()).await?;
        let channel = connection.create_channel().await?;
        *guard = Some((connection, channel.clone()));
        Ok(channel)
    }
}

/// Builds connection properties wired to the tokio runtime.
fn connection_properties() -> ConnectionProperties {
    ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio)
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.channel()
            .await?
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.channel()
            .await?
            .queue_delete(queue, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<()> {
        self.channel()
            .await?
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_delivery_mode(PERSISTENT_DELIVERY),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let message = self
            .channel()
            .await?
            .basic_get(queue, BasicGetOptions { no_ack: true })
            .await?;
        Ok(message.map(|message| message.delivery.data))
    }

    async fn consume(&self, queues: &[&str]) -> Result<Box<dyn MessageStream>> {
        let channel = self.channel().await?;
        channel
            .basic_qos(CONSUMER_PREFETCH, BasicQosOptions::default())
            .await?;

        let mut tags = Vec::with_capacity(queues.len());
        let mut merged = SelectAll::new();
        for queue in queues {
            let tag = format!("capstan-{queue}");
            let consumer: Consumer = channel
                .basic_consume(
                    queue,
                    &tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            tags.push(tag);
            merged.push(consumer);
        }

        Ok(Box::new(AmqpStream {
            channel,
            tags,
            merged,
        }))
    }
}

/// The lapin-backed [`MessageStream`].
struct AmqpStream {
    /// The channel the consumers were registered on.
    channel: Channel,
    /// The consumer tags, one per queue.
    tags: Vec<String>,
    /// The merged delivery streams.
    merged: SelectAll<Consumer>,
}

#[async_trait]
impl MessageStream for AmqpStream {
    async fn next(&mut self) -> Result<Option<InboundMessage>> {
        match self.merged.next().await {
            Some(delivery) => {
                let delivery = delivery?;
                Ok(Some(InboundMessage::new(
                    delivery.data,
                    Box::new(AmqpAcknowledger {
                        acker: delivery.acker,
                    }),
                )))
            }
            None => Ok(None),
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        for tag in &self.tags {
            debug!("cancelling consumer `{tag}`");
            self.channel
                .basic_cancel(tag, BasicCancelOptions::default())
                .await?;
        }
        Ok(())
    }
}

/// The lapin-backed [`Acknowledger`].
struct AmqpAcknowledger {
    /// The delivery's acknowledgement handle.
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcknowledger {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack_requeue(self: Box<Self>) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}
