//! The ticket consumers and their configuration.

use crate::death::DeathInfo;
use crate::dlq::DeadLetterTopology;
use crate::error::WorkerError;
use crate::handler::MessageHandler;
use crate::ticket::decode_message;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties, Consumer,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Which queue a worker consumes and what a rejection means there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerRole {
    /// Consumes the main queue; rejected messages are dead-lettered by the broker.
    Primary,
    /// Consumes the dead-letter queue; rejected messages are dropped.
    DeadLetter,
}

impl ConsumerRole {
    pub fn queue_name<'a>(&self, topology: &'a DeadLetterTopology) -> &'a str {
        match self {
            ConsumerRole::Primary => &topology.main_queue,
            ConsumerRole::DeadLetter => &topology.dead_letter_queue,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConsumerRole::Primary => "primary",
            ConsumerRole::DeadLetter => "dead-letter",
        }
    }
}

impl fmt::Display for ConsumerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Configuration for a `TicketWorker`.
///
/// Use the `WorkerConfig::builder()` method to construct this struct.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub role: ConsumerRole,
    /// Names of the queues and of the dead-letter exchange.
    pub topology: DeadLetterTopology,
    /// A unique identifier for the consumer on its queue.
    pub consumer_tag: String,
    /// The AMQP URL for connecting to the RabbitMQ broker.
    pub rabbitmq_url: String,
    /// The number of unacknowledged messages the broker may push at a time.
    pub prefetch_count: u16,
}

impl WorkerConfig {
    /// Creates a new `WorkerConfigBuilder` for a consumer of the given role.
    pub fn builder(role: ConsumerRole, rabbitmq_url: String) -> WorkerConfigBuilder {
        WorkerConfigBuilder::new(role, rabbitmq_url)
    }

    pub fn queue_name(&self) -> &str {
        self.role.queue_name(&self.topology)
    }
}

/// A builder for creating `WorkerConfig` instances.
pub struct WorkerConfigBuilder {
    role: ConsumerRole,
    rabbitmq_url: String,
    topology: Option<DeadLetterTopology>,
    consumer_tag: Option<String>,
    prefetch_count: Option<u16>,
}

impl WorkerConfigBuilder {
    fn new(role: ConsumerRole, rabbitmq_url: String) -> Self {
        Self {
            role,
            rabbitmq_url,
            topology: None,
            consumer_tag: None,
            prefetch_count: None,
        }
    }

    /// Sets custom queue and exchange names.
    /// Defaults to `DeadLetterTopology::default()`.
    pub fn topology(mut self, topology: DeadLetterTopology) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Sets a custom consumer tag.
    /// Defaults to `{queue_name}_consumer` if not set.
    pub fn consumer_tag(mut self, consumer_tag: String) -> Self {
        self.consumer_tag = Some(consumer_tag);
        self
    }

    /// Sets a custom prefetch count (QoS).
    /// Defaults to 1.
    ///
    /// Values above 1 let several deliveries be handled concurrently.
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    /// Builds the final `WorkerConfig`, applying defaults for any unset options.
    pub fn build(self) -> WorkerConfig {
        let topology = self.topology.unwrap_or_default();
        let consumer_tag = self
            .consumer_tag
            .unwrap_or_else(|| format!("{}_consumer", self.role.queue_name(&topology)));
        WorkerConfig {
            role: self.role,
            topology,
            consumer_tag,
            rabbitmq_url: self.rabbitmq_url,
            prefetch_count: self.prefetch_count.unwrap_or(1),
        }
    }
}

/// How a delivery was settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    /// Rejected without requeue.
    Rejected,
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledges this delivery only.
    async fn acknowledge(&self) -> Result<(), WorkerError>;

    /// Rejects this delivery only, without returning it to its queue.
    async fn reject_without_requeue(&self) -> Result<(), WorkerError>;
}

#[async_trait]
impl Acknowledger for Acker {
    async fn acknowledge(&self) -> Result<(), WorkerError> {
        self.ack(BasicAckOptions { multiple: false }).await?;
        Ok(())
    }

    async fn reject_without_requeue(&self) -> Result<(), WorkerError> {
        self.nack(BasicNackOptions { multiple: false, requeue: false }).await?;
        Ok(())
    }
}

/// Decodes and handles one message body, then settles it exactly once.
///
/// Decode and handler errors end in a rejection and are not returned. The only
/// error returned is a failure of the ack or nack call itself.
pub async fn process_delivery<H, A>(
    role: ConsumerRole,
    delivery_tag: u64,
    body: &[u8],
    handler: &H,
    acknowledger: &A,
) -> Result<Disposition, WorkerError>
where
    H: MessageHandler + ?Sized,
    A: Acknowledger + ?Sized,
{
    let outcome = match decode_message::<H::MessageType>(body) {
        Ok(message) => handler.handle_message(message).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(()) => {
            acknowledger.acknowledge().await?;
            log::info!("[{}] Message processed successfully. Tag: {}", role, delivery_tag);
            Ok(Disposition::Acked)
        }
        Err(e) => {
            let stage = if e.is_decode() { "decode" } else { handler.handler_name() };
            match role {
                ConsumerRole::Primary => log::error!(
                    "[{}] Failed to process message ({}), rejecting it to the dead-letter exchange. Tag: {}, Error: {}",
                    role,
                    stage,
                    delivery_tag,
                    e
                ),
                ConsumerRole::DeadLetter => log::error!(
                    "[{}] Failed to process message again ({}), discarding it. Tag: {}, Error: {}",
                    role,
                    stage,
                    delivery_tag,
                    e
                ),
            }
            acknowledger.reject_without_requeue().await?;
            Ok(Disposition::Rejected)
        }
    }
}

/// A RabbitMQ consumer that hands every delivery to a `MessageHandler`.
pub struct TicketWorker<H: MessageHandler> {
    handler: Arc<H>,
    config: WorkerConfig,
}

impl<H: MessageHandler + 'static> TicketWorker<H> {
    /// Creates a new worker.
    pub fn new(handler: Arc<H>, config: WorkerConfig) -> Self {
        Self { handler, config }
    }

    /// Runs `run` again after `reconnect_delay` whenever it fails, until `shutdown` is cancelled.
    pub async fn run_until_cancelled(&self, shutdown: CancellationToken, reconnect_delay: Duration) {
        loop {
            match self.run(shutdown.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    log::error!(
                        "[{}] Worker failed: {}. Reconnecting in {:?}...",
                        self.config.role,
                        e,
                        reconnect_delay
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(reconnect_delay) => {}
                    }
                }
            }
        }
        log::info!("[{}] Worker stopped.", self.config.role);
    }

    /// Connects to RabbitMQ, declares the topology for this role and consumes until
    /// `shutdown` is cancelled.
    ///
    /// Returns `Ok(())` only on cancellation. A closed consumer stream or a broker
    /// error is returned so the caller can reconnect.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        log::info!(
            "[{}] Connecting to RabbitMQ and setting up worker for queue '{}'...",
            self.config.role,
            self.config.queue_name()
        );

        let (connection, channel, mut consumer) = tokio::select! {
            biased;

            _ = shutdown.cancelled() => return Ok(()),
            opened = self.open() => opened?,
        };

        log::info!(
            "[{}] Consumer started with tag '{}'. Waiting for messages...",
            self.config.role,
            consumer.tag().as_str()
        );

        let mut in_flight = JoinSet::new();
        let result = loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    log::info!("[{}] Shutdown requested.", self.config.role);
                    break Ok(());
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        log::error!("[{}] Message task ended abnormally: {}", self.config.role, e);
                    }
                }
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => {
                        in_flight.spawn(Self::handle_delivery(self.config.role, self.handler.clone(), delivery));
                    }
                    Some(Err(e)) => break Err(WorkerError::from(e)),
                    None => break Err(WorkerError::from("consumer stream closed by the broker")),
                },
            }
        };

        // Unsettled deliveries go back to their queue once the channel closes.
        in_flight.abort_all();
        while in_flight.join_next().await.is_some() {}

        self.close(&connection, &channel).await;
        result
    }

    async fn open(&self) -> Result<(Connection, Channel, Consumer), WorkerError> {
        let connection = Connection::connect(&self.config.rabbitmq_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        match self.config.role {
            ConsumerRole::Primary => self.config.topology.declare_primary(&channel).await?,
            ConsumerRole::DeadLetter => self.config.topology.declare_dead_letter_queue(&channel).await?,
        }

        channel.basic_qos(self.config.prefetch_count, BasicQosOptions::default()).await?;
        log::info!("[{}] QoS prefetch count set to {}", self.config.role, self.config.prefetch_count);

        // Manual acknowledgement: no_ack stays false.
        let consumer = channel
            .basic_consume(
                self.config.queue_name(),
                &self.config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok((connection, channel, consumer))
    }

    async fn handle_delivery(role: ConsumerRole, handler: Arc<H>, delivery: Delivery) {
        let delivery_tag = delivery.delivery_tag;

        if role == ConsumerRole::DeadLetter {
            if let Some(death) = DeathInfo::from_properties(&delivery.properties) {
                log::warn!(
                    "[{}] Message dead-lettered {} time(s) from queue '{}' via exchange '{}' (reason: {}, first reason: {}, at: {}). Tag: {}",
                    role,
                    death.count,
                    death.queue.as_deref().unwrap_or("unknown"),
                    death.exchange.as_deref().unwrap_or("unknown"),
                    death.reason.as_deref().unwrap_or("unknown"),
                    death.first_death_reason.as_deref().unwrap_or("unknown"),
                    death.time.map(|t| t.to_rfc3339()).unwrap_or_else(|| "unknown".to_string()),
                    delivery_tag
                );
            }
        }

        if let Err(e) = process_delivery(role, delivery_tag, &delivery.data, handler.as_ref(), &delivery.acker).await {
            log::error!("[{}] Could not settle message. Tag: {}, Error: {}", role, delivery_tag, e);
        }
    }

    async fn close(&self, connection: &Connection, channel: &Channel) {
        if let Err(e) = channel
            .basic_cancel(&self.config.consumer_tag, BasicCancelOptions::default())
            .await
        {
            log::debug!("[{}] Consumer cancel failed: {}", self.config.role, e);
        }
        if let Err(e) = channel.close(200, "consumer shutting down").await {
            log::debug!("[{}] Channel close failed: {}", self.config.role, e);
        }
        if let Err(e) = connection.close(200, "consumer shutting down").await {
            log::debug!("[{}] Connection close failed: {}", self.config.role, e);
        }
    }
}
