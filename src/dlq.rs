//! Dead-letter topology for the ticket queues.
//!
//! Rejected messages are never republished by the consumer. The main queue names
//! a dead-letter exchange in its arguments, so a nack without requeue makes the
//! broker route the message to the dead-letter queue.

use crate::error::WorkerError;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    Channel, ExchangeKind,
};

pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Names of the main queue, the dead-letter exchange and the dead-letter queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetterTopology {
    pub main_queue: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
}

impl DeadLetterTopology {
    /// Derives the names from a base name: `fila_{base}`, `dlx_{base}` and `dlq_{base}`.
    pub fn new(base_name: &str) -> Self {
        Self {
            main_queue: format!("fila_{}", base_name),
            dead_letter_exchange: format!("dlx_{}", base_name),
            dead_letter_queue: format!("dlq_{}", base_name),
        }
    }

    /// Arguments of the main queue, pointing it at the dead-letter exchange.
    pub fn main_queue_arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        args.insert(
            DEAD_LETTER_EXCHANGE_ARG.into(),
            AMQPValue::LongString(self.dead_letter_exchange.clone().into()),
        );
        args
    }

    /// Declares the dead-letter exchange, the dead-letter queue and its binding,
    /// then the main queue. Safe to repeat.
    pub async fn declare_primary(&self, channel: &Channel) -> Result<(), WorkerError> {
        channel
            .exchange_declare(
                &self.dead_letter_exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;

        self.declare_dead_letter_queue(channel).await?;

        // Fanout ignores the routing key.
        channel
            .queue_bind(
                &self.dead_letter_queue,
                &self.dead_letter_exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_declare(
                &self.main_queue,
                QueueDeclareOptions { durable: true, ..Default::default() },
                self.main_queue_arguments(),
            )
            .await?;

        log::info!(
            "Queue '{}' set up with dead-letter exchange '{}' feeding '{}'.",
            self.main_queue,
            self.dead_letter_exchange,
            self.dead_letter_queue
        );
        Ok(())
    }

    /// Declares only the dead-letter queue.
    ///
    /// The exchange and binding belong to the primary consumer; this covers the
    /// case where the dead-letter consumer starts first.
    pub async fn declare_dead_letter_queue(&self, channel: &Channel) -> Result<(), WorkerError> {
        channel
            .queue_declare(
                &self.dead_letter_queue,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }
}

impl Default for DeadLetterTopology {
    fn default() -> Self {
        Self::new("chamados")
    }
}
