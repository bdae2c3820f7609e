//! Defines the core trait for message handling logic and the ticket handler.

use crate::error::WorkerError;
use crate::store::TicketStore;
use crate::ticket::Ticket;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

/// Title that makes the ticket handler fail on purpose.
pub const DEFAULT_FORCED_FAILURE_TITLE: &str = "DLQ";

/// A trait for processing messages from a RabbitMQ queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The type of the message that this handler can process.
    /// Must be deserializable from JSON.
    type MessageType: for<'de> Deserialize<'de> + Send + Sync;

    /// Processes a single deserialized message.
    ///
    /// # Returns
    /// `Ok(())` if the message was processed successfully, or a `WorkerError` if not.
    async fn handle_message(&self, message: Self::MessageType) -> Result<(), WorkerError>;

    /// A name for the handler, used for logging and identification.
    fn handler_name(&self) -> &str;
}

/// Test hook that fails every ticket whose title equals a marker.
///
/// Used to exercise the dead-letter path end to end. An empty marker disables it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedFailure {
    title: Option<String>,
}

impl ForcedFailure {
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        Self { title: (!title.is_empty()).then_some(title) }
    }

    pub fn disabled() -> Self {
        Self { title: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.title.is_some()
    }

    pub fn check(&self, ticket: &Ticket) -> Result<(), WorkerError> {
        match &self.title {
            Some(marker) if *marker == ticket.title => Err(WorkerError::ForcedFailure { title: ticket.title.clone() }),
            _ => Ok(()),
        }
    }
}

impl Default for ForcedFailure {
    fn default() -> Self {
        Self::new(DEFAULT_FORCED_FAILURE_TITLE)
    }
}

/// Persists every ticket it receives.
pub struct TicketHandler<S: TicketStore> {
    name: String,
    store: Arc<S>,
    forced_failure: ForcedFailure,
}

impl<S: TicketStore> TicketHandler<S> {
    pub fn new(name: impl Into<String>, store: Arc<S>, forced_failure: ForcedFailure) -> Self {
        Self { name: name.into(), store, forced_failure }
    }
}

#[async_trait]
impl<S: TicketStore> MessageHandler for TicketHandler<S> {
    type MessageType = Ticket;

    async fn handle_message(&self, ticket: Ticket) -> Result<(), WorkerError> {
        log::info!("[{}] Ticket received: {}", self.name, ticket);

        self.forced_failure.check(&ticket)?;
        ticket.validate()?;

        let id = self.store.save(&ticket).await?;
        log::info!("[{}] Ticket saved with id {}.", self.name, id);
        Ok(())
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}
