use thiserror::Error;

/// Error type for the ticket consumer.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// The message body is not valid UTF-8.
    #[error("Message body is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Error during message deserialization.
    #[error("Failed to deserialize message: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// Error returned by the relational store.
    #[error("Store operation failed: {0}")]
    Store(#[from] sqlx::Error),

    /// The ticket breaks a constraint of the `Chamados` table.
    #[error("Ticket rejected by constraint: {0}")]
    Validation(String),

    /// The ticket carries the forced-failure title.
    #[error("Forced failure for ticket titled '{title}'")]
    ForcedFailure { title: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Custom messaging-related error.
    #[error("Messaging setup or configuration error: {message}")]
    MessagingError { message: String },
}

impl WorkerError {
    /// Whether the error happened before the ticket could be read from the wire.
    pub fn is_decode(&self) -> bool {
        matches!(self, WorkerError::InvalidUtf8(_) | WorkerError::Deserialization(_))
    }
}

impl From<&str> for WorkerError {
    fn from(s: &str) -> Self {
        WorkerError::MessagingError { message: s.to_string() }
    }
}

impl From<String> for WorkerError {
    fn from(s: String) -> Self {
        WorkerError::MessagingError { message: s }
    }
}
