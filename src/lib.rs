//! # Chamados Consumer
//! Consumes service tickets from RabbitMQ, stores them in SQLite and gives
//! dead-lettered tickets one more attempt from a dedicated consumer.

pub mod config;
pub mod death;
pub mod dlq;
pub mod error;
pub mod handler;
pub mod store;
pub mod ticket;
pub mod worker;

// Re-export key components for easy access
pub use config::AppConfig;
pub use death::DeathInfo;
pub use dlq::DeadLetterTopology;
pub use error::WorkerError;
pub use handler::{ForcedFailure, MessageHandler, TicketHandler};
pub use store::{SqliteTicketStore, TicketStore};
pub use ticket::{Criticality, MaintenanceType, Status, Ticket};
pub use worker::{process_delivery, Acknowledger, ConsumerRole, Disposition, TicketWorker, WorkerConfig};
