//! Persistence gateway for tickets.

use crate::error::WorkerError;
use crate::ticket::Ticket;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Acquire;
use std::str::FromStr;
use std::time::Duration;

/// Default location of the SQLite database.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://chamados.db";

const SCHEMA: &str = "
    create table if not exists Chamados (
        Id integer primary key autoincrement,
        Titulo text not null check (length(Titulo) <= 100),
        Descricao text not null check (length(Descricao) <= 500),
        TipoManutencao integer not null check (TipoManutencao in (1, 2, 3)),
        Criticidade integer not null check (Criticidade in (1, 2, 3)),
        Tecnico text not null check (length(Tecnico) <= 100),
        DataAbertura datetime not null,
        DataFechamento datetime,
        Status integer not null check (Status in (0, 1)),
        Equipamento text not null check (length(Equipamento) <= 100),
        Localizacao text not null check (length(Localizacao) <= 200),
        Modelo text not null check (length(Modelo) <= 100),
        check (Status = 0 or DataFechamento is null)
    );
";

/// Appends tickets to durable storage.
///
/// Implementations insert and commit before returning and never retry; the
/// dead-letter hop is the only retry this consumer has.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Persists one ticket and returns the identifier assigned by the store.
    async fn save(&self, ticket: &Ticket) -> Result<i64, WorkerError>;
}

/// `TicketStore` backed by a SQLite connection pool.
#[derive(Clone, Debug)]
pub struct SqliteTicketStore {
    pool: SqlitePool,
}

impl SqliteTicketStore {
    /// Opens the database at `url`, creating the file if needed.
    pub async fn connect(url: &str) -> Result<Self, WorkerError> {
        let options = SqliteConnectOptions::from_str(url)?
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        log::info!("Connected to ticket store at '{}'", url);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the `Chamados` table if it does not exist yet.
    pub async fn migrate(&self) -> Result<(), WorkerError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TicketStore for SqliteTicketStore {
    async fn save(&self, ticket: &Ticket) -> Result<i64, WorkerError> {
        // Connection goes back to the pool when dropped, on success or error.
        let mut conn = self.pool.acquire().await?;
        let mut txn = conn.begin().await?;

        let result = sqlx::query(
            "
            insert into Chamados (
                Titulo, Descricao, TipoManutencao, Criticidade, Tecnico,
                DataAbertura, DataFechamento, Status, Equipamento, Localizacao, Modelo
            )
            values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&ticket.title)
        .bind(&ticket.description)
        .bind(i64::from(u8::from(ticket.maintenance_type)))
        .bind(i64::from(u8::from(ticket.criticality)))
        .bind(&ticket.technician)
        .bind(ticket.opened_at)
        .bind(ticket.closed_at)
        .bind(i64::from(u8::from(ticket.status)))
        .bind(&ticket.equipment)
        .bind(&ticket.location)
        .bind(&ticket.model)
        .execute(&mut *txn)
        .await?;

        txn.commit().await?;
        Ok(result.last_insert_rowid())
    }
}
