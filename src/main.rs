use chamados_consumer::{
    AppConfig, ConsumerRole, SqliteTicketStore, TicketHandler, TicketWorker, WorkerConfig, WorkerError,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env()?;
    log::info!("Using RabbitMQ at {}", config.rabbitmq_url);
    if config.forced_failure.is_enabled() {
        log::warn!("Forced-failure hook is enabled; matching tickets will be dead-lettered.");
    }

    let store = Arc::new(SqliteTicketStore::connect(&config.database_url).await?);
    store.migrate().await?;

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    for role in [ConsumerRole::Primary, ConsumerRole::DeadLetter] {
        let handler = Arc::new(TicketHandler::new(role.label(), store.clone(), config.forced_failure.clone()));
        let worker_config = WorkerConfig::builder(role, config.rabbitmq_url.clone())
            .prefetch_count(config.prefetch_count)
            .build();
        let worker = TicketWorker::new(handler, worker_config);
        let shutdown = shutdown.clone();
        let reconnect_delay = config.reconnect_delay;

        tasks.push(tokio::spawn(async move {
            worker.run_until_cancelled(shutdown, reconnect_delay).await;
        }));
    }

    shutdown_signal().await;
    log::info!("Shutting down consumers...");
    shutdown.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            log::error!("Consumer task ended abnormally: {}", e);
        }
    }

    store.pool().close().await;
    log::info!("Application has shut down.");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            log::warn!("Could not listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("Ctrl+C received."),
        _ = sigterm.recv() => log::info!("SIGTERM received."),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        log::info!("Ctrl+C received.");
    }
}
