mod observability;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use ridelink_infra::bus::NatsBus;
use ridelink_infra::config::AppConfig;
use ridelink_infra::db;
use ridelink_infra::logging::init_tracing;
use ridelink_infra::outbox::OutboxDispatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config)?;
    observability::init_metrics()?;

    let dsn = config.database_dsn();
    if dsn.is_empty() {
        anyhow::bail!("outbox worker requires POSTGRES_DSN or DATABASE_URL");
    }
    if config.nats_url.is_empty() {
        anyhow::bail!("outbox worker requires NATS_URL");
    }

    let pool = db::connect_pool(dsn).await?;
    db::ensure_schema(&pool).await?;
    let bus = Arc::new(NatsBus::connect(&config.nats_url).await?);

    let dispatcher = OutboxDispatcher::new(pool, bus, config.dispatcher_config());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    info!("outbox dispatcher starting");
    dispatcher.run(shutdown_rx).await?;
    info!("outbox dispatcher stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
