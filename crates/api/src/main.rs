mod error;
mod middleware;
mod observability;
mod routes;
mod state;
mod validation;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;

use ridelink_infra::{config::AppConfig, logging::init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config)?;
    observability::init_metrics()?;

    let state = state::AppState::new(config.clone()).await?;
    let app = routes::router(state);

    let listener = TcpListener::bind(&config.http_addr).await?;
    info!(addr = %config.http_addr, "starting api");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|err| {
        tracing::error!(error = %err, "server exited");
        err
    })?;

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
