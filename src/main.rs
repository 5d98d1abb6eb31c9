mod clock;
mod config;
mod delivery;
mod error;
mod handlers;
mod models;
mod moderation;
mod persistence;
mod redis_client;
mod routes;
mod security;
mod state;
mod telemetry;
mod websocket;

use std::net::SocketAddr;
use std::time::Duration;
use tower_http::cors::CorsLayer;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let config = config::Config::from_env();
    let bind_addr = config.bind_addr.clone();
    let metrics = telemetry::install_metrics()?;

    tracing::info!(storage = ?config.storage, history_cap = config.moderation.history_cap, "starting chat server");
    let state = state::AppState::new(config, metrics).await?;

    // Idle rate-limit trackers, banned accounts' tokens and replenished auth quotas are dropped periodically
    let maintenance = {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                interval.tick().await;
                let pruned = state.engine.prune_rate_limits();
                let revoked = state.auth.prune_tokens();
                state.auth_throttle.prune();
                tracing::debug!(pruned, revoked, "maintenance pass");
            }
        })
    };

    let broadcaster = state.engine.broadcaster().clone();
    let app = routes::create_router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        // Open sockets would otherwise keep the server alive
        broadcaster.broadcast(&models::ServerEvent::ForceDisconnect { target: None });
    })
    .await?;

    maintenance.abort();
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
