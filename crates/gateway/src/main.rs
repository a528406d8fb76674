use std::sync::Arc;

use anyhow::Context;
use fleetline_dispatch::DispatchMatcher;
use fleetline_gateway::app::{self, AppState, services};
use fleetline_gateway::{ConnectionRegistry, DriverDirectory, bridge};
use fleetline_infra::Config;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fleetline_observability::init();

    let config = Config::from_env().context("invalid configuration")?;
    let services = services::build_services(&config).await?;

    let connections = ConnectionRegistry::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut consumers = bridge::start_all(&services.bus, &connections)
        .await
        .context("failed to start queue bridges")?;

    let matcher = Arc::new(DispatchMatcher::new(
        Arc::clone(&services.bus),
        Arc::clone(&services.presence),
    ));
    consumers.push(
        matcher
            .start()
            .await
            .context("failed to start trip matcher")?,
    );

    let gauge_sync = services
        .presence
        .spawn_gauge_sync(config.presence_sync_interval, shutdown_rx.clone());

    let directory: Arc<dyn DriverDirectory> = services.presence.clone();
    let sessions = TaskTracker::new();
    let app = app::build_app(AppState {
        bus: Arc::clone(&services.bus),
        connections: connections.clone(),
        directory,
        shutdown: shutdown_rx,
        sessions: sessions.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutting down");
            // Sessions see the signal, close their sockets and unregister their drivers.
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("http server failed")?;

    app::drain_sessions(&sessions, config.shutdown_grace).await;

    for consumer in consumers {
        consumer.shutdown().await;
    }
    if let Err(err) = gauge_sync.await {
        warn!(error = %err, "gauge sync task ended abnormally");
    }
    connections.close_all();

    info!("stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
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
}
