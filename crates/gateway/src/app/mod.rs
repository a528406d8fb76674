//! HTTP application wiring (axum router + shared state).
//!
//! - `services.rs`: backing services (bus, presence store) from config
//! - `routes/`: WebSocket endpoints and system routes
//! - `errors.rs`: consistent error responses

use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::get};
use fleetline_events::MessageBus;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tower::ServiceBuilder;
use tracing::{info, warn};

use crate::connection::ConnectionRegistry;
use crate::directory::DriverDirectory;

pub mod errors;
pub mod routes;
pub mod services;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<dyn MessageBus>,
    pub connections: ConnectionRegistry,
    pub directory: Arc<dyn DriverDirectory>,
    /// Flips to `true` when the process is shutting down.
    pub shutdown: watch::Receiver<bool>,
    /// Open WebSocket sessions.
    pub sessions: TaskTracker,
}

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .route("/ws/drivers", get(routes::ws::drivers))
        .route("/ws/riders", get(routes::ws::riders))
        .with_state(state)
        .layer(ServiceBuilder::new())
}

/// Wait up to `grace` for every open session to finish its exit path.
///
/// Call after the shutdown signal was sent. Returns `false` when sessions were
/// still running at the deadline.
pub async fn drain_sessions(sessions: &TaskTracker, grace: Duration) -> bool {
    sessions.close();
    let open = sessions.len();
    if open > 0 {
        info!(sessions = open, "waiting for sessions to close");
    }
    match tokio::time::timeout(grace, sessions.wait()).await {
        Ok(()) => true,
        Err(_) => {
            warn!(sessions = sessions.len(), "sessions still open after grace period");
            false
        }
    }
}
