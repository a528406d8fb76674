//! WebSocket endpoints for drivers and riders.
//!
//! Each socket is served by one session task that owns it: outbound frames
//! arrive through the connection's channel, inbound frames are read between
//! them, and the process shutdown signal ends the session. Sessions are
//! tracked in `AppState::sessions` so shutdown can wait for drivers to be
//! unregistered.

use axum::extract::rejection::QueryRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use fleetline_core::Identity;
use fleetline_events::contracts::routing_keys;
use fleetline_events::{DriverMessage, Envelope, OutboundFrame};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::app::errors::GatewayError;
use crate::connection::{Connection, Outbound, WsConnection};

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "userID")]
    user_id: Option<String>,
    #[serde(rename = "packageSlug")]
    package_slug: Option<String>,
}

fn required(value: Option<String>, name: &str) -> Result<String, GatewayError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| GatewayError::Validation(format!("{name} is required")))
}

fn identity(params: &mut ConnectParams) -> Result<Identity, GatewayError> {
    let user_id = required(params.user_id.take(), "userID")?;
    Identity::parse(user_id).map_err(|e| GatewayError::Validation(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Driver,
    Rider,
}

/// GET /ws/drivers?userID=..&packageSlug=..
pub async fn drivers(
    State(state): State<AppState>,
    params: Result<Query<ConnectParams>, QueryRejection>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, GatewayError> {
    let Query(mut params) = params?;
    let driver_id = identity(&mut params)?;
    let package_slug = required(params.package_slug.take(), "packageSlug")?;
    let ws = ws?;

    let sessions = state.sessions.clone();
    Ok(ws
        .on_upgrade(move |socket| {
            sessions.track_future(driver_session(socket, state, driver_id, package_slug))
        })
        .into_response())
}

/// GET /ws/riders?userID=..
pub async fn riders(
    State(state): State<AppState>,
    params: Result<Query<ConnectParams>, QueryRejection>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, GatewayError> {
    let Query(mut params) = params?;
    let rider_id = identity(&mut params)?;
    let ws = ws?;

    let sessions = state.sessions.clone();
    Ok(ws
        .on_upgrade(move |socket| sessions.track_future(rider_session(socket, state, rider_id)))
        .into_response())
}

async fn driver_session(
    socket: WebSocket,
    state: AppState,
    driver_id: Identity,
    package_slug: String,
) {
    let (conn, outbound) = WsConnection::open(driver_id.clone());
    let connection_id = conn.id();
    state.connections.add(conn.clone());
    info!(driver_id = %driver_id, package = %package_slug, connection_id = %connection_id, "driver connected");

    match state
        .directory
        .register_driver(driver_id.as_str(), &package_slug)
        .await
    {
        Ok(profile) => match serde_json::to_value(&profile) {
            Ok(data) => {
                let frame = OutboundFrame::new(routing_keys::DRIVER_CMD_REGISTER, data);
                if let Err(err) = conn.send(&frame) {
                    warn!(driver_id = %driver_id, error = %err, "failed to send registration");
                }
            }
            Err(err) => warn!(driver_id = %driver_id, error = %err, "profile not serializable"),
        },
        Err(err) => {
            warn!(driver_id = %driver_id, error = %err, "driver registration rejected");
            conn.close();
        }
    }

    run_session(socket, outbound, &state, &driver_id, Role::Driver).await;

    // A superseded session must not take its replacement's driver offline.
    if state
        .connections
        .remove_connection(driver_id.as_str(), connection_id)
    {
        state.directory.unregister_driver(driver_id.as_str()).await;
    }
    info!(driver_id = %driver_id, connection_id = %connection_id, "driver disconnected");
}

async fn rider_session(socket: WebSocket, state: AppState, rider_id: Identity) {
    let (conn, outbound) = WsConnection::open(rider_id.clone());
    let connection_id = conn.id();
    state.connections.add(conn);
    info!(rider_id = %rider_id, connection_id = %connection_id, "rider connected");

    run_session(socket, outbound, &state, &rider_id, Role::Rider).await;

    state
        .connections
        .remove_connection(rider_id.as_str(), connection_id);
    info!(rider_id = %rider_id, connection_id = %connection_id, "rider disconnected");
}

async fn run_session(
    mut socket: WebSocket,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    state: &AppState,
    identity: &Identity,
    role: Role,
) {
    let mut shutdown = state.shutdown.clone();
    if *shutdown.borrow_and_update() {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            next = outbound.recv() => match next {
                Some(Outbound::Text(text)) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => match role {
                    Role::Driver => handle_driver_message(state, identity, &text).await,
                    Role::Rider => debug!(rider_id = %identity, "rider message ignored"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(identity = %identity, error = %err, "socket read failed");
                    break;
                }
            },
        }
    }
}

async fn handle_driver_message(state: &AppState, driver_id: &Identity, text: &str) {
    let message = match DriverMessage::parse(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(driver_id = %driver_id, error = %err, "malformed driver message skipped");
            return;
        }
    };

    match message {
        DriverMessage::Location(_) => {
            debug!(driver_id = %driver_id, "location update received");
        }
        DriverMessage::Unknown(kind) => {
            warn!(driver_id = %driver_id, kind = %kind, "unknown driver message type");
        }
        message => {
            let Some((routing_key, data)) = message.into_forward() else {
                return;
            };
            let envelope = Envelope::directed(driver_id.as_str(), data);
            if let Err(err) = state.bus.publish(routing_key, envelope).await {
                warn!(driver_id = %driver_id, routing_key, error = %err, "failed to forward driver response");
            }
        }
    }
}
