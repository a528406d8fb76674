use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;

use crate::app::AppState;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.connections.len(),
        "driversOnline": state.directory.online_drivers(),
    }))
}
