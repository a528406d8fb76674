use axum::extract::rejection::QueryRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use thiserror::Error;

/// Failure of a request before any connection state exists.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or invalid request parameter.
    #[error("{0}")]
    Validation(String),

    /// The request is not an acceptable WebSocket handshake.
    #[error("{0}")]
    Protocol(String),
}

impl From<WebSocketUpgradeRejection> for GatewayError {
    fn from(rejection: WebSocketUpgradeRejection) -> Self {
        Self::Protocol(rejection.body_text())
    }
}

impl From<QueryRejection> for GatewayError {
    fn from(rejection: QueryRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
            Self::Protocol(msg) => json_error(StatusCode::BAD_REQUEST, "protocol_error", msg),
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
