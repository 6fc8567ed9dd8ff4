use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lumen_client::ClientError;
use serde_json::json;
use thiserror::Error;

use crate::orchestrator::OrchestratorError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl ApiError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Orchestrator(OrchestratorError::PreconditionFailed(message)) => {
                (StatusCode::PAYMENT_REQUIRED, message.clone())
            }
            ApiError::Orchestrator(OrchestratorError::Downstream(e)) => downstream_status(e),
            ApiError::Orchestrator(OrchestratorError::Config(e)) => {
                tracing::error!("Config error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Configuration error".to_string())
            }
        }
    }
}

fn downstream_status(err: &ClientError) -> (StatusCode, String) {
    match err {
        ClientError::Timeout { .. } => {
            tracing::warn!("Downstream timeout: {}", err);
            (StatusCode::GATEWAY_TIMEOUT, "Downstream service timed out".to_string())
        }
        ClientError::CircuitOpen { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "Downstream service unavailable".to_string())
        }
        // Caller-side rejections (401, 403, 404, ...) pass through
        ClientError::Upstream {
            status_code,
            message,
        } if (400..500).contains(status_code) => (
            StatusCode::from_u16(*status_code).unwrap_or(StatusCode::BAD_GATEWAY),
            message.clone(),
        ),
        ClientError::Connection { .. } | ClientError::Upstream { .. } | ClientError::Decode { .. } => {
            tracing::error!("Downstream error: {}", err);
            (StatusCode::BAD_GATEWAY, "Downstream service error".to_string())
        }
        ClientError::InvalidRequest(_) | ClientError::Setup(_) => {
            tracing::error!("Internal error: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
