//! API layer -- axum routes translating JSON requests into core operations.

mod routes;
pub mod state;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use self::state::AppState;
use crate::error::AccessError;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

impl AccessError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AccessError::NotFound { .. } => StatusCode::NOT_FOUND,
            AccessError::InvalidState(_) => StatusCode::CONFLICT,
            AccessError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AccessError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for AccessError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let AccessError::Upstream(e) = &self {
            tracing::error!(error = %format!("{:#}", e), "request failed upstream");
        }
        // Upstream detail stays in the log; the device just starts over.
        let message = match &self {
            AccessError::Upstream(_) => "temporary failure, please try again".to_string(),
            other => other.to_string(),
        };
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message,
            },
            "restart_flow": true,
        }));
        (status, body).into_response()
    }
}
