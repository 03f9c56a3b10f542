//! HTTP API for the WHIP ingest gateway
//!
//! - `POST /` - Create a session from an SDP offer
//! - `PATCH /:id` - Update the remote description
//! - `DELETE /:id` - End a session
//! - `GET /health` - Liveness
//! - `GET /metrics` - Gateway metrics

pub mod whip;

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::Error;
use crate::metrics::{global_metrics, MetricsSnapshot};
use crate::session::SessionManager;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub session_manager: Arc<SessionManager>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(session_manager: Arc<SessionManager>, config: Arc<Config>) -> Self {
        Self {
            session_manager,
            config,
        }
    }
}

/// Build the HTTP API router
pub fn build_router(state: AppState) -> Router {
    // Browsers publish cross-origin and must be able to read Location
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([header::LOCATION]);

    Router::new()
        .route("/", post(whip::create_session))
        .route(
            "/:id",
            patch(whip::update_session).delete(whip::delete_session),
        )
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics_handler() -> Json<MetricsSnapshot> {
    Json(global_metrics().snapshot())
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl Error {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        use whip_mpegts_core::Error as PipelineError;

        match self {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "session_not_found"),
            Error::MaxSessionsReached(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "max_sessions_reached")
            }
            Error::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting_down"),
            Error::UnsupportedMediaType(_) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_media_type")
            }
            Error::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Error::Pipeline(PipelineError::Negotiation(_))
            | Error::Pipeline(PipelineError::UnsupportedPayload(_)) => {
                (StatusCode::BAD_REQUEST, "negotiation_failed")
            }
            Error::WebRtc(_) => (StatusCode::INTERNAL_SERVER_ERROR, "webrtc_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::NotFound("x".to_string()), StatusCode::NOT_FOUND),
            (Error::MaxSessionsReached(1), StatusCode::SERVICE_UNAVAILABLE),
            (
                Error::UnsupportedMediaType("text/plain".to_string()),
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ),
            (
                Error::Pipeline(whip_mpegts_core::Error::Negotiation("bad".to_string())),
                StatusCode::BAD_REQUEST,
            ),
            (
                Error::Pipeline(whip_mpegts_core::Error::EngineFatal("io".to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
