//! WHIP resource endpoints

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

use super::AppState;
use crate::error::Error;
use crate::session::SessionId;

pub const SDP_CONTENT_TYPE: &str = "application/sdp";
pub const TRICKLE_ICE_CONTENT_TYPE: &str = "application/trickle-ice-sdpfrag";

/// Create a session from an SDP offer
///
/// POST /
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(e) = require_sdp(&headers) {
        return e.into_response();
    }
    if body.trim().is_empty() {
        return Error::BadRequest("empty SDP offer".to_string()).into_response();
    }

    match state.session_manager.create_session(&body).await {
        Ok(created) => {
            let location =
                resource_location(state.config.server.public_base_url.as_deref(), &created.id);
            let location = match HeaderValue::from_str(&location) {
                Ok(value) => value,
                Err(e) => {
                    return Error::BadRequest(format!("invalid location: {}", e)).into_response()
                }
            };
            (
                StatusCode::CREATED,
                [
                    (header::CONTENT_TYPE, HeaderValue::from_static(SDP_CONTENT_TYPE)),
                    (header::LOCATION, location),
                ],
                created.answer_sdp,
            )
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Apply an updated remote description
///
/// PATCH /:id
pub async fn update_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    match content_type(&headers) {
        Some(ct) if ct.eq_ignore_ascii_case(SDP_CONTENT_TYPE) => {}
        Some(ct) if ct.eq_ignore_ascii_case(TRICKLE_ICE_CONTENT_TYPE) => {
            return Error::UnsupportedMediaType(
                "trickle ICE and ICE restarts are not supported".to_string(),
            )
            .into_response();
        }
        other => {
            return Error::UnsupportedMediaType(format!(
                "expected {}, got {}",
                SDP_CONTENT_TYPE,
                other.unwrap_or("none")
            ))
            .into_response();
        }
    }

    match state.session_manager.renegotiate(&session_id, &body).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

/// End a session
///
/// DELETE /:id
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.session_manager.terminate(&session_id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Media type without parameters
fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or_default().trim())
}

fn require_sdp(headers: &HeaderMap) -> Result<(), Error> {
    match content_type(headers) {
        Some(ct) if ct.eq_ignore_ascii_case(SDP_CONTENT_TYPE) => Ok(()),
        other => Err(Error::UnsupportedMediaType(format!(
            "expected {}, got {}",
            SDP_CONTENT_TYPE,
            other.unwrap_or("none")
        ))),
    }
}

/// `Location` header value for a session resource
pub fn resource_location(public_base_url: Option<&str>, id: &SessionId) -> String {
    match public_base_url {
        Some(base) => format!("{}/{}", base.trim_end_matches('/'), id),
        None => format!("/{}", id),
    }
}
