//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use percent_encoding::percent_decode_str;
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error, warn};

use crate::Error;
use crate::config::Config;
use crate::coordinator::{AuthCoordinator, AuthVariables, Verdict};
use crate::mtls::Identity;

/// Header carrying the URL-encoded PEM client certificate
pub const CLIENT_CERT_HEADER: &str = "x-ssl-client-cert";
/// Header carrying the URI of the request being authorized
pub const ORIGINAL_URI_HEADER: &str = "x-original-uri";

/// Shared application state
pub struct AppState {
    /// Authentication coordinator
    pub coordinator: Arc<AuthCoordinator>,
    /// Configuration (routes)
    pub config: Arc<Config>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/auth", get(auth_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "pending": state.coordinator.pending(),
    }))
}

/// Sub-request authorization handler
async fn auth_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(identity) = peer_identity(&headers) else {
        return StatusCode::FORBIDDEN.into_response();
    };

    let uri = headers
        .get(ORIGINAL_URI_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("/");
    let path = uri.split('?').next().unwrap_or("/");

    let operations = state.config.operations_for(path);
    if operations.is_empty() {
        debug!(path = %path, "No authentication operations configured for route");
        return StatusCode::FORBIDDEN.into_response();
    }

    let outcome = state.coordinator.authenticate(identity, operations).await;
    match outcome.verdict {
        Verdict::Allow => match outcome.context.variables() {
            Some(vars) => (StatusCode::OK, variable_headers(&vars)).into_response(),
            None => {
                let err = Error::InvalidState(format!(
                    "{} allowed without variables",
                    outcome.context.key()
                ));
                error!(error = %err, "Inconsistent authentication outcome");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Verdict::Deny => StatusCode::FORBIDDEN.into_response(),
        Verdict::InternalError | Verdict::Again => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Extract the peer identity from the forwarded certificate header.
fn peer_identity(headers: &HeaderMap) -> Option<Identity> {
    let Some(raw) = headers
        .get(CLIENT_CERT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
    else {
        debug!("No client certificate presented");
        return None;
    };

    let pem = match percent_decode_str(raw).decode_utf8() {
        Ok(pem) => pem,
        Err(e) => {
            warn!(error = %e, "Client certificate header is not valid UTF-8");
            return None;
        }
    };

    match Identity::from_pem(pem.as_bytes()) {
        Ok(identity) => Some(identity),
        Err(e) => {
            warn!(error = %e, "Unreadable client certificate");
            None
        }
    }
}

/// Response header name for each published variable
fn header_name(variable: &str) -> Option<HeaderName> {
    let name = match variable {
        "remote_user" => "x-remote-user",
        "user_info" => "x-user-info",
        "user_info_signature" => "x-user-info-signature",
        "user_info_json" => "x-user-info-json",
        "user_info_json_signature" => "x-user-info-json-signature",
        _ => return None,
    };
    Some(HeaderName::from_static(name))
}

/// Headers for the populated variables
fn variable_headers(vars: &AuthVariables) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (variable, value) in vars.entries() {
        if value.is_empty() {
            continue;
        }
        let Some(name) = header_name(variable) else {
            continue;
        };
        match HeaderValue::from_str(value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(e) => warn!(variable, error = %e, "Variable is not a valid header value"),
        }
    }
    headers
}
