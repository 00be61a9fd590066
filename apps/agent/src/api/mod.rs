//! HTTP/WebSocket surface under `/api/keeply`.
//!
//! A thin axum layer over the store and the job controller. Typed request and
//! response records live at this edge; nothing below it speaks JSON. Bearer
//! auth, when configured, applies to every route.

pub mod events;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use sha2::{Digest, Sha256};
use tower_http::cors::{Any, CorsLayer};

use crate::jobs::JobController;
use crate::store::Store;

pub struct ApiState {
    pub controller: JobController,
    pub store: Arc<Store>,
    pub api_token: Option<String>,
}

pub type SharedState = Arc<ApiState>;

/// Build the `/api/keeply` router.
pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/keeply/health", get(handlers::health))
        .route("/api/keeply/history", get(handlers::history))
        .route("/api/keeply/scan", post(handlers::submit_scan))
        .route(
            "/api/keeply/scan/{job_id}",
            get(handlers::get_scan).delete(handlers::cancel_scan),
        )
        .route("/api/keeply/restore", post(handlers::restore))
        .route("/api/keeply/folders", get(handlers::folders))
        .route("/api/keeply/events", get(events::ws_events))
        .fallback(handlers::not_found)
        .method_not_allowed_fallback(handlers::method_not_allowed)
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: SharedState, addr: SocketAddr) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("API listening on http://{addr}/api/keeply");
    axum::serve(listener, app).await
}

// ── Error envelope ───────────────────────────────────────────────────

/// Uniform `{ ok: false, error: { code, message } }` error body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    pub fn bad_json(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_json",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: message.into(),
        }
    }

    pub fn method_not_allowed() -> Self {
        Self {
            status: StatusCode::METHOD_NOT_ALLOWED,
            code: "method_not_allowed",
            message: "method not allowed".to_string(),
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: "missing or invalid bearer token".to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: message.into(),
        }
    }

    pub fn scan_storage_unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "scan_storage_unavailable",
            message: message.into(),
        }
    }

    pub fn restore_failed(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "restore_failed",
            message: message.into(),
        }
    }

    pub fn body(&self) -> serde_json::Value {
        json!({ "ok": false, "error": { "code": self.code, "message": self.message } })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

// ── Auth ─────────────────────────────────────────────────────────────

async fn require_bearer(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.api_token
        && !bearer_matches(request.headers(), expected)
    {
        return ApiError::unauthorized().into_response();
    }
    next.run(request).await
}

fn bearer_matches(headers: &HeaderMap, expected: &str) -> bool {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match presented {
        Some(token) => token_eq(expected, token),
        None => false,
    }
}

/// Compare through fixed-length digests so the secret's length and prefix
/// never influence timing.
fn token_eq(expected: &str, presented: &str) -> bool {
    Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn token_eq_accepts_exact_match_only() {
        assert!(token_eq("secret-token", "secret-token"));
        assert!(!token_eq("secret-token", "secret-toke"));
        assert!(!token_eq("secret-token", "secret-token2"));
        assert!(!token_eq("secret-token", ""));
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert!(!bearer_matches(&headers, "tok"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        assert!(bearer_matches(&headers, "tok"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic tok"));
        assert!(!bearer_matches(&headers, "tok"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        assert!(!bearer_matches(&headers, "tok"));
    }

    #[test]
    fn error_envelope_shape() {
        let err = ApiError::not_found("no such job");
        let body = err.body();
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"]["code"], "not_found");
        assert_eq!(body["error"]["message"], "no such job");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn error_codes_cover_the_contract() {
        assert_eq!(ApiError::bad_request("x").code, "bad_request");
        assert_eq!(ApiError::bad_json("x").code, "bad_json");
        assert_eq!(ApiError::method_not_allowed().code, "method_not_allowed");
        assert_eq!(ApiError::unauthorized().code, "unauthorized");
        assert_eq!(ApiError::internal("x").code, "internal_error");
        assert_eq!(ApiError::scan_storage_unavailable("x").code, "scan_storage_unavailable");
        assert_eq!(ApiError::restore_failed("x").code, "restore_failed");
    }
}
