use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, Uri, header},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hyper::StatusCode;
use serde_json::json;
use tracing::Span;

use super::AppState;

pub async fn enrich_current_span_middleware(req: Request<Body>, next: Next) -> Response {
    let uri: &Uri = req.uri();

    let api_version = req
        .headers()
        .get("x-broker-api-version")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("UNKNOWN");

    let current_span = Span::current();

    current_span.record("http.uri", uri.path());
    current_span.record("broker.api_version", api_version);
    if let Some(query) = uri.query() {
        current_span.record("http.query", query);
    }

    next.run(req).await
}

pub async fn strip_trailing_slash(req: Request<Body>, next: Next) -> Response {
    let uri = req.uri();

    let Some(path) = uri.path().strip_suffix('/').filter(|p| !p.is_empty()) else {
        return next.run(req).await;
    };

    let target = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    Redirect::permanent(&target).into_response()
}

/// HTTP basic auth for the broker endpoints. A no-op when no credentials are
/// configured.
pub async fn require_basic_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.auth.as_deref() else {
        return next.run(req).await;
    };

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Basic "))
        .and_then(|encoded| STANDARD.decode(encoded.trim()).ok())
        .and_then(|raw| String::from_utf8(raw).ok());

    let authorized = presented
        .as_deref()
        .and_then(|creds| creds.split_once(':'))
        .is_some_and(|(user, pass)| user == expected.username && pass == expected.password);

    if authorized {
        return next.run(req).await;
    }

    tracing::warn!(path = %req.uri().path(), "rejected broker request with bad credentials");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"cdm-broker\"")],
        Json(json!({ "description": "unauthorized" })),
    )
        .into_response()
}
