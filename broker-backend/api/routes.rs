use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use hyper::StatusCode;
use serde_json::json;
use tower_http::trace::TraceLayer;

use super::AppState;
use super::middleware;

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .merge(super::broker::router())
        .nest("/api", super::reports::router())
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_basic_auth,
        ));

    Router::new()
        .route(
            "/health",
            get(|| async {
                Json(json!({
                    "status": "ok",
                }))
            }),
        )
        .merge(protected)
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(middleware::strip_trailing_slash))
        .layer(axum::middleware::from_fn(
            middleware::enrich_current_span_middleware,
        ))
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, "Not Found")
}
