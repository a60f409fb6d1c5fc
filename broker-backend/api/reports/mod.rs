//! Reporting endpoints and the sanitize-script upload.

pub mod handlers;

use axum::Router;
use axum::routing::get;

use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/instances", get(handlers::list_instance_pairs))
        .route("/bindings", get(handlers::list_binding_pairs))
        .route("/sourceinstance", get(handlers::source_instance))
        .route("/actions/{id}", get(handlers::action_history))
        .route(
            "/sanitizescript",
            get(handlers::get_sanitize_script).post(handlers::upload_sanitize_script),
        )
}
