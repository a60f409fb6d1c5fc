//! Service-broker protocol (v2) endpoints.

pub mod handlers;

use axum::Router;
use axum::routing::{get, put};

use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v2/catalog", get(handlers::catalog))
        .route(
            "/v2/service_instances/{instance_id}",
            put(handlers::provision)
                .get(handlers::get_instance)
                .delete(handlers::deprovision),
        )
        .route(
            "/v2/service_instances/{instance_id}/last_operation",
            get(handlers::last_operation),
        )
        .route(
            "/v2/service_instances/{instance_id}/service_bindings/{binding_id}",
            put(handlers::bind).delete(handlers::unbind),
        )
}
