pub mod broker;
pub mod middleware;
pub mod reports;
mod routes;

use std::sync::Arc;

use axum::Router;

use crate::broker::service::Broker;
use crate::config::BasicAuth;

#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    /// Default instance to copy when a provision request names none.
    pub source_instance_id: Option<String>,
    /// Broker credentials; `None` disables auth.
    pub auth: Option<Arc<BasicAuth>>,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}
