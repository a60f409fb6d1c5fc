use axum::Json;
use axum::extract::{Path, State};
use hyper::{StatusCode, header};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::AppState;
use crate::api::broker::handlers::error_response;

/// GET /api/instances: (source instance, copy) for every live instance.
pub(crate) async fn list_instance_pairs(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let pairs = state
        .broker
        .provisioning
        .instance_pairs()
        .await
        .map_err(error_response)?;
    Ok(Json(json!(pairs)))
}

/// GET /api/bindings: (app, copy) for every binding.
pub(crate) async fn list_binding_pairs(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let pairs = state
        .broker
        .binding
        .binding_pairs()
        .await
        .map_err(error_response)?;
    Ok(Json(json!(pairs)))
}

/// GET /api/sourceinstance
pub(crate) async fn source_instance(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "sourceInstance": state.source_instance_id,
        "provider": state.broker.provider_kind,
    }))
}

/// GET /api/actions/{id}: action history for an instance or binding id.
pub(crate) async fn action_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let actions = state.broker.actions.history(&id).await.map_err(error_response)?;
    if actions.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "description": format!("no actions recorded for {id}") })),
        ));
    }
    Ok(Json(json!({ "id": id, "actions": actions })))
}

pub(crate) const SANITIZE_SCRIPT_PATH: &str = "/api/sanitizescript";

#[derive(Debug, Deserialize)]
pub(crate) struct ScriptBody {
    #[serde(default)]
    pub script: String,
}

/// GET /api/sanitizescript
pub(crate) async fn get_sanitize_script(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.broker.scripts.current().await.map_err(error_response)? {
        Some(script) => Ok(Json(json!({
            "script": script.script,
            "updated_at": script.updated_at,
        }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "description": "no sanitize script uploaded" })),
        )),
    }
}

/// POST /api/sanitizescript: store the script; an empty one clears it.
pub(crate) async fn upload_sanitize_script(
    State(state): State<AppState>,
    Json(body): Json<ScriptBody>,
) -> Result<(StatusCode, [(header::HeaderName, &'static str); 1], Json<Value>), (StatusCode, Json<Value>)> {
    let stored = state
        .broker
        .scripts
        .replace(&body.script)
        .await
        .map_err(error_response)?;
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, SANITIZE_SCRIPT_PATH)],
        Json(json!({ "script": stored.map(|s| s.script).unwrap_or_default() })),
    ))
}
