use axum::Json;
use axum::extract::{Path, Query, State};
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::AppState;
use crate::broker::error::BrokerError;
use crate::broker::service::BindOutcome;
use crate::broker::InstanceState;

pub(crate) const SERVICE_ID: &str = "lifecycle-sb";
pub(crate) const COPY_PLAN_ID: &str = "copy";

type ApiError = (StatusCode, Json<Value>);

fn describe(status: StatusCode, description: impl Into<String>) -> ApiError {
    (status, Json(json!({ "description": description.into() })))
}

/// Map a lifecycle error onto the broker protocol's status codes.
pub(crate) fn error_response(err: BrokerError) -> ApiError {
    let status = match &err {
        BrokerError::AlreadyExists(_) | BrokerError::Conflict(_) => StatusCode::CONFLICT,
        BrokerError::DuplicateBinding(_) | BrokerError::AlreadyBound(_) => StatusCode::CONFLICT,
        BrokerError::NotFound { .. } => StatusCode::NOT_FOUND,
        BrokerError::Gone(_) => StatusCode::GONE,
        BrokerError::InstanceNotReady { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        BrokerError::Provider(_) => StatusCode::BAD_GATEWAY,
        BrokerError::TimedOut { .. } | BrokerError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "broker request failed");
    }

    let mut body = json!({ "description": err.to_string() });
    if let Some(existing) = err.existing_binding() {
        body["binding_id"] = json!(existing.binding_id);
        body["service_instance_id"] = json!(existing.service_instance_id);
        body["app_guid"] = json!(existing.app_guid);
    }
    (status, Json(body))
}

/// GET /v2/catalog
pub(crate) async fn catalog() -> Json<Value> {
    Json(json!({
        "services": [{
            "id": SERVICE_ID,
            "name": SERVICE_ID,
            "description": "Point-in-time copies of a running instance",
            "bindable": true,
            "plan_updateable": false,
            "instances_retrievable": true,
            "bindings_retrievable": false,
            "plans": [{
                "id": COPY_PLAN_ID,
                "name": COPY_PLAN_ID,
                "description": "Snapshot the source instance and launch a copy",
                "free": true,
            }],
        }],
    }))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct AsyncQuery {
    pub accepts_incomplete: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ProvisionParameters {
    pub source_instance_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProvisionBody {
    pub service_id: Option<String>,
    pub plan_id: Option<String>,
    #[serde(default)]
    pub parameters: Option<ProvisionParameters>,
}

fn last_operation_body(state: InstanceState, description: Option<String>) -> Value {
    json!({
        "state": state.as_protocol_str(),
        "description": description.unwrap_or_default(),
    })
}

/// PUT /v2/service_instances/{instance_id}
#[tracing::instrument(skip_all, fields(instance_id = %instance_id))]
pub(crate) async fn provision(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<AsyncQuery>,
    Json(body): Json<ProvisionBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if query.accepts_incomplete != Some(true) {
        return Err(describe(
            StatusCode::UNPROCESSABLE_ENTITY,
            "This service plan requires client support for asynchronous service operations.",
        ));
    }

    if let Some(plan_id) = body.plan_id.as_deref()
        && plan_id != COPY_PLAN_ID
    {
        return Err(describe(
            StatusCode::BAD_REQUEST,
            format!("unknown plan {plan_id}"),
        ));
    }
    if let Some(service_id) = body.service_id.as_deref()
        && service_id != SERVICE_ID
    {
        return Err(describe(
            StatusCode::BAD_REQUEST,
            format!("unknown service {service_id}"),
        ));
    }

    let source = body
        .parameters
        .and_then(|p| p.source_instance_id)
        .filter(|s| !s.trim().is_empty())
        .or_else(|| state.source_instance_id.clone());
    let Some(source) = source else {
        return Err(describe(
            StatusCode::UNPROCESSABLE_ENTITY,
            "no source instance: pass parameters.source_instance_id or configure SOURCE_INSTANCE_ID",
        ));
    };

    let instance = state
        .broker
        .provisioning
        .provision(&instance_id, &source)
        .await
        .map_err(error_response)?;

    tracing::info!(copy_id = ?instance.copy_id, source = %source, "provision accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "last_operation": last_operation_body(instance.state, instance.message),
        })),
    ))
}

/// GET /v2/service_instances/{instance_id}. Reads the stored record without
/// asking the provider.
pub(crate) async fn get_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let provisioning = &state.broker.provisioning;
    let status = provisioning
        .status(&instance_id)
        .await
        .map_err(error_response)?;
    let source = provisioning
        .instance(&instance_id)
        .await
        .map_err(error_response)?
        .map(|i| i.source_instance_id);

    Ok(Json(json!({
        "service_id": SERVICE_ID,
        "plan_id": COPY_PLAN_ID,
        "last_operation": last_operation_body(status.state, status.message),
        "parameters": { "source_instance_id": source },
    })))
}

/// GET /v2/service_instances/{instance_id}/last_operation
#[tracing::instrument(skip_all, fields(instance_id = %instance_id))]
pub(crate) async fn last_operation(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let status = state
        .broker
        .provisioning
        .last_operation(&instance_id)
        .await
        .map_err(error_response)?;
    Ok(Json(last_operation_body(status.state, status.message)))
}

/// DELETE /v2/service_instances/{instance_id}
#[tracing::instrument(skip_all, fields(instance_id = %instance_id))]
pub(crate) async fn deprovision(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    match state.broker.provisioning.deprovision(&instance_id).await {
        Ok(_) => Ok((StatusCode::ACCEPTED, Json(json!({})))),
        // Unknown and already-deleted instances both answer 410 for delete.
        Err(BrokerError::NotFound { .. }) | Err(BrokerError::Gone(_)) => {
            Err((StatusCode::GONE, Json(json!({}))))
        }
        Err(e) => Err(error_response(e)),
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct BindResource {
    pub app_guid: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BindBody {
    pub app_guid: Option<String>,
    #[serde(default)]
    pub bind_resource: Option<BindResource>,
}

/// PUT /v2/service_instances/{instance_id}/service_bindings/{binding_id}
#[tracing::instrument(skip_all, fields(instance_id = %instance_id, binding_id = %binding_id))]
pub(crate) async fn bind(
    State(state): State<AppState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    Json(body): Json<BindBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let app_guid = body
        .app_guid
        .or_else(|| body.bind_resource.and_then(|r| r.app_guid))
        .filter(|g| !g.trim().is_empty());
    let Some(app_guid) = app_guid else {
        return Err(describe(StatusCode::BAD_REQUEST, "app_guid is required"));
    };

    let outcome = state
        .broker
        .binding
        .bind(&binding_id, &instance_id, &app_guid)
        .await
        .map_err(error_response)?;

    let status = match outcome {
        BindOutcome::Created(_) => StatusCode::CREATED,
        BindOutcome::Existing(_) => StatusCode::OK,
    };
    Ok((
        status,
        Json(json!({ "credentials": outcome.binding().credentials })),
    ))
}

/// DELETE /v2/service_instances/{instance_id}/service_bindings/{binding_id}
#[tracing::instrument(skip_all, fields(instance_id = %instance_id, binding_id = %binding_id))]
pub(crate) async fn unbind(
    State(state): State<AppState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    match state.broker.binding.unbind(&binding_id).await {
        Ok(binding) => {
            if binding.service_instance_id != instance_id {
                tracing::warn!(
                    bound_to = %binding.service_instance_id,
                    "unbind addressed binding through a different instance"
                );
            }
            Ok(Json(json!({})))
        }
        Err(BrokerError::NotFound { .. }) => Err((StatusCode::GONE, Json(json!({})))),
        Err(e) => Err(error_response(e)),
    }
}
