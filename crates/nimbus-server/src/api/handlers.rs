//! Request handlers for the cloud API.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use nimbus_cloud::CloudManager;
use nimbus_core::{CloudError, InstanceFilters, ProvisionRequest};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

/// Maps domain errors to the contractual status codes.
pub(super) fn status_for(err: &CloudError) -> StatusCode {
    match err {
        CloudError::CloudDisabled | CloudError::ProviderDisabled => StatusCode::SERVICE_UNAVAILABLE,
        CloudError::MaxInstancesReached => StatusCode::TOO_MANY_REQUESTS,
        CloudError::NoAvailableHost => StatusCode::SERVICE_UNAVAILABLE,
        CloudError::InvalidPlatform(_) => StatusCode::BAD_REQUEST,
        CloudError::BillingNotAuthorized(_) | CloudError::BillingQuotaExceeded => {
            StatusCode::PAYMENT_REQUIRED
        }
        CloudError::BillingUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        CloudError::InstanceNotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &CloudError) -> Response {
    (status_for(err), Json(json!({ "error": err.to_string() }))).into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

pub(super) async fn health() -> Response {
    Json(json!({
        "status": "healthy",
        "service": "nimbus-server",
        "version": crate::VERSION,
    }))
    .into_response()
}

pub(super) async fn create_instance(
    State(manager): State<Arc<CloudManager>>,
    Json(request): Json<ProvisionRequest>,
) -> Response {
    if request.bot_package.is_empty() {
        return bad_request("bot_package is required");
    }
    if request.team_id.is_empty() {
        return bad_request("team_id is required");
    }

    match manager.create_instance(&request).await {
        Ok(instance) => {
            info!(id = %instance.id, platform = %instance.platform, "cloud instance created");
            (StatusCode::CREATED, Json(instance)).into_response()
        }
        Err(err) => error_response(&err),
    }
}

pub(super) async fn list_instances(
    State(manager): State<Arc<CloudManager>>,
    Query(filters): Query<InstanceFilters>,
) -> Response {
    match manager.list_instances(&filters).await {
        Ok(instances) => Json(json!({
            "instances": instances,
            "count": instances.len(),
            "filters": filters,
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}

pub(super) async fn get_instance(
    State(manager): State<Arc<CloudManager>>,
    Path(id): Path<String>,
) -> Response {
    match manager.get_instance(&id).await {
        Ok(instance) => Json(instance).into_response(),
        Err(err) => error_response(&err),
    }
}

pub(super) async fn terminate_instance(
    State(manager): State<Arc<CloudManager>>,
    Path(id): Path<String>,
) -> Response {
    match manager.terminate_instance(&id).await {
        Ok(()) => Json(json!({ "success": true, "message": "instance terminated" })).into_response(),
        Err(err) => error_response(&err),
    }
}

pub(super) async fn start_instance(
    State(manager): State<Arc<CloudManager>>,
    Path(id): Path<String>,
) -> Response {
    match manager.start_instance(&id).await {
        Ok(()) => Json(json!({ "success": true, "message": "instance started" })).into_response(),
        Err(err) => error_response(&err),
    }
}

pub(super) async fn stop_instance(
    State(manager): State<Arc<CloudManager>>,
    Path(id): Path<String>,
) -> Response {
    match manager.stop_instance(&id).await {
        Ok(()) => Json(json!({ "success": true, "message": "instance stopped" })).into_response(),
        Err(err) => error_response(&err),
    }
}

pub(super) async fn connection_info(
    State(manager): State<Arc<CloudManager>>,
    Path(id): Path<String>,
) -> Response {
    match manager.get_connection_info(&id).await {
        Ok(info) => Json(info).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Deserialize)]
pub(super) struct LogsQuery {
    lines: Option<usize>,
}

pub(super) async fn logs(
    State(manager): State<Arc<CloudManager>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let lines = query.lines.unwrap_or(100);
    match manager.get_logs(&id, lines).await {
        Ok(logs) => Json(json!({
            "instance_id": id,
            "lines": lines,
            "logs": logs,
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Deserialize)]
pub(super) struct ExecRequest {
    command: String,
}

pub(super) async fn exec(
    State(manager): State<Arc<CloudManager>>,
    Path(id): Path<String>,
    Json(request): Json<ExecRequest>,
) -> Response {
    if request.command.is_empty() {
        return bad_request("command is required");
    }

    match manager.execute_command(&id, &request.command).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Deserialize)]
pub(super) struct QuotaQuery {
    team_id: Option<String>,
}

pub(super) async fn quota(
    State(manager): State<Arc<CloudManager>>,
    Query(query): Query<QuotaQuery>,
) -> Response {
    let Some(team_id) = query.team_id.filter(|t| !t.is_empty()) else {
        return bad_request("team_id is required");
    };

    match manager.billing().team_quota(&team_id).await {
        Ok(quota) => Json(quota).into_response(),
        Err(err) => error_response(&err),
    }
}

pub(super) async fn summary(State(manager): State<Arc<CloudManager>>) -> Response {
    match manager.summary().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => error_response(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::Platform;

    #[test]
    fn error_status_mapping_is_contractual() {
        assert_eq!(status_for(&CloudError::CloudDisabled), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&CloudError::MaxInstancesReached), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(&CloudError::NoAvailableHost), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(&CloudError::InvalidPlatform("freebsd".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&CloudError::BillingNotAuthorized("no budget".into())),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status_for(&CloudError::BillingQuotaExceeded),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status_for(&CloudError::BillingUnavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(&CloudError::InstanceNotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&CloudError::ProvisioningFailed {
                instance_id: "i-1".into(),
                platform: Platform::MacOs,
                provider: "iaas".into(),
                message: "capacity".into(),
            }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
