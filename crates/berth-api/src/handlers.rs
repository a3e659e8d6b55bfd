//! REST API handlers for clusters, task definitions, services and stacks.
//!
//! Each handler reads/writes via `StateStore` and returns the JSON
//! envelope. The reconciler picks every change up on its next tick.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::info;

use berth_cluster::ApiResponse;
use berth_state::*;

use crate::ApiState;

const DEFAULT_EVENT_LIMIT: usize = 50;

pub(crate) fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse::ok(data)).into_response()
}

pub(crate) fn created<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(ApiResponse::ok(data))).into_response()
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (status, Json(ApiResponse::<()>::err(msg))).into_response()
}

pub(crate) fn state_error(e: StateError) -> Response {
    let status = match &e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::Invalid(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

/// GET /healthz
pub async fn healthz() -> Response {
    ok("ok")
}

// ── Clusters ───────────────────────────────────────────────────

/// GET /api/v1/clusters
pub async fn list_clusters(State(state): State<ApiState>) -> Response {
    match state.store.list_clusters() {
        Ok(clusters) => ok(clusters),
        Err(e) => state_error(e),
    }
}

/// POST /api/v1/clusters
pub async fn create_cluster(
    State(state): State<ApiState>,
    Json(input): Json<ClusterInput>,
) -> Response {
    match state.store.create_cluster(&input) {
        Ok(cluster) => created(cluster),
        Err(e) => state_error(e),
    }
}

/// GET /api/v1/clusters/{cluster}
pub async fn get_cluster(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.store.get_cluster(&name) {
        Ok(Some(cluster)) => ok(cluster),
        Ok(None) => error_response("cluster not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}

/// DELETE /api/v1/clusters/{cluster}
pub async fn delete_cluster(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.store.delete_cluster(&name) {
        Ok(true) => ok("deleted"),
        Ok(false) => error_response("cluster not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}

/// GET /api/v1/clusters/{cluster}/tasks
pub async fn list_cluster_tasks(
    State(state): State<ApiState>,
    Path(cluster): Path<String>,
) -> Response {
    match state.store.list_tasks_for_cluster(&cluster) {
        Ok(tasks) => ok(tasks),
        Err(e) => state_error(e),
    }
}

// ── Task definitions ───────────────────────────────────────────

/// POST /api/v1/task-definitions
pub async fn register_task_definition(
    State(state): State<ApiState>,
    Json(input): Json<TaskDefinitionInput>,
) -> Response {
    match state.store.register_task_definition(&input) {
        Ok(definition) => created(definition),
        Err(e) => state_error(e),
    }
}

/// GET /api/v1/task-definitions/{family}
pub async fn latest_task_definition(
    State(state): State<ApiState>,
    Path(family): Path<String>,
) -> Response {
    match state.store.latest_task_definition(&family) {
        Ok(Some(definition)) => ok(definition),
        Ok(None) => error_response("task definition not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}

/// GET /api/v1/task-definitions/{family}/{revision}
pub async fn get_task_definition(
    State(state): State<ApiState>,
    Path((family, revision)): Path<(String, u32)>,
) -> Response {
    match state.store.get_task_definition(&format!("{family}:{revision}")) {
        Ok(Some(definition)) => ok(definition),
        Ok(None) => error_response("task definition not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}

// ── Services ───────────────────────────────────────────────────

/// Service declaration body; the cluster comes from the path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub task_definition: String,
    #[serde(flatten)]
    pub service: ServiceDeclaration,
}

/// Scale request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub desired_count: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/clusters/{cluster}/services
pub async fn list_services(State(state): State<ApiState>, Path(cluster): Path<String>) -> Response {
    match state.store.get_cluster(&cluster) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response("cluster not found", StatusCode::NOT_FOUND),
        Err(e) => return state_error(e),
    }
    match state.store.list_services(&cluster) {
        Ok(services) => ok(services),
        Err(e) => state_error(e),
    }
}

/// POST /api/v1/clusters/{cluster}/services
///
/// Creates the service or stores a new version of it.
pub async fn put_service(
    State(state): State<ApiState>,
    Path(cluster): Path<String>,
    Json(request): Json<ServiceRequest>,
) -> Response {
    let input = request.service.into_input(&cluster, &request.task_definition);
    match state.store.submit_service(&input) {
        Ok(spec) => {
            info!(%cluster, service = %spec.name, version = spec.version, "service submitted");
            created(spec)
        }
        Err(e) => state_error(e),
    }
}

/// GET /api/v1/clusters/{cluster}/services/{service}
pub async fn get_service(
    State(state): State<ApiState>,
    Path((cluster, service)): Path<(String, String)>,
) -> Response {
    match state.store.get_service(&cluster, &service) {
        Ok(Some(spec)) => ok(spec),
        Ok(None) => error_response("service not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}

/// DELETE /api/v1/clusters/{cluster}/services/{service}
///
/// Scales the service to zero; it disappears once its last task stopped.
pub async fn delete_service(
    State(state): State<ApiState>,
    Path((cluster, service)): Path<(String, String)>,
) -> Response {
    match state.store.delete_service(&cluster, &service) {
        Ok(spec) => ok(spec),
        Err(e) => state_error(e),
    }
}

/// POST /api/v1/clusters/{cluster}/services/{service}/scale
pub async fn scale_service(
    State(state): State<ApiState>,
    Path((cluster, service)): Path<(String, String)>,
    Json(request): Json<ScaleRequest>,
) -> Response {
    match state
        .store
        .set_desired_count(&cluster, &service, request.desired_count)
    {
        Ok(spec) => ok(spec),
        Err(e) => state_error(e),
    }
}

/// GET /api/v1/clusters/{cluster}/services/{service}/tasks
pub async fn list_service_tasks(
    State(state): State<ApiState>,
    Path((cluster, service)): Path<(String, String)>,
) -> Response {
    match state.store.list_tasks_for_service(&cluster, &service) {
        Ok(tasks) => ok(tasks),
        Err(e) => state_error(e),
    }
}

/// GET /api/v1/clusters/{cluster}/services/{service}/events?limit=
pub async fn list_service_events(
    State(state): State<ApiState>,
    Path((cluster, service)): Path<(String, String)>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    match state.store.list_events(&cluster, &service, limit) {
        Ok(events) => ok(events),
        Err(e) => state_error(e),
    }
}

/// GET /api/v1/clusters/{cluster}/services/{service}/deployments
pub async fn list_service_deployments(
    State(state): State<ApiState>,
    Path((cluster, service)): Path<(String, String)>,
) -> Response {
    match state.store.list_deployments(&cluster, &service) {
        Ok(deployments) => ok(deployments),
        Err(e) => state_error(e),
    }
}

/// GET /api/v1/clusters/{cluster}/services/{service}/versions
pub async fn list_service_versions(
    State(state): State<ApiState>,
    Path((cluster, service)): Path<(String, String)>,
) -> Response {
    match state.store.list_service_versions(&cluster, &service) {
        Ok(versions) => ok(versions),
        Err(e) => state_error(e),
    }
}

// ── Stacks ─────────────────────────────────────────────────────

/// POST /api/v1/apply
pub async fn apply_stack(
    State(state): State<ApiState>,
    Json(stack): Json<StackDeclaration>,
) -> Response {
    match state.store.apply_stack(&stack) {
        Ok(outputs) => {
            info!(
                cluster = %outputs.cluster_arn,
                service = %outputs.service_arn,
                version = outputs.service_version,
                "stack applied"
            );
            created(outputs)
        }
        Err(e) => state_error(e),
    }
}
