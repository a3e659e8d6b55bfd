//! REST API handlers for container hosts.
//!
//! Registration and heartbeats go through the `MembershipManager` so task
//! reports and probe results reach the health monitor.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;

use berth_cluster::{ClusterError, HeartbeatRequest, HeartbeatResponse, RegisterHostRequest};

use crate::ApiState;
use crate::handlers::{created, error_response, ok, state_error};

fn cluster_error(e: ClusterError) -> Response {
    match e {
        ClusterError::State(e) => state_error(e),
        ClusterError::UnknownHost(_) => error_response(&e.to_string(), StatusCode::NOT_FOUND),
        ClusterError::InvalidRegistration(_) => error_response(&e.to_string(), StatusCode::BAD_REQUEST),
        e => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// POST /api/v1/hosts
pub async fn register_host(
    State(state): State<ApiState>,
    Json(request): Json<RegisterHostRequest>,
) -> Response {
    match state.membership.join(&request) {
        Ok(response) => created(response),
        Err(e) => cluster_error(e),
    }
}

/// GET /api/v1/clusters/{cluster}/hosts
pub async fn list_hosts(State(state): State<ApiState>, Path(cluster): Path<String>) -> Response {
    match state.store.list_hosts(&cluster) {
        Ok(hosts) => ok(hosts),
        Err(e) => state_error(e),
    }
}

/// GET /api/v1/hosts/{host}
pub async fn get_host(State(state): State<ApiState>, Path(host_id): Path<String>) -> Response {
    match state.store.get_host(&host_id) {
        Ok(Some(host)) => ok(host),
        Ok(None) => error_response("host not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}

/// DELETE /api/v1/hosts/{host}
pub async fn deregister_host(State(state): State<ApiState>, Path(host_id): Path<String>) -> Response {
    match state.membership.deregister(&host_id) {
        Ok(true) => ok("deregistered"),
        Ok(false) => error_response("host not found", StatusCode::NOT_FOUND),
        Err(e) => cluster_error(e),
    }
}

/// POST /api/v1/hosts/{host}/drain
pub async fn drain_host(State(state): State<ApiState>, Path(host_id): Path<String>) -> Response {
    match state.membership.drain(&host_id) {
        Ok(host) => ok(host),
        Err(e) => cluster_error(e),
    }
}

/// POST /api/v1/hosts/{host}/heartbeat
pub async fn heartbeat(
    State(state): State<ApiState>,
    Path(host_id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> Response {
    match state.membership.heartbeat(&host_id, &request).await {
        Ok(commands) => ok(HeartbeatResponse { commands }),
        Err(e) => cluster_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_state::*;

    use crate::handlers::tests::test_state;

    fn registration() -> RegisterHostRequest {
        RegisterHostRequest {
            cluster: "demo".to_string(),
            address: "10.0.0.1".to_string(),
            capacity: HostCapacity {
                memory_mib: 2048,
                cpu_units: 1024,
            },
            attributes: Default::default(),
            capacity_provider: None,
            running: vec![],
        }
    }

    #[tokio::test]
    async fn register_needs_a_cluster() {
        let resp = register_host(State(test_state()), Json(registration())).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn register_drain_and_list() {
        let state = test_state();
        state
            .store
            .create_cluster(&ClusterInput {
                name: "demo".to_string(),
                capacity_providers: vec![],
            })
            .unwrap();
        let resp = register_host(State(state.clone()), Json(registration())).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let host = state.store.list_hosts("demo").unwrap().pop().unwrap();
        let resp = drain_host(State(state.clone()), Path(host.id.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            state.store.get_host(&host.id).unwrap().unwrap().status,
            HostStatus::Draining
        );

        let resp = list_hosts(State(state.clone()), Path("demo".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = deregister_host(State(state.clone()), Path(host.id.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = get_host(State(state), Path(host.id)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_host_is_not_found() {
        let resp = heartbeat(
            State(test_state()),
            Path("host-missing".to_string()),
            Json(HeartbeatRequest::default()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
