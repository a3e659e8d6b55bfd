//! berth-api — REST API for Berth.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness |
//! | GET, POST | `/api/v1/clusters` | List / create clusters |
//! | GET, DELETE | `/api/v1/clusters/{cluster}` | Get / delete a cluster |
//! | GET | `/api/v1/clusters/{cluster}/tasks` | Tasks of a cluster |
//! | GET | `/api/v1/clusters/{cluster}/hosts` | Hosts of a cluster |
//! | GET, POST | `/api/v1/clusters/{cluster}/services` | List / create-or-update services |
//! | GET, DELETE | `/api/v1/clusters/{cluster}/services/{service}` | Get / delete a service |
//! | POST | `/api/v1/clusters/{cluster}/services/{service}/scale` | Set the desired count |
//! | GET | `/api/v1/clusters/{cluster}/services/{service}/tasks` | Service tasks |
//! | GET | `/api/v1/clusters/{cluster}/services/{service}/events` | Service events, newest first |
//! | GET | `/api/v1/clusters/{cluster}/services/{service}/deployments` | Deployment records |
//! | GET | `/api/v1/clusters/{cluster}/services/{service}/versions` | Stored service versions |
//! | POST | `/api/v1/task-definitions` | Register a task definition |
//! | GET | `/api/v1/task-definitions/{family}` | Latest revision |
//! | GET | `/api/v1/task-definitions/{family}/{revision}` | One revision |
//! | POST | `/api/v1/hosts` | Register a host |
//! | GET, DELETE | `/api/v1/hosts/{host}` | Get / deregister a host |
//! | POST | `/api/v1/hosts/{host}/drain` | Drain a host |
//! | POST | `/api/v1/hosts/{host}/heartbeat` | Host heartbeat |
//! | POST | `/api/v1/apply` | Apply a cluster + task definition + service stack |

pub mod handlers;
pub mod host_handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use berth_cluster::MembershipManager;
use berth_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub membership: Arc<MembershipManager>,
}

/// Build the complete API router.
pub fn build_router(store: StateStore, membership: Arc<MembershipManager>) -> Router {
    let api_state = ApiState { store, membership };

    let api_routes = Router::new()
        .route("/clusters", get(handlers::list_clusters).post(handlers::create_cluster))
        .route(
            "/clusters/{cluster}",
            get(handlers::get_cluster).delete(handlers::delete_cluster),
        )
        .route("/clusters/{cluster}/tasks", get(handlers::list_cluster_tasks))
        .route("/clusters/{cluster}/hosts", get(host_handlers::list_hosts))
        .route(
            "/clusters/{cluster}/services",
            get(handlers::list_services).post(handlers::put_service),
        )
        .route(
            "/clusters/{cluster}/services/{service}",
            get(handlers::get_service).delete(handlers::delete_service),
        )
        .route(
            "/clusters/{cluster}/services/{service}/scale",
            post(handlers::scale_service),
        )
        .route(
            "/clusters/{cluster}/services/{service}/tasks",
            get(handlers::list_service_tasks),
        )
        .route(
            "/clusters/{cluster}/services/{service}/events",
            get(handlers::list_service_events),
        )
        .route(
            "/clusters/{cluster}/services/{service}/deployments",
            get(handlers::list_service_deployments),
        )
        .route(
            "/clusters/{cluster}/services/{service}/versions",
            get(handlers::list_service_versions),
        )
        .route("/task-definitions", post(handlers::register_task_definition))
        .route("/task-definitions/{family}", get(handlers::latest_task_definition))
        .route(
            "/task-definitions/{family}/{revision}",
            get(handlers::get_task_definition),
        )
        .route("/hosts", post(host_handlers::register_host))
        .route(
            "/hosts/{host}",
            get(host_handlers::get_host).delete(host_handlers::deregister_host),
        )
        .route("/hosts/{host}/drain", post(host_handlers::drain_host))
        .route("/hosts/{host}/heartbeat", post(host_handlers::heartbeat))
        .route("/apply", post(handlers::apply_stack))
        .with_state(api_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
