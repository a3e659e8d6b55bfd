//! Wire types exchanged between host agents and the control plane.

use std::collections::{BTreeMap, BTreeSet};

use berth_health::ProbeReport;
use berth_state::{HealthCheckSpec, HostCapacity, HostCommand, HostId, TaskId, TaskState};
use serde::{Deserialize, Serialize};

/// Standard API response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterHostRequest {
    pub cluster: String,
    pub address: String,
    pub capacity: HostCapacity,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub capacity_provider: Option<String>,
    /// Tasks already running on the host, e.g. after an agent restart.
    #[serde(default)]
    pub running: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterHostResponse {
    pub host_id: HostId,
    pub heartbeat_interval_secs: u64,
    /// Health checks of the running tasks the cluster still wants.
    #[serde(default)]
    pub health_checks: BTreeMap<TaskId, HealthCheckSpec>,
}

/// A task's lifecycle as seen by the host running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    /// `STARTING` once the containers run, `STOPPED` once they are gone.
    pub state: TaskState,
    pub reason: Option<String>,
    pub at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub tasks: Vec<TaskReport>,
    #[serde(default)]
    pub probes: Vec<ProbeReport>,
    /// Every task the host runs. Hosts that leave it out are not checked
    /// for lost commands.
    #[serde(default)]
    pub running: Option<BTreeSet<TaskId>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub commands: Vec<HostCommand>,
}
