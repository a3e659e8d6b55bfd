//! berth-cluster — container hosts and their link to the control plane.
//!
//! # Architecture
//!
//! ```text
//! Control plane
//!   └── MembershipManager
//!       ├── register()  → host id (stable per cluster + address)
//!       ├── heartbeat() → applies task reports + probe results,
//!       │                 returns queued HostCommands
//!       ├── drain() / deregister()
//!       └── reap_dead() → silent hosts become inactive
//!
//! Container host
//!   └── HostAgent
//!       ├── ControlPlane (HTTP client, or membership in-process)
//!       ├── TaskDriver   (docker CLI, or simulated)
//!       └── ProbeScheduler (health commands per running task)
//! ```

pub mod agent;
pub mod client;
pub mod driver;
pub mod error;
pub mod membership;
pub mod protocol;

pub use agent::{AgentConfig, ControlPlane, HostAgent};
pub use client::ControlPlaneClient;
pub use driver::{DockerCliDriver, SimulatedDriver, TaskDriver};
pub use error::{ClusterError, ClusterResult};
pub use membership::MembershipManager;
pub use protocol::{
    ApiResponse, HeartbeatRequest, HeartbeatResponse, RegisterHostRequest, RegisterHostResponse,
    TaskReport,
};
