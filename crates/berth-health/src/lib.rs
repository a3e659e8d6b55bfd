//! berth-health — container health checking for Berth.
//!
//! Health checks follow the container contract: a command run every
//! `interval`, bounded by `timeout`, with `retries` consecutive failures
//! marking the task unhealthy and failures during `start_period` ignored.
//!
//! # Architecture
//!
//! ```text
//! host side                              control plane
//! ProbeScheduler                         HealthMonitor
//!   ├── per-task probe loop                ├── HealthTracker per task
//!   │   └── command_probe() → ProbeResult  ├── record() → task state in StateStore
//!   └── mpsc ProbeReport ── heartbeat ──►  └── optional HealthCallback
//! ```

pub mod checker;
pub mod monitor;
pub mod scheduler;

pub use checker::{HealthCheck, HealthCheckError, HealthTracker, ProbeResult, command_probe};
pub use monitor::{HealthCallback, HealthMonitor};
pub use scheduler::{ProbeFn, ProbeReport, ProbeScheduler};
