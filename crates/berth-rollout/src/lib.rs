//! Berth rollouts — deployment bounds and the deployment state machine.
//!
//! A new service version rolls out by replacing old-version tasks within
//! the service's `minimum_healthy_percent` / `maximum_percent` bounds. The
//! reconciler asks this crate how many tasks it may start and stop, and
//! feeds the observed tasks back to decide when a deployment completed or
//! tripped its circuit breaker.
//!
//! # Components
//!
//! - **`bounds`**: Rollout budget math (max total, min healthy)
//! - **`controller`**: Deployment tracker (in progress, completed, failed, rollback)

pub mod bounds;
pub mod controller;

pub use bounds::{RolloutBudget, TaskCounts};
pub use controller::{DeploymentTracker, RolloutOutcome, failure_threshold};
