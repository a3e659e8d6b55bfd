//! berth-reconciler — keeps services converged on their declaration.
//!
//! Each tick reads a service's desired state (the current `ServiceSpec`
//! version and its task definition) and its observed state (tasks, hosts),
//! computes a plan of actions within the rollout bounds, and executes it
//! by writing task records and queueing host commands.
//!
//! # Architecture
//!
//! ```text
//! Reconciler (loop, one service at a time)
//!   ├── DeploymentTracker (deployment records, circuit breaker, rollback)
//!   ├── reconcile()  pure: desired + observed → ReconcilePlan
//!   │     ├── RolloutBudget (max total / min healthy)
//!   │     └── Placer (host choice, capacity providers, scale-in victims)
//!   └── execute()    ReconcilePlan → tasks, host commands, service events
//! ```

pub mod error;
pub mod executor;
pub mod plan;
pub mod reconciler;

pub use error::{ReconcileError, ReconcileResult};
pub use executor::{ExecutionResult, execute};
pub use plan::{Action, ReconcileInput, ReconcilePlan, reconcile};
pub use reconciler::{Reconciler, ServiceReport};
