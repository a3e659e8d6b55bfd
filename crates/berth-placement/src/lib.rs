//! Berth placement engine.
//!
//! Decides which host receives each new task and which tasks go first on
//! scale-in. It never touches the store: the reconciler converts stored
//! hosts and tasks into views, asks for a plan and executes it.
//!
//! # Components
//!
//! - **`scorer`**: Host views, hard filters, strategy ranking keys
//! - **`placer`**: Task-by-task placement and scale-in victim selection
//! - **`providers`**: Capacity provider strategy (base, then weight)
//! - **`convert`**: Type conversions from state store types

pub mod convert;
pub mod placer;
pub mod providers;
pub mod scorer;

pub use convert::{cluster_view, host_resources, task_requirements};
pub use placer::{PlacementPlan, Placer, place, select_for_termination};
pub use providers::distribute_providers;
pub use scorer::{HostResources, Rejection, TaskRequirements, check_host, rank_key};
