//! berth-state — desired-state store for Berth.
//!
//! Backed by [redb](https://docs.rs/redb), holds the declared and observed
//! state of a cluster: clusters, task definitions, versioned services,
//! task instances, hosts, deployments, queued host commands and the
//! per-service event log.
//!
//! # Architecture
//!
//! ```text
//! StateStore (Arc<Database>)
//!   ├── clusters          {cluster}
//!   ├── task_definitions  {family}:{revision:010}
//!   ├── services          {cluster}/{service}
//!   ├── service_versions  {cluster}/{service}@{version:020}
//!   ├── tasks             {cluster}/{service}:{task_id}
//!   ├── hosts             {host_id}
//!   ├── deployments       {cluster}/{service}@{version:020}
//!   ├── service_events    {cluster}/{service}#{sequence:020}
//!   └── host_commands     {host_id}#{sequence:020}
//! ```
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Zero-padded numeric key suffixes keep prefix scans ordered.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` and can be shared across
//! async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
