//! redb table definitions for the Berth state store.
//!
//! Every table maps `&str` keys to JSON-encoded `&[u8]` values.

use redb::TableDefinition;

pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Clusters keyed by `{cluster}`.
pub const CLUSTERS: JsonTable = TableDefinition::new("clusters");

/// Task definitions keyed by `{family}:{revision:010}`.
pub const TASK_DEFINITIONS: JsonTable = TableDefinition::new("task_definitions");

/// Current service spec keyed by `{cluster}/{service}`.
pub const SERVICES: JsonTable = TableDefinition::new("services");

/// Every submitted service version keyed by `{cluster}/{service}@{version:020}`.
pub const SERVICE_VERSIONS: JsonTable = TableDefinition::new("service_versions");

/// Task instances keyed by `{cluster}/{service}:{task_id}`.
pub const TASKS: JsonTable = TableDefinition::new("tasks");

/// Hosts keyed by `{host_id}`.
pub const HOSTS: JsonTable = TableDefinition::new("hosts");

/// Deployment records keyed by `{cluster}/{service}@{version:020}`.
pub const DEPLOYMENTS: JsonTable = TableDefinition::new("deployments");

/// Append-only event log keyed by `{cluster}/{service}#{sequence:020}`.
pub const SERVICE_EVENTS: JsonTable = TableDefinition::new("service_events");

/// Pending host commands keyed by `{host_id}#{sequence:020}`.
pub const HOST_COMMANDS: JsonTable = TableDefinition::new("host_commands");
