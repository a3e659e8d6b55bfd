//! Host filtering and strategy ranking.
//!
//! A host is first checked against the hard requirements of a task
//! (status, capacity provider, memory, CPU, host ports, constraints).
//! Surviving hosts are ranked by a lexicographic key built from the
//! service's ordered placement strategies; the smallest key wins.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use berth_state::{BinpackResource, HostPort, HostStatus, PlacementConstraint, PlacementStrategy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Placement view of a single host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResources {
    pub host_id: String,
    pub instance_id: String,
    pub attributes: BTreeMap<String, String>,
    pub capacity_provider: String,
    pub status: HostStatus,
    pub capacity_memory_mib: u64,
    pub capacity_cpu_units: u32,
    pub used_memory_mib: u64,
    pub used_cpu_units: u32,
    pub used_ports: BTreeSet<HostPort>,
    /// Running tasks of the service being placed.
    pub service_tasks: u32,
}

impl HostResources {
    pub fn free_memory(&self) -> u64 {
        self.capacity_memory_mib.saturating_sub(self.used_memory_mib)
    }

    pub fn free_cpu(&self) -> u32 {
        self.capacity_cpu_units.saturating_sub(self.used_cpu_units)
    }

    /// Account for one more task of `req` on this host.
    pub fn reserve(&mut self, req: &TaskRequirements) {
        self.used_memory_mib += req.memory_mib;
        self.used_cpu_units += req.cpu_units;
        self.used_ports.extend(req.host_ports.iter().copied());
        self.service_tasks += 1;
    }

    /// Value of a spread field on this host (`instanceId` or `attribute:<name>`).
    pub fn group_value(&self, field: &str) -> Option<&str> {
        match field {
            "instanceId" | "host" => Some(self.instance_id.as_str()),
            other => other
                .strip_prefix("attribute:")
                .and_then(|name| self.attributes.get(name))
                .map(String::as_str),
        }
    }
}

/// What one task needs from a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequirements {
    pub memory_mib: u64,
    pub cpu_units: u32,
    pub host_ports: Vec<HostPort>,
    pub constraints: Vec<PlacementConstraint>,
    /// Restrict placement to hosts of this capacity provider.
    pub capacity_provider: Option<String>,
}

/// Why a host cannot take a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NotActive(HostStatus),
    ProviderMismatch { wanted: String, host: String },
    InsufficientMemory { needed: u64, free: u64 },
    InsufficientCpu { needed: u32, free: u32 },
    PortInUse(HostPort),
    MemberOf { attribute: String, value: String },
    DistinctInstance,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::NotActive(status) => write!(f, "host is {status:?}"),
            Rejection::ProviderMismatch { wanted, host } => {
                write!(f, "capacity provider {host} is not {wanted}")
            }
            Rejection::InsufficientMemory { needed, free } => {
                write!(f, "insufficient memory ({needed} MiB needed, {free} MiB free)")
            }
            Rejection::InsufficientCpu { needed, free } => {
                write!(f, "insufficient CPU ({needed} units needed, {free} free)")
            }
            Rejection::PortInUse(port) => {
                write!(f, "host port {}/{:?} already in use", port.port, port.protocol)
            }
            Rejection::MemberOf { attribute, value } => {
                write!(f, "attribute {attribute} does not equal {value}")
            }
            Rejection::DistinctInstance => write!(f, "host already runs a task of this service"),
        }
    }
}

/// Check the hard requirements of `req` against `host`.
pub fn check_host(host: &HostResources, req: &TaskRequirements) -> Result<(), Rejection> {
    if host.status != HostStatus::Active {
        return Err(Rejection::NotActive(host.status));
    }
    if let Some(wanted) = &req.capacity_provider
        && *wanted != host.capacity_provider
    {
        return Err(Rejection::ProviderMismatch {
            wanted: wanted.clone(),
            host: host.capacity_provider.clone(),
        });
    }
    if host.free_memory() < req.memory_mib {
        return Err(Rejection::InsufficientMemory {
            needed: req.memory_mib,
            free: host.free_memory(),
        });
    }
    if host.free_cpu() < req.cpu_units {
        return Err(Rejection::InsufficientCpu {
            needed: req.cpu_units,
            free: host.free_cpu(),
        });
    }
    if let Some(port) = req.host_ports.iter().find(|p| host.used_ports.contains(p)) {
        return Err(Rejection::PortInUse(*port));
    }
    for constraint in &req.constraints {
        match constraint {
            PlacementConstraint::DistinctInstance if host.service_tasks > 0 => {
                return Err(Rejection::DistinctInstance);
            }
            PlacementConstraint::MemberOf { attribute, value }
                if host.attributes.get(attribute) != Some(value) =>
            {
                return Err(Rejection::MemberOf {
                    attribute: attribute.clone(),
                    value: value.clone(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Tasks of the service in the spread group `host` belongs to.
fn spread_count(host: &HostResources, all: &[HostResources], field: &str) -> u64 {
    let group = host.group_value(field);
    all.iter()
        .filter(|h| h.group_value(field) == group)
        .map(|h| u64::from(h.service_tasks))
        .sum()
}

/// Deterministic pseudo-random rank of a host for a salt.
pub(crate) fn hash_rank(salt: &str, host_id: &str) -> u64 {
    let digest = Sha256::new()
        .chain_update(salt.as_bytes())
        .chain_update(b"/")
        .chain_update(host_id.as_bytes())
        .finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Lexicographic ranking key of `host` under `strategies`; smaller is better.
pub fn rank_key(
    host: &HostResources,
    all: &[HostResources],
    strategies: &[PlacementStrategy],
    salt: &str,
) -> Vec<u64> {
    strategies
        .iter()
        .map(|strategy| match strategy {
            PlacementStrategy::Spread { field } => spread_count(host, all, field),
            PlacementStrategy::Binpack {
                field: BinpackResource::Memory,
            } => host.free_memory(),
            PlacementStrategy::Binpack {
                field: BinpackResource::Cpu,
            } => u64::from(host.free_cpu()),
            PlacementStrategy::Random => hash_rank(salt, &host.host_id),
        })
        .collect()
}
