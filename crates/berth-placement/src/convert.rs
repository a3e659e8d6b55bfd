//! Type conversions between state store types and placement types.
//!
//! Bridges `berth_state::{HostNode, TaskInstance, TaskDefinition, ServiceSpec}`
//! to the placement engine's `HostResources` and `TaskRequirements`.

use std::collections::BTreeSet;

use berth_state::{DesiredStatus, HostNode, ServiceSpec, TaskDefinition, TaskInstance};

use crate::scorer::{HostResources, TaskRequirements};

/// Capacity provider name of hosts registered without one.
pub const DEFAULT_PROVIDER: &str = "default";

/// Build the placement view of `host` from the tasks assigned to it.
///
/// Every non-STOPPED task holds its reservation; only tasks of `service`
/// that are meant to keep running count toward spread.
pub fn host_resources(
    host: &HostNode,
    tasks_on_host: &[TaskInstance],
    service: Option<&ServiceSpec>,
) -> HostResources {
    let mut view = HostResources {
        host_id: host.id.clone(),
        instance_id: host.instance_id().to_string(),
        attributes: host.attributes.clone(),
        capacity_provider: host
            .capacity_provider
            .clone()
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
        status: host.status,
        capacity_memory_mib: host.capacity.memory_mib,
        capacity_cpu_units: host.capacity.cpu_units,
        used_memory_mib: 0,
        used_cpu_units: 0,
        used_ports: BTreeSet::new(),
        service_tasks: 0,
    };
    for task in tasks_on_host.iter().filter(|t| t.state.is_live()) {
        view.used_memory_mib += task.reservation.memory_mib;
        view.used_cpu_units += task.reservation.cpu_units;
        view.used_ports.extend(task.reservation.host_ports.iter().copied());
        let ours = service.is_some_and(|s| s.cluster == task.cluster && s.name == task.service);
        if ours && task.desired_status == DesiredStatus::Running {
            view.service_tasks += 1;
        }
    }
    view
}

/// Views of every host, each built from the tasks of `tasks` placed on it.
pub fn cluster_view(
    hosts: &[HostNode],
    tasks: &[TaskInstance],
    service: Option<&ServiceSpec>,
) -> Vec<HostResources> {
    hosts
        .iter()
        .map(|host| {
            let on_host: Vec<TaskInstance> = tasks
                .iter()
                .filter(|t| t.host_id.as_deref() == Some(host.id.as_str()))
                .cloned()
                .collect();
            host_resources(host, &on_host, service)
        })
        .collect()
}

/// Requirements of one task of `service` running `definition`.
pub fn task_requirements(
    definition: &TaskDefinition,
    service: &ServiceSpec,
    capacity_provider: Option<String>,
) -> TaskRequirements {
    let reservation = definition.reservation();
    TaskRequirements {
        memory_mib: reservation.memory_mib,
        cpu_units: reservation.cpu_units,
        host_ports: reservation.host_ports,
        constraints: service.placement_constraints.clone(),
        capacity_provider,
    }
}
