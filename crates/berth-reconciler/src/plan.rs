//! Reconciliation planning: desired vs observed state into actions.
//!
//! `reconcile` is pure: it reads a snapshot of one service and its cluster
//! and returns what should happen next. Rules apply in order:
//!
//! 1. Tasks on hosts that are gone or inactive, and tasks their host never
//!    started, are marked stopped.
//! 2. Unhealthy tasks are replaced, or stopped when no replacement fits.
//! 3. Tasks of an older task definition, or on draining hosts, are stopped
//!    while the healthy count stays at or above the minimum.
//! 4. Missing tasks of the current definition start, up to the maximum.
//! 5. Surplus tasks of the current definition are scaled in.

use std::collections::{BTreeMap, BTreeSet};

use berth_placement::placer::describe_rejections;
use berth_placement::{
    Placer, cluster_view, distribute_providers, select_for_termination, task_requirements,
};
use berth_rollout::{RolloutBudget, TaskCounts};
use berth_state::*;
use tracing::debug;

/// Snapshot of one service and the cluster it runs in.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileInput<'a> {
    pub service: &'a ServiceSpec,
    pub definition: &'a TaskDefinition,
    /// Every stored task of the service.
    pub tasks: &'a [TaskInstance],
    pub hosts: &'a [HostNode],
    /// Every task of the cluster; they hold host capacity.
    pub cluster_tasks: &'a [TaskInstance],
    /// Seed for the `random` placement strategy.
    pub seed: &'a str,
    pub now: u64,
    /// Age after which a task its host never started is given up on.
    pub pending_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    StartTask {
        host_id: HostId,
        capacity_provider: Option<String>,
    },
    StopTask {
        task: TaskInstance,
        reason: String,
    },
    /// Stop `task` and start its replacement on `host_id`.
    ReplaceTask {
        task: TaskInstance,
        host_id: HostId,
        capacity_provider: Option<String>,
        reason: String,
    },
    /// The task's host is gone; record it stopped without a host command.
    MarkStopped {
        task: TaskInstance,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub cluster: String,
    pub service: String,
    pub service_version: u64,
    pub definition: TaskDefinition,
    pub actions: Vec<Action>,
    pub events: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.events.is_empty()
    }

    pub fn starts(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, Action::StartTask { .. } | Action::ReplaceTask { .. }))
            .count()
    }

    pub fn stops(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| !matches!(a, Action::StartTask { .. }))
            .count()
    }
}

/// Chooses a capacity provider and a host for each new task.
struct Launcher<'a> {
    placer: Placer,
    definition: &'a TaskDefinition,
    service: &'a ServiceSpec,
    provider_counts: BTreeMap<String, u32>,
}

impl Launcher<'_> {
    fn launch(&mut self) -> Result<(HostId, Option<String>), String> {
        let provider = distribute_providers(
            &self.service.capacity_provider_strategy,
            &self.provider_counts,
            1,
        )
        .pop()
        .flatten();
        let req = task_requirements(self.definition, self.service, provider.clone());
        let host = self
            .placer
            .place_one(&req)
            .map_err(|rejections| describe_rejections(&rejections))?;
        if let Some(name) = &provider {
            *self.provider_counts.entry(name.clone()).or_insert(0) += 1;
        }
        Ok((host, provider))
    }
}

pub fn reconcile(input: &ReconcileInput<'_>) -> ReconcilePlan {
    let service = input.service;
    let mut plan = ReconcilePlan {
        cluster: service.cluster.clone(),
        service: service.name.clone(),
        service_version: service.version,
        definition: input.definition.clone(),
        actions: Vec::new(),
        events: Vec::new(),
    };
    let host_status: BTreeMap<&str, HostStatus> = input
        .hosts
        .iter()
        .map(|h| (h.id.as_str(), h.status))
        .collect();
    let is_current = |t: &TaskInstance| t.task_definition == service.task_definition;
    let on_draining_host = |t: &TaskInstance| {
        t.host_id
            .as_deref()
            .and_then(|h| host_status.get(h))
            .is_some_and(|s| *s == HostStatus::Draining)
    };
    let running = |t: &TaskInstance| t.desired_status == DesiredStatus::Running;

    let mut live: Vec<&TaskInstance> = input.tasks.iter().filter(|t| t.state.is_live()).collect();
    live.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    let mut handled: BTreeSet<&str> = BTreeSet::new();

    // 1. Reap tasks whose host is gone.
    for task in &live {
        let reason = match task.host_id.as_deref() {
            None => Some("Task was never placed on a host".to_string()),
            Some(host) => match host_status.get(host) {
                None => Some(format!("Host {host} is no longer registered")),
                Some(HostStatus::Inactive) => Some(format!("Host {host} stopped responding")),
                Some(_) if task.state == TaskState::Pending
                    && input.now.saturating_sub(task.created_at) > input.pending_timeout_secs =>
                {
                    Some(format!(
                        "Task was not started by host {host} within {}s",
                        input.pending_timeout_secs
                    ))
                }
                Some(_) => None,
            },
        };
        if let Some(reason) = reason {
            handled.insert(task.id.as_str());
            plan.actions.push(Action::MarkStopped {
                task: (*task).clone(),
                reason,
            });
        }
    }

    let remaining: Vec<&TaskInstance> = live
        .iter()
        .copied()
        .filter(|t| !handled.contains(t.id.as_str()))
        .collect();
    let counts = TaskCounts {
        occupying: remaining.len() as u32,
        healthy: remaining
            .iter()
            .filter(|t| t.state == TaskState::Healthy && running(t))
            .count() as u32,
    };
    let bounds = &service.deployment_configuration;
    let mut budget = RolloutBudget::compute(bounds, service.desired_count, counts);
    debug!(
        service = %service.name,
        occupying = counts.occupying,
        healthy = counts.healthy,
        can_start = budget.can_start,
        can_stop_healthy = budget.can_stop_healthy,
        "rollout budget"
    );

    let mut provider_counts = BTreeMap::new();
    for task in remaining.iter().filter(|t| running(t) && is_current(t)) {
        if let Some(provider) = &task.capacity_provider {
            *provider_counts.entry(provider.clone()).or_insert(0) += 1;
        }
    }
    let mut launcher = Launcher {
        placer: Placer::new(
            cluster_view(input.hosts, input.cluster_tasks, Some(service)),
            service.placement_strategy.clone(),
            input.seed,
        ),
        definition: input.definition,
        service,
        provider_counts,
    };
    let mut unplaced = 0u32;
    let mut unplaced_reason = String::new();
    let mut replacements = 0u32;

    // 2. Unhealthy tasks.
    for task in remaining
        .iter()
        .filter(|t| running(t) && t.state == TaskState::Unhealthy)
    {
        handled.insert(task.id.as_str());
        let reason = "Task failed container health checks".to_string();
        if is_current(task) && !on_draining_host(task) && budget.can_start > 0 {
            match launcher.launch() {
                Ok((host_id, capacity_provider)) => {
                    budget.take_start(1);
                    replacements += 1;
                    plan.actions.push(Action::ReplaceTask {
                        task: (*task).clone(),
                        host_id,
                        capacity_provider,
                        reason,
                    });
                    continue;
                }
                Err(why) => {
                    unplaced += 1;
                    unplaced_reason = why;
                }
            }
        }
        plan.actions.push(Action::StopTask {
            task: (*task).clone(),
            reason,
        });
    }

    // 3. Outgoing tasks: older definition or draining host, non-healthy first.
    let mut outgoing: Vec<&TaskInstance> = remaining
        .iter()
        .copied()
        .filter(|t| running(t) && !handled.contains(t.id.as_str()))
        .filter(|t| !is_current(t) || on_draining_host(t))
        .collect();
    outgoing.sort_by_key(|t| t.state == TaskState::Healthy);
    for task in outgoing {
        if task.state == TaskState::Healthy && !budget.take_healthy_stop() {
            continue;
        }
        handled.insert(task.id.as_str());
        let reason = if is_current(task) {
            format!(
                "Host {} is draining",
                task.host_id.as_deref().unwrap_or_default()
            )
        } else {
            format!("Task replaced by deployment {}", service.version)
        };
        plan.actions.push(Action::StopTask {
            task: task.clone(),
            reason,
        });
    }

    // 4. Start missing tasks of the current definition.
    let current: Vec<&TaskInstance> = remaining
        .iter()
        .copied()
        .filter(|t| running(t) && is_current(t) && !on_draining_host(t))
        .filter(|t| !handled.contains(t.id.as_str()))
        .collect();
    let have = current.len() as u32 + replacements;
    let wanted = service.desired_count.saturating_sub(have);
    let granted = budget.take_start(wanted);
    let mut started = 0u32;
    for _ in 0..granted {
        match launcher.launch() {
            Ok((host_id, capacity_provider)) => {
                started += 1;
                plan.actions.push(Action::StartTask {
                    host_id,
                    capacity_provider,
                });
            }
            Err(why) => {
                unplaced += 1;
                unplaced_reason = why;
            }
        }
    }
    if unplaced > 0 {
        plan.events.push(format!(
            "service {} was unable to place {unplaced} task(s): {unplaced_reason}",
            service.name
        ));
    }

    let in_flight = remaining.iter().any(|t| {
        !running(t) || matches!(t.state, TaskState::Pending | TaskState::Starting | TaskState::Stopping)
    });
    if granted < wanted && plan.actions.is_empty() && !in_flight {
        plan.events.push(format!(
            "service {} is unable to make progress: maximumPercent allows {} task(s) and \
             minimumHealthyPercent requires {} healthy task(s)",
            service.name, budget.max_total, budget.min_healthy
        ));
    }

    // 5. Scale in surplus tasks.
    let surplus = (have + started).saturating_sub(service.desired_count);
    if surplus > 0 {
        let candidates: Vec<TaskInstance> = current.iter().map(|t| (*t).clone()).collect();
        let victims = select_for_termination(
            &candidates,
            launcher.placer.hosts(),
            &service.placement_strategy,
            surplus,
        );
        for id in victims {
            if let Some(task) = candidates.iter().find(|t| t.id == id) {
                plan.actions.push(Action::StopTask {
                    task: task.clone(),
                    reason: "Scaling activity initiated by service".to_string(),
                });
            }
        }
    }

    plan
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn definition(family: &str, revision: u32) -> TaskDefinition {
        TaskDefinition {
            family: family.to_string(),
            revision,
            arn: String::new(),
            network_mode: NetworkMode::Host,
            containers: vec![ContainerDefinition {
                name: "nginx".to_string(),
                image: "nginx:1.27".to_string(),
                port_mappings: vec![PortMapping {
                    container_port: 80,
                    host_port: Some(80),
                    protocol: Protocol::Tcp,
                }],
                memory: Some(256),
                memory_reservation: None,
                cpu: 0,
                environment: vec![],
                essential: true,
                health_check: None,
            }],
            fingerprint: String::new(),
            registered_at: 0,
        }
    }

    pub(crate) fn service(definition: &TaskDefinition, desired: u32, min: u32, max: u32) -> ServiceSpec {
        ServiceSpec {
            cluster: "demo".to_string(),
            name: "web".to_string(),
            arn: String::new(),
            version: definition.revision as u64,
            task_definition: definition.reference(),
            desired_count: desired,
            placement_strategy: vec![PlacementStrategy::Spread {
                field: "instanceId".to_string(),
            }],
            placement_constraints: vec![],
            capacity_provider_strategy: vec![],
            deployment_configuration: DeploymentConfiguration {
                minimum_healthy_percent: min,
                maximum_percent: max,
                circuit_breaker: None,
            },
            status: ServiceStatus::Active,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub(crate) fn host(id: &str) -> HostNode {
        HostNode {
            id: id.to_string(),
            cluster: "demo".to_string(),
            address: format!("{id}.local"),
            capacity: HostCapacity {
                memory_mib: 2048,
                cpu_units: 1024,
            },
            attributes: BTreeMap::new(),
            capacity_provider: None,
            status: HostStatus::Active,
            registered_at: 0,
            last_heartbeat: 0,
        }
    }

    pub(crate) fn task(
        id: &str,
        definition: &TaskDefinition,
        host: &str,
        state: TaskState,
    ) -> TaskInstance {
        TaskInstance {
            id: id.to_string(),
            cluster: "demo".to_string(),
            service: "web".to_string(),
            service_version: definition.revision as u64,
            task_definition: definition.reference(),
            host_id: Some(host.to_string()),
            capacity_provider: None,
            reservation: definition.reservation(),
            state,
            health: match state {
                TaskState::Healthy => HealthStatus::Healthy,
                TaskState::Unhealthy => HealthStatus::Unhealthy,
                _ => HealthStatus::Unknown,
            },
            desired_status: DesiredStatus::Running,
            stopped_reason: None,
            ever_healthy: state == TaskState::Healthy,
            started_at: Some(0),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn plan_for(
        service: &ServiceSpec,
        definition: &TaskDefinition,
        tasks: &[TaskInstance],
        hosts: &[HostNode],
    ) -> ReconcilePlan {
        reconcile(&ReconcileInput {
            service,
            definition,
            tasks,
            hosts,
            cluster_tasks: tasks,
            seed: "test",
            now: 0,
            pending_timeout_secs: 600,
        })
    }

    fn started_hosts(plan: &ReconcilePlan) -> Vec<String> {
        plan.actions
            .iter()
            .filter_map(|a| match a {
                Action::StartTask { host_id, .. } => Some(host_id.clone()),
                _ => None,
            })
            .collect()
    }

    fn stopped_ids(plan: &ReconcilePlan) -> Vec<String> {
        plan.actions
            .iter()
            .filter_map(|a| match a {
                Action::StopTask { task, .. } => Some(task.id.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn fresh_service_spreads_across_hosts() {
        let def = definition("web", 1);
        let svc = service(&def, 2, 0, 100);
        let plan = plan_for(&svc, &def, &[], &[host("h1"), host("h2")]);
        let mut hosts = started_hosts(&plan);
        hosts.sort();
        assert_eq!(hosts, vec!["h1".to_string(), "h2".to_string()]);
        assert!(plan.events.is_empty());
    }

    #[test]
    fn converged_service_has_empty_plan() {
        let def = definition("web", 1);
        let svc = service(&def, 1, 0, 100);
        let tasks = vec![task("t1", &def, "h1", TaskState::Healthy)];
        assert!(plan_for(&svc, &def, &tasks, &[host("h1")]).is_empty());
    }

    #[test]
    fn zero_hundred_stops_old_task_before_starting_new() {
        let old = definition("web", 1);
        let new = definition("web", 2);
        let svc = service(&new, 1, 0, 100);
        let hosts = [host("h1")];

        let tasks = vec![task("old", &old, "h1", TaskState::Healthy)];
        let plan = plan_for(&svc, &new, &tasks, &hosts);
        assert_eq!(stopped_ids(&plan), vec!["old".to_string()]);
        assert!(started_hosts(&plan).is_empty());

        let mut stopping = tasks[0].clone();
        stopping.state = TaskState::Stopping;
        stopping.desired_status = DesiredStatus::Stopped;
        assert!(plan_for(&svc, &new, &[stopping.clone()], &hosts).is_empty());

        stopping.state = TaskState::Stopped;
        let plan = plan_for(&svc, &new, &[stopping], &hosts);
        assert_eq!(started_hosts(&plan), vec!["h1".to_string()]);
    }

    #[test]
    fn surge_starts_new_before_stopping_old() {
        let old = definition("web", 1);
        let new = definition("web", 2);
        let svc = service(&new, 1, 100, 200);
        let hosts = [host("h1"), host("h2")];

        let tasks = vec![task("old", &old, "h1", TaskState::Healthy)];
        let plan = plan_for(&svc, &new, &tasks, &hosts);
        assert_eq!(started_hosts(&plan), vec!["h2".to_string()]);
        assert!(stopped_ids(&plan).is_empty());

        let tasks = vec![
            task("old", &old, "h1", TaskState::Healthy),
            task("new", &new, "h2", TaskState::Healthy),
        ];
        let plan = plan_for(&svc, &new, &tasks, &hosts);
        assert_eq!(stopped_ids(&plan), vec!["old".to_string()]);
        assert!(started_hosts(&plan).is_empty());
    }

    #[test]
    fn non_healthy_old_tasks_go_first() {
        let old = definition("web", 1);
        let new = definition("web", 2);
        let svc = service(&new, 2, 50, 100);
        let tasks = vec![
            task("healthy", &old, "h1", TaskState::Healthy),
            task("starting", &old, "h2", TaskState::Starting),
        ];
        let plan = plan_for(&svc, &new, &tasks, &[host("h1"), host("h2")]);
        assert_eq!(stopped_ids(&plan), vec!["starting".to_string()]);
    }

    #[test]
    fn unhealthy_task_is_replaced_when_budget_allows() {
        let def = definition("web", 1);
        let svc = service(&def, 1, 0, 200);
        let tasks = vec![task("sick", &def, "h1", TaskState::Unhealthy)];
        let plan = plan_for(&svc, &def, &tasks, &[host("h1"), host("h2")]);
        assert_eq!(plan.actions.len(), 1);
        match &plan.actions[0] {
            Action::ReplaceTask { task, host_id, .. } => {
                assert_eq!(task.id, "sick");
                assert_eq!(host_id, "h2");
            }
            other => panic!("expected replace, got {other:?}"),
        }
    }

    #[test]
    fn unhealthy_task_is_stopped_when_no_room() {
        let def = definition("web", 1);
        let svc = service(&def, 1, 0, 100);
        let tasks = vec![task("sick", &def, "h1", TaskState::Unhealthy)];
        let plan = plan_for(&svc, &def, &tasks, &[host("h1")]);
        assert_eq!(stopped_ids(&plan), vec!["sick".to_string()]);
        assert!(started_hosts(&plan).is_empty());
    }

    #[test]
    fn tasks_on_inactive_hosts_are_reaped_and_replaced() {
        let def = definition("web", 1);
        let svc = service(&def, 1, 0, 100);
        let mut dead = host("h1");
        dead.status = HostStatus::Inactive;
        let tasks = vec![task("lost", &def, "h1", TaskState::Healthy)];
        let plan = plan_for(&svc, &def, &tasks, &[dead, host("h2")]);
        assert!(matches!(
            &plan.actions[0],
            Action::MarkStopped { task, .. } if task.id == "lost"
        ));
        assert_eq!(started_hosts(&plan), vec!["h2".to_string()]);
    }

    #[test]
    fn tasks_never_started_are_given_up() {
        let def = definition("web", 1);
        let svc = service(&def, 1, 0, 100);
        let tasks = vec![task("stuck", &def, "h1", TaskState::Pending)];
        let hosts = [host("h1"), host("h2")];
        let at = |now: u64| {
            reconcile(&ReconcileInput {
                service: &svc,
                definition: &def,
                tasks: &tasks,
                hosts: &hosts,
                cluster_tasks: &tasks,
                seed: "test",
                now,
                pending_timeout_secs: 600,
            })
        };

        assert!(!at(600)
            .actions
            .iter()
            .any(|a| matches!(a, Action::MarkStopped { .. })));

        let plan = at(601);
        assert!(matches!(
            &plan.actions[0],
            Action::MarkStopped { task, reason }
                if task.id == "stuck" && reason.contains("not started by host h1")
        ));
        assert_eq!(plan.starts(), 1);
    }

    #[test]
    fn draining_host_tasks_move() {
        let def = definition("web", 1);
        let svc = service(&def, 1, 0, 200);
        let mut draining = host("h1");
        draining.status = HostStatus::Draining;
        let tasks = vec![task("t1", &def, "h1", TaskState::Healthy)];
        let plan = plan_for(&svc, &def, &tasks, &[draining, host("h2")]);
        assert_eq!(stopped_ids(&plan), vec!["t1".to_string()]);
        assert_eq!(started_hosts(&plan), vec!["h2".to_string()]);
    }

    #[test]
    fn scale_in_stops_surplus() {
        let def = definition("web", 1);
        let svc = service(&def, 1, 0, 100);
        let tasks = vec![
            task("a", &def, "h1", TaskState::Healthy),
            task("b", &def, "h2", TaskState::Healthy),
            task("c", &def, "h3", TaskState::Starting),
        ];
        let plan = plan_for(&svc, &def, &tasks, &[host("h1"), host("h2"), host("h3")]);
        let stopped = stopped_ids(&plan);
        assert_eq!(stopped.len(), 2);
        assert!(stopped.contains(&"c".to_string()));
        assert!(started_hosts(&plan).is_empty());
    }

    #[test]
    fn unplaceable_tasks_produce_event() {
        let def = definition("web", 1);
        let svc = service(&def, 2, 0, 100);
        let plan = plan_for(&svc, &def, &[], &[host("h1")]);
        assert_eq!(started_hosts(&plan).len(), 1);
        assert_eq!(plan.events.len(), 1);
        assert!(plan.events[0].contains("unable to place 1 task"));
    }

    #[test]
    fn no_hosts_produces_event() {
        let def = definition("web", 1);
        let svc = service(&def, 1, 0, 100);
        let plan = plan_for(&svc, &def, &[], &[]);
        assert!(plan.actions.is_empty());
        assert!(plan.events[0].contains("no hosts are registered"));
    }

    #[test]
    fn stalled_bounds_produce_event() {
        let old = definition("web", 1);
        let new = definition("web", 2);
        let svc = service(&new, 1, 50, 100);
        let tasks = vec![task("old", &old, "h1", TaskState::Healthy)];
        let plan = plan_for(&svc, &new, &tasks, &[host("h1"), host("h2")]);
        assert!(plan.actions.is_empty());
        assert!(plan.events[0].contains("unable to make progress"));
    }

    #[test]
    fn never_exceeds_maximum() {
        let old = definition("web", 1);
        let new = definition("web", 2);
        let svc = service(&new, 4, 50, 150);
        let hosts: Vec<HostNode> = (0..8).map(|i| host(&format!("h{i}"))).collect();
        let tasks: Vec<TaskInstance> = (0..4)
            .map(|i| task(&format!("old{i}"), &old, &format!("h{i}"), TaskState::Healthy))
            .collect();
        let plan = plan_for(&svc, &new, &tasks, &hosts);
        // max_total = 6, min_healthy = 2
        assert_eq!(plan.starts(), 2);
        assert_eq!(stopped_ids(&plan).len(), 2);
    }

    #[test]
    fn capacity_provider_strategy_assigns_providers() {
        let def = definition("web", 1);
        let mut svc = service(&def, 2, 0, 100);
        svc.capacity_provider_strategy = vec![CapacityProviderStrategyItem {
            capacity_provider: "spot".to_string(),
            base: 0,
            weight: 1,
        }];
        let mut spot = host("h2");
        spot.capacity_provider = Some("spot".to_string());
        let plan = plan_for(&svc, &def, &[], &[host("h1"), spot]);
        assert_eq!(started_hosts(&plan), vec!["h2".to_string()]);
        assert!(matches!(
            &plan.actions[0],
            Action::StartTask { capacity_provider: Some(p), .. } if p == "spot"
        ));
        assert_eq!(plan.events.len(), 1);
    }
}
