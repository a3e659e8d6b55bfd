//! Deployment tracker: drives the deployment state machine of a service.
//!
//! Every service version gets one deployment record. The latest is the
//! primary; it starts `in_progress` and moves to `completed` once it runs
//! `desired` healthy tasks and nothing of another task definition is left,
//! or to `failed` when its circuit breaker trips. Older deployments stay
//! `active` while they still have live tasks.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use berth_state::{
    DesiredStatus, Deployment, DeploymentStatus, RolloutState, ServiceSpec, TaskInstance,
    TaskState,
};

/// A state change of the primary deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutOutcome {
    Completed {
        version: u64,
    },
    Failed {
        version: u64,
        failed_tasks: u32,
        /// Deployment to roll back to, when rollback is enabled and one exists.
        rollback_to: Option<Deployment>,
    },
}

/// Tasks that must fail before the circuit breaker trips.
pub fn failure_threshold(desired: u32) -> u32 {
    desired.div_ceil(2).clamp(3, 200)
}

/// The deployments of one service, oldest version first.
#[derive(Debug, Clone, Default)]
pub struct DeploymentTracker {
    deployments: Vec<Deployment>,
    changed: BTreeSet<u64>,
}

impl DeploymentTracker {
    pub fn new(mut deployments: Vec<Deployment>) -> Self {
        deployments.sort_by_key(|d| d.version);
        Self {
            deployments,
            changed: BTreeSet::new(),
        }
    }

    /// Make the deployment of `spec.version` the primary one.
    ///
    /// Returns `true` when a new deployment record was created.
    pub fn ensure_primary(&mut self, spec: &ServiceSpec, now: u64) -> bool {
        let mut created = false;
        if !self.deployments.iter().any(|d| d.version == spec.version) {
            self.deployments.push(Deployment {
                cluster: spec.cluster.clone(),
                service: spec.name.clone(),
                version: spec.version,
                task_definition: spec.task_definition.clone(),
                desired_count: spec.desired_count,
                status: DeploymentStatus::Primary,
                rollout_state: RolloutState::InProgress,
                failed_tasks: 0,
                steady_announced: false,
                created_at: now,
                updated_at: now,
            });
            self.deployments.sort_by_key(|d| d.version);
            self.changed.insert(spec.version);
            created = true;
            info!(
                service = %spec.name,
                version = spec.version,
                task_definition = %spec.task_definition,
                "deployment started"
            );
        }

        for deployment in &mut self.deployments {
            let status = if deployment.version == spec.version {
                DeploymentStatus::Primary
            } else if deployment.status == DeploymentStatus::Primary {
                DeploymentStatus::Active
            } else {
                continue;
            };
            if deployment.status != status {
                deployment.status = status;
                deployment.updated_at = now;
                self.changed.insert(deployment.version);
            }
        }
        created
    }

    /// Feed the service's current tasks to the state machine.
    pub fn observe(
        &mut self,
        spec: &ServiceSpec,
        tasks: &[TaskInstance],
        now: u64,
    ) -> Option<RolloutOutcome> {
        let primary_definition = self.primary()?.task_definition.clone();
        self.retire_drained(&primary_definition, tasks, now);

        let breaker = spec.deployment_configuration.circuit_breaker;
        let rollback_to = self.rollback_target().cloned();
        let primary = self.primary_mut()?;
        if primary.rollout_state != RolloutState::InProgress {
            return None;
        }

        let failed = tasks
            .iter()
            .filter(|t| t.service_version == primary.version && t.failed_before_healthy())
            .count() as u32;
        if failed > primary.failed_tasks {
            primary.failed_tasks = failed;
            primary.updated_at = now;
            let version = primary.version;
            self.changed.insert(version);
        }

        let primary = self.primary_mut()?;
        let threshold = failure_threshold(primary.desired_count);
        if let Some(breaker) = breaker.filter(|b| b.enable)
            && primary.failed_tasks >= threshold
        {
            primary.rollout_state = RolloutState::Failed;
            primary.updated_at = now;
            let version = primary.version;
            let failed_tasks = primary.failed_tasks;
            self.changed.insert(version);
            warn!(
                service = %spec.name,
                version,
                failed_tasks,
                threshold,
                "deployment circuit breaker tripped"
            );
            return Some(RolloutOutcome::Failed {
                version,
                failed_tasks,
                rollback_to: if breaker.rollback { rollback_to } else { None },
            });
        }

        if !converged(primary, tasks) {
            return None;
        }
        primary.rollout_state = RolloutState::Completed;
        primary.updated_at = now;
        let version = primary.version;
        self.changed.insert(version);
        info!(service = %spec.name, version, "deployment completed");
        Some(RolloutOutcome::Completed { version })
    }

    /// Mark the steady-state event of a completed primary as emitted.
    ///
    /// Returns `true` exactly once per completed deployment.
    pub fn announce_steady(&mut self, now: u64) -> bool {
        let Some(primary) = self.primary_mut() else {
            return false;
        };
        if primary.rollout_state != RolloutState::Completed || primary.steady_announced {
            return false;
        }
        primary.steady_announced = true;
        primary.updated_at = now;
        let version = primary.version;
        self.changed.insert(version);
        true
    }

    pub fn primary(&self) -> Option<&Deployment> {
        self.deployments
            .iter()
            .rev()
            .find(|d| d.status == DeploymentStatus::Primary)
    }

    fn primary_mut(&mut self) -> Option<&mut Deployment> {
        self.deployments
            .iter_mut()
            .rev()
            .find(|d| d.status == DeploymentStatus::Primary)
    }

    /// The most recent completed deployment older than the primary that
    /// runs a different task definition.
    pub fn rollback_target(&self) -> Option<&Deployment> {
        let primary = self.primary()?;
        self.deployments.iter().rev().find(|d| {
            d.version < primary.version
                && d.rollout_state == RolloutState::Completed
                && d.task_definition != primary.task_definition
        })
    }

    pub fn deployments(&self) -> &[Deployment] {
        &self.deployments
    }

    /// Records modified since the tracker was built.
    pub fn changed(&self) -> impl Iterator<Item = &Deployment> {
        self.deployments
            .iter()
            .filter(|d| self.changed.contains(&d.version))
    }

    /// Older deployments whose tasks are all gone become inactive.
    fn retire_drained(&mut self, primary_definition: &str, tasks: &[TaskInstance], now: u64) {
        for deployment in &mut self.deployments {
            if deployment.status != DeploymentStatus::Active {
                continue;
            }
            let live = tasks.iter().any(|t| {
                t.service_version == deployment.version
                    && t.task_definition != primary_definition
                    && t.state != TaskState::Stopped
            });
            if !live {
                debug!(version = deployment.version, "deployment drained");
                deployment.status = DeploymentStatus::Inactive;
                deployment.updated_at = now;
                self.changed.insert(deployment.version);
            }
        }
    }
}

/// `desired` healthy tasks of the primary definition and nothing else live.
fn converged(primary: &Deployment, tasks: &[TaskInstance]) -> bool {
    let mut healthy = 0;
    for task in tasks.iter().filter(|t| t.state != TaskState::Stopped) {
        let current = task.task_definition == primary.task_definition
            && task.desired_status == DesiredStatus::Running;
        if !current || task.state != TaskState::Healthy {
            return false;
        }
        healthy += 1;
    }
    healthy == primary.desired_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_state::*;

    fn spec(version: u64, definition: &str, desired: u32, breaker: Option<CircuitBreaker>) -> ServiceSpec {
        ServiceSpec {
            cluster: "demo".to_string(),
            name: "web".to_string(),
            arn: String::new(),
            version,
            task_definition: definition.to_string(),
            desired_count: desired,
            placement_strategy: vec![],
            placement_constraints: vec![],
            capacity_provider_strategy: vec![],
            deployment_configuration: DeploymentConfiguration {
                minimum_healthy_percent: 0,
                maximum_percent: 100,
                circuit_breaker: breaker,
            },
            status: ServiceStatus::Active,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn task(id: &str, version: u64, definition: &str, state: TaskState) -> TaskInstance {
        TaskInstance {
            id: id.to_string(),
            cluster: "demo".to_string(),
            service: "web".to_string(),
            service_version: version,
            task_definition: definition.to_string(),
            host_id: Some("h1".to_string()),
            capacity_provider: None,
            reservation: TaskReservation::default(),
            state,
            health: match state {
                TaskState::Healthy => HealthStatus::Healthy,
                TaskState::Unhealthy => HealthStatus::Unhealthy,
                _ => HealthStatus::Unknown,
            },
            desired_status: DesiredStatus::Running,
            stopped_reason: None,
            ever_healthy: state == TaskState::Healthy,
            started_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    const BREAKER: Option<CircuitBreaker> = Some(CircuitBreaker {
        enable: true,
        rollback: true,
    });

    #[test]
    fn threshold_is_clamped() {
        assert_eq!(failure_threshold(1), 3);
        assert_eq!(failure_threshold(10), 5);
        assert_eq!(failure_threshold(11), 6);
        assert_eq!(failure_threshold(1000), 200);
    }

    #[test]
    fn first_version_becomes_primary_in_progress() {
        let mut tracker = DeploymentTracker::new(vec![]);
        assert!(tracker.ensure_primary(&spec(1, "web:1", 1, None), 10));
        assert!(!tracker.ensure_primary(&spec(1, "web:1", 1, None), 11));
        let primary = tracker.primary().unwrap();
        assert_eq!(primary.version, 1);
        assert_eq!(primary.rollout_state, RolloutState::InProgress);
        assert_eq!(tracker.changed().count(), 1);
    }

    #[test]
    fn completes_when_desired_tasks_are_healthy() {
        let s = spec(1, "web:1", 2, None);
        let mut tracker = DeploymentTracker::new(vec![]);
        tracker.ensure_primary(&s, 0);

        let mut tasks = vec![
            task("a", 1, "web:1", TaskState::Healthy),
            task("b", 1, "web:1", TaskState::Starting),
        ];
        assert_eq!(tracker.observe(&s, &tasks, 1), None);

        tasks[1] = task("b", 1, "web:1", TaskState::Healthy);
        assert_eq!(
            tracker.observe(&s, &tasks, 2),
            Some(RolloutOutcome::Completed { version: 1 })
        );
        assert!(tracker.announce_steady(3));
        assert!(!tracker.announce_steady(4));
        assert_eq!(tracker.observe(&s, &tasks, 5), None);
    }

    #[test]
    fn old_tasks_block_completion_and_retire_deployment() {
        let v1 = spec(1, "web:1", 1, None);
        let v2 = spec(2, "web:2", 1, None);
        let mut tracker = DeploymentTracker::new(vec![]);
        tracker.ensure_primary(&v1, 0);
        tracker.observe(&v1, &[task("a", 1, "web:1", TaskState::Healthy)], 1);
        tracker.ensure_primary(&v2, 2);
        assert_eq!(tracker.deployments()[0].status, DeploymentStatus::Active);

        let mid = vec![
            task("a", 1, "web:1", TaskState::Stopping),
            task("b", 2, "web:2", TaskState::Healthy),
        ];
        assert_eq!(tracker.observe(&v2, &mid, 3), None);

        let done = vec![
            task("a", 1, "web:1", TaskState::Stopped),
            task("b", 2, "web:2", TaskState::Healthy),
        ];
        assert_eq!(
            tracker.observe(&v2, &done, 4),
            Some(RolloutOutcome::Completed { version: 2 })
        );
        assert_eq!(tracker.deployments()[0].status, DeploymentStatus::Inactive);
    }

    #[test]
    fn scale_only_version_adopts_running_tasks() {
        let v1 = spec(1, "web:1", 1, None);
        let v2 = spec(2, "web:1", 2, None);
        let mut tracker = DeploymentTracker::new(vec![]);
        tracker.ensure_primary(&v1, 0);
        tracker.ensure_primary(&v2, 1);
        let tasks = vec![
            task("a", 1, "web:1", TaskState::Healthy),
            task("b", 2, "web:1", TaskState::Healthy),
        ];
        assert_eq!(
            tracker.observe(&v2, &tasks, 2),
            Some(RolloutOutcome::Completed { version: 2 })
        );
        assert_eq!(tracker.deployments()[0].status, DeploymentStatus::Inactive);
    }

    #[test]
    fn circuit_breaker_trips_and_rolls_back() {
        let v1 = spec(1, "web:1", 1, BREAKER);
        let v2 = spec(2, "web:2", 1, BREAKER);
        let mut tracker = DeploymentTracker::new(vec![]);
        tracker.ensure_primary(&v1, 0);
        tracker.observe(&v1, &[task("a", 1, "web:1", TaskState::Healthy)], 1);
        tracker.ensure_primary(&v2, 2);

        let mut tasks = vec![
            task("a", 1, "web:1", TaskState::Healthy),
            task("f1", 2, "web:2", TaskState::Stopped),
            task("f2", 2, "web:2", TaskState::Unhealthy),
        ];
        assert_eq!(tracker.observe(&v2, &tasks, 3), None);
        assert_eq!(tracker.primary().unwrap().failed_tasks, 2);

        tasks.push(task("f3", 2, "web:2", TaskState::Stopped));
        match tracker.observe(&v2, &tasks, 4) {
            Some(RolloutOutcome::Failed {
                version,
                failed_tasks,
                rollback_to,
            }) => {
                assert_eq!(version, 2);
                assert_eq!(failed_tasks, 3);
                assert_eq!(rollback_to.unwrap().task_definition, "web:1");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(tracker.primary().unwrap().rollout_state, RolloutState::Failed);
    }

    #[test]
    fn failure_count_never_decreases() {
        let v1 = spec(1, "web:1", 1, None);
        let mut tracker = DeploymentTracker::new(vec![]);
        tracker.ensure_primary(&v1, 0);
        tracker.observe(&v1, &[task("f1", 1, "web:1", TaskState::Stopped)], 1);
        tracker.observe(&v1, &[], 2);
        assert_eq!(tracker.primary().unwrap().failed_tasks, 1);
    }

    #[test]
    fn stopped_by_scheduler_is_not_a_failure() {
        let mut stopped = task("a", 1, "web:1", TaskState::Stopped);
        stopped.desired_status = DesiredStatus::Stopped;
        assert!(!stopped.failed_before_healthy());

        let mut crashed = task("b", 1, "web:1", TaskState::Stopped);
        assert!(crashed.failed_before_healthy());
        crashed.ever_healthy = true;
        assert!(!crashed.failed_before_healthy());
    }

    #[test]
    fn breaker_without_rollback_has_no_target() {
        let breaker = Some(CircuitBreaker {
            enable: true,
            rollback: false,
        });
        let v1 = spec(1, "web:1", 1, breaker);
        let mut tracker = DeploymentTracker::new(vec![]);
        tracker.ensure_primary(&v1, 0);
        let tasks: Vec<TaskInstance> = (0..3)
            .map(|i| task(&format!("f{i}"), 1, "web:1", TaskState::Stopped))
            .collect();
        assert_eq!(
            tracker.observe(&v1, &tasks, 1),
            Some(RolloutOutcome::Failed {
                version: 1,
                failed_tasks: 3,
                rollback_to: None
            })
        );
    }
}
