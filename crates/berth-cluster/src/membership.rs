//! Membership manager: tracks the hosts of every cluster.
//!
//! Hosts register once, then heartbeat. A heartbeat carries the host's
//! task reports, probe results and the set of tasks it runs, and returns
//! the commands queued for it plus any start or stop the host evidently
//! never received. Hosts that stop heartbeating become `inactive`; the
//! reconciler then marks their tasks stopped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use berth_health::HealthMonitor;
use berth_state::*;

use crate::error::{ClusterError, ClusterResult};
use crate::protocol::{HeartbeatRequest, RegisterHostRequest, RegisterHostResponse, TaskReport};

const INSTANCE_ID: &str = "instance-id";

pub struct MembershipManager {
    state: StateStore,
    health: Arc<HealthMonitor>,
    /// Silence after which a host is considered dead.
    dead_timeout: Duration,
    /// Heartbeat interval handed to agents.
    heartbeat_interval: Duration,
    /// How long a host may ignore a start or stop before it is resent.
    redispatch_after: Duration,
}

impl MembershipManager {
    pub fn new(state: StateStore, health: Arc<HealthMonitor>) -> Self {
        Self {
            state,
            health,
            dead_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            redispatch_after: Duration::from_secs(15),
        }
    }

    pub fn with_redispatch_after(mut self, wait: Duration) -> Self {
        self.redispatch_after = wait;
        self
    }

    pub fn with_dead_timeout(mut self, timeout: Duration) -> Self {
        self.dead_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Register a host, or refresh the registration of a known one.
    ///
    /// The host id is derived from cluster and address, so a restarted
    /// agent gets its old id back. Registration makes the host `active`.
    pub fn register(&self, request: &RegisterHostRequest) -> ClusterResult<HostNode> {
        let cluster = self.state.get_cluster(&request.cluster)?.ok_or_else(|| {
            ClusterError::InvalidRegistration(format!("cluster {} does not exist", request.cluster))
        })?;
        if let Some(provider) = &request.capacity_provider
            && !cluster.capacity_providers.contains(provider)
        {
            return Err(ClusterError::InvalidRegistration(format!(
                "capacity provider {provider} is not associated with cluster {}",
                cluster.name
            )));
        }
        if request.capacity.memory_mib == 0 || request.capacity.cpu_units == 0 {
            return Err(ClusterError::InvalidRegistration(
                "host capacity must be non-zero".to_string(),
            ));
        }

        let id = host_id(&request.cluster, &request.address);
        let now = epoch_secs();
        let existing = self.state.get_host(&id)?;
        let mut attributes = request.attributes.clone();
        attributes
            .entry(INSTANCE_ID.to_string())
            .or_insert_with(|| id.clone());

        let host = HostNode {
            id: id.clone(),
            cluster: request.cluster.clone(),
            address: request.address.clone(),
            capacity: request.capacity,
            attributes,
            capacity_provider: request.capacity_provider.clone(),
            status: HostStatus::Active,
            registered_at: existing.map(|h| h.registered_at).unwrap_or(now),
            last_heartbeat: now,
        };
        self.state.put_host(&host)?;
        info!(
            host_id = %id,
            cluster = %host.cluster,
            address = %host.address,
            memory_mib = host.capacity.memory_mib,
            cpu_units = host.capacity.cpu_units,
            "host registered"
        );
        Ok(host)
    }

    /// Register a host and hand back the health checks of the tasks it
    /// already runs, so a restarted agent resumes probing them.
    pub fn join(&self, request: &RegisterHostRequest) -> ClusterResult<RegisterHostResponse> {
        let host = self.register(request)?;
        let mut health_checks = BTreeMap::new();
        for task in self.state.list_tasks_on_host(&host.id)? {
            if !task.state.is_live()
                || task.desired_status != DesiredStatus::Running
                || !request.running.contains(&task.id)
            {
                continue;
            }
            let Some(definition) = self.state.get_task_definition(&task.task_definition)? else {
                continue;
            };
            if let Some(check) = definition.health_check().filter(|c| !c.is_disabled()) {
                health_checks.insert(task.id, check.clone());
            }
        }
        if !request.running.is_empty() {
            info!(
                host_id = %host.id,
                running = request.running.len(),
                probed = health_checks.len(),
                "host rejoined with running tasks"
            );
        }
        Ok(RegisterHostResponse {
            host_id: host.id,
            heartbeat_interval_secs: self.heartbeat_interval.as_secs(),
            health_checks,
        })
    }

    /// Process a heartbeat and return the commands for the host.
    pub async fn heartbeat(
        &self,
        host_id: &str,
        request: &HeartbeatRequest,
    ) -> ClusterResult<Vec<HostCommand>> {
        let mut host = self
            .state
            .get_host(host_id)?
            .ok_or_else(|| ClusterError::UnknownHost(host_id.to_string()))?;
        if host.status == HostStatus::Inactive {
            host.status = HostStatus::Active;
            info!(%host_id, "host back online");
        }
        host.last_heartbeat = epoch_secs();
        self.state.put_host(&host)?;

        let mut tasks: HashMap<TaskId, TaskInstance> = self
            .state
            .list_tasks_on_host(host_id)?
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();

        let mut orphans = Vec::new();
        for report in &request.tasks {
            // Health comes from probe results, never from the host's word.
            if !matches!(report.state, TaskState::Starting | TaskState::Stopped) {
                warn!(%host_id, task_id = %report.task_id, state = %report.state, "task report ignored");
                continue;
            }
            match tasks.get_mut(&report.task_id) {
                Some(task) => {
                    if let Some(command) = self.apply_report(task, report).await? {
                        orphans.push(command);
                    }
                }
                None if report.state.is_live() => {
                    warn!(%host_id, task_id = %report.task_id, "host runs a task the cluster does not know");
                    orphans.push(HostCommand::Stop {
                        task_id: report.task_id.clone(),
                        reason: "Task is not known to the cluster".to_string(),
                    });
                }
                None => {}
            }
        }

        for probe in &request.probes {
            let Some(task) = tasks.get_mut(&probe.task_id) else {
                debug!(%host_id, task_id = %probe.task_id, "probe for unknown task dropped");
                continue;
            };
            if let Some(updated) = self.health.record(task, probe).await? {
                *task = updated;
            }
        }

        let mut commands = self.state.drain_commands(host_id)?;
        if let Some(running) = &request.running {
            let resent = self.check_running(host_id, running, &mut tasks, &commands).await?;
            commands.extend(resent);
        }
        commands.extend(orphans);
        debug!(
            %host_id,
            reports = request.tasks.len(),
            probes = request.probes.len(),
            commands = commands.len(),
            "heartbeat received"
        );
        Ok(commands)
    }

    /// Apply one task report to the stored task, forward-only.
    ///
    /// Returns a stop command when the host still runs a task the cluster
    /// already considers stopped.
    async fn apply_report(
        &self,
        task: &mut TaskInstance,
        report: &TaskReport,
    ) -> ClusterResult<Option<HostCommand>> {
        let mut stop = None;
        let updated = self.state.update_task(&task.table_key(), |t| {
            if t.state == TaskState::Stopped {
                if report.state.is_live() {
                    stop = Some(HostCommand::Stop {
                        task_id: t.id.clone(),
                        reason: t
                            .stopped_reason
                            .clone()
                            .unwrap_or_else(|| "Task was stopped by the cluster".to_string()),
                    });
                }
                return false;
            }
            if !t.state.can_transition_to(report.state) {
                return false;
            }
            t.state = report.state;
            t.updated_at = epoch_secs();
            match report.state {
                TaskState::Starting => t.started_at = Some(report.at),
                _ => {
                    if t.stopped_reason.is_none() {
                        t.stopped_reason = report.reason.clone();
                    }
                }
            }
            true
        })?;
        let Some(updated) = updated else {
            return Ok(stop);
        };
        *task = updated;

        if task.state == TaskState::Starting {
            info!(task_id = %task.id, service = %task.service, "task running");
            if let Some(updated) = self.health.mark_running(task).await? {
                *task = updated;
            }
        } else {
            self.health.forget(&task.id).await;
            info!(
                task_id = %task.id,
                service = %task.service,
                reason = task.stopped_reason.as_deref().unwrap_or(""),
                "task stopped"
            );
        }
        Ok(None)
    }

    /// Compare the tasks placed on a host with the set it says it runs.
    ///
    /// A start or stop the host has not acted on after `redispatch_after`
    /// was lost on the way and is sent again. Tasks the host no longer
    /// runs are recorded stopped.
    async fn check_running(
        &self,
        host_id: &str,
        running: &BTreeSet<TaskId>,
        tasks: &mut HashMap<TaskId, TaskInstance>,
        queued: &[HostCommand],
    ) -> ClusterResult<Vec<HostCommand>> {
        let now = epoch_secs();
        let wait = self.redispatch_after.as_secs();
        let queued: BTreeSet<&str> = queued.iter().map(HostCommand::task_id).collect();
        let mut resent = Vec::new();

        for task in tasks.values_mut() {
            if !task.state.is_live() || queued.contains(task.id.as_str()) {
                continue;
            }
            let stale = now.saturating_sub(task.updated_at) >= wait;
            let wants_running = task.desired_status == DesiredStatus::Running;

            if running.contains(&task.id) {
                if wants_running || !stale {
                    continue;
                }
                let Some(touched) = self.touch(task, now, DesiredStatus::Stopped)? else {
                    continue;
                };
                *task = touched;
                warn!(%host_id, task_id = %task.id, "stop not acknowledged, sending again");
                resent.push(HostCommand::Stop {
                    task_id: task.id.clone(),
                    reason: task
                        .stopped_reason
                        .clone()
                        .unwrap_or_else(|| "Task was stopped by the cluster".to_string()),
                });
                continue;
            }

            if task.state == TaskState::Pending && wants_running {
                if !stale {
                    continue;
                }
                let Some(definition) = self.state.get_task_definition(&task.task_definition)? else {
                    continue;
                };
                let Some(touched) = self.touch(task, now, DesiredStatus::Running)? else {
                    continue;
                };
                *task = touched;
                warn!(%host_id, task_id = %task.id, "start not acknowledged, sending again");
                resent.push(HostCommand::Start {
                    task: task.clone(),
                    task_definition: definition,
                });
                continue;
            }

            let reason = format!("Task is no longer running on host {host_id}");
            let updated = self.state.update_task(&task.table_key(), |t| {
                if !t.state.is_live() || (t.state == TaskState::Pending && t.desired_status == DesiredStatus::Running) {
                    return false;
                }
                t.state = TaskState::Stopped;
                if t.stopped_reason.is_none() {
                    t.stopped_reason = Some(reason.clone());
                }
                t.updated_at = now;
                true
            })?;
            if let Some(updated) = updated {
                *task = updated;
                self.health.forget(&task.id).await;
                warn!(
                    %host_id,
                    task_id = %task.id,
                    reason = task.stopped_reason.as_deref().unwrap_or(""),
                    "task missing from host, marked stopped"
                );
            }
        }
        Ok(resent)
    }

    /// Restart the resend clock of a task that still wants `desired`.
    fn touch(
        &self,
        task: &TaskInstance,
        now: u64,
        desired: DesiredStatus,
    ) -> ClusterResult<Option<TaskInstance>> {
        let state = task.state;
        Ok(self.state.update_task(&task.table_key(), |t| {
            if t.state != state || t.desired_status != desired {
                return false;
            }
            t.updated_at = now;
            true
        })?)
    }

    /// Stop placing tasks on a host; the reconciler moves its tasks away.
    pub fn drain(&self, host_id: &str) -> ClusterResult<HostNode> {
        let mut host = self
            .state
            .get_host(host_id)?
            .ok_or_else(|| ClusterError::UnknownHost(host_id.to_string()))?;
        if host.status != HostStatus::Draining {
            host.status = HostStatus::Draining;
            self.state.put_host(&host)?;
            info!(%host_id, "host draining");
        }
        Ok(host)
    }

    /// Remove a host record. Its tasks are reaped by the reconciler.
    pub fn deregister(&self, host_id: &str) -> ClusterResult<bool> {
        let existed = self.state.delete_host(host_id)?;
        if existed {
            info!(%host_id, "host deregistered");
        }
        Ok(existed)
    }

    /// Mark hosts silent for longer than the dead timeout `inactive`.
    ///
    /// Returns the ids of the hosts that changed.
    pub fn reap_dead(&self, now: u64) -> ClusterResult<Vec<HostId>> {
        let timeout = self.dead_timeout.as_secs();
        let mut reaped = Vec::new();
        for mut host in self.state.list_all_hosts()? {
            if host.status == HostStatus::Inactive || now.saturating_sub(host.last_heartbeat) <= timeout {
                continue;
            }
            host.status = HostStatus::Inactive;
            self.state.put_host(&host)?;
            warn!(host_id = %host.id, last_heartbeat = host.last_heartbeat, "host stopped responding");
            reaped.push(host.id);
        }
        Ok(reaped)
    }
}

/// Stable host id for an address within a cluster.
fn host_id(cluster: &str, address: &str) -> HostId {
    let digest = Sha256::digest(format!("{cluster}/{address}"));
    format!("host-{}", &hex::encode(digest)[..12])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use berth_health::{ProbeReport, ProbeResult};

    pub(crate) fn setup() -> (StateStore, MembershipManager) {
        let state = StateStore::open_in_memory().unwrap();
        state
            .create_cluster(&ClusterInput {
                name: "demo".to_string(),
                capacity_providers: vec!["default".to_string()],
            })
            .unwrap();
        let health = Arc::new(HealthMonitor::new(state.clone()));
        let membership = MembershipManager::new(state.clone(), health);
        (state, membership)
    }

    pub(crate) fn registration(address: &str) -> RegisterHostRequest {
        RegisterHostRequest {
            cluster: "demo".to_string(),
            address: address.to_string(),
            capacity: HostCapacity {
                memory_mib: 2048,
                cpu_units: 1024,
            },
            attributes: Default::default(),
            capacity_provider: Some("default".to_string()),
            running: vec![],
        }
    }

    fn definition(state: &StateStore, health_check: Option<HealthCheckSpec>) -> TaskDefinition {
        state
            .register_task_definition(&TaskDefinitionInput {
                family: "web".to_string(),
                network_mode: NetworkMode::Host,
                containers: vec![ContainerDefinition {
                    name: "nginx".to_string(),
                    image: "nginx".to_string(),
                    port_mappings: vec![],
                    memory: Some(256),
                    memory_reservation: None,
                    cpu: 0,
                    environment: vec![],
                    essential: true,
                    health_check,
                }],
            })
            .unwrap()
    }

    fn pending_task(state: &StateStore, id: &str, def: &TaskDefinition, host_id: &str) -> TaskInstance {
        let task = TaskInstance {
            id: id.to_string(),
            cluster: "demo".to_string(),
            service: "web".to_string(),
            service_version: 1,
            task_definition: def.reference(),
            host_id: Some(host_id.to_string()),
            capacity_provider: None,
            reservation: def.reservation(),
            state: TaskState::Pending,
            health: HealthStatus::Unknown,
            desired_status: DesiredStatus::Running,
            stopped_reason: None,
            ever_healthy: false,
            started_at: None,
            created_at: 0,
            updated_at: 0,
        };
        state.put_task(&task).unwrap();
        task
    }

    fn report(task_id: &str, state: TaskState) -> TaskReport {
        TaskReport {
            task_id: task_id.to_string(),
            state,
            reason: None,
            at: epoch_secs(),
        }
    }

    #[test]
    fn register_assigns_stable_id() {
        let (_, membership) = setup();
        let first = membership.register(&registration("10.0.0.1")).unwrap();
        let again = membership.register(&registration("10.0.0.1")).unwrap();
        let other = membership.register(&registration("10.0.0.2")).unwrap();

        assert!(first.id.starts_with("host-"));
        assert_eq!(first.id, again.id);
        assert_ne!(first.id, other.id);
        assert_eq!(first.instance_id(), first.id);
        assert_eq!(first.status, HostStatus::Active);
    }

    #[test]
    fn register_rejects_unknown_cluster_and_provider() {
        let (_, membership) = setup();
        let mut request = registration("10.0.0.1");
        request.cluster = "nope".to_string();
        assert!(matches!(
            membership.register(&request),
            Err(ClusterError::InvalidRegistration(_))
        ));

        let mut request = registration("10.0.0.1");
        request.capacity_provider = Some("spot".to_string());
        assert!(matches!(
            membership.register(&request),
            Err(ClusterError::InvalidRegistration(_))
        ));
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_host_fails() {
        let (_, membership) = setup();
        let err = membership
            .heartbeat("host-missing", &HeartbeatRequest::default())
            .await
            .unwrap_err();
        assert!(err.is_unknown_host());
    }

    #[tokio::test]
    async fn heartbeat_returns_queued_commands() {
        let (state, membership) = setup();
        let host = membership.register(&registration("10.0.0.1")).unwrap();
        state
            .enqueue_command(
                &host.id,
                &HostCommand::Stop {
                    task_id: "t1".to_string(),
                    reason: "test".to_string(),
                },
            )
            .unwrap();

        let commands = membership
            .heartbeat(&host.id, &HeartbeatRequest::default())
            .await
            .unwrap();
        assert_eq!(commands.len(), 1);
        let commands = membership
            .heartbeat(&host.id, &HeartbeatRequest::default())
            .await
            .unwrap();
        assert!(commands.is_empty());
    }

    #[tokio::test]
    async fn running_task_without_check_becomes_healthy() {
        let (state, membership) = setup();
        let host = membership.register(&registration("10.0.0.1")).unwrap();
        let def = definition(&state, None);
        pending_task(&state, "t1", &def, &host.id);

        let request = HeartbeatRequest {
            tasks: vec![report("t1", TaskState::Starting)],
            probes: vec![],
            running: None,
        };
        membership.heartbeat(&host.id, &request).await.unwrap();

        let task = state.get_task("demo", "web", "t1").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Healthy);
        assert!(task.ever_healthy);
        assert!(task.started_at.is_some());
    }

    #[tokio::test]
    async fn probe_reports_reach_the_health_monitor() {
        let (state, membership) = setup();
        let host = membership.register(&registration("10.0.0.1")).unwrap();
        let def = definition(
            &state,
            Some(HealthCheckSpec {
                command: vec!["CMD-SHELL".to_string(), "true".to_string()],
                interval_secs: 5,
                timeout_secs: 2,
                retries: 1,
                start_period_secs: 0,
            }),
        );
        pending_task(&state, "t1", &def, &host.id);

        let start = HeartbeatRequest {
            tasks: vec![report("t1", TaskState::Starting)],
            probes: vec![],
            running: None,
        };
        membership.heartbeat(&host.id, &start).await.unwrap();
        let task = state.get_task("demo", "web", "t1").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Starting);

        let probe = HeartbeatRequest {
            tasks: vec![],
            probes: vec![ProbeReport {
                task_id: "t1".to_string(),
                result: ProbeResult::Unhealthy,
                at: epoch_secs() + 10,
            }],
            running: None,
        };
        membership.heartbeat(&host.id, &probe).await.unwrap();
        let task = state.get_task("demo", "web", "t1").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Unhealthy);
        assert_eq!(task.health, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn reports_only_move_forward() {
        let (state, membership) = setup();
        let host = membership.register(&registration("10.0.0.1")).unwrap();
        let def = definition(&state, None);
        pending_task(&state, "t1", &def, &host.id);

        let mut stopped = report("t1", TaskState::Stopped);
        stopped.reason = Some("Essential container in task exited".to_string());
        let request = HeartbeatRequest {
            tasks: vec![stopped, report("t1", TaskState::Starting)],
            probes: vec![],
            running: None,
        };
        let commands = membership.heartbeat(&host.id, &request).await.unwrap();

        let task = state.get_task("demo", "web", "t1").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Stopped);
        assert_eq!(
            task.stopped_reason.as_deref(),
            Some("Essential container in task exited")
        );
        // The late "running" report for a stopped task asks the host to stop it.
        assert!(matches!(&commands[..], [HostCommand::Stop { task_id, .. }] if task_id == "t1"));
    }

    #[tokio::test]
    async fn unknown_running_task_is_stopped() {
        let (_, membership) = setup();
        let host = membership.register(&registration("10.0.0.1")).unwrap();
        let request = HeartbeatRequest {
            tasks: vec![report("ghost", TaskState::Starting)],
            probes: vec![],
            running: None,
        };
        let commands = membership.heartbeat(&host.id, &request).await.unwrap();
        assert!(matches!(&commands[..], [HostCommand::Stop { task_id, .. }] if task_id == "ghost"));
    }

    fn running(ids: &[&str]) -> HeartbeatRequest {
        HeartbeatRequest {
            running: Some(ids.iter().map(|id| id.to_string()).collect()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn host_cannot_report_health() {
        let (state, membership) = setup();
        let host = membership.register(&registration("10.0.0.1")).unwrap();
        let def = definition(
            &state,
            Some(HealthCheckSpec {
                command: vec!["CMD-SHELL".to_string(), "true".to_string()],
                interval_secs: 5,
                timeout_secs: 2,
                retries: 1,
                start_period_secs: 0,
            }),
        );
        pending_task(&state, "t1", &def, &host.id);

        let request = HeartbeatRequest {
            tasks: vec![report("t1", TaskState::Starting), report("t1", TaskState::Healthy)],
            probes: vec![],
            running: None,
        };
        membership.heartbeat(&host.id, &request).await.unwrap();
        let task = state.get_task("demo", "web", "t1").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Starting);
        assert!(!task.ever_healthy);
    }

    #[tokio::test]
    async fn report_does_not_undo_a_concurrent_stop() {
        let (state, membership) = setup();
        let host = membership.register(&registration("10.0.0.1")).unwrap();
        let def = definition(&state, None);
        let mut seen = pending_task(&state, "t1", &def, &host.id);
        // The reconciler stops the task after the heartbeat read it.
        let mut stopping = seen.clone();
        stopping.state = TaskState::Stopping;
        stopping.desired_status = DesiredStatus::Stopped;
        stopping.stopped_reason = Some("Scaling activity initiated by service".to_string());
        state.put_task(&stopping).unwrap();

        let command = membership
            .apply_report(&mut seen, &report("t1", TaskState::Starting))
            .await
            .unwrap();
        assert!(command.is_none());
        let task = state.get_task("demo", "web", "t1").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Stopping);
        assert_eq!(task.desired_status, DesiredStatus::Stopped);

        let mut exited = report("t1", TaskState::Stopped);
        exited.reason = Some("Essential container in task exited".to_string());
        membership.apply_report(&mut seen, &exited).await.unwrap();
        let task = state.get_task("demo", "web", "t1").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Stopped);
        assert!(!task.failed_before_healthy());
    }

    #[tokio::test]
    async fn lost_start_is_sent_again() {
        let (state, membership) = setup();
        let host = membership.register(&registration("10.0.0.1")).unwrap();
        let def = definition(&state, None);
        // Created long ago, never acted on by the host.
        pending_task(&state, "t1", &def, &host.id);

        // Hosts that do not send their running set are not second-guessed.
        let commands = membership
            .heartbeat(&host.id, &HeartbeatRequest::default())
            .await
            .unwrap();
        assert!(commands.is_empty());

        let commands = membership.heartbeat(&host.id, &running(&[])).await.unwrap();
        assert!(matches!(&commands[..], [HostCommand::Start { task, .. }] if task.id == "t1"));

        // The resend restarts the clock.
        let commands = membership.heartbeat(&host.id, &running(&[])).await.unwrap();
        assert!(commands.is_empty());
        assert_eq!(
            state.get_task("demo", "web", "t1").unwrap().unwrap().state,
            TaskState::Pending
        );
    }

    #[tokio::test]
    async fn queued_start_is_not_duplicated() {
        let (state, membership) = setup();
        let membership = membership.with_redispatch_after(Duration::ZERO);
        let host = membership.register(&registration("10.0.0.1")).unwrap();
        let def = definition(&state, None);
        let task = pending_task(&state, "t1", &def, &host.id);
        state
            .enqueue_command(
                &host.id,
                &HostCommand::Start {
                    task,
                    task_definition: def,
                },
            )
            .unwrap();

        let commands = membership.heartbeat(&host.id, &running(&[])).await.unwrap();
        assert_eq!(commands.len(), 1);
    }

    #[tokio::test]
    async fn lost_stop_is_sent_again_then_settled() {
        let (state, membership) = setup();
        let host = membership.register(&registration("10.0.0.1")).unwrap();
        let def = definition(&state, None);
        let mut task = pending_task(&state, "t1", &def, &host.id);
        task.state = TaskState::Stopping;
        task.desired_status = DesiredStatus::Stopped;
        task.stopped_reason = Some("Scaling activity initiated by service".to_string());
        state.put_task(&task).unwrap();

        let commands = membership.heartbeat(&host.id, &running(&["t1"])).await.unwrap();
        assert!(matches!(
            &commands[..],
            [HostCommand::Stop { task_id, reason }]
                if task_id == "t1" && reason == "Scaling activity initiated by service"
        ));

        // The host no longer runs it: the stop took effect.
        membership.heartbeat(&host.id, &running(&[])).await.unwrap();
        let task = state.get_task("demo", "web", "t1").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Stopped);
        assert_eq!(
            task.stopped_reason.as_deref(),
            Some("Scaling activity initiated by service")
        );
    }

    #[tokio::test]
    async fn task_missing_from_host_is_stopped() {
        let (state, membership) = setup();
        let host = membership.register(&registration("10.0.0.1")).unwrap();
        let def = definition(&state, None);
        pending_task(&state, "t1", &def, &host.id);
        let start = HeartbeatRequest {
            tasks: vec![report("t1", TaskState::Starting)],
            probes: vec![],
            running: Some(["t1".to_string()].into()),
        };
        membership.heartbeat(&host.id, &start).await.unwrap();
        assert_eq!(
            state.get_task("demo", "web", "t1").unwrap().unwrap().state,
            TaskState::Healthy
        );

        membership.heartbeat(&host.id, &running(&[])).await.unwrap();
        let task = state.get_task("demo", "web", "t1").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Stopped);
        assert_eq!(task.desired_status, DesiredStatus::Running);
    }

    #[tokio::test]
    async fn join_returns_checks_of_running_tasks() {
        let (state, membership) = setup();
        let host = membership.register(&registration("10.0.0.1")).unwrap();
        let check = HealthCheckSpec {
            command: vec!["CMD-SHELL".to_string(), "true".to_string()],
            interval_secs: 5,
            timeout_secs: 2,
            retries: 1,
            start_period_secs: 0,
        };
        let def = definition(&state, Some(check.clone()));
        pending_task(&state, "t1", &def, &host.id);
        pending_task(&state, "t2", &def, &host.id);

        let mut request = registration("10.0.0.1");
        request.running = vec!["t1".to_string(), "ghost".to_string()];
        let response = membership.join(&request).unwrap();
        assert_eq!(response.host_id, host.id);
        assert_eq!(response.heartbeat_interval_secs, 5);
        assert_eq!(response.health_checks.len(), 1);
        assert_eq!(response.health_checks.get("t1"), Some(&check));
    }

    #[tokio::test]
    async fn silent_hosts_become_inactive_until_they_return() {
        let (state, membership) = setup();
        let membership = membership.with_dead_timeout(Duration::from_secs(30));
        let host = membership.register(&registration("10.0.0.1")).unwrap();

        assert!(membership.reap_dead(host.last_heartbeat + 10).unwrap().is_empty());
        let reaped = membership.reap_dead(host.last_heartbeat + 31).unwrap();
        assert_eq!(reaped, vec![host.id.clone()]);
        assert_eq!(
            state.get_host(&host.id).unwrap().unwrap().status,
            HostStatus::Inactive
        );
        assert!(membership.reap_dead(host.last_heartbeat + 60).unwrap().is_empty());

        membership
            .heartbeat(&host.id, &HeartbeatRequest::default())
            .await
            .unwrap();
        assert_eq!(
            state.get_host(&host.id).unwrap().unwrap().status,
            HostStatus::Active
        );
    }

    #[test]
    fn drain_and_deregister() {
        let (state, membership) = setup();
        let host = membership.register(&registration("10.0.0.1")).unwrap();

        let drained = membership.drain(&host.id).unwrap();
        assert_eq!(drained.status, HostStatus::Draining);
        assert!(membership.deregister(&host.id).unwrap());
        assert!(state.get_host(&host.id).unwrap().is_none());
        assert!(matches!(
            membership.drain(&host.id),
            Err(ClusterError::UnknownHost(_))
        ));
    }
}
