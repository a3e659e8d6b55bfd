//! Host agent: runs on every container host.
//!
//! Registers the host, then heartbeats on an interval. Each heartbeat
//! carries the task state changes and probe results gathered since the
//! previous one along with the full set of running tasks, and returns the
//! commands the control plane has for the host, which the agent applies
//! through its `TaskDriver`.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use berth_health::{ProbeFn, ProbeReport, ProbeScheduler};
use berth_state::{HostCapacity, HostCommand, HostId, TaskId, TaskState, epoch_secs};

use crate::client::ControlPlaneClient;
use crate::driver::TaskDriver;
use crate::error::{ClusterError, ClusterResult};
use crate::membership::MembershipManager;
use crate::protocol::{
    HeartbeatRequest, HeartbeatResponse, RegisterHostRequest, RegisterHostResponse, TaskReport,
};

const PROBE_CHANNEL: usize = 1024;

/// The calls a host agent makes to the control plane.
pub trait ControlPlane: Send + Sync + 'static {
    fn register(
        &self,
        request: &RegisterHostRequest,
    ) -> impl Future<Output = ClusterResult<RegisterHostResponse>> + Send;

    fn heartbeat(
        &self,
        host_id: &str,
        request: &HeartbeatRequest,
    ) -> impl Future<Output = ClusterResult<HeartbeatResponse>> + Send;
}

impl ControlPlane for ControlPlaneClient {
    async fn register(&self, request: &RegisterHostRequest) -> ClusterResult<RegisterHostResponse> {
        ControlPlaneClient::register(self, request).await
    }

    async fn heartbeat(
        &self,
        host_id: &str,
        request: &HeartbeatRequest,
    ) -> ClusterResult<HeartbeatResponse> {
        ControlPlaneClient::heartbeat(self, host_id, request).await
    }
}

/// Agents in the control-plane process talk to membership directly.
impl ControlPlane for MembershipManager {
    async fn register(&self, request: &RegisterHostRequest) -> ClusterResult<RegisterHostResponse> {
        self.join(request)
    }

    async fn heartbeat(
        &self,
        host_id: &str,
        request: &HeartbeatRequest,
    ) -> ClusterResult<HeartbeatResponse> {
        let commands = MembershipManager::heartbeat(self, host_id, request).await?;
        Ok(HeartbeatResponse { commands })
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub cluster: String,
    /// Address the host is reachable at.
    pub address: String,
    pub capacity: HostCapacity,
    pub attributes: BTreeMap<String, String>,
    pub capacity_provider: Option<String>,
}

pub struct HostAgent<C, D> {
    config: AgentConfig,
    control_plane: Arc<C>,
    driver: Arc<D>,
    probes: ProbeScheduler,
    probe_rx: mpsc::Receiver<ProbeReport>,
    host_id: Option<HostId>,
    heartbeat_interval: Duration,
    /// Tasks this agent runs.
    running: BTreeSet<TaskId>,
    /// Task reports not yet delivered.
    outbox: Vec<TaskReport>,
    /// Stop commands whose driver call failed; retried next tick.
    retry: Vec<HostCommand>,
}

impl<C: ControlPlane, D: TaskDriver> HostAgent<C, D> {
    pub fn new(config: AgentConfig, control_plane: Arc<C>, driver: Arc<D>) -> Self {
        let (probe_tx, probe_rx) = mpsc::channel(PROBE_CHANNEL);
        Self {
            config,
            control_plane,
            driver,
            probes: ProbeScheduler::local(probe_tx),
            probe_rx,
            host_id: None,
            heartbeat_interval: Duration::from_secs(5),
            running: BTreeSet::new(),
            outbox: Vec::new(),
            retry: Vec::new(),
        }
    }

    /// Replace the probe used for health checks.
    pub fn with_probe(mut self, probe: ProbeFn) -> Self {
        let (probe_tx, probe_rx) = mpsc::channel(PROBE_CHANNEL);
        self.probes = ProbeScheduler::new(probe_tx, probe);
        self.probe_rx = probe_rx;
        self
    }

    pub fn host_id(&self) -> Option<&str> {
        self.host_id.as_deref()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Register with the control plane.
    ///
    /// Tasks the driver already runs are reported so the control plane can
    /// adopt them or ask for them to be stopped; adopted tasks with a
    /// health check are probed again.
    pub async fn register(&mut self) -> ClusterResult<HostId> {
        let running = self.driver.running().await?;
        let request = RegisterHostRequest {
            cluster: self.config.cluster.clone(),
            address: self.config.address.clone(),
            capacity: self.config.capacity,
            attributes: self.config.attributes.clone(),
            capacity_provider: self.config.capacity_provider.clone(),
            running: running.iter().cloned().collect(),
        };
        let response = self.control_plane.register(&request).await?;
        if response.heartbeat_interval_secs > 0 {
            self.heartbeat_interval = Duration::from_secs(response.heartbeat_interval_secs);
        }

        let now = epoch_secs();
        for task_id in running {
            if let Some(check) = response.health_checks.get(&task_id)
                && !self.probes.is_probing(&task_id).await
                && let Err(e) = self.probes.start(&task_id, check).await
            {
                warn!(%task_id, error = %e, "health probe not resumed");
            }
            if !self.outbox.iter().any(|r| r.task_id == task_id) {
                self.outbox.push(TaskReport {
                    task_id: task_id.clone(),
                    state: TaskState::Starting,
                    reason: None,
                    at: now,
                });
            }
            self.running.insert(task_id);
        }

        info!(
            host_id = %response.host_id,
            cluster = %self.config.cluster,
            interval = ?self.heartbeat_interval,
            running = self.running.len(),
            probed = response.health_checks.len(),
            "host registered with control plane"
        );
        self.host_id = Some(response.host_id.clone());
        Ok(response.host_id)
    }

    /// One heartbeat round trip. Returns the number of commands applied.
    pub async fn tick(&mut self) -> ClusterResult<usize> {
        let host_id = self.host_id.clone().ok_or(ClusterError::NotRegistered)?;

        for command in std::mem::take(&mut self.retry) {
            self.apply(command).await;
        }
        self.detect_exits().await;

        let mut probes = Vec::new();
        while let Ok(report) = self.probe_rx.try_recv() {
            if self.running.contains(&report.task_id) {
                probes.push(report);
            }
        }
        let request = HeartbeatRequest {
            tasks: std::mem::take(&mut self.outbox),
            probes,
            running: Some(self.running.clone()),
        };

        match self.control_plane.heartbeat(&host_id, &request).await {
            Ok(response) => {
                let applied = response.commands.len();
                for command in response.commands {
                    self.apply(command).await;
                }
                debug!(%host_id, reports = request.tasks.len(), applied, "heartbeat acknowledged");
                Ok(applied)
            }
            Err(e) => {
                // Task reports are state changes; probe results are not resent.
                let mut undelivered = request.tasks;
                undelivered.append(&mut self.outbox);
                self.outbox = undelivered;
                if e.is_unknown_host() {
                    warn!(%host_id, "control plane lost this host, registering again");
                    self.host_id = None;
                    self.register().await?;
                }
                Err(e)
            }
        }
    }

    /// Report tasks whose containers exited on their own.
    async fn detect_exits(&mut self) {
        let alive = match self.driver.running().await {
            Ok(alive) => alive,
            Err(e) => {
                warn!(error = %e, "could not list running tasks");
                return;
            }
        };
        let exited: Vec<TaskId> = self.running.difference(&alive).cloned().collect();
        for task_id in exited {
            self.running.remove(&task_id);
            self.probes.stop(&task_id).await;
            warn!(%task_id, "task exited");
            self.report(&task_id, TaskState::Stopped, Some("Essential container in task exited".to_string()));
        }
    }

    async fn apply(&mut self, command: HostCommand) {
        match command {
            HostCommand::Start {
                task,
                task_definition,
            } => {
                if self.running.contains(&task.id) {
                    return;
                }
                match self.driver.start(&task, &task_definition).await {
                    Ok(()) => {
                        self.running.insert(task.id.clone());
                        self.report(&task.id, TaskState::Starting, None);
                        if let Some(check) = task_definition.health_check()
                            && let Err(e) = self.probes.start(&task.id, check).await
                        {
                            warn!(task_id = %task.id, error = %e, "health probe not started");
                        }
                        info!(task_id = %task.id, service = %task.service, "task started");
                    }
                    Err(e) => {
                        warn!(task_id = %task.id, error = %e, "task failed to start");
                        self.report(
                            &task.id,
                            TaskState::Stopped,
                            Some(format!("CannotStartContainerError: {e}")),
                        );
                    }
                }
            }
            HostCommand::Stop { task_id, reason } => {
                self.probes.stop(&task_id).await;
                match self.driver.stop(&task_id).await {
                    Ok(()) => {
                        self.running.remove(&task_id);
                        self.report(&task_id, TaskState::Stopped, Some(reason));
                        info!(%task_id, "task stopped");
                    }
                    Err(e) => {
                        warn!(%task_id, error = %e, "task stop failed, retrying");
                        self.retry.push(HostCommand::Stop { task_id, reason });
                    }
                }
            }
        }
    }

    fn report(&mut self, task_id: &str, state: TaskState, reason: Option<String>) {
        self.outbox.push(TaskReport {
            task_id: task_id.to_string(),
            state,
            reason,
            at: epoch_secs(),
        });
    }

    /// Register if needed, then heartbeat until `shutdown` fires.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> ClusterResult<()> {
        if self.host_id.is_none() {
            self.register().await?;
        }
        info!(host_id = ?self.host_id, interval = ?self.heartbeat_interval, "heartbeat loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.heartbeat_interval) => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "heartbeat failed");
                    }
                }
                _ = shutdown.changed() => {
                    self.probes.stop_all().await;
                    info!(host_id = ?self.host_id, "heartbeat loop shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SimulatedDriver;
    use crate::membership::tests::setup;
    use berth_state::*;

    fn config() -> AgentConfig {
        AgentConfig {
            cluster: "demo".to_string(),
            address: "10.0.0.1".to_string(),
            capacity: HostCapacity {
                memory_mib: 2048,
                cpu_units: 1024,
            },
            attributes: BTreeMap::new(),
            capacity_provider: None,
        }
    }

    /// Store a pending task for `host_id` and queue its start command.
    fn queue_start(state: &StateStore, host_id: &str, task_id: &str) {
        queue_start_with(state, host_id, task_id, None);
    }

    fn queue_start_with(
        state: &StateStore,
        host_id: &str,
        task_id: &str,
        health_check: Option<HealthCheckSpec>,
    ) {
        let definition = state
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
            .unwrap();
        let task = TaskInstance {
            id: task_id.to_string(),
            cluster: "demo".to_string(),
            service: "web".to_string(),
            service_version: 1,
            task_definition: definition.reference(),
            host_id: Some(host_id.to_string()),
            capacity_provider: None,
            reservation: definition.reservation(),
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
        state
            .enqueue_command(
                host_id,
                &HostCommand::Start {
                    task,
                    task_definition: definition,
                },
            )
            .unwrap();
    }

    fn stored(state: &StateStore, task_id: &str) -> TaskInstance {
        state.get_task("demo", "web", task_id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn tick_requires_registration() {
        let (_, membership) = setup();
        let mut agent = HostAgent::new(config(), Arc::new(membership), Arc::new(SimulatedDriver::new()));
        assert!(matches!(agent.tick().await, Err(ClusterError::NotRegistered)));
    }

    #[tokio::test]
    async fn start_command_runs_task_and_reports_it() {
        let (state, membership) = setup();
        let driver = Arc::new(SimulatedDriver::new());
        let mut agent = HostAgent::new(config(), Arc::new(membership), Arc::clone(&driver));
        let host_id = agent.register().await.unwrap();
        queue_start(&state, &host_id, "t1");

        assert_eq!(agent.tick().await.unwrap(), 1);
        assert!(driver.running().await.unwrap().contains("t1"));
        assert_eq!(stored(&state, "t1").state, TaskState::Pending);

        agent.tick().await.unwrap();
        let task = stored(&state, "t1");
        assert_eq!(task.state, TaskState::Healthy);
        assert!(task.started_at.is_some());
    }

    #[tokio::test]
    async fn exited_task_is_reported_stopped() {
        let (state, membership) = setup();
        let driver = Arc::new(SimulatedDriver::new());
        let mut agent = HostAgent::new(config(), Arc::new(membership), Arc::clone(&driver));
        let host_id = agent.register().await.unwrap();
        queue_start(&state, &host_id, "t1");
        agent.tick().await.unwrap();
        agent.tick().await.unwrap();

        driver.exit("t1").await;
        agent.tick().await.unwrap();
        let task = stored(&state, "t1");
        assert_eq!(task.state, TaskState::Stopped);
        assert_eq!(
            task.stopped_reason.as_deref(),
            Some("Essential container in task exited")
        );
    }

    #[tokio::test]
    async fn stop_command_stops_task() {
        let (state, membership) = setup();
        let driver = Arc::new(SimulatedDriver::new());
        let mut agent = HostAgent::new(config(), Arc::new(membership), Arc::clone(&driver));
        let host_id = agent.register().await.unwrap();
        queue_start(&state, &host_id, "t1");
        agent.tick().await.unwrap();
        agent.tick().await.unwrap();

        state
            .enqueue_command(
                &host_id,
                &HostCommand::Stop {
                    task_id: "t1".to_string(),
                    reason: "Scaling activity initiated by service".to_string(),
                },
            )
            .unwrap();
        agent.tick().await.unwrap();
        assert!(driver.running().await.unwrap().is_empty());
        agent.tick().await.unwrap();
        assert_eq!(stored(&state, "t1").state, TaskState::Stopped);
    }

    #[tokio::test]
    async fn heartbeat_carries_running_set() {
        let (state, membership) = setup();
        let membership = membership.with_redispatch_after(Duration::ZERO);
        let driver = Arc::new(SimulatedDriver::new());
        let mut agent = HostAgent::new(config(), Arc::new(membership), Arc::clone(&driver));
        let host_id = agent.register().await.unwrap();
        queue_start(&state, &host_id, "t1");

        // The start command is lost: the control plane sends it again.
        state.drain_commands(&host_id).unwrap();
        assert_eq!(agent.tick().await.unwrap(), 1);
        assert!(driver.running().await.unwrap().contains("t1"));
        agent.tick().await.unwrap();
        assert_eq!(stored(&state, "t1").state, TaskState::Healthy);
    }

    #[tokio::test]
    async fn restarted_agent_resumes_health_checks() {
        let (state, membership) = setup();
        let membership = Arc::new(membership);
        let driver = Arc::new(SimulatedDriver::new());
        let mut agent = HostAgent::new(config(), Arc::clone(&membership), Arc::clone(&driver));
        let host_id = agent.register().await.unwrap();
        let check = HealthCheckSpec {
            command: vec!["CMD-SHELL".to_string(), "true".to_string()],
            interval_secs: 5,
            timeout_secs: 2,
            retries: 1,
            start_period_secs: 0,
        };
        queue_start_with(&state, &host_id, "t1", Some(check));
        agent.tick().await.unwrap();
        assert!(agent.probes.is_probing("t1").await);
        agent.probes.stop_all().await;
        drop(agent);

        // Same host, same containers, fresh agent.
        let mut restarted = HostAgent::new(config(), membership, driver);
        restarted.register().await.unwrap();
        assert!(restarted.probes.is_probing("t1").await);
        restarted.probes.stop_all().await;
    }

    #[tokio::test]
    async fn forgotten_host_registers_again() {
        let (state, membership) = setup();
        let membership = Arc::new(membership);
        let mut agent = HostAgent::new(config(), Arc::clone(&membership), Arc::new(SimulatedDriver::new()));
        let host_id = agent.register().await.unwrap();
        membership.deregister(&host_id).unwrap();

        let err = agent.tick().await.unwrap_err();
        assert!(err.is_unknown_host());
        assert_eq!(agent.host_id(), Some(host_id.as_str()));
        assert!(state.get_host(&host_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (state, membership) = setup();
        let mut agent = HostAgent::new(config(), Arc::new(membership), Arc::new(SimulatedDriver::new()));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { agent.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(state.list_all_hosts().unwrap().len(), 1);
    }
}
