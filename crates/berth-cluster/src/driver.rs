//! Task drivers: the seam between the host agent and a container runtime.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info};

use berth_state::{
    ContainerDefinition, NetworkMode, Protocol, TaskDefinition, TaskId, TaskInstance,
};

use crate::error::{ClusterError, ClusterResult};

const TASK_LABEL: &str = "berth.task";
const ESSENTIAL_LABEL: &str = "berth.essential";

/// Runs the containers of a task on this host.
pub trait TaskDriver: Send + Sync + 'static {
    /// Start every container of the task.
    fn start(
        &self,
        task: &TaskInstance,
        definition: &TaskDefinition,
    ) -> impl Future<Output = ClusterResult<()>> + Send;

    /// Stop and remove the task's containers. Stopping a task that is not
    /// running is not an error.
    fn stop(&self, task_id: &str) -> impl Future<Output = ClusterResult<()>> + Send;

    /// Tasks whose essential containers are all running.
    fn running(&self) -> impl Future<Output = ClusterResult<BTreeSet<TaskId>>> + Send;
}

// ── Docker CLI ─────────────────────────────────────────────────────

/// Drives containers through the `docker` command line.
#[derive(Debug, Clone)]
pub struct DockerCliDriver {
    binary: String,
}

impl Default for DockerCliDriver {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCliDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn docker(&self, args: &[String]) -> ClusterResult<String> {
        let verb = args.first().map(String::as_str).unwrap_or_default();
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ClusterError::Driver(format!("{} {verb}: {e}", self.binary)))?;
        if !output.status.success() {
            return Err(ClusterError::Driver(format!(
                "{} {verb} exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl TaskDriver for DockerCliDriver {
    async fn start(&self, task: &TaskInstance, definition: &TaskDefinition) -> ClusterResult<()> {
        for container in &definition.containers {
            let args = run_args(task, definition.network_mode, container);
            if let Err(e) = self.docker(&args).await {
                // Leave nothing half-started behind.
                self.stop(&task.id).await?;
                return Err(e);
            }
            debug!(task_id = %task.id, container = %container.name, image = %container.image, "container started");
        }
        info!(task_id = %task.id, containers = definition.containers.len(), "task containers started");
        Ok(())
    }

    async fn stop(&self, task_id: &str) -> ClusterResult<()> {
        let ps = vec![
            "ps".to_string(),
            "-aq".to_string(),
            "--filter".to_string(),
            format!("label={TASK_LABEL}={task_id}"),
        ];
        let ids: Vec<String> = self
            .docker(&ps)
            .await?
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let mut rm = vec!["rm".to_string(), "-f".to_string()];
        rm.extend(ids);
        self.docker(&rm).await?;
        info!(%task_id, "task containers removed");
        Ok(())
    }

    async fn running(&self) -> ClusterResult<BTreeSet<TaskId>> {
        let ps = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("label={TASK_LABEL}"),
            "--format".to_string(),
            format!("{{{{.Label \"{TASK_LABEL}\"}}}}\t{{{{.Label \"{ESSENTIAL_LABEL}\"}}}}\t{{{{.State}}}}"),
        ];
        Ok(parse_running(&self.docker(&ps).await?))
    }
}

/// `docker run` arguments for one container of a task.
pub fn run_args(task: &TaskInstance, mode: NetworkMode, container: &ContainerDefinition) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        format!("berth-{}-{}", task.id, container.name),
        "--label".to_string(),
        format!("{TASK_LABEL}={}", task.id),
        "--label".to_string(),
        format!("{ESSENTIAL_LABEL}={}", container.essential),
        "--label".to_string(),
        format!("berth.service={}/{}", task.cluster, task.service),
    ];
    match mode {
        NetworkMode::Host => args.extend(["--network".to_string(), "host".to_string()]),
        NetworkMode::Bridge => {
            for mapping in &container.port_mappings {
                let protocol = match mapping.protocol {
                    Protocol::Tcp => "tcp",
                    Protocol::Udp => "udp",
                };
                let publish = match mapping.host_port.filter(|p| *p != 0) {
                    Some(host_port) => format!("{host_port}:{}/{protocol}", mapping.container_port),
                    None => format!("{}/{protocol}", mapping.container_port),
                };
                args.extend(["-p".to_string(), publish]);
            }
        }
    }
    if let Some(memory) = container.memory {
        args.extend(["--memory".to_string(), format!("{memory}m")]);
    }
    if let Some(reservation) = container.memory_reservation {
        args.extend(["--memory-reservation".to_string(), format!("{reservation}m")]);
    }
    if container.cpu > 0 {
        args.extend(["--cpu-shares".to_string(), container.cpu.to_string()]);
    }
    for env in &container.environment {
        args.extend(["-e".to_string(), format!("{}={}", env.key, env.value)]);
    }
    args.push(container.image.clone());
    args
}

/// Parse `task \t essential \t state` lines into the set of running tasks.
///
/// A task runs while every one of its essential containers is `running`.
fn parse_running(output: &str) -> BTreeSet<TaskId> {
    let mut tasks: BTreeMap<&str, bool> = BTreeMap::new();
    for line in output.lines() {
        let mut fields = line.split('\t');
        let (Some(task), Some(essential), Some(state)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if task.is_empty() {
            continue;
        }
        let up = tasks.entry(task).or_insert(true);
        if essential != "false" && state.trim() != "running" {
            *up = false;
        }
    }
    tasks
        .into_iter()
        .filter(|(_, up)| *up)
        .map(|(task, _)| task.to_string())
        .collect()
}

// ── Simulated ──────────────────────────────────────────────────────

/// In-memory driver: tasks "run" until stopped or `exit` is called.
///
/// Lets a single machine exercise the full control loop without a
/// container runtime.
#[derive(Debug, Default)]
pub struct SimulatedDriver {
    running: RwLock<BTreeSet<TaskId>>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a task's containers exit on their own.
    pub async fn exit(&self, task_id: &str) -> bool {
        self.running.write().await.remove(task_id)
    }
}

impl TaskDriver for SimulatedDriver {
    async fn start(&self, task: &TaskInstance, _definition: &TaskDefinition) -> ClusterResult<()> {
        self.running.write().await.insert(task.id.clone());
        debug!(task_id = %task.id, "simulated task started");
        Ok(())
    }

    async fn stop(&self, task_id: &str) -> ClusterResult<()> {
        self.running.write().await.remove(task_id);
        Ok(())
    }

    async fn running(&self) -> ClusterResult<BTreeSet<TaskId>> {
        Ok(self.running.read().await.clone())
    }
}
