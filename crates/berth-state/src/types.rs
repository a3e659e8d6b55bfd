//! Domain types for the Berth state store.
//!
//! These types are the persisted desired and observed state of a cluster.
//! All of them are serialized to JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a task instance (uuid v4).
pub type TaskId = String;

/// Unique identifier for a host.
pub type HostId = String;

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Cluster ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cluster {
    pub name: String,
    pub arn: String,
    pub capacity_providers: Vec<String>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterInput {
    pub name: String,
    #[serde(default)]
    pub capacity_providers: Vec<String>,
}

// ── Task definition ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    Host,
    Bridge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A host port bound by a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostPort {
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    /// `None` in host mode means "same as the container port"; in bridge
    /// mode it means an ephemeral port chosen by the runtime.
    pub host_port: Option<u16>,
    pub protocol: Protocol,
}

impl PortMapping {
    /// The host port this mapping reserves exclusively, if any.
    pub fn reserved_host_port(&self, mode: NetworkMode) -> Option<HostPort> {
        let port = match mode {
            NetworkMode::Host => Some(self.host_port.unwrap_or(self.container_port)),
            NetworkMode::Bridge => self.host_port.filter(|p| *p != 0),
        };
        port.map(|port| HostPort {
            port,
            protocol: self.protocol,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// Health check contract, passed through to the probe verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub command: Vec<String>,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub retries: u32,
    pub start_period_secs: u64,
}

impl HealthCheckSpec {
    /// `["NONE"]` turns the check off.
    pub fn is_disabled(&self) -> bool {
        matches!(self.command.as_slice(), [kind] if kind == "NONE")
    }

    pub fn validate(&self) -> Result<(), String> {
        let command_ok = match self.command.as_slice() {
            [kind] => kind == "NONE",
            [kind, script] if kind == "CMD-SHELL" => !script.trim().is_empty(),
            [kind, args @ ..] => kind == "CMD" && !args.is_empty(),
            [] => false,
        };
        if !command_ok {
            return Err(format!(
                "health check command {:?}: expected [\"CMD-SHELL\", <script>], [\"CMD\", <args>..] or [\"NONE\"]",
                self.command
            ));
        }
        if self.is_disabled() {
            return Ok(());
        }
        if !(5..=300).contains(&self.interval_secs) {
            return Err(format!(
                "health check interval must be 5-300 seconds (got {})",
                self.interval_secs
            ));
        }
        if !(2..=60).contains(&self.timeout_secs) || self.timeout_secs >= self.interval_secs {
            return Err(format!(
                "health check timeout must be 2-60 seconds and shorter than the interval (got {})",
                self.timeout_secs
            ));
        }
        if !(1..=10).contains(&self.retries) {
            return Err(format!("health check retries must be 1-10 (got {})", self.retries));
        }
        if self.start_period_secs > 300 {
            return Err(format!(
                "health check start period must be 0-300 seconds (got {})",
                self.start_period_secs
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    /// Hard memory limit (MiB).
    pub memory: Option<u64>,
    /// Soft memory reservation (MiB).
    pub memory_reservation: Option<u64>,
    #[serde(default)]
    pub cpu: u32,
    #[serde(default)]
    pub environment: Vec<EnvVar>,
    #[serde(default = "default_true")]
    pub essential: bool,
    pub health_check: Option<HealthCheckSpec>,
}

fn default_true() -> bool {
    true
}

impl ContainerDefinition {
    /// Memory this container reserves on its host.
    pub fn reserved_memory(&self) -> u64 {
        self.memory_reservation.or(self.memory).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinitionInput {
    pub family: String,
    pub network_mode: NetworkMode,
    pub containers: Vec<ContainerDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub family: String,
    pub revision: u32,
    pub arn: String,
    pub network_mode: NetworkMode,
    pub containers: Vec<ContainerDefinition>,
    /// SHA-256 of the canonical JSON of the registration input.
    pub fingerprint: String,
    pub registered_at: u64,
}

impl TaskDefinition {
    pub fn table_key(&self) -> String {
        task_definition_key(&self.family, self.revision)
    }

    /// The `family:revision` reference services point at.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.family, self.revision)
    }

    /// Host resources one task of this definition holds.
    pub fn reservation(&self) -> TaskReservation {
        let mut host_ports: Vec<HostPort> = self
            .containers
            .iter()
            .flat_map(|c| c.port_mappings.iter())
            .filter_map(|m| m.reserved_host_port(self.network_mode))
            .collect();
        host_ports.sort();
        host_ports.dedup();
        TaskReservation {
            memory_mib: self.containers.iter().map(|c| c.reserved_memory()).sum(),
            cpu_units: self.containers.iter().map(|c| c.cpu).sum(),
            host_ports,
        }
    }

    /// Health check of the first essential container that declares one.
    pub fn health_check(&self) -> Option<&HealthCheckSpec> {
        self.containers
            .iter()
            .filter(|c| c.essential)
            .find_map(|c| c.health_check.as_ref())
    }
}

pub fn task_definition_key(family: &str, revision: u32) -> String {
    format!("{family}:{revision:010}")
}

/// Split a `family:revision` reference.
pub fn parse_task_definition_ref(reference: &str) -> Option<(&str, u32)> {
    let (family, revision) = reference.rsplit_once(':')?;
    let revision = revision.parse().ok()?;
    (!family.is_empty() && revision > 0).then_some((family, revision))
}

// ── Service ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinpackResource {
    Memory,
    Cpu,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlacementStrategy {
    /// `field` is `instanceId` or `attribute:<name>`.
    Spread { field: String },
    Binpack { field: BinpackResource },
    Random,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlacementConstraint {
    DistinctInstance,
    MemberOf { attribute: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityProviderStrategyItem {
    pub capacity_provider: String,
    #[serde(default)]
    pub base: u32,
    #[serde(default)]
    pub weight: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub enable: bool,
    pub rollback: bool,
}

/// Rollout bounds: how far below and above `desired_count` a deployment
/// may take the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfiguration {
    pub minimum_healthy_percent: u32,
    pub maximum_percent: u32,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreaker>,
}

impl Default for DeploymentConfiguration {
    fn default() -> Self {
        Self {
            minimum_healthy_percent: 0,
            maximum_percent: 100,
            circuit_breaker: None,
        }
    }
}

impl DeploymentConfiguration {
    pub fn validate(&self) -> Result<(), String> {
        if self.maximum_percent < 100 {
            return Err(format!(
                "maximum_percent must be at least 100 (got {})",
                self.maximum_percent
            ));
        }
        if self.minimum_healthy_percent > 100 {
            return Err(format!(
                "minimum_healthy_percent must be at most 100 (got {})",
                self.minimum_healthy_percent
            ));
        }
        if self.minimum_healthy_percent >= self.maximum_percent {
            return Err(format!(
                "minimum_healthy_percent ({}) must be below maximum_percent ({})",
                self.minimum_healthy_percent, self.maximum_percent
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Active,
    /// Deleted; removed once its last task stops.
    Draining,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInput {
    pub cluster: String,
    pub name: String,
    pub task_definition: String,
    pub desired_count: u32,
    #[serde(default)]
    pub placement_strategy: Vec<PlacementStrategy>,
    #[serde(default)]
    pub placement_constraints: Vec<PlacementConstraint>,
    #[serde(default)]
    pub capacity_provider_strategy: Vec<CapacityProviderStrategyItem>,
    #[serde(default)]
    pub deployment_configuration: DeploymentConfiguration,
}

/// One immutable version of a service declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub cluster: String,
    pub name: String,
    pub arn: String,
    pub version: u64,
    pub task_definition: String,
    pub desired_count: u32,
    pub placement_strategy: Vec<PlacementStrategy>,
    pub placement_constraints: Vec<PlacementConstraint>,
    pub capacity_provider_strategy: Vec<CapacityProviderStrategyItem>,
    pub deployment_configuration: DeploymentConfiguration,
    pub status: ServiceStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ServiceSpec {
    pub fn table_key(&self) -> String {
        service_key(&self.cluster, &self.name)
    }

    pub fn version_key(&self) -> String {
        versioned_key(&self.cluster, &self.name, self.version)
    }

    /// Whether `input` declares exactly what this version already holds.
    pub fn matches(&self, input: &ServiceInput) -> bool {
        self.status == ServiceStatus::Active
            && self.task_definition == input.task_definition
            && self.desired_count == input.desired_count
            && self.placement_strategy == input.placement_strategy
            && self.placement_constraints == input.placement_constraints
            && self.capacity_provider_strategy == input.capacity_provider_strategy
            && self.deployment_configuration == input.deployment_configuration
    }

    pub fn to_input(&self) -> ServiceInput {
        ServiceInput {
            cluster: self.cluster.clone(),
            name: self.name.clone(),
            task_definition: self.task_definition.clone(),
            desired_count: self.desired_count,
            placement_strategy: self.placement_strategy.clone(),
            placement_constraints: self.placement_constraints.clone(),
            capacity_provider_strategy: self.capacity_provider_strategy.clone(),
            deployment_configuration: self.deployment_configuration,
        }
    }
}

pub fn service_key(cluster: &str, service: &str) -> String {
    format!("{cluster}/{service}")
}

pub fn versioned_key(cluster: &str, service: &str, version: u64) -> String {
    format!("{cluster}/{service}@{version:020}")
}

// ── Task ───────────────────────────────────────────────────────────

/// Lifecycle state of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
    Stopped,
}

impl TaskState {
    fn rank(self) -> u8 {
        match self {
            TaskState::Pending => 0,
            TaskState::Starting => 1,
            TaskState::Healthy | TaskState::Unhealthy => 2,
            TaskState::Stopping => 3,
            TaskState::Stopped => 4,
        }
    }

    /// Forward-only transitions; health may flip between HEALTHY and
    /// UNHEALTHY while the task runs.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        next.rank() > self.rank() || (self.rank() == 2 && next.rank() == 2 && self != next)
    }

    pub fn is_live(self) -> bool {
        self != TaskState::Stopped
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Starting => "STARTING",
            TaskState::Healthy => "HEALTHY",
            TaskState::Unhealthy => "UNHEALTHY",
            TaskState::Stopping => "STOPPING",
            TaskState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredStatus {
    Running,
    Stopped,
}

/// Host resources held by a task until it reaches STOPPED.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReservation {
    pub memory_mib: u64,
    pub cpu_units: u32,
    pub host_ports: Vec<HostPort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: TaskId,
    pub cluster: String,
    pub service: String,
    pub service_version: u64,
    pub task_definition: String,
    pub host_id: Option<HostId>,
    pub capacity_provider: Option<String>,
    pub reservation: TaskReservation,
    pub state: TaskState,
    pub health: HealthStatus,
    pub desired_status: DesiredStatus,
    pub stopped_reason: Option<String>,
    /// Set once the task has passed a health check.
    #[serde(default)]
    pub ever_healthy: bool,
    /// When the container started running (start-period anchor).
    pub started_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl TaskInstance {
    pub fn table_key(&self) -> String {
        task_key(&self.cluster, &self.service, &self.id)
    }

    pub fn arn(&self) -> String {
        berth_core::Arn::task(&self.cluster, &self.id).to_string()
    }

    /// Whether the task went unhealthy or exited on its own before it was
    /// ever healthy. Counted by the deployment circuit breaker.
    pub fn failed_before_healthy(&self) -> bool {
        !self.ever_healthy
            && (self.health == HealthStatus::Unhealthy
                || (self.state == TaskState::Stopped
                    && self.desired_status == DesiredStatus::Running))
    }
}

pub fn task_key(cluster: &str, service: &str, task_id: &str) -> String {
    format!("{cluster}/{service}:{task_id}")
}

// ── Host ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Active,
    Draining,
    Inactive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapacity {
    pub memory_mib: u64,
    pub cpu_units: u32,
}

/// A registered container host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostNode {
    pub id: HostId,
    pub cluster: String,
    pub address: String,
    pub capacity: HostCapacity,
    /// Always contains `instance-id`.
    pub attributes: BTreeMap<String, String>,
    pub capacity_provider: Option<String>,
    pub status: HostStatus,
    pub registered_at: u64,
    pub last_heartbeat: u64,
}

impl HostNode {
    pub fn instance_id(&self) -> &str {
        self.attributes
            .get("instance-id")
            .map(String::as_str)
            .unwrap_or(&self.id)
    }
}

// ── Deployment ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Primary,
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    InProgress,
    Completed,
    Failed,
}

/// Rollout record of one service version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub cluster: String,
    pub service: String,
    pub version: u64,
    pub task_definition: String,
    pub desired_count: u32,
    pub status: DeploymentStatus,
    pub rollout_state: RolloutState,
    pub failed_tasks: u32,
    /// Steady-state event already emitted for this deployment.
    #[serde(default)]
    pub steady_announced: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Deployment {
    pub fn table_key(&self) -> String {
        versioned_key(&self.cluster, &self.service, self.version)
    }
}

// ── Events & commands ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub cluster: String,
    pub service: String,
    pub sequence: u64,
    pub message: String,
    pub created_at: u64,
}

/// Work queued for a host, drained on its next heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostCommand {
    Start {
        task: TaskInstance,
        task_definition: TaskDefinition,
    },
    Stop {
        task_id: TaskId,
        reason: String,
    },
}

impl HostCommand {
    pub fn task_id(&self) -> &str {
        match self {
            HostCommand::Start { task, .. } => &task.id,
            HostCommand::Stop { task_id, .. } => task_id,
        }
    }
}

// ── Stack ──────────────────────────────────────────────────────────

/// A service declaration without its cluster and task definition, which
/// a stack supplies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDeclaration {
    pub name: String,
    pub desired_count: u32,
    #[serde(default)]
    pub placement_strategy: Vec<PlacementStrategy>,
    #[serde(default)]
    pub placement_constraints: Vec<PlacementConstraint>,
    #[serde(default)]
    pub capacity_provider_strategy: Vec<CapacityProviderStrategyItem>,
    #[serde(default)]
    pub deployment_configuration: DeploymentConfiguration,
}

impl ServiceDeclaration {
    pub fn into_input(self, cluster: &str, task_definition: &str) -> ServiceInput {
        ServiceInput {
            cluster: cluster.to_string(),
            name: self.name,
            task_definition: task_definition.to_string(),
            desired_count: self.desired_count,
            placement_strategy: self.placement_strategy,
            placement_constraints: self.placement_constraints,
            capacity_provider_strategy: self.capacity_provider_strategy,
            deployment_configuration: self.deployment_configuration,
        }
    }
}

/// Cluster, task definition and service declared together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDeclaration {
    pub cluster: ClusterInput,
    pub task_definition: TaskDefinitionInput,
    pub service: ServiceDeclaration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackOutputs {
    pub cluster_arn: String,
    pub task_definition_arn: String,
    pub service_arn: String,
    pub service_version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(port: u16) -> ContainerDefinition {
        ContainerDefinition {
            name: "web".to_string(),
            image: "nginx".to_string(),
            port_mappings: vec![PortMapping {
                container_port: port,
                host_port: None,
                protocol: Protocol::Tcp,
            }],
            memory: Some(512),
            memory_reservation: Some(256),
            cpu: 128,
            environment: vec![],
            essential: true,
            health_check: None,
        }
    }

    #[test]
    fn task_state_moves_forward_only() {
        assert!(TaskState::Pending.can_transition_to(TaskState::Starting));
        assert!(TaskState::Starting.can_transition_to(TaskState::Healthy));
        assert!(TaskState::Healthy.can_transition_to(TaskState::Unhealthy));
        assert!(TaskState::Unhealthy.can_transition_to(TaskState::Healthy));
        assert!(TaskState::Healthy.can_transition_to(TaskState::Stopped));
        assert!(!TaskState::Stopped.can_transition_to(TaskState::Starting));
        assert!(!TaskState::Stopping.can_transition_to(TaskState::Healthy));
        assert!(!TaskState::Healthy.can_transition_to(TaskState::Healthy));
    }

    #[test]
    fn task_state_serializes_screaming() {
        let json = serde_json::to_string(&TaskState::Healthy).unwrap();
        assert_eq!(json, "\"HEALTHY\"");
        assert_eq!(TaskState::Stopping.to_string(), "STOPPING");
    }

    #[test]
    fn host_mode_reserves_container_port() {
        let def = TaskDefinition {
            family: "web".to_string(),
            revision: 1,
            arn: String::new(),
            network_mode: NetworkMode::Host,
            containers: vec![container(80), container(443)],
            fingerprint: String::new(),
            registered_at: 0,
        };
        let reservation = def.reservation();
        assert_eq!(reservation.memory_mib, 512);
        assert_eq!(reservation.cpu_units, 256);
        assert_eq!(
            reservation.host_ports,
            vec![
                HostPort { port: 80, protocol: Protocol::Tcp },
                HostPort { port: 443, protocol: Protocol::Tcp },
            ]
        );
    }

    #[test]
    fn bridge_mode_without_host_port_reserves_nothing() {
        let mapping = PortMapping {
            container_port: 80,
            host_port: None,
            protocol: Protocol::Tcp,
        };
        assert_eq!(mapping.reserved_host_port(NetworkMode::Bridge), None);
        assert!(mapping.reserved_host_port(NetworkMode::Host).is_some());
    }

    #[test]
    fn memory_reservation_falls_back_to_limit() {
        let mut c = container(80);
        c.memory_reservation = None;
        assert_eq!(c.reserved_memory(), 512);
    }

    #[test]
    fn task_definition_refs() {
        assert_eq!(parse_task_definition_ref("nginx-task:3"), Some(("nginx-task", 3)));
        assert_eq!(parse_task_definition_ref("nginx-task"), None);
        assert_eq!(parse_task_definition_ref("nginx-task:0"), None);
        assert_eq!(task_definition_key("web", 7), "web:0000000007");
    }

    #[test]
    fn deployment_configuration_bounds() {
        assert!(DeploymentConfiguration::default().validate().is_ok());
        let bad = DeploymentConfiguration {
            minimum_healthy_percent: 100,
            maximum_percent: 100,
            circuit_breaker: None,
        };
        assert!(bad.validate().is_err());
        let low_max = DeploymentConfiguration {
            minimum_healthy_percent: 0,
            maximum_percent: 90,
            circuit_breaker: None,
        };
        assert!(low_max.validate().is_err());
    }

    #[test]
    fn host_command_tagged_json() {
        let cmd = HostCommand::Stop {
            task_id: "t1".to_string(),
            reason: "scale in".to_string(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "stop");
        assert_eq!(json["task_id"], "t1");
    }
}
